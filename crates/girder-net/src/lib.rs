//! Deadline-driven, non-blocking TCP transport for the girder runtime.

pub mod addr;
pub mod error;
pub mod poll;
pub mod socket;

// Re-export commonly used types
pub use addr::{Family, Host, TcpAddrInfo};
pub use error::NetError;
pub use socket::{TcpSocket, connect_to, listen_on};
