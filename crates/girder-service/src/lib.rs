//! TCP service engines built on the girder runtime kernel: listener threads
//! feeding a bounded dispatcher, synchronously (one worker per connection)
//! or asynchronously (a receive and a send worker per connection).

pub mod r#async;
pub mod listener;
pub mod sync;

// Re-export commonly used types
pub use listener::{DEFAULT_BACKLOG, ListenerConfig, ListenerConfigs};
pub use r#async::{AsyncTask, AsyncTcpService};
pub use sync::{SyncTask, SyncTcpService};
