use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("socket is not open")]
    NotOpen,

    #[error("socket is not in the required state: {0}")]
    BadState(&'static str),

    #[error("address resolution for '{0}' failed: {1}")]
    Resolution(String, #[source] std::io::Error),

    #[error("no usable endpoints resolved for '{0}'")]
    NoEndpoints(String),

    #[error("connecting to '{0}' failed: {1}")]
    Connect(String, #[source] std::io::Error),

    #[error("system call failed: {0}")]
    Syscall(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NetError>;
