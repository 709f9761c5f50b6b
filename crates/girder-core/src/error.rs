use thiserror::Error;

/// Configuration and system-call failures surfaced by the runtime kernel.
///
/// Resource-limit conditions (queue overflow, scheduled-task capacity) are
/// deliberately *not* here: they are ordinary return values so callers can
/// react inline.
#[derive(Error, Debug)]
pub enum Error {
    #[error("zero period is not permitted for a periodic task")]
    ZeroPeriod,

    #[error("worker '{0}' is already registered")]
    DuplicateWorker(String),

    #[error("listener {0} not found")]
    ListenerNotFound(u64),

    #[error("spawning thread '{0}' failed: {1}")]
    Spawn(String, #[source] std::io::Error),

    #[error("changing the signal mask failed: {0}")]
    SignalMask(#[source] std::io::Error),

    #[error("waiting for a pending signal failed: {0}")]
    SignalWait(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
