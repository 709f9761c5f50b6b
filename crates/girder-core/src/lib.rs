//! Runtime kernel for long-running, multi-threaded POSIX services.
//!
//! The building blocks here give a server its shape: a subsystem tree with
//! structured start/stop, tick-driven worker threads controlled through typed
//! request/response channels, a bounded task dispatcher, a periodic/one-shot
//! timer, and a signal-driven main loop that supervises the whole tree.

pub mod clock;
pub mod dispatcher;
pub mod error;
pub mod io;
pub mod requester;
pub mod server;
pub mod signal;
pub mod subsystem;
pub mod tick;
pub mod timer;
pub mod worker;

// Re-export commonly used types
pub use clock::{DEFAULT_CLOCK_TIMEOUT, Deadline};
pub use dispatcher::{DispatcherHandle, TaskDispatcher};
pub use error::{Error, Result};
pub use io::IoDevice;
pub use requester::{Attendant, Requester, ThreadRequest, ThreadResponse};
pub use server::{Server, ServerCommand, ServerHandle};
pub use signal::SignalSet;
pub use subsystem::{Children, Subsystem};
pub use timer::{PeriodicTask, ScheduledTask, Timer, TimerHandle};
pub use worker::{Worker, WorkerSet};
