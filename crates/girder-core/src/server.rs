//! Signal-driven server supervisor.
//!
//! The server owns the root of the subsystem tree and runs the process's main
//! loop: block the tracked signals, start the tree, then alternate between
//! `sigtimedwait` and the command queue until asked to stop. SIGHUP restarts
//! the tree; SIGINT and SIGTERM end the loop. `run` must be called from the
//! initial thread so every thread spawned afterwards inherits the mask.

use std::io;
use std::ptr;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, error, info, warn};

use crate::clock::{DEFAULT_CLOCK_TIMEOUT, timespec_from};
use crate::error::{Error, Result};
use crate::signal::SignalSet;
use crate::subsystem::{Children, Subsystem};

/// A command posted to the server from outside its main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCommand {
    Restart,
    Terminate,
}

/// Cloneable handle for posting commands into a running server loop.
#[derive(Clone)]
pub struct ServerHandle {
    commands: Sender<ServerCommand>,
}

impl ServerHandle {
    pub fn appoint_restart(&self) {
        let _ = self.commands.send(ServerCommand::Restart);
    }

    pub fn appoint_termination(&self) {
        let _ = self.commands.send(ServerCommand::Terminate);
    }
}

/// The root of the subsystem tree plus the signal-driven main loop.
pub struct Server {
    argv: Vec<String>,
    track_signals: SignalSet,
    clock_timeout: Duration,
    children: Children,
    commands_tx: Sender<ServerCommand>,
    commands_rx: Receiver<ServerCommand>,
}

impl Server {
    pub fn new(argv: Vec<String>) -> Self {
        let (commands_tx, commands_rx) = unbounded();
        Server {
            argv,
            track_signals: SignalSet::default(),
            clock_timeout: DEFAULT_CLOCK_TIMEOUT,
            children: Children::new(),
            commands_tx,
            commands_rx,
        }
    }

    /// Track a different signal set. Only legal before `run`.
    pub fn set_track_signals(&mut self, track_signals: SignalSet) {
        self.track_signals = track_signals;
    }

    pub fn set_clock_timeout(&mut self, clock_timeout: Duration) {
        self.clock_timeout = clock_timeout;
    }

    /// The command-line arguments this server was constructed with, unparsed.
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn add_child(&mut self, child: Box<dyn Subsystem>) {
        self.children.push(child);
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            commands: self.commands_tx.clone(),
        }
    }

    /// Run the main loop until termination. Call from the initial thread.
    pub fn run(&mut self) -> Result<()> {
        debug!(signals = ?self.track_signals.signals(), "blocking tracked signals");
        let previous_mask = block_signals(&self.track_signals).map_err(Error::SignalMask)?;

        info!("starting server");
        if let Err(e) = self.children.start_all() {
            let _ = restore_mask(&previous_mask);
            return Err(e);
        }
        info!("server started");

        let outcome = self.main_loop();

        info!("stopping server");
        self.children.stop_all();
        info!("server stopped");

        restore_mask(&previous_mask).map_err(Error::SignalMask)?;
        debug!("previous signal mask restored");
        outcome
    }

    fn main_loop(&mut self) -> Result<()> {
        loop {
            match sig_timed_wait(&self.track_signals, self.clock_timeout) {
                Ok(Some(signo)) => {
                    if !self.on_signal(signo)? {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!("fetching a pending signal failed: {e}");
                    return Err(Error::SignalWait(e));
                }
            }
            // Zero-timeout drain of the command queue.
            let mut terminate = false;
            while let Ok(command) = self.commands_rx.try_recv() {
                match command {
                    ServerCommand::Restart => {
                        info!("restart command received, restarting server");
                        self.restart()?;
                    }
                    ServerCommand::Terminate => {
                        info!("terminate command received, leaving the main loop");
                        terminate = true;
                    }
                }
            }
            if terminate {
                break;
            }
        }
        Ok(())
    }

    /// React to a tracked signal. Returns `false` to leave the main loop.
    fn on_signal(&mut self, signo: i32) -> Result<bool> {
        match signo {
            libc::SIGHUP => {
                info!(signo, "SIGHUP received, restarting server");
                self.restart()?;
                Ok(true)
            }
            libc::SIGINT | libc::SIGTERM => {
                info!(signo, "termination signal received");
                Ok(false)
            }
            _ => {
                warn!(signo, "tracked signal with no defined action, ignoring");
                Ok(true)
            }
        }
    }

    fn restart(&mut self) -> Result<()> {
        self.children.stop_all();
        debug!("server stopped for restart");
        self.children.start_all()?;
        debug!("server restarted");
        Ok(())
    }
}

/// Add `set` to this thread's blocked mask, returning the previous mask.
fn block_signals(set: &SignalSet) -> io::Result<libc::sigset_t> {
    // SAFETY: both sigset_t values are valid; pthread_sigmask only reads the
    // new set and writes the old one.
    unsafe {
        let mut previous = std::mem::zeroed::<libc::sigset_t>();
        let raw = set.raw();
        if libc::pthread_sigmask(libc::SIG_BLOCK, &raw, &mut previous) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(previous)
    }
}

fn restore_mask(previous: &libc::sigset_t) -> io::Result<()> {
    // SAFETY: previous came from pthread_sigmask above.
    unsafe {
        if libc::pthread_sigmask(libc::SIG_SETMASK, previous, ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Wait up to `timeout` for one of `set`'s signals to become pending.
///
/// Returns `Ok(None)` when the timeout expired or the wait was interrupted.
fn sig_timed_wait(set: &SignalSet, timeout: Duration) -> io::Result<Option<i32>> {
    let ts = timespec_from(timeout);
    let raw = set.raw();
    // SAFETY: raw and ts are valid for the duration of the call; the siginfo
    // output is not needed.
    let signo = unsafe { libc::sigtimedwait(&raw, ptr::null_mut(), &ts) };
    if signo > 0 {
        return Ok(Some(signo));
    }
    match io::Error::last_os_error().raw_os_error() {
        Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(None),
        _ => Err(io::Error::last_os_error()),
    }
}
