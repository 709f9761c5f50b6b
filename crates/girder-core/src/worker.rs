//! Worker threads controlled through requesters.
//!
//! A [`Worker`] couples an OS thread with the owner half of a requester
//! channel. Subsystems keep their workers in a [`WorkerSet`], which enforces
//! unique registration and implements the two-phase stop protocol: first a
//! termination request goes out to every worker, then each response is
//! awaited and the thread joined.

use std::collections::HashSet;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error};

use crate::clock::Deadline;
use crate::error::{Error, Result};
use crate::requester::{self, Attendant, Requester, ThreadResponse};

/// Default request-queue depth for a worker's requester.
pub const DEFAULT_REQUEST_QUEUE_CAPACITY: usize = 16;

/// An owner-side handle to a spawned worker thread.
pub struct Worker<M> {
    name: String,
    requester: Requester<M>,
    join: Option<JoinHandle<()>>,
}

impl<M: Send + 'static> Worker<M> {
    /// Spawn a named worker thread running `body` with the attendant half of
    /// a fresh requester channel.
    pub fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce(Attendant<M>) + Send + 'static,
    {
        let (requester, attendant) = requester::channel(DEFAULT_REQUEST_QUEUE_CAPACITY);
        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(attendant))
            .map_err(|e| Error::Spawn(name.to_string(), e))?;
        debug!(worker = name, "worker thread started");
        Ok(Worker {
            name: name.to_string(),
            requester,
            join: Some(join),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn requester(&mut self) -> &mut Requester<M> {
        &mut self.requester
    }

    /// Request termination, await the acknowledgement, join the thread.
    ///
    /// A worker that does not acknowledge within `await_response_timeout` is
    /// still joined; the join then relies on the worker honouring its
    /// termination flag at the next loop boundary.
    pub fn stop(&mut self, await_response_timeout: Duration) {
        let Some(join) = self.join.take() else {
            return;
        };
        match self.requester.send_terminate(true) {
            Some(id) => {
                let deadline = Deadline::after(await_response_timeout);
                match self.requester.await_response(id, deadline) {
                    Some(ThreadResponse::Ok) => {
                        debug!(worker = %self.name, "termination acknowledged");
                    }
                    Some(other) => {
                        error!(
                            worker = %self.name,
                            response = other.name(),
                            "unexpected response to a termination request"
                        );
                    }
                    None => {
                        error!(
                            worker = %self.name,
                            "no response to the termination request, joining anyway"
                        );
                    }
                }
            }
            None => {
                error!(worker = %self.name, "could not enqueue a termination request");
            }
        }
        if join.join().is_err() {
            error!(worker = %self.name, "worker thread panicked");
        } else {
            debug!(worker = %self.name, "worker thread joined");
        }
    }
}

/// The set of workers a subsystem owns, keyed by unique name.
pub struct WorkerSet<M> {
    workers: Vec<Worker<M>>,
    names: HashSet<String>,
}

impl<M: Send + 'static> WorkerSet<M> {
    pub fn new() -> Self {
        WorkerSet {
            workers: Vec::new(),
            names: HashSet::new(),
        }
    }

    /// Register a worker. Registering the same name twice is a configuration
    /// error.
    pub fn register(&mut self, worker: Worker<M>) -> Result<()> {
        if !self.names.insert(worker.name().to_string()) {
            return Err(Error::DuplicateWorker(worker.name().to_string()));
        }
        self.workers.push(worker);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Worker<M>> {
        self.workers.iter_mut()
    }

    /// Stop every worker: send all termination requests first, then await
    /// each acknowledgement and join.
    pub fn stop_all(&mut self, await_response_timeout: Duration) {
        let mut request_ids = Vec::with_capacity(self.workers.len());
        for worker in &mut self.workers {
            let id = worker.requester.send_terminate(true);
            if id.is_none() {
                error!(worker = %worker.name, "could not enqueue a termination request");
            }
            request_ids.push(id);
        }
        let deadline = Deadline::after(await_response_timeout);
        for (worker, id) in self.workers.iter_mut().zip(request_ids) {
            if let Some(id) = id {
                match worker.requester.await_response(id, deadline) {
                    Some(ThreadResponse::Ok) => {}
                    Some(other) => error!(
                        worker = %worker.name,
                        response = other.name(),
                        "unexpected response to a termination request"
                    ),
                    None => error!(
                        worker = %worker.name,
                        "no response to the termination request, joining anyway"
                    ),
                }
            }
            if let Some(join) = worker.join.take() {
                if join.join().is_err() {
                    error!(worker = %worker.name, "worker thread panicked");
                }
            }
        }
        self.workers.clear();
        self.names.clear();
    }
}

impl<M: Send + 'static> Default for WorkerSet<M> {
    fn default() -> Self {
        WorkerSet::new()
    }
}
