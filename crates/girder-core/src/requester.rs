//! Typed inter-thread request/response channels.
//!
//! Every controllable worker thread is paired with a requester: the owning
//! side submits requests (optionally demanding a response) and the worker
//! drains them between ticks. Responses are matched by request id, not by
//! arrival order. A built-in [`ThreadRequest::Terminate`] variant is
//! understood by every worker: on receipt it flips the worker's termination
//! flag and, when asked to, replies [`ThreadResponse::Ok`].

use std::collections::{HashSet, VecDeque};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use tracing::debug;

use crate::clock::Deadline;

pub type RequestId = u64;

/// A request travelling towards a worker thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadRequest<M> {
    /// Ask the worker to leave its loop at the next check.
    Terminate,
    /// A subsystem-specific message.
    User(M),
}

impl<M> ThreadRequest<M> {
    pub fn name(&self) -> &'static str {
        match self {
            ThreadRequest::Terminate => "termination request",
            ThreadRequest::User(_) => "user request",
        }
    }
}

/// A response travelling back to the requesting side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadResponse<M> {
    /// Acknowledgement without payload.
    Ok,
    /// A subsystem-specific message.
    User(M),
}

impl<M> ThreadResponse<M> {
    pub fn name(&self) -> &'static str {
        match self {
            ThreadResponse::Ok => "ok response",
            ThreadResponse::User(_) => "user response",
        }
    }
}

#[derive(Debug)]
pub struct PendingRequest<M> {
    pub id: RequestId,
    pub message: ThreadRequest<M>,
    pub response_required: bool,
}

#[derive(Debug)]
struct PendingResponse<M> {
    id: RequestId,
    message: ThreadResponse<M>,
}

/// Create a requester pair with the given request-queue capacity.
///
/// The [`Requester`] half stays with the owner; the [`Attendant`] half moves
/// into the worker thread.
pub fn channel<M>(capacity: usize) -> (Requester<M>, Attendant<M>) {
    let (req_tx, req_rx) = bounded(capacity);
    let (resp_tx, resp_rx) = bounded(capacity);
    let requester = Requester {
        req_tx,
        resp_rx,
        next_id: 1,
        buffered: VecDeque::new(),
        abandoned: HashSet::new(),
    };
    let attendant = Attendant {
        req_rx,
        resp_tx,
        should_terminate: false,
    };
    (requester, attendant)
}

/// Owner-side handle: submits requests, awaits responses.
pub struct Requester<M> {
    req_tx: Sender<PendingRequest<M>>,
    resp_rx: Receiver<PendingResponse<M>>,
    next_id: RequestId,
    buffered: VecDeque<PendingResponse<M>>,
    abandoned: HashSet<RequestId>,
}

impl<M> Requester<M> {
    /// Enqueue a user request. Returns the new id, or `None` when the queue
    /// is full.
    pub fn send_request(&mut self, message: M, response_required: bool) -> Option<RequestId> {
        self.push(ThreadRequest::User(message), response_required)
    }

    /// Enqueue the built-in termination request.
    pub fn send_terminate(&mut self, response_required: bool) -> Option<RequestId> {
        self.push(ThreadRequest::Terminate, response_required)
    }

    fn push(&mut self, message: ThreadRequest<M>, response_required: bool) -> Option<RequestId> {
        let id = self.next_id;
        let pending = PendingRequest {
            id,
            message,
            response_required,
        };
        match self.req_tx.try_send(pending) {
            Ok(()) => {
                self.next_id += 1;
                Some(id)
            }
            Err(_) => None,
        }
    }

    /// Await the response to `id` until `deadline`.
    ///
    /// Responses to other ids observed meanwhile are buffered in arrival
    /// order; responses to ids this side has already given up on are
    /// discarded. On timeout the id is recorded as abandoned.
    pub fn await_response(
        &mut self,
        id: RequestId,
        deadline: Deadline,
    ) -> Option<ThreadResponse<M>> {
        if let Some(pos) = self.buffered.iter().position(|r| r.id == id) {
            return self.buffered.remove(pos).map(|r| r.message);
        }
        loop {
            match self.resp_rx.recv_deadline(deadline.instant()) {
                Ok(response) => {
                    if response.id == id {
                        return Some(response.message);
                    }
                    if self.abandoned.remove(&response.id) {
                        debug!(
                            id = response.id,
                            "discarding response to an abandoned request"
                        );
                        continue;
                    }
                    self.buffered.push_back(response);
                }
                Err(_) => {
                    self.abandoned.insert(id);
                    return None;
                }
            }
        }
    }
}

/// Worker-side handle: drains requests, sends responses.
///
/// `fetch_request` and `await_request` absorb [`ThreadRequest::Terminate`]
/// on the way through: the termination flag is set and, when the sender asked
/// for one, an [`ThreadResponse::Ok`] goes back immediately. The request is
/// still returned so loops can observe and log it.
pub struct Attendant<M> {
    req_rx: Receiver<PendingRequest<M>>,
    resp_tx: Sender<PendingResponse<M>>,
    should_terminate: bool,
}

impl<M> Attendant<M> {
    /// Non-blocking fetch of the next pending request.
    ///
    /// A disconnected channel means the owning side is gone and nothing can
    /// ever ask this worker to stop politely; it counts as termination.
    pub fn fetch_request(&mut self) -> Option<PendingRequest<M>> {
        match self.req_rx.try_recv() {
            Ok(request) => Some(self.absorb(request)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.should_terminate = true;
                None
            }
        }
    }

    /// Await the next pending request until `deadline`.
    pub fn await_request(&mut self, deadline: Deadline) -> Option<PendingRequest<M>> {
        match self.req_rx.recv_deadline(deadline.instant()) {
            Ok(request) => Some(self.absorb(request)),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.should_terminate = true;
                None
            }
        }
    }

    /// Reply to a fetched request. At most one response per request id.
    pub fn send_response(&self, id: RequestId, message: ThreadResponse<M>) {
        // A requester that timed out may have dropped its receiver; the
        // failed send is the documented cancellation path.
        let _ = self.resp_tx.try_send(PendingResponse { id, message });
    }

    /// True once a termination request has been observed.
    pub fn should_terminate(&self) -> bool {
        self.should_terminate
    }

    fn absorb(&mut self, request: PendingRequest<M>) -> PendingRequest<M> {
        if let ThreadRequest::Terminate = request.message {
            debug!("termination request observed, raising the terminate flag");
            self.should_terminate = true;
            if request.response_required {
                self.send_response(request.id, ThreadResponse::Ok);
            }
        }
        request
    }
}
