//! The canonical worker-thread tick loop.
//!
//! Each iteration computes the next tick boundary from the previous one, so a
//! loop that falls behind does not drift: it reports how many boundaries
//! expired and catches up in one step. Between boundaries the thread does its
//! work and then sleeps in its requester, which keeps shutdown latency within
//! one clock timeout.

use std::time::{Duration, Instant};

use crate::clock::Deadline;
use crate::requester::{Attendant, PendingRequest};

/// One computed tick boundary.
#[derive(Debug, Clone, Copy)]
pub struct Tick {
    /// The boundary before this one.
    pub prev: Instant,
    /// The boundary to wait for; also the deadline for this iteration's work.
    pub deadline: Deadline,
    /// How many boundaries lay in the past when this tick was computed.
    /// Anything above one is an overload.
    pub ticks_expired: usize,
}

/// Tick arithmetic for a worker loop.
pub struct TickLoop {
    clock_timeout: Duration,
    prev_tick: Instant,
}

impl TickLoop {
    pub fn new(clock_timeout: Duration) -> Self {
        TickLoop {
            clock_timeout,
            prev_tick: Instant::now(),
        }
    }

    pub fn clock_timeout(&self) -> Duration {
        self.clock_timeout
    }

    /// Compute the next unexpired tick boundary and step the loop onto it.
    pub fn advance(&mut self) -> Tick {
        let now = Instant::now();
        let prev = self.prev_tick;
        let mut next = self.prev_tick;
        let mut ticks_expired = 0;
        while next <= now {
            ticks_expired += 1;
            next += self.clock_timeout;
        }
        self.prev_tick = next;
        Tick {
            prev,
            deadline: Deadline::at(next),
            ticks_expired,
        }
    }
}

/// Hooks for a tick-driven worker thread.
///
/// The runner calls `on_start` once, then per tick: `on_overload` (only when
/// more than one boundary expired), `do_load`, and `on_request` for every
/// user request drained while waiting out the rest of the tick. `on_stop`
/// runs after the loop observes termination.
pub trait TickHandler {
    type Msg: Send + 'static;

    fn on_start(&mut self) {}

    fn on_overload(&mut self, _ticks_expired: usize) {}

    fn do_load(&mut self, _tick: &Tick) {}

    fn on_request(
        &mut self,
        _request: PendingRequest<Self::Msg>,
        _attendant: &mut Attendant<Self::Msg>,
    ) {
    }

    fn on_stop(&mut self) {}
}

/// Drive `handler` in a tick loop until termination is requested.
pub fn run<H: TickHandler>(
    mut handler: H,
    clock_timeout: Duration,
    mut attendant: Attendant<H::Msg>,
) {
    handler.on_start();
    let mut ticks = TickLoop::new(clock_timeout);
    'ticking: loop {
        let tick = ticks.advance();
        if tick.ticks_expired > 1 {
            handler.on_overload(tick.ticks_expired);
        }
        handler.do_load(&tick);
        // Sleep out the tick in the requester so control requests are served
        // promptly.
        while !attendant.should_terminate() {
            match attendant.await_request(tick.deadline) {
                Some(request) => handler.on_request(request, &mut attendant),
                None => break,
            }
        }
        if attendant.should_terminate() {
            break 'ticking;
        }
    }
    handler.on_stop();
}
