//! Monotonic clock primitives: timeouts, deadlines and timespec conversion.
//!
//! Timeouts are plain [`std::time::Duration`] values. Anything that waits takes
//! an absolute [`Deadline`] instead of a timeout: callers convert once at the
//! top of an operation and pass the deadline down the stack, so a slow first
//! step shortens the wait of every following step instead of multiplying it.

use std::ops::Add;
use std::time::{Duration, Instant};

/// Default subsystem clock tick.
pub const DEFAULT_CLOCK_TIMEOUT: Duration = Duration::from_millis(100);

/// Far enough ahead that every realistic wait expires first; used when
/// deadline arithmetic would overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// An absolute point on the monotonic clock by which an operation must finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Deadline(Instant);

impl Deadline {
    /// A deadline that has already expired ("do not wait").
    pub fn expired_now() -> Self {
        Deadline(Instant::now())
    }

    /// The deadline `timeout` from now. Saturates instead of overflowing.
    pub fn after(timeout: Duration) -> Self {
        let now = Instant::now();
        Deadline(now.checked_add(timeout).unwrap_or(now + FAR_FUTURE))
    }

    /// A deadline at an absolute instant.
    pub fn at(instant: Instant) -> Self {
        Deadline(instant)
    }

    /// The wrapped instant, for interop with `recv_deadline` and friends.
    pub fn instant(&self) -> Instant {
        self.0
    }

    /// Time left until the deadline; zero if it has already passed.
    pub fn left(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    /// True once the deadline has passed.
    pub fn has_passed(&self) -> bool {
        Instant::now() >= self.0
    }
}

impl Add<Duration> for Deadline {
    type Output = Deadline;

    fn add(self, rhs: Duration) -> Deadline {
        Deadline(self.0.checked_add(rhs).unwrap_or(self.0 + FAR_FUTURE))
    }
}

impl From<Instant> for Deadline {
    fn from(instant: Instant) -> Self {
        Deadline(instant)
    }
}

/// Convert a duration into a `timespec` for `sigtimedwait`/`ppoll`.
pub fn timespec_from(timeout: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    }
}
