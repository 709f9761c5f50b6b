//! UNIX signal-set helper.

use std::fmt;

/// An immutable set of POSIX signal numbers plus its kernel representation.
///
/// Built once at configuration time; the raw `sigset_t` is handed to
/// `pthread_sigmask` and `sigtimedwait` by the server main loop.
pub struct SignalSet {
    raw: libc::sigset_t,
    signals: Vec<i32>,
}

impl SignalSet {
    /// An empty signal set.
    pub fn empty() -> Self {
        // SAFETY: sigemptyset initialises the (plain-data) sigset_t it is given.
        let raw = unsafe {
            let mut raw = std::mem::zeroed::<libc::sigset_t>();
            libc::sigemptyset(&mut raw);
            raw
        };
        SignalSet {
            raw,
            signals: Vec::new(),
        }
    }

    /// A set containing exactly `signals`, duplicates ignored.
    pub fn new(signals: &[i32]) -> Self {
        let mut set = SignalSet::empty();
        for &signo in signals {
            // SAFETY: raw is a valid, initialised sigset_t.
            unsafe {
                libc::sigaddset(&mut set.raw, signo);
            }
            if !set.signals.contains(&signo) {
                set.signals.push(signo);
            }
        }
        set
    }

    pub fn contains(&self, signo: i32) -> bool {
        self.signals.contains(&signo)
    }

    /// The member signals in insertion order.
    pub fn signals(&self) -> &[i32] {
        &self.signals
    }

    /// The kernel representation.
    pub fn raw(&self) -> libc::sigset_t {
        self.raw
    }
}

impl Default for SignalSet {
    /// The set the server tracks by default: SIGHUP, SIGINT, SIGTERM.
    fn default() -> Self {
        SignalSet::new(&[libc::SIGHUP, libc::SIGINT, libc::SIGTERM])
    }
}

impl Clone for SignalSet {
    fn clone(&self) -> Self {
        SignalSet::new(&self.signals)
    }
}

impl fmt::Debug for SignalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalSet")
            .field("signals", &self.signals)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_contains_nothing() {
        let set = SignalSet::empty();
        assert!(!set.contains(libc::SIGHUP));
        assert!(set.signals().is_empty());
    }

    #[test]
    fn membership_matches_construction() {
        let set = SignalSet::new(&[libc::SIGUSR1, libc::SIGUSR2]);
        assert!(set.contains(libc::SIGUSR1));
        assert!(set.contains(libc::SIGUSR2));
        assert!(!set.contains(libc::SIGTERM));
    }

    #[test]
    fn duplicates_are_collapsed() {
        let set = SignalSet::new(&[libc::SIGHUP, libc::SIGHUP]);
        assert_eq!(set.signals(), &[libc::SIGHUP]);
    }

    #[test]
    fn default_tracks_hup_int_term() {
        let set = SignalSet::default();
        assert!(set.contains(libc::SIGHUP));
        assert!(set.contains(libc::SIGINT));
        assert!(set.contains(libc::SIGTERM));
        assert_eq!(set.signals().len(), 3);
    }
}
