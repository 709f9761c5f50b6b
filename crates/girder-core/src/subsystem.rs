//! Subsystem lifecycle: the composite tree rooted at the server.
//!
//! Ownership is tree-shaped: a parent owns its children outright, children
//! never point back. `start` propagates children-first so leaves are serving
//! before their parents advertise readiness; `stop` terminates a subsystem's
//! own threads before descending, so nothing submits work into children that
//! are already gone.

use tracing::debug;

use crate::error::Result;

/// A lifecycle-managed component of a server.
///
/// Reconfiguration (adding listeners, registering tasks) is only legal while
/// the subsystem is idle, between `stop` and `start`.
pub trait Subsystem: Send {
    fn name(&self) -> &str;

    /// Start children, then own threads.
    fn start(&mut self) -> Result<()>;

    /// Stop own threads, then children.
    fn stop(&mut self);
}

/// An owned, ordered list of child subsystems.
#[derive(Default)]
pub struct Children {
    children: Vec<Box<dyn Subsystem>>,
}

impl Children {
    pub fn new() -> Self {
        Children {
            children: Vec::new(),
        }
    }

    pub fn push(&mut self, child: Box<dyn Subsystem>) {
        self.children.push(child);
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Start every child in registration order. On failure the already
    /// started children are stopped again before the error propagates.
    pub fn start_all(&mut self) -> Result<()> {
        for index in 0..self.children.len() {
            if let Err(e) = self.children[index].start() {
                for started in self.children[..index].iter_mut().rev() {
                    started.stop();
                }
                return Err(e);
            }
            debug!(subsystem = self.children[index].name(), "subsystem started");
        }
        Ok(())
    }

    /// Stop every child, last started first.
    pub fn stop_all(&mut self) {
        for child in self.children.iter_mut().rev() {
            child.stop();
            debug!(subsystem = child.name(), "subsystem stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::error::Error;

    struct Recorder {
        name: String,
        counter: Arc<AtomicUsize>,
        started_at: Arc<AtomicUsize>,
        stopped_at: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Subsystem for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn start(&mut self) -> Result<()> {
            if self.fail {
                return Err(Error::ListenerNotFound(0));
            }
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            self.started_at.store(n + 1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&mut self) {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            self.stopped_at.store(n + 1, Ordering::SeqCst);
        }
    }

    fn recorder(
        name: &str,
        counter: &Arc<AtomicUsize>,
        fail: bool,
    ) -> (Box<Recorder>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let started_at = Arc::new(AtomicUsize::new(0));
        let stopped_at = Arc::new(AtomicUsize::new(0));
        let sub = Box::new(Recorder {
            name: name.to_string(),
            counter: Arc::clone(counter),
            started_at: Arc::clone(&started_at),
            stopped_at: Arc::clone(&stopped_at),
            fail,
        });
        (sub, started_at, stopped_at)
    }

    #[test]
    fn start_runs_in_order_stop_in_reverse() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (a, a_started, a_stopped) = recorder("a", &counter, false);
        let (b, b_started, b_stopped) = recorder("b", &counter, false);
        let mut children = Children::new();
        children.push(a);
        children.push(b);
        children.start_all().unwrap();
        assert!(a_started.load(Ordering::SeqCst) < b_started.load(Ordering::SeqCst));
        children.stop_all();
        assert!(b_stopped.load(Ordering::SeqCst) < a_stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn failed_start_unwinds_started_children() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (a, a_started, a_stopped) = recorder("a", &counter, false);
        let (bad, _, _) = recorder("bad", &counter, true);
        let mut children = Children::new();
        children.push(a);
        children.push(bad);
        assert!(children.start_all().is_err());
        assert!(a_started.load(Ordering::SeqCst) > 0);
        assert!(a_stopped.load(Ordering::SeqCst) > a_started.load(Ordering::SeqCst));
    }
}
