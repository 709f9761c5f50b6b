//! Bounded task dispatcher: a FIFO job queue drained by a fixed worker pool.
//!
//! Producers see backpressure as a returned task: [`TaskDispatcher::perform`]
//! hands the task back instead of queueing it when the queue has grown past
//! what the waiting workers plus the configured overflow can absorb. The
//! caller decides what an overload means; the dispatcher only reports it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::{debug, error, warn};

use crate::clock::DEFAULT_CLOCK_TIMEOUT;
use crate::error::{Error, Result};
use crate::subsystem::Subsystem;

type SingleExec<T> = Box<dyn FnOnce(Box<T>, &DispatcherHandle<T>) + Send>;
type SharedExec<T> = Box<dyn FnOnce(Arc<T>, &DispatcherHandle<T>) + Send>;

enum Job<T> {
    /// One worker runs the task end-to-end and consumes it.
    Single { task: Box<T>, exec: SingleExec<T> },
    /// One of several workers sharing the task runs one entry point; the task
    /// drops when the last sharer finishes.
    Shared { task: Arc<T>, exec: SharedExec<T> },
}

/// Queue occupancy and worker availability, updated together.
///
/// The accept rule reads and reserves against both values in one critical
/// section; two racing producers must never both pass the check on the same
/// state.
#[derive(Default)]
struct Gauge {
    queued: usize,
    waiting_workers: usize,
}

struct Shared<T> {
    jobs_tx: Sender<Job<T>>,
    jobs_rx: Receiver<Job<T>>,
    gauge: Mutex<Gauge>,
    keep_running: AtomicBool,
    max_overflow: usize,
}

impl<T> Shared<T> {
    fn gauge(&self) -> MutexGuard<'_, Gauge> {
        match self.gauge.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// A cloneable submission handle, also passed to executing tasks so they can
/// dispatch follow-up work.
pub struct DispatcherHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for DispatcherHandle<T> {
    fn clone(&self) -> Self {
        DispatcherHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + Sync + 'static> DispatcherHandle<T> {
    /// Submit a task for single execution. Returns the task back when the
    /// queue would overflow.
    pub fn perform<F>(&self, task: T, exec: F) -> std::result::Result<(), T>
    where
        F: FnOnce(Box<T>, &DispatcherHandle<T>) + Send + 'static,
    {
        if !self.reserve(1) {
            return Err(task);
        }
        let job = Job::Single {
            task: Box::new(task),
            exec: Box::new(exec),
        };
        self.enqueue(job);
        Ok(())
    }

    /// Submit a task for split execution on two workers, typically a receive
    /// half and a send half. Counts as two queue slots.
    pub fn perform_pair<F, G>(&self, task: T, first: F, second: G) -> std::result::Result<(), T>
    where
        F: FnOnce(Arc<T>, &DispatcherHandle<T>) + Send + 'static,
        G: FnOnce(Arc<T>, &DispatcherHandle<T>) + Send + 'static,
    {
        if !self.reserve(2) {
            return Err(task);
        }
        let task = Arc::new(task);
        self.enqueue(Job::Shared {
            task: Arc::clone(&task),
            exec: Box::new(first),
        });
        self.enqueue(Job::Shared {
            task,
            exec: Box::new(second),
        });
        Ok(())
    }

    /// The accept rule: `queued + incoming` must not exceed the workers
    /// currently waiting plus the configured overflow. Check and reservation
    /// happen under one lock so concurrent producers serialise.
    fn reserve(&self, incoming: usize) -> bool {
        let mut gauge = self.shared.gauge();
        if gauge.queued + incoming > gauge.waiting_workers + self.shared.max_overflow {
            warn!(
                queued = gauge.queued,
                waiting = gauge.waiting_workers,
                max_overflow = self.shared.max_overflow,
                incoming,
                "task queue overflow"
            );
            return false;
        }
        gauge.queued += incoming;
        true
    }

    fn enqueue(&self, job: Job<T>) {
        // The channel is unbounded; the accept rule above is the only bound.
        let _ = self.shared.jobs_tx.send(job);
    }
}

/// The dispatcher subsystem: queue plus `worker_count` pool threads.
pub struct TaskDispatcher<T> {
    name: String,
    worker_count: usize,
    clock_timeout: Duration,
    shared: Arc<Shared<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + Sync + 'static> TaskDispatcher<T> {
    pub fn new(name: &str, worker_count: usize, max_overflow: usize) -> Self {
        let (jobs_tx, jobs_rx) = unbounded();
        TaskDispatcher {
            name: name.to_string(),
            worker_count,
            clock_timeout: DEFAULT_CLOCK_TIMEOUT,
            shared: Arc::new(Shared {
                jobs_tx,
                jobs_rx,
                gauge: Mutex::new(Gauge::default()),
                keep_running: AtomicBool::new(false),
                max_overflow,
            }),
            workers: Vec::new(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Change the pool size. Only legal while idle.
    pub fn set_worker_count(&mut self, worker_count: usize) {
        debug_assert!(self.workers.is_empty(), "reconfigure only while idle");
        self.worker_count = worker_count;
    }

    /// Change how often idle workers wake to check for termination. Only
    /// legal while idle.
    pub fn set_clock_timeout(&mut self, clock_timeout: Duration) {
        debug_assert!(self.workers.is_empty(), "reconfigure only while idle");
        self.clock_timeout = clock_timeout;
    }

    pub fn handle(&self) -> DispatcherHandle<T> {
        DispatcherHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn worker_loop(shared: Arc<Shared<T>>, clock_timeout: Duration) {
        let handle = DispatcherHandle {
            shared: Arc::clone(&shared),
        };
        loop {
            if !shared.keep_running.load(Ordering::Acquire) {
                break;
            }
            shared.gauge().waiting_workers += 1;
            let received = shared.jobs_rx.recv_timeout(clock_timeout);
            {
                // Leave the waiting state and release the queue slot in one
                // step, so producers never observe one without the other.
                let mut gauge = shared.gauge();
                gauge.waiting_workers -= 1;
                if received.is_ok() {
                    gauge.queued -= 1;
                }
            }
            let job = match received {
                Ok(job) => job,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            // A panicking task must not take the worker down with it.
            let outcome = catch_unwind(AssertUnwindSafe(|| match job {
                Job::Single { task, exec } => exec(task, &handle),
                Job::Shared { task, exec } => exec(task, &handle),
            }));
            if outcome.is_err() {
                error!("task execution panicked, worker continues");
            }
        }
    }
}

impl<T: Send + Sync + 'static> Subsystem for TaskDispatcher<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<()> {
        self.shared.keep_running.store(true, Ordering::Release);
        for i in 0..self.worker_count {
            let shared = Arc::clone(&self.shared);
            let clock_timeout = self.clock_timeout;
            let thread_name = format!("{}-worker-{i}", self.name);
            let join = std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || Self::worker_loop(shared, clock_timeout))
                .map_err(|e| Error::Spawn(thread_name, e))?;
            self.workers.push(join);
        }
        debug!(
            dispatcher = %self.name,
            workers = self.worker_count,
            "dispatcher started"
        );
        Ok(())
    }

    fn stop(&mut self) {
        self.shared.keep_running.store(false, Ordering::Release);
        for join in self.workers.drain(..) {
            if join.join().is_err() {
                error!(dispatcher = %self.name, "dispatcher worker panicked");
            }
        }
        // Unperformed jobs are dropped with their tasks.
        let mut dropped = 0;
        while self.shared.jobs_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            self.shared.gauge().queued -= dropped;
            warn!(
                dispatcher = %self.name,
                dropped,
                "dropped queued tasks during stop"
            );
        }
        debug!(dispatcher = %self.name, "dispatcher stopped");
    }
}

impl<T> Drop for TaskDispatcher<T> {
    fn drop(&mut self) {
        self.shared.keep_running.store(false, Ordering::Release);
        for join in self.workers.drain(..) {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::mpsc;

    use super::*;

    struct Probe {
        value: u32,
    }

    #[test]
    fn tasks_run_in_fifo_order() {
        let mut dispatcher: TaskDispatcher<Probe> = TaskDispatcher::new("fifo", 1, 8);
        dispatcher.start().unwrap();
        let (tx, rx) = mpsc::channel();
        let handle = dispatcher.handle();
        for value in 0..5 {
            let tx = tx.clone();
            handle
                .perform(Probe { value }, move |task, _| {
                    tx.send(task.value).unwrap();
                })
                .ok()
                .unwrap();
        }
        let order: Vec<u32> = (0..5).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        dispatcher.stop();
    }

    #[test]
    fn overload_returns_the_task_back() {
        let mut dispatcher: TaskDispatcher<Probe> = TaskDispatcher::new("overload", 2, 1);
        dispatcher.set_clock_timeout(Duration::from_millis(500));
        dispatcher.start().unwrap();
        // Give the workers a moment to reach their waiting state.
        std::thread::sleep(Duration::from_millis(30));
        let gate = Arc::new(Mutex::new(()));
        let guard = gate.lock().unwrap();
        let handle = dispatcher.handle();
        let mut accepted = 0;
        let mut rejected = Vec::new();
        for value in 0..5 {
            let gate = Arc::clone(&gate);
            match handle.perform(Probe { value }, move |_task, _| {
                let _wait = gate.lock().unwrap();
            }) {
                Ok(()) => accepted += 1,
                Err(task) => rejected.push(task.value),
            }
        }
        assert_eq!(accepted, 3, "workers + overflow should bound acceptance");
        assert_eq!(rejected, vec![3, 4]);
        drop(guard);
        dispatcher.stop();
    }

    #[test]
    fn concurrent_submissions_respect_the_accept_rule() {
        use std::sync::Barrier;
        use std::sync::atomic::AtomicUsize;

        // Workers 2, overflow 1, five producers racing on one handle: the
        // accept rule admits exactly workers + overflow submissions no matter
        // how the producers interleave. The long worker clock keeps both
        // workers parked in the queue for the whole burst.
        let mut dispatcher: TaskDispatcher<Probe> = TaskDispatcher::new("racing", 2, 1);
        dispatcher.set_clock_timeout(Duration::from_millis(500));
        dispatcher.start().unwrap();
        std::thread::sleep(Duration::from_millis(30));

        let gate = Arc::new(Mutex::new(()));
        let guard = gate.lock().unwrap();
        let barrier = Arc::new(Barrier::new(5));
        let accepted = Arc::new(AtomicUsize::new(0));
        let rejected = Arc::new(AtomicUsize::new(0));

        let mut producers = Vec::new();
        for value in 0..5 {
            let handle = dispatcher.handle();
            let gate = Arc::clone(&gate);
            let barrier = Arc::clone(&barrier);
            let accepted = Arc::clone(&accepted);
            let rejected = Arc::clone(&rejected);
            producers.push(std::thread::spawn(move || {
                barrier.wait();
                let submitted = handle.perform(Probe { value }, move |_task, _| {
                    let _wait = gate.lock().unwrap();
                });
                match submitted {
                    Ok(()) => accepted.fetch_add(1, Ordering::SeqCst),
                    Err(_task) => rejected.fetch_add(1, Ordering::SeqCst),
                };
            }));
        }
        for producer in producers {
            producer.join().unwrap();
        }

        assert_eq!(accepted.load(Ordering::SeqCst), 3);
        assert_eq!(rejected.load(Ordering::SeqCst), 2);

        drop(guard);
        dispatcher.stop();
    }

    #[test]
    fn pair_execution_shares_one_task() {
        let mut dispatcher: TaskDispatcher<Probe> = TaskDispatcher::new("pair", 2, 2);
        dispatcher.start().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        dispatcher
            .handle()
            .perform_pair(
                Probe { value: 7 },
                move |task, _| tx.send(("first", task.value)).unwrap(),
                move |task, _| tx2.send(("second", task.value)).unwrap(),
            )
            .ok()
            .unwrap();
        let mut seen: Vec<(&str, u32)> = vec![rx.recv().unwrap(), rx.recv().unwrap()];
        seen.sort();
        assert_eq!(seen, vec![("first", 7), ("second", 7)]);
        dispatcher.stop();
    }

    #[test]
    fn panicking_task_does_not_kill_the_pool() {
        let mut dispatcher: TaskDispatcher<Probe> = TaskDispatcher::new("panic", 1, 4);
        dispatcher.start().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let handle = dispatcher.handle();
        handle
            .perform(Probe { value: 0 }, |_task, _| panic!("boom"))
            .ok()
            .unwrap();
        let (tx, rx) = mpsc::channel();
        handle
            .perform(Probe { value: 1 }, move |task, _| {
                tx.send(task.value).unwrap();
            })
            .ok()
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        dispatcher.stop();
    }
}
