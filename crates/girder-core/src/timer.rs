//! High-precision timer subsystem.
//!
//! One worker thread drains two task registries per clock tick: periodic
//! tasks firing on a fixed period, and one-shot tasks scheduled at an
//! absolute timestamp. A loop that falls behind executes each periodic task
//! once with an aggregate count instead of replaying every missed firing.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::clock::DEFAULT_CLOCK_TIMEOUT;
use crate::error::{Error, Result};
use crate::requester::{Attendant, PendingRequest};
use crate::subsystem::Subsystem;
use crate::tick::{self, Tick, TickHandler};
use crate::worker::Worker;

/// Default bound on the number of scheduled one-shot tasks.
pub const DEFAULT_MAX_SCHEDULED_TASKS: usize = 1024;

pub type PeriodicTaskId = u64;

/// A task fired on a fixed period.
///
/// When the timer falls behind, `execute` is called once per tick with
/// `expired_count > 1` instead of once per missed period.
pub trait PeriodicTask: Send {
    fn on_start(&mut self, _timer: &TimerHandle) {}

    fn execute(
        &mut self,
        timer: &TimerHandle,
        last_expired: Instant,
        expired_count: usize,
        period: Duration,
    );

    fn on_stop(&mut self, _timer: &TimerHandle) {}
}

/// A one-shot task keyed by absolute timestamp.
pub trait ScheduledTask: Send {
    fn execute(self: Box<Self>, timer: &TimerHandle, scheduled_at: Instant);
}

struct PeriodicEntry {
    task: Box<dyn PeriodicTask>,
    period: Duration,
    next_execution: Instant,
}

type ScheduledMap = BTreeMap<Instant, Vec<Box<dyn ScheduledTask>>>;

struct ScheduledState {
    tasks: ScheduledMap,
    len: usize,
}

/// Cloneable scheduling capability, usable from any thread and from inside
/// executing timer tasks.
#[derive(Clone)]
pub struct TimerHandle {
    scheduled: Arc<Mutex<ScheduledState>>,
    max_scheduled: usize,
}

impl TimerHandle {
    /// Schedule `task` for one-shot execution at `at`. Returns `false` when
    /// the scheduled-task registry is at capacity.
    pub fn schedule(&self, task: Box<dyn ScheduledTask>, at: Instant) -> bool {
        let mut state = match self.scheduled.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.len >= self.max_scheduled {
            warn!(capacity = self.max_scheduled, "scheduled-task registry is full");
            return false;
        }
        state.tasks.entry(at).or_default().push(task);
        state.len += 1;
        true
    }
}

type OverloadHook = Box<dyn FnMut(usize) + Send>;

/// The timer subsystem.
pub struct Timer {
    name: String,
    clock_timeout: Duration,
    max_scheduled: usize,
    periodic: Arc<Mutex<BTreeMap<PeriodicTaskId, PeriodicEntry>>>,
    scheduled: Arc<Mutex<ScheduledState>>,
    on_overload: Arc<Mutex<Option<OverloadHook>>>,
    last_periodic_id: PeriodicTaskId,
    worker: Option<Worker<()>>,
}

impl Timer {
    pub fn new(name: &str) -> Self {
        Timer {
            name: name.to_string(),
            clock_timeout: DEFAULT_CLOCK_TIMEOUT,
            max_scheduled: DEFAULT_MAX_SCHEDULED_TASKS,
            periodic: Arc::new(Mutex::new(BTreeMap::new())),
            scheduled: Arc::new(Mutex::new(ScheduledState {
                tasks: BTreeMap::new(),
                len: 0,
            })),
            on_overload: Arc::new(Mutex::new(None)),
            last_periodic_id: 0,
            worker: None,
        }
    }

    /// Set the tick duration. Only legal while idle.
    pub fn set_clock_timeout(&mut self, clock_timeout: Duration) {
        debug_assert!(self.worker.is_none(), "reconfigure only while idle");
        self.clock_timeout = clock_timeout;
    }

    pub fn clock_timeout(&self) -> Duration {
        self.clock_timeout
    }

    /// Bound the scheduled-task registry. Only legal while idle.
    pub fn set_max_scheduled_tasks(&mut self, max_scheduled: usize) {
        debug_assert!(self.worker.is_none(), "reconfigure only while idle");
        self.max_scheduled = max_scheduled;
    }

    /// Install the overload callback, invoked with the number of expired
    /// ticks whenever more than one expires between loop iterations.
    pub fn set_overload_hook(&mut self, hook: OverloadHook) {
        *lock(&self.on_overload) = Some(hook);
    }

    /// Register a periodic task. Zero periods are rejected. Takes effect at
    /// the next start.
    pub fn register_periodic(
        &mut self,
        task: Box<dyn PeriodicTask>,
        period: Duration,
    ) -> Result<PeriodicTaskId> {
        if period.is_zero() {
            return Err(Error::ZeroPeriod);
        }
        self.last_periodic_id += 1;
        lock(&self.periodic).insert(
            self.last_periodic_id,
            PeriodicEntry {
                task,
                period,
                next_execution: Instant::now(),
            },
        );
        Ok(self.last_periodic_id)
    }

    /// Change a registered task's period. Unknown ids are logged and ignored.
    pub fn update_periodic(&mut self, id: PeriodicTaskId, period: Duration) -> Result<()> {
        if period.is_zero() {
            return Err(Error::ZeroPeriod);
        }
        match lock(&self.periodic).get_mut(&id) {
            Some(entry) => entry.period = period,
            None => debug!(id, "periodic task not found in timer"),
        }
        Ok(())
    }

    /// Remove a registered task. Unknown ids are logged and ignored.
    pub fn remove_periodic(&mut self, id: PeriodicTaskId) {
        if lock(&self.periodic).remove(&id).is_none() {
            debug!(id, "periodic task not found in timer");
        }
    }

    pub fn clear_periodic(&mut self) {
        lock(&self.periodic).clear();
    }

    /// A scheduling handle valid for the lifetime of the timer.
    pub fn handle(&self) -> TimerHandle {
        TimerHandle {
            scheduled: Arc::clone(&self.scheduled),
            max_scheduled: self.max_scheduled,
        }
    }

    /// Schedule a one-shot task; see [`TimerHandle::schedule`].
    pub fn schedule(&self, task: Box<dyn ScheduledTask>, at: Instant) -> bool {
        self.handle().schedule(task, at)
    }
}

fn lock<T>(mutex: &Arc<Mutex<T>>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct TimerThread {
    handle: TimerHandle,
    periodic: Arc<Mutex<BTreeMap<PeriodicTaskId, PeriodicEntry>>>,
    scheduled: Arc<Mutex<ScheduledState>>,
    on_overload: Arc<Mutex<Option<OverloadHook>>>,
}

impl TickHandler for TimerThread {
    type Msg = ();

    fn on_start(&mut self) {
        debug!("timer thread started");
        let now = Instant::now();
        let mut periodic = lock(&self.periodic);
        for entry in periodic.values_mut() {
            entry.task.on_start(&self.handle);
            entry.next_execution = now;
        }
    }

    fn on_overload(&mut self, ticks_expired: usize) {
        warn!(ticks_expired, "timer overload");
        if let Some(hook) = lock(&self.on_overload).as_mut() {
            hook(ticks_expired);
        }
    }

    fn do_load(&mut self, tick: &Tick) {
        let next_tick = tick.deadline.instant();
        // Periodic tasks first, in registration order.
        {
            let mut periodic = lock(&self.periodic);
            for entry in periodic.values_mut() {
                let mut expired_count = 0;
                let mut last_expired = entry.next_execution;
                while entry.next_execution < next_tick {
                    last_expired = entry.next_execution;
                    expired_count += 1;
                    entry.next_execution += entry.period;
                }
                if expired_count > 0 {
                    entry
                        .task
                        .execute(&self.handle, last_expired, expired_count, entry.period);
                }
            }
        }
        // Then scheduled tasks due before the next tick, moved out of the
        // lock before executing.
        let due: ScheduledMap = {
            let mut state = lock(&self.scheduled);
            let remaining = state.tasks.split_off(&next_tick);
            let due = std::mem::replace(&mut state.tasks, remaining);
            state.len -= due.values().map(Vec::len).sum::<usize>();
            due
        };
        for (at, tasks) in due {
            for task in tasks {
                task.execute(&self.handle, at);
            }
        }
    }

    fn on_request(&mut self, request: PendingRequest<()>, _attendant: &mut Attendant<()>) {
        if let crate::requester::ThreadRequest::User(()) = request.message {
            warn!("unexpected user request received by the timer thread");
        }
    }

    fn on_stop(&mut self) {
        let mut periodic = lock(&self.periodic);
        for entry in periodic.values_mut() {
            entry.task.on_stop(&self.handle);
        }
        drop(periodic);
        // One-shot tasks do not survive a stop.
        let mut state = lock(&self.scheduled);
        state.tasks.clear();
        state.len = 0;
        debug!("timer thread exited");
    }
}

impl Subsystem for Timer {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let thread = TimerThread {
            handle: self.handle(),
            periodic: Arc::clone(&self.periodic),
            scheduled: Arc::clone(&self.scheduled),
            on_overload: Arc::clone(&self.on_overload),
        };
        let clock_timeout = self.clock_timeout;
        let worker = Worker::spawn(&format!("{}-clock", self.name), move |attendant| {
            tick::run(thread, clock_timeout, attendant);
        })?;
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop(self.clock_timeout * 4);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    use super::*;

    struct CountingPeriodic {
        fired: Arc<AtomicUsize>,
        expirations: Arc<AtomicUsize>,
        last: Option<Instant>,
    }

    impl PeriodicTask for CountingPeriodic {
        fn execute(
            &mut self,
            _timer: &TimerHandle,
            last_expired: Instant,
            expired_count: usize,
            _period: Duration,
        ) {
            if let Some(previous) = self.last {
                assert!(last_expired > previous, "expired timestamps must advance");
            }
            self.last = Some(last_expired);
            self.fired.fetch_add(1, Ordering::SeqCst);
            self.expirations.fetch_add(expired_count, Ordering::SeqCst);
        }
    }

    struct OneShot {
        tx: mpsc::Sender<Instant>,
    }

    impl ScheduledTask for OneShot {
        fn execute(self: Box<Self>, _timer: &TimerHandle, scheduled_at: Instant) {
            self.tx.send(scheduled_at).unwrap();
        }
    }

    #[test]
    fn zero_period_is_rejected() {
        let mut timer = Timer::new("unit-timer");
        let fired = Arc::new(AtomicUsize::new(0));
        let result = timer.register_periodic(
            Box::new(CountingPeriodic {
                fired: Arc::clone(&fired),
                expirations: Arc::clone(&fired),
                last: None,
            }),
            Duration::ZERO,
        );
        assert!(matches!(result, Err(Error::ZeroPeriod)));
    }

    #[test]
    fn periodic_task_fires_repeatedly() {
        let mut timer = Timer::new("periodic-timer");
        timer.set_clock_timeout(Duration::from_millis(10));
        let fired = Arc::new(AtomicUsize::new(0));
        let expirations = Arc::new(AtomicUsize::new(0));
        timer
            .register_periodic(
                Box::new(CountingPeriodic {
                    fired: Arc::clone(&fired),
                    expirations: Arc::clone(&expirations),
                    last: None,
                }),
                Duration::from_millis(10),
            )
            .unwrap();
        timer.start().unwrap();
        std::thread::sleep(Duration::from_millis(120));
        timer.stop();
        let fired = fired.load(Ordering::SeqCst);
        assert!(fired >= 5, "expected several firings, got {fired}");
        assert!(expirations.load(Ordering::SeqCst) >= fired);
    }

    #[test]
    fn scheduled_task_runs_once_at_its_timestamp() {
        let mut timer = Timer::new("oneshot-timer");
        timer.set_clock_timeout(Duration::from_millis(10));
        timer.start().unwrap();
        let (tx, rx) = mpsc::channel();
        let at = Instant::now() + Duration::from_millis(30);
        assert!(timer.schedule(Box::new(OneShot { tx }), at));
        let scheduled_at = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(scheduled_at, at);
        assert!(rx.recv_timeout(Duration::from_millis(80)).is_err());
        timer.stop();
    }

    #[test]
    fn schedule_is_bounded() {
        let mut timer = Timer::new("bounded-timer");
        timer.set_max_scheduled_tasks(2);
        let (tx, _rx) = mpsc::channel();
        let far = Instant::now() + Duration::from_secs(3600);
        assert!(timer.schedule(Box::new(OneShot { tx: tx.clone() }), far));
        assert!(timer.schedule(Box::new(OneShot { tx: tx.clone() }), far));
        assert!(!timer.schedule(Box::new(OneShot { tx }), far));
    }

    #[test]
    fn overload_hook_reports_expired_ticks() {
        let mut timer = Timer::new("overload-timer");
        timer.set_clock_timeout(Duration::from_millis(5));
        let overloads = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&overloads);
        timer.set_overload_hook(Box::new(move |ticks| {
            assert!(ticks > 1);
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        struct Sleeper;
        impl PeriodicTask for Sleeper {
            fn execute(
                &mut self,
                _timer: &TimerHandle,
                _last: Instant,
                _count: usize,
                _period: Duration,
            ) {
                std::thread::sleep(Duration::from_millis(25));
            }
        }
        timer
            .register_periodic(Box::new(Sleeper), Duration::from_millis(5))
            .unwrap();
        timer.start().unwrap();
        std::thread::sleep(Duration::from_millis(150));
        timer.stop();
        assert!(overloads.load(Ordering::SeqCst) > 0);
    }
}
