//! Synchronous TCP service: one worker drives one connection end-to-end.

use std::sync::Arc;
use std::time::Duration;

use girder_core::clock::{DEFAULT_CLOCK_TIMEOUT, Deadline};
use girder_core::dispatcher::{DispatcherHandle, TaskDispatcher};
use girder_core::error::Result;
use girder_core::subsystem::Subsystem;
use girder_core::worker::{Worker, WorkerSet};
use girder_net::{TcpAddrInfo, TcpSocket, listen_on};
use tracing::{debug, error, warn};

use crate::listener::{DEFAULT_BACKLOG, ListenerConfig, ListenerConfigs};

/// A unit of connection work for the synchronous service.
///
/// The task owns its socket; both are dropped when `execute` returns. The
/// dispatcher handle lets a task submit follow-up work.
pub trait SyncTask: Send + Sync + 'static {
    fn execute(&mut self, dispatcher: &DispatcherHandle<Self>)
    where
        Self: Sized;
}

type OverloadHook<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Listener threads feeding a bounded dispatcher whose workers run one task
/// per connection, synchronously.
pub struct SyncTcpService<T, F> {
    name: String,
    clock_timeout: Duration,
    listener_configs: ListenerConfigs,
    dispatcher: TaskDispatcher<T>,
    listeners: WorkerSet<()>,
    factory: Arc<F>,
    on_overload: OverloadHook<T>,
}

impl<T, F> SyncTcpService<T, F>
where
    T: SyncTask,
    F: Fn(TcpSocket) -> T + Send + Sync + 'static,
{
    /// `worker_count` bounds the connections served at once;
    /// `max_queue_overflow` is the extra queue slack before submissions are
    /// rejected.
    pub fn new(name: &str, worker_count: usize, max_queue_overflow: usize, factory: F) -> Self {
        SyncTcpService {
            name: name.to_string(),
            clock_timeout: DEFAULT_CLOCK_TIMEOUT,
            listener_configs: ListenerConfigs::new(),
            dispatcher: TaskDispatcher::new(name, worker_count, max_queue_overflow),
            listeners: WorkerSet::new(),
            factory: Arc::new(factory),
            on_overload: Arc::new(|_task| {}),
        }
    }

    pub fn max_clients(&self) -> usize {
        self.dispatcher.worker_count()
    }

    /// Change the worker pool size. Only legal while idle.
    pub fn set_max_clients(&mut self, worker_count: usize) {
        self.dispatcher.set_worker_count(worker_count);
    }

    pub fn set_clock_timeout(&mut self, clock_timeout: Duration) {
        self.clock_timeout = clock_timeout;
    }

    /// Called with every task the dispatcher refused.
    pub fn set_overload_hook(&mut self, hook: impl Fn(T) + Send + Sync + 'static) {
        self.on_overload = Arc::new(hook);
    }

    /// Register a listener endpoint. Only legal while idle.
    pub fn add_listener(&mut self, addr: TcpAddrInfo, listen_timeout: Duration, backlog: u32) -> u64 {
        self.listener_configs.add(ListenerConfig {
            addr,
            listen_timeout,
            backlog,
        })
    }

    /// Register a listener with the default backlog and the service clock as
    /// its accept timeout.
    pub fn add_default_listener(&mut self, addr: TcpAddrInfo) -> u64 {
        let listen_timeout = self.clock_timeout;
        self.add_listener(addr, listen_timeout, DEFAULT_BACKLOG)
    }

    pub fn update_listener(&mut self, id: u64, config: ListenerConfig) -> Result<()> {
        self.listener_configs.update(id, config)
    }

    pub fn remove_listener(&mut self, id: u64) -> Result<()> {
        self.listener_configs.remove(id).map(|_| ())
    }

    /// A submission handle onto this service's dispatcher.
    pub fn dispatcher(&self) -> DispatcherHandle<T> {
        self.dispatcher.handle()
    }
}

/// The accept loop of one listener thread.
fn listener_loop<T, F>(
    mut attendant: girder_core::requester::Attendant<()>,
    config: ListenerConfig,
    dispatcher: DispatcherHandle<T>,
    factory: Arc<F>,
    on_overload: OverloadHook<T>,
) where
    T: SyncTask,
    F: Fn(TcpSocket) -> T + Send + Sync + 'static,
{
    let listener = match listen_on(&config.addr, config.backlog) {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %config.addr, "listener setup failed: {e}");
            return;
        }
    };
    debug!(addr = %config.addr, "listener ready");
    loop {
        attendant.fetch_request();
        if attendant.should_terminate() {
            break;
        }
        let accepted = match listener.accept(Deadline::after(config.listen_timeout)) {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(addr = %config.addr, "accept failed, leaving listener thread: {e}");
                break;
            }
        };
        // Served before the task goes out so shutdown wins over new work.
        attendant.fetch_request();
        if attendant.should_terminate() {
            break;
        }
        let Some(socket) = accepted else {
            continue;
        };
        debug!(remote = ?socket.remote_endpoint(), "connection received");
        let task = factory(socket);
        if let Err(task) = dispatcher.perform(task, |mut task, handle| task.execute(handle)) {
            warn!(addr = %config.addr, "too many connection requests");
            on_overload(task);
        }
    }
    debug!(addr = %config.addr, "listener thread exited");
}

impl<T, F> Subsystem for SyncTcpService<T, F>
where
    T: SyncTask,
    F: Fn(TcpSocket) -> T + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<()> {
        self.dispatcher.start()?;
        let configs: Vec<_> = self
            .listener_configs
            .iter()
            .map(|(id, config)| (id, config.clone()))
            .collect();
        for (id, config) in configs {
            let dispatcher = self.dispatcher.handle();
            let factory = Arc::clone(&self.factory);
            let on_overload = Arc::clone(&self.on_overload);
            let worker = Worker::spawn(&format!("{}-listener-{id}", self.name), move |attendant| {
                listener_loop(attendant, config, dispatcher, factory, on_overload);
            })?;
            if let Err(e) = self.listeners.register(worker) {
                self.stop();
                return Err(e);
            }
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.listeners.stop_all(self.clock_timeout * 4);
        self.dispatcher.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use girder_net::{Family, Host, connect_to};

    use super::*;

    struct EchoTask {
        socket: TcpSocket,
        served: Arc<AtomicUsize>,
    }

    impl SyncTask for EchoTask {
        fn execute(&mut self, _dispatcher: &DispatcherHandle<Self>) {
            let deadline = Deadline::after(Duration::from_secs(2));
            let mut buf = [0u8; 64];
            if let Ok(n) = self.socket.read(&mut buf, deadline) {
                if n > 0 {
                    let _ = self.socket.write(&buf[..n], deadline);
                }
            }
            self.served.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn loopback_any() -> TcpAddrInfo {
        TcpAddrInfo::with_port(Family::Ipv4, Host::Loopback, 0).unwrap()
    }

    #[test]
    fn service_echoes_over_a_real_socket() {
        let served = Arc::new(AtomicUsize::new(0));
        let served_in_task = Arc::clone(&served);
        let mut service = SyncTcpService::new("echo-sync", 2, 4, move |socket| EchoTask {
            socket,
            served: Arc::clone(&served_in_task),
        });
        // Bind on a fixed free port chosen by the OS first.
        let probe = listen_on(&loopback_any(), 1).unwrap();
        let port = probe.local_endpoint().unwrap().port();
        drop(probe);
        let addr = TcpAddrInfo::with_port(Family::Ipv4, Host::Loopback, port).unwrap();
        service.add_listener(addr.clone(), Duration::from_millis(50), 8);
        service.start().unwrap();

        let client = connect_to(&addr, Duration::from_secs(2)).unwrap();
        let deadline = Deadline::after(Duration::from_secs(2));
        client.write(b"marco", deadline).unwrap();
        let mut buf = [0u8; 16];
        let mut got = 0;
        while got < 5 {
            let n = client.read(&mut buf[got..], deadline).unwrap();
            if n == 0 {
                break;
            }
            got += n;
        }
        assert_eq!(&buf[..got], b"marco");

        service.stop();
        assert_eq!(served.load(Ordering::SeqCst), 1);
    }

    struct BlockingTask {
        _socket: TcpSocket,
        gate: Arc<Mutex<()>>,
    }

    impl SyncTask for BlockingTask {
        fn execute(&mut self, _dispatcher: &DispatcherHandle<Self>) {
            let _hold = self.gate.lock().unwrap();
        }
    }

    #[test]
    fn overload_hook_sees_rejected_tasks() {
        let gate = Arc::new(Mutex::new(()));
        let gate_for_tasks = Arc::clone(&gate);
        let mut service = SyncTcpService::new("busy-sync", 1, 0, move |socket| BlockingTask {
            _socket: socket,
            gate: Arc::clone(&gate_for_tasks),
        });
        let rejected = Arc::new(AtomicUsize::new(0));
        let rejected_in_hook = Arc::clone(&rejected);
        service.set_overload_hook(move |_task| {
            rejected_in_hook.fetch_add(1, Ordering::SeqCst);
        });
        let probe = listen_on(&loopback_any(), 1).unwrap();
        let port = probe.local_endpoint().unwrap().port();
        drop(probe);
        let addr = TcpAddrInfo::with_port(Family::Ipv4, Host::Loopback, port).unwrap();
        service.add_listener(addr.clone(), Duration::from_millis(20), 16);

        let guard = gate.lock().unwrap();
        service.start().unwrap();

        // First connection occupies the only worker; the rest overflow.
        let mut clients = Vec::new();
        for _ in 0..4 {
            clients.push(connect_to(&addr, Duration::from_secs(2)).unwrap());
        }
        let waited = Deadline::after(Duration::from_secs(3));
        while rejected.load(Ordering::SeqCst) < 2 && !waited.has_passed() {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(rejected.load(Ordering::SeqCst) >= 2);

        drop(guard);
        service.stop();
    }
}
