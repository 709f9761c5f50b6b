//! Asynchronous TCP service: two workers per connection, one receiving and
//! one sending.

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

/// A unit of connection work for the asynchronous service.
///
/// The task is shared between exactly two workers: one runs
/// `execute_receive`, the other `execute_send`, concurrently and on the same
/// socket. The socket is safe for one reader and one writer at a time; the
/// task must make sure the other half has quiesced before anything closes
/// the socket. The task (and with it the socket) is dropped once both halves
/// have returned.
pub trait AsyncTask: Send + Sync + 'static {
    fn execute_receive(&self, dispatcher: &DispatcherHandle<Self>)
    where
        Self: Sized;

    fn execute_send(&self, dispatcher: &DispatcherHandle<Self>)
    where
        Self: Sized;
}

type OverloadHook<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Listener threads feeding a dispatcher sized at two workers per client.
pub struct AsyncTcpService<T, F> {
    name: String,
    clock_timeout: Duration,
    listener_configs: ListenerConfigs,
    dispatcher: TaskDispatcher<T>,
    listeners: WorkerSet<()>,
    factory: Arc<F>,
    on_overload: OverloadHook<T>,
}

impl<T, F> AsyncTcpService<T, F>
where
    T: AsyncTask,
    F: Fn(TcpSocket) -> T + Send + Sync + 'static,
{
    pub fn new(name: &str, max_clients: usize, factory: F) -> Self {
        AsyncTcpService {
            name: name.to_string(),
            clock_timeout: DEFAULT_CLOCK_TIMEOUT,
            listener_configs: ListenerConfigs::new(),
            dispatcher: TaskDispatcher::new(name, max_clients * 2, 0),
            listeners: WorkerSet::new(),
            factory: Arc::new(factory),
            on_overload: Arc::new(|_task| {}),
        }
    }

    pub fn max_clients(&self) -> usize {
        self.dispatcher.worker_count() / 2
    }

    /// Change the client bound. Only legal while idle.
    pub fn set_max_clients(&mut self, max_clients: usize) {
        self.dispatcher.set_worker_count(max_clients * 2);
    }

    pub fn set_clock_timeout(&mut self, clock_timeout: Duration) {
        self.clock_timeout = clock_timeout;
    }

    /// Called with every task the dispatcher refused.
    pub fn set_overload_hook(&mut self, hook: impl Fn(T) + Send + Sync + 'static) {
        self.on_overload = Arc::new(hook);
    }

    /// Register a listener endpoint. Only legal while idle.
    pub fn add_listener(&mut self, addr: TcpAddrInfo, backlog: u32) -> u64 {
        self.listener_configs.add(ListenerConfig {
            addr,
            listen_timeout: self.clock_timeout,
            backlog,
        })
    }

    pub fn add_default_listener(&mut self, addr: TcpAddrInfo) -> u64 {
        self.add_listener(addr, DEFAULT_BACKLOG)
    }

    pub fn update_listener(&mut self, id: u64, config: ListenerConfig) -> Result<()> {
        self.listener_configs.update(id, config)
    }

    pub fn remove_listener(&mut self, id: u64) -> Result<()> {
        self.listener_configs.remove(id).map(|_| ())
    }

    pub fn dispatcher(&self) -> DispatcherHandle<T> {
        self.dispatcher.handle()
    }
}

fn listener_loop<T, F>(
    mut attendant: girder_core::requester::Attendant<()>,
    config: ListenerConfig,
    dispatcher: DispatcherHandle<T>,
    factory: Arc<F>,
    on_overload: OverloadHook<T>,
) where
    T: AsyncTask,
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
        attendant.fetch_request();
        if attendant.should_terminate() {
            break;
        }
        let Some(socket) = accepted else {
            continue;
        };
        debug!(remote = ?socket.remote_endpoint(), "connection received");
        let task = factory(socket);
        let submitted = dispatcher.perform_pair(
            task,
            |task, handle| task.execute_receive(handle),
            |task, handle| task.execute_send(handle),
        );
        if let Err(task) = submitted {
            warn!(addr = %config.addr, "too many connection requests");
            on_overload(task);
        }
    }
    debug!(addr = %config.addr, "listener thread exited");
}

impl<T, F> Subsystem for AsyncTcpService<T, F>
where
    T: AsyncTask,
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
