//! The event loop: one dedicated thread running a current-thread tokio
//! reactor. It owns the bus channel (through the protocol bridge), the
//! driver registry and the monotonic timer. The signal watcher runs on a
//! thread of its own so a blocked task cannot hide signals from it.
//!
//! Each iteration either runs the next posted task to completion,
//! dispatches an unsolicited bus frame to its driver, or reacts to
//! shutdown. Teardown order: loop thread join (channel and timer drop with
//! its runtime), then the signal watcher thread.

use crate::bridge::ProtocolBridge;
use crate::channel::BusInterface;
use crate::config::{DeviceConfig, MasterConfig};
use crate::error::{ChannelError, DriverError, MasterError};
use crate::executor::{ExecutorHandle, Work};
use crate::frame::{CanFrame, NodeId};
use crate::registry::{Driver, DriverRegistry};
use crate::shutdown::{ShutdownController, ShutdownState, SignalWatcher};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Everything posted work may touch. Only exists on the loop thread.
pub struct LoopContext {
    bridge: ProtocolBridge,
    registry: DriverRegistry,
    executor: ExecutorHandle,
}

impl LoopContext {
    pub(crate) fn new(bridge: ProtocolBridge, executor: ExecutorHandle) -> Self {
        Self {
            bridge,
            registry: DriverRegistry::new(),
            executor,
        }
    }

    pub fn bridge(&mut self) -> &mut ProtocolBridge {
        &mut self.bridge
    }

    /// Read-only view; registry changes go through the master.
    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    pub fn executor(&self) -> &ExecutorHandle {
        &self.executor
    }

    pub(crate) async fn attach_driver(&mut self, driver: Arc<dyn Driver>, node_id: NodeId) -> Result<(), DriverError> {
        if self.registry.contains(node_id) {
            return Err(DriverError::AlreadyRegistered(node_id));
        }
        // checked before init so a driver is never left initialized but unregistered
        if self.registry.is_full() {
            return Err(DriverError::RegistryFull);
        }
        driver.init(&self.executor, &mut self.bridge, node_id).await?;
        self.registry.insert(node_id, driver)
    }

    pub(crate) async fn detach_driver(&mut self, driver: Arc<dyn Driver>, node_id: NodeId) -> Result<(), DriverError> {
        // Out of the registry first: no callbacks reach the driver past this point.
        let entry = self.registry.take(node_id, &driver)?;
        entry.driver.remove(&self.executor, &mut self.bridge, node_id).await
    }

    fn dispatch(&mut self, frame: &CanFrame) {
        self.registry.dispatch(frame);
    }
}

struct EventLoop {
    queue: mpsc::UnboundedReceiver<Work>,
    context: LoopContext,
    graceful: CancellationToken,
    forced: CancellationToken,
}

impl EventLoop {
    async fn run(mut self) {
        info!("Event loop started for master node {}", self.context.bridge.node_id());
        if let Err(e) = self.context.bridge.reset() {
            warn!("NMT reset failed: {}", e);
        }

        let forced = self.forced.clone();
        let graceful = self.graceful.clone();
        loop {
            tokio::select! {
                biased;
                () = forced.cancelled() => {
                    warn!("Event loop aborted");
                    return;
                }
                () = graceful.cancelled() => break,
                work = self.queue.recv() => match work {
                    Some(work) => {
                        if !self.execute(work).await {
                            return;
                        }
                    }
                    None => break,
                },
                frame = self.context.bridge.next_unsolicited(), if self.context.bridge.is_open() => {
                    match frame {
                        Ok(frame) => self.context.dispatch(&frame),
                        Err(ChannelError::Closed) => warn!("Bus channel closed"),
                        Err(e) => error!("Bus channel error: {}", e),
                    }
                }
            }
        }

        self.drain().await;
    }

    /// Runs one task to completion unless termination is forced first.
    async fn execute(&mut self, work: Work) -> bool {
        let forced = self.forced.clone();
        tokio::select! {
            biased;
            () = forced.cancelled() => {
                warn!("Abandoning in-flight task");
                false
            }
            () = work(&mut self.context) => true,
        }
    }

    async fn drain(&mut self) {
        self.queue.close();
        info!("Event loop draining");
        let mut drained = 0usize;
        while let Some(work) = self.queue.recv().await {
            if !self.execute(work).await {
                return;
            }
            drained += 1;
        }
        info!("Drained {} task(s)", drained);
    }
}

/// Owns the loop thread. Dropping it performs a graceful stop.
pub struct EventLoopRuntime {
    executor: ExecutorHandle,
    shutdown: ShutdownController,
    thread: Mutex<Option<JoinHandle<()>>>,
    signals: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoopRuntime {
    /// Opens the bus channel, arms the signal watcher (when configured)
    /// and starts the loop thread. Fails if any of these fail.
    pub fn start(config: &MasterConfig, device: &DeviceConfig, bus: &dyn BusInterface) -> Result<Self, MasterError> {
        config.validate()?;
        let channel = bus.open(&config.can_interface)?;
        info!("Opened bus channel on {}", channel.interface());

        let shutdown = ShutdownController::new(config.force_policy);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let executor = ExecutorHandle::new(queue_tx, shutdown.clone());

        let bridge = ProtocolBridge::new(channel, config.node_id, device, config.sdo_timeout());
        let event_loop = EventLoop {
            queue: queue_rx,
            context: LoopContext::new(bridge, executor.clone()),
            graceful: shutdown.graceful_token(),
            forced: shutdown.forced_token(),
        };

        let signals = if config.watch_signals {
            let name = format!("{}-signals", config.node_name);
            Some(SignalWatcher::spawn(shutdown.clone(), name).map_err(MasterError::Signals)?)
        } else {
            None
        };

        let (ready_tx, ready_rx) = sync_channel(1);
        let thread_shutdown = shutdown.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("{}-loop", config.node_name))
            .spawn(move || run_loop_thread(event_loop, thread_shutdown, ready_tx));
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                stop_watcher(&shutdown, signals);
                return Err(MasterError::Runtime(e));
            }
        };
        executor.bind_loop_thread(thread.thread().id());

        let startup = ready_rx.recv().unwrap_or(Err(MasterError::LoopThread));
        if let Err(e) = startup {
            if thread.join().is_err() {
                error!("Event loop thread panicked during startup");
            }
            stop_watcher(&shutdown, signals);
            return Err(e);
        }

        Ok(Self {
            executor,
            shutdown,
            thread: Mutex::new(Some(thread)),
            signals: Mutex::new(signals),
        })
    }

    pub fn executor_handle(&self) -> &ExecutorHandle {
        &self.executor
    }

    pub fn shutdown_controller(&self) -> &ShutdownController {
        &self.shutdown
    }

    pub fn state(&self) -> ShutdownState {
        self.shutdown.state()
    }

    pub fn is_finished(&self) -> bool {
        self.thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }

    /// Requests a graceful stop and joins the loop thread. Idempotent.
    pub fn stop(&self) {
        self.shutdown.request_shutdown();
        self.join();
    }

    /// Blocks until the loop exits on its own (e.g. after a signal).
    pub fn join(&self) {
        let handle = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                error!("Event loop cannot join itself");
                return;
            }
            if handle.join().is_err() {
                error!("Event loop thread panicked");
            }
        }
        // the watcher exits once the loop has marked the controller terminated
        let signals = self.signals.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = signals {
            if handle.join().is_err() {
                error!("Signal watcher thread panicked");
            }
        }
    }

    /// Like [`EventLoopRuntime::join`] with an upper bound. Returns whether
    /// the loop has terminated.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.join();
        true
    }
}

impl Drop for EventLoopRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}

fn stop_watcher(shutdown: &ShutdownController, signals: Option<JoinHandle<()>>) {
    shutdown.mark_terminated();
    if let Some(handle) = signals {
        if handle.join().is_err() {
            error!("Signal watcher thread panicked");
        }
    }
}

fn run_loop_thread(event_loop: EventLoop, shutdown: ShutdownController, ready: SyncSender<Result<(), MasterError>>) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(MasterError::Runtime(e)));
            shutdown.mark_terminated();
            return;
        }
    };

    runtime.block_on(async move {
        let _ = ready.send(Ok(()));
        event_loop.run().await;
    });

    // drops the timer driver and the bus channel
    drop(runtime);
    shutdown.mark_terminated();
    info!("Event loop terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{parse_interface_name, CanChannel};
    use crate::executor::LocalFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingDriver {
        inits: AtomicUsize,
        removes: AtomicUsize,
    }

    impl Driver for CountingDriver {
        fn init<'a>(
            &'a self,
            _executor: &'a ExecutorHandle,
            _bridge: &'a mut ProtocolBridge,
            _node_id: NodeId,
        ) -> LocalFuture<'a, Result<(), DriverError>> {
            Box::pin(async move {
                self.inits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }

        fn remove<'a>(
            &'a self,
            _executor: &'a ExecutorHandle,
            _bridge: &'a mut ProtocolBridge,
            _node_id: NodeId,
        ) -> LocalFuture<'a, Result<(), DriverError>> {
            Box::pin(async move {
                self.removes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    fn context() -> LoopContext {
        let (channel, _peer) = CanChannel::pair(parse_interface_name("vcan0").unwrap());
        let device = DeviceConfig::parse("", None).unwrap();
        let bridge = ProtocolBridge::new(channel, 1, &device, Duration::from_millis(10));
        let (queue, _rx) = mpsc::unbounded_channel();
        let executor = ExecutorHandle::new(queue, ShutdownController::new(crate::shutdown::ForcePolicy::AbortLoop));
        LoopContext::new(bridge, executor)
    }

    #[test]
    fn test_full_registry_rejects_before_init() {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let mut context = context();
        let driver = Arc::new(CountingDriver::default());

        runtime.block_on(async {
            for node in 0..crate::registry::MAX_SUBORDINATES as NodeId {
                context.attach_driver(driver.clone(), node).await.unwrap();
            }
            assert!(context.registry().is_full());

            let late = Arc::new(CountingDriver::default());
            assert_eq!(
                context.attach_driver(late.clone(), 127).await,
                Err(DriverError::RegistryFull)
            );
            assert_eq!(late.inits.load(Ordering::SeqCst), 0);
        });
        assert_eq!(driver.inits.load(Ordering::SeqCst), crate::registry::MAX_SUBORDINATES);
    }

    #[test]
    fn test_detach_calls_remove_once() {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let mut context = context();
        let driver = Arc::new(CountingDriver::default());

        runtime.block_on(async {
            context.attach_driver(driver.clone(), 5).await.unwrap();
            context.detach_driver(driver.clone(), 5).await.unwrap();
            assert_eq!(
                context.detach_driver(driver.clone(), 5).await,
                Err(DriverError::NotRegistered(5))
            );
        });
        assert_eq!(driver.removes.load(Ordering::SeqCst), 1);
        assert!(context.registry().is_empty());
    }
}
