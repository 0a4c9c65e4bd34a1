use crate::channel::BusInterface;
use crate::config::{DeviceConfig, MasterConfig};
use crate::error::{BridgeError, DriverError, MasterError, SdoError};
use crate::executor::ExecutorHandle;
use crate::frame::{DataType, NodeId};
use crate::registry::Driver;
use crate::runtime::EventLoopRuntime;
use crate::shutdown::{ShutdownController, ShutdownState};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Operations a master exposes to the outside world. Every call blocks the
/// calling thread until the loop thread has carried it out, so none of
/// them may be called from the loop thread.
pub trait MasterInterface {
    fn add_driver(&self, driver: Arc<dyn Driver>, node_id: NodeId) -> Result<(), DriverError>;
    fn remove_driver(&self, driver: Arc<dyn Driver>, node_id: NodeId) -> Result<(), DriverError>;
    fn read_sdo(&self, node_id: NodeId, index: u16, subindex: u8, data_type: DataType) -> Result<u32, SdoError>;
    fn write_sdo(
        &self,
        node_id: NodeId,
        index: u16,
        subindex: u8,
        data_type: DataType,
        value: u32,
    ) -> Result<(), SdoError>;
}

/// A CANopen master: one bus channel, one loop thread.
pub struct MasterNode {
    name: String,
    node_id: NodeId,
    runtime: EventLoopRuntime,
}

impl MasterNode {
    /// Loads the device configuration named in `config` and starts the master.
    pub fn new(config: &MasterConfig, bus: &dyn BusInterface) -> Result<Self, MasterError> {
        config.validate()?;
        let device = DeviceConfig::load(&config.dcf_txt, config.dcf_bin.as_deref())?;
        Self::with_device(config, &device, bus)
    }

    pub fn with_device(config: &MasterConfig, device: &DeviceConfig, bus: &dyn BusInterface) -> Result<Self, MasterError> {
        let runtime = EventLoopRuntime::start(config, device, bus)?;
        info!(
            "Master '{}' (node {}) up on {} with {} configured node(s)",
            config.node_name,
            config.node_id,
            config.can_interface,
            device.assigned_nodes().len()
        );
        Ok(Self {
            name: config.node_name.clone(),
            node_id: config.node_id,
            runtime,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Fully qualified name of one of this master's services.
    pub fn service_name(&self, service: &str) -> String {
        format!("{}/{}", self.name, service)
    }

    pub fn executor(&self) -> &ExecutorHandle {
        self.runtime.executor_handle()
    }

    pub fn shutdown_controller(&self) -> &ShutdownController {
        self.runtime.shutdown_controller()
    }

    pub fn state(&self) -> ShutdownState {
        self.runtime.state()
    }

    /// Nodes with an attached driver, as seen from the loop thread.
    pub fn registered_nodes(&self) -> Result<Vec<NodeId>, BridgeError> {
        self.executor()
            .run_sync(|ctx| Box::pin(async move { ctx.registry().node_ids() }))
    }

    /// Graceful stop: in-flight and already posted work completes, then
    /// the loop thread is joined. Safe to call more than once.
    pub fn shutdown(&self) {
        self.runtime.stop();
    }

    /// Blocks until the loop terminates on its own.
    pub fn wait(&self) {
        self.runtime.join();
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.runtime.join_timeout(timeout)
    }
}

impl MasterInterface for MasterNode {
    fn add_driver(&self, driver: Arc<dyn Driver>, node_id: NodeId) -> Result<(), DriverError> {
        self.executor()
            .run_sync(move |ctx| Box::pin(async move { ctx.attach_driver(driver, node_id).await }))?
    }

    fn remove_driver(&self, driver: Arc<dyn Driver>, node_id: NodeId) -> Result<(), DriverError> {
        self.executor()
            .run_sync(move |ctx| Box::pin(async move { ctx.detach_driver(driver, node_id).await }))?
    }

    fn read_sdo(&self, node_id: NodeId, index: u16, subindex: u8, data_type: DataType) -> Result<u32, SdoError> {
        self.executor().run_sync(move |ctx| {
            Box::pin(async move { ctx.bridge().read(node_id, index, subindex, data_type).await })
        })?
    }

    fn write_sdo(
        &self,
        node_id: NodeId,
        index: u16,
        subindex: u8,
        data_type: DataType,
        value: u32,
    ) -> Result<(), SdoError> {
        self.executor().run_sync(move |ctx| {
            Box::pin(async move { ctx.bridge().write(node_id, index, subindex, data_type, value).await })
        })?
    }
}
