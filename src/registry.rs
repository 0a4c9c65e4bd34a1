use crate::bridge::ProtocolBridge;
use crate::error::DriverError;
use crate::executor::{ExecutorHandle, LocalFuture};
use crate::frame::{CanFrame, NodeId, MAX_NODE_ID};
use heapless::Vec;
use std::sync::Arc;
use tracing::{debug, info};

pub const MAX_SUBORDINATES: usize = MAX_NODE_ID as usize;

/// A handler for one subordinate device.
///
/// All methods are invoked on the event loop thread. `init` and `remove`
/// may issue bus operations through the bridge they are handed; the loop
/// runs nothing else until they complete.
pub trait Driver: Send + Sync {
    fn init<'a>(
        &'a self,
        executor: &'a ExecutorHandle,
        bridge: &'a mut ProtocolBridge,
        node_id: NodeId,
    ) -> LocalFuture<'a, Result<(), DriverError>>;

    fn remove<'a>(
        &'a self,
        executor: &'a ExecutorHandle,
        bridge: &'a mut ProtocolBridge,
        node_id: NodeId,
    ) -> LocalFuture<'a, Result<(), DriverError>>;

    /// Bus-originated frame for this driver's node (heartbeat, EMCY, ...).
    fn on_frame(&self, _node_id: NodeId, _frame: &CanFrame) {}
}

#[derive(Clone)]
pub struct SubordinateEntry {
    pub node_id: NodeId,
    pub driver: Arc<dyn Driver>,
}

/// Attached drivers, keyed by node id. Lives inside the loop context and
/// is only reachable from the loop thread.
#[derive(Default)]
pub struct DriverRegistry {
    entries: Vec<SubordinateEntry, MAX_SUBORDINATES>,
    dispatched: u64,
}

pub(crate) fn same_driver(a: &Arc<dyn Driver>, b: &Arc<dyn Driver>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.is_full()
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.entries.iter().any(|e| e.node_id == node_id)
    }

    pub fn get(&self, node_id: NodeId) -> Option<&SubordinateEntry> {
        self.entries.iter().find(|e| e.node_id == node_id)
    }

    pub fn node_ids(&self) -> std::vec::Vec<NodeId> {
        self.entries.iter().map(|e| e.node_id).collect()
    }

    /// Number of frames handed to drivers so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    pub(crate) fn insert(&mut self, node_id: NodeId, driver: Arc<dyn Driver>) -> Result<(), DriverError> {
        if self.contains(node_id) {
            return Err(DriverError::AlreadyRegistered(node_id));
        }
        self.entries
            .push(SubordinateEntry { node_id, driver })
            .map_err(|_| DriverError::RegistryFull)?;
        info!("Driver attached to node {}", node_id);
        Ok(())
    }

    pub(crate) fn take(&mut self, node_id: NodeId, driver: &Arc<dyn Driver>) -> Result<SubordinateEntry, DriverError> {
        let position = self
            .entries
            .iter()
            .position(|e| e.node_id == node_id)
            .ok_or(DriverError::NotRegistered(node_id))?;
        if !same_driver(&self.entries[position].driver, driver) {
            return Err(DriverError::DriverMismatch(node_id));
        }
        info!("Driver detached from node {}", node_id);
        Ok(self.entries.remove(position))
    }

    /// Hands a frame to the driver attached to the node in its COB-ID.
    pub(crate) fn dispatch(&mut self, frame: &CanFrame) -> bool {
        let Some(node_id) = frame.node_id() else {
            return false;
        };
        match self.get(node_id) {
            Some(entry) => {
                entry.driver.on_frame(node_id, frame);
                self.dispatched += 1;
                true
            }
            None => {
                debug!("No driver for frame {:03X} from node {}", frame.id, node_id);
                false
            }
        }
    }
}
