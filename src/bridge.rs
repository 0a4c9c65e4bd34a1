use crate::channel::CanChannel;
use crate::config::DeviceConfig;
use crate::error::{ChannelError, SdoError};
use crate::frame::{CanFrame, DataType, NodeId, FC_NMT};
use crate::sdo::{self, AbortCode, SdoRequest, SdoResponse};
use heapless::{Deque, Vec};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

const MAX_PENDING: usize = 8;
const MAX_BACKLOG: usize = 64;

const NMT_RESET_COMMUNICATION: u8 = 0x82;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write,
}

/// Identity of an outstanding SDO transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingOperation {
    pub node_id: NodeId,
    pub index: u16,
    pub subindex: u8,
    pub kind: OperationKind,
}

type PendingOperations = Vec<PendingOperation, MAX_PENDING>;

/// In-flight transfers. Entries are owned by [`PendingEntry`] guards, so a
/// transfer whose future is dropped midway still leaves the table.
#[derive(Debug, Default, Clone)]
struct PendingTable {
    operations: Arc<Mutex<PendingOperations>>,
}

impl PendingTable {
    fn lock(&self) -> MutexGuard<'_, PendingOperations> {
        self.operations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self, operation: PendingOperation) -> Result<PendingEntry, SdoError> {
        let mut operations = self.lock();
        if operations.contains(&operation) {
            return Err(SdoError::Busy(operation.index, operation.subindex));
        }
        operations
            .push(operation)
            .map_err(|_| SdoError::Busy(operation.index, operation.subindex))?;
        Ok(PendingEntry { table: self.clone(), operation })
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Removes its operation from the table when dropped.
#[derive(Debug)]
struct PendingEntry {
    table: PendingTable,
    operation: PendingOperation,
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        let mut operations = self.table.lock();
        if let Some(position) = operations.iter().position(|o| *o == self.operation) {
            operations.swap_remove(position);
        }
    }
}

/// Session state for one CANopen network: owns the bus channel, the table
/// of configured nodes and the table of in-flight SDO transfers.
///
/// Only ever touched from the event loop thread; external code reaches it
/// through posted work.
#[derive(Debug)]
pub struct ProtocolBridge {
    channel: CanChannel,
    node_id: NodeId,
    nodes: Vec<NodeId, 127>,
    local: BTreeMap<(u16, u8), std::vec::Vec<u8>>,
    pending: PendingTable,
    backlog: Deque<CanFrame, MAX_BACKLOG>,
    sdo_timeout: Duration,
}

impl ProtocolBridge {
    pub fn new(channel: CanChannel, node_id: NodeId, device: &DeviceConfig, sdo_timeout: Duration) -> Self {
        let mut nodes = Vec::new();
        for &node in device.assigned_nodes() {
            if node != node_id && nodes.push(node).is_err() {
                warn!("Node table full, ignoring node {}", node);
            }
        }

        let local = device
            .concise_entries()
            .iter()
            .map(|e| ((e.index, e.subindex), e.data.clone()))
            .collect();

        Self {
            channel,
            node_id,
            nodes,
            local,
            pending: PendingTable::default(),
            backlog: Deque::new(),
            sdo_timeout,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn is_configured(&self, node_id: NodeId) -> bool {
        node_id == self.node_id || self.nodes.contains(&node_id)
    }

    pub fn sdo_timeout(&self) -> Duration {
        self.sdo_timeout
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Broadcasts NMT "reset communication" to every node.
    pub fn reset(&mut self) -> Result<(), ChannelError> {
        info!("Resetting communication on {}", self.channel.interface());
        let frame = CanFrame::new(FC_NMT, &[NMT_RESET_COMMUNICATION, 0x00]).ok_or(ChannelError::Closed)?;
        self.channel.send(frame)
    }

    pub fn send(&mut self, frame: CanFrame) -> Result<(), ChannelError> {
        self.channel.send(frame)
    }

    /// Next frame that no SDO transfer claimed.
    pub async fn next_unsolicited(&mut self) -> Result<CanFrame, ChannelError> {
        if let Some(frame) = self.backlog.pop_front() {
            return Ok(frame);
        }
        self.channel.recv().await
    }

    /// Reads one object of a remote node (or of the master itself).
    pub async fn read(&mut self, node_id: NodeId, index: u16, subindex: u8, data_type: DataType) -> Result<u32, SdoError> {
        if node_id == self.node_id {
            return self.read_local(index, subindex, data_type);
        }
        self.ensure_configured(node_id)?;

        let operation = PendingOperation { node_id, index, subindex, kind: OperationKind::Read };
        let entry = self.pending.begin(operation)?;
        let outcome = self.transfer(node_id, SdoRequest::Upload { index, subindex }).await;
        drop(entry);

        match outcome? {
            SdoResponse::Upload { data, .. } if data.len() == data_type.size() => Ok(DataType::decode(&data)),
            SdoResponse::Upload { data, .. } => Err(SdoError::TypeMismatch {
                expected: data_type.size(),
                actual: data.len(),
            }),
            SdoResponse::Abort { code, .. } => Err(SdoError::Abort { node: node_id, code }),
            SdoResponse::Download { .. } => Err(SdoError::Protocol("download response to upload request")),
        }
    }

    /// Writes one object of a remote node (or of the master itself).
    pub async fn write(
        &mut self,
        node_id: NodeId,
        index: u16,
        subindex: u8,
        data_type: DataType,
        value: u32,
    ) -> Result<(), SdoError> {
        if !data_type.fits(value) {
            return Err(SdoError::ValueOutOfRange { value, size: data_type.size() });
        }
        if node_id == self.node_id {
            return self.write_local(index, subindex, data_type, value);
        }
        self.ensure_configured(node_id)?;

        let operation = PendingOperation { node_id, index, subindex, kind: OperationKind::Write };
        let entry = self.pending.begin(operation)?;
        let request = SdoRequest::Download { index, subindex, data: data_type.encode(value) };
        let outcome = self.transfer(node_id, request).await;
        drop(entry);

        match outcome? {
            SdoResponse::Download { .. } => Ok(()),
            SdoResponse::Abort { code, .. } => Err(SdoError::Abort { node: node_id, code }),
            SdoResponse::Upload { .. } => Err(SdoError::Protocol("upload response to download request")),
        }
    }

    fn ensure_configured(&self, node_id: NodeId) -> Result<(), SdoError> {
        if self.nodes.contains(&node_id) {
            Ok(())
        } else {
            Err(SdoError::UnknownNode(node_id))
        }
    }

    fn read_local(&self, index: u16, subindex: u8, data_type: DataType) -> Result<u32, SdoError> {
        let data = self.local.get(&(index, subindex)).ok_or(SdoError::Abort {
            node: self.node_id,
            code: AbortCode::NO_OBJECT,
        })?;
        if data.len() != data_type.size() {
            return Err(SdoError::TypeMismatch { expected: data_type.size(), actual: data.len() });
        }
        Ok(DataType::decode(data))
    }

    fn write_local(&mut self, index: u16, subindex: u8, data_type: DataType, value: u32) -> Result<(), SdoError> {
        let node = self.node_id;
        let data = self.local.get_mut(&(index, subindex)).ok_or(SdoError::Abort {
            node,
            code: AbortCode::NO_OBJECT,
        })?;
        if data.len() != data_type.size() {
            return Err(SdoError::TypeMismatch { expected: data_type.size(), actual: data.len() });
        }
        *data = data_type.encode(value).to_vec();
        Ok(())
    }

    /// Sends one request and waits for the matching response. Frames that
    /// arrive meanwhile and do not match are kept for later dispatch.
    async fn transfer(&mut self, node_id: NodeId, request: SdoRequest) -> Result<SdoResponse, SdoError> {
        let (index, subindex) = match request {
            SdoRequest::Upload { index, subindex }
            | SdoRequest::Download { index, subindex, .. }
            | SdoRequest::Abort { index, subindex, .. } => (index, subindex),
        };

        self.channel.send(sdo::encode_request(node_id, &request))?;
        let deadline = tokio::time::Instant::now() + self.sdo_timeout;

        loop {
            let frame = match tokio::time::timeout_at(deadline, self.channel.recv()).await {
                Ok(frame) => frame?,
                Err(_) => {
                    warn!("SDO {:04X}:{:02X} to node {} timed out", index, subindex, node_id);
                    let abort = SdoRequest::Abort { index, subindex, code: AbortCode::TIMEOUT };
                    // best effort, the transfer has failed either way
                    let _ = self.channel.send(sdo::encode_request(node_id, &abort));
                    return Err(SdoError::Timeout {
                        node: node_id,
                        timeout_ms: self.sdo_timeout.as_millis() as u64,
                    });
                }
            };

            match sdo::decode_response(&frame) {
                Ok(Some((node, response))) if node == node_id && response.address() == (index, subindex) => {
                    return Ok(response);
                }
                Ok(Some((node, response))) if node == node_id => {
                    debug!("Ignoring stale SDO response {:?} from node {}", response, node);
                }
                Err(e) if frame.node_id() == Some(node_id) => return Err(e),
                _ => self.keep_for_dispatch(frame),
            }
        }
    }

    fn keep_for_dispatch(&mut self, frame: CanFrame) {
        if self.backlog.is_full() {
            let dropped = self.backlog.pop_front();
            warn!("Unsolicited frame backlog full, dropping {:?}", dropped.map(|f| f.id));
        }
        let _ = self.backlog.push_back(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{parse_interface_name, ChannelPeer};
    use crate::sdo::SdoPayload;

    fn bridge_with_node(node: NodeId, timeout_ms: u64) -> (ProtocolBridge, ChannelPeer) {
        let (channel, peer) = CanChannel::pair(parse_interface_name("vcan0").unwrap());
        let text = format!("[1F81sub{:X}]\nDefaultValue=1\n", node);
        let device = DeviceConfig::parse(&text, None).unwrap();
        let bridge = ProtocolBridge::new(channel, 1, &device, Duration::from_millis(timeout_ms));
        (bridge, peer)
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
    }

    #[test]
    fn test_unknown_node_fails_without_bus_traffic() {
        let (mut bridge, mut peer) = bridge_with_node(5, 100);
        let result = runtime().block_on(bridge.read(9, 0x2000, 1, DataType::Unsigned32));
        assert_eq!(result, Err(SdoError::UnknownNode(9)));
        assert!(peer.from_master.try_recv().is_err());
    }

    #[test]
    fn test_read_decodes_matching_response() {
        let (mut bridge, peer) = bridge_with_node(5, 500);
        let data = SdoPayload::from_slice(&42u32.to_le_bytes()).unwrap();
        peer.to_master
            .send(sdo::encode_response(5, &SdoResponse::Upload { index: 0x2000, subindex: 1, data }))
            .unwrap();

        let value = runtime().block_on(bridge.read(5, 0x2000, 1, DataType::Unsigned32));
        assert_eq!(value, Ok(42));
        assert_eq!(bridge.pending_count(), 0);
    }

    #[test]
    fn test_read_length_mismatch() {
        let (mut bridge, peer) = bridge_with_node(5, 500);
        let data = SdoPayload::from_slice(&[1, 0]).unwrap();
        peer.to_master
            .send(sdo::encode_response(5, &SdoResponse::Upload { index: 0x2000, subindex: 1, data }))
            .unwrap();

        let value = runtime().block_on(bridge.read(5, 0x2000, 1, DataType::Unsigned32));
        assert_eq!(value, Err(SdoError::TypeMismatch { expected: 4, actual: 2 }));
    }

    #[test]
    fn test_silent_node_times_out_and_sends_abort() {
        let (mut bridge, mut peer) = bridge_with_node(5, 20);
        let result = runtime().block_on(bridge.write(5, 0x2000, 1, DataType::Unsigned8, 3));
        assert_eq!(result, Err(SdoError::Timeout { node: 5, timeout_ms: 20 }));

        let request = peer.from_master.try_recv().unwrap();
        assert_eq!(request.data[0], 0x2F);
        let abort = peer.from_master.try_recv().unwrap();
        assert_eq!(abort.data[0], 0x80);
        assert_eq!(bridge.pending_count(), 0);
    }

    #[test]
    fn test_cancelled_read_releases_its_entry() {
        let (mut bridge, _peer) = bridge_with_node(5, 200);
        let rt = runtime();

        let cancelled = rt.block_on(async {
            tokio::time::timeout(
                Duration::from_millis(5),
                bridge.read(5, 0x2000, 1, DataType::Unsigned32),
            )
            .await
        });
        assert!(cancelled.is_err());
        assert_eq!(bridge.pending_count(), 0);

        // same address again: times out instead of reporting busy
        let result = rt.block_on(bridge.read(5, 0x2000, 1, DataType::Unsigned32));
        assert_eq!(result, Err(SdoError::Timeout { node: 5, timeout_ms: 200 }));
    }

    #[test]
    fn test_duplicate_operation_is_busy() {
        let table = PendingTable::default();
        let operation = PendingOperation { node_id: 5, index: 0x2000, subindex: 1, kind: OperationKind::Read };

        let entry = table.begin(operation).unwrap();
        assert_eq!(table.begin(operation).err(), Some(SdoError::Busy(0x2000, 1)));
        drop(entry);
        assert_eq!(table.len(), 0);
        assert!(table.begin(operation).is_ok());
    }

    #[test]
    fn test_unrelated_frames_are_backlogged() {
        let (mut bridge, peer) = bridge_with_node(5, 500);
        let heartbeat = CanFrame::new(0x705, &[0x05]).unwrap();
        peer.to_master.send(heartbeat.clone()).unwrap();
        peer.to_master
            .send(sdo::encode_response(5, &SdoResponse::Download { index: 0x2000, subindex: 1 }))
            .unwrap();

        let rt = runtime();
        assert_eq!(rt.block_on(bridge.write(5, 0x2000, 1, DataType::Unsigned32, 42)), Ok(()));
        assert_eq!(rt.block_on(bridge.next_unsolicited()), Ok(heartbeat));
    }

    #[test]
    fn test_value_out_of_range_is_rejected_before_sending() {
        let (mut bridge, mut peer) = bridge_with_node(5, 500);
        let result = runtime().block_on(bridge.write(5, 0x2000, 1, DataType::Unsigned8, 0x1FF));
        assert_eq!(result, Err(SdoError::ValueOutOfRange { value: 0x1FF, size: 1 }));
        assert!(peer.from_master.try_recv().is_err());
    }

    #[test]
    fn test_local_dictionary_round_trip() {
        let (channel, _peer) = CanChannel::pair(parse_interface_name("vcan0").unwrap());
        let mut bytes = vec![];
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&0x1017u16.to_le_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&500u16.to_le_bytes());
        let device = DeviceConfig::parse("", Some(&bytes)).unwrap();
        let mut bridge = ProtocolBridge::new(channel, 1, &device, Duration::from_millis(10));

        let rt = runtime();
        assert_eq!(rt.block_on(bridge.read(1, 0x1017, 0, DataType::Unsigned16)), Ok(500));
        assert_eq!(rt.block_on(bridge.write(1, 0x1017, 0, DataType::Unsigned16, 1000)), Ok(()));
        assert_eq!(rt.block_on(bridge.read(1, 0x1017, 0, DataType::Unsigned16)), Ok(1000));
        assert!(matches!(
            rt.block_on(bridge.read(1, 0x1018, 1, DataType::Unsigned32)),
            Err(SdoError::Abort { code: AbortCode::NO_OBJECT, .. })
        ));
    }
}
