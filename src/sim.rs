//! In-process CAN bus with simulated subordinate nodes.
//!
//! A [`SimulatedBus`] owns exactly one interface name. Opening it hands the
//! master a channel whose peer end is served by a responder thread: SDO
//! requests are answered from each node's object dictionary, NMT reset
//! broadcasts are counted and answered with boot-up messages.

use crate::channel::{parse_interface_name, BusInterface, CanChannel, ChannelPeer, InterfaceName};
use crate::error::ChannelError;
use crate::frame::{cob_id, CanFrame, DataType, NodeId, FC_HEARTBEAT, FC_NMT};
use crate::sdo::{self, AbortCode, SdoRequest, SdoResponse};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const NMT_RESET_COMMUNICATION: u8 = 0x82;
const BOOT_UP: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy)]
struct ObjectEntry {
    data_type: DataType,
    access: Access,
    value: u32,
}

#[derive(Debug, Clone)]
pub struct SimulatedNode {
    node_id: NodeId,
    objects: BTreeMap<(u16, u8), ObjectEntry>,
    silent: bool,
}

impl SimulatedNode {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            objects: BTreeMap::new(),
            silent: false,
        }
    }

    /// Device type, heartbeat producer time and four application words at 0x2000.
    pub fn standard(node_id: NodeId) -> Self {
        let mut node = Self::new(node_id)
            .with_object(0x1000, 0, DataType::Unsigned32, Access::ReadOnly, 0x0000_0191)
            .with_object(0x1017, 0, DataType::Unsigned16, Access::ReadWrite, 1000);
        for subindex in 1..=4 {
            node = node.with_object(0x2000, subindex, DataType::Unsigned32, Access::ReadWrite, 0);
        }
        node
    }

    #[must_use]
    pub fn with_object(mut self, index: u16, subindex: u8, data_type: DataType, access: Access, value: u32) -> Self {
        self.objects.insert((index, subindex), ObjectEntry { data_type, access, value });
        self
    }

    /// A node that never answers, for exercising timeouts.
    #[must_use]
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn value(&self, index: u16, subindex: u8) -> Option<u32> {
        self.objects.get(&(index, subindex)).map(|e| e.value)
    }

    fn missing(&self, index: u16) -> AbortCode {
        if self.objects.keys().any(|(i, _)| *i == index) {
            AbortCode::NO_SUBINDEX
        } else {
            AbortCode::NO_OBJECT
        }
    }

    /// Server side of one expedited transfer. `None` means no reply.
    fn handle(&mut self, request: &SdoRequest) -> Option<SdoResponse> {
        if self.silent {
            return None;
        }

        let response = match request {
            SdoRequest::Upload { index, subindex } => match self.objects.get(&(*index, *subindex)) {
                None => abort(*index, *subindex, self.missing(*index)),
                Some(entry) if entry.access == Access::WriteOnly => abort(*index, *subindex, AbortCode::WRITE_ONLY),
                Some(entry) => SdoResponse::Upload {
                    index: *index,
                    subindex: *subindex,
                    data: entry.data_type.encode(entry.value),
                },
            },
            SdoRequest::Download { index, subindex, data } => {
                let missing = self.missing(*index);
                match self.objects.get_mut(&(*index, *subindex)) {
                    None => abort(*index, *subindex, missing),
                    Some(entry) if entry.access == Access::ReadOnly => abort(*index, *subindex, AbortCode::READ_ONLY),
                    Some(entry) if data.len() != entry.data_type.size() => {
                        abort(*index, *subindex, AbortCode::TYPE_MISMATCH)
                    }
                    Some(entry) => {
                        entry.value = DataType::decode(data);
                        SdoResponse::Download { index: *index, subindex: *subindex }
                    }
                }
            }
            SdoRequest::Abort { index, subindex, code } => {
                debug!("Node {} received abort {:04X}:{:02X} {}", self.node_id, index, subindex, code);
                return None;
            }
        };
        Some(response)
    }
}

fn abort(index: u16, subindex: u8, code: AbortCode) -> SdoResponse {
    SdoResponse::Abort { index, subindex, code }
}

#[derive(Debug, Default)]
struct BusState {
    nodes: BTreeMap<NodeId, SimulatedNode>,
    injector: Option<mpsc::UnboundedSender<CanFrame>>,
    resets: usize,
}

/// A single simulated CAN interface. Cloning shares the same bus.
#[derive(Debug, Clone)]
pub struct SimulatedBus {
    interface: InterfaceName,
    state: Arc<Mutex<BusState>>,
}

impl SimulatedBus {
    pub fn new(interface: &str) -> Result<Self, ChannelError> {
        Ok(Self {
            interface: parse_interface_name(interface)?,
            state: Arc::default(),
        })
    }

    #[must_use]
    pub fn with_node(self, node: SimulatedNode) -> Self {
        self.attach(node);
        self
    }

    /// Adds (or replaces) a node on the bus.
    pub fn attach(&self, node: SimulatedNode) {
        self.lock().nodes.insert(node.node_id, node);
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn is_open(&self) -> bool {
        self.lock().injector.is_some()
    }

    /// NMT reset-communication broadcasts seen so far.
    pub fn reset_count(&self) -> usize {
        self.lock().resets
    }

    pub fn object_value(&self, node_id: NodeId, index: u16, subindex: u8) -> Option<u32> {
        self.lock().nodes.get(&node_id).and_then(|n| n.value(index, subindex))
    }

    /// Puts a frame on the bus as if a node had sent it.
    pub fn inject(&self, frame: CanFrame) -> Result<(), ChannelError> {
        let state = self.lock();
        let injector = state.injector.as_ref().ok_or(ChannelError::Closed)?;
        injector.send(frame).map_err(|_| ChannelError::Closed)
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BusInterface for SimulatedBus {
    fn open(&self, name: &str) -> Result<CanChannel, ChannelError> {
        if name != self.interface.as_str() {
            return Err(ChannelError::NoSuchInterface(name.to_string()));
        }

        let mut state = self.lock();
        if state.injector.is_some() {
            return Err(ChannelError::AlreadyOpen(name.to_string()));
        }

        let (channel, peer) = CanChannel::pair(self.interface);
        state.injector = Some(peer.to_master.clone());
        drop(state);

        let bus = self.clone();
        std::thread::Builder::new()
            .name(format!("sim-{}", self.interface))
            .spawn(move || bus.respond(peer))
            .map_err(|e| {
                warn!("Failed to start bus responder: {}", e);
                self.lock().injector = None;
                ChannelError::Closed
            })?;

        info!("Simulated bus {} opened", self.interface);
        Ok(channel)
    }
}

impl SimulatedBus {
    /// Serves one open channel until the master drops it.
    fn respond(&self, mut peer: ChannelPeer) {
        while let Some(frame) = peer.from_master.blocking_recv() {
            for reply in self.replies(&frame) {
                if peer.to_master.send(reply).is_err() {
                    break;
                }
            }
        }
        self.lock().injector = None;
        debug!("Simulated bus {} closed", self.interface);
    }

    fn replies(&self, frame: &CanFrame) -> Vec<CanFrame> {
        let mut state = self.lock();

        if frame.id == FC_NMT {
            if frame.data.first() == Some(&NMT_RESET_COMMUNICATION) {
                state.resets += 1;
                let target = frame.data.get(1).copied().unwrap_or(0);
                return state
                    .nodes
                    .values()
                    .filter(|n| !n.silent && (target == 0 || target == n.node_id))
                    .filter_map(|n| CanFrame::new(cob_id(FC_HEARTBEAT, n.node_id), &[BOOT_UP]))
                    .collect();
            }
            return Vec::new();
        }

        match sdo::decode_request(frame) {
            Ok(Some((node_id, request))) => state
                .nodes
                .get_mut(&node_id)
                .and_then(|node| node.handle(&request))
                .map(|response| sdo::encode_response(node_id, &response))
                .into_iter()
                .collect(),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Malformed SDO request {:03X}: {}", frame.id, e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdo::SdoPayload;

    fn upload(index: u16, subindex: u8) -> SdoRequest {
        SdoRequest::Upload { index, subindex }
    }

    fn download(index: u16, subindex: u8, bytes: &[u8]) -> SdoRequest {
        SdoRequest::Download { index, subindex, data: SdoPayload::from_slice(bytes).unwrap() }
    }

    #[test]
    fn test_node_serves_object_dictionary() {
        let mut node = SimulatedNode::standard(5);
        assert_eq!(
            node.handle(&download(0x2000, 1, &42u32.to_le_bytes())),
            Some(SdoResponse::Download { index: 0x2000, subindex: 1 })
        );
        assert_eq!(node.value(0x2000, 1), Some(42));
        assert!(matches!(
            node.handle(&upload(0x2000, 1)),
            Some(SdoResponse::Upload { data, .. }) if data.as_slice() == [42, 0, 0, 0]
        ));
    }

    #[test]
    fn test_node_abort_codes() {
        let mut node = SimulatedNode::standard(5)
            .with_object(0x2100, 0, DataType::Unsigned8, Access::WriteOnly, 0);

        let code = |r: Option<SdoResponse>| match r {
            Some(SdoResponse::Abort { code, .. }) => Some(code),
            _ => None,
        };
        assert_eq!(code(node.handle(&upload(0x3000, 0))), Some(AbortCode::NO_OBJECT));
        assert_eq!(code(node.handle(&upload(0x2000, 9))), Some(AbortCode::NO_SUBINDEX));
        assert_eq!(code(node.handle(&upload(0x2100, 0))), Some(AbortCode::WRITE_ONLY));
        assert_eq!(code(node.handle(&download(0x1000, 0, &[0; 4]))), Some(AbortCode::READ_ONLY));
        assert_eq!(code(node.handle(&download(0x2000, 1, &[1, 2]))), Some(AbortCode::TYPE_MISMATCH));
    }

    #[test]
    fn test_silent_node_never_answers() {
        let mut node = SimulatedNode::standard(5).silent();
        assert_eq!(node.handle(&upload(0x2000, 1)), None);
    }

    #[test]
    fn test_open_checks_interface_name() {
        let bus = SimulatedBus::new("vcan0").unwrap();
        assert_eq!(
            bus.open("can1").err(),
            Some(ChannelError::NoSuchInterface("can1".to_string()))
        );

        let _channel = bus.open("vcan0").unwrap();
        assert_eq!(
            bus.open("vcan0").err(),
            Some(ChannelError::AlreadyOpen("vcan0".to_string()))
        );
    }

    #[test]
    fn test_reset_is_counted_and_answered_with_boot_up() {
        let bus = SimulatedBus::new("vcan0").unwrap().with_node(SimulatedNode::standard(5));
        let mut channel = bus.open("vcan0").unwrap();
        channel.send(CanFrame::new(FC_NMT, &[NMT_RESET_COMMUNICATION, 0]).unwrap()).unwrap();

        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let boot_up = rt.block_on(channel.recv()).unwrap();
        assert_eq!(boot_up.id, 0x705);
        assert_eq!(boot_up.data.as_slice(), &[BOOT_UP]);
        assert_eq!(bus.reset_count(), 1);
    }

    #[test]
    fn test_inject_requires_open_channel() {
        let bus = SimulatedBus::new("vcan0").unwrap();
        let frame = CanFrame::new(0x085, &[0; 8]).unwrap();
        assert_eq!(bus.inject(frame.clone()), Err(ChannelError::Closed));

        let mut channel = bus.open("vcan0").unwrap();
        bus.inject(frame.clone()).unwrap();
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        assert_eq!(rt.block_on(channel.recv()), Ok(frame));
    }
}
