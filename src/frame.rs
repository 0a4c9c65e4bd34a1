use heapless::Vec;
use serde::{Deserialize, Serialize};

pub const MAX_FRAME_DATA: usize = 8;
pub const MIN_NODE_ID: NodeId = 1;
pub const MAX_NODE_ID: NodeId = 127;

// CANopen function codes (upper 4 bits of an 11-bit COB-ID)
pub const FC_NMT: u16 = 0x000;
pub const FC_EMCY: u16 = 0x080;
pub const FC_SDO_TX: u16 = 0x580;
pub const FC_SDO_RX: u16 = 0x600;
pub const FC_HEARTBEAT: u16 = 0x700;

pub type NodeId = u8;
pub type FrameData = Vec<u8, MAX_FRAME_DATA>;

pub fn is_valid_node_id(node_id: NodeId) -> bool {
    (MIN_NODE_ID..=MAX_NODE_ID).contains(&node_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u16,
    pub data: FrameData,
}

impl CanFrame {
    /// Returns `None` when the payload exceeds a classic CAN frame.
    pub fn new(id: u16, data: &[u8]) -> Option<Self> {
        Some(Self {
            id: id & 0x7FF,
            data: Vec::from_slice(data).ok()?,
        })
    }

    pub fn function_code(&self) -> u16 {
        self.id & 0x780
    }

    /// Node encoded in the COB-ID, `None` for broadcast objects.
    pub fn node_id(&self) -> Option<NodeId> {
        let node = (self.id & 0x7F) as NodeId;
        is_valid_node_id(node).then_some(node)
    }
}

pub fn cob_id(function_code: u16, node_id: NodeId) -> u16 {
    function_code | u16::from(node_id & 0x7F)
}

/// Basic data types of the object dictionary, tagged with their
/// CiA 301 data type index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    Boolean = 0x01,
    Integer8 = 0x02,
    Integer16 = 0x03,
    Integer32 = 0x04,
    Unsigned8 = 0x05,
    Unsigned16 = 0x06,
    Unsigned32 = 0x07,
}

impl DataType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::Boolean),
            0x02 => Some(Self::Integer8),
            0x03 => Some(Self::Integer16),
            0x04 => Some(Self::Integer32),
            0x05 => Some(Self::Unsigned8),
            0x06 => Some(Self::Unsigned16),
            0x07 => Some(Self::Unsigned32),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Encoded size in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::Boolean | Self::Integer8 | Self::Unsigned8 => 1,
            Self::Integer16 | Self::Unsigned16 => 2,
            Self::Integer32 | Self::Unsigned32 => 4,
        }
    }

    /// Whether a raw value is representable in this type's width.
    pub fn fits(self, value: u32) -> bool {
        match self {
            Self::Boolean => value <= 1,
            _ => self.size() == 4 || value >> (self.size() * 8) == 0,
        }
    }

    pub fn encode(self, value: u32) -> Vec<u8, 4> {
        let bytes = value.to_le_bytes();
        let mut out = Vec::new();
        // size() is at most 4
        let _ = out.extend_from_slice(&bytes[..self.size()]);
        out
    }

    pub fn decode(data: &[u8]) -> u32 {
        let mut bytes = [0u8; 4];
        let len = data.len().min(4);
        bytes[..len].copy_from_slice(&data[..len]);
        u32::from_le_bytes(bytes)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Boolean => "BOOLEAN",
            Self::Integer8 => "INTEGER8",
            Self::Integer16 => "INTEGER16",
            Self::Integer32 => "INTEGER32",
            Self::Unsigned8 => "UNSIGNED8",
            Self::Unsigned16 => "UNSIGNED16",
            Self::Unsigned32 => "UNSIGNED32",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_rejects_oversized_payload() {
        assert!(CanFrame::new(0x605, &[0; 8]).is_some());
        assert!(CanFrame::new(0x605, &[0; 9]).is_none());
    }

    #[test]
    fn test_cob_id_decoding() {
        let frame = CanFrame::new(cob_id(FC_HEARTBEAT, 5), &[0x05]).unwrap();
        assert_eq!(frame.function_code(), FC_HEARTBEAT);
        assert_eq!(frame.node_id(), Some(5));

        let nmt = CanFrame::new(FC_NMT, &[0x82, 0x00]).unwrap();
        assert_eq!(nmt.node_id(), None);
    }

    #[test]
    fn test_data_type_width_checks() {
        assert!(DataType::Unsigned8.fits(0xFF));
        assert!(!DataType::Unsigned8.fits(0x100));
        assert!(DataType::Unsigned16.fits(0xFFFF));
        assert!(!DataType::Unsigned16.fits(0x1_0000));
        assert!(DataType::Unsigned32.fits(u32::MAX));
        assert!(!DataType::Boolean.fits(2));
    }

    #[test]
    fn test_data_type_encoding_is_little_endian() {
        assert_eq!(DataType::Unsigned16.encode(0x1234).as_slice(), &[0x34, 0x12]);
        assert_eq!(DataType::decode(&[0x2A, 0x00, 0x00, 0x00]), 42);
        assert_eq!(DataType::decode(&[0xFF]), 0xFF);
    }

    #[test]
    fn test_unknown_tag() {
        assert_eq!(DataType::from_tag(0x07), Some(DataType::Unsigned32));
        assert_eq!(DataType::from_tag(0x20), None);
    }
}
