//! Expedited SDO framing (CiA 301).
//!
//! Only expedited transfers (payload of at most four bytes) are supported.
//! Requests travel on `0x600 + node`, responses on `0x580 + node`.

use crate::error::SdoError;
use crate::frame::{cob_id, CanFrame, NodeId, FC_SDO_RX, FC_SDO_TX};
use heapless::Vec;
use serde::{Deserialize, Serialize};

const CS_DOWNLOAD_INITIATE: u8 = 0x20;
const CS_DOWNLOAD_RESPONSE: u8 = 0x60;
const CS_UPLOAD_INITIATE: u8 = 0x40;
const CS_ABORT: u8 = 0x80;

const FLAG_EXPEDITED: u8 = 0x02;
const FLAG_SIZE_INDICATED: u8 = 0x01;

pub type SdoPayload = Vec<u8, 4>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortCode(pub u32);

impl AbortCode {
    pub const TOGGLE_BIT: AbortCode = AbortCode(0x0503_0000);
    pub const TIMEOUT: AbortCode = AbortCode(0x0504_0000);
    pub const INVALID_COMMAND: AbortCode = AbortCode(0x0504_0001);
    pub const WRITE_ONLY: AbortCode = AbortCode(0x0601_0001);
    pub const READ_ONLY: AbortCode = AbortCode(0x0601_0002);
    pub const NO_OBJECT: AbortCode = AbortCode(0x0602_0000);
    pub const TYPE_MISMATCH: AbortCode = AbortCode(0x0607_0010);
    pub const NO_SUBINDEX: AbortCode = AbortCode(0x0609_0011);
    pub const VALUE_RANGE: AbortCode = AbortCode(0x0609_0030);
    pub const GENERAL: AbortCode = AbortCode(0x0800_0000);

    pub fn description(self) -> &'static str {
        match self {
            Self::TOGGLE_BIT => "Toggle bit not altered",
            Self::TIMEOUT => "SDO protocol timed out",
            Self::INVALID_COMMAND => "Client/server command specifier not valid or unknown",
            Self::WRITE_ONLY => "Attempt to read a write only object",
            Self::READ_ONLY => "Attempt to write a read only object",
            Self::NO_OBJECT => "Object does not exist in the object dictionary",
            Self::TYPE_MISMATCH => "Data type does not match, length of service parameter does not match",
            Self::NO_SUBINDEX => "Sub-index does not exist",
            Self::VALUE_RANGE => "Invalid value for parameter",
            Self::GENERAL => "General error",
            _ => "Unknown abort code",
        }
    }
}

impl core::fmt::Display for AbortCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:08X} ({})", self.0, self.description())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdoRequest {
    Upload { index: u16, subindex: u8 },
    Download { index: u16, subindex: u8, data: SdoPayload },
    Abort { index: u16, subindex: u8, code: AbortCode },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdoResponse {
    Upload { index: u16, subindex: u8, data: SdoPayload },
    Download { index: u16, subindex: u8 },
    Abort { index: u16, subindex: u8, code: AbortCode },
}

impl SdoResponse {
    pub fn address(&self) -> (u16, u8) {
        match *self {
            SdoResponse::Upload { index, subindex, .. }
            | SdoResponse::Download { index, subindex }
            | SdoResponse::Abort { index, subindex, .. } => (index, subindex),
        }
    }
}

fn header(command: u8, index: u16, subindex: u8) -> [u8; 8] {
    let [lo, hi] = index.to_le_bytes();
    [command, lo, hi, subindex, 0, 0, 0, 0]
}

fn expedited(base: u8, len: usize) -> u8 {
    // n = number of bytes in data that do not contain data
    let unused = (4 - len.min(4)) as u8;
    base | (unused << 2) | FLAG_EXPEDITED | FLAG_SIZE_INDICATED
}

fn with_payload(mut bytes: [u8; 8], payload: &[u8]) -> [u8; 8] {
    bytes[4..4 + payload.len()].copy_from_slice(payload);
    bytes
}

fn split(frame: &CanFrame) -> Result<(u8, u16, u8, &[u8]), SdoError> {
    if frame.data.len() != 8 {
        return Err(SdoError::Protocol("SDO frame must carry 8 bytes"));
    }
    let data = &frame.data;
    Ok((data[0], u16::from_le_bytes([data[1], data[2]]), data[3], &data[4..8]))
}

fn expedited_payload(command: u8, body: &[u8]) -> Result<SdoPayload, SdoError> {
    if command & FLAG_EXPEDITED == 0 {
        return Err(SdoError::Protocol("segmented transfer not supported"));
    }
    let len = if command & FLAG_SIZE_INDICATED != 0 {
        4 - usize::from((command >> 2) & 0x03)
    } else {
        4
    };
    Vec::from_slice(&body[..len]).map_err(|()| SdoError::Protocol("payload overflow"))
}

fn frame(function_code: u16, node: NodeId, bytes: [u8; 8]) -> CanFrame {
    CanFrame {
        id: cob_id(function_code, node),
        data: Vec::from_slice(&bytes).unwrap_or_default(),
    }
}

pub fn encode_request(node: NodeId, request: &SdoRequest) -> CanFrame {
    let bytes = match request {
        SdoRequest::Upload { index, subindex } => header(CS_UPLOAD_INITIATE, *index, *subindex),
        SdoRequest::Download { index, subindex, data } => with_payload(
            header(expedited(CS_DOWNLOAD_INITIATE, data.len()), *index, *subindex),
            data,
        ),
        SdoRequest::Abort { index, subindex, code } => {
            with_payload(header(CS_ABORT, *index, *subindex), &code.0.to_le_bytes())
        }
    };
    frame(FC_SDO_RX, node, bytes)
}

pub fn encode_response(node: NodeId, response: &SdoResponse) -> CanFrame {
    let bytes = match response {
        SdoResponse::Upload { index, subindex, data } => with_payload(
            header(expedited(CS_UPLOAD_INITIATE, data.len()), *index, *subindex),
            data,
        ),
        SdoResponse::Download { index, subindex } => header(CS_DOWNLOAD_RESPONSE, *index, *subindex),
        SdoResponse::Abort { index, subindex, code } => {
            with_payload(header(CS_ABORT, *index, *subindex), &code.0.to_le_bytes())
        }
    };
    frame(FC_SDO_TX, node, bytes)
}

/// Decodes a client request addressed to a server node. Returns `Ok(None)`
/// for frames that are not SDO requests.
pub fn decode_request(frame: &CanFrame) -> Result<Option<(NodeId, SdoRequest)>, SdoError> {
    let Some(node) = frame.node_id().filter(|_| frame.function_code() == FC_SDO_RX) else {
        return Ok(None);
    };
    let (command, index, subindex, body) = split(frame)?;

    let request = match command & 0xE0 {
        CS_UPLOAD_INITIATE => SdoRequest::Upload { index, subindex },
        CS_DOWNLOAD_INITIATE => SdoRequest::Download {
            index,
            subindex,
            data: expedited_payload(command, body)?,
        },
        CS_ABORT => SdoRequest::Abort {
            index,
            subindex,
            code: AbortCode(u32::from_le_bytes([body[0], body[1], body[2], body[3]])),
        },
        _ => return Err(SdoError::Protocol("unknown client command specifier")),
    };
    Ok(Some((node, request)))
}

/// Decodes a server response. Returns `Ok(None)` for frames that are not
/// SDO responses.
pub fn decode_response(frame: &CanFrame) -> Result<Option<(NodeId, SdoResponse)>, SdoError> {
    let Some(node) = frame.node_id().filter(|_| frame.function_code() == FC_SDO_TX) else {
        return Ok(None);
    };
    let (command, index, subindex, body) = split(frame)?;

    let response = match command & 0xE0 {
        CS_UPLOAD_INITIATE => SdoResponse::Upload {
            index,
            subindex,
            data: expedited_payload(command, body)?,
        },
        CS_DOWNLOAD_RESPONSE => SdoResponse::Download { index, subindex },
        CS_ABORT => SdoResponse::Abort {
            index,
            subindex,
            code: AbortCode(u32::from_le_bytes([body[0], body[1], body[2], body[3]])),
        },
        _ => return Err(SdoError::Protocol("unknown server command specifier")),
    };
    Ok(Some((node, response)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_request_layout() {
        let frame = encode_request(5, &SdoRequest::Upload { index: 0x2000, subindex: 1 });
        assert_eq!(frame.id, 0x605);
        assert_eq!(frame.data.as_slice(), &[0x40, 0x00, 0x20, 0x01, 0, 0, 0, 0]);
    }

    #[test]
    fn test_expedited_download_command_specifier() {
        let data = SdoPayload::from_slice(&42u32.to_le_bytes()).unwrap();
        let frame = encode_request(5, &SdoRequest::Download { index: 0x2000, subindex: 1, data });
        assert_eq!(frame.data[0], 0x23);
        assert_eq!(&frame.data[4..8], &[42, 0, 0, 0]);

        let data = SdoPayload::from_slice(&[7]).unwrap();
        let frame = encode_request(5, &SdoRequest::Download { index: 0x2000, subindex: 2, data });
        assert_eq!(frame.data[0], 0x2F);
    }

    #[test]
    fn test_upload_response_size_is_recovered() {
        let data = SdoPayload::from_slice(&[0x34, 0x12]).unwrap();
        let frame = encode_response(9, &SdoResponse::Upload { index: 0x1017, subindex: 0, data });
        assert_eq!(frame.id, 0x589);
        assert_eq!(frame.data[0], 0x4B);

        let (node, response) = decode_response(&frame).unwrap().unwrap();
        assert_eq!(node, 9);
        match response {
            SdoResponse::Upload { data, .. } => assert_eq!(data.as_slice(), &[0x34, 0x12]),
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_abort_carries_code() {
        let frame = encode_response(
            3,
            &SdoResponse::Abort { index: 0x6000, subindex: 0, code: AbortCode::NO_OBJECT },
        );
        let (_, response) = decode_response(&frame).unwrap().unwrap();
        assert_eq!(
            response,
            SdoResponse::Abort { index: 0x6000, subindex: 0, code: AbortCode::NO_OBJECT }
        );
    }

    #[test]
    fn test_non_sdo_frames_are_ignored() {
        let heartbeat = CanFrame::new(0x705, &[0x05]).unwrap();
        assert_eq!(decode_response(&heartbeat), Ok(None));
        assert_eq!(decode_request(&heartbeat), Ok(None));
    }

    #[test]
    fn test_segmented_response_is_rejected() {
        let frame = CanFrame::new(0x585, &[0x41, 0x08, 0x10, 0x00, 0x20, 0, 0, 0]).unwrap();
        assert!(matches!(decode_response(&frame), Err(SdoError::Protocol(_))));
    }

    #[test]
    fn test_short_frame_is_protocol_error() {
        let frame = CanFrame::new(0x585, &[0x60, 0x00, 0x20]).unwrap();
        assert!(decode_response(&frame).is_err());
    }
}
