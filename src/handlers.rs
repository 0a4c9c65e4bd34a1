//! Request handlers for the exposed read/write operations.
//!
//! Failures never cross this boundary as errors: they are logged here and
//! reported as `success: false` in the response.

use crate::error::SdoError;
use crate::frame::{DataType, NodeId};
use crate::master::MasterInterface;
use serde::{Deserialize, Serialize};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub nodeid: NodeId,
    pub index: u16,
    pub subindex: u8,
    #[serde(rename = "type")]
    pub data_type: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadResponse {
    pub data: u32,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub nodeid: NodeId,
    pub index: u16,
    pub subindex: u8,
    #[serde(rename = "type")]
    pub data_type: u8,
    pub data: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WriteResponse {
    pub success: bool,
}

pub fn on_sdo_read<M: MasterInterface + ?Sized>(master: &M, request: &ReadRequest) -> ReadResponse {
    let Some(data_type) = DataType::from_tag(request.data_type) else {
        error!("sdo_read failed: {}", SdoError::UnknownDataType(request.data_type));
        return ReadResponse::default();
    };

    match master.read_sdo(request.nodeid, request.index, request.subindex, data_type) {
        Ok(data) => ReadResponse { data, success: true },
        Err(e) => {
            error!(
                "sdo_read {}:{:04X}:{:02X} failed: {}",
                request.nodeid, request.index, request.subindex, e
            );
            ReadResponse::default()
        }
    }
}

pub fn on_sdo_write<M: MasterInterface + ?Sized>(master: &M, request: &WriteRequest) -> WriteResponse {
    let Some(data_type) = DataType::from_tag(request.data_type) else {
        error!("sdo_write failed: {}", SdoError::UnknownDataType(request.data_type));
        return WriteResponse::default();
    };

    match master.write_sdo(request.nodeid, request.index, request.subindex, data_type, request.data) {
        Ok(()) => WriteResponse { success: true },
        Err(e) => {
            error!(
                "sdo_write {}:{:04X}:{:02X} = {:#x} failed: {}",
                request.nodeid, request.index, request.subindex, request.data, e
            );
            WriteResponse::default()
        }
    }
}
