use crate::frame::NodeId;
use crate::sdo::AbortCode;
use thiserror::Error;

/// Failures that make a master unusable. Raised only while constructing it.
#[derive(Debug, Error)]
pub enum MasterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Bus channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("Failed to build event loop runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("Failed to arm termination signal watcher: {0}")]
    Signals(#[source] std::io::Error),
    #[error("Event loop thread exited before it was ready")]
    LoopThread,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("DCF line {line}: {reason}")]
    Dcf { line: usize, reason: String },
    #[error("Concise DCF truncated at byte {0}")]
    ConciseTruncated(usize),
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("Invalid interface name '{0}'")]
    InvalidName(String),
    #[error("No such CAN interface '{0}'")]
    NoSuchInterface(String),
    #[error("Interface '{0}' is already open")]
    AlreadyOpen(String),
    #[error("Bus channel closed")]
    Closed,
}

/// Failures of the posting bridge itself, as opposed to failures of the
/// work that was posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("Event loop has stopped")]
    LoopStopped,
    #[error("Master is shutting down, new work is rejected")]
    ShuttingDown,
    #[error("Blocking post issued from the event loop thread would deadlock")]
    CalledFromLoopThread,
    #[error("Posted task panicked")]
    TaskPanicked,
    #[error("Posted task was abandoned before it completed")]
    Abandoned,
}

/// Per-operation SDO failures. None of these affect other operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SdoError {
    #[error("Node {0} is not configured on this master")]
    UnknownNode(NodeId),
    #[error("Unknown data type tag {0:#04x}")]
    UnknownDataType(u8),
    #[error("Value {value:#x} does not fit data type of {size} byte(s)")]
    ValueOutOfRange { value: u32, size: usize },
    #[error("Data type mismatch: expected {expected} byte(s), got {actual}")]
    TypeMismatch { expected: usize, actual: usize },
    #[error("SDO aborted by node {node}: {code}")]
    Abort { node: NodeId, code: AbortCode },
    #[error("SDO transfer to node {node} timed out after {timeout_ms} ms")]
    Timeout { node: NodeId, timeout_ms: u64 },
    #[error("SDO {0:04x}:{1:02x} is already in flight")]
    Busy(u16, u8),
    #[error("SDO protocol error: {0}")]
    Protocol(&'static str),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("Node {0} already has a driver attached")]
    AlreadyRegistered(NodeId),
    #[error("Node {0} has no driver attached")]
    NotRegistered(NodeId),
    #[error("Node {0} is attached to a different driver")]
    DriverMismatch(NodeId),
    #[error("Subordinate table full")]
    RegistryFull,
    #[error("Driver for node {node} failed: {reason}")]
    Failed { node: NodeId, reason: String },
    #[error(transparent)]
    Sdo(#[from] SdoError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}
