//! # CANopen Master Bridge
//!
//! A CANopen master that owns one CAN bus channel and serves it from a
//! single dedicated event loop thread, together with a thread-safe posting
//! bridge that lets any other thread run work on that loop.
//!
//! ## Features
//!
//! - **Single-threaded bus ownership**: protocol state, the driver registry
//!   and the bus channel are only ever touched from the loop thread
//! - **Posting bridge**: fire-and-forget [`ExecutorHandle::post`], blocking
//!   [`ExecutorHandle::run_sync`] and async [`ExecutorHandle::run_async`]
//! - **Expedited SDO**: reads and writes of up to four bytes with timeouts
//!   and abort codes
//! - **Driver registry**: per-node drivers with init/remove hooks and bus
//!   frame callbacks
//! - **Two-stage shutdown**: first signal drains, second signal forces
//! - **JSON-lines service**: `<node_name>/sdo_read` and `<node_name>/sdo_write`
//!   over TCP
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use comaster::{DataType, DeviceConfig, MasterConfig, MasterInterface, MasterNode};
//! use comaster::sim::{SimulatedBus, SimulatedNode};
//!
//! let bus = SimulatedBus::new("vcan0").unwrap().with_node(SimulatedNode::standard(5));
//! let device = DeviceConfig::parse("[1F81sub5]\nDefaultValue=1\n", None).unwrap();
//! let master = MasterNode::with_device(&MasterConfig::new("master", "vcan0", 1), &device, &bus).unwrap();
//!
//! master.write_sdo(5, 0x2000, 1, DataType::Unsigned32, 42).unwrap();
//! assert_eq!(master.read_sdo(5, 0x2000, 1, DataType::Unsigned32).unwrap(), 42);
//! master.shutdown();
//! ```
//!
//! ## Architecture
//!
//! - [`runtime`] - Event loop thread and its lifecycle
//! - [`executor`] - Task posting and result slots
//! - [`bridge`] - Protocol session: configured nodes and SDO transfers
//! - [`registry`] - Subordinate drivers
//! - [`shutdown`] - Signal handling and the two-stage shutdown state machine
//! - [`master`] - Public master facade
//! - [`handlers`] / [`service`] - Exposed request handlers and their TCP transport
//! - [`sim`] - Simulated bus for tests and demos

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]

pub mod bridge;
pub mod channel;
pub mod config;
pub mod error;
pub mod executor;
pub mod frame;
pub mod handlers;
pub mod master;
pub mod registry;
pub mod runtime;
pub mod sdo;
pub mod service;
pub mod shutdown;
pub mod sim;

// Re-export main public types for convenience
pub use bridge::ProtocolBridge;
pub use channel::{BusInterface, CanChannel};
pub use config::{DeviceConfig, MasterConfig};
pub use error::{BridgeError, ChannelError, ConfigError, DriverError, MasterError, SdoError};
pub use executor::{ExecutorHandle, LocalFuture};
pub use frame::{CanFrame, DataType, NodeId};
pub use master::{MasterInterface, MasterNode};
pub use registry::Driver;
pub use runtime::LoopContext;
pub use shutdown::{ForcePolicy, ShutdownController, ShutdownState, TerminationSignal};

static_assertions::assert_impl_all!(ExecutorHandle: Send, Sync, Clone);
static_assertions::assert_impl_all!(ShutdownController: Send, Sync, Clone);
static_assertions::assert_impl_all!(MasterNode: Send, Sync);
static_assertions::assert_impl_all!(CanFrame: Send, Clone);
