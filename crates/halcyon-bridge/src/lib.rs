//! Out-of-process plugin hosting for Halcyon.
//!
//! Runs one untrusted or ABI-incompatible plugin inside a separate child
//! process and presents it to the engine as if it were loaded in-process.
//! Host and child talk exclusively through four shared-memory regions: an
//! audio pool, a small real-time ring driven by a semaphore rendezvous, and
//! two large non-real-time rings for the stateful control protocol.
//!
//! This crate is the host ("server") side plus everything both sides share:
//! the transport primitives and the wire protocol. The child side lives in
//! `halcyon-bridge-client`, which also builds the `halcyon-bridge` binary.
//!
//! # Example
//!
//! ```ignore
//! use halcyon_bridge::{BridgeConfig, NullCallbacks, PluginType, ServerBridge};
//! use std::sync::Arc;
//!
//! let config = BridgeConfig::new("halcyon-bridge".into(), PluginType::Lv2, "urn:some:plugin");
//! let mut bridge = ServerBridge::new(config, Arc::new(NullCallbacks))?;
//! bridge.wait_ready()?;
//! bridge.activate()?;
//! ```

pub mod error;
pub use error::{BridgeError, Result};

pub mod protocol;
pub use protocol::{
    BridgeTimeInfo, MidiEvent, PluginType, PortType, ParameterType, ProcessEvent, TransportBbt,
    TransportInfo, PLUGIN_BRIDGE_API_VERSION_CURRENT, PLUGIN_BRIDGE_API_VERSION_MINIMUM,
};

pub mod shm;
pub use shm::ShmRegion;

pub mod ring;

pub mod sem;

pub mod pool;
pub use pool::AudioPool;

pub mod rt_channel;
pub use rt_channel::RtClientControl;

pub mod nonrt_channel;
pub use nonrt_channel::{NonRtClientControl, NonRtServerControl};

pub mod files;

pub mod param;
pub use param::{BridgeParamInfo, ParamCatalog};

pub mod server;
pub use server::{
    BridgeConfig, BridgeState, CustomData, HostCallbacks, MidiProgram, NullCallbacks,
    PluginInfoData, PortCounts, SavedState, ServerBridge, SharedBridge,
};

pub mod supervisor;
pub use supervisor::{ProcessSupervisor, SpawnSpec, WineOptions};
