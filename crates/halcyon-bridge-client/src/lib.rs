//! Child-process side of the Halcyon plugin bridge.
//!
//! The host spawns the `halcyon-bridge` binary, which attaches to the four
//! shared-memory regions named in `ENGINE_BRIDGE_SHM_IDS`, wraps one plugin
//! behind the [`PluginHandler`] seam and serves the bridge protocol until
//! told to quit. Format wrappers (LV2, VST, ...) implement `PluginHandler`;
//! this crate ships two internal ones used by the binary's "Internal" type
//! and the test suite.

pub mod handler;
pub use handler::{
    MidiOutEvent, MidiProgramSpec, PluginDescriptor, PluginEvent, PluginHandler, PortSetup,
    ProcessIo,
};

pub mod ports;
pub use ports::CycleEvents;

pub mod client;
pub use client::{ClientBridge, StopHandle};

pub mod builtin;
pub use builtin::{GainPlugin, ProbePlugin};

pub mod signals;

pub mod registry;
pub use registry::create_handler;
