//! The seam between the bridge event loop and a plugin format wrapper.
//!
//! Every format wrapper (LV2, VST2, ...) lives in the child process and
//! implements `PluginHandler`; the bridge event loop is format-agnostic and
//! only talks through this trait.

use halcyon_bridge::param::BridgeParamInfo;
use halcyon_bridge::protocol::{PluginCategory, ProcessEvent, TransportInfo};
use smallvec::SmallVec;

/// Static plugin facts reported to the host during the descriptor burst.
#[derive(Debug, Clone, Default)]
pub struct PluginDescriptor {
    pub category: PluginCategory,
    pub hints: u32,
    pub options_available: u32,
    pub options_enabled: u32,
    pub unique_id: i64,
    pub real_name: String,
    pub label: String,
    pub maker: String,
    pub copyright: String,
}

/// Port lists in server order; the index of a name is its port index within
/// its class.
#[derive(Debug, Clone, Default)]
pub struct PortSetup {
    pub audio_in: Vec<String>,
    pub audio_out: Vec<String>,
    pub cv_in: Vec<String>,
    pub cv_out: Vec<String>,
    pub midi_in: Vec<String>,
    pub midi_out: Vec<String>,
}

impl PortSetup {
    pub fn stereo() -> Self {
        Self {
            audio_in: vec!["Input L".into(), "Input R".into()],
            audio_out: vec!["Output L".into(), "Output R".into()],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiProgramSpec {
    pub bank: u32,
    pub program: u32,
    pub name: String,
}

/// One MIDI event produced by the plugin during a cycle. Payloads are
/// stack-first; anything that fits the RT scratch record limit is legal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiOutEvent {
    pub time: u32,
    pub port: u8,
    pub data: SmallVec<[u8; 8]>,
}

/// Everything one process cycle sees. Audio and CV slices point straight
/// into the shared pool; writing an output sample is writing host memory.
pub struct ProcessIo<'a, 'b> {
    pub audio_in: &'a [&'b [f32]],
    pub audio_out: &'a mut [&'b mut [f32]],
    pub cv_in: &'a [&'b [f32]],
    pub cv_out: &'a mut [&'b mut [f32]],
    /// Host events for this cycle, in delivery order.
    pub events: &'a [ProcessEvent],
    /// Collector for the plugin's MIDI output.
    pub midi_out: &'a mut Vec<MidiOutEvent>,
    pub frames: u32,
}

/// Asynchronous notifications a wrapper wants delivered to the host, drained
/// from the non-RT loop (and, for `ParameterStream`, opportunistically from
/// the RT path).
#[derive(Debug, Clone, PartialEq)]
pub enum PluginEvent {
    /// Authoritative value change; fires host callbacks.
    ParameterChanged { index: u32, value: f32 },
    /// Streaming value update (e.g. output parameters); droppable.
    ParameterStream { index: u32, value: f32 },
    DefaultChanged { index: u32, value: f32 },
    Touched { index: u32, touched: bool },
    ProgramChanged(i32),
    MidiProgramChanged(i32),
    LatencyChanged(u32),
    UiClosed,
    UiResized { width: u32, height: u32 },
    Error(String),
}

/// Implemented by per-format wrappers. Only `descriptor`, `ports`,
/// `set_parameter_value`, `parameter_value` and `process` are mandatory;
/// everything else defaults to "feature not present".
#[allow(unused_variables)]
pub trait PluginHandler: Send + std::fmt::Debug {
    fn descriptor(&self) -> PluginDescriptor;

    fn ports(&self) -> PortSetup;

    fn parameters(&self) -> Vec<BridgeParamInfo> {
        vec![]
    }

    fn parameter_value(&self, index: u32) -> f32;

    /// Apply a value and return what was actually set; the wrapper clamps
    /// regardless of what the host sent.
    fn set_parameter_value(&mut self, index: u32, value: f32) -> f32;

    fn parameter_text(&self, index: u32) -> String {
        format!("{}", self.parameter_value(index))
    }

    fn set_parameter_midi_channel(&mut self, index: u32, channel: u8) {}

    fn set_parameter_mapped_control_index(&mut self, index: u32, control: i16) {}

    fn set_parameter_mapped_range(&mut self, index: u32, min: f32, max: f32) {}

    fn programs(&self) -> Vec<String> {
        vec![]
    }

    fn midi_programs(&self) -> Vec<MidiProgramSpec> {
        vec![]
    }

    fn latency(&self) -> u32 {
        0
    }

    fn activate(&mut self) {}

    fn deactivate(&mut self) {}

    fn set_program(&mut self, index: i32) {}

    fn set_midi_program(&mut self, index: i32) {}

    fn set_custom_data(&mut self, data_type: &str, key: &str, value: &str) {}

    /// Current custom data as (type, key, value), pushed to the host during
    /// a save.
    fn custom_data(&self) -> Vec<(String, String, String)> {
        vec![]
    }

    fn set_chunk(&mut self, data: &[u8]) {}

    fn chunk(&self) -> Option<Vec<u8>> {
        None
    }

    fn restore_lv2_state(&mut self) {}

    fn sample_rate_changed(&mut self, rate: f64) {}

    fn buffer_size_changed(&mut self, frames: u32) {}

    fn offline_changed(&mut self, offline: bool) {}

    fn option_changed(&mut self, option: u32, yes: bool) {}

    fn options_changed(&mut self, options: u32) {}

    fn ctrl_channel_changed(&mut self, channel: i16) {}

    /// Run one cycle. Called from the bridge RT thread while it holds the
    /// rendezvous baton.
    fn process(&mut self, io: &mut ProcessIo<'_, '_>, transport: &TransportInfo);

    fn show_ui(&mut self) {}

    fn hide_ui(&mut self) {}

    /// Embed the UI into a host window; returns the plugin-side handle.
    fn embed_ui(&mut self, parent: u64) -> Option<u64> {
        None
    }

    fn set_window_title(&mut self, title: &str) {}

    fn ui_idle(&mut self) {}

    /// Drain pending notifications for the host.
    fn drain_events(&mut self) -> Vec<PluginEvent> {
        vec![]
    }

    /// Polled after each cycle; a true return asks the host to deactivate.
    fn wants_deactivate(&self) -> bool {
        false
    }
}
