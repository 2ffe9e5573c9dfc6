//! Internal plugins hosted directly by the bridge binary.
//!
//! These are real `PluginHandler` implementations selected with the
//! "Internal" plugin type: a plain stereo gain, and a probe used by the
//! bridge's own test suite that echoes MIDI and misbehaves on request.

use crate::handler::{PluginDescriptor, PluginHandler, PortSetup, ProcessIo};
use halcyon_bridge::param::BridgeParamInfo;
use halcyon_bridge::protocol::{param_hints, plugin_hints, PluginCategory, ProcessEvent,
                               TransportInfo};

fn gain_param(index: u32) -> BridgeParamInfo {
    BridgeParamInfo {
        index,
        rindex: index as i32,
        hints: param_hints::ENABLED | param_hints::AUTOMATABLE,
        min: 0.0,
        max: 2.0,
        def: 1.0,
        value: 1.0,
        name: "Gain".into(),
        symbol: "gain".into(),
        ..Default::default()
    }
}

/// Stereo gain. The simplest useful bridged plugin.
#[derive(Debug)]
pub struct GainPlugin {
    gain: f32,
    custom_data: Vec<(String, String, String)>,
    chunk: Option<Vec<u8>>,
}

impl GainPlugin {
    pub fn new() -> Self {
        Self { gain: 1.0, custom_data: vec![], chunk: None }
    }
}

impl Default for GainPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginHandler for GainPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            category: PluginCategory::Utility,
            hints: plugin_hints::USES_CHUNKS,
            unique_id: 0x48434147, // "HGAG"
            real_name: "Halcyon Gain".into(),
            label: "gain".into(),
            maker: "Halcyon".into(),
            copyright: "ISC".into(),
            ..Default::default()
        }
    }

    fn ports(&self) -> PortSetup {
        PortSetup::stereo()
    }

    fn parameters(&self) -> Vec<BridgeParamInfo> {
        vec![gain_param(0)]
    }

    fn parameter_value(&self, _index: u32) -> f32 {
        self.gain
    }

    fn set_parameter_value(&mut self, _index: u32, value: f32) -> f32 {
        self.gain = value.clamp(0.0, 2.0);
        self.gain
    }

    fn set_custom_data(&mut self, data_type: &str, key: &str, value: &str) {
        self.custom_data
            .retain(|(t, k, _)| !(t == data_type && k == key));
        self.custom_data
            .push((data_type.into(), key.into(), value.into()));
    }

    fn custom_data(&self) -> Vec<(String, String, String)> {
        self.custom_data.clone()
    }

    fn set_chunk(&mut self, data: &[u8]) {
        self.chunk = Some(data.to_vec());
    }

    fn chunk(&self) -> Option<Vec<u8>> {
        self.chunk.clone()
    }

    fn process(&mut self, io: &mut ProcessIo<'_, '_>, _transport: &TransportInfo) {
        for event in io.events {
            if let ProcessEvent::Parameter { index, value, .. } = *event {
                self.set_parameter_value(index as u32, value);
            }
        }
        for (input, output) in io.audio_in.iter().zip(io.audio_out.iter_mut()) {
            for (o, i) in output.iter_mut().zip(input.iter()) {
                *o = i * self.gain;
            }
        }
    }
}

/// Custom-data namespace the probe reacts to.
pub const PROBE_NS: &str = "urn:halcyon:probe";
/// Sleep this many ms inside the next process cycle.
pub const PROBE_KEY_STALL: &str = "stall-ms";
/// Exit the child process immediately with the given code.
pub const PROBE_KEY_EXIT: &str = "exit-code";

/// Test probe: stereo gain + MIDI echo, with remote-controlled misbehaviour
/// so the host-side suite can exercise timeouts and crashes on a real
/// child process.
#[derive(Debug)]
pub struct ProbePlugin {
    params: [f32; 2],
    stall_ms: u64,
    custom_data: Vec<(String, String, String)>,
    chunk: Option<Vec<u8>>,
}

impl ProbePlugin {
    pub fn new() -> Self {
        Self { params: [1.0, 0.5], stall_ms: 0, custom_data: vec![], chunk: None }
    }

    fn clamp(index: u32, value: f32) -> f32 {
        match index {
            0 => value.clamp(0.0, 2.0),
            _ => value.clamp(0.0, 1.0),
        }
    }
}

impl Default for ProbePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginHandler for ProbePlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            category: PluginCategory::Utility,
            hints: plugin_hints::USES_CHUNKS,
            unique_id: 0x48435052, // "HCPR"
            real_name: "Halcyon Probe".into(),
            label: "probe".into(),
            maker: "Halcyon".into(),
            copyright: "ISC".into(),
            ..Default::default()
        }
    }

    fn ports(&self) -> PortSetup {
        let mut ports = PortSetup::stereo();
        ports.midi_in = vec!["Events In".into()];
        ports.midi_out = vec!["Events Out".into()];
        ports
    }

    fn parameters(&self) -> Vec<BridgeParamInfo> {
        let mut mix = BridgeParamInfo {
            index: 1,
            rindex: 1,
            hints: param_hints::ENABLED | param_hints::AUTOMATABLE,
            min: 0.0,
            max: 1.0,
            def: 0.5,
            value: 0.5,
            name: "Mix".into(),
            symbol: "mix".into(),
            ..Default::default()
        };
        mix.sanitize_ranges();
        vec![gain_param(0), mix]
    }

    fn parameter_value(&self, index: u32) -> f32 {
        self.params.get(index as usize).copied().unwrap_or(0.0)
    }

    fn set_parameter_value(&mut self, index: u32, value: f32) -> f32 {
        let clamped = Self::clamp(index, value);
        if let Some(slot) = self.params.get_mut(index as usize) {
            *slot = clamped;
        }
        clamped
    }

    fn parameter_text(&self, index: u32) -> String {
        format!("{:.2}", self.parameter_value(index))
    }

    fn set_custom_data(&mut self, data_type: &str, key: &str, value: &str) {
        if data_type == PROBE_NS {
            match key {
                PROBE_KEY_STALL => {
                    self.stall_ms = value.parse().unwrap_or(0);
                    return;
                }
                PROBE_KEY_EXIT => {
                    let code = value.parse().unwrap_or(1);
                    tracing::warn!(code, "probe asked to exit");
                    std::process::exit(code);
                }
                _ => {}
            }
        }
        self.custom_data
            .retain(|(t, k, _)| !(t == data_type && k == key));
        self.custom_data
            .push((data_type.into(), key.into(), value.into()));
    }

    fn custom_data(&self) -> Vec<(String, String, String)> {
        self.custom_data.clone()
    }

    fn set_chunk(&mut self, data: &[u8]) {
        self.chunk = Some(data.to_vec());
    }

    fn chunk(&self) -> Option<Vec<u8>> {
        self.chunk.clone()
    }

    fn process(&mut self, io: &mut ProcessIo<'_, '_>, _transport: &TransportInfo) {
        if self.stall_ms > 0 {
            let ms = std::mem::take(&mut self.stall_ms);
            std::thread::sleep(std::time::Duration::from_millis(ms));
        }

        for event in io.events {
            match *event {
                ProcessEvent::Parameter { index, value, .. } => {
                    self.set_parameter_value(index as u32, value);
                }
                ProcessEvent::Midi(midi) => {
                    // Echo straight back out, same frame.
                    io.midi_out.push(crate::handler::MidiOutEvent {
                        time: midi.time,
                        port: 0,
                        data: midi.bytes().iter().copied().collect(),
                    });
                }
                _ => {}
            }
        }

        let gain = self.params[0];
        for (input, output) in io.audio_in.iter().zip(io.audio_out.iter_mut()) {
            for (o, i) in output.iter_mut().zip(input.iter()) {
                *o = i * gain;
            }
        }
    }
}
