//! Host-side bridge: owns the four shared regions, the child process and
//! the plugin's mirrored state.
//!
//! Lifecycle: `Spawning` (regions created, handshake written, child
//! launched) -> `WaitingReady` (descriptor burst arriving) -> `Running`
//! (cycles + idle traffic) -> `Closing` -> `Dead`. A rendezvous timeout
//! overlays `TimedOut` on `Running`: the cycle outputs silence and idle gets
//! one chance to recover the baton; a second consecutive timeout is
//! terminal.
//!
//! Threading: the host engine calls `process` from its audio thread and
//! everything else from its idle thread. `SharedBridge` packages the
//! required discipline - the audio thread only ever try-locks and falls
//! back to silence, it never blocks.

use crate::error::{BridgeError, Result};
use crate::files;
use crate::nonrt_channel::{NonRtClientControl, NonRtData, NonRtServerControl};
use crate::param::{BridgeParamInfo, ParamCatalog};
use crate::pool::AudioPool;
use crate::protocol::*;
use crate::rt_channel::{RtClientControl, RtClientData, PROC_FLAG_WANTS_DEACTIVATE};
use crate::supervisor::{ProcessSupervisor, SpawnSpec, WineOptions};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

const IDLE_PING_INTERVAL: Duration = Duration::from_secs(1);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(25);
const RESIZE_POOL_TIMEOUT: Duration = Duration::from_secs(5);
const FIRST_CYCLE_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSING_FLUSH_TIMEOUT: Duration = Duration::from_secs(3);
const PARAMETER_TEXT_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Path to the bridge child executable.
    pub binary: PathBuf,
    pub plugin_type: PluginType,
    /// Plugin file on disk; empty for formats without one.
    pub filename: PathBuf,
    /// Opaque sub-entity selector for the wrapper.
    pub label: String,
    pub unique_id: i64,
    pub buffer_size: u32,
    pub sample_rate: f64,
    /// How long to wait for the child's `Ready`.
    pub init_timeout: Duration,
    /// Per-cycle rendezvous budget.
    pub rt_timeout: Duration,
    /// Extra `ENGINE_OPTION_*` environment for the child.
    pub engine_options: Vec<(String, String)>,
    pub wine: WineOptions,
}

impl BridgeConfig {
    pub fn new(binary: PathBuf, plugin_type: PluginType, label: &str) -> Self {
        Self {
            binary,
            plugin_type,
            filename: PathBuf::new(),
            label: label.to_string(),
            unique_id: 0,
            buffer_size: 512,
            sample_rate: 48000.0,
            init_timeout: Duration::from_secs(15),
            rt_timeout: Duration::from_secs(1),
            engine_options: vec![],
            wine: WineOptions::default(),
        }
    }
}

/// Host-side notifications fired from `idle` (and `midi_out` from the
/// process path). All default to no-ops so hosts implement what they need.
#[allow(unused_variables)]
pub trait HostCallbacks: Send + Sync {
    fn parameter_value_changed(&self, index: u32, value: f32) {}
    fn parameter_default_changed(&self, index: u32, value: f32) {}
    fn parameter_touched(&self, index: u32, touched: bool) {}
    fn program_changed(&self, index: i32) {}
    fn midi_program_changed(&self, index: i32) {}
    fn latency_changed(&self, frames: u32) {}
    /// One MIDI output record from the plugin, fired on the audio thread.
    fn midi_out(&self, time: u32, port: u8, data: &[u8]) {}
    fn ui_closed(&self) {}
    fn ui_embedded(&self, handle: u64) {}
    fn ui_resized(&self, width: u32, height: u32) {}
    fn error(&self, message: &str) {}
}

/// For hosts that poll instead of listening.
pub struct NullCallbacks;

impl HostCallbacks for NullCallbacks {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Spawning,
    WaitingReady,
    Running,
    Closing,
    Dead,
}

impl BridgeState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::WaitingReady => "waiting-ready",
            Self::Running => "running",
            Self::Closing => "closing",
            Self::Dead => "dead",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PluginInfoData {
    pub category: u32,
    pub hints: u32,
    pub options_available: u32,
    pub options_enabled: u32,
    pub unique_id: i64,
    pub real_name: String,
    pub label: String,
    pub maker: String,
    pub copyright: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PortCounts {
    pub audio_in: u32,
    pub audio_out: u32,
    pub midi_in: u32,
    pub midi_out: u32,
    pub cv_in: u32,
    pub cv_out: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomData {
    pub data_type: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiProgram {
    pub bank: u32,
    pub program: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SavedState {
    pub custom_data: Vec<CustomData>,
    pub chunk: Option<Vec<u8>>,
}

pub struct ServerBridge {
    config: BridgeConfig,
    callbacks: Arc<dyn HostCallbacks>,

    pool: AudioPool,
    rt: RtClientControl,
    nonrt_client: NonRtClientControl,
    nonrt_server: NonRtServerControl,
    supervisor: Option<ProcessSupervisor>,

    state: BridgeState,
    timed_out: bool,
    timed_error: bool,
    consecutive_timeouts: u32,
    first_cycle: bool,
    needs_deactivate: bool,

    client_version: u32,
    ready: bool,
    saved: bool,
    pending_error: Option<String>,

    info: PluginInfoData,
    counts: PortCounts,
    port_names: Vec<(PortType, u32, String)>,
    params: Mutex<ParamCatalog>,
    programs: Vec<String>,
    midi_programs: Vec<(MidiProgram, String)>,
    current_program: i32,
    current_midi_program: i32,
    latency: u32,
    custom_data: Vec<CustomData>,
    chunk: Option<Vec<u8>>,
    parameter_text: Option<(i32, String)>,

    last_ping: Instant,
}

impl std::fmt::Debug for ServerBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBridge")
            .field("state", &self.state)
            .field("client_version", &self.client_version)
            .field("ready", &self.ready)
            .finish()
    }
}

impl ServerBridge {
    /// Create the shared regions, write the handshake and launch the child.
    /// The bridge is `WaitingReady` on return; call `wait_ready` next.
    pub fn new(config: BridgeConfig, callbacks: Arc<dyn HostCallbacks>) -> Result<Self> {
        let pool = AudioPool::create()?;
        let rt = RtClientControl::init_server()?;
        let nonrt_client = NonRtClientControl::init_server()?;
        let nonrt_server = NonRtServerControl::init_server()?;

        // Handshake goes into the ring before the child exists; it reads it
        // as its first act after attaching.
        nonrt_client.write_opcode(NonRtClientOpcode::Version);
        nonrt_client.ring().write_u32(PLUGIN_BRIDGE_API_VERSION_CURRENT);
        nonrt_client.ring().write_u32(std::mem::size_of::<RtClientData>() as u32);
        nonrt_client.ring().write_u32(std::mem::size_of::<NonRtData>() as u32);
        nonrt_client.ring().write_u32(std::mem::size_of::<NonRtData>() as u32);
        nonrt_client.write_opcode(NonRtClientOpcode::InitialSetup);
        nonrt_client.ring().write_u32(config.buffer_size);
        nonrt_client.ring().write_f64(config.sample_rate);
        if !nonrt_client.commit_write() {
            return Err(BridgeError::Handshake("handshake did not fit the ring".into()));
        }

        let shm_ids = format!(
            "{}{}{}{}",
            pool.suffix(),
            rt.suffix(),
            nonrt_client.suffix(),
            nonrt_server.suffix()
        );
        debug_assert_eq!(shm_ids.len(), 4 * SHM_SUFFIX_LEN);

        let supervisor = ProcessSupervisor::spawn(&SpawnSpec {
            binary: config.binary.clone(),
            plugin_type: config.plugin_type,
            filename: config.filename.clone(),
            label: config.label.clone(),
            unique_id: config.unique_id,
            shm_ids,
            engine_options: config.engine_options.clone(),
            wine: config.wine.clone(),
        })?;

        tracing::debug!(label = %config.label, "bridge child spawned, waiting for ready");

        Ok(Self {
            config,
            callbacks,
            pool,
            rt,
            nonrt_client,
            nonrt_server,
            supervisor: Some(supervisor),
            state: BridgeState::WaitingReady,
            timed_out: false,
            timed_error: false,
            consecutive_timeouts: 0,
            first_cycle: true,
            needs_deactivate: false,
            client_version: 0,
            ready: false,
            saved: false,
            pending_error: None,
            info: PluginInfoData::default(),
            counts: PortCounts::default(),
            port_names: vec![],
            params: Mutex::new(ParamCatalog::default()),
            programs: vec![],
            midi_programs: vec![],
            current_program: -1,
            current_midi_program: -1,
            latency: 0,
            custom_data: vec![],
            chunk: None,
            parameter_text: None,
            last_ping: Instant::now(),
        })
    }

    /// Pump the non-RT channel until the child reports `Ready`, then size
    /// the audio pool for the reported ports and enter `Running`.
    pub fn wait_ready(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.config.init_timeout;
        while !self.ready {
            self.idle();
            if let Some(message) = self.pending_error.take() {
                self.state = BridgeState::Dead;
                if let Some(mismatch) = self.version_mismatch_error() {
                    return Err(mismatch);
                }
                return Err(BridgeError::Handshake(message));
            }
            if self.state == BridgeState::Dead {
                return Err(BridgeError::ProcessCrash(self.display_name()));
            }
            if Instant::now() >= deadline {
                self.close();
                return Err(BridgeError::InitTimeout(self.config.init_timeout.as_secs()));
            }
            std::thread::sleep(READY_POLL_INTERVAL);
        }

        self.resize_audio_pool(self.config.buffer_size)?;
        self.state = BridgeState::Running;
        tracing::debug!(name = %self.display_name(), "bridge running");
        Ok(())
    }

    fn version_mismatch_error(&self) -> Option<BridgeError> {
        (self.client_version != 0
            && !(PLUGIN_BRIDGE_API_VERSION_MINIMUM..=PLUGIN_BRIDGE_API_VERSION_CURRENT)
                .contains(&self.client_version))
        .then(|| BridgeError::VersionMismatch {
            host: PLUGIN_BRIDGE_API_VERSION_CURRENT,
            client: self.client_version,
        })
    }

    // -- accessors ----------------------------------------------------------

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == BridgeState::Running && !self.timed_error
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn client_version(&self) -> u32 {
        self.client_version
    }

    pub fn info(&self) -> &PluginInfoData {
        &self.info
    }

    pub fn counts(&self) -> PortCounts {
        self.counts
    }

    pub fn latency(&self) -> u32 {
        self.latency
    }

    pub fn port_names(&self) -> &[(PortType, u32, String)] {
        &self.port_names
    }

    pub fn parameter_count(&self) -> u32 {
        self.params.lock().len() as u32
    }

    pub fn parameter_info(&self, index: u32) -> Option<BridgeParamInfo> {
        self.params.lock().get(index).cloned()
    }

    pub fn parameter_value(&self, index: u32) -> Option<f32> {
        self.params.lock().get(index).map(|p| p.value)
    }

    pub fn program_names(&self) -> &[String] {
        &self.programs
    }

    pub fn midi_programs(&self) -> &[(MidiProgram, String)] {
        &self.midi_programs
    }

    pub fn current_program(&self) -> i32 {
        self.current_program
    }

    pub fn current_midi_program(&self) -> i32 {
        self.current_midi_program
    }

    pub fn custom_data_value(&self, data_type: &str, key: &str) -> Option<&str> {
        self.custom_data
            .iter()
            .find(|cd| cd.data_type == data_type && cd.key == key)
            .map(|cd| cd.value.as_str())
    }

    pub fn chunk_data(&self) -> Option<&[u8]> {
        self.chunk.as_deref()
    }

    fn display_name(&self) -> String {
        if self.info.real_name.is_empty() {
            self.config.label.clone()
        } else {
            self.info.real_name.clone()
        }
    }

    fn ensure_sendable(&self) -> Result<()> {
        if self.timed_error
            || !matches!(self.state, BridgeState::Running | BridgeState::WaitingReady)
        {
            return Err(BridgeError::NotRunning(self.state.as_str()));
        }
        Ok(())
    }

    // -- audio cycle --------------------------------------------------------

    /// Run one audio cycle. `inputs` covers audio-in then CV-in channels,
    /// `outputs` audio-out then CV-out, each slice `frames` long. Events are
    /// delivered to the plugin in order. On any failure the outputs are
    /// exactly `frames` zero samples per channel.
    pub fn process(
        &mut self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        frames: u32,
        events: &[ProcessEvent],
        transport: &TransportInfo,
    ) {
        if self.state != BridgeState::Running || self.timed_error || self.timed_out {
            silence(outputs, frames);
            return;
        }

        // The parameter cache is shared with the idle thread; never block
        // the audio thread on it.
        let Some(catalog) = self.params.try_lock() else {
            silence(outputs, frames);
            return;
        };

        for (i, input) in inputs.iter().enumerate() {
            let _ = self.pool.write_channel(self.input_pool_channel(i), frames as usize, input);
        }

        self.rt.set_time_info(&BridgeTimeInfo::from(transport));

        for event in events {
            self.write_event(&catalog, event);
        }
        drop(catalog);

        self.rt.write_opcode(RtClientOpcode::Process);
        self.rt.ring().write_u32(frames);
        if !self.rt.commit_write() {
            tracing::warn!("RT ring full, dropping cycle");
            silence(outputs, frames);
            return;
        }

        let budget = if self.first_cycle { FIRST_CYCLE_TIMEOUT } else { self.config.rt_timeout };
        if !self.rt.wait_for_client(budget) {
            self.note_rt_timeout("process");
            silence(outputs, frames);
            return;
        }

        self.first_cycle = false;
        self.consecutive_timeouts = 0;

        for (i, output) in outputs.iter_mut().enumerate() {
            let copied = self
                .pool
                .read_channel_into(self.output_pool_channel(i), frames as usize, output)
                .unwrap_or(0);
            let n = (frames as usize).min(output.len());
            output[copied.min(n)..n].fill(0.0);
        }

        let callbacks = Arc::clone(&self.callbacks);
        self.rt.for_each_midi_out(|time, port, data| callbacks.midi_out(time, port, data));

        if self.rt.take_proc_flags() & PROC_FLAG_WANTS_DEACTIVATE != 0 {
            self.needs_deactivate = true;
        }
    }

    fn input_pool_channel(&self, index: usize) -> usize {
        let audio_in = self.counts.audio_in as usize;
        if index < audio_in {
            index
        } else {
            // CV-in channels sit after both audio banks.
            self.counts.audio_out as usize + index
        }
    }

    fn output_pool_channel(&self, index: usize) -> usize {
        let audio_in = self.counts.audio_in as usize;
        let audio_out = self.counts.audio_out as usize;
        let cv_in = self.counts.cv_in as usize;
        if index < audio_out {
            audio_in + index
        } else {
            audio_in + audio_out + cv_in + (index - audio_out)
        }
    }

    fn write_event(&self, catalog: &ParamCatalog, event: &ProcessEvent) {
        let ring = self.rt.ring();
        match *event {
            ProcessEvent::Parameter { time, channel, index, value } => {
                self.rt.write_opcode(RtClientOpcode::ControlEventParameter);
                ring.write_u32(time);
                ring.write_u8(channel);
                ring.write_u16(index);
                ring.write_f32(catalog.clamp_value(index as u32, value));
            }
            ProcessEvent::MidiBank { time, channel, bank } => {
                self.rt.write_opcode(RtClientOpcode::ControlEventMidiBank);
                ring.write_u32(time);
                ring.write_u8(channel);
                ring.write_u16(bank);
            }
            ProcessEvent::MidiProgram { time, channel, program } => {
                self.rt.write_opcode(RtClientOpcode::ControlEventMidiProgram);
                ring.write_u32(time);
                ring.write_u8(channel);
                ring.write_u16(program);
            }
            ProcessEvent::AllSoundOff { time, channel } => {
                self.rt.write_opcode(RtClientOpcode::ControlEventAllSoundOff);
                ring.write_u32(time);
                ring.write_u8(channel);
            }
            ProcessEvent::AllNotesOff { time, channel } => {
                self.rt.write_opcode(RtClientOpcode::ControlEventAllNotesOff);
                ring.write_u32(time);
                ring.write_u8(channel);
            }
            ProcessEvent::Midi(midi) => {
                if midi.size as usize <= RT_MAX_MIDI_EVENT_SIZE && midi.size > 0 {
                    self.rt.write_opcode(RtClientOpcode::MidiEvent);
                    ring.write_u32(midi.time);
                    ring.write_u8(midi.port);
                    ring.write_u8(midi.size);
                    ring.try_write(midi.bytes());
                }
            }
        }
    }

    fn note_rt_timeout(&mut self, action: &'static str) {
        self.consecutive_timeouts += 1;
        self.timed_out = true;
        if self.consecutive_timeouts >= 2 {
            self.timed_error = true;
            tracing::error!(name = %self.display_name(), action,
                            "rendezvous timed out twice, bridge is lost");
        } else {
            tracing::error!(name = %self.display_name(), action, "rendezvous timed out");
        }
    }

    // -- buffer/sample-rate/pool management ---------------------------------

    fn resize_audio_pool(&mut self, buffer_frames: u32) -> Result<()> {
        let audio = self.counts.audio_in + self.counts.audio_out;
        let cv = self.counts.cv_in + self.counts.cv_out;
        let bytes = self.pool.resize(buffer_frames, audio, cv)?;

        self.rt.write_opcode(RtClientOpcode::SetAudioPool);
        self.rt.ring().write_u64(bytes);
        if !self.rt.commit_write() {
            return Err(BridgeError::PayloadOversize { opcode: "SetAudioPool", needed: 12 });
        }
        if !self.rt.wait_for_client(RESIZE_POOL_TIMEOUT) {
            return Err(BridgeError::RtTimeout("resize-pool"));
        }
        Ok(())
    }

    /// Host buffer-size change. Serialised with the engine's own hook, never
    /// concurrent with `process`.
    pub fn set_buffer_size(&mut self, frames: u32) -> Result<()> {
        self.ensure_sendable()?;
        self.config.buffer_size = frames;
        self.resize_audio_pool(frames)?;

        self.rt.write_opcode(RtClientOpcode::SetBufferSize);
        self.rt.ring().write_u32(frames);
        self.rt.commit_write();
        if !self.rt.wait_for_client(FIRST_CYCLE_TIMEOUT) {
            self.note_rt_timeout("buffer-size");
            return Err(BridgeError::RtTimeout("buffer-size"));
        }
        self.first_cycle = true;
        Ok(())
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) -> Result<()> {
        self.ensure_sendable()?;
        self.config.sample_rate = sample_rate;
        self.rt.write_opcode(RtClientOpcode::SetSampleRate);
        self.rt.ring().write_f64(sample_rate);
        self.rt.commit_write();
        if !self.rt.wait_for_client(FIRST_CYCLE_TIMEOUT) {
            self.note_rt_timeout("sample-rate");
            return Err(BridgeError::RtTimeout("sample-rate"));
        }
        self.first_cycle = true;
        Ok(())
    }

    pub fn set_offline(&mut self, offline: bool) -> Result<()> {
        self.ensure_sendable()?;
        self.rt.write_opcode(RtClientOpcode::SetOnline);
        self.rt.ring().write_bool(offline);
        self.rt.commit_write();
        if !self.rt.wait_for_client(FIRST_CYCLE_TIMEOUT) {
            self.note_rt_timeout("offline");
            return Err(BridgeError::RtTimeout("offline"));
        }
        Ok(())
    }

    // -- non-RT commands ----------------------------------------------------

    pub fn activate(&mut self) -> Result<()> {
        self.send_plain(NonRtClientOpcode::Activate)
    }

    pub fn deactivate(&mut self) -> Result<()> {
        self.send_plain(NonRtClientOpcode::Deactivate)
    }

    fn send_plain(&mut self, opcode: NonRtClientOpcode) -> Result<()> {
        self.ensure_sendable()?;
        self.nonrt_client.write_opcode(opcode);
        self.nonrt_client.commit_write();
        Ok(())
    }

    /// Clamped server-side as a courtesy; the child re-clamps regardless.
    pub fn set_parameter_value(&mut self, index: u32, value: f32) -> Result<f32> {
        self.ensure_sendable()?;
        let clamped = {
            let mut params = self.params.lock();
            let clamped = params.clamp_value(index, value);
            if let Some(param) = params.get_mut(index) {
                param.value = clamped;
            }
            clamped
        };
        self.nonrt_client.write_opcode(NonRtClientOpcode::SetParameterValue);
        self.nonrt_client.ring().write_u32(index);
        self.nonrt_client.ring().write_f32(clamped);
        self.nonrt_client.commit_write();
        Ok(clamped)
    }

    pub fn set_parameter_midi_channel(&mut self, index: u32, channel: u8) -> Result<()> {
        self.ensure_sendable()?;
        if let Some(param) = self.params.lock().get_mut(index) {
            param.midi_channel = channel;
        }
        self.nonrt_client.write_opcode(NonRtClientOpcode::SetParameterMidiChannel);
        self.nonrt_client.ring().write_u32(index);
        self.nonrt_client.ring().write_u8(channel);
        self.nonrt_client.commit_write();
        Ok(())
    }

    pub fn set_parameter_mapped_control_index(&mut self, index: u32, control: i16) -> Result<()> {
        self.ensure_sendable()?;
        if let Some(param) = self.params.lock().get_mut(index) {
            param.mapped_control_index = control;
        }
        self.nonrt_client.write_opcode(NonRtClientOpcode::SetParameterMappedControlIndex);
        self.nonrt_client.ring().write_u32(index);
        self.nonrt_client.ring().write_i16(control);
        self.nonrt_client.commit_write();
        Ok(())
    }

    pub fn set_parameter_mapped_range(&mut self, index: u32, min: f32, max: f32) -> Result<()> {
        self.ensure_sendable()?;
        if self.client_version < MIN_API_VERSION_MAPPED_RANGE {
            tracing::warn!(
                client = self.client_version,
                "client too old for mapped parameter ranges, ignoring"
            );
            return Ok(());
        }
        if let Some(param) = self.params.lock().get_mut(index) {
            param.mapped_min = min;
            param.mapped_max = max;
        }
        self.nonrt_client.write_opcode(NonRtClientOpcode::SetParameterMappedRange);
        self.nonrt_client.ring().write_u32(index);
        self.nonrt_client.ring().write_f32(min);
        self.nonrt_client.ring().write_f32(max);
        self.nonrt_client.commit_write();
        Ok(())
    }

    pub fn set_program(&mut self, index: i32) -> Result<()> {
        self.ensure_sendable()?;
        self.current_program = index;
        self.nonrt_client.write_opcode(NonRtClientOpcode::SetProgram);
        self.nonrt_client.ring().write_i32(index);
        self.nonrt_client.commit_write();
        Ok(())
    }

    pub fn set_midi_program(&mut self, index: i32) -> Result<()> {
        self.ensure_sendable()?;
        self.current_midi_program = index;
        self.nonrt_client.write_opcode(NonRtClientOpcode::SetMidiProgram);
        self.nonrt_client.ring().write_i32(index);
        self.nonrt_client.commit_write();
        Ok(())
    }

    pub fn set_ctrl_channel(&mut self, channel: i16) -> Result<()> {
        self.ensure_sendable()?;
        self.nonrt_client.write_opcode(NonRtClientOpcode::SetCtrlChannel);
        self.nonrt_client.ring().write_i16(channel);
        self.nonrt_client.commit_write();
        Ok(())
    }

    pub fn set_option(&mut self, option: u32, yes: bool) -> Result<()> {
        self.ensure_sendable()?;
        self.nonrt_client.write_opcode(NonRtClientOpcode::SetOption);
        self.nonrt_client.ring().write_u32(option);
        self.nonrt_client.ring().write_bool(yes);
        self.nonrt_client.commit_write();
        Ok(())
    }

    pub fn set_options(&mut self, options: u32) -> Result<()> {
        self.ensure_sendable()?;
        self.nonrt_client.write_opcode(NonRtClientOpcode::SetOptions);
        self.nonrt_client.ring().write_u32(options);
        self.nonrt_client.commit_write();
        Ok(())
    }

    fn big_value_limit(&self) -> usize {
        if self.client_version >= MIN_API_VERSION_SMALL_BIG_VALUE {
            BIG_VALUE_LIMIT
        } else {
            BIG_VALUE_LIMIT_LEGACY
        }
    }

    /// Values above the per-version limit travel via temp file; a failed
    /// file write is reported, not swallowed.
    pub fn set_custom_data(&mut self, data_type: &str, key: &str, value: &str) -> Result<()> {
        self.ensure_sendable()?;
        self.nonrt_client.wait_if_data_is_reaching_limit();

        let via_file = value.len() > self.big_value_limit();
        let wire_value = if via_file {
            files::write_custom_data_file(self.pool.suffix(), value)?
                .display()
                .to_string()
        } else {
            value.to_string()
        };

        self.nonrt_client.write_opcode(NonRtClientOpcode::SetCustomData);
        self.nonrt_client.ring().write_string(data_type);
        self.nonrt_client.ring().write_string(key);
        self.nonrt_client.ring().write_bool(via_file);
        self.nonrt_client.ring().write_string(&wire_value);
        if !self.nonrt_client.commit_write() {
            return Err(BridgeError::PayloadOversize {
                opcode: "SetCustomData",
                needed: data_type.len() + key.len() + wire_value.len(),
            });
        }

        self.remember_custom_data(data_type, key, value);
        Ok(())
    }

    fn remember_custom_data(&mut self, data_type: &str, key: &str, value: &str) {
        if let Some(existing) = self
            .custom_data
            .iter_mut()
            .find(|cd| cd.data_type == data_type && cd.key == key)
        {
            existing.value = value.to_string();
        } else {
            self.custom_data.push(CustomData {
                data_type: data_type.to_string(),
                key: key.to_string(),
                value: value.to_string(),
            });
        }
    }

    /// Chunks always travel via temp file, base64-encoded.
    pub fn set_chunk_data(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_sendable()?;
        let path = files::write_chunk_file(self.pool.suffix(), data)?;
        self.nonrt_client.write_opcode(NonRtClientOpcode::SetChunkDataFile);
        self.nonrt_client.ring().write_string(&path.display().to_string());
        self.nonrt_client.commit_write();
        self.chunk = Some(data.to_vec());
        Ok(())
    }

    pub fn restore_lv2_state(&mut self) -> Result<()> {
        self.send_plain(NonRtClientOpcode::RestoreLv2State)
    }

    pub fn set_ping_enabled(&mut self, enabled: bool) -> Result<()> {
        self.ensure_sendable()?;
        self.nonrt_client.write_opcode(NonRtClientOpcode::PingOnOff);
        self.nonrt_client.ring().write_bool(enabled);
        self.nonrt_client.commit_write();
        Ok(())
    }

    // -- UI -----------------------------------------------------------------

    pub fn show_ui(&mut self) -> Result<()> {
        self.send_plain(NonRtClientOpcode::ShowUi)
    }

    pub fn hide_ui(&mut self) -> Result<()> {
        self.send_plain(NonRtClientOpcode::HideUi)
    }

    pub fn embed_ui(&mut self, parent: u64) -> Result<()> {
        self.ensure_sendable()?;
        if self.client_version < MIN_API_VERSION_EMBED_UI {
            return Err(BridgeError::InvalidArgument(format!(
                "client api {} cannot embed UIs",
                self.client_version
            )));
        }
        self.nonrt_client.write_opcode(NonRtClientOpcode::EmbedUi);
        self.nonrt_client.ring().write_u64(parent);
        self.nonrt_client.commit_write();
        Ok(())
    }

    pub fn set_window_title(&mut self, title: &str) -> Result<()> {
        self.ensure_sendable()?;
        if self.client_version < MIN_API_VERSION_WINDOW_TITLE {
            return Ok(());
        }
        self.nonrt_client.write_opcode(NonRtClientOpcode::SetWindowTitle);
        self.nonrt_client.ring().write_string(clamp_str(title, MAX_LABEL_LEN));
        self.nonrt_client.commit_write();
        Ok(())
    }

    pub fn ui_parameter_change(&mut self, index: u32, value: f32) -> Result<()> {
        self.ensure_sendable()?;
        self.nonrt_client.write_opcode(NonRtClientOpcode::UiParameterChange);
        self.nonrt_client.ring().write_u32(index);
        self.nonrt_client.ring().write_f32(value);
        self.nonrt_client.commit_write();
        Ok(())
    }

    pub fn ui_program_change(&mut self, index: u32) -> Result<()> {
        self.ensure_sendable()?;
        self.nonrt_client.write_opcode(NonRtClientOpcode::UiProgramChange);
        self.nonrt_client.ring().write_u32(index);
        self.nonrt_client.commit_write();
        Ok(())
    }

    pub fn ui_midi_program_change(&mut self, index: u32) -> Result<()> {
        self.ensure_sendable()?;
        self.nonrt_client.write_opcode(NonRtClientOpcode::UiMidiProgramChange);
        self.nonrt_client.ring().write_u32(index);
        self.nonrt_client.commit_write();
        Ok(())
    }

    pub fn ui_note_on(&mut self, channel: u8, note: u8, velocity: u8) -> Result<()> {
        self.ensure_sendable()?;
        self.nonrt_client.write_opcode(NonRtClientOpcode::UiNoteOn);
        self.nonrt_client.ring().write_u8(channel);
        self.nonrt_client.ring().write_u8(note);
        self.nonrt_client.ring().write_u8(velocity);
        self.nonrt_client.commit_write();
        Ok(())
    }

    pub fn ui_note_off(&mut self, channel: u8, note: u8) -> Result<()> {
        self.ensure_sendable()?;
        self.nonrt_client.write_opcode(NonRtClientOpcode::UiNoteOff);
        self.nonrt_client.ring().write_u8(channel);
        self.nonrt_client.ring().write_u8(note);
        self.nonrt_client.commit_write();
        Ok(())
    }

    // -- request/response ---------------------------------------------------

    /// Ask the child to render a parameter as text and block (polling the
    /// idle path) until the reply lands or the wait budget runs out.
    pub fn get_parameter_text(&mut self, index: i32) -> Result<String> {
        self.ensure_sendable()?;
        self.parameter_text = None;
        self.nonrt_client.write_opcode(NonRtClientOpcode::GetParameterText);
        self.nonrt_client.ring().write_i32(index);
        self.nonrt_client.commit_write();

        let deadline = Instant::now() + PARAMETER_TEXT_TIMEOUT;
        loop {
            self.idle();
            if let Some((got_index, text)) = self.parameter_text.take() {
                if got_index == index {
                    return Ok(text);
                }
            }
            if Instant::now() >= deadline {
                return Err(BridgeError::RtTimeout("get-parameter-text"));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Trigger the save burst and collect its result. Refused once the
    /// bridge is dead or timed out for good - the state would be stale.
    pub fn save_state(&mut self, timeout: Duration) -> Result<SavedState> {
        if self.state != BridgeState::Running || self.timed_error {
            return Err(BridgeError::NotRunning(self.state.as_str()));
        }
        self.saved = false;
        self.send_plain(NonRtClientOpcode::PrepareForSave)?;

        let deadline = Instant::now() + timeout;
        while !self.saved {
            self.idle();
            if self.state != BridgeState::Running {
                return Err(BridgeError::ProcessCrash(self.display_name()));
            }
            if Instant::now() >= deadline {
                return Err(BridgeError::RtTimeout("prepare-for-save"));
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        Ok(SavedState { custom_data: self.custom_data.clone(), chunk: self.chunk.clone() })
    }

    // -- idle path ----------------------------------------------------------

    /// Drive the non-RT side: child liveness, pings, timeout recovery and
    /// the response/event drain. Called from the host's idle thread.
    pub fn idle(&mut self) {
        if let Some(supervisor) = &self.supervisor {
            if !supervisor.is_running()
                && matches!(self.state, BridgeState::WaitingReady | BridgeState::Running)
            {
                let exit_code = supervisor.exit_code().unwrap_or(-1);
                if self.state == BridgeState::Running {
                    self.callbacks.error(&format!(
                        "plugin '{}' bridge process exited unexpectedly (code {exit_code})",
                        self.display_name()
                    ));
                } else if self.pending_error.is_none() {
                    self.pending_error =
                        Some(format!("bridge process exited during startup (code {exit_code})"));
                }
                self.state = BridgeState::Dead;
            }
        }

        if self.state == BridgeState::Running {
            if self.last_ping.elapsed() >= IDLE_PING_INTERVAL {
                self.nonrt_client.write_opcode(NonRtClientOpcode::Ping);
                self.nonrt_client.commit_write();
                self.last_ping = Instant::now();
            }

            // One recovery attempt after a stalled cycle: the client may
            // have finished late and posted after we gave up.
            if self.timed_out && !self.timed_error
                && self.rt.wait_client_only(Duration::from_millis(1))
            {
                tracing::warn!(name = %self.display_name(), "late cycle completed, recovering");
                self.timed_out = false;
            }

            if self.needs_deactivate {
                self.needs_deactivate = false;
                let _ = self.deactivate();
            }
        }

        while self.nonrt_server.is_data_available_for_reading() {
            if let Err(e) = self.dispatch_server_message() {
                self.callbacks.error(&format!(
                    "plugin '{}' broke the bridge protocol: {e}",
                    self.display_name()
                ));
                self.state = BridgeState::Dead;
                if let Some(mut supervisor) = self.supervisor.take() {
                    supervisor.kill();
                }
                break;
            }
        }
    }

    fn dispatch_server_message(&mut self) -> Result<()> {
        let ring = *self.nonrt_server.ring();
        let opcode = self
            .nonrt_server
            .read_opcode()?
            .ok_or_else(|| BridgeError::ProtocolDesync("unknown opcode".into()))?;

        match opcode {
            NonRtServerOpcode::Null | NonRtServerOpcode::Pong => {}

            NonRtServerOpcode::Version => {
                self.client_version = ring.read_u32()?;
                if self.version_mismatch_error().is_some() {
                    self.pending_error = Some(format!(
                        "client speaks api {}, host needs {}..={}",
                        self.client_version,
                        PLUGIN_BRIDGE_API_VERSION_MINIMUM,
                        PLUGIN_BRIDGE_API_VERSION_CURRENT
                    ));
                }
            }

            NonRtServerOpcode::PluginInfo1 => {
                self.info.category = ring.read_u32()?;
                self.info.hints = ring.read_u32()?;
                self.info.options_available = ring.read_u32()?;
                self.info.options_enabled = ring.read_u32()?;
                self.info.unique_id = ring.read_i64()?;
            }

            NonRtServerOpcode::PluginInfo2 => {
                self.info.real_name = ring.read_string()?;
                self.info.label = ring.read_string()?;
                self.info.maker = ring.read_string()?;
                self.info.copyright = ring.read_string()?;
            }

            NonRtServerOpcode::AudioCount => {
                self.counts.audio_in = ring.read_u32()?;
                self.counts.audio_out = ring.read_u32()?;
            }
            NonRtServerOpcode::MidiCount => {
                self.counts.midi_in = ring.read_u32()?;
                self.counts.midi_out = ring.read_u32()?;
            }
            NonRtServerOpcode::CvCount => {
                self.counts.cv_in = ring.read_u32()?;
                self.counts.cv_out = ring.read_u32()?;
            }

            NonRtServerOpcode::PortName => {
                let port_type = PortType::from_u8(ring.read_u8()?)
                    .ok_or_else(|| BridgeError::ProtocolDesync("bad port type".into()))?;
                let index = ring.read_u32()?;
                let name = ring.read_string()?;
                self.port_names.push((port_type, index, name));
            }

            NonRtServerOpcode::ParameterCount => {
                let count = ring.read_u32()?;
                self.params.lock().reset(count);
            }

            NonRtServerOpcode::ParameterData1 => {
                let index = ring.read_u32()?;
                let rindex = ring.read_i32()?;
                let param_type = ParameterType::from_u32(ring.read_u32()?)
                    .ok_or_else(|| BridgeError::ProtocolDesync("bad parameter type".into()))?;
                let hints = ring.read_u32()?;
                let midi_channel = ring.read_u8()?;
                let mapped_control_index = ring.read_i16()?;
                if let Some(param) = self.params.lock().get_mut(index) {
                    param.rindex = rindex;
                    param.param_type = param_type;
                    param.hints = hints;
                    param.midi_channel = midi_channel;
                    param.mapped_control_index = mapped_control_index;
                }
            }

            NonRtServerOpcode::ParameterData2 => {
                let index = ring.read_u32()?;
                let name = ring.read_string()?;
                let symbol = ring.read_string()?;
                let unit = ring.read_string()?;
                if let Some(param) = self.params.lock().get_mut(index) {
                    param.name = name;
                    param.symbol = symbol;
                    param.unit = unit;
                }
            }

            NonRtServerOpcode::ParameterRanges => {
                let index = ring.read_u32()?;
                let def = ring.read_f32()?;
                let min = ring.read_f32()?;
                let max = ring.read_f32()?;
                let step = ring.read_f32()?;
                let step_small = ring.read_f32()?;
                let step_large = ring.read_f32()?;
                if let Some(param) = self.params.lock().get_mut(index) {
                    param.def = def;
                    param.min = min;
                    param.max = max;
                    param.step = step;
                    param.step_small = step_small;
                    param.step_large = step_large;
                    param.sanitize_ranges();
                }
            }

            NonRtServerOpcode::ParameterValue => {
                let index = ring.read_u32()?;
                let value = ring.read_f32()?;
                let clamped = {
                    let mut params = self.params.lock();
                    let clamped = params.clamp_value(index, value);
                    if let Some(param) = params.get_mut(index) {
                        param.value = clamped;
                    }
                    clamped
                };
                self.callbacks.parameter_value_changed(index, clamped);
            }

            NonRtServerOpcode::ParameterValue2 => {
                // Informational only: update the mirror, no callback.
                let index = ring.read_u32()?;
                let value = ring.read_f32()?;
                let mut params = self.params.lock();
                let clamped = params.clamp_value(index, value);
                if let Some(param) = params.get_mut(index) {
                    param.value = clamped;
                }
            }

            NonRtServerOpcode::DefaultValue => {
                let index = ring.read_u32()?;
                let value = ring.read_f32()?;
                if let Some(param) = self.params.lock().get_mut(index) {
                    param.def = value;
                }
                self.callbacks.parameter_default_changed(index, value);
            }

            NonRtServerOpcode::ParameterTouch => {
                let index = ring.read_u32()?;
                let touched = ring.read_bool()?;
                self.callbacks.parameter_touched(index, touched);
            }

            NonRtServerOpcode::ProgramCount => {
                let count = ring.read_u32()?;
                self.programs = vec![String::new(); count as usize];
            }

            NonRtServerOpcode::ProgramName => {
                let index = ring.read_u32()? as usize;
                let name = ring.read_string()?;
                if let Some(slot) = self.programs.get_mut(index) {
                    *slot = name;
                }
            }

            NonRtServerOpcode::MidiProgramCount => {
                let count = ring.read_u32()?;
                self.midi_programs =
                    vec![(MidiProgram { bank: 0, program: 0 }, String::new()); count as usize];
            }

            NonRtServerOpcode::MidiProgramData => {
                let index = ring.read_u32()? as usize;
                let bank = ring.read_u32()?;
                let program = ring.read_u32()?;
                let name = ring.read_string()?;
                if let Some(slot) = self.midi_programs.get_mut(index) {
                    *slot = (MidiProgram { bank, program }, name);
                }
            }

            NonRtServerOpcode::CurrentProgram => {
                self.current_program = ring.read_i32()?;
                self.callbacks.program_changed(self.current_program);
            }

            NonRtServerOpcode::CurrentMidiProgram => {
                self.current_midi_program = ring.read_i32()?;
                self.callbacks.midi_program_changed(self.current_midi_program);
            }

            NonRtServerOpcode::SetParameterText => {
                let index = ring.read_i32()?;
                let text = ring.read_string()?;
                self.parameter_text = Some((index, text));
            }

            NonRtServerOpcode::SetCustomData => {
                let data_type = ring.read_string()?;
                let key = ring.read_string()?;
                let via_file = ring.read_bool()?;
                let wire_value = ring.read_string()?;
                let value = if via_file {
                    files::read_and_delete_custom_data_file(std::path::Path::new(&wire_value))?
                } else {
                    wire_value
                };
                self.remember_custom_data(&data_type, &key, &value);
            }

            NonRtServerOpcode::SetChunkDataFile => {
                let path = ring.read_string()?;
                self.chunk = Some(files::read_and_delete_chunk_file(std::path::Path::new(&path))?);
            }

            NonRtServerOpcode::SetLatency => {
                self.latency = ring.read_u32()?;
                self.callbacks.latency_changed(self.latency);
            }

            NonRtServerOpcode::Saved => {
                self.saved = true;
            }

            NonRtServerOpcode::Ready => {
                self.ready = true;
            }

            NonRtServerOpcode::UiClosed => {
                self.callbacks.ui_closed();
            }

            NonRtServerOpcode::RespEmbedUi => {
                let handle = ring.read_u64()?;
                self.callbacks.ui_embedded(handle);
            }

            NonRtServerOpcode::ResizeEmbedUi => {
                let width = ring.read_u32()?;
                let height = ring.read_u32()?;
                self.callbacks.ui_resized(width, height);
            }

            NonRtServerOpcode::Error => {
                let message = ring.read_string()?;
                if self.state == BridgeState::WaitingReady {
                    self.pending_error = Some(message);
                } else {
                    self.callbacks.error(&message);
                }
            }
        }

        Ok(())
    }

    // -- teardown -----------------------------------------------------------

    /// Graceful close: quit on both channels, one flush rendezvous, then
    /// the supervisor's grace-then-kill.
    pub fn close(&mut self) {
        if self.state == BridgeState::Dead {
            self.supervisor.take();
            return;
        }
        let was_running = self.state == BridgeState::Running;
        self.state = BridgeState::Closing;

        let child_alive = self.supervisor.as_ref().is_some_and(|s| s.is_running());
        if child_alive && !self.timed_error {
            self.nonrt_client.write_opcode(NonRtClientOpcode::Quit);
            self.nonrt_client.commit_write();
            self.rt.write_opcode(RtClientOpcode::Quit);
            self.rt.commit_write();
            if was_running && !self.timed_out {
                // Let the child flush its RT side once.
                self.rt.wait_for_client(CLOSING_FLUSH_TIMEOUT);
            }
        }

        if let Some(mut supervisor) = self.supervisor.take() {
            supervisor.stop();
        }
        self.state = BridgeState::Dead;
    }
}

impl Drop for ServerBridge {
    fn drop(&mut self) {
        self.close();
    }
}

fn silence(outputs: &mut [&mut [f32]], frames: u32) {
    for output in outputs.iter_mut() {
        let n = (frames as usize).min(output.len());
        output[..n].fill(0.0);
    }
}

/// A bridge shared between the host's audio and idle threads with the
/// blocking rules baked in: the audio thread only ever try-locks and
/// silences on contention.
#[derive(Clone)]
pub struct SharedBridge {
    inner: Arc<Mutex<ServerBridge>>,
}

impl SharedBridge {
    pub fn new(bridge: ServerBridge) -> Self {
        Self { inner: Arc::new(Mutex::new(bridge)) }
    }

    /// Audio-thread entry point. Never blocks: a held lock means someone is
    /// mutating plugin state, so this cycle becomes silence.
    pub fn process_or_silence(
        &self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        frames: u32,
        events: &[ProcessEvent],
        transport: &TransportInfo,
    ) {
        match self.inner.try_lock() {
            Some(mut bridge) => bridge.process(inputs, outputs, frames, events, transport),
            None => silence(outputs, frames),
        }
    }

    /// Idle-thread entry point; may block on the mutex.
    pub fn idle(&self) {
        self.inner.lock().idle();
    }

    /// Non-RT access to the full bridge API.
    pub fn with<R>(&self, f: impl FnOnce(&mut ServerBridge) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config =
            BridgeConfig::new(PathBuf::from("halcyon-bridge"), PluginType::Lv2, "urn:test");
        assert_eq!(config.buffer_size, 512);
        assert_eq!(config.sample_rate, 48000.0);
        assert_eq!(config.init_timeout, Duration::from_secs(15));
        assert_eq!(config.rt_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_spawn_failure_is_setup_error() {
        let config = BridgeConfig::new(
            PathBuf::from("/nonexistent/halcyon-bridge"),
            PluginType::Internal,
            "gain",
        );
        let err = ServerBridge::new(config, Arc::new(NullCallbacks)).unwrap_err();
        assert!(matches!(err, BridgeError::Spawn(_)));
    }

    #[test]
    fn test_silence_helper_zeroes_exactly_frames() {
        let mut left = vec![1.0f32; 64];
        let mut right = vec![1.0f32; 64];
        {
            let mut outs: Vec<&mut [f32]> = vec![&mut left, &mut right];
            silence(&mut outs, 32);
        }
        assert!(left[..32].iter().all(|s| *s == 0.0));
        assert!(left[32..].iter().all(|s| *s == 1.0));
        assert!(right[..32].iter().all(|s| *s == 0.0));
    }
}
