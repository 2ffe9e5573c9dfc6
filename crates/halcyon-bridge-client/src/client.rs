//! The in-child bridge: attaches the shared regions, answers the host's
//! control protocol and drives the wrapped plugin.
//!
//! Two threads. The non-RT loop (the caller's thread, usually main) drains
//! host commands, forwards wrapper notifications and watches the ping
//! deadline. The RT thread waits on the "server-runs" semaphore, services
//! the cycle opcodes and hands the baton back after each wake.

use crate::handler::{MidiOutEvent, PluginEvent, PluginHandler};
use crate::ports::{with_pool_io, CycleEvents};
use crate::signals;
use halcyon_bridge::error::{BridgeError, Result};
use halcyon_bridge::files;
use halcyon_bridge::nonrt_channel::{NonRtClientControl, NonRtData, NonRtServerControl};
use halcyon_bridge::pool::AudioPool;
use halcyon_bridge::protocol::*;
use halcyon_bridge::rt_channel::{RtClientControl, RtClientData};
use halcyon_bridge::server::PortCounts;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Slice length for the RT thread's semaphore wait; short enough that the
/// quit flag is observed promptly at teardown.
const RT_WAIT_SLICE: Duration = Duration::from_millis(500);
const IDLE_SLEEP: Duration = Duration::from_millis(20);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Exit when the pinging host goes quiet for this long.
const PING_TIMEOUT: Duration = Duration::from_secs(30);

struct Engine {
    handler: Box<dyn PluginHandler>,
    buffer_size: u32,
    active: bool,
    /// UI-originated events waiting for the next cycle.
    pending_ui_events: Vec<ProcessEvent>,
    /// Notifications for the host, flushed by the non-RT loop.
    outbox: Vec<PluginEvent>,
}

struct Shared {
    quit: AtomicBool,
    rt_dead: AtomicBool,
    /// Fixed after connect; kept outside the engine mutex so the RT thread
    /// can still address the pool when the engine is contended.
    counts: PortCounts,
    engine: Mutex<Engine>,
    out: Mutex<NonRtServerControl>,
}

/// Lets tests and signal plumbing stop a running bridge from outside.
#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<Shared>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        self.shared.quit.store(true, Ordering::Release);
    }
}

pub struct ClientBridge {
    shared: Arc<Shared>,
    nonrt_client: NonRtClientControl,
    rt_thread: Option<std::thread::JoinHandle<()>>,
    pool_suffix: String,
    watchdog_enabled: bool,
    last_traffic: Instant,
    ui_shown: bool,
}

impl std::fmt::Debug for ClientBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBridge")
            .field("pool_suffix", &self.pool_suffix)
            .field("watchdog_enabled", &self.watchdog_enabled)
            .field("ui_shown", &self.ui_shown)
            .finish()
    }
}

enum Handled {
    Continue,
    Quit,
}

impl ClientBridge {
    /// Attach all four regions named by `shm_ids` (the 24-character value of
    /// `ENGINE_BRIDGE_SHM_IDS`), verify the handshake, report the plugin to
    /// the host and start the RT thread. The returned bridge is live; call
    /// `run` to serve the non-RT protocol.
    pub fn connect(shm_ids: &str, handler: Box<dyn PluginHandler>) -> Result<Self> {
        if shm_ids.len() != 4 * SHM_SUFFIX_LEN {
            return Err(BridgeError::InvalidArgument(format!(
                "shm ids must be {} characters, got {}",
                4 * SHM_SUFFIX_LEN,
                shm_ids.len()
            )));
        }
        let pool_suffix = &shm_ids[0..6];
        let rt_suffix = &shm_ids[6..12];
        let nonrt_client_suffix = &shm_ids[12..18];
        let nonrt_server_suffix = &shm_ids[18..24];

        let pool = AudioPool::attach(pool_suffix)?;
        let rt = RtClientControl::attach_client(rt_suffix)?;
        let nonrt_client = NonRtClientControl::attach_client(nonrt_client_suffix)?;
        let nonrt_server = NonRtServerControl::attach_client(nonrt_server_suffix)?;

        let (buffer_size, sample_rate) = Self::read_handshake(&nonrt_client)?;

        let mut handler = handler;
        handler.buffer_size_changed(buffer_size);
        handler.sample_rate_changed(sample_rate);

        let ports = handler.ports();
        let counts = PortCounts {
            audio_in: ports.audio_in.len() as u32,
            audio_out: ports.audio_out.len() as u32,
            cv_in: ports.cv_in.len() as u32,
            cv_out: ports.cv_out.len() as u32,
            midi_in: ports.midi_in.len() as u32,
            midi_out: ports.midi_out.len() as u32,
        };

        Self::send_descriptor_burst(&nonrt_server, handler.as_ref())?;

        let shared = Arc::new(Shared {
            quit: AtomicBool::new(false),
            rt_dead: AtomicBool::new(false),
            counts,
            engine: Mutex::new(Engine {
                handler,
                buffer_size,
                active: false,
                pending_ui_events: Vec::new(),
                outbox: Vec::new(),
            }),
            out: Mutex::new(nonrt_server),
        });

        // The RT thread must be parked on the semaphore before the host's
        // first pool-resize rendezvous, which follows Ready.
        let rt_thread = std::thread::Builder::new()
            .name("bridge-rt".to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                move || rt_loop(rt, pool, shared)
            })
            .map_err(|e| BridgeError::Spawn(format!("rt thread: {e}")))?;

        {
            let out = shared.out.lock();
            out.write_opcode(NonRtServerOpcode::Ready);
            out.commit_write();
        }
        tracing::debug!("bridge client ready");

        Ok(Self {
            shared,
            nonrt_client,
            rt_thread: Some(rt_thread),
            pool_suffix: pool_suffix.to_string(),
            watchdog_enabled: true,
            last_traffic: Instant::now(),
            ui_shown: false,
        })
    }

    fn read_handshake(channel: &NonRtClientControl) -> Result<(u32, f64)> {
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        while !channel.is_data_available_for_reading() {
            if Instant::now() >= deadline {
                return Err(BridgeError::Handshake("no handshake from host".into()));
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        let ring = *channel.ring();
        match channel.read_opcode()? {
            Some(NonRtClientOpcode::Version) => {}
            other => {
                return Err(BridgeError::Handshake(format!(
                    "expected version handshake, got {other:?}"
                )));
            }
        }
        let api = ring.read_u32()?;
        if !(PLUGIN_BRIDGE_API_VERSION_MINIMUM..=PLUGIN_BRIDGE_API_VERSION_CURRENT).contains(&api) {
            return Err(BridgeError::VersionMismatch {
                host: api,
                client: PLUGIN_BRIDGE_API_VERSION_CURRENT,
            });
        }

        let rt_size = ring.read_u32()? as usize;
        let nonrt_client_size = ring.read_u32()? as usize;
        let nonrt_server_size = ring.read_u32()? as usize;
        if rt_size != std::mem::size_of::<RtClientData>()
            || nonrt_client_size != std::mem::size_of::<NonRtData>()
            || nonrt_server_size != std::mem::size_of::<NonRtData>()
        {
            return Err(BridgeError::Handshake(format!(
                "shared struct sizes differ (host {rt_size}/{nonrt_client_size}/{nonrt_server_size}, \
                 client {}/{}/{})",
                std::mem::size_of::<RtClientData>(),
                std::mem::size_of::<NonRtData>(),
                std::mem::size_of::<NonRtData>()
            )));
        }

        match channel.read_opcode()? {
            Some(NonRtClientOpcode::InitialSetup) => {}
            other => {
                return Err(BridgeError::Handshake(format!(
                    "expected initial setup, got {other:?}"
                )));
            }
        }
        let buffer_size = ring.read_u32()?;
        let sample_rate = ring.read_f64()?;
        Ok((buffer_size, sample_rate))
    }

    fn send_descriptor_burst(out: &NonRtServerControl, handler: &dyn PluginHandler) -> Result<()> {
        let ring = *out.ring();

        out.write_opcode(NonRtServerOpcode::Version);
        ring.write_u32(PLUGIN_BRIDGE_API_VERSION_CURRENT);
        out.commit_write();

        let info = handler.descriptor();
        out.write_opcode(NonRtServerOpcode::PluginInfo1);
        ring.write_u32(info.category as u32);
        ring.write_u32(info.hints);
        ring.write_u32(info.options_available);
        ring.write_u32(info.options_enabled);
        ring.write_i64(info.unique_id);
        out.commit_write();

        out.write_opcode(NonRtServerOpcode::PluginInfo2);
        ring.write_string(clamp_str(&info.real_name, MAX_REAL_NAME_LEN));
        ring.write_string(clamp_str(&info.label, MAX_LABEL_LEN));
        ring.write_string(clamp_str(&info.maker, MAX_MAKER_LEN));
        ring.write_string(clamp_str(&info.copyright, MAX_COPYRIGHT_LEN));
        out.commit_write();

        let ports = handler.ports();
        out.write_opcode(NonRtServerOpcode::AudioCount);
        ring.write_u32(ports.audio_in.len() as u32);
        ring.write_u32(ports.audio_out.len() as u32);
        out.write_opcode(NonRtServerOpcode::MidiCount);
        ring.write_u32(ports.midi_in.len() as u32);
        ring.write_u32(ports.midi_out.len() as u32);
        out.write_opcode(NonRtServerOpcode::CvCount);
        ring.write_u32(ports.cv_in.len() as u32);
        ring.write_u32(ports.cv_out.len() as u32);
        out.commit_write();

        let port_classes: [(PortType, &[String]); 6] = [
            (PortType::AudioIn, &ports.audio_in),
            (PortType::AudioOut, &ports.audio_out),
            (PortType::CvIn, &ports.cv_in),
            (PortType::CvOut, &ports.cv_out),
            (PortType::MidiIn, &ports.midi_in),
            (PortType::MidiOut, &ports.midi_out),
        ];
        for (port_type, names) in port_classes {
            for (index, name) in names.iter().enumerate() {
                out.wait_if_data_is_reaching_limit();
                out.write_opcode(NonRtServerOpcode::PortName);
                ring.write_u8(port_type as u8);
                ring.write_u32(index as u32);
                ring.write_string(clamp_str(name, MAX_PORT_NAME_LEN));
                out.commit_write();
            }
        }

        let params = handler.parameters();
        out.write_opcode(NonRtServerOpcode::ParameterCount);
        ring.write_u32(params.len() as u32);
        out.commit_write();
        for param in &params {
            out.wait_if_data_is_reaching_limit();
            out.write_opcode(NonRtServerOpcode::ParameterData1);
            ring.write_u32(param.index);
            ring.write_i32(param.rindex);
            ring.write_u32(param.param_type as u32);
            ring.write_u32(param.hints);
            ring.write_u8(param.midi_channel);
            ring.write_i16(param.mapped_control_index);
            out.write_opcode(NonRtServerOpcode::ParameterData2);
            ring.write_u32(param.index);
            ring.write_string(clamp_str(&param.name, MAX_PORT_NAME_LEN));
            ring.write_string(clamp_str(&param.symbol, MAX_PORT_NAME_LEN));
            ring.write_string(clamp_str(&param.unit, MAX_PORT_NAME_LEN));
            out.write_opcode(NonRtServerOpcode::ParameterRanges);
            ring.write_u32(param.index);
            ring.write_f32(param.def);
            ring.write_f32(param.min);
            ring.write_f32(param.max);
            ring.write_f32(param.step);
            ring.write_f32(param.step_small);
            ring.write_f32(param.step_large);
            // Initial value, without triggering host callbacks.
            out.write_opcode(NonRtServerOpcode::ParameterValue2);
            ring.write_u32(param.index);
            ring.write_f32(param.value);
            if !out.commit_write() {
                return Err(BridgeError::PayloadOversize {
                    opcode: "ParameterData",
                    needed: param.name.len() + param.symbol.len() + param.unit.len(),
                });
            }
        }

        let programs = handler.programs();
        out.write_opcode(NonRtServerOpcode::ProgramCount);
        ring.write_u32(programs.len() as u32);
        out.commit_write();
        for (index, name) in programs.iter().enumerate() {
            out.wait_if_data_is_reaching_limit();
            out.write_opcode(NonRtServerOpcode::ProgramName);
            ring.write_u32(index as u32);
            ring.write_string(clamp_str(name, MAX_PORT_NAME_LEN));
            out.commit_write();
        }

        let midi_programs = handler.midi_programs();
        out.write_opcode(NonRtServerOpcode::MidiProgramCount);
        ring.write_u32(midi_programs.len() as u32);
        out.commit_write();
        for (index, mp) in midi_programs.iter().enumerate() {
            out.wait_if_data_is_reaching_limit();
            out.write_opcode(NonRtServerOpcode::MidiProgramData);
            ring.write_u32(index as u32);
            ring.write_u32(mp.bank);
            ring.write_u32(mp.program);
            ring.write_string(clamp_str(&mp.name, MAX_PORT_NAME_LEN));
            out.commit_write();
        }

        let latency = handler.latency();
        if latency > 0 {
            out.write_opcode(NonRtServerOpcode::SetLatency);
            ring.write_u32(latency);
            out.commit_write();
        }

        Ok(())
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { shared: Arc::clone(&self.shared) }
    }

    /// Serve the non-RT protocol until the host says quit, the host goes
    /// quiet past the ping deadline, a shutdown signal arrives, or the RT
    /// thread dies.
    pub fn run(&mut self) -> Result<()> {
        let result = self.run_loop();
        if let Err(e) = &result {
            self.send_error(&format!("bridge client failed: {e}"));
        }
        self.shutdown();
        result
    }

    fn run_loop(&mut self) -> Result<()> {
        self.last_traffic = Instant::now();
        loop {
            if self.shared.quit.load(Ordering::Acquire) || signals::stop_requested() {
                return Ok(());
            }
            if signals::take_save_request() {
                self.save_burst();
            }
            if self.shared.rt_dead.load(Ordering::Acquire) {
                self.send_error("plugin processing thread died");
                return Ok(());
            }

            let mut worked = false;
            while self.nonrt_client.is_data_available_for_reading() {
                worked = true;
                self.last_traffic = Instant::now();
                match self.handle_message()? {
                    Handled::Continue => {}
                    Handled::Quit => {
                        self.shared.quit.store(true, Ordering::Release);
                        return Ok(());
                    }
                }
            }

            self.flush_outbox();

            if self.ui_shown {
                // Housekeeping yields to the RT thread; next round is soon.
                if let Some(mut engine) = self.shared.engine.try_lock() {
                    engine.handler.ui_idle();
                }
            }

            if self.watchdog_enabled && self.last_traffic.elapsed() > PING_TIMEOUT {
                tracing::error!("host went quiet past the ping deadline, exiting");
                return Ok(());
            }

            if !worked {
                std::thread::sleep(IDLE_SLEEP);
            }
        }
    }

    fn handle_message(&mut self) -> Result<Handled> {
        let ring = *self.nonrt_client.ring();
        let opcode = self
            .nonrt_client
            .read_opcode()?
            .ok_or_else(|| BridgeError::ProtocolDesync("unknown host opcode".into()))?;

        match opcode {
            NonRtClientOpcode::Null => {}

            NonRtClientOpcode::Version => {
                // Repeated handshake; consume and ignore.
                let _ = ring.read_u32()?;
                let _ = ring.read_u32()?;
                let _ = ring.read_u32()?;
                let _ = ring.read_u32()?;
            }

            NonRtClientOpcode::InitialSetup => {
                let buffer_size = ring.read_u32()?;
                let sample_rate = ring.read_f64()?;
                let mut engine = self.shared.engine.lock();
                engine.buffer_size = buffer_size;
                engine.handler.buffer_size_changed(buffer_size);
                engine.handler.sample_rate_changed(sample_rate);
            }

            NonRtClientOpcode::Ping => {
                let out = self.shared.out.lock();
                out.write_opcode(NonRtServerOpcode::Pong);
                out.commit_write();
            }

            NonRtClientOpcode::PingOnOff => {
                self.watchdog_enabled = ring.read_bool()?;
                self.last_traffic = Instant::now();
            }

            NonRtClientOpcode::Activate => {
                let mut engine = self.shared.engine.lock();
                engine.active = true;
                engine.handler.activate();
            }

            NonRtClientOpcode::Deactivate => {
                let mut engine = self.shared.engine.lock();
                engine.active = false;
                engine.handler.deactivate();
            }

            NonRtClientOpcode::SetParameterValue => {
                let index = ring.read_u32()?;
                let value = ring.read_f32()?;
                self.shared.engine.lock().handler.set_parameter_value(index, value);
            }

            NonRtClientOpcode::SetParameterMidiChannel => {
                let index = ring.read_u32()?;
                let channel = ring.read_u8()?;
                self.shared.engine.lock().handler.set_parameter_midi_channel(index, channel);
            }

            NonRtClientOpcode::SetParameterMappedControlIndex => {
                let index = ring.read_u32()?;
                let control = ring.read_i16()?;
                self.shared
                    .engine
                    .lock()
                    .handler
                    .set_parameter_mapped_control_index(index, control);
            }

            NonRtClientOpcode::SetParameterMappedRange => {
                let index = ring.read_u32()?;
                let min = ring.read_f32()?;
                let max = ring.read_f32()?;
                self.shared.engine.lock().handler.set_parameter_mapped_range(index, min, max);
            }

            NonRtClientOpcode::SetProgram => {
                let index = ring.read_i32()?;
                self.shared.engine.lock().handler.set_program(index);
            }

            NonRtClientOpcode::SetMidiProgram => {
                let index = ring.read_i32()?;
                self.shared.engine.lock().handler.set_midi_program(index);
            }

            NonRtClientOpcode::SetCustomData => {
                let data_type = ring.read_string()?;
                let key = ring.read_string()?;
                let via_file = ring.read_bool()?;
                let wire_value = ring.read_string()?;
                let value = if via_file {
                    files::read_and_delete_custom_data_file(std::path::Path::new(&wire_value))?
                } else {
                    wire_value
                };
                self.shared.engine.lock().handler.set_custom_data(&data_type, &key, &value);
            }

            NonRtClientOpcode::SetChunkDataFile => {
                let path = ring.read_string()?;
                let data = files::read_and_delete_chunk_file(std::path::Path::new(&path))?;
                self.shared.engine.lock().handler.set_chunk(&data);
            }

            NonRtClientOpcode::SetCtrlChannel => {
                let channel = ring.read_i16()?;
                self.shared.engine.lock().handler.ctrl_channel_changed(channel);
            }

            NonRtClientOpcode::SetOption => {
                let option = ring.read_u32()?;
                let yes = ring.read_bool()?;
                self.shared.engine.lock().handler.option_changed(option, yes);
            }

            NonRtClientOpcode::SetOptions => {
                let options = ring.read_u32()?;
                self.shared.engine.lock().handler.options_changed(options);
            }

            NonRtClientOpcode::PrepareForSave => {
                self.save_burst();
            }

            NonRtClientOpcode::RestoreLv2State => {
                self.shared.engine.lock().handler.restore_lv2_state();
            }

            NonRtClientOpcode::ShowUi => {
                self.ui_shown = true;
                self.shared.engine.lock().handler.show_ui();
            }

            NonRtClientOpcode::HideUi => {
                self.ui_shown = false;
                self.shared.engine.lock().handler.hide_ui();
            }

            NonRtClientOpcode::EmbedUi => {
                let parent = ring.read_u64()?;
                let handle = {
                    let mut engine = self.shared.engine.lock();
                    engine.handler.embed_ui(parent).unwrap_or(0)
                };
                self.ui_shown = handle != 0;
                let out = self.shared.out.lock();
                out.write_opcode(NonRtServerOpcode::RespEmbedUi);
                out.ring().write_u64(handle);
                out.commit_write();
            }

            NonRtClientOpcode::SetWindowTitle => {
                let title = ring.read_string()?;
                self.shared.engine.lock().handler.set_window_title(&title);
            }

            NonRtClientOpcode::UiParameterChange => {
                let index = ring.read_u32()?;
                let value = ring.read_f32()?;
                self.shared.engine.lock().handler.set_parameter_value(index, value);
            }

            NonRtClientOpcode::UiProgramChange => {
                let index = ring.read_u32()?;
                self.shared.engine.lock().handler.set_program(index as i32);
            }

            NonRtClientOpcode::UiMidiProgramChange => {
                let index = ring.read_u32()?;
                self.shared.engine.lock().handler.set_midi_program(index as i32);
            }

            NonRtClientOpcode::UiNoteOn => {
                let channel = ring.read_u8()?;
                let note = ring.read_u8()?;
                let velocity = ring.read_u8()?;
                self.shared.engine.lock().pending_ui_events.push(ProcessEvent::Midi(
                    MidiEvent::new(0, 0, &[0x90 | (channel & 0x0F), note, velocity]),
                ));
            }

            NonRtClientOpcode::UiNoteOff => {
                let channel = ring.read_u8()?;
                let note = ring.read_u8()?;
                self.shared.engine.lock().pending_ui_events.push(ProcessEvent::Midi(
                    MidiEvent::new(0, 0, &[0x80 | (channel & 0x0F), note, 0]),
                ));
            }

            NonRtClientOpcode::GetParameterText => {
                let index = ring.read_i32()?;
                let text = self.shared.engine.lock().handler.parameter_text(index as u32);
                let out = self.shared.out.lock();
                out.write_opcode(NonRtServerOpcode::SetParameterText);
                out.ring().write_i32(index);
                out.ring().write_string(clamp_str(&text, MAX_PORT_NAME_LEN));
                out.commit_write();
            }

            NonRtClientOpcode::Quit => return Ok(Handled::Quit),
        }

        Ok(Handled::Continue)
    }

    /// Push current custom data and chunk state to the host, then `Saved`.
    /// File-write failures surface as protocol errors instead of silently
    /// losing state.
    fn save_burst(&mut self) {
        let (custom_data, chunk) = {
            let engine = self.shared.engine.lock();
            (engine.handler.custom_data(), engine.handler.chunk())
        };

        let out = self.shared.out.lock();
        for (data_type, key, value) in custom_data {
            out.wait_if_data_is_reaching_limit();
            let via_file = value.len() > BIG_VALUE_LIMIT;
            let wire_value = if via_file {
                match files::write_custom_data_file(&self.pool_suffix, &value) {
                    Ok(path) => path.display().to_string(),
                    Err(e) => {
                        write_error(&out, &format!("cannot save value for '{key}': {e}"));
                        continue;
                    }
                }
            } else {
                value
            };
            out.write_opcode(NonRtServerOpcode::SetCustomData);
            out.ring().write_string(&data_type);
            out.ring().write_string(&key);
            out.ring().write_bool(via_file);
            out.ring().write_string(&wire_value);
            out.commit_write();
        }

        if let Some(chunk) = chunk {
            match files::write_chunk_file(&self.pool_suffix, &chunk) {
                Ok(path) => {
                    out.write_opcode(NonRtServerOpcode::SetChunkDataFile);
                    out.ring().write_string(&path.display().to_string());
                    out.commit_write();
                }
                Err(e) => write_error(&out, &format!("cannot save chunk state: {e}")),
            }
        }

        out.write_opcode(NonRtServerOpcode::Saved);
        out.commit_write();
    }

    fn flush_outbox(&mut self) {
        let events = {
            // Do not steal the engine from a running cycle; the outbox keeps
            // until the next round.
            let Some(mut engine) = self.shared.engine.try_lock() else {
                return;
            };
            let mut events = std::mem::take(&mut engine.outbox);
            events.extend(engine.handler.drain_events());
            events
        };
        if events.is_empty() {
            return;
        }

        let out = self.shared.out.lock();
        out.wait_if_data_is_reaching_limit();
        for event in events {
            match event {
                PluginEvent::ParameterChanged { index, value } => {
                    out.write_opcode(NonRtServerOpcode::ParameterValue);
                    out.ring().write_u32(index);
                    out.ring().write_f32(value);
                }
                PluginEvent::ParameterStream { index, value } => {
                    out.write_opcode(NonRtServerOpcode::ParameterValue2);
                    out.ring().write_u32(index);
                    out.ring().write_f32(value);
                }
                PluginEvent::DefaultChanged { index, value } => {
                    out.write_opcode(NonRtServerOpcode::DefaultValue);
                    out.ring().write_u32(index);
                    out.ring().write_f32(value);
                }
                PluginEvent::Touched { index, touched } => {
                    out.write_opcode(NonRtServerOpcode::ParameterTouch);
                    out.ring().write_u32(index);
                    out.ring().write_bool(touched);
                }
                PluginEvent::ProgramChanged(index) => {
                    out.write_opcode(NonRtServerOpcode::CurrentProgram);
                    out.ring().write_i32(index);
                }
                PluginEvent::MidiProgramChanged(index) => {
                    out.write_opcode(NonRtServerOpcode::CurrentMidiProgram);
                    out.ring().write_i32(index);
                }
                PluginEvent::LatencyChanged(frames) => {
                    out.write_opcode(NonRtServerOpcode::SetLatency);
                    out.ring().write_u32(frames);
                }
                PluginEvent::UiClosed => {
                    self.ui_shown = false;
                    out.write_opcode(NonRtServerOpcode::UiClosed);
                }
                PluginEvent::UiResized { width, height } => {
                    out.write_opcode(NonRtServerOpcode::ResizeEmbedUi);
                    out.ring().write_u32(width);
                    out.ring().write_u32(height);
                }
                PluginEvent::Error(message) => {
                    out.write_opcode(NonRtServerOpcode::Error);
                    out.ring().write_string(&message);
                }
            }
            out.commit_write();
        }
    }

    fn send_error(&self, message: &str) {
        let out = self.shared.out.lock();
        write_error(&out, message);
    }

    fn shutdown(&mut self) {
        self.shared.quit.store(true, Ordering::Release);
        if let Some(handle) = self.rt_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ClientBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn write_error(out: &NonRtServerControl, message: &str) {
    tracing::error!("{message}");
    out.write_opcode(NonRtServerOpcode::Error);
    out.ring().write_string(message);
    out.commit_write();
}

// ---------------------------------------------------------------------------
// RT thread

fn rt_loop(mut rt: RtClientControl, mut pool: AudioPool, shared: Arc<Shared>) {
    let mut cycle_events = CycleEvents::default();
    let mut midi_out: Vec<MidiOutEvent> = Vec::with_capacity(64);

    while !shared.quit.load(Ordering::Acquire) {
        if !rt.wait_for_server(RT_WAIT_SLICE) {
            continue;
        }

        while rt.is_data_available_for_reading() {
            match service_opcode(&mut rt, &mut pool, &shared, &mut cycle_events, &mut midi_out) {
                Ok(true) => {}
                Ok(false) => {
                    // Quit: one last baton post lets the server's flush
                    // rendezvous complete.
                    shared.quit.store(true, Ordering::Release);
                    rt.post_client_done();
                    return;
                }
                Err(e) => {
                    // Desync is unrecoverable; leave the baton down so the
                    // server times out instead of reading garbage.
                    tracing::error!("RT channel desync: {e}");
                    shared.rt_dead.store(true, Ordering::Release);
                    return;
                }
            }
        }

        rt.post_client_done();
    }

    // The quit flag can arrive through the non-RT channel while the server
    // is already parked in its closing rendezvous. Answer one last post so
    // that flush wait completes instead of timing out.
    if rt.wait_for_server(Duration::from_millis(100)) {
        rt.post_client_done();
    }
}

/// Handle one RT opcode. `Ok(false)` means Quit.
fn service_opcode(
    rt: &mut RtClientControl,
    pool: &mut AudioPool,
    shared: &Arc<Shared>,
    cycle_events: &mut CycleEvents,
    midi_out: &mut Vec<MidiOutEvent>,
) -> Result<bool> {
    let ring = *rt.ring();
    let opcode = rt
        .read_opcode()?
        .ok_or_else(|| BridgeError::ProtocolDesync("unknown RT opcode".into()))?;

    match opcode {
        RtClientOpcode::Null => {}

        RtClientOpcode::SetAudioPool => {
            let size = ring.read_u64()?;
            pool.remap(size)?;
        }

        RtClientOpcode::SetBufferSize => {
            let frames = ring.read_u32()?;
            match shared.engine.try_lock() {
                Some(mut engine) => {
                    engine.buffer_size = frames;
                    engine.handler.buffer_size_changed(frames);
                }
                None => tracing::warn!("engine busy, dropping buffer-size notification"),
            }
        }

        RtClientOpcode::SetSampleRate => {
            let rate = ring.read_f64()?;
            match shared.engine.try_lock() {
                Some(mut engine) => engine.handler.sample_rate_changed(rate),
                None => tracing::warn!("engine busy, dropping sample-rate notification"),
            }
        }

        RtClientOpcode::SetOnline => {
            let offline = ring.read_bool()?;
            match shared.engine.try_lock() {
                Some(mut engine) => engine.handler.offline_changed(offline),
                None => tracing::warn!("engine busy, dropping offline notification"),
            }
        }

        RtClientOpcode::ControlEventParameter => {
            let time = ring.read_u32()?;
            let channel = ring.read_u8()?;
            let index = ring.read_u16()?;
            let value = ring.read_f32()?;
            cycle_events.push(ProcessEvent::Parameter { time, channel, index, value });
        }

        RtClientOpcode::ControlEventMidiBank => {
            let time = ring.read_u32()?;
            let channel = ring.read_u8()?;
            let bank = ring.read_u16()?;
            cycle_events.push(ProcessEvent::MidiBank { time, channel, bank });
        }

        RtClientOpcode::ControlEventMidiProgram => {
            let time = ring.read_u32()?;
            let channel = ring.read_u8()?;
            let program = ring.read_u16()?;
            cycle_events.push(ProcessEvent::MidiProgram { time, channel, program });
        }

        RtClientOpcode::ControlEventAllSoundOff => {
            let time = ring.read_u32()?;
            let channel = ring.read_u8()?;
            cycle_events.push(ProcessEvent::AllSoundOff { time, channel });
        }

        RtClientOpcode::ControlEventAllNotesOff => {
            let time = ring.read_u32()?;
            let channel = ring.read_u8()?;
            cycle_events.push(ProcessEvent::AllNotesOff { time, channel });
        }

        RtClientOpcode::MidiEvent => {
            let time = ring.read_u32()?;
            let port = ring.read_u8()?;
            let size = ring.read_u8()? as usize;
            let mut data = [0u8; RT_MAX_MIDI_EVENT_SIZE];
            if size == 0 || size > RT_MAX_MIDI_EVENT_SIZE {
                return Err(BridgeError::ProtocolDesync(format!(
                    "RT midi event of {size} bytes"
                )));
            }
            ring.read_custom(&mut data[..size])?;
            cycle_events.push(ProcessEvent::Midi(MidiEvent::new(time, port, &data[..size])));
        }

        RtClientOpcode::Process => {
            let frames = ring.read_u32()?;
            run_cycle(rt, pool, shared, cycle_events, midi_out, frames)?;
            cycle_events.clear();
        }

        RtClientOpcode::Quit => return Ok(false),
    }

    Ok(true)
}

fn run_cycle(
    rt: &mut RtClientControl,
    pool: &AudioPool,
    shared: &Arc<Shared>,
    cycle_events: &mut CycleEvents,
    midi_out: &mut Vec<MidiOutEvent>,
    frames: u32,
) -> Result<()> {
    let transport = rt.time_info().to_transport();

    // The non-RT loop holds this mutex while mutating plugin state. The RT
    // thread never blocks on it; a contended cycle is a silent cycle.
    let Some(mut engine) = shared.engine.try_lock() else {
        return silent_cycle(rt, pool, shared, midi_out, frames);
    };

    let pending: Vec<ProcessEvent> = engine.pending_ui_events.drain(..).collect();
    for event in pending {
        cycle_events.push(event);
    }

    // Parameter control events are authoritative: apply them here and
    // confirm back to the host. They stay in the event list too, so
    // sample-accurate wrappers can place them inside the block.
    let applied: Vec<(u32, f32)> = cycle_events
        .as_slice()
        .iter()
        .filter_map(|event| match *event {
            ProcessEvent::Parameter { index, value, .. } => {
                Some((index as u32, value))
            }
            _ => None,
        })
        .collect();
    for (index, value) in applied {
        let set = engine.handler.set_parameter_value(index, value);
        engine.outbox.push(PluginEvent::ParameterChanged { index, value: set });
    }

    debug_assert!(frames <= engine.buffer_size);

    midi_out.clear();
    if engine.active {
        with_pool_io(pool, &shared.counts, frames, cycle_events.as_slice(), midi_out, |io| {
            engine.handler.process(io, &transport)
        })?;
    } else {
        // Inactive plugins complete the rendezvous with silence.
        drop(engine);
        return silent_cycle(rt, pool, shared, midi_out, frames);
    }

    rt.midi_out_begin();
    for event in midi_out.iter() {
        rt.midi_out_push(event.time, event.port, &event.data);
    }

    if engine.handler.wants_deactivate() {
        rt.set_wants_deactivate();
    }

    // Droppable streaming updates go out right here when the channel is
    // free; everything else waits for the non-RT flush.
    let events = engine.handler.drain_events();
    if !events.is_empty() {
        let mut kept = Vec::new();
        let streamed = shared.out.try_lock();
        for event in events {
            match (&streamed, &event) {
                (Some(out), PluginEvent::ParameterStream { index, value }) => {
                    out.write_opcode(NonRtServerOpcode::ParameterValue2);
                    out.ring().write_u32(*index);
                    out.ring().write_f32(*value);
                    out.commit_write();
                }
                (None, PluginEvent::ParameterStream { .. }) => {}
                _ => kept.push(event),
            }
        }
        engine.outbox.extend(kept);
    }

    Ok(())
}

/// Complete the rendezvous without touching the plugin: zeroed outputs and
/// an empty MIDI-out scratch.
fn silent_cycle(
    rt: &mut RtClientControl,
    pool: &AudioPool,
    shared: &Arc<Shared>,
    midi_out: &mut Vec<MidiOutEvent>,
    frames: u32,
) -> Result<()> {
    midi_out.clear();
    with_pool_io(pool, &shared.counts, frames, &[], midi_out, |io| {
        for channel in io.audio_out.iter_mut() {
            channel.fill(0.0);
        }
        for channel in io.cv_out.iter_mut() {
            channel.fill(0.0);
        }
    })?;
    rt.midi_out_begin();
    Ok(())
}
