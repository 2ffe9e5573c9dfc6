//! End-to-end bridge tests against a real spawned child process.
//!
//! Each test launches the actual `halcyon-bridge` binary hosting one of the
//! internal plugins, then drives it exactly the way a host engine would:
//! `wait_ready`, non-RT commands via the bridge API, cycles via `process`,
//! events via `idle`.

use halcyon_bridge::protocol::{MidiEvent, PluginType, ProcessEvent, TransportInfo};
use halcyon_bridge::server::{BridgeConfig, BridgeState, HostCallbacks, ServerBridge};
use halcyon_bridge_client::builtin::{PROBE_KEY_EXIT, PROBE_KEY_STALL, PROBE_NS};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

const BRIDGE_BIN: &str = env!("CARGO_BIN_EXE_halcyon-bridge");

#[derive(Default)]
struct Recorder {
    params: Mutex<Vec<(u32, f32)>>,
    midi: Mutex<Vec<(u32, u8, Vec<u8>)>>,
    errors: Mutex<Vec<String>>,
}

impl HostCallbacks for Recorder {
    fn parameter_value_changed(&self, index: u32, value: f32) {
        self.params.lock().push((index, value));
    }

    fn midi_out(&self, time: u32, port: u8, data: &[u8]) {
        self.midi.lock().push((time, port, data.to_vec()));
    }

    fn error(&self, message: &str) {
        self.errors.lock().push(message.to_string());
    }
}

fn internal_config(label: &str) -> BridgeConfig {
    let mut config =
        BridgeConfig::new(PathBuf::from(BRIDGE_BIN), PluginType::Internal, label);
    config.buffer_size = 512;
    config.sample_rate = 48000.0;
    config
}

fn start(label: &str) -> (ServerBridge, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let mut bridge =
        ServerBridge::new(internal_config(label), recorder.clone()).expect("spawn bridge");
    bridge.wait_ready().expect("bridge ready");
    bridge.activate().expect("activate");
    settle(&mut bridge, 300);
    (bridge, recorder)
}

/// Pump the idle path for a while so non-RT commands land in the child.
fn settle(bridge: &mut ServerBridge, ms: u64) {
    let deadline = Instant::now() + Duration::from_millis(ms);
    while Instant::now() < deadline {
        bridge.idle();
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn run_cycle(bridge: &mut ServerBridge, input: &[f32], events: &[ProcessEvent]) -> Vec<Vec<f32>> {
    let frames = input.len();
    let in_l = input.to_vec();
    let in_r = input.to_vec();
    let mut out_l = vec![9.9f32; frames];
    let mut out_r = vec![9.9f32; frames];
    {
        let ins: Vec<&[f32]> = vec![&in_l, &in_r];
        let mut outs: Vec<&mut [f32]> = vec![&mut out_l, &mut out_r];
        bridge.process(&ins, &mut outs, frames as u32, events, &TransportInfo::default());
    }
    vec![out_l, out_r]
}

#[test]
fn test_handshake_reports_plugin_facts() {
    let (bridge, _recorder) = start("probe");

    assert_eq!(bridge.state(), BridgeState::Running);
    assert_eq!(bridge.info().real_name, "Halcyon Probe");
    assert_eq!(bridge.info().maker, "Halcyon");
    assert_eq!(bridge.info().unique_id, 0x48435052);

    let counts = bridge.counts();
    assert_eq!((counts.audio_in, counts.audio_out), (2, 2));
    assert_eq!((counts.midi_in, counts.midi_out), (1, 1));
    assert_eq!((counts.cv_in, counts.cv_out), (0, 0));

    assert_eq!(bridge.parameter_count(), 2);
    let gain = bridge.parameter_info(0).unwrap();
    assert_eq!(gain.name, "Gain");
    assert_eq!(gain.min, 0.0);
    assert_eq!(gain.max, 2.0);
    assert_eq!(gain.value, 1.0);
    let mix = bridge.parameter_info(1).unwrap();
    assert_eq!(mix.name, "Mix");
    assert!((mix.def - 0.5).abs() < 1e-6);

    assert!(bridge
        .port_names()
        .iter()
        .any(|(_, _, name)| name == "Events In"));
}

#[test]
fn test_handshake_across_buffer_sizes() {
    for buffer_size in [16u32, 128, 1024, 2048] {
        let mut config = internal_config("gain");
        config.buffer_size = buffer_size;
        let mut bridge = ServerBridge::new(config, Arc::new(Recorder::default())).unwrap();
        bridge.wait_ready().unwrap();
        assert_eq!(bridge.parameter_count(), 1);
        assert_eq!(bridge.counts().audio_in, 2);
        bridge.close();
    }
}

#[test]
fn test_silent_cycle_outputs_silence() {
    let (mut bridge, _recorder) = start("probe");

    let start = Instant::now();
    let outs = run_cycle(&mut bridge, &vec![0.0f32; 512], &[]);
    let elapsed = start.elapsed();

    for channel in &outs {
        assert_eq!(channel.len(), 512);
        assert!(channel.iter().all(|s| *s == 0.0), "expected silence");
    }
    assert!(!bridge.is_timed_out());
    // Generous bound for a loaded CI box; a healthy cycle is microseconds.
    assert!(elapsed < Duration::from_millis(900), "cycle took {elapsed:?}");
}

#[test]
fn test_gain_is_applied_to_audio() {
    let (mut bridge, _recorder) = start("gain");

    bridge.set_parameter_value(0, 0.5).unwrap();
    settle(&mut bridge, 200);

    let input: Vec<f32> = (0..512).map(|i| (i as f32 / 512.0) - 0.5).collect();
    let outs = run_cycle(&mut bridge, &input, &[]);
    for (o, i) in outs[0].iter().zip(input.iter()) {
        assert!((o - i * 0.5).abs() < 1e-6);
    }
}

#[test]
fn test_rt_parameter_event_reports_back() {
    let (mut bridge, recorder) = start("probe");

    let events =
        [ProcessEvent::Parameter { time: 0, channel: 0, index: 1, value: 0.25 }];
    run_cycle(&mut bridge, &vec![0.0f32; 512], &events);

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        bridge.idle();
        if recorder
            .params
            .lock()
            .iter()
            .any(|(index, value)| *index == 1 && (value - 0.25).abs() < 1e-6)
        {
            break;
        }
        assert!(Instant::now() < deadline, "no ParameterValue report");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!((bridge.parameter_value(1).unwrap() - 0.25).abs() < 1e-6);
}

#[test]
fn test_midi_note_round_trip() {
    let (mut bridge, recorder) = start("probe");

    let events = [ProcessEvent::Midi(MidiEvent::new(0, 0, &[0x90, 60, 127]))];
    run_cycle(&mut bridge, &vec![0.0f32; 512], &events);

    let midi = recorder.midi.lock();
    assert_eq!(midi.len(), 1);
    let (time, port, data) = &midi[0];
    assert_eq!(*time, 0);
    assert_eq!(*port, 0);
    assert_eq!(data, &vec![0x90, 60, 127]);
}

#[test]
fn test_oversized_custom_data_round_trip() {
    let (mut bridge, _recorder) = start("probe");

    // Way past the 4 KiB inline limit; travels via temp file.
    let value: String = std::iter::repeat("halcyon!").take(2500).collect();
    assert_eq!(value.len(), 20_000);
    bridge.set_custom_data("http://example/prop", "k", &value).unwrap();
    settle(&mut bridge, 300);

    let saved = bridge.save_state(Duration::from_secs(5)).unwrap();
    let got = saved
        .custom_data
        .iter()
        .find(|cd| cd.data_type == "http://example/prop" && cd.key == "k")
        .expect("custom data came back");
    assert_eq!(got.value, value);
    assert_eq!(bridge.custom_data_value("http://example/prop", "k"), Some(value.as_str()));
}

#[test]
fn test_chunk_state_round_trip() {
    let (mut bridge, _recorder) = start("probe");

    let chunk: Vec<u8> = (0..100_000u32).map(|i| (i % 255) as u8).collect();
    bridge.set_chunk_data(&chunk).unwrap();
    settle(&mut bridge, 300);

    let saved = bridge.save_state(Duration::from_secs(5)).unwrap();
    assert_eq!(saved.chunk.as_deref(), Some(chunk.as_slice()));
}

#[test]
fn test_parameter_text_request() {
    let (mut bridge, _recorder) = start("probe");
    let text = bridge.get_parameter_text(0).unwrap();
    assert_eq!(text, "1.00");
}

#[test]
fn test_rt_timeout_outputs_silence_then_recovers() {
    let (mut bridge, _recorder) = start("probe");

    // Burn the extended first-cycle grace with a healthy cycle.
    run_cycle(&mut bridge, &vec![0.0f32; 512], &[]);
    assert!(!bridge.is_timed_out());

    // Ask the probe to stall its next cycle well past the 1 s budget.
    bridge.set_custom_data(PROBE_NS, PROBE_KEY_STALL, "2500").unwrap();
    settle(&mut bridge, 300);

    let outs = run_cycle(&mut bridge, &vec![1.0f32; 512], &[]);
    assert!(bridge.is_timed_out());
    for channel in &outs {
        assert!(channel.iter().all(|s| *s == 0.0), "stalled cycle must be silent");
    }

    // While timed out, further cycles short-circuit to silence.
    let outs = run_cycle(&mut bridge, &vec![1.0f32; 512], &[]);
    assert!(outs[0].iter().all(|s| *s == 0.0));

    // The late post is picked up by idle and the bridge recovers.
    let deadline = Instant::now() + Duration::from_secs(5);
    while bridge.is_timed_out() && Instant::now() < deadline {
        bridge.idle();
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(!bridge.is_timed_out(), "bridge should recover from a single stall");

    let input = vec![0.25f32; 512];
    let outs = run_cycle(&mut bridge, &input, &[]);
    assert!((outs[0][0] - 0.25).abs() < 1e-6, "processing resumes after recovery");
}

#[test]
fn test_child_crash_surfaces_single_error_and_dead_state() {
    let (mut bridge, recorder) = start("probe");

    bridge.set_custom_data(PROBE_NS, PROBE_KEY_EXIT, "1").unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    while recorder.errors.lock().is_empty() {
        bridge.idle();
        assert!(Instant::now() < deadline, "no crash callback");
        std::thread::sleep(Duration::from_millis(10));
    }

    settle(&mut bridge, 200);
    let errors = recorder.errors.lock();
    assert_eq!(errors.len(), 1, "exactly one error callback: {errors:?}");
    assert!(errors[0].contains("Halcyon Probe"));
    drop(errors);

    assert_eq!(bridge.state(), BridgeState::Dead);
    // Dead bridge refuses further commands; nothing reaches the ring.
    assert!(bridge.set_parameter_value(0, 0.1).is_err());
    assert!(bridge.save_state(Duration::from_millis(100)).is_err());
}

#[test]
fn test_close_is_clean_and_idempotent() {
    let (mut bridge, recorder) = start("gain");
    run_cycle(&mut bridge, &vec![0.0f32; 512], &[]);

    bridge.close();
    assert_eq!(bridge.state(), BridgeState::Dead);
    bridge.close();
    assert!(bridge.activate().is_err());
    // A graceful close is not a crash.
    assert!(recorder.errors.lock().is_empty());
}

#[test]
fn test_unknown_internal_label_fails_startup() {
    let mut bridge =
        ServerBridge::new(internal_config("does-not-exist"), Arc::new(Recorder::default()))
            .unwrap();
    let err = bridge.wait_ready().unwrap_err();
    let text = err.to_string();
    assert!(
        text.contains("exited") || text.contains("seconds"),
        "unexpected error: {text}"
    );
}
