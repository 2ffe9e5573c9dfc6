//! Drives `ClientBridge` in-process against hand-rolled server-side
//! channels, checking the descriptor burst and the RT rendezvous without a
//! child process in the way.

use halcyon_bridge::nonrt_channel::{NonRtClientControl, NonRtServerControl};
use halcyon_bridge::pool::AudioPool;
use halcyon_bridge::protocol::*;
use halcyon_bridge::rt_channel::{RtClientControl, RtClientData};
use halcyon_bridge_client::{ClientBridge, GainPlugin};
use std::time::{Duration, Instant};

struct FakeHost {
    pool: AudioPool,
    rt: RtClientControl,
    to_client: NonRtClientControl,
    from_client: NonRtServerControl,
}

impl FakeHost {
    fn new(buffer_size: u32, sample_rate: f64) -> Self {
        let pool = AudioPool::create().unwrap();
        let rt = RtClientControl::init_server().unwrap();
        let to_client = NonRtClientControl::init_server().unwrap();
        let from_client = NonRtServerControl::init_server().unwrap();

        to_client.write_opcode(NonRtClientOpcode::Version);
        to_client.ring().write_u32(PLUGIN_BRIDGE_API_VERSION_CURRENT);
        to_client
            .ring()
            .write_u32(std::mem::size_of::<RtClientData>() as u32);
        to_client
            .ring()
            .write_u32(std::mem::size_of::<halcyon_bridge::nonrt_channel::NonRtData>() as u32);
        to_client
            .ring()
            .write_u32(std::mem::size_of::<halcyon_bridge::nonrt_channel::NonRtData>() as u32);
        to_client.write_opcode(NonRtClientOpcode::InitialSetup);
        to_client.ring().write_u32(buffer_size);
        to_client.ring().write_f64(sample_rate);
        assert!(to_client.commit_write());

        Self { pool, rt, to_client, from_client }
    }

    fn shm_ids(&self) -> String {
        format!(
            "{}{}{}{}",
            self.pool.suffix(),
            self.rt.suffix(),
            self.to_client.suffix(),
            self.from_client.suffix()
        )
    }

    /// Read opcodes until `wanted` arrives, skipping payloads of the burst
    /// messages we are not asserting on.
    fn read_until(&self, wanted: NonRtServerOpcode, timeout: Duration) -> Vec<NonRtServerOpcode> {
        let ring = *self.from_client.ring();
        let deadline = Instant::now() + timeout;
        let mut seen = Vec::new();
        loop {
            if !self.from_client.is_data_available_for_reading() {
                assert!(Instant::now() < deadline, "timed out waiting for {wanted:?}, saw {seen:?}");
                std::thread::sleep(Duration::from_millis(5));
                continue;
            }
            let opcode = self.from_client.read_opcode().unwrap().expect("known opcode");
            seen.push(opcode);
            match opcode {
                NonRtServerOpcode::Version => {
                    assert_eq!(ring.read_u32().unwrap(), PLUGIN_BRIDGE_API_VERSION_CURRENT);
                }
                NonRtServerOpcode::PluginInfo1 => {
                    for _ in 0..4 {
                        ring.read_u32().unwrap();
                    }
                    ring.read_i64().unwrap();
                }
                NonRtServerOpcode::PluginInfo2 => {
                    assert_eq!(ring.read_string().unwrap(), "Halcyon Gain");
                    for _ in 0..3 {
                        ring.read_string().unwrap();
                    }
                }
                NonRtServerOpcode::AudioCount => {
                    assert_eq!(ring.read_u32().unwrap(), 2);
                    assert_eq!(ring.read_u32().unwrap(), 2);
                }
                NonRtServerOpcode::MidiCount | NonRtServerOpcode::CvCount => {
                    ring.read_u32().unwrap();
                    ring.read_u32().unwrap();
                }
                NonRtServerOpcode::PortName => {
                    ring.read_u8().unwrap();
                    ring.read_u32().unwrap();
                    ring.read_string().unwrap();
                }
                NonRtServerOpcode::ParameterCount
                | NonRtServerOpcode::ProgramCount
                | NonRtServerOpcode::MidiProgramCount
                | NonRtServerOpcode::SetLatency => {
                    ring.read_u32().unwrap();
                }
                NonRtServerOpcode::ParameterData1 => {
                    ring.read_u32().unwrap();
                    ring.read_i32().unwrap();
                    ring.read_u32().unwrap();
                    ring.read_u32().unwrap();
                    ring.read_u8().unwrap();
                    ring.read_i16().unwrap();
                }
                NonRtServerOpcode::ParameterData2 => {
                    ring.read_u32().unwrap();
                    for _ in 0..3 {
                        ring.read_string().unwrap();
                    }
                }
                NonRtServerOpcode::ParameterRanges => {
                    ring.read_u32().unwrap();
                    for _ in 0..6 {
                        ring.read_f32().unwrap();
                    }
                }
                NonRtServerOpcode::ParameterValue
                | NonRtServerOpcode::ParameterValue2 => {
                    ring.read_u32().unwrap();
                    ring.read_f32().unwrap();
                }
                NonRtServerOpcode::Pong
                | NonRtServerOpcode::Saved
                | NonRtServerOpcode::Ready => {}
                other => panic!("unexpected burst opcode {other:?}"),
            }
            if opcode == wanted {
                return seen;
            }
        }
    }
}

#[test]
fn test_descriptor_burst_order_and_ready() {
    let host = FakeHost::new(256, 44100.0);
    let shm_ids = host.shm_ids();

    let client_thread = std::thread::spawn(move || {
        let mut client =
            ClientBridge::connect(&shm_ids, Box::new(GainPlugin::new())).expect("connect");
        client.run().expect("run");
    });

    let seen = host.read_until(NonRtServerOpcode::Ready, Duration::from_secs(5));

    // The burst arrives in catalog order and ends with Ready.
    let position = |op: NonRtServerOpcode| seen.iter().position(|s| *s == op).unwrap();
    assert_eq!(position(NonRtServerOpcode::Version), 0);
    assert!(position(NonRtServerOpcode::PluginInfo1) < position(NonRtServerOpcode::AudioCount));
    assert!(position(NonRtServerOpcode::AudioCount) < position(NonRtServerOpcode::PortName));
    assert!(position(NonRtServerOpcode::ParameterCount) < position(NonRtServerOpcode::ParameterData1));
    assert!(position(NonRtServerOpcode::ParameterRanges) < position(NonRtServerOpcode::ParameterValue2));
    assert_eq!(*seen.last().unwrap(), NonRtServerOpcode::Ready);

    // RT side: size the pool, activate, then run one cycle through the
    // semaphore rendezvous.
    let mut host = host;
    let bytes = host.pool.resize(256, 4, 0).unwrap();
    host.rt.write_opcode(RtClientOpcode::SetAudioPool);
    host.rt.ring().write_u64(bytes);
    assert!(host.rt.commit_write());
    assert!(host.rt.wait_for_client(Duration::from_secs(2)), "pool resize rendezvous");

    host.to_client.write_opcode(NonRtClientOpcode::Activate);
    assert!(host.to_client.commit_write());
    std::thread::sleep(Duration::from_millis(100));

    let ramp: Vec<f32> = (0..256).map(|i| i as f32 / 256.0).collect();
    host.pool.write_channel(0, 256, &ramp).unwrap();
    host.pool.write_channel(1, 256, &ramp).unwrap();
    host.rt.set_time_info(&BridgeTimeInfo::default());
    host.rt.write_opcode(RtClientOpcode::Process);
    host.rt.ring().write_u32(256);
    assert!(host.rt.commit_write());

    let started = Instant::now();
    assert!(host.rt.wait_for_client(Duration::from_secs(2)), "process rendezvous");
    assert!(started.elapsed() < Duration::from_millis(900));

    // Unity gain: outputs equal inputs.
    let mut out = vec![0.0f32; 256];
    host.pool.read_channel_into(2, 256, &mut out).unwrap();
    assert_eq!(out, ramp);

    // Ping gets a pong.
    host.to_client.write_opcode(NonRtClientOpcode::Ping);
    assert!(host.to_client.commit_write());
    host.read_until(NonRtServerOpcode::Pong, Duration::from_secs(2));

    // Quit ends the run loop.
    host.to_client.write_opcode(NonRtClientOpcode::Quit);
    assert!(host.to_client.commit_write());
    client_thread.join().expect("client thread");
}

#[test]
fn test_connect_rejects_bad_shm_ids() {
    assert!(ClientBridge::connect("tooshort", Box::new(GainPlugin::new())).is_err());
}

#[test]
fn test_connect_rejects_version_mismatch() {
    let pool = AudioPool::create().unwrap();
    let rt = RtClientControl::init_server().unwrap();
    let to_client = NonRtClientControl::init_server().unwrap();
    let from_client = NonRtServerControl::init_server().unwrap();

    to_client.write_opcode(NonRtClientOpcode::Version);
    to_client.ring().write_u32(2); // ancient
    to_client.ring().write_u32(std::mem::size_of::<RtClientData>() as u32);
    to_client
        .ring()
        .write_u32(std::mem::size_of::<halcyon_bridge::nonrt_channel::NonRtData>() as u32);
    to_client
        .ring()
        .write_u32(std::mem::size_of::<halcyon_bridge::nonrt_channel::NonRtData>() as u32);
    to_client.write_opcode(NonRtClientOpcode::InitialSetup);
    to_client.ring().write_u32(256);
    to_client.ring().write_f64(44100.0);
    assert!(to_client.commit_write());

    let shm_ids = format!(
        "{}{}{}{}",
        pool.suffix(),
        rt.suffix(),
        to_client.suffix(),
        from_client.suffix()
    );
    let err = ClientBridge::connect(&shm_ids, Box::new(GainPlugin::new())).unwrap_err();
    assert!(matches!(err, halcyon_bridge::BridgeError::VersionMismatch { .. }));
}
