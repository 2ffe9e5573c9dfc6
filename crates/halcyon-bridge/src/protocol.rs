//! Bridge wire protocol - opcodes and framed payload types.
//!
//! Every message on a control ring starts with a `u32` opcode followed by an
//! opcode-specific sequence of typed fields. There is no length prefix: the
//! reader must consume exactly the fields the opcode defines, otherwise the
//! ring desynchronises and the bridge is lost. All scalars are little-endian,
//! strings are `{u32 len, bytes}` without a NUL terminator.

/// Bumped whenever the wire format changes. Client and server exchange this
/// at connect time; the pair degrades gracefully for a few features when the
/// client is older (see the `MIN_*` constants), everything else is a hard
/// mismatch.
pub const PLUGIN_BRIDGE_API_VERSION_CURRENT: u32 = 10;
pub const PLUGIN_BRIDGE_API_VERSION_MINIMUM: u32 = 6;

/// Client api version required for mapped parameter ranges.
pub const MIN_API_VERSION_MAPPED_RANGE: u32 = 7;
/// Client api version required for SetWindowTitle.
pub const MIN_API_VERSION_WINDOW_TITLE: u32 = 8;
/// Client api version required for EmbedUi.
pub const MIN_API_VERSION_EMBED_UI: u32 = 9;
/// From this client version on, custom-data values above 4 KiB go through a
/// temp file; older clients accept inline values up to 16 KiB.
pub const MIN_API_VERSION_SMALL_BIG_VALUE: u32 = 10;

/// Inline custom-data value limit for clients at api >= 10.
pub const BIG_VALUE_LIMIT: usize = 4 * 1024;
/// Inline custom-data value limit for older clients.
pub const BIG_VALUE_LIMIT_LEGACY: usize = 16 * 1024;

/// RT control ring payload area.
pub const RT_RING_SIZE: usize = 2048;
/// Non-RT control ring payload area (both directions).
pub const NON_RT_RING_SIZE: usize = 64 * 1024;
/// RT MIDI-out scratch region.
pub const RT_MIDI_OUT_SIZE: usize = 512;
/// Largest MIDI event deliverable through the RT ring (status + 3 data).
pub const RT_MAX_MIDI_EVENT_SIZE: usize = 4;
/// Per-port bound on queued MIDI input events in one cycle.
pub const MAX_MIDI_EVENT_COUNT: usize = 512;

/// String caps on the wire. Oversized strings are truncated before sending.
pub const MAX_REAL_NAME_LEN: usize = 64;
pub const MAX_LABEL_LEN: usize = 256;
pub const MAX_MAKER_LEN: usize = 64;
pub const MAX_COPYRIGHT_LEN: usize = 64;
pub const MAX_PORT_NAME_LEN: usize = 256;

/// Environment variable carrying the four concatenated 6-char shm suffixes,
/// in order {audio pool, rt client, non-rt client, non-rt server}.
pub const ENV_SHM_IDS: &str = "ENGINE_BRIDGE_SHM_IDS";
/// Length of one shm name suffix.
pub const SHM_SUFFIX_LEN: usize = 6;

pub const SHM_PREFIX_AUDIO_POOL: &str = "halcyon-bridge_shm_ap_";
pub const SHM_PREFIX_RT_CLIENT: &str = "halcyon-bridge_shm_rtC_";
pub const SHM_PREFIX_NON_RT_CLIENT: &str = "halcyon-bridge_shm_nonrtC_";
pub const SHM_PREFIX_NON_RT_SERVER: &str = "halcyon-bridge_shm_nonrtS_";

// ---------------------------------------------------------------------------
// Opcodes

macro_rules! wire_opcode {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident = $value:literal,)+ }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u32)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value,)+
        }

        impl $name {
            pub fn from_u32(raw: u32) -> Option<Self> {
                match raw {
                    $($value => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl From<$name> for u32 {
            fn from(op: $name) -> u32 {
                op as u32
            }
        }
    };
}

wire_opcode! {
    /// Server -> client messages on the small real-time ring. The client
    /// never writes commands here; its RT output travels through the audio
    /// pool and the MIDI-out scratch.
    RtClientOpcode {
        Null = 0,
        /// u64 new pool size in bytes; client must remap.
        SetAudioPool = 1,
        /// u32 frames.
        SetBufferSize = 2,
        /// f64 sample rate.
        SetSampleRate = 3,
        /// bool offline.
        SetOnline = 4,
        /// u32 time, u8 channel, u16 param, f32 value.
        ControlEventParameter = 5,
        /// u32 time, u8 channel, u16 index.
        ControlEventMidiBank = 6,
        /// u32 time, u8 channel, u16 index.
        ControlEventMidiProgram = 7,
        /// u32 time, u8 channel.
        ControlEventAllSoundOff = 8,
        /// u32 time, u8 channel.
        ControlEventAllNotesOff = 9,
        /// u32 time, u8 port, u8 size, u8 data[size]; size <= 4.
        MidiEvent = 10,
        /// u32 frames.
        Process = 11,
        Quit = 12,
    }
}

wire_opcode! {
    /// Host -> child messages on the large non-RT ring.
    NonRtClientOpcode {
        Null = 0,
        /// u32 api, u32 sizeof(RtClientData), u32 sizeof(NonRtClientData),
        /// u32 sizeof(NonRtServerData). First message after mapping.
        Version = 1,
        Ping = 2,
        /// bool enabled.
        PingOnOff = 3,
        Activate = 4,
        Deactivate = 5,
        /// u32 buffer size, f64 sample rate.
        InitialSetup = 6,
        /// u32 index, f32 value.
        SetParameterValue = 7,
        /// u32 index, u8 channel.
        SetParameterMidiChannel = 8,
        /// u32 index, i16 control index.
        SetParameterMappedControlIndex = 9,
        /// u32 index, f32 min, f32 max.
        SetParameterMappedRange = 10,
        /// i32 index.
        SetProgram = 11,
        /// i32 index.
        SetMidiProgram = 12,
        /// str type, str key, bool via_file, str value-or-path.
        SetCustomData = 13,
        /// str path.
        SetChunkDataFile = 14,
        /// i16 channel.
        SetCtrlChannel = 15,
        /// u32 option, bool yes.
        SetOption = 16,
        /// u32 bitset.
        SetOptions = 17,
        PrepareForSave = 18,
        RestoreLv2State = 19,
        ShowUi = 20,
        HideUi = 21,
        /// u64 platform window handle.
        EmbedUi = 22,
        /// str title.
        SetWindowTitle = 23,
        /// u32 index, f32 value.
        UiParameterChange = 24,
        /// u32 index.
        UiProgramChange = 25,
        /// u32 index.
        UiMidiProgramChange = 26,
        /// u8 channel, u8 note, u8 velocity.
        UiNoteOn = 27,
        /// u8 channel, u8 note.
        UiNoteOff = 28,
        /// i32 index.
        GetParameterText = 29,
        Quit = 30,
    }
}

wire_opcode! {
    /// Child -> host messages on the large non-RT ring.
    NonRtServerOpcode {
        Null = 0,
        /// u32 api.
        Version = 1,
        Pong = 2,
        /// u32 category, u32 hints, u32 options available, u32 options
        /// enabled, i64 unique id.
        PluginInfo1 = 3,
        /// str real name, str label, str maker, str copyright.
        PluginInfo2 = 4,
        /// u32 ins, u32 outs.
        AudioCount = 5,
        /// u32 ins, u32 outs.
        MidiCount = 6,
        /// u32 ins, u32 outs.
        CvCount = 7,
        /// u8 type, u32 index, str name.
        PortName = 8,
        /// u32 count.
        ParameterCount = 9,
        /// u32 index, i32 rindex, u32 type, u32 hints, u8 midi channel,
        /// i16 mapped control index.
        ParameterData1 = 10,
        /// u32 index, str name, str symbol, str unit.
        ParameterData2 = 11,
        /// u32 index, f32 def, f32 min, f32 max, f32 step, f32 step small,
        /// f32 step large.
        ParameterRanges = 12,
        /// u32 index, f32 value. Authoritative, fires host callbacks.
        ParameterValue = 13,
        /// u32 index, f32 value. Informational; dropped under pressure.
        ParameterValue2 = 14,
        /// u32 index, f32 value.
        DefaultValue = 15,
        /// u32 index, bool touched.
        ParameterTouch = 16,
        /// u32 count.
        ProgramCount = 17,
        /// u32 index, str name.
        ProgramName = 18,
        /// u32 count.
        MidiProgramCount = 19,
        /// u32 index, u32 bank, u32 program, str name.
        MidiProgramData = 20,
        /// i32 index.
        CurrentProgram = 21,
        /// i32 index.
        CurrentMidiProgram = 22,
        /// i32 index, str text. Reply to GetParameterText.
        SetParameterText = 23,
        /// str type, str key, bool via_file, str value-or-path.
        SetCustomData = 24,
        /// str path.
        SetChunkDataFile = 25,
        /// u32 frames.
        SetLatency = 26,
        Saved = 27,
        Ready = 28,
        UiClosed = 29,
        /// u64 handle.
        RespEmbedUi = 30,
        /// u32 width, u32 height.
        ResizeEmbedUi = 31,
        /// str message.
        Error = 32,
    }
}

// ---------------------------------------------------------------------------
// Port and parameter model

/// Port class tag used by `PortName` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PortType {
    AudioIn = 0,
    AudioOut = 1,
    CvIn = 2,
    CvOut = 3,
    MidiIn = 4,
    MidiOut = 5,
}

impl PortType {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::AudioIn),
            1 => Some(Self::AudioOut),
            2 => Some(Self::CvIn),
            3 => Some(Self::CvOut),
            4 => Some(Self::MidiIn),
            5 => Some(Self::MidiOut),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ParameterType {
    Input = 0,
    Output = 1,
}

impl ParameterType {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Input),
            1 => Some(Self::Output),
            _ => None,
        }
    }
}

/// Parameter hint bits.
pub mod param_hints {
    pub const ENABLED: u32 = 1 << 0;
    pub const AUTOMATABLE: u32 = 1 << 1;
    pub const READ_ONLY: u32 = 1 << 2;
    pub const BOOLEAN: u32 = 1 << 3;
    pub const INTEGER: u32 = 1 << 4;
    pub const LOGARITHMIC: u32 = 1 << 5;
    pub const USES_SAMPLE_RATE: u32 = 1 << 6;
    pub const USES_SCALE_POINTS: u32 = 1 << 7;
}

/// Plugin option bits for SetOption/SetOptions.
pub mod plugin_options {
    pub const FIXED_BUFFERS: u32 = 1 << 0;
    pub const FORCE_STEREO: u32 = 1 << 1;
    pub const MAP_PROGRAM_CHANGES: u32 = 1 << 2;
    pub const USE_CHUNKS: u32 = 1 << 3;
    pub const SEND_CONTROL_CHANGES: u32 = 1 << 4;
    pub const SEND_CHANNEL_PRESSURE: u32 = 1 << 5;
    pub const SEND_NOTE_AFTERTOUCH: u32 = 1 << 6;
    pub const SEND_PITCHBEND: u32 = 1 << 7;
    pub const SEND_ALL_SOUND_OFF: u32 = 1 << 8;
    pub const SEND_PROGRAM_CHANGES: u32 = 1 << 9;
}

/// Plugin hint bits for PluginInfo1.
pub mod plugin_hints {
    pub const IS_SYNTH: u32 = 1 << 0;
    pub const HAS_CUSTOM_UI: u32 = 1 << 1;
    pub const CAN_EMBED_UI: u32 = 1 << 2;
    pub const USES_CHUNKS: u32 = 1 << 3;
    pub const HAS_MIDI_PROGRAMS: u32 = 1 << 4;
}

/// Coarse plugin category for PluginInfo1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum PluginCategory {
    #[default]
    None = 0,
    Synth = 1,
    Delay = 2,
    Eq = 3,
    Filter = 4,
    Distortion = 5,
    Dynamics = 6,
    Modulator = 7,
    Utility = 8,
    Other = 9,
}

// ---------------------------------------------------------------------------
// Time model

/// BBT portion of `BridgeTimeInfo` is valid.
pub const TIME_INFO_VALID_BBT: u32 = 1 << 0;

/// Fixed POD written by the server at a known offset of the RT control
/// region before each `Process`, read by the client during the cycle only.
/// Field order is chosen so natural alignment introduces no padding; both
/// sides verify the containing struct size at handshake.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct BridgeTimeInfo {
    pub frame: u64,
    pub usecs: u64,
    pub playing: u32,
    pub valid_flags: u32,
    pub bar: i32,
    pub beat: i32,
    pub tick: f64,
    pub bar_start_tick: f64,
    pub beats_per_bar: f32,
    pub beat_type: f32,
    pub ticks_per_beat: f64,
    pub beats_per_minute: f64,
}

impl Default for BridgeTimeInfo {
    fn default() -> Self {
        Self {
            frame: 0,
            usecs: 0,
            playing: 0,
            valid_flags: 0,
            bar: 0,
            beat: 0,
            tick: 0.0,
            bar_start_tick: 0.0,
            beats_per_bar: 4.0,
            beat_type: 4.0,
            ticks_per_beat: 960.0,
            beats_per_minute: 120.0,
        }
    }
}

/// Host-facing transport snapshot, converted to `BridgeTimeInfo` on the way
/// into shared memory.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransportInfo {
    pub playing: bool,
    pub frame: u64,
    pub usecs: u64,
    pub bbt: Option<TransportBbt>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportBbt {
    pub bar: i32,
    pub beat: i32,
    pub tick: f64,
    pub bar_start_tick: f64,
    pub beats_per_bar: f32,
    pub beat_type: f32,
    pub ticks_per_beat: f64,
    pub beats_per_minute: f64,
}

impl From<&TransportInfo> for BridgeTimeInfo {
    fn from(t: &TransportInfo) -> Self {
        let mut info = BridgeTimeInfo {
            frame: t.frame,
            usecs: t.usecs,
            playing: t.playing as u32,
            ..Default::default()
        };
        if let Some(bbt) = t.bbt {
            info.valid_flags |= TIME_INFO_VALID_BBT;
            info.bar = bbt.bar;
            info.beat = bbt.beat;
            info.tick = bbt.tick;
            info.bar_start_tick = bbt.bar_start_tick;
            info.beats_per_bar = bbt.beats_per_bar;
            info.beat_type = bbt.beat_type;
            info.ticks_per_beat = bbt.ticks_per_beat;
            info.beats_per_minute = bbt.beats_per_minute;
        }
        info
    }
}

impl BridgeTimeInfo {
    pub fn to_transport(&self) -> TransportInfo {
        TransportInfo {
            playing: self.playing != 0,
            frame: self.frame,
            usecs: self.usecs,
            bbt: (self.valid_flags & TIME_INFO_VALID_BBT != 0).then(|| TransportBbt {
                bar: self.bar,
                beat: self.beat,
                tick: self.tick,
                bar_start_tick: self.bar_start_tick,
                beats_per_bar: self.beats_per_bar,
                beat_type: self.beat_type,
                ticks_per_beat: self.ticks_per_beat,
                beats_per_minute: self.beats_per_minute,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Events

/// One event queued by the host for the next process cycle. Delivered to the
/// plugin in ring order; the `time` field is a frame offset inside the block
/// and is advisory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProcessEvent {
    Parameter { time: u32, channel: u8, index: u16, value: f32 },
    MidiBank { time: u32, channel: u8, bank: u16 },
    MidiProgram { time: u32, channel: u8, program: u16 },
    AllSoundOff { time: u32, channel: u8 },
    AllNotesOff { time: u32, channel: u8 },
    Midi(MidiEvent),
}

/// Raw MIDI event with inline payload. RT-delivered events carry at most
/// `RT_MAX_MIDI_EVENT_SIZE` bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MidiEvent {
    pub time: u32,
    pub port: u8,
    pub size: u8,
    pub data: [u8; RT_MAX_MIDI_EVENT_SIZE],
}

impl MidiEvent {
    pub fn new(time: u32, port: u8, data: &[u8]) -> Self {
        debug_assert!(!data.is_empty() && data.len() <= RT_MAX_MIDI_EVENT_SIZE);
        let mut buf = [0u8; RT_MAX_MIDI_EVENT_SIZE];
        let size = data.len().min(RT_MAX_MIDI_EVENT_SIZE);
        buf[..size].copy_from_slice(&data[..size]);
        Self { time, port, size: size as u8, data: buf }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.size as usize]
    }
}

// ---------------------------------------------------------------------------
// Process invocation

/// Plugin format tag passed as the first child argv element. The strings are
/// a stable external interface; the wrapper in the child selects its loader
/// from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginType {
    Internal,
    Ladspa,
    Dssi,
    Lv2,
    Vst2,
    Vst3,
    Sf2,
    Sfz,
    Jsfx,
    Jack,
}

impl PluginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Internal => "Internal",
            Self::Ladspa => "LADSPA",
            Self::Dssi => "DSSI",
            Self::Lv2 => "LV2",
            Self::Vst2 => "VST2",
            Self::Vst3 => "VST3",
            Self::Sf2 => "SF2",
            Self::Sfz => "SFZ",
            Self::Jsfx => "JSFX",
            Self::Jack => "JACK",
        }
    }

    pub fn from_str_tag(s: &str) -> Option<Self> {
        match s {
            "Internal" => Some(Self::Internal),
            "LADSPA" => Some(Self::Ladspa),
            "DSSI" => Some(Self::Dssi),
            "LV2" => Some(Self::Lv2),
            "VST2" => Some(Self::Vst2),
            "VST3" => Some(Self::Vst3),
            "SF2" => Some(Self::Sf2),
            "SFZ" => Some(Self::Sfz),
            "JSFX" => Some(Self::Jsfx),
            "JACK" => Some(Self::Jack),
            _ => None,
        }
    }
}

/// Placeholder argv element for plugins without an on-disk file.
pub const NO_FILENAME: &str = "(none)";

// ---------------------------------------------------------------------------
// String helpers

/// Truncate to `max` bytes on a char boundary. The wire caps are generous;
/// this only matters for hostile or broken plugin metadata.
pub fn clamp_str(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_round_trip() {
        for raw in 0..=12u32 {
            let op = RtClientOpcode::from_u32(raw).unwrap();
            assert_eq!(u32::from(op), raw);
        }
        assert_eq!(RtClientOpcode::from_u32(13), None);

        for raw in 0..=30u32 {
            let op = NonRtClientOpcode::from_u32(raw).unwrap();
            assert_eq!(u32::from(op), raw);
        }
        assert_eq!(NonRtClientOpcode::from_u32(31), None);

        for raw in 0..=32u32 {
            let op = NonRtServerOpcode::from_u32(raw).unwrap();
            assert_eq!(u32::from(op), raw);
        }
        assert_eq!(NonRtServerOpcode::from_u32(33), None);
    }

    #[test]
    fn test_time_info_layout_has_no_padding() {
        // 2 x u64 + 4 x u32/i32 + 2 x f64 + 2 x f32 + 2 x f64
        assert_eq!(std::mem::size_of::<BridgeTimeInfo>(), 72);
        assert_eq!(std::mem::align_of::<BridgeTimeInfo>(), 8);
    }

    #[test]
    fn test_transport_conversion_round_trip() {
        let transport = TransportInfo {
            playing: true,
            frame: 48_000,
            usecs: 1_000_000,
            bbt: Some(TransportBbt {
                bar: 3,
                beat: 2,
                tick: 120.5,
                bar_start_tick: 0.0,
                beats_per_bar: 4.0,
                beat_type: 4.0,
                ticks_per_beat: 960.0,
                beats_per_minute: 140.0,
            }),
        };
        let info = BridgeTimeInfo::from(&transport);
        assert_eq!(info.valid_flags & TIME_INFO_VALID_BBT, TIME_INFO_VALID_BBT);
        assert_eq!(info.to_transport(), transport);
    }

    #[test]
    fn test_transport_without_bbt() {
        let transport = TransportInfo { playing: false, frame: 7, usecs: 9, bbt: None };
        let info = BridgeTimeInfo::from(&transport);
        assert_eq!(info.valid_flags, 0);
        assert_eq!(info.to_transport(), transport);
    }

    #[test]
    fn test_midi_event_inline_payload() {
        let ev = MidiEvent::new(10, 0, &[0x90, 0x3C, 0x7F]);
        assert_eq!(ev.bytes(), &[0x90, 0x3C, 0x7F]);
        assert_eq!(ev.size, 3);
    }

    #[test]
    fn test_clamp_str_respects_char_boundaries() {
        assert_eq!(clamp_str("hello", 10), "hello");
        assert_eq!(clamp_str("hello", 3), "hel");
        // 'é' is two bytes; cutting through it must back off
        assert_eq!(clamp_str("aé", 2), "a");
    }

    #[test]
    fn test_port_type_tags() {
        assert_eq!(PortType::from_u8(0), Some(PortType::AudioIn));
        assert_eq!(PortType::from_u8(5), Some(PortType::MidiOut));
        assert_eq!(PortType::from_u8(6), None);
    }
}
