//! Real-time control channel.
//!
//! The small shared region driving the audio cycle: the semaphore pair for
//! the rendezvous, a 2 KiB ring carrying the cycle's opcodes (server to
//! client only), the `BridgeTimeInfo` block, a `proc_flags` byte the client
//! uses to ask for deactivation, and a fixed scratch area where the client
//! packs the plugin's MIDI output.
//!
//! MIDI-out framing: `{u32 time, u8 port, u8 size, u8 data[size]}` records
//! back to back, terminated by a zero-size header. Records that would
//! overflow the scratch are dropped; that loss is part of the contract.

use crate::error::Result;
use crate::protocol::{BridgeTimeInfo, RtClientOpcode, RT_MIDI_OUT_SIZE, RT_RING_SIZE,
                      SHM_PREFIX_RT_CLIENT};
use crate::ring::{Ring, RingControl};
use crate::sem::{SemPair, SemPairView};
use crate::shm::ShmRegion;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

/// Client asks the server to deactivate it (bit 0 of `proc_flags`).
pub const PROC_FLAG_WANTS_DEACTIVATE: u8 = 1 << 0;

const MIDI_OUT_HEADER: usize = 6;

/// The RT control region layout. Both sides verify `size_of` of this struct
/// during the handshake so an ABI drift is caught before the first cycle.
#[repr(C)]
pub struct RtClientData {
    pub sem: SemPair,
    pub ring: RingControl<RT_RING_SIZE>,
    pub time_info: BridgeTimeInfo,
    pub proc_flags: AtomicU8,
    _pad: [u8; 7],
    pub midi_out: [u8; RT_MIDI_OUT_SIZE],
}

pub struct RtClientControl {
    region: ShmRegion,
    sem: SemPairView,
    ring: Ring<RT_RING_SIZE>,
    is_server: bool,
    /// Client-local cursor into the MIDI-out scratch for the current cycle.
    midi_out_cursor: usize,
}

impl RtClientControl {
    /// Server side: create the region, zero it, init ring and semaphores.
    pub fn init_server() -> Result<Self> {
        let mut region = ShmRegion::create_temp(SHM_PREFIX_RT_CLIENT)?;
        region.map(std::mem::size_of::<RtClientData>())?;
        unsafe {
            std::ptr::write_bytes(region.as_mut_ptr(), 0, std::mem::size_of::<RtClientData>())
        };

        let data = region.as_mut_ptr() as *mut RtClientData;
        let ring = unsafe { Ring::from_ptr(std::ptr::addr_of_mut!((*data).ring)) };
        ring.init();

        let suffix = region.suffix().to_string();
        let mut sem =
            unsafe { SemPairView::new(std::ptr::addr_of_mut!((*data).sem), &suffix, true) };
        sem.init()?;

        Ok(Self { region, sem, ring, is_server: true, midi_out_cursor: 0 })
    }

    /// Client side: attach and connect to the server's semaphores.
    pub fn attach_client(suffix: &str) -> Result<Self> {
        let name = format!("{SHM_PREFIX_RT_CLIENT}{suffix}");
        let mut region = ShmRegion::attach(&name)?;
        region.map(std::mem::size_of::<RtClientData>())?;

        let data = region.as_mut_ptr() as *mut RtClientData;
        let ring = unsafe { Ring::from_ptr(std::ptr::addr_of_mut!((*data).ring)) };
        let mut sem =
            unsafe { SemPairView::new(std::ptr::addr_of_mut!((*data).sem), suffix, false) };
        sem.connect()?;

        Ok(Self { region, sem, ring, is_server: false, midi_out_cursor: 0 })
    }

    pub fn suffix(&self) -> &str {
        self.region.suffix()
    }

    pub fn ring(&self) -> &Ring<RT_RING_SIZE> {
        &self.ring
    }

    fn data(&self) -> *mut RtClientData {
        self.region.as_mut_ptr() as *mut RtClientData
    }

    // -- opcode IO ----------------------------------------------------------

    pub fn write_opcode(&self, opcode: RtClientOpcode) {
        debug_assert!(self.is_server);
        self.ring.write_opcode_raw(opcode.into());
    }

    pub fn read_opcode(&self) -> Result<Option<RtClientOpcode>> {
        debug_assert!(!self.is_server);
        let raw = self.ring.read_opcode_raw()?;
        Ok(RtClientOpcode::from_u32(raw))
    }

    pub fn commit_write(&self) -> bool {
        self.ring.commit_write()
    }

    pub fn is_data_available_for_reading(&self) -> bool {
        self.ring.is_data_available_for_reading()
    }

    // -- time info ----------------------------------------------------------

    /// Server only, and only while holding the baton.
    pub fn set_time_info(&self, info: &BridgeTimeInfo) {
        debug_assert!(self.is_server);
        unsafe { std::ptr::addr_of_mut!((*self.data()).time_info).write(*info) };
    }

    /// Client only, during the process opcode.
    pub fn time_info(&self) -> BridgeTimeInfo {
        debug_assert!(!self.is_server);
        unsafe { std::ptr::addr_of!((*self.data()).time_info).read() }
    }

    // -- proc flags ---------------------------------------------------------

    /// Client: request deactivation. Written only while holding the baton.
    pub fn set_wants_deactivate(&self) {
        unsafe { &(*self.data()).proc_flags }
            .store(PROC_FLAG_WANTS_DEACTIVATE, Ordering::Release);
    }

    /// Server: fetch and clear the flags after a cycle.
    pub fn take_proc_flags(&self) -> u8 {
        unsafe { &(*self.data()).proc_flags }.swap(0, Ordering::AcqRel)
    }

    // -- rendezvous ---------------------------------------------------------

    /// Server: start a cycle and wait for the client to finish it.
    pub fn wait_for_client(&self, timeout: Duration) -> bool {
        debug_assert!(self.is_server);
        self.sem.post_server();
        self.sem.wait_client(timeout)
    }

    /// Server: check for a late client post without starting a new cycle.
    /// Used to recover from a single rendezvous timeout.
    pub fn wait_client_only(&self, timeout: Duration) -> bool {
        debug_assert!(self.is_server);
        self.sem.wait_client(timeout)
    }

    /// Client: wait for the server to hand over the baton.
    pub fn wait_for_server(&self, timeout: Duration) -> bool {
        debug_assert!(!self.is_server);
        self.sem.wait_server(timeout)
    }

    /// Client: hand the baton back.
    pub fn post_client_done(&self) {
        debug_assert!(!self.is_server);
        self.sem.post_client();
    }

    // -- MIDI-out scratch ---------------------------------------------------

    fn midi_out_ptr(&self) -> *mut u8 {
        unsafe { std::ptr::addr_of_mut!((*self.data()).midi_out) as *mut u8 }
    }

    /// Client: reset the scratch for a new cycle (writes the terminator).
    pub fn midi_out_begin(&mut self) {
        self.midi_out_cursor = 0;
        unsafe { std::ptr::write_bytes(self.midi_out_ptr(), 0, MIDI_OUT_HEADER) };
    }

    /// Client: append one record and re-terminate. Returns false when the
    /// record does not fit, in which case it is silently dropped.
    pub fn midi_out_push(&mut self, time: u32, port: u8, data: &[u8]) -> bool {
        if data.is_empty() || data.len() > u8::MAX as usize {
            return false;
        }
        let needed = MIDI_OUT_HEADER + data.len();
        // Leave room for the trailing zero-size header.
        if self.midi_out_cursor + needed + MIDI_OUT_HEADER > RT_MIDI_OUT_SIZE {
            return false;
        }
        unsafe {
            let p = self.midi_out_ptr().add(self.midi_out_cursor);
            std::ptr::copy_nonoverlapping(time.to_le_bytes().as_ptr(), p, 4);
            p.add(4).write(port);
            p.add(5).write(data.len() as u8);
            std::ptr::copy_nonoverlapping(data.as_ptr(), p.add(MIDI_OUT_HEADER), data.len());
        }
        self.midi_out_cursor += needed;
        unsafe {
            std::ptr::write_bytes(self.midi_out_ptr().add(self.midi_out_cursor), 0, MIDI_OUT_HEADER)
        };
        true
    }

    /// Server: iterate the client's MIDI output until the zero-size
    /// terminator or the end of the scratch.
    pub fn for_each_midi_out(&self, mut f: impl FnMut(u32, u8, &[u8])) {
        let mut cursor = 0usize;
        let mut data = [0u8; u8::MAX as usize];
        while cursor + MIDI_OUT_HEADER <= RT_MIDI_OUT_SIZE {
            let (time, port, size) = unsafe {
                let p = self.midi_out_ptr().add(cursor);
                let mut time_bytes = [0u8; 4];
                std::ptr::copy_nonoverlapping(p, time_bytes.as_mut_ptr(), 4);
                (u32::from_le_bytes(time_bytes), p.add(4).read(), p.add(5).read() as usize)
            };
            if size == 0 {
                break;
            }
            if cursor + MIDI_OUT_HEADER + size > RT_MIDI_OUT_SIZE {
                break;
            }
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.midi_out_ptr().add(cursor + MIDI_OUT_HEADER),
                    data.as_mut_ptr(),
                    size,
                );
            }
            f(time, port, &data[..size]);
            cursor += MIDI_OUT_HEADER + size;
        }
    }
}
