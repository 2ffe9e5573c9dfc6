//! Non-real-time control channels.
//!
//! Two large rings: host-to-child commands and child-to-host responses and
//! events. Each has one fixed writer and one fixed reader. Producers are
//! responsible for flow control via `wait_if_data_is_reaching_limit` before
//! bursts; the reader drains faster when it sees the ping that helper emits.

use crate::error::Result;
use crate::protocol::{NonRtClientOpcode, NonRtServerOpcode, NON_RT_RING_SIZE,
                      SHM_PREFIX_NON_RT_CLIENT, SHM_PREFIX_NON_RT_SERVER};
use crate::ring::{Ring, RingControl};
use crate::shm::ShmRegion;
use std::time::Duration;

/// Layout of both non-RT regions; checked at handshake.
#[repr(C)]
pub struct NonRtData {
    pub ring: RingControl<NON_RT_RING_SIZE>,
}

struct NonRtChannel {
    region: ShmRegion,
    ring: Ring<NON_RT_RING_SIZE>,
}

impl NonRtChannel {
    fn create(prefix: &str) -> Result<Self> {
        let mut region = ShmRegion::create_temp(prefix)?;
        region.map(std::mem::size_of::<NonRtData>())?;
        unsafe { std::ptr::write_bytes(region.as_mut_ptr(), 0, std::mem::size_of::<NonRtData>()) };
        let data = region.as_mut_ptr() as *mut NonRtData;
        let ring = unsafe { Ring::from_ptr(std::ptr::addr_of_mut!((*data).ring)) };
        ring.init();
        Ok(Self { region, ring })
    }

    fn attach(prefix: &str, suffix: &str) -> Result<Self> {
        let name = format!("{prefix}{suffix}");
        let mut region = ShmRegion::attach(&name)?;
        region.map(std::mem::size_of::<NonRtData>())?;
        let data = region.as_mut_ptr() as *mut NonRtData;
        let ring = unsafe { Ring::from_ptr(std::ptr::addr_of_mut!((*data).ring)) };
        Ok(Self { region, ring })
    }

    /// Cooperative back-pressure before a burst of messages. If free space
    /// is below a quarter of the ring, emit `ping_opcode` so the reader
    /// hurries, then poll up to fifty 20 ms intervals for free space to rise
    /// above three quarters.
    fn wait_if_data_is_reaching_limit(&self, ping_opcode: u32) {
        if self.ring.writable_space() >= NON_RT_RING_SIZE / 4 {
            return;
        }
        self.ring.write_opcode_raw(ping_opcode);
        self.ring.commit_write();
        for _ in 0..50 {
            if self.ring.writable_space() >= NON_RT_RING_SIZE * 3 / 4 {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        tracing::warn!("non-RT ring congested; reader is not draining");
    }
}

/// Host-to-child command channel. The host writes, the child reads.
pub struct NonRtClientControl {
    inner: NonRtChannel,
}

impl NonRtClientControl {
    pub fn init_server() -> Result<Self> {
        Ok(Self { inner: NonRtChannel::create(SHM_PREFIX_NON_RT_CLIENT)? })
    }

    pub fn attach_client(suffix: &str) -> Result<Self> {
        Ok(Self { inner: NonRtChannel::attach(SHM_PREFIX_NON_RT_CLIENT, suffix)? })
    }

    pub fn suffix(&self) -> &str {
        self.inner.region.suffix()
    }

    pub fn ring(&self) -> &Ring<NON_RT_RING_SIZE> {
        &self.inner.ring
    }

    pub fn write_opcode(&self, opcode: NonRtClientOpcode) {
        self.inner.ring.write_opcode_raw(opcode.into());
    }

    pub fn read_opcode(&self) -> Result<Option<NonRtClientOpcode>> {
        Ok(NonRtClientOpcode::from_u32(self.inner.ring.read_opcode_raw()?))
    }

    pub fn commit_write(&self) -> bool {
        self.inner.ring.commit_write()
    }

    pub fn is_data_available_for_reading(&self) -> bool {
        self.inner.ring.is_data_available_for_reading()
    }

    pub fn writable_space(&self) -> usize {
        self.inner.ring.writable_space()
    }

    pub fn wait_if_data_is_reaching_limit(&self) {
        self.inner
            .wait_if_data_is_reaching_limit(NonRtClientOpcode::Ping.into());
    }
}

/// Child-to-host response/event channel. The child writes, the host reads.
pub struct NonRtServerControl {
    inner: NonRtChannel,
}

impl NonRtServerControl {
    pub fn init_server() -> Result<Self> {
        Ok(Self { inner: NonRtChannel::create(SHM_PREFIX_NON_RT_SERVER)? })
    }

    pub fn attach_client(suffix: &str) -> Result<Self> {
        Ok(Self { inner: NonRtChannel::attach(SHM_PREFIX_NON_RT_SERVER, suffix)? })
    }

    pub fn suffix(&self) -> &str {
        self.inner.region.suffix()
    }

    pub fn ring(&self) -> &Ring<NON_RT_RING_SIZE> {
        &self.inner.ring
    }

    pub fn write_opcode(&self, opcode: NonRtServerOpcode) {
        self.inner.ring.write_opcode_raw(opcode.into());
    }

    pub fn read_opcode(&self) -> Result<Option<NonRtServerOpcode>> {
        Ok(NonRtServerOpcode::from_u32(self.inner.ring.read_opcode_raw()?))
    }

    pub fn commit_write(&self) -> bool {
        self.inner.ring.commit_write()
    }

    pub fn is_data_available_for_reading(&self) -> bool {
        self.inner.ring.is_data_available_for_reading()
    }

    pub fn writable_space(&self) -> usize {
        self.inner.ring.writable_space()
    }

    pub fn wait_if_data_is_reaching_limit(&self) {
        self.inner
            .wait_if_data_is_reaching_limit(NonRtServerOpcode::Pong.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_nonrt_data_size() {
        assert_eq!(std::mem::size_of::<NonRtData>(), 16 + NON_RT_RING_SIZE);
    }

    #[test]
    fn test_command_flow_host_to_child() {
        let host = NonRtClientControl::init_server().unwrap();
        let child = NonRtClientControl::attach_client(host.suffix()).unwrap();

        host.write_opcode(NonRtClientOpcode::SetParameterValue);
        host.ring().write_u32(3);
        host.ring().write_f32(0.75);
        assert!(host.commit_write());

        assert_eq!(child.read_opcode().unwrap(), Some(NonRtClientOpcode::SetParameterValue));
        assert_eq!(child.ring().read_u32().unwrap(), 3);
        assert_eq!(child.ring().read_f32().unwrap(), 0.75);
    }

    #[test]
    fn test_event_flow_child_to_host() {
        let host = NonRtServerControl::init_server().unwrap();
        let child = NonRtServerControl::attach_client(host.suffix()).unwrap();

        child.write_opcode(NonRtServerOpcode::ParameterValue);
        child.ring().write_u32(1);
        child.ring().write_f32(0.5);
        assert!(child.commit_write());

        assert_eq!(host.read_opcode().unwrap(), Some(NonRtServerOpcode::ParameterValue));
        assert_eq!(host.ring().read_u32().unwrap(), 1);
        assert_eq!(host.ring().read_f32().unwrap(), 0.5);
    }

    #[test]
    fn test_back_pressure_is_a_noop_when_ring_is_free() {
        let host = NonRtClientControl::init_server().unwrap();
        let start = Instant::now();
        host.wait_if_data_is_reaching_limit();
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_back_pressure_returns_once_reader_drains() {
        let host = NonRtClientControl::init_server().unwrap();
        let child = NonRtClientControl::attach_client(host.suffix()).unwrap();

        // Congest the ring past the quarter-free threshold.
        let blob = [0u8; 1024];
        while host.writable_space() > NON_RT_RING_SIZE / 8 {
            host.ring().try_write(&blob);
            host.commit_write();
        }
        assert!(host.writable_space() < NON_RT_RING_SIZE / 4);

        let drainer = std::thread::spawn(move || {
            let mut sink = [0u8; 1024];
            loop {
                if child.is_data_available_for_reading() {
                    if child.ring().read_custom(&mut sink).is_err() {
                        // Tail smaller than one blob: drain it as the ping.
                        let _ = child.ring().read_u32();
                    }
                } else {
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        });

        let start = Instant::now();
        host.wait_if_data_is_reaching_limit();
        // Fifty 20 ms polls is the hard bound; a draining reader finishes
        // far earlier.
        assert!(start.elapsed() < Duration::from_secs(1));
        drainer.join().unwrap();
    }
}
