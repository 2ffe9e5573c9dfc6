//! Contiguous float pool holding every audio and CV channel of one plugin.
//!
//! Layout, in server order: audio-in channels, audio-out channels, CV-in,
//! CV-out; each channel is `buffer_frames` consecutive samples. The pool has
//! exactly one user at a time - the side currently holding the rendezvous
//! baton - so no locking guards it; the semaphore pair is the
//! synchronisation.

use crate::error::{BridgeError, Result};
use crate::protocol::SHM_PREFIX_AUDIO_POOL;
use crate::shm::ShmRegion;

pub struct AudioPool {
    region: ShmRegion,
}

impl AudioPool {
    /// Server side: reserve a region. It stays unmapped until the first
    /// `resize`.
    pub fn create() -> Result<Self> {
        Ok(Self { region: ShmRegion::create_temp(SHM_PREFIX_AUDIO_POOL)? })
    }

    /// Client side: attach by suffix. Mapping happens on `SetAudioPool`.
    pub fn attach(suffix: &str) -> Result<Self> {
        let name = format!("{SHM_PREFIX_AUDIO_POOL}{suffix}");
        Ok(Self { region: ShmRegion::attach(&name)? })
    }

    pub fn suffix(&self) -> &str {
        self.region.suffix()
    }

    /// Server side: grow the backing to the new channel count and buffer
    /// size, remap and zero. Returns the byte size to announce to the client
    /// via `SetAudioPool`. Only called between process cycles.
    pub fn resize(&mut self, buffer_frames: u32, audio_ports: u32, cv_ports: u32) -> Result<u64> {
        let floats = (audio_ports + cv_ports) as usize * buffer_frames as usize;
        let bytes = (floats * std::mem::size_of::<f32>()).max(std::mem::size_of::<f32>());
        self.region.map(bytes)?;
        unsafe { std::ptr::write_bytes(self.region.as_mut_ptr(), 0, bytes) };
        Ok(bytes as u64)
    }

    /// Client side: drop the old view and map at the size the server
    /// announced.
    pub fn remap(&mut self, bytes: u64) -> Result<()> {
        self.region.map(bytes as usize)?;
        Ok(())
    }

    pub fn byte_len(&self) -> usize {
        self.region.len()
    }

    pub fn float_len(&self) -> usize {
        self.region.len() / std::mem::size_of::<f32>()
    }

    pub fn is_mapped(&self) -> bool {
        self.region.is_mapped()
    }

    /// Zero the whole pool. Used when a cycle must output silence.
    pub fn clear(&self) {
        if self.region.is_mapped() {
            unsafe { std::ptr::write_bytes(self.region.as_mut_ptr(), 0, self.region.len()) };
        }
    }

    fn channel_offset(&self, channel: usize, frames: usize) -> Result<usize> {
        let offset = channel * frames;
        if offset + frames > self.float_len() {
            return Err(BridgeError::InvalidArgument(format!(
                "channel {channel} x {frames} frames exceeds pool of {} floats",
                self.float_len()
            )));
        }
        Ok(offset)
    }

    /// Copy one channel's samples into the pool. Caller must hold the baton.
    pub fn write_channel(&self, channel: usize, frames: usize, data: &[f32]) -> Result<()> {
        let offset = self.channel_offset(channel, frames)?;
        let count = data.len().min(frames);
        unsafe {
            let base = self.region.as_mut_ptr() as *mut f32;
            std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(offset), count);
        }
        Ok(())
    }

    /// Copy one channel's samples out of the pool. Caller must hold the
    /// baton. Returns the number of samples copied.
    pub fn read_channel_into(&self, channel: usize, frames: usize, out: &mut [f32]) -> Result<usize> {
        let offset = self.channel_offset(channel, frames)?;
        let count = out.len().min(frames);
        unsafe {
            let base = self.region.as_mut_ptr() as *const f32;
            std::ptr::copy_nonoverlapping(base.add(offset), out.as_mut_ptr(), count);
        }
        Ok(count)
    }

    /// Raw pointer to one channel, for the client side to hand the plugin
    /// zero-copy slices. Caller must hold the baton and stay inside
    /// `frames` samples.
    pub fn channel_ptr(&self, channel: usize, frames: usize) -> Result<*mut f32> {
        let offset = self.channel_offset(channel, frames)?;
        Ok(unsafe { (self.region.as_mut_ptr() as *mut f32).add(offset) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_and_layout() {
        let mut pool = AudioPool::create().unwrap();
        let bytes = pool.resize(512, 4, 2).unwrap();
        assert_eq!(bytes, 6 * 512 * 4);
        assert_eq!(pool.float_len(), 6 * 512);
    }

    #[test]
    fn test_zero_ports_still_maps() {
        let mut pool = AudioPool::create().unwrap();
        let bytes = pool.resize(512, 0, 0).unwrap();
        assert_eq!(bytes, std::mem::size_of::<f32>() as u64);
    }

    #[test]
    fn test_channel_round_trip_across_attach() {
        let mut server = AudioPool::create().unwrap();
        let bytes = server.resize(128, 2, 0).unwrap();

        let mut client = AudioPool::attach(server.suffix()).unwrap();
        client.remap(bytes).unwrap();

        let ramp: Vec<f32> = (0..128).map(|i| i as f32 * 0.25).collect();
        server.write_channel(1, 128, &ramp).unwrap();

        let mut back = vec![0.0f32; 128];
        let copied = client.read_channel_into(1, 128, &mut back).unwrap();
        assert_eq!(copied, 128);
        assert_eq!(back, ramp);

        // Channel 0 stays silent.
        client.read_channel_into(0, 128, &mut back).unwrap();
        assert!(back.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_out_of_range_channel_rejected() {
        let mut pool = AudioPool::create().unwrap();
        pool.resize(64, 2, 0).unwrap();
        let mut out = vec![0.0f32; 64];
        assert!(pool.read_channel_into(2, 64, &mut out).is_err());
        assert!(pool.write_channel(5, 64, &out).is_err());
    }

    #[test]
    fn test_clear_silences_pool() {
        let mut pool = AudioPool::create().unwrap();
        pool.resize(32, 1, 0).unwrap();
        pool.write_channel(0, 32, &[1.0f32; 32]).unwrap();
        pool.clear();
        let mut out = [9.0f32; 32];
        pool.read_channel_into(0, 32, &mut out).unwrap();
        assert!(out.iter().all(|s| *s == 0.0));
    }
}
