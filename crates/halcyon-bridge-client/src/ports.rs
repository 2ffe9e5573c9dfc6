//! Client-side port state: pool-backed cycle buffers and bounded per-cycle
//! event queues.

use crate::handler::{MidiOutEvent, ProcessIo};
use halcyon_bridge::pool::AudioPool;
use halcyon_bridge::protocol::{ProcessEvent, MAX_MIDI_EVENT_COUNT};
use halcyon_bridge::server::PortCounts;
use halcyon_bridge::Result;
use smallvec::SmallVec;

/// Host events accumulated for the next cycle. Bounded; overflow is counted
/// and dropped rather than growing on the RT path.
#[derive(Default)]
pub struct CycleEvents {
    events: SmallVec<[ProcessEvent; 64]>,
    dropped: usize,
}

impl CycleEvents {
    pub fn push(&mut self, event: ProcessEvent) {
        if self.events.len() < MAX_MIDI_EVENT_COUNT {
            self.events.push(event);
        } else {
            self.dropped += 1;
        }
    }

    pub fn as_slice(&self) -> &[ProcessEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Inputs are cleared after every cycle.
    pub fn clear(&mut self) {
        self.events.clear();
        self.dropped = 0;
    }
}

/// Patch the pool into borrowed channel slices and hand them to `f`.
///
/// The slices alias disjoint channel ranges of the mapping: audio-in,
/// audio-out, CV-in, CV-out in pool order. Valid only while this side holds
/// the rendezvous baton, which is exactly when the RT loop calls this.
pub fn with_pool_io<R>(
    pool: &AudioPool,
    counts: &PortCounts,
    frames: u32,
    events: &[ProcessEvent],
    midi_out: &mut Vec<MidiOutEvent>,
    f: impl FnOnce(&mut ProcessIo<'_, '_>) -> R,
) -> Result<R> {
    let n = frames as usize;
    let audio_in = counts.audio_in as usize;
    let audio_out = counts.audio_out as usize;
    let cv_in = counts.cv_in as usize;
    let cv_out = counts.cv_out as usize;

    let mut in_refs: SmallVec<[&[f32]; 8]> = SmallVec::new();
    let mut out_refs: SmallVec<[&mut [f32]; 8]> = SmallVec::new();
    let mut cv_in_refs: SmallVec<[&[f32]; 4]> = SmallVec::new();
    let mut cv_out_refs: SmallVec<[&mut [f32]; 4]> = SmallVec::new();

    // SAFETY: each slice covers a distinct channel range inside the mapped
    // pool, and the mapping stays put for the duration of the call.
    unsafe {
        for i in 0..audio_in {
            in_refs.push(std::slice::from_raw_parts(pool.channel_ptr(i, n)?, n));
        }
        for i in 0..audio_out {
            out_refs.push(std::slice::from_raw_parts_mut(pool.channel_ptr(audio_in + i, n)?, n));
        }
        for i in 0..cv_in {
            cv_in_refs.push(std::slice::from_raw_parts(
                pool.channel_ptr(audio_in + audio_out + i, n)?,
                n,
            ));
        }
        for i in 0..cv_out {
            cv_out_refs.push(std::slice::from_raw_parts_mut(
                pool.channel_ptr(audio_in + audio_out + cv_in + i, n)?,
                n,
            ));
        }
    }

    let mut io = ProcessIo {
        audio_in: &in_refs,
        audio_out: &mut out_refs,
        cv_in: &cv_in_refs,
        cv_out: &mut cv_out_refs,
        events,
        midi_out,
        frames,
    };
    Ok(f(&mut io))
}

#[cfg(test)]
mod tests {
    use super::*;
    use halcyon_bridge::protocol::MidiEvent;

    #[test]
    fn test_cycle_events_bounded() {
        let mut events = CycleEvents::default();
        for i in 0..(MAX_MIDI_EVENT_COUNT + 10) {
            events.push(ProcessEvent::Midi(MidiEvent::new(i as u32, 0, &[0x90, 60, 100])));
        }
        assert_eq!(events.len(), MAX_MIDI_EVENT_COUNT);
        assert_eq!(events.dropped(), 10);
        events.clear();
        assert!(events.is_empty());
        assert_eq!(events.dropped(), 0);
    }

    #[test]
    fn test_pool_io_slices_map_to_channels() {
        let mut pool = AudioPool::create().unwrap();
        let counts = PortCounts { audio_in: 2, audio_out: 2, cv_in: 1, cv_out: 1, ..Default::default() };
        pool.resize(64, 4, 2).unwrap();

        // Host writes a ramp into audio-in 1.
        let ramp: Vec<f32> = (0..64).map(|i| i as f32).collect();
        pool.write_channel(1, 64, &ramp).unwrap();

        let mut midi_out = Vec::new();
        with_pool_io(&pool, &counts, 64, &[], &mut midi_out, |io| {
            assert_eq!(io.audio_in.len(), 2);
            assert_eq!(io.audio_out.len(), 2);
            assert_eq!(io.cv_in.len(), 1);
            assert_eq!(io.cv_out.len(), 1);
            assert_eq!(io.audio_in[1], &ramp[..]);

            // Plugin writes outputs straight into the pool.
            io.audio_out[0].fill(0.5);
            io.cv_out[0].fill(-1.0);
        })
        .unwrap();

        let mut back = vec![0.0f32; 64];
        pool.read_channel_into(2, 64, &mut back).unwrap();
        assert!(back.iter().all(|s| *s == 0.5));
        pool.read_channel_into(5, 64, &mut back).unwrap();
        assert!(back.iter().all(|s| *s == -1.0));
    }

    #[test]
    fn test_pool_io_rejects_undersized_pool() {
        let mut pool = AudioPool::create().unwrap();
        pool.resize(16, 1, 0).unwrap();
        let counts = PortCounts { audio_in: 2, audio_out: 2, ..Default::default() };
        let mut midi_out = Vec::new();
        assert!(with_pool_io(&pool, &counts, 16, &[], &mut midi_out, |_| ()).is_err());
    }
}
