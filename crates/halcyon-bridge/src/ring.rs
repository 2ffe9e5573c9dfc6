//! Single-producer single-consumer byte ring embedded in shared memory.
//!
//! The control header and payload area live inside a shared mapping, so the
//! layout is fixed `repr(C)` and all cursor fields are accessed as atomics.
//! Exactly one process writes and exactly one process reads a given ring;
//! which side holds which role is fixed per channel.
//!
//! Messages are framed as a `u32` opcode followed by typed fields with no
//! length prefix. A write that does not fit marks the in-flight message
//! invalid; `commit_write` then rewinds to the last committed head so the
//! partial message is discarded atomically. A reader that cannot satisfy a
//! typed read has desynchronised, which is fatal for the bridge.

use crate::error::{BridgeError, Result};
use std::sync::atomic::{AtomicU32, Ordering};

/// Ring storage as it appears inside a shared-memory region.
///
/// `head` is the commit cursor (advanced only by `commit_write`), `tail` the
/// read cursor, `written` the uncommitted write cursor. One byte of capacity
/// stays unused so `head == tail` always means empty.
#[repr(C)]
pub struct RingControl<const N: usize> {
    head: AtomicU32,
    tail: AtomicU32,
    written: AtomicU32,
    invalidate: AtomicU32,
    buf: [u8; N],
}

impl<const N: usize> RingControl<N> {
    /// Heap-allocated zeroed control block, for tests and single-process use.
    pub fn new_boxed() -> Box<Self> {
        // SAFETY: zeroed atomics and a zeroed byte array are valid values.
        unsafe { Box::new(std::mem::zeroed()) }
    }
}

/// Accessor over a `RingControl` living in shared memory.
///
/// Holds a raw pointer; the channel that owns the mapping guarantees the
/// pointed-to region outlives the view and that this process only ever uses
/// one role (reader or writer) per ring.
#[derive(Clone, Copy)]
pub struct Ring<const N: usize> {
    ctrl: *mut RingControl<N>,
}

// SAFETY: the pointed-to control block is process-shared memory designed for
// one writer and one reader; cursor fields are atomics and the payload area
// is only touched between the matching acquire/release pairs below. The
// writer/reader role split is the same whether the other side is a thread
// or another process.
unsafe impl<const N: usize> Send for Ring<N> {}
unsafe impl<const N: usize> Sync for Ring<N> {}

impl<const N: usize> Ring<N> {
    /// # Safety
    ///
    /// `ctrl` must point to a properly initialised `RingControl<N>` that
    /// stays mapped for the lifetime of the view.
    pub unsafe fn from_ptr(ctrl: *mut RingControl<N>) -> Self {
        Self { ctrl }
    }

    /// Reset all cursors. Only the region owner calls this, before the other
    /// side attaches.
    pub fn init(&self) {
        let c = self.ctrl();
        c.head.store(0, Ordering::Relaxed);
        c.tail.store(0, Ordering::Relaxed);
        c.written.store(0, Ordering::Relaxed);
        c.invalidate.store(0, Ordering::Release);
    }

    fn ctrl(&self) -> &RingControl<N> {
        unsafe { &*self.ctrl }
    }

    fn buf_ptr(&self) -> *mut u8 {
        unsafe { (*self.ctrl).buf.as_ptr() as *mut u8 }
    }

    // -- reader side --------------------------------------------------------

    pub fn is_data_available_for_reading(&self) -> bool {
        let c = self.ctrl();
        c.tail.load(Ordering::Relaxed) != c.head.load(Ordering::Acquire)
    }

    fn readable_bytes(&self) -> usize {
        let c = self.ctrl();
        let head = c.head.load(Ordering::Acquire) as usize;
        let tail = c.tail.load(Ordering::Relaxed) as usize;
        (head + N - tail) % N
    }

    /// Copy exactly `dst.len()` bytes out of the ring. Failing to satisfy a
    /// framed read means the stream is broken; there is no recovery.
    pub fn read_custom(&self, dst: &mut [u8]) -> Result<()> {
        let size = dst.len();
        if size == 0 {
            return Ok(());
        }
        if self.readable_bytes() < size {
            return Err(BridgeError::ProtocolDesync(format!(
                "short read: wanted {size} bytes, ring has {}",
                self.readable_bytes()
            )));
        }

        let c = self.ctrl();
        let tail = c.tail.load(Ordering::Relaxed) as usize;
        let first = size.min(N - tail);
        unsafe {
            std::ptr::copy_nonoverlapping(self.buf_ptr().add(tail), dst.as_mut_ptr(), first);
            if first < size {
                std::ptr::copy_nonoverlapping(
                    self.buf_ptr(),
                    dst.as_mut_ptr().add(first),
                    size - first,
                );
            }
        }
        c.tail.store(((tail + size) % N) as u32, Ordering::Release);
        Ok(())
    }

    // -- writer side --------------------------------------------------------

    /// Free space available to the writer, accounting for uncommitted bytes.
    pub fn writable_space(&self) -> usize {
        let c = self.ctrl();
        let written = c.written.load(Ordering::Relaxed) as usize;
        let tail = c.tail.load(Ordering::Acquire) as usize;
        let used = (written + N - tail) % N;
        N - 1 - used
    }

    /// Append bytes to the in-flight message. If the ring cannot hold them
    /// the whole message is poisoned and will be dropped at commit.
    pub fn try_write(&self, src: &[u8]) {
        let size = src.len();
        if size == 0 {
            return;
        }
        let c = self.ctrl();
        if self.writable_space() < size {
            c.invalidate.store(1, Ordering::Relaxed);
            return;
        }
        if c.invalidate.load(Ordering::Relaxed) != 0 {
            return;
        }

        let written = c.written.load(Ordering::Relaxed) as usize;
        let first = size.min(N - written);
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.buf_ptr().add(written), first);
            if first < size {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr().add(first),
                    self.buf_ptr(),
                    size - first,
                );
            }
        }
        c.written.store(((written + size) % N) as u32, Ordering::Relaxed);
    }

    /// Publish the in-flight message, or discard it entirely if any of its
    /// writes overflowed. Returns whether the message went through.
    pub fn commit_write(&self) -> bool {
        let c = self.ctrl();
        if c.invalidate.swap(0, Ordering::Relaxed) != 0 {
            c.written
                .store(c.head.load(Ordering::Relaxed), Ordering::Relaxed);
            false
        } else {
            c.head
                .store(c.written.load(Ordering::Relaxed), Ordering::Release);
            true
        }
    }

    // -- typed accessors ----------------------------------------------------

    pub fn read_opcode_raw(&self) -> Result<u32> {
        self.read_u32()
    }

    pub fn write_opcode_raw(&self, opcode: u32) {
        self.write_u32(opcode);
    }

    pub fn read_bool(&self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn write_bool(&self, v: bool) {
        self.write_u8(v as u8);
    }

    pub fn read_custom_vec(&self, len: usize) -> Result<Vec<u8>> {
        if len > N {
            return Err(BridgeError::ProtocolDesync(format!(
                "framed payload of {len} bytes exceeds ring capacity {N}"
            )));
        }
        let mut buf = vec![0u8; len];
        self.read_custom(&mut buf)?;
        Ok(buf)
    }

    /// Length-prefixed string, no NUL terminator. Invalid UTF-8 is replaced
    /// rather than killing the bridge.
    pub fn read_string(&self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_custom_vec(len)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn write_string(&self, s: &str) {
        self.write_u32(s.len() as u32);
        self.try_write(s.as_bytes());
    }
}

macro_rules! scalar_accessors {
    ($($read:ident, $write:ident, $ty:ty;)+) => {
        impl<const N: usize> Ring<N> {
            $(
                pub fn $read(&self) -> Result<$ty> {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    self.read_custom(&mut buf)?;
                    Ok(<$ty>::from_le_bytes(buf))
                }

                pub fn $write(&self, v: $ty) {
                    self.try_write(&v.to_le_bytes());
                }
            )+
        }
    };
}

scalar_accessors! {
    read_u8, write_u8, u8;
    read_u16, write_u16, u16;
    read_u32, write_u32, u32;
    read_u64, write_u64, u64;
    read_i8, write_i8, i8;
    read_i16, write_i16, i16;
    read_i32, write_i32, i32;
    read_i64, write_i64, i64;
    read_f32, write_f32, f32;
    read_f64, write_f64, f64;
}
