//! Process-shared semaphore pair for the real-time rendezvous.
//!
//! Two counting semaphores: "server-runs" is posted by the server when a
//! cycle's messages are committed, "client-runs" is posted by the client
//! when the cycle is done. On most unixes both live inline in the RT shared
//! region as `sem_t`; macOS and Windows lack process-shared inline
//! semaphores, so there the cells stay unused and named kernel semaphores
//! derived from the region suffix are used instead.

use crate::error::{BridgeError, Result};
use std::time::Duration;

/// Storage for one inline semaphore. 32-byte cells leave room for either a
/// 32-bit or a 64-bit `sem_t`, so mixed-arch pairs agree on the layout.
#[repr(C, align(32))]
pub struct SemCell {
    _storage: [u8; 32],
}

/// The pair as it appears at the start of the RT control region.
#[repr(C)]
pub struct SemPair {
    pub server: SemCell,
    pub client: SemCell,
}

#[cfg(all(unix, not(target_os = "macos")))]
const _: () = assert!(std::mem::size_of::<libc::sem_t>() <= std::mem::size_of::<SemCell>());

pub struct SemPairView {
    #[cfg_attr(not(all(unix, not(target_os = "macos"))), allow(dead_code))]
    pair: *mut SemPair,
    is_server: bool,
    initialized: bool,
    #[cfg(target_os = "macos")]
    named: [*mut libc::sem_t; 2],
    #[cfg(target_os = "macos")]
    names: [std::ffi::CString; 2],
    #[cfg(windows)]
    handles: [windows::Win32::Foundation::HANDLE; 2],
    #[cfg(any(target_os = "macos", windows))]
    suffix: String,
}

// SAFETY: posting and waiting are kernel operations on process-shared
// semaphores; the raw pointer only addresses pinned shared memory.
unsafe impl Send for SemPairView {}
unsafe impl Sync for SemPairView {}

impl SemPairView {
    /// # Safety
    ///
    /// `pair` must point into a mapped shared region that outlives the view.
    pub unsafe fn new(pair: *mut SemPair, suffix: &str, is_server: bool) -> Self {
        let _ = suffix;
        Self {
            pair,
            is_server,
            initialized: false,
            #[cfg(target_os = "macos")]
            named: [std::ptr::null_mut(); 2],
            #[cfg(target_os = "macos")]
            names: [
                // Suffixes are alphanumeric, so the NUL-free invariant holds.
                std::ffi::CString::new(format!("/hcy-s-{suffix}"))
                    .unwrap_or_else(|_| std::ffi::CString::from(c"/hcy-s")),
                std::ffi::CString::new(format!("/hcy-c-{suffix}"))
                    .unwrap_or_else(|_| std::ffi::CString::from(c"/hcy-c")),
            ],
            #[cfg(windows)]
            handles: [windows::Win32::Foundation::HANDLE(0); 2],
            #[cfg(any(target_os = "macos", windows))]
            suffix: suffix.to_string(),
        }
    }

    /// Server side: create both semaphores with an initial count of zero.
    pub fn init(&mut self) -> Result<()> {
        debug_assert!(self.is_server);
        self.create_or_open(true)?;
        self.initialized = true;
        Ok(())
    }

    /// Client side: connect to the semaphores the server created.
    pub fn connect(&mut self) -> Result<()> {
        debug_assert!(!self.is_server);
        self.create_or_open(false)?;
        self.initialized = true;
        Ok(())
    }

    /// Wake the client for a new cycle.
    pub fn post_server(&self) {
        self.post(0);
    }

    /// Hand the baton back to the server.
    pub fn post_client(&self) {
        self.post(1);
    }

    /// Client: wait for the server to start a cycle.
    pub fn wait_server(&self, timeout: Duration) -> bool {
        self.timed_wait(0, timeout)
    }

    /// Server: wait for the client to finish the cycle.
    pub fn wait_client(&self, timeout: Duration) -> bool {
        self.timed_wait(1, timeout)
    }

    // -- unix (inline sem_t) ------------------------------------------------

    #[cfg(all(unix, not(target_os = "macos")))]
    fn sem_at(&self, index: usize) -> *mut libc::sem_t {
        let base = self.pair as *mut u8;
        unsafe { base.add(index * std::mem::size_of::<SemCell>()) as *mut libc::sem_t }
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    fn create_or_open(&mut self, create: bool) -> Result<()> {
        if create {
            for index in 0..2 {
                if unsafe { libc::sem_init(self.sem_at(index), 1, 0) } != 0 {
                    return Err(BridgeError::SemInit(format!(
                        "sem_init: {}",
                        std::io::Error::last_os_error()
                    )));
                }
            }
        }
        // The inline sem_t is already usable from the attaching side.
        Ok(())
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    fn post(&self, index: usize) {
        if self.initialized {
            unsafe { libc::sem_post(self.sem_at(index)) };
        }
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    fn timed_wait(&self, index: usize, timeout: Duration) -> bool {
        if !self.initialized {
            return false;
        }
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
        ts.tv_sec += timeout.as_secs() as libc::time_t;
        ts.tv_nsec += timeout.subsec_nanos() as libc::c_long;
        if ts.tv_nsec >= 1_000_000_000 {
            ts.tv_sec += 1;
            ts.tv_nsec -= 1_000_000_000;
        }
        loop {
            let rc = unsafe { libc::sem_timedwait(self.sem_at(index), &ts) };
            if rc == 0 {
                return true;
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                _ => return false,
            }
        }
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    fn teardown(&mut self) {
        if self.initialized && self.is_server {
            for index in 0..2 {
                unsafe { libc::sem_destroy(self.sem_at(index)) };
            }
        }
        self.initialized = false;
    }

    // -- macOS (named semaphores, polled timed wait) ------------------------

    #[cfg(target_os = "macos")]
    fn create_or_open(&mut self, create: bool) -> Result<()> {
        for index in 0..2 {
            let sem = if create {
                unsafe { libc::sem_unlink(self.names[index].as_ptr()) };
                unsafe {
                    libc::sem_open(
                        self.names[index].as_ptr(),
                        libc::O_CREAT | libc::O_EXCL,
                        0o600 as libc::c_uint,
                        0,
                    )
                }
            } else {
                unsafe { libc::sem_open(self.names[index].as_ptr(), 0) }
            };
            if sem == libc::SEM_FAILED {
                return Err(BridgeError::SemInit(format!(
                    "sem_open '{}': {}",
                    self.suffix,
                    std::io::Error::last_os_error()
                )));
            }
            self.named[index] = sem;
        }
        Ok(())
    }

    #[cfg(target_os = "macos")]
    fn post(&self, index: usize) {
        if self.initialized {
            unsafe { libc::sem_post(self.named[index]) };
        }
    }

    #[cfg(target_os = "macos")]
    fn timed_wait(&self, index: usize, timeout: Duration) -> bool {
        if !self.initialized {
            return false;
        }
        // No sem_timedwait here; poll trywait with a short sleep.
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if unsafe { libc::sem_trywait(self.named[index]) } == 0 {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    #[cfg(target_os = "macos")]
    fn teardown(&mut self) {
        for index in 0..2 {
            if !self.named[index].is_null() {
                unsafe { libc::sem_close(self.named[index]) };
                if self.is_server {
                    unsafe { libc::sem_unlink(self.names[index].as_ptr()) };
                }
                self.named[index] = std::ptr::null_mut();
            }
        }
        self.initialized = false;
    }

    // -- windows (named kernel semaphores) ----------------------------------

    #[cfg(windows)]
    fn sem_name(&self, index: usize) -> String {
        let side = if index == 0 { 's' } else { 'c' };
        format!("Local\\halcyon-bridge-sem-{side}-{}\0", self.suffix)
    }

    #[cfg(windows)]
    fn create_or_open(&mut self, create: bool) -> Result<()> {
        use windows::core::PCSTR;
        use windows::Win32::System::Threading::{
            CreateSemaphoreA, OpenSemaphoreA, SEMAPHORE_ALL_ACCESS,
        };
        for index in 0..2 {
            let name = self.sem_name(index);
            let handle = if create {
                unsafe { CreateSemaphoreA(None, 0, i32::MAX, PCSTR(name.as_ptr())) }
                    .map_err(|e| BridgeError::SemInit(format!("CreateSemaphore: {e}")))?
            } else {
                unsafe { OpenSemaphoreA(SEMAPHORE_ALL_ACCESS, false, PCSTR(name.as_ptr())) }
                    .map_err(|e| BridgeError::SemInit(format!("OpenSemaphore: {e}")))?
            };
            self.handles[index] = handle;
        }
        Ok(())
    }

    #[cfg(windows)]
    fn post(&self, index: usize) {
        use windows::Win32::System::Threading::ReleaseSemaphore;
        if self.initialized {
            let _ = unsafe { ReleaseSemaphore(self.handles[index], 1, None) };
        }
    }

    #[cfg(windows)]
    fn timed_wait(&self, index: usize, timeout: Duration) -> bool {
        use windows::Win32::Foundation::WAIT_OBJECT_0;
        use windows::Win32::System::Threading::WaitForSingleObject;
        if !self.initialized {
            return false;
        }
        let ms = timeout.as_millis().min(u32::MAX as u128) as u32;
        unsafe { WaitForSingleObject(self.handles[index], ms) == WAIT_OBJECT_0 }
    }

    #[cfg(windows)]
    fn teardown(&mut self) {
        use windows::Win32::Foundation::CloseHandle;
        for handle in self.handles.iter_mut() {
            if handle.0 != 0 {
                let _ = unsafe { CloseHandle(*handle) };
                handle.0 = 0;
            }
        }
        self.initialized = false;
    }
}

impl Drop for SemPairView {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    struct PairBox(Box<SemPair>);

    fn make_pair(suffix: &str) -> (PairBox, SemPairView, SemPairView) {
        // SAFETY: zeroed cells are plain byte storage until sem_init runs.
        let mut pair: Box<SemPair> = unsafe { Box::new(std::mem::zeroed()) };
        let ptr = &mut *pair as *mut SemPair;
        let mut server = unsafe { SemPairView::new(ptr, suffix, true) };
        let mut client = unsafe { SemPairView::new(ptr, suffix, false) };
        server.init().unwrap();
        client.connect().unwrap();
        (PairBox(pair), server, client)
    }

    fn unique_suffix(tag: &str) -> String {
        format!("{tag}{}", std::process::id() % 1000)
    }

    #[test]
    fn test_post_then_wait_succeeds() {
        let (_pair, server, client) = make_pair(&unique_suffix("pw"));
        server.post_server();
        assert!(client.wait_server(Duration::from_millis(100)));
        client.post_client();
        assert!(server.wait_client(Duration::from_millis(100)));
    }

    #[test]
    fn test_wait_times_out_without_post() {
        let (_pair, server, _client) = make_pair(&unique_suffix("to"));
        let start = std::time::Instant::now();
        assert!(!server.wait_client(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_rendezvous_across_threads() {
        let (_pair, server, client) = make_pair(&unique_suffix("th"));
        std::thread::scope(|scope| {
            scope.spawn(|| {
                assert!(client.wait_server(Duration::from_secs(2)));
                client.post_client();
            });
            server.post_server();
            assert!(server.wait_client(Duration::from_secs(2)));
        });
    }

    #[test]
    fn test_posts_accumulate() {
        let (_pair, server, client) = make_pair(&unique_suffix("ac"));
        server.post_server();
        server.post_server();
        assert!(client.wait_server(Duration::from_millis(50)));
        assert!(client.wait_server(Duration::from_millis(50)));
        assert!(!client.wait_server(Duration::from_millis(50)));
    }
}
