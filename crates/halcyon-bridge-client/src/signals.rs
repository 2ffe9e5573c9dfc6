//! Process signal flags for the bridge binary.
//!
//! Handlers only flip atomics; the non-RT loop observes them. SIGINT and
//! SIGTERM request shutdown, SIGUSR1 requests an immediate save burst
//! (session managers use it).

use std::sync::atomic::{AtomicBool, Ordering};

static STOP: AtomicBool = AtomicBool::new(false);
static SAVE: AtomicBool = AtomicBool::new(false);

pub fn stop_requested() -> bool {
    STOP.load(Ordering::Acquire)
}

pub fn take_save_request() -> bool {
    SAVE.swap(false, Ordering::AcqRel)
}

#[cfg(unix)]
extern "C" fn on_signal(signum: libc::c_int) {
    if signum == libc::SIGUSR1 {
        SAVE.store(true, Ordering::Release);
    } else {
        STOP.store(true, Ordering::Release);
    }
}

#[cfg(unix)]
pub fn install() {
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGUSR1, on_signal as libc::sighandler_t);
        // A dying host closes our stdout; do not die with SIGPIPE mid-cycle.
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[cfg(not(unix))]
pub fn install() {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_flags_start_clear() {
        assert!(!stop_requested());
        assert!(!take_save_request());
    }

    #[test]
    fn test_save_request_is_consumed() {
        SAVE.store(true, Ordering::Release);
        assert!(take_save_request());
        assert!(!take_save_request());
    }
}
