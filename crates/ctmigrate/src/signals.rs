//! Process-wide interrupt flag fed by SIGINT/SIGTERM.
//!
//! The handler only flips an atomic; the orchestrator polls it at step
//! boundaries and the capture loop polls it per chunk. A second signal while
//! the first is still pending exits immediately with status 130.

use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

pub const EXIT_INTERRUPTED: i32 = 130;

pub fn interrupt_requested() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

#[cfg(unix)]
extern "C" fn on_signal(_sig: libc::c_int) {
    if INTERRUPTED.swap(true, Ordering::SeqCst) {
        // Only async-signal-safe calls here.
        unsafe { libc::_exit(EXIT_INTERRUPTED) };
    }
}

pub fn install_handlers() {
    #[cfg(unix)]
    {
        let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        unsafe {
            libc::signal(libc::SIGINT, handler);
            libc::signal(libc::SIGTERM, handler);
        }
    }
}
