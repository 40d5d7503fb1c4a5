//! Cooperative stop signal.
//!
//! Every long-running loop (tick loop, control accept loop, connection
//! threads) polls a shared [`StopSignal`]. OS signal handlers only flip an
//! atomic flag; all real work happens on the polling side.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Set from the SIGINT/SIGTERM handler.
static OS_STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Last signal number received, for logging.
static OS_LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// Shared, clonable stop flag.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
    follow_os: bool,
}

impl StopSignal {
    /// A flag only tripped by [`StopSignal::request_stop`].
    pub fn new() -> Self {
        Self::default()
    }

    /// A flag that also trips when the process receives SIGINT or SIGTERM.
    ///
    /// Call [`install_handlers`] once for this to have an effect.
    pub fn with_os_signals() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            follow_os: true,
        }
    }

    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || (self.follow_os && OS_STOP_REQUESTED.load(Ordering::SeqCst))
    }
}

/// Number of the last signal that requested a stop, if any.
pub fn last_signal() -> Option<i32> {
    match OS_LAST_SIGNAL.load(Ordering::SeqCst) {
        0 => None,
        n => Some(n),
    }
}

/// Install SIGINT/SIGTERM handlers that request a stop.
#[cfg(unix)]
pub fn install_handlers() {
    unsafe extern "C" fn handler(signal: i32) {
        OS_LAST_SIGNAL.store(signal, Ordering::SeqCst);
        OS_STOP_REQUESTED.store(true, Ordering::SeqCst);
    }

    unsafe {
        let handler_ptr = handler as *const () as libc::sighandler_t;
        libc::signal(libc::SIGTERM, handler_ptr);
        libc::signal(libc::SIGINT, handler_ptr);
    }
}

#[cfg(not(unix))]
pub fn install_handlers() {}
