//! Logging setup and PID-prefixed tracing macros.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::Pid;

/// The local peer's PID, set once at startup by [`logger_init`] and read
/// by the `pf_*!` macros so every log line self-identifies in a
/// multi-process local run.
pub static ME: AtomicU32 = AtomicU32::new(Pid::MAX);

/// Initializes the global logger (via `env_logger`, respecting `RUST_LOG`)
/// and records this peer's PID for prefixing. Call once near the top of
/// `main`; safe to call more than once (later calls are no-ops).
pub fn logger_init(pid: Pid) {
    ME.store(pid, Ordering::Relaxed);
    let _ = env_logger::Builder::from_default_env()
        .format_timestamp_millis()
        .try_init();
}

/// Current peer tag for log-line prefixing. Not part of the public API;
/// used only by the `pf_*!` macros below.
#[doc(hidden)]
pub fn peer_tag() -> u32 {
    ME.load(Ordering::Relaxed)
}

#[macro_export]
macro_rules! pf_error {
    ($($arg:tt)*) => {
        log::error!("<{}> {}", $crate::utils::print::peer_tag(), format!($($arg)*))
    };
}

#[macro_export]
macro_rules! pf_warn {
    ($($arg:tt)*) => {
        log::warn!("<{}> {}", $crate::utils::print::peer_tag(), format!($($arg)*))
    };
}

#[macro_export]
macro_rules! pf_info {
    ($($arg:tt)*) => {
        log::info!("<{}> {}", $crate::utils::print::peer_tag(), format!($($arg)*))
    };
}

#[macro_export]
macro_rules! pf_debug {
    ($($arg:tt)*) => {
        log::debug!("<{}> {}", $crate::utils::print::peer_tag(), format!($($arg)*))
    };
}

#[macro_export]
macro_rules! pf_trace {
    ($($arg:tt)*) => {
        log::trace!("<{}> {}", $crate::utils::print::peer_tag(), format!($($arg)*))
    };
}
