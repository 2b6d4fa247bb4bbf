//! Domain-aware debug printing macros
//!
//! Thread-safe stderr logging with automatic domain context, in the style
//! of a kernel printk. The runtime registers the current domain's slot
//! index in a thread-local; messages are prefixed with it.
//!
//! # Environment Variables
//!
//! - `PD_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//! - `PD_LOG_FLUSH=1` - flush stderr after each message
//! - `PD_LOG_TIME=1` - include a nanosecond timestamp
//!
//! # Output Format
//!
//! Without timestamp: `[LEVEL] [d<idx>] message`
//! With timestamp:    `[LEVEL] [<ns>] [d<idx>] message`

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Instant;

use crate::env::env_get_bool;

/// Log levels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

// Global configuration (initialized once)
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static TIME_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

// Start time for relative timestamps
static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize logging from environment variables
///
/// Called automatically on first log, but can be called explicitly for
/// deterministic initialization.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    START_TIME.get_or_init(Instant::now);
    FLUSH_ENABLED.store(env_get_bool("PD_LOG_FLUSH", false), Ordering::Relaxed);
    TIME_ENABLED.store(env_get_bool("PD_LOG_TIME", false), Ordering::Relaxed);

    if let Ok(val) = std::env::var("PD_LOG_LEVEL") {
        let level = match val.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Warn,
        };
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

/// Get current log level
#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set log level programmatically
pub fn set_log_level(level: LogLevel) {
    init();
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Check if a log level is enabled
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= log_level() as u8
}

/// Elapsed nanoseconds since logging started
#[inline]
pub fn elapsed_ns() -> u64 {
    let start = START_TIME.get_or_init(Instant::now);
    start.elapsed().as_nanos() as u64
}

// Thread-local domain index (set by the runtime)
thread_local! {
    static DOMAIN_INDEX: std::cell::Cell<Option<u32>> = const { std::cell::Cell::new(None) };
}

/// Set the current domain index for this thread (called by the runtime)
pub fn set_domain_index(idx: u32) {
    DOMAIN_INDEX.with(|d| d.set(Some(idx)));
}

/// Clear the domain index (called by the runtime on thread exit)
pub fn clear_domain_index() {
    DOMAIN_INDEX.with(|d| d.set(None));
}

/// Get the current domain index, if this thread is a domain
#[inline]
pub fn get_domain_index() -> Option<u32> {
    DOMAIN_INDEX.with(|d| d.get())
}

/// Internal: write one formatted message with level + context prefix
#[doc(hidden)]
pub fn _dlog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }

    let ctx = match get_domain_index() {
        Some(idx) => format!("[d{}]", idx),
        None => "[d--]".to_string(),
    };

    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = if TIME_ENABLED.load(Ordering::Relaxed) {
        writeln!(handle, "{} [{}] {} {}", level.prefix(), elapsed_ns(), ctx, args)
    } else {
        writeln!(handle, "{} {} {}", level.prefix(), ctx, args)
    };
    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = handle.flush();
    }
}

/// Log an error message
#[macro_export]
macro_rules! derror {
    ($($arg:tt)*) => {
        $crate::dlog::_dlog_impl($crate::dlog::LogLevel::Error, format_args!($($arg)*))
    };
}

/// Log a warning message
#[macro_export]
macro_rules! dwarn {
    ($($arg:tt)*) => {
        $crate::dlog::_dlog_impl($crate::dlog::LogLevel::Warn, format_args!($($arg)*))
    };
}

/// Log an info message
#[macro_export]
macro_rules! dinfo {
    ($($arg:tt)*) => {
        $crate::dlog::_dlog_impl($crate::dlog::LogLevel::Info, format_args!($($arg)*))
    };
}

/// Log a debug message
#[macro_export]
macro_rules! ddebug {
    ($($arg:tt)*) => {
        $crate::dlog::_dlog_impl($crate::dlog::LogLevel::Debug, format_args!($($arg)*))
    };
}

/// Log a trace message
#[macro_export]
macro_rules! dtrace {
    ($($arg:tt)*) => {
        $crate::dlog::_dlog_impl($crate::dlog::LogLevel::Trace, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Debug < LogLevel::Trace);
        assert_eq!(LogLevel::from_u8(3), LogLevel::Info);
        assert_eq!(LogLevel::from_u8(200), LogLevel::Trace);
    }

    #[test]
    fn test_domain_context() {
        assert_eq!(get_domain_index(), None);
        set_domain_index(5);
        assert_eq!(get_domain_index(), Some(5));
        clear_domain_index();
        assert_eq!(get_domain_index(), None);
    }

    #[test]
    fn test_macros_do_not_panic() {
        derror!("error {}", 1);
        dwarn!("warn");
        dinfo!("info");
        ddebug!("debug {}", "x");
        dtrace!("trace");
    }
}
