//! Kestrel kernel logging (`klog`).
//!
//! Lightweight logging macros shared by every kernel sub-crate. Output goes
//! through a registered sink so this crate has no dependency on any console
//! or serial driver; until the boot path registers a sink, all output is
//! dropped.
//!
//! # Macro Overview
//!
//! | Macro | Release build | Filtered | Use case |
//! |-------|--------------|----------|----------|
//! | [`kprintln!`] | Compiled out | No | Developer diagnostics |
//! | [`klog!`] | Active | Yes | Operational logging with level filter |
//! | [`klog_always!`] | Active | Gated | Boot banners, status messages |
//!
//! The filter is runtime: a single `Relaxed` atomic load plus an integer
//! compare on the hot path. `Debug` and `Trace` are additionally compiled
//! out of release builds.

#![no_std]

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use spin::Mutex;

// ============================================================================
// Log Levels
// ============================================================================

/// Severity level for [`klog!`] messages, least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    /// Extremely verbose tracing (compiled out in release).
    Trace = 0,
    /// Developer-oriented debug information (compiled out in release).
    Debug = 1,
    /// Normal operational information.
    Info = 2,
    /// Potential problems that merit attention.
    Warn = 3,
    /// Errors that affect correctness.
    Error = 4,
}

/// Sentinel: all output suppressed.
const LEVEL_DISABLED: u8 = u8::MAX;

/// Runtime minimum level. Messages with `level >= LOG_MIN_LEVEL` are emitted.
static LOG_MIN_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

/// Runtime gate for [`klog_always!`]. Defaults to enabled; a quiet boot may
/// switch it off.
static LOG_ALWAYS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Set the minimum level emitted by [`klog!`].
#[inline]
pub fn set_min_level(level: Level) {
    LOG_MIN_LEVEL.store(level as u8, Ordering::Release);
}

/// Disable all [`klog!`] output. Does **not** affect [`klog_always!`].
#[inline]
pub fn disable() {
    LOG_MIN_LEVEL.store(LEVEL_DISABLED, Ordering::Release);
}

/// Enable or disable [`klog_always!`] output.
#[inline]
pub fn set_always_enabled(enabled: bool) {
    LOG_ALWAYS_ENABLED.store(enabled, Ordering::Release);
}

/// Returns `true` if a message at `level` would currently be emitted.
///
/// Hot path: single `Relaxed` atomic load + integer compare.
#[inline(always)]
pub fn enabled(level: Level) -> bool {
    level as u8 >= LOG_MIN_LEVEL.load(Ordering::Relaxed)
}

#[doc(hidden)]
#[inline(always)]
pub fn _klog_always_enabled() -> bool {
    LOG_ALWAYS_ENABLED.load(Ordering::Relaxed)
}

// ============================================================================
// Output Sink
// ============================================================================

/// Output sink signature. The sink must not allocate and must be callable
/// from interrupt context.
pub type Sink = fn(core::fmt::Arguments);

/// Registered output sink. `None` drops all output.
static SINK: Mutex<Option<Sink>> = Mutex::new(None);

/// Register the output sink. Called by the boot path once the serial console
/// is usable; safe to call again to redirect output.
pub fn register_sink(sink: Sink) {
    *SINK.lock() = Some(sink);
}

#[doc(hidden)]
#[inline]
pub fn _klog_print(args: core::fmt::Arguments) {
    // Copy the fn pointer out so the sink runs without the slot lock held.
    let sink = *SINK.lock();
    if let Some(f) = sink {
        f(args);
    }
}

// ============================================================================
// Macros
// ============================================================================

/// Gated kernel output for boot banners and status messages.
#[macro_export]
macro_rules! klog_always {
    () => {{
        if $crate::_klog_always_enabled() {
            $crate::_klog_print(format_args!("\n"));
        }
    }};
    ($($arg:tt)+) => {{
        if $crate::_klog_always_enabled() {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
}

/// Debug-only kernel print. Fully compiled out in release builds.
#[macro_export]
macro_rules! kprintln {
    () => {{
        #[cfg(debug_assertions)]
        $crate::klog_always!();
    }};
    ($($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        $crate::klog_always!($($arg)+);
    }};
}

/// Level-filtered kernel logging.
///
/// # Examples
///
/// ```ignore
/// klog!(Error, "driver {}: _start returned {}", name, err);
/// klog!(Info,  "SMP: {} CPUs online", count);
/// klog!(Debug, "sched: selected tid {}", tid);
/// ```
#[macro_export]
macro_rules! klog {
    (Error, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Error) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    (Warn, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Warn) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    (Info, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Info) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    (Debug, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::enabled($crate::Level::Debug) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    (Trace, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::enabled($crate::Level::Trace) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter() {
        set_min_level(Level::Warn);
        assert!(!enabled(Level::Info));
        assert!(enabled(Level::Warn));
        assert!(enabled(Level::Error));

        set_min_level(Level::Trace);
        assert!(enabled(Level::Trace));

        disable();
        assert!(!enabled(Level::Error));

        set_min_level(Level::Info);
    }

    #[test]
    fn test_print_without_sink_is_silent() {
        // No sink registered: output is dropped, not a fault.
        _klog_print(format_args!("dropped"));
    }
}
