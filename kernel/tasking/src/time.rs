//! The scheduler tick clock.
//!
//! One monotonic counter, bumped once per timer interrupt. Every deadline
//! in the core (`sleep_until`, accounting stamps) is an absolute value of
//! this counter, so clock resynchronisation can never stretch a sleep.

use core::sync::atomic::{AtomicU64, Ordering};

/// Global tick counter.
static TICK_COUNT: AtomicU64 = AtomicU64::new(0);

/// TSC value at boot, for coarse wall-clock diagnostics.
static BOOT_TSC: AtomicU64 = AtomicU64::new(0);

/// Capture the boot TSC. Called once from the boot path.
pub fn init() {
    BOOT_TSC.store(read_tsc(), Ordering::SeqCst);
}

/// Advance the clock by one tick. Called from the timer interrupt before
/// the scheduler runs.
#[inline]
pub fn on_timer_tick() -> u64 {
    TICK_COUNT.fetch_add(1, Ordering::SeqCst) + 1
}

/// Current tick.
#[inline]
pub fn get_ticks() -> u64 {
    TICK_COUNT.load(Ordering::SeqCst)
}

/// Read the CPU timestamp counter (unprivileged).
#[inline]
pub fn read_tsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        let low: u32;
        let high: u32;
        core::arch::asm!(
            "rdtsc",
            out("eax") low,
            out("edx") high,
            options(nostack, nomem)
        );
        ((high as u64) << 32) | (low as u64)
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        0
    }
}

/// TSC delta since boot.
pub fn tsc_since_boot() -> u64 {
    read_tsc().saturating_sub(BOOT_TSC.load(Ordering::SeqCst))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_monotonic() {
        // The counter is global; the scheduler scenarios count on it not
        // moving under them.
        let _guard = crate::test_support::acquire();
        let a = get_ticks();
        let b = on_timer_tick();
        assert!(b > a);
        assert!(get_ticks() >= b);
    }
}
