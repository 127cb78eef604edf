//! One-shot scheduler timer.
//!
//! The scheduler reprograms the timer at the end of every decision with the
//! incoming thread's priority-derived slice. The actual programming is done
//! by a registered callback (the kernel binary wires in the LAPIC one-shot
//! routine); until one is registered, programming is recorded but inert,
//! which lets scheduler tests observe the requested slices.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

/// One-shot programmer signature: fire once after `slice` timer units.
pub type OneShotProgrammer = fn(slice: u32);

/// Registered hardware programmer.
static PROGRAMMER: Mutex<Option<OneShotProgrammer>> = Mutex::new(None);

/// Last slice requested, observable by tests and diagnostics.
static LAST_SLICE: AtomicU32 = AtomicU32::new(0);

/// Number of one-shot programmings performed.
static PROGRAM_COUNT: AtomicU64 = AtomicU64::new(0);

/// Register the hardware one-shot programmer.
pub fn register_one_shot_programmer(f: OneShotProgrammer) {
    *PROGRAMMER.lock() = Some(f);
}

/// Program the one-shot timer to fire after `slice` units. A zero slice is
/// clamped to one so the scheduler always gets another tick.
pub fn one_shot(slice: u32) {
    let slice = if slice == 0 { 1 } else { slice };
    LAST_SLICE.store(slice, Ordering::Relaxed);
    PROGRAM_COUNT.fetch_add(1, Ordering::Relaxed);
    let programmer = *PROGRAMMER.lock();
    if let Some(f) = programmer {
        f(slice);
    }
}

/// Last slice handed to the programmer.
pub fn last_slice() -> u32 {
    LAST_SLICE.load(Ordering::Relaxed)
}

/// Total number of one-shot programmings.
pub fn program_count() -> u64 {
    PROGRAM_COUNT.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_shot_records_slice() {
        one_shot(5);
        assert_eq!(last_slice(), 5);
        let before = program_count();
        one_shot(0); // clamped, never a dead timer
        assert_eq!(last_slice(), 1);
        assert_eq!(program_count(), before + 1);
    }
}
