//! Inter-processor interrupts.
//!
//! The core has one IPI consumer: the panic path broadcasts a halt to
//! every other core so nothing keeps mutating shared state while the
//! panicking core notifies drivers. The request is latched in a flag the
//! scheduler also checks on every tick, so a core that misses the IPI
//! (LAPIC not yet up, interrupts masked) still parks at its next timer
//! interrupt instead of scheduling on.

use core::sync::atomic::{AtomicBool, Ordering};

/// Vector the halt IPI is delivered on; its handler parks the core.
pub const HALT_VECTOR: u8 = 0xFD;

/// LAPIC interrupt command register (low word).
const LAPIC_ICR_LOW: usize = 0xFEE0_0300;

/// ICR: assert level for fixed delivery.
const ICR_LEVEL_ASSERT: u32 = 1 << 14;
/// ICR destination shorthand: all excluding self.
const ICR_ALL_EXCLUDING_SELF: u32 = 0b11 << 18;
/// ICR delivery-status bit (send pending).
const ICR_SEND_PENDING: u32 = 1 << 12;

/// Latched once a system-wide halt has been requested. Never cleared: the
/// only way out is a reset.
static HALT_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Has a system-wide halt been requested?
#[inline]
pub fn halt_requested() -> bool {
    HALT_REQUESTED.load(Ordering::Acquire)
}

/// Ask every other core to halt.
///
/// Latches the request flag first, then (hardware permitting) sends a
/// fixed IPI on [`HALT_VECTOR`] to all-excluding-self and waits briefly
/// for delivery. The flag alone is sufficient to park stragglers at their
/// next scheduler tick; the IPI just makes it immediate.
pub fn broadcast_halt() {
    HALT_REQUESTED.store(true, Ordering::Release);

    if !crate::hw_active() {
        return;
    }

    #[cfg(target_arch = "x86_64")]
    // Safety: the LAPIC register block is identity-mapped by the boot
    // path before the hardware gate opens.
    unsafe {
        core::ptr::write_volatile(
            LAPIC_ICR_LOW as *mut u32,
            ICR_ALL_EXCLUDING_SELF | ICR_LEVEL_ASSERT | HALT_VECTOR as u32,
        );
        // Bounded wait for delivery; on timeout the latched flag still
        // catches the remaining cores.
        for _ in 0..100_000 {
            if core::ptr::read_volatile(LAPIC_ICR_LOW as *const u32) & ICR_SEND_PENDING == 0 {
                break;
            }
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_latches_without_hardware() {
        // Gate closed on the host: no MMIO is touched, but the request is
        // latched for the scheduler-side check.
        assert!(!halt_requested());
        broadcast_halt();
        assert!(halt_requested());
    }
}
