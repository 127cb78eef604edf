//! FPU/SIMD state save and restore.

use core::sync::atomic::{AtomicBool, Ordering};
use x86_64::registers::control::{Cr0, Cr0Flags, Cr4, Cr4Flags};

/// FXSAVE region size.
const FXSAVE_SIZE: usize = 512;

/// 512-byte FXSAVE/FXRSTOR region, 64-byte aligned for XSAVE compatibility.
#[repr(C, align(64))]
#[derive(Clone, Copy)]
pub struct FxSaveArea {
    pub data: [u8; FXSAVE_SIZE],
}

impl core::fmt::Debug for FxSaveArea {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FxSaveArea")
            .field("fcw", &u16::from_le_bytes([self.data[0], self.data[1]]))
            .field(
                "mxcsr",
                &u32::from_le_bytes([self.data[24], self.data[25], self.data[26], self.data[27]]),
            )
            .finish_non_exhaustive()
    }
}

impl Default for FxSaveArea {
    fn default() -> Self {
        let mut area = FxSaveArea {
            data: [0; FXSAVE_SIZE],
        };
        // FCW: double precision, all exceptions masked.
        area.data[0] = 0x7F;
        area.data[1] = 0x03;
        // MXCSR: all exceptions masked.
        area.data[24] = 0x80;
        area.data[25] = 0x1F;
        area
    }
}

/// Whether SIMD instruction use is permitted (the `simd=` boot parameter).
static SIMD_ALLOWED: AtomicBool = AtomicBool::new(true);

/// Allow or forbid SIMD state handling.
pub fn set_simd_allowed(allowed: bool) {
    SIMD_ALLOWED.store(allowed, Ordering::Release);
}

/// Is SIMD state handling permitted?
#[inline]
pub fn simd_allowed() -> bool {
    SIMD_ALLOWED.load(Ordering::Relaxed)
}

/// Enable FPU/SSE in CR0/CR4. No-op before the hardware gate opens.
pub fn init() {
    if !crate::hw_active() {
        return;
    }
    unsafe {
        let mut cr0 = Cr0::read();
        cr0.remove(Cr0Flags::EMULATE_COPROCESSOR);
        cr0.insert(Cr0Flags::MONITOR_COPROCESSOR);
        Cr0::write(cr0);

        let mut cr4 = Cr4::read();
        cr4.insert(Cr4Flags::OSFXSR | Cr4Flags::OSXMMEXCPT_ENABLE);
        Cr4::write(cr4);
    }
}

/// Save the current FPU/SIMD state into `area`.
///
/// Inert before the hardware gate opens or when SIMD is disabled.
#[inline]
pub fn fxsave(area: &mut FxSaveArea) {
    if !crate::hw_active() || !simd_allowed() {
        return;
    }
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!(
            "fxsave64 [{area}]",
            area = in(reg) area.data.as_mut_ptr(),
            options(nostack),
        );
    }
}

/// Restore the FPU/SIMD state from `area`.
///
/// Inert before the hardware gate opens or when SIMD is disabled.
#[inline]
pub fn fxrstor(area: &FxSaveArea) {
    if !crate::hw_active() || !simd_allowed() {
        return;
    }
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!(
            "fxrstor64 [{area}]",
            area = in(reg) area.data.as_ptr(),
            options(nostack),
        );
    }
}
