//! x86_64 glue for the Kestrel core.
//!
//! Everything the scheduler needs from the hardware lives here: the trap
//! frame layout, the FXSAVE area, the FS/GS/shadow-GS base MSRs, the TSS
//! kernel-stack slot used for ring transitions, and the one-shot timer.
//!
//! # The hardware gate
//!
//! Privileged instructions are reachable only after [`enable_hw`] has been
//! called by the boot path (after the GDT is loaded and the LAPIC mapped).
//! Before that every accessor is an inert default: MSR reads return 0,
//! FXSAVE/FXRSTOR and TSS updates only touch their software mirrors, and
//! `without_interrupts` just runs its closure. This keeps the tasking and
//! driver logic above this crate runnable on a host, where the same
//! instructions would fault.

#![no_std]

#[macro_use]
extern crate klog;

pub mod fpu;
pub mod frame;
pub mod gdt;
pub mod ipi;
pub mod msr;
pub mod timer;

use core::sync::atomic::{AtomicBool, Ordering};

pub use fpu::FxSaveArea;
pub use frame::{TrapFrame, KERNEL_CS, KERNEL_SS, RFLAGS_IF, RFLAGS_RESERVED_ONE, USER_CS, USER_SS};
pub use gdt::{kernel_stack_top, set_kernel_stack};
pub use timer::{one_shot, register_one_shot_programmer};

/// Gate for privileged instruction use. Off until the boot path finishes
/// descriptor-table and APIC setup.
static HW_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Open the hardware gate. Only the boot path calls this, once the GDT is
/// loaded and interrupts can be safely toggled.
pub fn enable_hw() {
    HW_ACTIVE.store(true, Ordering::Release);
    klog_always!("arch: hardware access enabled");
}

/// Is privileged instruction use allowed yet?
#[inline(always)]
pub fn hw_active() -> bool {
    HW_ACTIVE.load(Ordering::Relaxed)
}

/// Run `f` with interrupts disabled on this core.
///
/// Before [`enable_hw`] this is a plain call: there is nothing to mask.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    if hw_active() {
        x86_64::instructions::interrupts::without_interrupts(f)
    } else {
        f()
    }
}

/// Halt the calling core until the next interrupt.
pub fn halt() {
    if hw_active() {
        x86_64::instructions::hlt();
    } else {
        core::hint::spin_loop();
    }
}

/// Initialize the architecture layer: GDT/TSS, FPU control state.
pub fn init() {
    gdt::init();
    fpu::init();
    klog_always!("arch: GDT/TSS loaded, FPU configured");
}
