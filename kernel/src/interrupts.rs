//! Interrupt plumbing: IDT, the scheduler timer vector and the LAPIC
//! one-shot timer.
//!
//! The timer stub builds the full trap frame the scheduler consumes (the
//! `x86-interrupt` ABI only exposes the hardware-pushed part), hands it to
//! the tasking core, and reprograms nothing itself: the scheduler arms the
//! next one-shot at the end of every decision.

use core::sync::atomic::{AtomicUsize, Ordering};
use lazy_static::lazy_static;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::VirtAddr;

/// Vector the one-shot scheduler timer fires on.
pub const TIMER_VECTOR: u8 = 0x20;

/// LAPIC register block.
const LAPIC_BASE: usize = 0xFEE0_0000;
const LAPIC_EOI: usize = LAPIC_BASE + 0x0B0;
const LAPIC_LVT_TIMER: usize = LAPIC_BASE + 0x320;
const LAPIC_TIMER_INIT: usize = LAPIC_BASE + 0x380;
const LAPIC_TIMER_DIVIDE: usize = LAPIC_BASE + 0x3E0;

/// LVT timer: one-shot mode, unmasked, our vector.
const LVT_TIMER_ONESHOT: u32 = TIMER_VECTOR as u32;

/// Divide-by-16 configuration.
const TIMER_DIV_16: u32 = 0b0011;

/// LAPIC timer counts per scheduler slice unit.
const COUNTS_PER_SLICE: u32 = 10_000;

/// CPU that receives I/O APIC interrupts (`ioapicirq=` boot parameter).
static IOAPIC_TARGET: AtomicUsize = AtomicUsize::new(0);

// The stub pushes, above the hardware frame, an error-code slot, the
// vector, every general-purpose register and the ds selector, producing
// exactly the `TrapFrame` layout with rsp as its base. The ds pop is a
// plain discard: in-kernel selector reloads are not needed.
#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    r#"
    .global timer_interrupt_stub
    timer_interrupt_stub:
        push 0
        push {vector}
        push rax
        push rbx
        push rcx
        push rdx
        push rsi
        push rdi
        push rbp
        push r8
        push r9
        push r10
        push r11
        push r12
        push r13
        push r14
        push r15
        xor rax, rax
        mov ax, ds
        push rax
        mov rdi, rsp
        call timer_interrupt_handler
        pop rax
        pop r15
        pop r14
        pop r13
        pop r12
        pop r11
        pop r10
        pop r9
        pop r8
        pop rbp
        pop rdi
        pop rsi
        pop rdx
        pop rcx
        pop rbx
        pop rax
        add rsp, 16
        iretq
    "#,
    vector = const TIMER_VECTOR,
);

// Halt-IPI handler: mask interrupts and park for good. The panic path
// broadcasts this vector to every other core.
#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    r#"
    .global halt_interrupt_stub
    halt_interrupt_stub:
        cli
    1:
        hlt
        jmp 1b
    "#,
);

extern "C" {
    fn timer_interrupt_stub();
    fn halt_interrupt_stub();
}

/// Rust side of the timer interrupt: one scheduling pass over the frame
/// the stub assembled, then EOI.
#[no_mangle]
extern "C" fn timer_interrupt_handler(frame: &mut arch::TrapFrame) {
    tasking::on_timer_interrupt(frame);
    lapic_eoi();
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        unsafe {
            idt[TIMER_VECTOR as usize]
                .set_handler_addr(VirtAddr::new(timer_interrupt_stub as usize as u64));
            idt[arch::ipi::HALT_VECTOR as usize]
                .set_handler_addr(VirtAddr::new(halt_interrupt_stub as usize as u64));
        }
        idt
    };
}

#[inline]
fn lapic_write(reg: usize, value: u32) {
    if !arch::hw_active() {
        return;
    }
    // Safety: the LAPIC register block is identity-mapped by the boot path
    // before the hardware gate opens.
    unsafe { core::ptr::write_volatile(reg as *mut u32, value) };
}

fn lapic_eoi() {
    lapic_write(LAPIC_EOI, 0);
}

/// Program the LAPIC one-shot timer; registered as the arch timer
/// programmer so the scheduler can arm its next tick.
fn lapic_one_shot(slice: u32) {
    lapic_write(LAPIC_TIMER_DIVIDE, TIMER_DIV_16);
    lapic_write(LAPIC_LVT_TIMER, LVT_TIMER_ONESHOT);
    lapic_write(LAPIC_TIMER_INIT, slice.saturating_mul(COUNTS_PER_SLICE));
}

/// Reschedule trigger for `yield_now`: collapse the current slice so the
/// timer fires (and the scheduler runs) immediately.
pub fn software_resched() {
    arch::one_shot(1);
}

/// Load the IDT, wire the one-shot programmer and record the I/O APIC
/// routing target.
pub fn init(ioapic_target: usize) {
    IOAPIC_TARGET.store(ioapic_target, Ordering::Relaxed);
    if arch::hw_active() {
        IDT.load();
    }
    arch::register_one_shot_programmer(lapic_one_shot);
    klog_always!(
        "interrupts: timer on vector {:#x}, I/O APIC routed to CPU {}",
        TIMER_VECTOR,
        ioapic_target
    );
}

/// First timer shot; everything after is armed by the scheduler itself.
pub fn start_scheduler_timer() {
    arch::one_shot(tasking::TaskPriority::Normal.time_slice());
}
