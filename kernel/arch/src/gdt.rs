//! GDT and TSS management.
//!
//! The scheduler installs the incoming thread's kernel stack top into the
//! TSS `rsp0` slot on every decision so ring transitions land on the right
//! stack. A software mirror tracks the value before the hardware gate opens.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, Ordering};
use lazy_static::lazy_static;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

/// TSS wrapper allowing the rsp0 slot to be rewritten on every scheduling
/// decision while the segment descriptor points at a stable address.
struct TssHolder(UnsafeCell<TaskStateSegment>);

// Safety: rsp0 is only rewritten with interrupts disabled on the owning
// core; the CPU reads it asynchronously, which is the architectural
// contract for the TSS.
unsafe impl Sync for TssHolder {}

static TSS: TssHolder = TssHolder(UnsafeCell::new(TaskStateSegment::new()));

/// Software mirror of TSS.rsp0, readable without the hardware gate.
static KERNEL_STACK_MIRROR: AtomicU64 = AtomicU64::new(0);

struct Selectors {
    kernel_code: SegmentSelector,
    kernel_data: SegmentSelector,
    tss: SegmentSelector,
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.add_entry(Descriptor::kernel_code_segment());
        let kernel_data = gdt.add_entry(Descriptor::kernel_data_segment());
        let _user_data = gdt.add_entry(Descriptor::user_data_segment());
        let _user_code = gdt.add_entry(Descriptor::user_code_segment());
        let tss = gdt.add_entry(Descriptor::tss_segment(unsafe { &*TSS.0.get() }));
        (
            gdt,
            Selectors {
                kernel_code,
                kernel_data,
                tss,
            },
        )
    };
}

/// Load the GDT and TSS on the calling core. No-op before the hardware gate
/// opens (host tests never load descriptor tables).
pub fn init() {
    if !crate::hw_active() {
        return;
    }
    GDT.0.load();
    unsafe {
        CS::set_reg(GDT.1.kernel_code);
        DS::set_reg(GDT.1.kernel_data);
        ES::set_reg(GDT.1.kernel_data);
        SS::set_reg(GDT.1.kernel_data);
        load_tss(GDT.1.tss);
    }
}

/// Install `top` as the kernel stack used for ring transitions (TSS.rsp0).
pub fn set_kernel_stack(top: u64) {
    KERNEL_STACK_MIRROR.store(top, Ordering::Relaxed);
    if crate::hw_active() {
        unsafe {
            (*TSS.0.get()).privilege_stack_table[0] = VirtAddr::new(top);
        }
    }
}

/// The kernel stack top currently installed for ring transitions.
pub fn kernel_stack_top() -> u64 {
    KERNEL_STACK_MIRROR.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_stack_mirror() {
        set_kernel_stack(0xFFFF_8000_0001_0000);
        assert_eq!(kernel_stack_top(), 0xFFFF_8000_0001_0000);
    }
}
