//! Memory plumbing for the Kestrel core.
//!
//! Provides the two memory objects the tasking and driver subsystems own:
//!
//! - [`AddressSpace`]: a handle on a top-level page table, either the shared
//!   kernel table or a private root forked from it;
//! - [`VirtualMemoryArea`]: a bag of page-aligned allocations with a
//!   containment query, used for driver images and their panic-pointer
//!   validation.
//!
//! CR3 is only touched after [`enable_paging_control`] has been called by
//! the boot path; before that, activation updates a software mirror, which
//! keeps everything above this crate host-testable.

#![no_std]

extern crate alloc;

#[macro_use]
extern crate klog;

pub mod addrspace;
pub mod vma;

pub use addrspace::{AddressSpace, AddressSpaceError};
pub use vma::{VirtualMemoryArea, VmaError};

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Page size. Everything in the core is 4 KiB granular.
pub const PAGE_SIZE: usize = 4096;

/// Number of pages needed to hold `bytes`.
#[inline]
pub const fn pages_for(bytes: usize) -> usize {
    (bytes + PAGE_SIZE - 1) / PAGE_SIZE
}

/// Boot information handed to the kernel entry point by the loader.
#[repr(C)]
pub struct BootInfo {
    /// Kernel heap start (virtual).
    pub heap_start: u64,
    /// Kernel heap size in bytes.
    pub heap_size: u64,
    /// Offset of the linear physical-memory mapping.
    pub phys_offset: u64,
    /// Boot parameter string location.
    pub cmdline_ptr: u64,
    /// Boot parameter string length in bytes.
    pub cmdline_len: u64,
    /// Number of CPUs reported by the loader (0 = unknown).
    pub cpu_count: u32,
}

impl BootInfo {
    /// The boot parameter string, if the loader provided one.
    ///
    /// # Safety
    ///
    /// `cmdline_ptr`/`cmdline_len` must describe a readable mapping.
    pub unsafe fn cmdline(&self) -> Option<&str> {
        if self.cmdline_ptr == 0 || self.cmdline_len == 0 {
            return None;
        }
        let bytes = core::slice::from_raw_parts(self.cmdline_ptr as *const u8, self.cmdline_len as usize);
        core::str::from_utf8(bytes).ok()
    }
}

/// Gate for CR3 writes. Off until the boot path owns paging.
static PAGING_CONTROL: AtomicBool = AtomicBool::new(false);

/// Physical-memory linear mapping offset, captured at init.
pub(crate) static PHYS_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Root (CR3 value) of the shared kernel page table; 0 until captured.
static KERNEL_ROOT: AtomicUsize = AtomicUsize::new(0);

/// Mirror of the most recently activated root, for diagnostics and tests.
static ACTIVE_ROOT: AtomicUsize = AtomicUsize::new(0);

/// Capture the boot page table as the shared kernel root and record the
/// physical mapping offset. Must run before any process is created.
pub fn init(boot: &BootInfo) {
    PHYS_OFFSET.store(boot.phys_offset, Ordering::Release);

    #[cfg(target_arch = "x86_64")]
    if PAGING_CONTROL.load(Ordering::Acquire) {
        let (frame, _) = x86_64::registers::control::Cr3::read();
        KERNEL_ROOT.store(frame.start_address().as_u64() as usize, Ordering::Release);
    }

    klog_always!(
        "mm: kernel page table root {:#x}, phys offset {:#x}",
        KERNEL_ROOT.load(Ordering::Relaxed),
        boot.phys_offset
    );
}

/// Hand paging control to this crate. Only the boot path calls this, after
/// it has verified the loader's page tables.
pub fn enable_paging_control() {
    PAGING_CONTROL.store(true, Ordering::Release);
}

/// May CR3 be written yet?
#[inline]
pub fn paging_control_enabled() -> bool {
    PAGING_CONTROL.load(Ordering::Relaxed)
}

/// Root of the shared kernel page table. 0 means "the boot table", which
/// every activation treats as the kernel root.
#[inline]
pub fn kernel_root() -> usize {
    KERNEL_ROOT.load(Ordering::Acquire)
}

/// Translate a kernel-heap virtual address to physical using the linear
/// mapping offset. Identity when no offset was recorded.
#[inline]
pub fn virt_to_phys(virt: usize) -> usize {
    virt.wrapping_sub(PHYS_OFFSET.load(Ordering::Relaxed) as usize)
}

/// Load `root` into CR3 (0 = the shared kernel root). Skips the write when
/// the target is already active. Before [`enable_paging_control`] only the
/// software mirror changes.
pub fn activate(root: usize) {
    let target = if root == 0 { kernel_root() } else { root };
    let previous = ACTIVE_ROOT.swap(target, Ordering::AcqRel);

    #[cfg(target_arch = "x86_64")]
    if paging_control_enabled() && target != previous && target != 0 {
        use x86_64::registers::control::{Cr3, Cr3Flags};
        use x86_64::structures::paging::PhysFrame;
        use x86_64::PhysAddr;
        let frame = PhysFrame::containing_address(PhysAddr::new(target as u64));
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }

    #[cfg(not(target_arch = "x86_64"))]
    let _ = previous;
}

/// Switch to the shared kernel page table (scheduler entry, step 1).
#[inline]
pub fn activate_kernel_space() {
    activate(0);
}

/// The most recently activated root (mirror).
#[inline]
pub fn active_root() -> usize {
    ACTIVE_ROOT.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pages_for_rounding() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
    }

    #[test]
    fn test_activation_mirror() {
        activate(0x7000_0000);
        assert_eq!(active_root(), 0x7000_0000);
        activate_kernel_space();
        assert_eq!(active_root(), kernel_root());
    }

    #[test]
    fn test_boot_info_cmdline() {
        let args = "cores=2 tasking=multi";
        let boot = BootInfo {
            heap_start: 0,
            heap_size: 0,
            phys_offset: 0,
            cmdline_ptr: args.as_ptr() as u64,
            cmdline_len: args.len() as u64,
            cpu_count: 2,
        };
        assert_eq!(unsafe { boot.cmdline() }, Some(args));

        let empty = BootInfo {
            heap_start: 0,
            heap_size: 0,
            phys_offset: 0,
            cmdline_ptr: 0,
            cmdline_len: 0,
            cpu_count: 0,
        };
        assert_eq!(unsafe { empty.cmdline() }, None);
    }
}
