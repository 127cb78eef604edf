//! Address-space handles.
//!
//! A process owns exactly one [`AddressSpace`]. It is either the shared
//! kernel page table (never owned, never freed) or a private root forked
//! from the kernel table at spawn time and freed when the process is
//! destroyed.

use crate::{kernel_root, paging_control_enabled, PAGE_SIZE};
use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::sync::atomic::{AtomicU64, Ordering};

/// Address-space construction errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpaceError {
    /// Allocation of the new top-level table failed.
    ResourceExhausted,
}

/// Count of private address spaces forked so far (diagnostics).
static FORK_COUNT: AtomicU64 = AtomicU64::new(0);

/// Owning handle on a top-level page table.
#[derive(Debug)]
pub struct AddressSpace {
    /// Root table address; 0 means the shared kernel/boot table.
    root: usize,
    /// Does this handle own (and eventually free) the root?
    owned: bool,
}

impl AddressSpace {
    /// Handle on the shared kernel page table. Never freed.
    pub const fn kernel_shared() -> Self {
        AddressSpace {
            root: 0,
            owned: false,
        }
    }

    /// Fork a private root from the kernel page table.
    ///
    /// The new root starts as a copy of the kernel root page, so the kernel
    /// half of the address space is shared with every other process. When
    /// paging is not yet under our control (early boot, host tests) the
    /// root page starts zeroed instead.
    pub fn fork_from_kernel() -> Result<Self, AddressSpaceError> {
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE)
            .map_err(|_| AddressSpaceError::ResourceExhausted)?;
        // Safety: layout is non-zero-sized and page aligned.
        let page = unsafe { alloc_zeroed(layout) };
        if page.is_null() {
            return Err(AddressSpaceError::ResourceExhausted);
        }

        let kroot = kernel_root();
        if paging_control_enabled() && kroot != 0 {
            // The boot path maps physical memory linearly, so the kernel
            // root is readable through the phys offset. Copy its entries
            // wholesale; user mappings are added later per process.
            let src = crate::PHYS_OFFSET.load(Ordering::Relaxed) as usize + kroot;
            // Safety: kroot points at one live page-table page; `page` is a
            // fresh PAGE_SIZE allocation.
            unsafe { core::ptr::copy_nonoverlapping(src as *const u8, page, PAGE_SIZE) };
        }

        FORK_COUNT.fetch_add(1, Ordering::Relaxed);
        Ok(AddressSpace {
            root: page as usize,
            owned: true,
        })
    }

    /// Root table address (0 = shared kernel table).
    #[inline]
    pub fn root(&self) -> usize {
        self.root
    }

    /// Is this the shared kernel page table?
    #[inline]
    pub fn is_kernel_shared(&self) -> bool {
        !self.owned
    }

    /// Load this space's root into CR3.
    #[inline]
    pub fn activate(&self) {
        crate::activate(self.root);
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if self.owned && self.root != 0 {
            // Safety: `root` came from `alloc_zeroed` with this exact layout
            // in `fork_from_kernel` and is dropped exactly once.
            unsafe {
                let layout = Layout::from_size_align_unchecked(PAGE_SIZE, PAGE_SIZE);
                dealloc(self.root as *mut u8, layout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_shared_handle() {
        let space = AddressSpace::kernel_shared();
        assert!(space.is_kernel_shared());
        assert_eq!(space.root(), 0);
        drop(space); // must not attempt to free the kernel table
    }

    #[test]
    fn test_fork_produces_owned_root() {
        let space = AddressSpace::fork_from_kernel().expect("fork");
        assert!(!space.is_kernel_shared());
        assert_ne!(space.root(), 0);
        assert_eq!(space.root() % PAGE_SIZE, 0);
    }

    #[test]
    fn test_forked_roots_are_distinct() {
        let a = AddressSpace::fork_from_kernel().expect("fork a");
        let b = AddressSpace::fork_from_kernel().expect("fork b");
        assert_ne!(a.root(), b.root());
    }
}
