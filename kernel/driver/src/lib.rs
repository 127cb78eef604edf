//! Driver manager.
//!
//! Loads relocatable driver images from a filesystem directory, binds them
//! into the kernel address space, resolves their imports against the
//! versioned kernel symbol table and walks them through the lifecycle:
//!
//! - **preload**: parse, reserve a VMA, copy, relocate, register; a
//!   failure skips that file and the directory scan continues;
//! - **activation**: `_start(id)`, then `probe()`, then `entry()`, each
//!   returning errno-style negatives; any failure rolls the driver's VMA
//!   back and leaves it uninitialized;
//! - **teardown**: reverse order, `final()`, handler tables cleared, VMA
//!   released;
//! - **panic**: every initialized driver whose panic pointer lies inside
//!   its own VMA gets one call; a fault cannot recurse into the path.

#![no_std]

extern crate alloc;

#[macro_use]
extern crate klog;

pub mod api;
pub mod elf;
pub mod info;
pub mod symbols;

#[cfg(test)]
mod testimg;

pub use api::{register_kernel_api, DRIVER_API_VERSION};
pub use elf::{ImageError, KERNEL_INTERPRETER};
pub use info::{DriverInfo, DriverVersion};
pub use symbols::{get_symbol_by_name, register_symbol, SymbolError};

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use lazy_static::lazy_static;
use mm::VirtualMemoryArea;
use spin::Mutex;
use vfs::{FileNode, FsError};

/// Driver identity, handed to `_start`.
pub type DriverId = u64;

/// Driver manager errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    /// Header, section, symbol or relocation error; the image was not
    /// inserted and its VMA was freed.
    Image(ImageError),
    /// VMA or buffer allocation failed.
    ResourceExhausted,
    /// A lifecycle hook returned an errno-style negative.
    LifecycleRejected { stage: &'static str, errno: i32 },
    /// Unknown driver id.
    NoSuchDriver,
    /// A registered pointer fell outside the driver's VMA.
    PointerOutsideImage,
    /// The driver source was unreadable.
    Filesystem(FsError),
}

impl From<FsError> for DriverError {
    fn from(err: FsError) -> Self {
        DriverError::Filesystem(err)
    }
}

/// The four lifecycle hooks, tagged by the owning VMA through the parent
/// [`DriverObject`] so `panic` can be validated before the call.
#[derive(Debug, Clone, Copy)]
pub struct DriverHooks {
    pub probe: usize,
    pub entry: usize,
    pub final_: usize,
    pub panic: usize,
}

/// Handler table a driver registered for one device identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHandlers {
    /// Address of the driver's operations table, inside its VMA.
    pub ops_table: usize,
}

/// One loaded driver.
#[derive(Debug)]
pub struct DriverObject {
    pub id: DriverId,
    /// Load base of the image.
    pub base: usize,
    /// Absolute `_start` address.
    pub entry_point: usize,
    /// Owning VMA of the mapped image.
    pub vma: VirtualMemoryArea,
    /// Source path the image was loaded from.
    pub path: String,
    pub info: DriverInfo,
    pub hooks: DriverHooks,
    pub initialized: bool,
    /// Interrupt vector -> handler address (inside the VMA).
    pub interrupt_handlers: BTreeMap<u8, usize>,
    /// Device identity -> handler table.
    pub device_ops: BTreeMap<u64, DeviceHandlers>,
    /// Errno of the most recent lifecycle call.
    pub last_error: i32,
}

impl DriverObject {
    /// Is the panic hook callable: resolved, and inside this driver's own
    /// mapped image?
    pub fn panic_pointer_valid(&self) -> bool {
        self.hooks.panic != 0 && self.vma.contains(self.hooks.panic)
    }
}

lazy_static! {
    /// Driver table, keyed (and iterated) by id; ids are handed out
    /// monotonically, so iteration order is insertion order.
    static ref DRIVERS: Mutex<BTreeMap<DriverId, DriverObject>> = Mutex::new(BTreeMap::new());
}

/// Next driver id.
static NEXT_DRIVER_ID: AtomicU64 = AtomicU64::new(1);

/// Guard against recursive driver-panic dispatch.
static IN_PANIC_PATH: AtomicBool = AtomicBool::new(false);

/// Number of drivers currently in the table.
pub fn driver_count() -> usize {
    DRIVERS.lock().len()
}

/// Run `f` over the driver with `id`.
pub fn with_driver<R>(id: DriverId, f: impl FnOnce(&DriverObject) -> R) -> Option<R> {
    DRIVERS.lock().get(&id).map(f)
}

// ============================================================================
// Preload phase
// ============================================================================

/// Enumerate regular files under `dir` and load each as a driver. A file
/// that fails to load is logged and skipped; the scan continues.
pub fn preload(dir: &Arc<dyn FileNode>) {
    klog_always!("driver: preloading from {}", dir.path());
    for node in dir.children() {
        if !node.is_regular_file() {
            continue;
        }
        match load_driver_file(node.as_ref()) {
            Ok(id) => {
                klog!(Info, "driver: preloaded {} (id {})", node.path(), id);
            }
            Err(err) => {
                klog!(Error, "driver: failed to load {}: {:?}", node.path(), err);
            }
        }
    }
}

/// Load one driver file and insert it under a fresh id.
pub fn load_driver_file(node: &dyn FileNode) -> Result<DriverId, DriverError> {
    let image = vfs::read_all(node)?;
    let vma = VirtualMemoryArea::new();

    let loaded = match elf::load_image(&image, &vma) {
        Ok(loaded) => loaded,
        Err(err) => {
            // Nothing from a rejected image survives.
            vma.free_all_pages();
            return Err(err);
        }
    };

    let id = NEXT_DRIVER_ID.fetch_add(1, Ordering::Relaxed);
    let object = DriverObject {
        id,
        base: loaded.base,
        entry_point: loaded.entry_point,
        vma,
        path: String::from(node.path()),
        hooks: DriverHooks {
            probe: loaded.probe,
            entry: loaded.entry,
            final_: loaded.final_,
            panic: loaded.panic,
        },
        info: loaded.info,
        initialized: false,
        interrupt_handlers: BTreeMap::new(),
        device_ops: BTreeMap::new(),
        last_error: 0,
    };

    klog!(
        Debug,
        "driver: {} v{}.{}.{} at base {:#x}, entry {:#x}",
        object.info.name,
        object.info.version.major,
        object.info.version.minor,
        object.info.version.patch,
        object.base,
        object.entry_point
    );

    DRIVERS.lock().insert(id, object);
    Ok(id)
}

// ============================================================================
// Activation phase
// ============================================================================

/// Call through a resolved hook address.
///
/// # Safety
///
/// `address` must be the entry of a loaded, relocated driver function with
/// the `extern "C" fn() -> i32` signature.
unsafe fn call_hook(address: usize) -> i32 {
    let hook: unsafe extern "C" fn() -> i32 = core::mem::transmute(address);
    hook()
}

/// Activate one driver: `_start(id)`, then `probe()`, then `entry()`.
///
/// A negative return at any stage releases the driver's VMA and leaves it
/// uninitialized. The hooks run with the driver table unlocked: `_start`
/// routinely calls back into the kernel API to register handlers.
pub fn activate(id: DriverId) -> Result<(), DriverError> {
    let (entry_point, hooks, name) = {
        let drivers = DRIVERS.lock();
        let drv = drivers.get(&id).ok_or(DriverError::NoSuchDriver)?;
        if drv.initialized {
            return Ok(());
        }
        (drv.entry_point, drv.hooks, drv.info.name.clone())
    };

    // Safety: entry_point and the hooks were resolved by the loader inside
    // this driver's relocated image.
    let staged: Result<(), (&'static str, i32)> = unsafe {
        let start: unsafe extern "C" fn(DriverId) -> i32 = core::mem::transmute(entry_point);
        let err = start(id);
        if err < 0 {
            Err(("_start", err))
        } else {
            klog_always!("driver: loading {}", name);
            let err = call_hook(hooks.probe);
            if err < 0 {
                Err(("probe", err))
            } else {
                let err = call_hook(hooks.entry);
                if err < 0 {
                    Err(("entry", err))
                } else {
                    Ok(())
                }
            }
        }
    };

    let mut drivers = DRIVERS.lock();
    let drv = drivers.get_mut(&id).ok_or(DriverError::NoSuchDriver)?;
    match staged {
        Ok(()) => {
            drv.last_error = 0;
            drv.initialized = true;
            Ok(())
        }
        Err((stage, errno)) => {
            klog!(Error, "driver: {}() failed for {}: {}", stage, name, errno);
            drv.last_error = errno;
            drv.vma.free_all_pages();
            Err(DriverError::LifecycleRejected { stage, errno })
        }
    }
}

/// Activate every preloaded driver in insertion order. Failures are logged
/// by [`activate`]; the walk continues.
pub fn load_all() {
    let ids: Vec<DriverId> = DRIVERS.lock().keys().copied().collect();
    if ids.is_empty() {
        klog_always!("driver: no drivers to load");
        return;
    }
    for id in ids {
        let _ = activate(id);
    }
}

/// Thread body for the activation worker the kernel spawns through the
/// tasking core: drivers' lifecycle calls are synchronous by design and
/// must not run on an interrupt path.
pub fn activation_worker() {
    load_all();
    if let Some(thread) = tasking::current_thread() {
        tasking::terminate_thread(&thread, 0);
    }
    loop {
        tasking::yield_now();
    }
}

// ============================================================================
// Teardown and panic
// ============================================================================

/// Unload every driver in reverse insertion order: `final()`, handler
/// tables cleared, VMA released, table emptied. `final()` runs with the
/// table unlocked for the same reason activation does.
pub fn unload_all() {
    let ids: Vec<DriverId> = DRIVERS.lock().keys().rev().copied().collect();

    for id in ids {
        let final_call = {
            let drivers = DRIVERS.lock();
            drivers
                .get(&id)
                .filter(|d| d.initialized)
                .map(|d| (d.hooks.final_, d.info.name.clone()))
        };
        if let Some((final_, name)) = final_call {
            // Safety: the driver is initialized, so its image is mapped
            // and final_ was resolved inside it.
            let err = unsafe { call_hook(final_) };
            if err < 0 {
                klog!(Warn, "driver: failed to unload {}: {}", name, err);
            }
        }

        let mut drivers = DRIVERS.lock();
        if let Some(drv) = drivers.get_mut(&id) {
            drv.interrupt_handlers.clear();
            drv.device_ops.clear();
            drv.vma.free_all_pages();
        }
        drivers.remove(&id);
    }
}

/// System-panic notification: call `panic()` on every initialized driver
/// whose pointer validates against its own VMA. Re-entry (a driver panic
/// faulting back into this path) is swallowed.
pub fn panic_all() {
    if IN_PANIC_PATH.swap(true, Ordering::AcqRel) {
        return;
    }

    let drivers = DRIVERS.lock();
    for drv in drivers.values() {
        if !drv.initialized {
            continue;
        }
        if drv.panic_pointer_valid() {
            klog!(Error, "driver: panic notification for {}", drv.info.name);
            // Safety: the pointer is non-null and inside the driver's own
            // mapped VMA; the best the kernel can do is call it.
            unsafe {
                let _ = call_hook(drv.hooks.panic);
            }
        } else {
            klog!(Error, "driver: no panic function for {}", drv.info.name);
        }
    }
}

// ============================================================================
// Interrupt and device routing
// ============================================================================

/// Bind an interrupt vector to a handler inside the driver's image.
pub fn register_interrupt_handler(
    id: DriverId,
    vector: u8,
    handler: usize,
) -> Result<(), DriverError> {
    let mut drivers = DRIVERS.lock();
    let drv = drivers.get_mut(&id).ok_or(DriverError::NoSuchDriver)?;
    if !drv.vma.contains(handler) {
        return Err(DriverError::PointerOutsideImage);
    }
    drv.interrupt_handlers.insert(vector, handler);
    Ok(())
}

/// Bind a device identity to a handler table inside the driver's image.
pub fn register_device(id: DriverId, device: u64, ops_table: usize) -> Result<(), DriverError> {
    let mut drivers = DRIVERS.lock();
    let drv = drivers.get_mut(&id).ok_or(DriverError::NoSuchDriver)?;
    if !drv.vma.contains(ops_table) {
        return Err(DriverError::PointerOutsideImage);
    }
    drv.device_ops.insert(device, DeviceHandlers { ops_table });
    Ok(())
}

/// Dispatch an interrupt vector to every driver that registered for it.
/// Handlers run with the table unlocked. Returns the number invoked.
pub fn dispatch_interrupt(vector: u8) -> usize {
    let handlers: Vec<usize> = {
        let drivers = DRIVERS.lock();
        drivers
            .values()
            .filter(|d| d.initialized)
            .filter_map(|d| d.interrupt_handlers.get(&vector).copied())
            .collect()
    };

    for &handler in &handlers {
        // Safety: the handler was containment-checked at registration and
        // the owning driver was initialized when collected.
        unsafe {
            let f: unsafe extern "C" fn(u8) -> i32 = core::mem::transmute(handler);
            let _ = f(vector);
        }
    }
    handlers.len()
}

// ============================================================================
// Test support
// ============================================================================

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Serializes tests that touch the driver table or symbol tables.
    static LOCK: Mutex<()> = Mutex::new(());

    pub fn acquire() -> spin::MutexGuard<'static, ()> {
        let guard = LOCK.lock();
        DRIVERS.lock().clear();
        symbols::teardown();
        IN_PANIC_PATH.store(false, Ordering::Release);
        guard
    }

    /// Insert a hand-built driver object; returns its id.
    pub fn insert_object(mut object: DriverObject) -> DriverId {
        let id = NEXT_DRIVER_ID.fetch_add(1, Ordering::Relaxed);
        object.id = id;
        DRIVERS.lock().insert(id, object);
        id
    }

    pub fn make_object(
        entry_point: usize,
        hooks: DriverHooks,
        vma: VirtualMemoryArea,
    ) -> DriverObject {
        DriverObject {
            id: 0,
            base: 0,
            entry_point,
            vma,
            path: String::from("/test/driver"),
            info: DriverInfo {
                name: String::from("testdrv"),
                description: String::from("test driver"),
                author: String::from("nobody"),
                license: String::from("MIT"),
                version: DriverVersion { major: 0, minor: 1, patch: 0 },
                api_version: DRIVER_API_VERSION,
            },
            hooks,
            initialized: false,
            interrupt_handlers: BTreeMap::new(),
            device_ops: BTreeMap::new(),
            last_error: 0,
        }
    }
}
