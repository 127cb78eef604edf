//! The kernel API exported to drivers.
//!
//! A small, stable set of `extern "C"` entry points registered under
//! [`DRIVER_API_VERSION`]. Driver images import these by name through
//! their PLT; the loader resolves each slot with
//! [`crate::symbols::get_symbol_by_name`] at load time.

use crate::symbols::register_symbol;

/// API version the current kernel exports.
pub const DRIVER_API_VERSION: u32 = 1;

/// Log a byte string from a driver.
///
/// # Safety
///
/// `msg` must point at `len` readable bytes.
unsafe extern "C" fn kapi_print(msg: *const u8, len: usize) {
    if msg.is_null() || len == 0 || len > 1024 {
        return;
    }
    let bytes = core::slice::from_raw_parts(msg, len);
    if let Ok(text) = core::str::from_utf8(bytes) {
        klog!(Info, "driver: {}", text);
    }
}

extern "C" fn kapi_get_tick_counter() -> u64 {
    tasking::time::get_ticks()
}

extern "C" fn kapi_yield() {
    tasking::yield_now();
}

/// Bind an interrupt vector to a handler inside the calling driver.
extern "C" fn kapi_register_interrupt_handler(driver_id: u64, vector: u8, handler: u64) -> i32 {
    match crate::register_interrupt_handler(driver_id, vector, handler as usize) {
        Ok(()) => 0,
        Err(_) => -22,
    }
}

/// Bind a device identity to a handler table inside the calling driver.
extern "C" fn kapi_register_device(driver_id: u64, device_id: u64, ops_table: u64) -> i32 {
    match crate::register_device(driver_id, device_id, ops_table as usize) {
        Ok(()) => 0,
        Err(_) => -22,
    }
}

/// Publish the kernel API under [`DRIVER_API_VERSION`]. Called once before
/// the preload phase.
pub fn register_kernel_api() {
    register_symbol(DRIVER_API_VERSION, "KernelPrint", kapi_print as usize);
    register_symbol(
        DRIVER_API_VERSION,
        "KernelGetTickCounter",
        kapi_get_tick_counter as usize,
    );
    register_symbol(DRIVER_API_VERSION, "KernelYield", kapi_yield as usize);
    register_symbol(
        DRIVER_API_VERSION,
        "KernelRegisterInterruptHandler",
        kapi_register_interrupt_handler as usize,
    );
    register_symbol(
        DRIVER_API_VERSION,
        "KernelRegisterDevice",
        kapi_register_device as usize,
    );
}
