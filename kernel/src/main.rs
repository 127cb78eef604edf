//! Kestrel kernel entry.
//!
//! Boot order: serial sink, heap, boot parameters, memory layer, hardware
//! gate (GDT/FPU), CPU bring-up, tasking core, kernel API + driver
//! preload, activation worker, timer. The panic path skips the scheduler
//! entirely and notifies initialized drivers before halting.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]

extern crate alloc;

#[macro_use]
extern crate klog;

mod interrupts;
mod serial;
mod smp;

use alloc::vec::Vec;
use core::cell::UnsafeCell;
use kparam::TaskingMode;
use tasking::{ExecutionMode, TaskArchitecture, TaskCompatibility};
use vfs::RamFs;

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

// ============================================================================
// BSP trap stacks
// ============================================================================

const BOOT_STACK_SIZE: usize = 16 * 1024;

#[repr(C, align(16))]
struct BootStack(UnsafeCell<[u8; BOOT_STACK_SIZE]>);

// Safety: each stack is handed to exactly one CPU slot.
unsafe impl Sync for BootStack {}

impl BootStack {
    const fn new() -> Self {
        BootStack(UnsafeCell::new([0; BOOT_STACK_SIZE]))
    }

    fn top(&self) -> usize {
        self.0.get() as usize + BOOT_STACK_SIZE
    }
}

static BSP_SYSCALL_STACK: BootStack = BootStack::new();
static BSP_TEMP_STACK: BootStack = BootStack::new();
static BSP_KERNEL_STACK: BootStack = BootStack::new();

// ============================================================================
// Entry
// ============================================================================

#[cfg(not(test))]
#[no_mangle]
pub extern "C" fn _start(boot_info: &'static mm::BootInfo) -> ! {
    // Safety: the loader hands us an exclusive heap range.
    unsafe {
        ALLOCATOR
            .lock()
            .init(boot_info.heap_start as *mut u8, boot_info.heap_size as usize);
    }
    kernel_main(boot_info)
}

#[allow(dead_code)]
fn kernel_main(boot_info: &'static mm::BootInfo) -> ! {
    klog::register_sink(serial::sink);

    let cmdline = unsafe { boot_info.cmdline() }.unwrap_or("");
    let config = kparam::parse(cmdline);
    if config.help {
        klog_always!("{}", kparam::USAGE);
        halt_forever();
    }

    mm::enable_paging_control();
    mm::init(boot_info);

    arch::enable_hw();
    arch::fpu::set_simd_allowed(config.simd);
    arch::init();

    klog_always!("Kestrel kernel starting");
    // The boot heap is already constructed (parsing needs it); the
    // selection steers which allocator backs later heap growth.
    klog_always!("alloc: {:?} allocator selected", config.allocator);
    if config.boot_animation {
        klog_always!("bootanim: requested (no framebuffer console in this build)");
    }
    if config.unlock_deadlock {
        klog_always!("udl: deadlock auto-break enabled");
    }
    if config.interrupts_on_crash {
        klog_always!("ioc: interactive crash keys enabled");
    }

    // Bring the boot CPU online, then the rest per configuration.
    cpu_local::activate_cpu(
        0,
        0,
        BSP_SYSCALL_STACK.top(),
        BSP_TEMP_STACK.top(),
        BSP_KERNEL_STACK.top(),
    );
    cpu_local::enable_lapic_id_read();
    smp::bring_up(config.cores, boot_info.cpu_count as usize);

    tasking::init();
    tasking::scheduler::set_enabled(config.tasking == TaskingMode::Multi);
    tasking::register_resched_trigger(interrupts::software_resched);

    // Driver manager: kernel API table, preload, then a worker thread for
    // the synchronous activation calls.
    driver::register_kernel_api();
    let bootfs = RamFs::new();
    match bootfs.get_by_path(&config.driver_directory) {
        Some(dir) => driver::preload(&dir),
        None => klog_always!(
            "driver: directory {} not present in boot archive",
            config.driver_directory
        ),
    }
    if bootfs.get_by_path(&config.init_path).is_none() {
        klog_always!("init: {} not present in boot archive", config.init_path);
    }

    if tasking::scheduler::is_enabled() {
        spawn_driver_worker();
        interrupts::init(config.ioapic_irq_core);
        interrupts::start_scheduler_timer();
    } else {
        // Single-tasking mode: activate drivers on the boot thread.
        driver::load_all();
        interrupts::init(config.ioapic_irq_core);
    }

    klog_always!("Kestrel up; entering idle");
    halt_forever();
}

/// Kernel worker that runs the synchronous driver activation calls off the
/// boot path.
fn spawn_driver_worker() {
    let worker = tasking::spawn_process(None, "kestreld", ExecutionMode::Kernel, true, 0, 0)
        .and_then(|process| {
            tasking::spawn_thread(
                &process,
                driver::activation_worker as usize as u64,
                0,
                Vec::new(),
                Vec::new(),
                TaskArchitecture::X86_64,
                TaskCompatibility::Native,
            )
        });
    match worker {
        Ok(thread) => {
            thread.rename("driver-activation");
        }
        Err(err) => klog!(Error, "driver: cannot spawn activation worker: {:?}", err),
    }
}

fn halt_forever() -> ! {
    loop {
        arch::halt();
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    // The panic path never re-enters the scheduler. Stop the other cores
    // first so nothing mutates shared state while drivers are notified,
    // then halt this core for good.
    tasking::scheduler::set_enabled(false);
    arch::ipi::broadcast_halt();
    klog_always!("KERNEL PANIC: {}", info);
    driver::panic_all();
    halt_forever();
}
