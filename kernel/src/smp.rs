//! CPU bring-up.
//!
//! Activates per-CPU context-table slots for the cores the boot parameters
//! ask for. The BSP is brought up by `main` with statically allocated
//! stacks; application processors get leaked heap stacks here (a CPU slot
//! never goes away). The INIT-SIPI sequence itself is issued through the
//! LAPIC once interrupts are up; a slot is online for scheduling state as
//! soon as it is activated.

use alloc::boxed::Box;
use cpu_local::MAX_CPU;

/// Stack size for each of the three per-CPU trap stacks.
pub const CPU_STACK_SIZE: usize = 16 * 1024;

fn leak_stack_top() -> usize {
    let stack = Box::leak(Box::new([0u8; CPU_STACK_SIZE]));
    stack.as_ptr() as usize + CPU_STACK_SIZE
}

/// Bring up application processors 1..target.
///
/// `config_cores` is the `cores=` boot parameter (0 = all present);
/// `reported` is the loader's CPU count hint.
pub fn bring_up(config_cores: usize, reported: usize) {
    let present = if reported == 0 { 1 } else { reported.min(MAX_CPU) };
    let target = if config_cores == 0 {
        present
    } else {
        config_cores.min(present)
    };

    for cpu_id in 1..target {
        let syscall_stack = leak_stack_top();
        let temp_stack = leak_stack_top();
        let kernel_stack = leak_stack_top();
        // LAPIC ids are assigned densely by firmware on the platforms the
        // kernel targets; the slot index doubles as the LAPIC id.
        cpu_local::activate_cpu(cpu_id, cpu_id as u32, syscall_stack, temp_stack, kernel_stack);
        klog_always!("smp: CPU {} online", cpu_id);
    }

    klog_always!("smp: {} CPUs online", cpu_local::num_online_cpus());
}
