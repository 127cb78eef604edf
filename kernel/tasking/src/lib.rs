//! Tasking core: processes, threads and the preemptive scheduler.
//!
//! Ownership runs strictly downward: the global process list owns the
//! processes, each process owns its threads and (by id) its children.
//! Parent links are ids, pure lookup handles. The per-CPU context table
//! holds raw pointers into this structure; the reaper never frees an
//! entity an active CPU slot still references, which is what makes those
//! pointers sound.

#![no_std]

extern crate alloc;

#[macro_use]
extern crate klog;

pub mod process;
pub mod scheduler;
pub mod signal;
pub mod state;
pub mod thread;
pub mod time;

pub use process::{FdTable, FileOps, Process, ProcessId, TaskInfo, UserIdent, ID_UNSET, KILL_CRASH};
pub use scheduler::{on_timer_interrupt, stats as scheduler_stats, tick, SchedulerStats};
pub use signal::{default_action, send as send_signal, Signal, SignalAction, SignalError};
pub use state::{
    AtomicTaskState, ExecutionMode, TaskArchitecture, TaskCompatibility, TaskPriority, TaskState,
};
pub use thread::{Thread, ThreadId, IDLE_STACK_SIZE, KERNEL_STACK_SIZE};

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use cpu_local::{RawTaskPtr, MAX_CPU};
use lazy_static::lazy_static;
use mm::AddressSpace;
use spin::{Mutex, Once};

/// Tasking errors surfaced to callers. Scheduler-internal violations are
/// never surfaced; they demote the offending entity instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// A checked precondition failed (bad state byte, empty name, dead
    /// parent).
    InvariantViolation,
    /// Stack, page-table or list allocation failed; partial state was
    /// unwound.
    ResourceExhausted,
    /// The requested affinity mask can never be satisfied.
    AffinityUnsatisfiable,
}

lazy_static! {
    /// Global process list: insertion ordered, uniquely keyed by id.
    /// Structural mutation only under this lock; the scheduler tick takes
    /// it in try-lock mode and degrades to idle on contention.
    pub(crate) static ref PROCESS_LIST: Mutex<Vec<Arc<Process>>> = Mutex::new(Vec::new());
}

/// Next process id; 0 is reserved for "no parent".
static NEXT_PID: AtomicUsize = AtomicUsize::new(1);

/// Set once [`init`] has built the idle set.
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Trigger invoked by [`yield_now`] to enter the scheduler. The kernel
/// wires this to a self-directed timer interrupt.
static RESCHED_TRIGGER: Mutex<Option<fn()>> = Mutex::new(None);

/// The idle process and its per-CPU threads. Never in the process list,
/// never destroyed: the selection policies cannot see it, and the idle
/// binding is the explicit final fallback of every scheduling pass.
pub(crate) struct IdleSet {
    pub process: Arc<Process>,
    /// Indexed by CPU id; each thread's affinity pins it to its CPU.
    pub threads: Vec<Arc<Thread>>,
}

static IDLE: Once<IdleSet> = Once::new();

pub(crate) fn idle_set() -> Option<&'static IdleSet> {
    IDLE.get()
}

/// Has [`init`] completed?
pub fn initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// The idle loop every otherwise-idle core parks in.
fn idle_thread_entry() {
    loop {
        arch::halt();
    }
}

fn build_idle_set() -> IdleSet {
    let now = time::get_ticks();
    let process = Arc::new(Process::new(
        NEXT_PID.fetch_add(1, Ordering::Relaxed),
        0,
        "idle",
        ExecutionMode::Kernel,
        AddressSpace::kernel_shared(),
        UserIdent { uid: 0, gid: 0 },
        now,
    ));

    let mut threads = Vec::with_capacity(MAX_CPU);
    for cpu_id in 0..MAX_CPU {
        let thread = Thread::new(
            process.allocate_tid(),
            &process,
            idle_thread_entry as usize as u64,
            0,
            Vec::new(),
            Vec::new(),
            TaskArchitecture::X86_64,
            TaskCompatibility::Native,
            IDLE_STACK_SIZE,
            now,
        )
        // Idle must exist before anything can run; failing to build it is
        // an unbootable system.
        .expect("idle thread allocation failed at boot");
        thread.rename("idle");
        thread.info.set_priority(TaskPriority::Idle);
        thread.info.set_affinity(1u64 << cpu_id);
        let thread = Arc::new(thread);
        process.threads.lock().push(thread.clone());
        threads.push(thread);
    }

    IdleSet { process, threads }
}

/// Initialize the tasking core: the tick clock and the idle set. Explicit,
/// idempotent, and required before the first timer interrupt.
pub fn init() {
    time::init();
    IDLE.call_once(build_idle_set);
    INITIALIZED.store(true, Ordering::Release);
    klog_always!(
        "tasking: initialized ({} idle threads, scheduler {})",
        MAX_CPU,
        if scheduler::is_enabled() { "on" } else { "off" }
    );
}

/// Tear the tasking core down: terminate and drop every process. The idle
/// set is static and survives; CPU bindings are cleared by the caller via
/// `cpu_local::teardown`.
pub fn teardown() {
    let mut list = PROCESS_LIST.lock();
    for process in list.iter() {
        terminate_process_in(&list, process, KILL_CRASH);
    }
    list.clear();
    INITIALIZED.store(false, Ordering::Release);
}

// ============================================================================
// Spawning
// ============================================================================

/// Create a process.
///
/// `use_kernel_pagetable` keeps the shared kernel table; otherwise a fresh
/// root is forked from it. uid/gid equal to [`ID_UNSET`] inherit from the
/// parent. The process starts Ready with zero threads and cannot be
/// scheduled until it gains one.
pub fn spawn_process(
    parent: Option<&Arc<Process>>,
    name: &str,
    mode: ExecutionMode,
    use_kernel_pagetable: bool,
    uid: u16,
    gid: u16,
) -> Result<Arc<Process>, TaskError> {
    if name.is_empty() {
        return Err(TaskError::InvariantViolation);
    }

    let (mut uid, mut gid) = (uid, gid);
    if let Some(parent) = parent {
        if uid == ID_UNSET && gid == ID_UNSET {
            let real = parent.real_ident();
            uid = real.uid;
            gid = real.gid;
        }
    }

    let address_space = if use_kernel_pagetable {
        AddressSpace::kernel_shared()
    } else {
        AddressSpace::fork_from_kernel().map_err(|_| TaskError::ResourceExhausted)?
    };

    let id = NEXT_PID.fetch_add(1, Ordering::Relaxed);
    let process = Arc::new(Process::new(
        id,
        parent.map(|p| p.id).unwrap_or(0),
        name,
        mode,
        address_space,
        UserIdent { uid, gid },
        time::get_ticks(),
    ));

    if let Some(parent) = parent {
        parent.children.lock().push(id);
    }
    PROCESS_LIST.lock().push(process.clone());

    klog!(
        Info,
        "tasking: spawned {:?} process \"{}\" ({}), parent {}",
        mode,
        name,
        id,
        process.parent
    );
    Ok(process)
}

/// Create a thread in `process`.
///
/// Allocates a kernel stack and a zeroed register frame with only the
/// instruction pointer (entry + offset), the stack pointer (stack top) and
/// the flags (interrupts enabled, reserved-one bit) filled in. The thread
/// is appended to the parent and marked Ready.
#[allow(clippy::too_many_arguments)]
pub fn spawn_thread(
    process: &Arc<Process>,
    entry: u64,
    offset: u64,
    args: Vec<String>,
    env: Vec<String>,
    arch_: TaskArchitecture,
    compat: TaskCompatibility,
) -> Result<Arc<Thread>, TaskError> {
    if !process.validate() || process.state.is(TaskState::Terminated) {
        return Err(TaskError::InvariantViolation);
    }

    let thread = Thread::new(
        process.allocate_tid(),
        process,
        entry,
        offset,
        args,
        env,
        arch_,
        compat,
        KERNEL_STACK_SIZE,
        time::get_ticks(),
    )?;
    let thread = Arc::new(thread);
    process.threads.lock().push(thread.clone());

    klog!(
        Debug,
        "tasking: spawned thread {} in process {} (entry {:#x})",
        thread.id,
        process.id,
        entry
    );
    Ok(thread)
}

// ============================================================================
// State transitions
// ============================================================================

/// Put `thread` to sleep until the absolute tick `until_tick`.
///
/// `sleep_until` is published before the state flips to Sleeping so the
/// wake pass can never observe a sleeping thread without a deadline.
/// Idempotent on an already-sleeping thread.
pub fn sleep(thread: &Arc<Thread>, until_tick: u64) -> Result<(), TaskError> {
    match thread.state.load() {
        Some(TaskState::Sleeping) => Ok(()),
        Some(TaskState::Running) | Some(TaskState::Ready) => {
            thread.sleep_until.store(until_tick.max(1), Ordering::Release);
            thread.state.store(TaskState::Sleeping);
            Ok(())
        }
        _ => Err(TaskError::InvariantViolation),
    }
}

/// Cancel a sleep: state straight to Ready, deadline zeroed. The next
/// scheduler pass may pick the thread up; the sleeper observes an early
/// wake.
pub fn wake(thread: &Arc<Thread>) {
    if thread.state.transition(TaskState::Sleeping, TaskState::Ready) {
        thread.sleep_until.store(0, Ordering::Release);
    }
}

/// Running -> Blocked (wait primitive).
pub fn block(thread: &Arc<Thread>) {
    let _ = thread.state.transition(TaskState::Running, TaskState::Blocked);
}

/// Blocked -> Ready.
pub fn unblock(thread: &Arc<Thread>) {
    let _ = thread.state.transition(TaskState::Blocked, TaskState::Ready);
}

/// Give up the CPU: the caller's thread goes back to Ready and the
/// scheduler entry is invoked via the registered trigger.
pub fn yield_now() {
    if let Some(thread) = current_thread() {
        let _ = thread.state.transition(TaskState::Running, TaskState::Ready);
    }
    let trigger = *RESCHED_TRIGGER.lock();
    if let Some(f) = trigger {
        f();
    }
}

/// Register the reschedule trigger used by [`yield_now`].
pub fn register_resched_trigger(f: fn()) {
    *RESCHED_TRIGGER.lock() = Some(f);
}

/// Mark a thread Terminated with `code`. Storage is reclaimed lazily by
/// the scheduler once it has observed the termination.
pub fn terminate_thread(thread: &Arc<Thread>, code: i32) {
    thread.exit_code.store(code, Ordering::Release);
    thread.state.store(TaskState::Terminated);
}

/// Mark a process and everything it owns Terminated with `code`,
/// recursively including its children.
pub fn terminate_process(process: &Arc<Process>, code: i32) {
    let list = PROCESS_LIST.lock();
    terminate_process_in(&list, process, code);
}

/// Termination walk over an already-locked process list. The scheduler
/// (which holds the list lock during delivery) comes through here.
pub(crate) fn terminate_process_in(list: &[Arc<Process>], process: &Arc<Process>, code: i32) {
    process.exit_code.store(code, Ordering::Release);
    let threads: Vec<Arc<Thread>> = process.threads.lock().clone();
    for thread in &threads {
        terminate_thread(thread, code);
    }
    process.state.store(TaskState::Terminated);

    let children: Vec<ProcessId> = process.children.lock().clone();
    for child_id in children {
        if let Some(child) = list.iter().find(|p| p.id == child_id) {
            let child = child.clone();
            terminate_process_in(list, &child, code);
        }
    }
}

/// Change a thread's affinity mask. An all-zero mask could never be
/// scheduled anywhere and is rejected; a mask of currently-offline CPUs is
/// accepted (they may come online) and merely leaves the thread Ready
/// until one does.
pub fn set_thread_affinity(thread: &Arc<Thread>, mask: u64) -> Result<(), TaskError> {
    if mask == 0 {
        return Err(TaskError::AffinityUnsatisfiable);
    }
    thread.info.set_affinity(mask);
    Ok(())
}

// ============================================================================
// Lookup
// ============================================================================

/// Find a process by id.
pub fn get_process(pid: ProcessId) -> Option<Arc<Process>> {
    PROCESS_LIST.lock().iter().find(|p| p.id == pid).cloned()
}

/// Number of live processes (the idle process is not listed).
pub fn process_count() -> usize {
    PROCESS_LIST.lock().len()
}

/// The process bound to the calling core, if any.
pub fn current_process() -> Option<Arc<Process>> {
    let p_ptr = cpu_local::current().current_process();
    if p_ptr.is_null() {
        return None;
    }
    if let Some(idle) = idle_set() {
        if Arc::as_ptr(&idle.process) as RawTaskPtr == p_ptr {
            return Some(idle.process.clone());
        }
    }
    PROCESS_LIST
        .lock()
        .iter()
        .find(|p| Arc::as_ptr(p) as RawTaskPtr == p_ptr)
        .cloned()
}

/// The thread bound to the calling core, if any.
pub fn current_thread() -> Option<Arc<Thread>> {
    let t_ptr = cpu_local::current().current_thread();
    if t_ptr.is_null() {
        return None;
    }
    if let Some(idle) = idle_set() {
        if let Some(t) = idle
            .threads
            .iter()
            .find(|t| Arc::as_ptr(t) as RawTaskPtr == t_ptr)
        {
            return Some(t.clone());
        }
    }
    let list = PROCESS_LIST.lock();
    for process in list.iter() {
        if let Some(t) = process
            .threads
            .lock()
            .iter()
            .find(|t| Arc::as_ptr(t) as RawTaskPtr == t_ptr)
        {
            return Some(t.clone());
        }
    }
    None
}

// ============================================================================
// Test support
// ============================================================================

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use core::ptr::null_mut;

    /// Serializes tests that touch the global tasking state.
    static LOCK: Mutex<()> = Mutex::new(());

    /// Take the global test lock and reset shared state: empty process
    /// list, CPUs 0/1 online with clear bindings.
    pub fn acquire() -> spin::MutexGuard<'static, ()> {
        let guard = LOCK.lock();
        init();
        PROCESS_LIST.lock().clear();
        for cpu_id in 0..2 {
            let cpu = cpu_local::by_id(cpu_id);
            if !cpu.is_active() {
                cpu_local::activate_cpu(cpu_id, cpu_id as u32, 0, 0, 0);
            }
            unsafe {
                cpu.set_current_process(null_mut());
                cpu.set_current_thread(null_mut());
            }
        }
        guard
    }

    /// Spawn a kernel process with `n` threads, all Ready.
    pub fn spawn_with_threads(name: &str, n: usize) -> (Arc<Process>, Vec<Arc<Thread>>) {
        let process =
            spawn_process(None, name, ExecutionMode::Kernel, true, 0, 0).expect("spawn process");
        let threads = (0..n)
            .map(|i| {
                spawn_thread(
                    &process,
                    0x4000 + (i as u64) * 0x100,
                    0,
                    Vec::new(),
                    Vec::new(),
                    TaskArchitecture::X86_64,
                    TaskCompatibility::Native,
                )
                .expect("spawn thread")
            })
            .collect();
        (process, threads)
    }

    /// Drive one timer tick on `cpu_id` and report which thread ends up
    /// Running there.
    pub fn tick_on(cpu_id: usize, frame: &mut arch::TrapFrame) -> RawTaskPtr {
        time::on_timer_tick();
        scheduler::tick(cpu_local::by_id(cpu_id), frame);
        cpu_local::by_id(cpu_id).current_thread()
    }

    pub fn ptr_of_thread(t: &Arc<Thread>) -> RawTaskPtr {
        Arc::as_ptr(t) as RawTaskPtr
    }

    pub fn idle_thread_ptr(cpu_id: usize) -> RawTaskPtr {
        Arc::as_ptr(&idle_set().unwrap().threads[cpu_id]) as RawTaskPtr
    }
}
