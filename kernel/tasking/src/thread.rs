//! Thread control blocks.

use crate::process::{Process, TaskInfo};
use crate::state::{
    AtomicTaskState, ExecutionMode, TaskArchitecture, TaskCompatibility, TaskState,
};
use crate::TaskError;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use arch::{FxSaveArea, TrapFrame, KERNEL_CS, KERNEL_SS, USER_CS, USER_SS};
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU64};
use spin::Mutex;

/// Thread identifier; monotonic and unique within the owning process.
pub type ThreadId = usize;

/// Kernel stack size for regular threads.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Idle threads barely push anything; a single page suffices.
pub const IDLE_STACK_SIZE: usize = 4096;

/// Entries kept in the instruction-pointer diagnostic ring.
pub const IP_HISTORY_LEN: usize = 16;

// ============================================================================
// Kernel stack
// ============================================================================

/// An owned kernel stack. Backed by `u128` words so the top is 16-byte
/// aligned as the ABI requires.
pub struct KernelStack {
    mem: alloc::boxed::Box<[u128]>,
}

impl KernelStack {
    /// Allocate a zeroed stack of `size` bytes.
    pub fn new(size: usize) -> Result<Self, TaskError> {
        let words = size / core::mem::size_of::<u128>();
        let mut backing: Vec<u128> = Vec::new();
        backing
            .try_reserve_exact(words)
            .map_err(|_| TaskError::ResourceExhausted)?;
        backing.resize(words, 0);
        Ok(KernelStack {
            mem: backing.into_boxed_slice(),
        })
    }

    /// Address one past the highest usable byte; stacks grow down from here.
    pub fn top(&self) -> u64 {
        (self.mem.as_ptr() as u64) + (self.mem.len() * core::mem::size_of::<u128>()) as u64
    }

    pub fn base(&self) -> u64 {
        self.mem.as_ptr() as u64
    }

    pub fn size(&self) -> usize {
        self.mem.len() * core::mem::size_of::<u128>()
    }
}

impl core::fmt::Debug for KernelStack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "KernelStack({:#x}..{:#x})", self.base(), self.top())
    }
}

/// Descriptor of a user-mode stack mapped elsewhere; the core only tracks
/// the range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserStack {
    pub base: u64,
    pub size: u64,
}

// ============================================================================
// Diagnostic IP history
// ============================================================================

/// Short ring of the most recent instruction pointers observed at
/// scheduling decisions. Purely diagnostic; read by the crash path.
#[derive(Debug, Clone, Copy)]
pub struct IpHistory {
    entries: [u64; IP_HISTORY_LEN],
}

impl IpHistory {
    pub const fn new() -> Self {
        IpHistory {
            entries: [0; IP_HISTORY_LEN],
        }
    }

    /// Shift the ring and record `ip` at the front.
    pub fn push(&mut self, ip: u64) {
        for i in (1..IP_HISTORY_LEN).rev() {
            self.entries[i] = self.entries[i - 1];
        }
        self.entries[0] = ip;
    }

    pub fn latest(&self) -> u64 {
        self.entries[0]
    }

    pub fn entries(&self) -> &[u64; IP_HISTORY_LEN] {
        &self.entries
    }
}

// ============================================================================
// Thread
// ============================================================================

/// Thread control block.
#[derive(Debug)]
pub struct Thread {
    /// Identity, unique within the parent.
    pub id: ThreadId,
    name: Mutex<String>,
    /// Owning process id. Lookup handle, never a lifetime.
    pub parent: crate::process::ProcessId,
    /// Entry point and load offset; the initial rip is their sum.
    pub entry: u64,
    pub offset: u64,
    /// Argument and environment vectors captured at spawn.
    pub args: Vec<String>,
    pub env: Vec<String>,
    /// Owned kernel stack.
    pub kernel_stack: KernelStack,
    /// User stack descriptor, if any.
    pub user_stack: Option<UserStack>,
    /// Saved register frame; touched only by the core that owns the thread
    /// at the moment of save/restore.
    pub registers: Mutex<TrapFrame>,
    /// Saved FPU/SIMD state.
    pub fpu: Mutex<FxSaveArea>,
    /// Segment bases saved/restored around descheduling.
    pub fs_base: AtomicU64,
    pub gs_base: AtomicU64,
    pub shadow_gs_base: AtomicU64,
    pub state: AtomicTaskState,
    pub exit_code: AtomicI32,
    /// Absolute wake deadline; non-zero iff sleeping.
    pub sleep_until: AtomicU64,
    pub info: TaskInfo,
    /// Diagnostic ring of recent instruction pointers.
    pub ip_history: Mutex<IpHistory>,
    /// Set once the scheduler has observed the thread after termination;
    /// the next pass may then reap it.
    pub(crate) reap_seen: AtomicBool,
    pub arch: TaskArchitecture,
    pub compat: TaskCompatibility,
}

impl Thread {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ThreadId,
        parent: &Process,
        entry: u64,
        offset: u64,
        args: Vec<String>,
        env: Vec<String>,
        arch: TaskArchitecture,
        compat: TaskCompatibility,
        stack_size: usize,
        now: u64,
    ) -> Result<Self, TaskError> {
        let kernel_stack = KernelStack::new(stack_size)?;

        // Zeroed frame except rip, rsp and flags; segments follow the
        // process execution mode.
        let mut frame = TrapFrame::zeroed();
        frame.rip = entry.wrapping_add(offset);
        frame.rsp = kernel_stack.top();
        if parent.mode == ExecutionMode::User {
            frame.cs = USER_CS;
            frame.ss = USER_SS;
        } else {
            frame.cs = KERNEL_CS;
            frame.ss = KERNEL_SS;
        }
        frame.ds = frame.ss;

        Ok(Thread {
            id,
            name: Mutex::new(String::new()),
            parent: parent.id,
            entry,
            offset,
            args,
            env,
            kernel_stack,
            user_stack: None,
            registers: Mutex::new(frame),
            fpu: Mutex::new(FxSaveArea::default()),
            fs_base: AtomicU64::new(0),
            gs_base: AtomicU64::new(0),
            shadow_gs_base: AtomicU64::new(0),
            state: AtomicTaskState::new(TaskState::Ready),
            exit_code: AtomicI32::new(0),
            sleep_until: AtomicU64::new(0),
            info: TaskInfo::new(now),
            ip_history: Mutex::new(IpHistory::new()),
            reap_seen: AtomicBool::new(false),
            arch,
            compat,
        })
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn rename(&self, name: &str) {
        if name.is_empty() {
            return;
        }
        *self.name.lock() = name.to_string();
    }

    /// May this thread run on `cpu_id`?
    #[inline]
    pub fn allows_cpu(&self, cpu_id: usize) -> bool {
        self.info.allows_cpu(cpu_id)
    }

    /// Structural validity against the process claimed as parent: checked
    /// state byte and matching back-pointer.
    pub fn validate(&self, parent: &Process) -> bool {
        self.parent == parent.id && self.state.load().is_some()
    }

    /// Kernel stack top installed for ring transitions when this thread is
    /// dispatched.
    #[inline]
    pub fn kernel_stack_top(&self) -> u64 {
        self.kernel_stack.top()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_stack_alignment() {
        let stack = KernelStack::new(KERNEL_STACK_SIZE).expect("stack");
        assert_eq!(stack.size(), KERNEL_STACK_SIZE);
        assert_eq!(stack.top() % 16, 0);
        assert_eq!(stack.top() - stack.base(), KERNEL_STACK_SIZE as u64);
    }

    #[test]
    fn test_ip_history_ring() {
        let mut ring = IpHistory::new();
        for ip in 1..=20u64 {
            ring.push(ip);
        }
        assert_eq!(ring.latest(), 20);
        // Oldest surviving entry is 20 - 15 = 5.
        assert_eq!(ring.entries()[IP_HISTORY_LEN - 1], 5);
    }
}
