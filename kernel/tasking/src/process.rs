//! Process control blocks.

use crate::state::{AtomicTaskState, ExecutionMode, TaskPriority, TaskState};
use crate::thread::Thread;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use cpu_local::MAX_CPU;
use mm::{AddressSpace, VirtualMemoryArea};
use spin::Mutex;

/// Process identifier; globally unique and monotonic, starting at 1.
pub type ProcessId = usize;

/// Sentinel uid/gid meaning "inherit from the parent".
pub const ID_UNSET: u16 = u16::MAX;

/// Exit code installed at creation; still present at death means the
/// process was killed by a crash rather than exiting.
pub const KILL_CRASH: i32 = -256;

/// Real or effective user identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserIdent {
    pub uid: u16,
    pub gid: u16,
}

// ============================================================================
// File descriptor table
// ============================================================================

/// Maximum file descriptors per process. 0/1/2 are reserved for the
/// standard streams; allocation starts at 3.
pub const MAX_FD: i32 = 256;

/// Operations a file descriptor must support. Concrete types live with
/// their subsystems; the core only needs cloning and identification.
pub trait FileOps: Send + Sync {
    fn clone_box(&self) -> Box<dyn FileOps>;
    fn type_name(&self) -> &'static str;
}

impl core::fmt::Debug for dyn FileOps {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "FileOps({})", self.type_name())
    }
}

/// Per-process descriptor table.
#[derive(Debug, Default)]
pub struct FdTable {
    entries: BTreeMap<i32, Box<dyn FileOps>>,
}

impl FdTable {
    pub const fn new() -> Self {
        FdTable {
            entries: BTreeMap::new(),
        }
    }

    /// Install a descriptor at the lowest free slot >= 3.
    pub fn allocate(&mut self, desc: Box<dyn FileOps>) -> Option<i32> {
        let mut fd: i32 = 3;
        while fd < MAX_FD {
            if !self.entries.contains_key(&fd) {
                self.entries.insert(fd, desc);
                return Some(fd);
            }
            fd = fd.checked_add(1)?;
        }
        None
    }

    pub fn get(&self, fd: i32) -> Option<&Box<dyn FileOps>> {
        if fd < 0 {
            return None;
        }
        self.entries.get(&fd)
    }

    pub fn remove(&mut self, fd: i32) -> Option<Box<dyn FileOps>> {
        if fd < 0 {
            return None;
        }
        self.entries.remove(&fd)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Accounting
// ============================================================================

/// Accounting record shared by processes and threads: spawn time, CPU time
/// split by privilege and by core, the affinity mask and the priority.
#[derive(Debug)]
pub struct TaskInfo {
    /// Tick at creation.
    pub spawn_time: u64,
    /// Ticks spent while the owner ran in kernel/system mode.
    kernel_ticks: AtomicU64,
    /// Ticks spent while the owner ran in user mode.
    user_ticks: AtomicU64,
    /// Ticks accumulated per core.
    usage: [AtomicU64; MAX_CPU],
    /// Tick of the last accounting update.
    last_update: AtomicU64,
    /// Scheduling priority (raw [`TaskPriority`] value).
    priority: AtomicU8,
    /// Affinity mask: bit `i` set means "may run on CPU `i`".
    affinity: AtomicU64,
}

impl TaskInfo {
    pub fn new(now: u64) -> Self {
        TaskInfo {
            spawn_time: now,
            kernel_ticks: AtomicU64::new(0),
            user_ticks: AtomicU64::new(0),
            usage: core::array::from_fn(|_| AtomicU64::new(0)),
            last_update: AtomicU64::new(now),
            priority: AtomicU8::new(TaskPriority::Normal as u8),
            affinity: AtomicU64::new(u64::MAX),
        }
    }

    /// Add `delta` ticks to the bucket selected by `mode` and to the
    /// per-core counter, and stamp the update time.
    pub fn account(&self, delta: u64, mode: ExecutionMode, cpu_id: usize, now: u64) {
        match mode {
            ExecutionMode::User => self.user_ticks.fetch_add(delta, Ordering::Relaxed),
            ExecutionMode::Kernel | ExecutionMode::System => {
                self.kernel_ticks.fetch_add(delta, Ordering::Relaxed)
            }
        };
        if cpu_id < MAX_CPU {
            self.usage[cpu_id].fetch_add(delta, Ordering::Relaxed);
        }
        self.last_update.store(now, Ordering::Relaxed);
    }

    pub fn kernel_ticks(&self) -> u64 {
        self.kernel_ticks.load(Ordering::Relaxed)
    }

    pub fn user_ticks(&self) -> u64 {
        self.user_ticks.load(Ordering::Relaxed)
    }

    pub fn usage_on(&self, cpu_id: usize) -> u64 {
        if cpu_id < MAX_CPU {
            self.usage[cpu_id].load(Ordering::Relaxed)
        } else {
            0
        }
    }

    pub fn last_update(&self) -> u64 {
        self.last_update.load(Ordering::Relaxed)
    }

    pub fn priority(&self) -> TaskPriority {
        TaskPriority::from_u8(self.priority.load(Ordering::Relaxed)).unwrap_or(TaskPriority::Normal)
    }

    pub fn set_priority(&self, priority: TaskPriority) {
        self.priority.store(priority as u8, Ordering::Relaxed);
    }

    pub fn affinity(&self) -> u64 {
        self.affinity.load(Ordering::Relaxed)
    }

    pub fn set_affinity(&self, mask: u64) {
        self.affinity.store(mask, Ordering::Relaxed);
    }

    /// May the owner run on `cpu_id`?
    #[inline]
    pub fn allows_cpu(&self, cpu_id: usize) -> bool {
        cpu_id < 64 && (self.affinity() & (1u64 << cpu_id)) != 0
    }
}

// ============================================================================
// Process
// ============================================================================

/// Process control block.
///
/// Structural fields (name, thread list, children, descriptor table) sit
/// behind spinlocks; everything read from other cores is atomic. The parent
/// link is an id, a pure lookup handle: ownership runs strictly downward
/// (global list -> process -> threads/children).
#[derive(Debug)]
pub struct Process {
    /// Unique, monotonic identity.
    pub id: ProcessId,
    name: Mutex<String>,
    /// Parent id, 0 for none. Lookup only, never a lifetime.
    pub parent: ProcessId,
    pub mode: ExecutionMode,
    real: Mutex<UserIdent>,
    effective: Mutex<UserIdent>,
    /// Owning page-table handle.
    pub address_space: AddressSpace,
    /// Virtual-memory-area manager for this process's allocations.
    pub vma: VirtualMemoryArea,
    pub state: AtomicTaskState,
    /// Job-control stop flag, orthogonal to the scheduling state: a
    /// stopped process keeps every thread's state intact (a sleeping
    /// thread keeps its wait condition and deadline) and is simply never
    /// selected until continued. Folding the stop into the state machine
    /// would lose those wait conditions.
    stopped: AtomicBool,
    pub exit_code: AtomicI32,
    /// Owned threads, insertion ordered.
    pub threads: Mutex<Vec<Arc<Thread>>>,
    /// Owned children (ids), insertion ordered.
    pub children: Mutex<Vec<ProcessId>>,
    pub fd_table: Mutex<FdTable>,
    /// Signals queued for delivery at the next scheduling decision.
    pub signals: Mutex<crate::signal::PendingSignals>,
    pub info: TaskInfo,
    next_tid: AtomicUsize,
}

impl Process {
    pub(crate) fn new(
        id: ProcessId,
        parent: ProcessId,
        name: &str,
        mode: ExecutionMode,
        address_space: AddressSpace,
        ident: UserIdent,
        now: u64,
    ) -> Self {
        Process {
            id,
            name: Mutex::new(name.to_string()),
            parent,
            mode,
            real: Mutex::new(ident),
            effective: Mutex::new(ident),
            address_space,
            vma: VirtualMemoryArea::new(),
            state: AtomicTaskState::new(TaskState::Ready),
            stopped: AtomicBool::new(false),
            exit_code: AtomicI32::new(KILL_CRASH),
            threads: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            fd_table: Mutex::new(FdTable::new()),
            signals: Mutex::new(crate::signal::PendingSignals::new()),
            info: TaskInfo::new(now),
            next_tid: AtomicUsize::new(1),
        }
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

    pub fn real_ident(&self) -> UserIdent {
        *self.real.lock()
    }

    pub fn effective_ident(&self) -> UserIdent {
        *self.effective.lock()
    }

    pub fn set_effective_ident(&self, ident: UserIdent) {
        *self.effective.lock() = ident;
    }

    /// Next thread id within this process.
    pub(crate) fn allocate_tid(&self) -> usize {
        self.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    pub fn find_thread(&self, tid: usize) -> Option<Arc<Thread>> {
        self.threads.lock().iter().find(|t| t.id == tid).cloned()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Distinguishes "all threads reaped" from "not yet given a thread":
    /// tids are handed out monotonically starting at 1.
    pub(crate) fn ever_had_threads(&self) -> bool {
        self.next_tid.load(Ordering::Relaxed) > 1
    }

    /// Is the process stopped by job control?
    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Set or clear the job-control stop flag.
    #[inline]
    pub fn set_stopped(&self, stopped: bool) {
        self.stopped.store(stopped, Ordering::Release);
    }

    /// Structural validity: a checked state byte and a non-zero identity.
    /// The scheduler skips (and later reaps) anything that fails this.
    pub fn validate(&self) -> bool {
        self.id != 0 && self.state.load().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullFile;
    impl FileOps for NullFile {
        fn clone_box(&self) -> Box<dyn FileOps> {
            Box::new(NullFile)
        }
        fn type_name(&self) -> &'static str {
            "null"
        }
    }

    #[test]
    fn test_fd_allocation_starts_at_three() {
        let mut table = FdTable::new();
        assert_eq!(table.allocate(Box::new(NullFile)), Some(3));
        assert_eq!(table.allocate(Box::new(NullFile)), Some(4));
        assert!(table.get(3).is_some());
        assert!(table.get(0).is_none());

        table.remove(3);
        // Lowest free slot is reused.
        assert_eq!(table.allocate(Box::new(NullFile)), Some(3));
    }

    #[test]
    fn test_task_info_accounting_buckets() {
        let info = TaskInfo::new(100);
        info.account(5, ExecutionMode::Kernel, 0, 105);
        info.account(3, ExecutionMode::User, 1, 108);
        assert_eq!(info.kernel_ticks(), 5);
        assert_eq!(info.user_ticks(), 3);
        assert_eq!(info.usage_on(0), 5);
        assert_eq!(info.usage_on(1), 3);
        assert_eq!(info.last_update(), 108);
    }

    #[test]
    fn test_affinity_mask() {
        let info = TaskInfo::new(0);
        assert!(info.allows_cpu(0));
        assert!(info.allows_cpu(63));
        info.set_affinity(1 << 2);
        assert!(!info.allows_cpu(0));
        assert!(info.allows_cpu(2));
        assert!(!info.allows_cpu(64));
    }
}
