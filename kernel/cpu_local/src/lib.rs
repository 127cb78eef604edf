//! Per-CPU Context Table (PCCT).
//!
//! A fixed-capacity, const-initialized array of per-CPU records. Every other
//! subsystem reads the calling core's record through [`current`], including
//! the earliest moments of interrupt entry, so the accessors here must not
//! allocate, must not suspend and must not take any lock.
//!
//! # Concurrency
//!
//! Every field of [`CpuContext`] is either written only by the owning core
//! with interrupts disabled (the FPU scratch area) or declared atomic. The
//! `current_process`/`current_thread` slots are `AtomicPtr<()>` with
//! acquire/release ordering; they are raw pointers because the task types
//! live in the `tasking` crate, which depends on this one. The tasking crate
//! owns the only code that stores or interprets those pointers and anchors
//! their lifetime in its global process list.
//!
//! # CPU identification
//!
//! `current()` maps the hardware LAPIC ID to a table index through a
//! reverse-mapping table for O(1) lookup. The MMIO read is gated behind
//! [`enable_lapic_id_read`]; before the gate opens (early boot, host tests)
//! every caller resolves to CPU 0.

#![no_std]

use core::cell::UnsafeCell;
use core::ptr::null_mut;
use core::sync::atomic::{
    AtomicBool, AtomicI64, AtomicPtr, AtomicU32, AtomicUsize, Ordering,
};

/// Maximum number of CPUs supported by the kernel.
pub const MAX_CPU: usize = 64;

/// Integrity cookie stored in every [`CpuContext`]. A mismatch means the
/// record was trampled and must not be trusted.
pub const CPU_DATA_CHECKSUM: u32 = 0x00C0_FFEE;

/// Size of the per-CPU FPU scratch save area (FXSAVE layout).
pub const FPU_SCRATCH_SIZE: usize = 512;

/// Invalid CPU index marker for the reverse mapping table.
const INVALID_CPU_ID: usize = usize::MAX;

/// Size of the LAPIC-ID reverse mapping table (covers all 8-bit LAPIC IDs).
const LAPIC_ID_REVERSE_MAP_SIZE: usize = 256;

/// Raw task pointer stored in the current-process/current-thread slots.
///
/// Raw to avoid a circular dependency with the tasking crate.
pub type RawTaskPtr = *mut ();

// ============================================================================
// FPU scratch area
// ============================================================================

/// Per-CPU FXSAVE-compatible scratch area used during trap entry, before the
/// owning thread's save area is known.
///
/// Written only by the owning core with interrupts disabled.
#[repr(C, align(64))]
pub struct FpuScratch(UnsafeCell<[u8; FPU_SCRATCH_SIZE]>);

// Safety: each core touches only its own slot, with interrupts disabled.
unsafe impl Sync for FpuScratch {}

impl FpuScratch {
    const fn new() -> Self {
        FpuScratch(UnsafeCell::new([0; FPU_SCRATCH_SIZE]))
    }

    /// Raw pointer for `fxsave`/`fxrstor`.
    ///
    /// # Safety
    ///
    /// Caller must be the owning core and must have interrupts disabled for
    /// the duration of the access.
    pub unsafe fn as_mut_ptr(&self) -> *mut u8 {
        (*self.0.get()).as_mut_ptr()
    }
}

// ============================================================================
// Per-CPU record
// ============================================================================

/// One per-CPU record, cache-line aligned.
#[repr(C, align(64))]
pub struct CpuContext {
    /// Scratch stack top used by the syscall entry path.
    pub syscall_stack: AtomicUsize,
    /// Temporary stack top used during trap entry.
    pub temp_stack: AtomicUsize,
    /// Core kernel stack top.
    pub kernel_stack: AtomicUsize,
    /// Numeric CPU identity (table index). Written once at bring-up.
    id: AtomicUsize,
    /// Last error recorded on this core.
    error_code: AtomicI64,
    /// Currently bound process (raw, owned by the tasking crate).
    current_process: AtomicPtr<()>,
    /// Currently bound thread (raw, owned by the tasking crate).
    current_thread: AtomicPtr<()>,
    /// FPU save scratch for trap handling.
    pub fpu_scratch: FpuScratch,
    /// Integrity cookie; must equal [`CPU_DATA_CHECKSUM`].
    checksum: AtomicU32,
    /// Is this CPU online?
    active: AtomicBool,
}

impl CpuContext {
    /// Construct a zeroed, inactive record. The checksum is only stamped at
    /// bring-up so a never-initialized slot fails [`integrity_ok`].
    pub const fn new() -> Self {
        CpuContext {
            syscall_stack: AtomicUsize::new(0),
            temp_stack: AtomicUsize::new(0),
            kernel_stack: AtomicUsize::new(0),
            id: AtomicUsize::new(0),
            error_code: AtomicI64::new(0),
            current_process: AtomicPtr::new(null_mut()),
            current_thread: AtomicPtr::new(null_mut()),
            fpu_scratch: FpuScratch::new(),
            checksum: AtomicU32::new(0),
            active: AtomicBool::new(false),
        }
    }

    /// Initialize this slot with identity and stack metadata.
    fn init(&self, id: usize, syscall_stack: usize, temp_stack: usize, kernel_stack: usize) {
        self.id.store(id, Ordering::Relaxed);
        self.syscall_stack.store(syscall_stack, Ordering::Relaxed);
        self.temp_stack.store(temp_stack, Ordering::Relaxed);
        self.kernel_stack.store(kernel_stack, Ordering::Relaxed);
        self.error_code.store(0, Ordering::Relaxed);
        self.current_process.store(null_mut(), Ordering::Relaxed);
        self.current_thread.store(null_mut(), Ordering::Relaxed);
        self.checksum.store(CPU_DATA_CHECKSUM, Ordering::Release);
    }

    /// Table index of this CPU.
    #[inline]
    pub fn id(&self) -> usize {
        self.id.load(Ordering::Relaxed)
    }

    /// Record a core-local error code.
    #[inline]
    pub fn set_error(&self, code: i64) {
        self.error_code.store(code, Ordering::Relaxed);
    }

    /// Last error recorded on this core.
    #[inline]
    pub fn last_error(&self) -> i64 {
        self.error_code.load(Ordering::Relaxed)
    }

    /// Is this CPU online?
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Currently bound process pointer.
    #[inline]
    pub fn current_process(&self) -> RawTaskPtr {
        self.current_process.load(Ordering::Acquire)
    }

    /// Currently bound thread pointer.
    #[inline]
    pub fn current_thread(&self) -> RawTaskPtr {
        self.current_thread.load(Ordering::Acquire)
    }

    /// Bind a process to this CPU.
    ///
    /// # Safety
    ///
    /// Caller must guarantee the pointee outlives the binding; the tasking
    /// crate guarantees this by never destroying a task that any active
    /// CPU slot still references.
    #[inline]
    pub unsafe fn set_current_process(&self, process: RawTaskPtr) {
        self.current_process.store(process, Ordering::Release);
    }

    /// Bind a thread to this CPU, verifying the outgoing binding.
    ///
    /// Returns `false` (and leaves the slot untouched) if another writer got
    /// there first; the scheduler treats that as an invariant violation and
    /// rebinds from scratch.
    ///
    /// # Safety
    ///
    /// Same lifetime contract as [`set_current_process`].
    #[inline]
    pub unsafe fn exchange_current_thread(&self, old: RawTaskPtr, new: RawTaskPtr) -> bool {
        self.current_thread
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Bind a thread unconditionally (idle fallback, bring-up).
    ///
    /// # Safety
    ///
    /// Same lifetime contract as [`set_current_process`].
    #[inline]
    pub unsafe fn set_current_thread(&self, thread: RawTaskPtr) {
        self.current_thread.store(thread, Ordering::Release);
    }
}

/// Returns `true` iff the record's integrity cookie is intact.
#[inline]
pub fn integrity_ok(cpu: &CpuContext) -> bool {
    cpu.checksum.load(Ordering::Acquire) == CPU_DATA_CHECKSUM
}

// ============================================================================
// The table
// ============================================================================

/// The table itself. Const-initialized: no lazy init, usable from the first
/// instruction of an interrupt handler.
static CPU_TABLE: [CpuContext; MAX_CPU] = {
    const INIT: CpuContext = CpuContext::new();
    [INIT; MAX_CPU]
};

/// Count of CPUs brought online.
static ONLINE_CPU_COUNT: AtomicUsize = AtomicUsize::new(0);

/// LAPIC ID -> CPU index reverse map for O(1) `current()` lookup.
static LAPIC_ID_REVERSE_MAP: [AtomicUsize; LAPIC_ID_REVERSE_MAP_SIZE] = {
    const INIT: AtomicUsize = AtomicUsize::new(INVALID_CPU_ID);
    [INIT; LAPIC_ID_REVERSE_MAP_SIZE]
};

/// Gate for the raw LAPIC MMIO read in [`current_cpu_id`]. Off until the
/// boot path has mapped the LAPIC; off means "CPU 0".
static LAPIC_ID_READ_ENABLED: AtomicBool = AtomicBool::new(false);

/// Identity lookup. Never fails for ids in `[0, MAX_CPU)`.
///
/// # Panics
///
/// Panics on an out-of-range id; callers index with validated ids.
#[inline]
pub fn by_id(id: usize) -> &'static CpuContext {
    assert!(id < MAX_CPU, "CPU ID {} out of range (max {})", id, MAX_CPU);
    &CPU_TABLE[id]
}

/// The calling core's record. No allocation, no suspension, no locks.
///
/// Resolves to CPU 0 until [`enable_lapic_id_read`] has been called, which
/// is correct on the boot processor and in host tests.
#[inline]
pub fn current() -> &'static CpuContext {
    by_id(current_cpu_id())
}

/// The calling core's table index.
#[inline]
pub fn current_cpu_id() -> usize {
    if !LAPIC_ID_READ_ENABLED.load(Ordering::Relaxed) {
        return 0;
    }

    #[cfg(target_arch = "x86_64")]
    {
        // LAPIC ID register (0xFEE00020), bits 31:24.
        let apic_id = unsafe {
            let apic_base = 0xFEE0_0020 as *const u32;
            (core::ptr::read_volatile(apic_base) >> 24) as usize
        };

        let cpu_idx = if apic_id < LAPIC_ID_REVERSE_MAP_SIZE {
            LAPIC_ID_REVERSE_MAP[apic_id].load(Ordering::Relaxed)
        } else {
            INVALID_CPU_ID
        };

        if cpu_idx < MAX_CPU {
            return cpu_idx;
        }
    }

    // Unregistered LAPIC ID: fall back to the boot CPU rather than alias a
    // random slot.
    0
}

/// Register the LAPIC-ID mapping for a CPU. Must be called for each core
/// during bring-up, before that core enters the scheduler.
pub fn register_cpu_id(cpu_id: usize, lapic_id: u32) {
    assert!(cpu_id < MAX_CPU, "CPU ID {} out of range", cpu_id);
    if (lapic_id as usize) < LAPIC_ID_REVERSE_MAP_SIZE {
        LAPIC_ID_REVERSE_MAP[lapic_id as usize].store(cpu_id, Ordering::Relaxed);
    }
}

/// Open the gate for hardware LAPIC-ID reads in [`current_cpu_id`].
///
/// Called once the LAPIC MMIO window is mapped. Until then every core is
/// reported as CPU 0, which is only correct while just the BSP runs.
pub fn enable_lapic_id_read() {
    LAPIC_ID_READ_ENABLED.store(true, Ordering::Release);
}

/// Bring a CPU online: stamp identity, stacks and the integrity cookie,
/// register its LAPIC ID and mark it active.
pub fn activate_cpu(
    cpu_id: usize,
    lapic_id: u32,
    syscall_stack: usize,
    temp_stack: usize,
    kernel_stack: usize,
) {
    let cpu = by_id(cpu_id);
    cpu.init(cpu_id, syscall_stack, temp_stack, kernel_stack);
    register_cpu_id(cpu_id, lapic_id);
    cpu.active.store(true, Ordering::Release);
    ONLINE_CPU_COUNT.fetch_add(1, Ordering::Release);
}

/// Mark every CPU offline and clear its task bindings. Part of the explicit
/// shutdown sequence; the records themselves are static and stay valid.
pub fn teardown() {
    for cpu in CPU_TABLE.iter() {
        cpu.active.store(false, Ordering::Release);
        cpu.current_process.store(null_mut(), Ordering::Release);
        cpu.current_thread.store(null_mut(), Ordering::Release);
    }
    ONLINE_CPU_COUNT.store(0, Ordering::Release);
}

/// Number of CPUs currently online.
#[inline]
pub fn num_online_cpus() -> usize {
    ONLINE_CPU_COUNT.load(Ordering::Acquire)
}

/// Bitmap of online CPUs, bit `i` = CPU `i`. Consumed by affinity checks.
pub fn active_mask() -> u64 {
    let mut mask = 0u64;
    for (i, cpu) in CPU_TABLE.iter().enumerate() {
        if cpu.is_active() {
            mask |= 1u64 << i;
        }
    }
    mask
}
