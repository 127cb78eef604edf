//! Task state machine and the small enums shared by processes and threads.

use core::sync::atomic::{AtomicU8, Ordering};

/// State of a process or thread.
///
/// Transitions (thread): Ready <-> Running; Ready -> Sleeping (sleep);
/// Sleeping -> Ready (wake/signal); Running -> Blocked (wait);
/// Blocked -> Ready (unblock); any -> Terminated (terminate).
/// Terminated is terminal: the entity is reaped on a later scheduler pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Ready = 1,
    Running = 2,
    Sleeping = 3,
    Blocked = 4,
    Waiting = 5,
    Stopped = 6,
    Zombie = 7,
    Terminated = 8,
}

impl TaskState {
    /// Decode a raw byte. `None` means the byte is out of range, which the
    /// validators treat as an invariant violation.
    pub fn from_u8(raw: u8) -> Option<TaskState> {
        Some(match raw {
            1 => TaskState::Ready,
            2 => TaskState::Running,
            3 => TaskState::Sleeping,
            4 => TaskState::Blocked,
            5 => TaskState::Waiting,
            6 => TaskState::Stopped,
            7 => TaskState::Zombie,
            8 => TaskState::Terminated,
            _ => return None,
        })
    }
}

/// Atomically updatable [`TaskState`] cell with release/acquire ordering.
///
/// The wake path relies on this ordering: `sleep_until` is written before
/// the state becomes `Sleeping` (release), and the wake pass reads the
/// state (acquire) before it reads `sleep_until`, so a wake is never lost.
#[derive(Debug)]
pub struct AtomicTaskState {
    raw: AtomicU8,
}

impl AtomicTaskState {
    pub const fn new(state: TaskState) -> Self {
        AtomicTaskState {
            raw: AtomicU8::new(state as u8),
        }
    }

    /// Current state, or `None` if the cell holds an out-of-range byte.
    #[inline]
    pub fn load(&self) -> Option<TaskState> {
        TaskState::from_u8(self.raw.load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, state: TaskState) {
        self.raw.store(state as u8, Ordering::Release);
    }

    /// `state == expected`, treating a corrupt cell as a mismatch.
    #[inline]
    pub fn is(&self, expected: TaskState) -> bool {
        self.load() == Some(expected)
    }

    /// Transition `from -> to` if and only if the current state is `from`.
    #[inline]
    pub fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.raw
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Privilege domain a task executes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Kernel,
    System,
    User,
}

/// Scheduling priority. The numeric value doubles as the one-shot timer
/// slice programmed when a thread of this priority is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskPriority {
    Idle = 1,
    Low = 2,
    Normal = 5,
    High = 8,
    Critical = 10,
}

impl TaskPriority {
    pub fn from_u8(raw: u8) -> Option<TaskPriority> {
        Some(match raw {
            1 => TaskPriority::Idle,
            2 => TaskPriority::Low,
            5 => TaskPriority::Normal,
            8 => TaskPriority::High,
            10 => TaskPriority::Critical,
            _ => return None,
        })
    }

    /// One-shot timer slice for this priority, in ticks.
    #[inline]
    pub fn time_slice(self) -> u32 {
        self as u32
    }
}

/// Instruction-set architecture a thread was created for. Only the 64-bit
/// little-endian variant is operational.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskArchitecture {
    Unknown,
    X86_64,
}

/// Userspace personality tag carried on threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCompatibility {
    Unknown,
    Native,
    Linux,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            TaskState::Ready,
            TaskState::Running,
            TaskState::Sleeping,
            TaskState::Blocked,
            TaskState::Waiting,
            TaskState::Stopped,
            TaskState::Zombie,
            TaskState::Terminated,
        ] {
            assert_eq!(TaskState::from_u8(state as u8), Some(state));
        }
        assert_eq!(TaskState::from_u8(0), None);
        assert_eq!(TaskState::from_u8(9), None);
    }

    #[test]
    fn test_atomic_transitions() {
        let state = AtomicTaskState::new(TaskState::Ready);
        assert!(state.is(TaskState::Ready));
        assert!(state.transition(TaskState::Ready, TaskState::Running));
        assert!(!state.transition(TaskState::Ready, TaskState::Sleeping));
        assert!(state.is(TaskState::Running));
    }

    #[test]
    fn test_priority_slices() {
        assert_eq!(TaskPriority::Idle.time_slice(), 1);
        assert_eq!(TaskPriority::Normal.time_slice(), 5);
        assert_eq!(TaskPriority::Critical.time_slice(), 10);
        assert_eq!(TaskPriority::from_u8(5), Some(TaskPriority::Normal));
        assert_eq!(TaskPriority::from_u8(3), None);
    }
}
