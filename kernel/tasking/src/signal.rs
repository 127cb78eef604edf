//! Signals.
//!
//! The core queues signals on the target process and applies the default
//! action at the next scheduling decision that selects one of its threads.
//! Handler installation and user-frame delivery belong to the userspace
//! ABI, which is out of scope.

use crate::process::Process;
use crate::state::TaskState;
use alloc::sync::Arc;

/// Highest supported signal number.
const MAX_SIGNAL: u8 = 64;

/// Signal identifier (1-64; 0 is invalid).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal(u8);

impl Signal {
    pub const SIGHUP: Signal = Signal(1);
    pub const SIGINT: Signal = Signal(2);
    pub const SIGQUIT: Signal = Signal(3);
    pub const SIGILL: Signal = Signal(4);
    pub const SIGABRT: Signal = Signal(6);
    pub const SIGKILL: Signal = Signal(9);
    pub const SIGSEGV: Signal = Signal(11);
    pub const SIGTERM: Signal = Signal(15);
    pub const SIGCHLD: Signal = Signal(17);
    pub const SIGCONT: Signal = Signal(18);
    pub const SIGSTOP: Signal = Signal(19);

    pub fn from_raw(raw: i32) -> Result<Self, SignalError> {
        if raw <= 0 || raw > MAX_SIGNAL as i32 {
            return Err(SignalError::InvalidSignal);
        }
        Ok(Signal(raw as u8))
    }

    fn from_index(idx: u8) -> Option<Self> {
        if idx == 0 || idx > MAX_SIGNAL {
            None
        } else {
            Some(Signal(idx))
        }
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self.0
    }

    /// Bit in the pending bitmap.
    #[inline]
    fn bit(self) -> u64 {
        1u64 << (self.0 - 1)
    }

    #[inline]
    pub fn is_stop(self) -> bool {
        self == Signal::SIGSTOP
    }

    #[inline]
    pub fn is_continue(self) -> bool {
        self == Signal::SIGCONT
    }
}

/// Pending-signal bitmap (signals 1-64).
#[derive(Debug, Clone, Copy)]
pub struct PendingSignals {
    bits: u64,
}

impl PendingSignals {
    pub const fn new() -> Self {
        PendingSignals { bits: 0 }
    }

    #[inline]
    pub fn set(&mut self, signal: Signal) {
        self.bits |= signal.bit();
    }

    #[inline]
    pub fn clear(&mut self, signal: Signal) {
        self.bits &= !signal.bit();
    }

    #[inline]
    pub fn is_pending(&self, signal: Signal) -> bool {
        (self.bits & signal.bit()) != 0
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        self.bits != 0
    }

    /// Take the lowest-numbered pending signal.
    pub fn take_next(&mut self) -> Option<Signal> {
        if self.bits == 0 {
            return None;
        }
        let idx = self.bits.trailing_zeros() as u8;
        self.bits &= !(1u64 << idx);
        Signal::from_index(idx + 1)
    }
}

impl Default for PendingSignals {
    fn default() -> Self {
        Self::new()
    }
}

/// Default action of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Ignore,
    Terminate,
    Stop,
    Continue,
}

/// Signal errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalError {
    InvalidSignal,
    /// Target is already dead.
    NoSuchProcess,
}

/// Default action table.
pub fn default_action(signal: Signal) -> SignalAction {
    if signal.is_continue() {
        SignalAction::Continue
    } else if signal.is_stop() {
        SignalAction::Stop
    } else if signal == Signal::SIGCHLD {
        SignalAction::Ignore
    } else {
        SignalAction::Terminate
    }
}

/// Exit code for a signal termination (128 + signal number).
#[inline]
pub fn signal_exit_code(signal: Signal) -> i32 {
    128 + signal.as_u8() as i32
}

/// Queue a signal on `process`. The action runs at the next scheduling
/// decision that selects one of its threads, with two liveness
/// exceptions handled here:
///
/// - a terminating signal wakes the target's sleeping threads and clears
///   its stop flag, since a fully dormant or stopped process would never
///   reach the delivery point;
/// - a continuing signal is applied immediately (stopped processes are
///   never selected, so it could not be delivered there), and is cleared
///   from the pending set.
pub fn send(process: &Arc<Process>, signal: Signal) -> Result<(), SignalError> {
    match process.state.load() {
        Some(TaskState::Zombie) | Some(TaskState::Terminated) | None => {
            return Err(SignalError::NoSuchProcess)
        }
        _ => {}
    }
    process.signals.lock().set(signal);

    match default_action(signal) {
        SignalAction::Terminate => {
            for thread in process.threads.lock().iter() {
                if thread.state.transition(TaskState::Sleeping, TaskState::Ready)
                    || thread.state.transition(TaskState::Stopped, TaskState::Ready)
                {
                    thread
                        .sleep_until
                        .store(0, core::sync::atomic::Ordering::Release);
                }
            }
            let _ = process.state.transition(TaskState::Sleeping, TaskState::Ready);
            let _ = process.state.transition(TaskState::Stopped, TaskState::Ready);
            process.set_stopped(false);
        }
        SignalAction::Continue => {
            continue_process(process);
            process.signals.lock().clear(signal);
        }
        SignalAction::Stop | SignalAction::Ignore => {}
    }

    klog!(
        Debug,
        "signal: queued {} for process {} ({})",
        signal_name(signal),
        process.id,
        process.name()
    );
    Ok(())
}

/// Resume a stopped process: clear the job-control flag and lift any
/// legacy `Stopped` states. Sleeping threads are deliberately left alone;
/// their deadlines keep counting and the wake pass picks them up.
fn continue_process(process: &Arc<Process>) {
    process.set_stopped(false);
    for thread in process.threads.lock().iter() {
        let _ = thread.state.transition(TaskState::Stopped, TaskState::Ready);
    }
    let _ = process.state.transition(TaskState::Stopped, TaskState::Ready);
}

/// Apply the default actions of every pending signal on `process`.
///
/// Called by the scheduler when selection lands on a thread of this
/// process, with the process list already locked. Returns `true` if the
/// process is still runnable afterwards.
pub(crate) fn deliver_pending(process: &Arc<Process>, list: &[Arc<Process>]) -> bool {
    loop {
        let next = { process.signals.lock().take_next() };
        let signal = match next {
            Some(s) => s,
            None => break,
        };

        match default_action(signal) {
            SignalAction::Ignore => {}
            SignalAction::Terminate => {
                klog!(
                    Info,
                    "signal: {} terminates process {} ({})",
                    signal_name(signal),
                    process.id,
                    process.name()
                );
                crate::terminate_process_in(list, process, signal_exit_code(signal));
                return false;
            }
            SignalAction::Stop => {
                // Job-control stop is orthogonal to the scheduler state:
                // only the flag is set, so a sleeping sibling keeps its
                // wait condition and its deadline keeps being checked.
                // Overwriting thread or process states here would lose
                // those wakeups.
                process.set_stopped(true);
                return false;
            }
            SignalAction::Continue => {
                // Normally applied at send time; this is the backstop for
                // a SIGCONT that was queued by other means.
                continue_process(process);
            }
        }
    }
    true
}

/// Human-readable signal name for logs.
pub fn signal_name(signal: Signal) -> &'static str {
    match signal.as_u8() {
        1 => "SIGHUP",
        2 => "SIGINT",
        3 => "SIGQUIT",
        4 => "SIGILL",
        6 => "SIGABRT",
        9 => "SIGKILL",
        11 => "SIGSEGV",
        15 => "SIGTERM",
        17 => "SIGCHLD",
        18 => "SIGCONT",
        19 => "SIGSTOP",
        _ => "SIG?",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_queue_order() {
        let mut pending = PendingSignals::new();
        pending.set(Signal::SIGTERM);
        pending.set(Signal::SIGHUP);
        assert!(pending.has_pending());
        // Lowest numbered first.
        assert_eq!(pending.take_next(), Some(Signal::SIGHUP));
        assert_eq!(pending.take_next(), Some(Signal::SIGTERM));
        assert_eq!(pending.take_next(), None);
    }

    #[test]
    fn test_default_actions() {
        assert_eq!(default_action(Signal::SIGKILL), SignalAction::Terminate);
        assert_eq!(default_action(Signal::SIGSTOP), SignalAction::Stop);
        assert_eq!(default_action(Signal::SIGCONT), SignalAction::Continue);
        assert_eq!(default_action(Signal::SIGCHLD), SignalAction::Ignore);
        assert_eq!(signal_exit_code(Signal::SIGKILL), 137);
    }

    #[test]
    fn test_raw_range() {
        assert!(Signal::from_raw(0).is_err());
        assert!(Signal::from_raw(65).is_err());
        assert_eq!(Signal::from_raw(9).unwrap(), Signal::SIGKILL);
    }
}
