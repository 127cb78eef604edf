//! Boot parameter parsing.
//!
//! The loader hands the kernel a single space-separated `key=value` string.
//! Recognised keys configure the allocator, core bring-up, interrupt
//! routing, the scheduler, driver/init paths and a few boolean switches.
//! Unknown keys are logged and ignored so an old loader never prevents a
//! newer kernel from booting.

#![no_std]

extern crate alloc;

#[macro_use]
extern crate klog;

use alloc::string::{String, ToString};

/// Heap allocator selection (`alloc=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorType {
    XallocV1,
    Liballoc11,
    Pages,
}

/// Scheduler selection (`tasking=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskingMode {
    /// Preemptive multitasking.
    Multi,
    /// No scheduler; the boot thread keeps the CPU.
    Single,
}

/// Parsed kernel configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Heap allocator to construct.
    pub allocator: AllocatorType,
    /// Cores to bring up (0 = all present).
    pub cores: usize,
    /// CPU id that receives I/O APIC interrupts (0 = boot CPU).
    pub ioapic_irq_core: usize,
    /// Scheduler mode.
    pub tasking: TaskingMode,
    /// Directory to preload drivers from.
    pub driver_directory: String,
    /// Path of the initial user program.
    pub init_path: String,
    /// Auto-break deadlocks after 10 retries (`udl=`).
    pub unlock_deadlock: bool,
    /// Enable interactive keys on crash (`ioc=`).
    pub interrupts_on_crash: bool,
    /// Allow SIMD instruction use (`simd=`).
    pub simd: bool,
    /// Play the boot animation (`bootanim=`).
    pub boot_animation: bool,
    /// Print usage and halt (`help`).
    pub help: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            allocator: AllocatorType::Pages,
            cores: 0,
            ioapic_irq_core: 0,
            tasking: TaskingMode::Multi,
            driver_directory: String::from("/boot/drivers"),
            init_path: String::from("/bin/init"),
            unlock_deadlock: false,
            interrupts_on_crash: false,
            simd: false,
            boot_animation: false,
            help: false,
        }
    }
}

/// Usage text printed for `help`.
pub const USAGE: &str = "\
Usage: kestrel [OPTION]...\n\
  alloc=TYPE       memory allocator (xallocv1, liballoc11, pages)\n\
  cores=N          number of cores to use (0 = all)\n\
  ioapicirq=N      CPU id that receives I/O APIC interrupts\n\
  tasking=MODE     scheduler mode (multi, single)\n\
  drvdir=PATH      directory to preload drivers from\n\
  init=PATH        path to the init program\n\
  udl=BOOL         auto-break deadlocks after 10 retries\n\
  ioc=BOOL         enable interactive keys on crash\n\
  simd=BOOL        allow SIMD instruction use\n\
  bootanim=BOOL    play boot animation\n\
  help             show this text and halt";

/// `true` iff `value` is the literal string `true`; everything else is
/// false, matching the loader contract.
fn parse_bool(value: &str) -> bool {
    value == "true"
}

fn parse_num(value: &str) -> usize {
    value.parse().unwrap_or(0)
}

/// Parse the boot parameter string. Never fails: malformed input degrades
/// to defaults with a log line per offending token.
pub fn parse(cmdline: &str) -> KernelConfig {
    let mut config = KernelConfig::default();

    if cmdline.trim().is_empty() {
        klog_always!("kparam: empty kernel parameters");
        return config;
    }

    klog_always!("kparam: kernel parameters: {}", cmdline);

    for token in cmdline.split_whitespace() {
        let (key, value) = match token.split_once('=') {
            Some((k, v)) => (k, v),
            None => (token, ""),
        };

        match key {
            "alloc" => match value {
                "xallocv1" => config.allocator = AllocatorType::XallocV1,
                "liballoc11" => config.allocator = AllocatorType::Liballoc11,
                "pages" => config.allocator = AllocatorType::Pages,
                other => klog!(Warn, "kparam: unknown allocator: {}", other),
            },
            "cores" => config.cores = parse_num(value),
            "ioapicirq" => config.ioapic_irq_core = parse_num(value),
            "tasking" => match value {
                "multi" => config.tasking = TaskingMode::Multi,
                "single" => config.tasking = TaskingMode::Single,
                other => {
                    klog!(Warn, "kparam: unknown scheduler: {}", other);
                    config.tasking = TaskingMode::Single;
                }
            },
            "drvdir" => config.driver_directory = value.to_string(),
            "init" => config.init_path = value.to_string(),
            "udl" => config.unlock_deadlock = parse_bool(value),
            "ioc" => config.interrupts_on_crash = parse_bool(value),
            "simd" => config.simd = parse_bool(value),
            "bootanim" => config.boot_animation = parse_bool(value),
            "help" => config.help = true,
            unknown => klog!(Warn, "kparam: unknown option: {}", unknown),
        }
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = parse("");
        assert_eq!(config, KernelConfig::default());
        assert_eq!(config.tasking, TaskingMode::Multi);
        assert_eq!(config.driver_directory, "/boot/drivers");
    }

    #[test]
    fn test_full_line() {
        let config = parse(
            "alloc=xallocv1 cores=4 ioapicirq=1 tasking=multi drvdir=/drv \
             init=/sbin/init udl=true ioc=false simd=true bootanim=true",
        );
        assert_eq!(config.allocator, AllocatorType::XallocV1);
        assert_eq!(config.cores, 4);
        assert_eq!(config.ioapic_irq_core, 1);
        assert_eq!(config.tasking, TaskingMode::Multi);
        assert_eq!(config.driver_directory, "/drv");
        assert_eq!(config.init_path, "/sbin/init");
        assert!(config.unlock_deadlock);
        assert!(!config.interrupts_on_crash);
        assert!(config.simd);
        assert!(config.boot_animation);
        assert!(!config.help);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let config = parse("bogus=1 cores=2 alsobogus");
        assert_eq!(config.cores, 2);
        // Everything else untouched.
        assert_eq!(config.tasking, TaskingMode::Multi);
    }

    #[test]
    fn test_unknown_scheduler_falls_back_to_single() {
        let config = parse("tasking=turbo");
        assert_eq!(config.tasking, TaskingMode::Single);
    }

    #[test]
    fn test_bool_is_literal_true_only() {
        assert!(parse("simd=true").simd);
        assert!(!parse("simd=TRUE").simd);
        assert!(!parse("simd=1").simd);
        assert!(!parse("simd=").simd);
    }

    #[test]
    fn test_help_flag() {
        assert!(parse("help").help);
        assert!(parse("cores=2 help").help);
    }

    #[test]
    fn test_malformed_number_degrades_to_zero() {
        assert_eq!(parse("cores=banana").cores, 0);
    }
}
