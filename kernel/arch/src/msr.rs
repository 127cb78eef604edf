//! FS/GS segment-base MSR accessors.
//!
//! The scheduler saves these three registers when a thread is descheduled
//! and restores them when it is resumed: user code may have changed the
//! bases with `wrfsbase`/`wrgsbase`, so the in-memory copy is stale until
//! read back from the MSRs.
//!
//! Software mirrors back the hardware before the gate opens, so the save/
//! restore round-trip stays observable in host tests.

use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::registers::model_specific::Msr;

const MSR_FS_BASE: u32 = 0xC000_0100;
const MSR_GS_BASE: u32 = 0xC000_0101;
const MSR_SHADOW_GS_BASE: u32 = 0xC000_0102;

static FS_BASE_MIRROR: AtomicU64 = AtomicU64::new(0);
static GS_BASE_MIRROR: AtomicU64 = AtomicU64::new(0);
static SHADOW_GS_BASE_MIRROR: AtomicU64 = AtomicU64::new(0);

macro_rules! msr_accessor {
    ($read:ident, $write:ident, $msr:ident, $mirror:ident) => {
        #[inline]
        pub fn $read() -> u64 {
            if crate::hw_active() {
                unsafe { Msr::new($msr).read() }
            } else {
                $mirror.load(Ordering::Relaxed)
            }
        }

        #[inline]
        pub fn $write(value: u64) {
            if crate::hw_active() {
                unsafe { Msr::new($msr).write(value) };
            } else {
                $mirror.store(value, Ordering::Relaxed);
            }
        }
    };
}

msr_accessor!(read_fs_base, write_fs_base, MSR_FS_BASE, FS_BASE_MIRROR);
msr_accessor!(read_gs_base, write_gs_base, MSR_GS_BASE, GS_BASE_MIRROR);
msr_accessor!(
    read_shadow_gs_base,
    write_shadow_gs_base,
    MSR_SHADOW_GS_BASE,
    SHADOW_GS_BASE_MIRROR
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mirror_round_trip() {
        write_fs_base(0xdead_0000);
        write_gs_base(0xbeef_0000);
        write_shadow_gs_base(0xfeed_0000);
        assert_eq!(read_fs_base(), 0xdead_0000);
        assert_eq!(read_gs_base(), 0xbeef_0000);
        assert_eq!(read_shadow_gs_base(), 0xfeed_0000);
    }
}
