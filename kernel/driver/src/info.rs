//! The `.driver.info` module-info record.
//!
//! Every driver image carries a fixed-layout record in a section named
//! `.driver.info`: four string pointers (image-relative until load rebases
//! them) followed by the semantic version and the API version selecting
//! the kernel symbol table.

use alloc::string::String;

/// Section holding the module-info record.
pub const DRIVER_INFO_SECTION: &str = ".driver.info";

/// On-disk size of the record: 4 pointers + 4 u32 fields.
pub const DRIVER_INFO_SIZE: usize = 48;

/// Semantic version of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// The raw record as laid out in the image, pointers unrebased.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawDriverInfo {
    pub name_ptr: u64,
    pub description_ptr: u64,
    pub author_ptr: u64,
    pub license_ptr: u64,
    pub version: DriverVersion,
    pub api_version: u32,
}

impl RawDriverInfo {
    /// Decode the little-endian record from section data.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < DRIVER_INFO_SIZE {
            return None;
        }
        let u64_at = |off: usize| u64::from_le_bytes(bytes[off..off + 8].try_into().ok().unwrap_or([0; 8]));
        let u32_at = |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().ok().unwrap_or([0; 4]));
        Some(RawDriverInfo {
            name_ptr: u64_at(0),
            description_ptr: u64_at(8),
            author_ptr: u64_at(16),
            license_ptr: u64_at(24),
            version: DriverVersion {
                major: u32_at(32),
                minor: u32_at(36),
                patch: u32_at(40),
            },
            api_version: u32_at(44),
        })
    }
}

/// Fully resolved driver metadata.
#[derive(Debug, Clone)]
pub struct DriverInfo {
    pub name: String,
    pub description: String,
    pub author: String,
    pub license: String,
    pub version: DriverVersion,
    pub api_version: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_layout() {
        let mut bytes = [0u8; DRIVER_INFO_SIZE];
        bytes[0..8].copy_from_slice(&0x100u64.to_le_bytes());
        bytes[8..16].copy_from_slice(&0x110u64.to_le_bytes());
        bytes[16..24].copy_from_slice(&0x120u64.to_le_bytes());
        bytes[24..32].copy_from_slice(&0x130u64.to_le_bytes());
        bytes[32..36].copy_from_slice(&1u32.to_le_bytes());
        bytes[36..40].copy_from_slice(&2u32.to_le_bytes());
        bytes[40..44].copy_from_slice(&3u32.to_le_bytes());
        bytes[44..48].copy_from_slice(&7u32.to_le_bytes());

        let raw = RawDriverInfo::parse(&bytes).expect("parse");
        assert_eq!(raw.name_ptr, 0x100);
        assert_eq!(raw.license_ptr, 0x130);
        assert_eq!(raw.version, DriverVersion { major: 1, minor: 2, patch: 3 });
        assert_eq!(raw.api_version, 7);
    }

    #[test]
    fn test_parse_short_record() {
        assert!(RawDriverInfo::parse(&[0u8; 47]).is_none());
    }
}
