//! Allocator version detection.
//!
//! The main-arena layout differs between glibc versions: 2.26 inserted
//! `have_fastchunks` ahead of the fastbin array, shifting every later field
//! by one word, and 2.30 widened the tcache counts from one byte to two.
//! Everything downstream keys off the two offsets derived here.

use core::ffi::CStr;

pub const VERSION_LEN: usize = 32;

/// What the behavioural tcache probe concluded.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TcacheHint {
    /// No thread cache observed.
    Absent,
    /// A thread cache exists but its address is unknown.
    Present,
    /// A thread cache exists at this address (leaked via the entry key).
    PresentAt(*mut u8),
}

/// Version-derived layout parameters, plus the probed tcache state.
#[derive(Clone, Copy)]
pub struct LibcInfo {
    pub valid: bool,
    pub major: u32,
    pub minor: u32,
    pub raw_version: [u8; VERSION_LEN],
    pub raw_len: usize,
    /// Byte offset from the arena base to the first small-bin sentinel.
    pub offset_sb0_to_main_arena: usize,
    /// Extra displacement of every arena field from 2.26 onward.
    pub offset_adjust_references: usize,
    pub tcache: TcacheHint,
}

impl LibcInfo {
    pub const INVALID: LibcInfo = LibcInfo {
        valid: false,
        major: 0,
        minor: 0,
        raw_version: [0; VERSION_LEN],
        raw_len: 0,
        offset_sb0_to_main_arena: 0,
        offset_adjust_references: 0,
        tcache: TcacheHint::Absent,
    };

    /// The tcache count field switched to u16 in 2.30.
    pub fn wide_tcache_counts(&self) -> bool {
        (self.major, self.minor) >= (2, 30)
    }

    pub fn version_str(&self) -> &str {
        core::str::from_utf8(&self.raw_version[..self.raw_len]).unwrap_or("?")
    }
}

/// Layout parameters for a known version range.
pub struct VersionParams {
    pub offset_adjust_references: usize,
    /// Whether the version may carry a tcache worth probing for.
    pub probe_tcache: bool,
    /// Whether the word after a freed tcache entry's `next` link is a key
    /// pointing back at the tcache structure.
    pub key_is_tcache_ptr: bool,
}

/// The version table. `None` marks an unknown version: the probe is then
/// invalid and the arena-dependent checks run in degraded (disabled) mode.
pub fn version_params(major: u32, minor: u32) -> Option<VersionParams> {
    match (major, minor) {
        (2, 24..=25) => Some(VersionParams {
            offset_adjust_references: 0,
            probe_tcache: false,
            key_is_tcache_ptr: false,
        }),
        (2, 26..=27) => Some(VersionParams {
            offset_adjust_references: 0x8,
            probe_tcache: true,
            key_is_tcache_ptr: false,
        }),
        (2, 28..=30) => Some(VersionParams {
            offset_adjust_references: 0x8,
            probe_tcache: true,
            key_is_tcache_ptr: true,
        }),
        _ => None,
    }
}

/// Offset of the first small-bin sentinel from the arena base: 0x68 up to
/// 2.25, 0x70 once `have_fastchunks` pushed the bin array down a word.
pub fn offset_sb0(adjust: usize) -> usize {
    0x68 + adjust
}

/// Parse "major.minor" out of a version string, ignoring any suffix.
pub fn parse_version(bytes: &[u8]) -> Option<(u32, u32)> {
    let mut parts = bytes.splitn(2, |&b| b == b'.');
    let major = parse_number(parts.next()?)?;
    let rest = parts.next()?;
    let minor_end = rest.iter().position(|b| !b.is_ascii_digit()).unwrap_or(rest.len());
    let minor = parse_number(&rest[..minor_end])?;
    Some((major, minor))
}

fn parse_number(digits: &[u8]) -> Option<u32> {
    if digits.is_empty() || !digits.iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut n: u32 = 0;
    for &b in digits {
        n = n.checked_mul(10)?.checked_add((b - b'0') as u32)?;
    }
    Some(n)
}

/// Read the running allocator's version string.
///
/// # Safety
/// Calls into libc; the returned slice borrows libc's static buffer.
pub unsafe fn running_version() -> &'static [u8] {
    CStr::from_ptr(libc::gnu_get_libc_version()).to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_suffixed_versions() {
        assert_eq!(parse_version(b"2.27"), Some((2, 27)));
        assert_eq!(parse_version(b"2.31-0ubuntu9"), Some((2, 31)));
        assert_eq!(parse_version(b"2.9"), Some((2, 9)));
        assert_eq!(parse_version(b"garbage"), None);
        assert_eq!(parse_version(b"2."), None);
    }

    #[test]
    fn version_table_offsets() {
        let p = version_params(2, 24).unwrap();
        assert_eq!(p.offset_adjust_references, 0);
        assert!(!p.probe_tcache);
        assert_eq!(offset_sb0(p.offset_adjust_references), 0x68);

        let p = version_params(2, 27).unwrap();
        assert_eq!(p.offset_adjust_references, 8);
        assert!(p.probe_tcache);
        assert!(!p.key_is_tcache_ptr);

        let p = version_params(2, 29).unwrap();
        assert!(p.key_is_tcache_ptr);
        assert_eq!(offset_sb0(p.offset_adjust_references), 0x70);
    }

    #[test]
    fn unknown_versions_fail_closed() {
        assert!(version_params(2, 23).is_none());
        assert!(version_params(2, 31).is_none());
        assert!(version_params(2, 39).is_none());
        assert!(version_params(3, 0).is_none());
    }

    #[test]
    fn count_width_flips_at_2_30() {
        let mut info = LibcInfo::INVALID;
        info.major = 2;
        info.minor = 29;
        assert!(!info.wide_tcache_counts());
        info.minor = 30;
        assert!(info.wide_tcache_counts());
    }

    #[test]
    fn running_version_is_parseable() {
        // Whatever glibc hosts the test suite must at least parse.
        let ver = unsafe { running_version() };
        assert!(parse_version(ver).is_some(), "unparseable glibc version {:?}", ver);
    }
}
