//! Architecture-specific patch encodings.
//!
//! The linker never writes instruction bytes directly; it goes through this
//! module so each target keeps its encoding details in one place. Both
//! backends are compiled everywhere (they are pure byte manipulation) and
//! `native` aliases the one matching the build target.
//!
//! Every mutation takes the value the site is expected to currently hold and
//! fails when the bytes disagree. A mismatch means the patch bookkeeping and
//! the code have diverged, which callers treat either as cache corruption
//! (link paths) or as a fatal invariant break (profiling toggles).

pub mod aarch64;
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use x86_64 as native;

#[cfg(target_arch = "aarch64")]
pub use aarch64 as native;

/// A value-checked patch found unexpected bytes at the patch site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchError {
    pub at: usize,
    pub expected: u64,
    pub found: u64,
}

impl std::fmt::Display for PatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "patch site at offset {:#x} holds {:#x}, expected {:#x}",
            self.at, self.found, self.expected
        )
    }
}

impl std::error::Error for PatchError {}

// Sentinel values installed at patch sites when a module is in its initial
// (unlinked) state. The low bits carry the symbolic-address id or target
// offset so restored code stays self-describing; the high bits make the
// values implausible as real addresses.
const ABSOLUTE_SENTINEL_BASE: u64 = 0xA07A_B500_0000_0000;
const RELATIVE_SENTINEL_BASE: u64 = 0xA07A_4E10_0000_0000;

/// Sentinel an absolute patch site holds before linking, keyed by the
/// symbolic-address id it will resolve to.
pub fn absolute_sentinel(id: u32) -> u64 {
    ABSOLUTE_SENTINEL_BASE | id as u64
}

/// Sentinel a relative patch site holds before linking, keyed by the code
/// offset it will resolve to.
pub fn relative_sentinel(target_offset: u32) -> u64 {
    RELATIVE_SENTINEL_BASE | target_offset as u64
}

pub fn read_u32_at(code: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(code[at..at + 4].try_into().unwrap())
}

pub fn write_u32_at(code: &mut [u8], at: usize, value: u32) {
    code[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn read_u64_at(code: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(code[at..at + 8].try_into().unwrap())
}

pub fn write_u64_at(code: &mut [u8], at: usize, value: u64) {
    code[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

/// Overwrite the 8-byte word at `at` with `value`, insisting the site
/// currently holds `expected`.
pub fn patch_u64_checked(
    code: &mut [u8],
    at: usize,
    value: u64,
    expected: u64,
) -> Result<(), PatchError> {
    let found = read_u64_at(code, at);
    if found != expected {
        return Err(PatchError {
            at,
            expected,
            found,
        });
    }
    write_u64_at(code, at, value);
    Ok(())
}

/// Overwrite the 4-byte word at `at` with `value`, insisting the site
/// currently holds `expected`.
pub fn patch_u32_checked(
    code: &mut [u8],
    at: usize,
    value: u32,
    expected: u32,
) -> Result<(), PatchError> {
    let found = read_u32_at(code, at);
    if found != expected {
        return Err(PatchError {
            at,
            expected: expected as u64,
            found: found as u64,
        });
    }
    write_u32_at(code, at, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels_carry_their_key() {
        assert_eq!(absolute_sentinel(3) & 0xFFFF_FFFF, 3);
        assert_eq!(relative_sentinel(0x1234) & 0xFFFF_FFFF, 0x1234);
        assert_ne!(absolute_sentinel(3), relative_sentinel(3));
    }

    #[test]
    fn test_patch_u64_checked_rejects_mismatch() {
        let mut code = vec![0u8; 16];
        write_u64_at(&mut code, 0, 0xDEAD);
        assert!(patch_u64_checked(&mut code, 0, 0xBEEF, 0xDEAD).is_ok());
        assert_eq!(read_u64_at(&code, 0), 0xBEEF);

        let err = patch_u64_checked(&mut code, 0, 0x1, 0xDEAD).unwrap_err();
        assert_eq!(err.found, 0xBEEF);
        assert_eq!(err.expected, 0xDEAD);
        // Failed patch must not write
        assert_eq!(read_u64_at(&code, 0), 0xBEEF);
    }
}
