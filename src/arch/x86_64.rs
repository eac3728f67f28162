//! x86-64 patch encodings.
//!
//! - Absolute and relative link sites are 8-byte little-endian words (the
//!   imm64 of a `mov r64, imm64` or a jump-table entry).
//! - Internal calls are `E8 rel32`; the relocated field is the 4 bytes
//!   ending at the return address.
//! - The profiling jump slot is 2 bytes, toggled between a 2-byte NOP
//!   (`66 90`) and a short jump (`EB disp8`).
//! - Heap bounds checks carry their length immediate as the imm32 field of
//!   a `cmp r32, imm32`, addressed directly by the heap-access record.

use super::{PatchError, patch_u32_checked, patch_u64_checked, read_u32_at, write_u32_at};

/// Width of the reserved profiling jump slot at each function's
/// profiling-jump offset.
pub const PROFILING_JUMP_BYTES: usize = 2;

const OP_CALL_REL32: u8 = 0xE8;
const OP_JMP_REL8: u8 = 0xEB;
const NOP2: [u8; 2] = [0x66, 0x90];

/// Patch an absolute link site (imm64) with a value check.
pub fn patch_absolute(
    code: &mut [u8],
    at: usize,
    value: u64,
    expected: u64,
) -> Result<(), PatchError> {
    patch_u64_checked(code, at, value, expected)
}

/// Patch a relative link site with a value check. On x86-64 relative links
/// are pointer-sized jump-table entries, so the resolved form is just
/// `base + target`.
pub fn patch_relative(
    code: &mut [u8],
    at: usize,
    base: u64,
    target_offset: u32,
    expected: u64,
) -> Result<(), PatchError> {
    patch_u64_checked(code, at, base + target_offset as u64, expected)
}

/// Read the length immediate of a bounds check.
pub fn read_bounds_immediate(code: &[u8], at: usize) -> u32 {
    read_u32_at(code, at)
}

/// Patch the length immediate of a bounds check with a value check.
pub fn patch_bounds_immediate(
    code: &mut [u8],
    at: usize,
    value: u32,
    expected: u32,
) -> Result<(), PatchError> {
    patch_u32_checked(code, at, value, expected)
}

/// Decode the target of the CALL whose return address is `ret`.
/// Returns `None` when the bytes before `ret` are not a `E8 rel32` call.
pub fn call_target(code: &[u8], ret: usize) -> Option<usize> {
    if ret < 5 || code[ret - 5] != OP_CALL_REL32 {
        return None;
    }
    let rel = read_u32_at(code, ret - 4) as i32;
    Some((ret as i64 + rel as i64) as usize)
}

/// Rewrite the CALL whose return address is `ret` from `old_target` to
/// `new_target`, checking the current encoding first.
pub fn retarget_call(
    code: &mut [u8],
    ret: usize,
    old_target: usize,
    new_target: usize,
) -> Result<(), PatchError> {
    match call_target(code, ret) {
        Some(t) if t == old_target => {}
        other => {
            return Err(PatchError {
                at: ret - 4,
                expected: old_target as u64,
                found: other.unwrap_or(0) as u64,
            });
        }
    }
    let rel = new_target as i64 - ret as i64;
    assert!(
        i32::try_from(rel).is_ok(),
        "call displacement out of range: {rel}"
    );
    write_u32_at(code, ret - 4, rel as u32);
    Ok(())
}

/// True when the profiling jump slot at `at` holds the NOP encoding.
pub fn profiling_slot_is_nop(code: &[u8], at: usize) -> bool {
    code[at..at + 2] == NOP2
}

/// Decode the profiling jump slot at `at` as a short jump, if it is one.
pub fn profiling_jump_target(code: &[u8], at: usize) -> Option<usize> {
    if code[at] != OP_JMP_REL8 {
        return None;
    }
    let disp = code[at + 1] as i8;
    Some((at as i64 + 2 + disp as i64) as usize)
}

/// Write the NOP encoding into the profiling jump slot.
pub fn write_profiling_nop(code: &mut [u8], at: usize) {
    code[at..at + 2].copy_from_slice(&NOP2);
}

/// Write a short jump to `target` into the profiling jump slot. The
/// epilogue must be within short-jump range of the slot; the code generator
/// lays functions out that way.
pub fn write_profiling_jump(code: &mut [u8], at: usize, target: usize) {
    let disp = target as i64 - (at as i64 + 2);
    assert!(
        (-128..=127).contains(&disp),
        "profiling epilogue out of short-jump range: {disp}"
    );
    code[at] = OP_JMP_REL8;
    code[at + 1] = disp as i8 as u8;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_roundtrip() {
        let mut code = vec![0x90u8; 64];
        // call site: E8 rel32 at offset 10, return address 15
        code[10] = OP_CALL_REL32;
        let rel: i32 = 40 - 15;
        code[11..15].copy_from_slice(&rel.to_le_bytes());

        assert_eq!(call_target(&code, 15), Some(40));
        retarget_call(&mut code, 15, 40, 48).unwrap();
        assert_eq!(call_target(&code, 15), Some(48));
        retarget_call(&mut code, 15, 48, 40).unwrap();
        assert_eq!(call_target(&code, 15), Some(40));
    }

    #[test]
    fn test_retarget_call_checks_preimage() {
        let mut code = vec![0x90u8; 32];
        code[4] = OP_CALL_REL32;
        code[5..9].copy_from_slice(&7i32.to_le_bytes());
        assert!(retarget_call(&mut code, 9, 99, 20).is_err());
    }

    #[test]
    fn test_backward_call_target() {
        let mut code = vec![0x90u8; 64];
        code[40] = OP_CALL_REL32;
        let rel: i32 = 8 - 45;
        code[41..45].copy_from_slice(&rel.to_le_bytes());
        assert_eq!(call_target(&code, 45), Some(8));
    }

    #[test]
    fn test_profiling_slot_toggles() {
        let mut code = vec![0u8; 32];
        write_profiling_nop(&mut code, 10);
        assert!(profiling_slot_is_nop(&code, 10));
        assert_eq!(profiling_jump_target(&code, 10), None);

        write_profiling_jump(&mut code, 10, 20);
        assert!(!profiling_slot_is_nop(&code, 10));
        assert_eq!(profiling_jump_target(&code, 10), Some(20));

        write_profiling_nop(&mut code, 10);
        assert!(profiling_slot_is_nop(&code, 10));
    }

    #[test]
    fn test_profiling_jump_backward() {
        let mut code = vec![0u8; 64];
        write_profiling_jump(&mut code, 30, 4);
        assert_eq!(profiling_jump_target(&code, 30), Some(4));
    }
}
