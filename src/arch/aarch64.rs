//! AArch64 patch encodings.
//!
//! - Absolute and relative link sites are 8-byte literal-pool words; code
//!   reaches them with `LDR (literal)`, so linking never rewrites
//!   instructions, only the literals they load.
//! - Internal calls are `BL imm26`; the whole 4-byte instruction ending at
//!   the return address is rewritten to retarget.
//! - The profiling jump slot is one 4-byte instruction, toggled between
//!   `NOP` and `B imm26`.
//! - Heap bounds checks load their length immediate from a 4-byte literal
//!   word addressed directly by the heap-access record.

use super::{PatchError, patch_u32_checked, patch_u64_checked, read_u32_at, write_u32_at};

/// Width of the reserved profiling jump slot (one instruction).
pub const PROFILING_JUMP_BYTES: usize = 4;

const NOP: u32 = 0xD503_201F;
const B_OPCODE: u32 = 0b000101 << 26;
const BL_OPCODE: u32 = 0b100101 << 26;
const OPCODE_MASK: u32 = 0xFC00_0000;
const IMM26_MASK: u32 = 0x03FF_FFFF;

fn decode_imm26(insn: u32, insn_offset: usize) -> usize {
    // imm26 is a signed word offset from the instruction itself
    let imm = ((insn & IMM26_MASK) << 6) as i32 >> 6;
    (insn_offset as i64 + imm as i64 * 4) as usize
}

fn encode_imm26(insn_offset: usize, target: usize) -> u32 {
    let words = (target as i64 - insn_offset as i64) / 4;
    assert!(
        (target as i64 - insn_offset as i64) % 4 == 0,
        "branch target not instruction-aligned"
    );
    assert!(
        (-(1 << 25)..(1 << 25)).contains(&words),
        "branch displacement out of range: {words}"
    );
    (words as u32) & IMM26_MASK
}

/// Patch an absolute link site (literal word) with a value check.
pub fn patch_absolute(
    code: &mut [u8],
    at: usize,
    value: u64,
    expected: u64,
) -> Result<(), PatchError> {
    patch_u64_checked(code, at, value, expected)
}

/// Patch a relative link site with a value check. Relative links resolve to
/// `base + target` in a literal word, same shape as jump-table entries.
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

/// Decode the target of the BL whose return address is `ret`.
pub fn call_target(code: &[u8], ret: usize) -> Option<usize> {
    if ret < 4 {
        return None;
    }
    let insn = read_u32_at(code, ret - 4);
    if insn & OPCODE_MASK != BL_OPCODE {
        return None;
    }
    Some(decode_imm26(insn, ret - 4))
}

/// Rewrite the BL whose return address is `ret` from `old_target` to
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
    write_u32_at(code, ret - 4, BL_OPCODE | encode_imm26(ret - 4, new_target));
    Ok(())
}

/// True when the profiling jump slot at `at` holds NOP.
pub fn profiling_slot_is_nop(code: &[u8], at: usize) -> bool {
    read_u32_at(code, at) == NOP
}

/// Decode the profiling jump slot at `at` as an unconditional branch, if it
/// is one.
pub fn profiling_jump_target(code: &[u8], at: usize) -> Option<usize> {
    let insn = read_u32_at(code, at);
    if insn & OPCODE_MASK != B_OPCODE {
        return None;
    }
    Some(decode_imm26(insn, at))
}

/// Write NOP into the profiling jump slot.
pub fn write_profiling_nop(code: &mut [u8], at: usize) {
    write_u32_at(code, at, NOP);
}

/// Write `B target` into the profiling jump slot.
pub fn write_profiling_jump(code: &mut [u8], at: usize, target: usize) {
    write_u32_at(code, at, B_OPCODE | encode_imm26(at, target));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bl_roundtrip() {
        let mut code = vec![0u8; 64];
        write_u32_at(&mut code, 8, BL_OPCODE | encode_imm26(8, 32));
        assert_eq!(call_target(&code, 12), Some(32));

        retarget_call(&mut code, 12, 32, 48).unwrap();
        assert_eq!(call_target(&code, 12), Some(48));
        retarget_call(&mut code, 12, 48, 32).unwrap();
        assert_eq!(call_target(&code, 12), Some(32));
    }

    #[test]
    fn test_bl_backward_target() {
        let mut code = vec![0u8; 64];
        write_u32_at(&mut code, 40, BL_OPCODE | encode_imm26(40, 8));
        assert_eq!(call_target(&code, 44), Some(8));
    }

    #[test]
    fn test_retarget_checks_preimage() {
        let mut code = vec![0u8; 32];
        write_u32_at(&mut code, 4, NOP);
        assert!(retarget_call(&mut code, 8, 0, 16).is_err());
    }

    #[test]
    fn test_profiling_slot_toggles() {
        let mut code = vec![0u8; 64];
        write_profiling_nop(&mut code, 16);
        assert!(profiling_slot_is_nop(&code, 16));
        assert_eq!(profiling_jump_target(&code, 16), None);

        write_profiling_jump(&mut code, 16, 4);
        assert_eq!(profiling_jump_target(&code, 16), Some(4));

        write_profiling_nop(&mut code, 16);
        assert!(profiling_slot_is_nop(&code, 16));
    }
}
