//! Immutable metadata tables describing a linked module's code.
//!
//! All offset-keyed tables are kept sorted by code offset so stack walkers
//! and the heap binder can binary-search them. Lookups for offsets outside
//! the module return `None`; that is the normal outcome during mixed-mode
//! stack walks, not an error.

use crate::builtins::SymbolicAddress;

/// Symbolic name and source line of a function, for profiling labels and
/// diagnostics. Referenced by index from code ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncName {
    pub text: String,
    pub line: u32,
}

/// An imported or constant global value. Referenced by index, never by
/// pointer, so records survive relocation and clone.
#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub name: String,
    pub kind: GlobalKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GlobalKind {
    Constant(f64),
    Import { field: String },
}

/// An import call stub. `global_data_offset` addresses the 8-byte exit slot
/// holding the trampoline the stub calls through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
    pub import_index: u32,
    pub global_data_offset: u32,
}

/// An exported entry point. `code_offset` is the begin of an entry
/// trampoline code range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub name: String,
    pub code_offset: u32,
}

/// A call instruction inside the module, keyed by its return address, with
/// the stack depth the unwinder needs at that point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub kind: CallSiteKind,
    pub return_offset: u32,
    pub stack_depth: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSiteKind {
    /// A direct call to another function in this module; retargetable by
    /// the profiling toggle.
    Internal,
    /// An indirect call (function-pointer table or import exit); the callee
    /// comes from global data, nothing to retarget in code.
    Indirect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeRangeKind {
    /// A compiled function with entry/profiling sub-offsets.
    Function,
    /// An exported-entry trampoline.
    Entry,
    /// A per-module profiling thunk for an instrumentable builtin.
    Thunk(SymbolicAddress),
    /// The interrupt-check stub.
    Interrupt,
}

/// A `[begin, end)` span of the code buffer.
///
/// For `Function` ranges the sub-offsets satisfy
/// `begin <= profiling_entry <= entry < profiling_jump < profiling_epilogue <= end`;
/// for the other kinds they all collapse onto `begin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeRange {
    pub kind: CodeRangeKind,
    pub begin: u32,
    pub end: u32,
    pub entry: u32,
    pub profiling_entry: u32,
    pub profiling_jump: u32,
    pub profiling_epilogue: u32,
    pub name_index: u32,
    pub line: u32,
}

impl CodeRange {
    pub fn function(
        name_index: u32,
        line: u32,
        begin: u32,
        profiling_entry: u32,
        entry: u32,
        profiling_jump: u32,
        profiling_epilogue: u32,
        end: u32,
    ) -> Self {
        let r = CodeRange {
            kind: CodeRangeKind::Function,
            begin,
            end,
            entry,
            profiling_entry,
            profiling_jump,
            profiling_epilogue,
            name_index,
            line,
        };
        debug_assert!(r.begin <= r.profiling_entry);
        debug_assert!(r.profiling_entry <= r.entry);
        debug_assert!(r.entry < r.profiling_jump);
        debug_assert!(r.profiling_jump < r.profiling_epilogue);
        debug_assert!(r.profiling_epilogue <= r.end);
        r
    }

    pub fn entry_stub(kind: CodeRangeKind, begin: u32, end: u32) -> Self {
        debug_assert!(!matches!(kind, CodeRangeKind::Function));
        CodeRange {
            kind,
            begin,
            end,
            entry: begin,
            profiling_entry: begin,
            profiling_jump: begin,
            profiling_epilogue: begin,
            name_index: 0,
            line: 0,
        }
    }

    pub fn is_function(&self) -> bool {
        matches!(self.kind, CodeRangeKind::Function)
    }

    pub fn contains(&self, offset: u32) -> bool {
        self.begin <= offset && offset < self.end
    }
}

/// A heap access instruction, and (when the access carries a bounds check)
/// where its length immediate lives.
///
/// `base` is the immediate the code generator emitted: the access's own
/// offset/size term, with no heap length added yet. Keeping it in the record
/// lets attach and detach value-check both directions instead of trusting
/// inverse arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapAccess {
    pub insn_offset: u32,
    pub length_check: Option<LengthCheck>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthCheck {
    /// Code offset of the 4-byte length immediate.
    pub imm_offset: u32,
    /// Generator-emitted base value of the immediate.
    pub base: u32,
}

/// An indirect-call table. The slots live in global data at
/// `global_data_offset`; `targets` records the code offset each slot
/// resolves to, so tables can be relinked and profiling-toggled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncPtrTable {
    pub global_data_offset: u32,
    pub targets: Vec<u32>,
}

/// Binary search for the code range containing `offset`.
pub fn lookup_code_range(ranges: &[CodeRange], offset: u32) -> Option<&CodeRange> {
    let idx = ranges
        .binary_search_by(|r| {
            if offset < r.begin {
                std::cmp::Ordering::Greater
            } else if offset >= r.end {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        })
        .ok()?;
    Some(&ranges[idx])
}

/// Binary search for the call site whose return address is `return_offset`.
pub fn lookup_call_site(sites: &[CallSite], return_offset: u32) -> Option<&CallSite> {
    let idx = sites
        .binary_search_by_key(&return_offset, |s| s.return_offset)
        .ok()?;
    Some(&sites[idx])
}

/// Binary search for the heap access at `insn_offset`.
pub fn lookup_heap_access(accesses: &[HeapAccess], insn_offset: u32) -> Option<&HeapAccess> {
    let idx = accesses
        .binary_search_by_key(&insn_offset, |a| a.insn_offset)
        .ok()?;
    Some(&accesses[idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges() -> Vec<CodeRange> {
        vec![
            CodeRange::entry_stub(CodeRangeKind::Entry, 0, 16),
            CodeRange::function(0, 1, 16, 16, 20, 40, 44, 48),
            // gap [48, 64)
            CodeRange::function(1, 9, 64, 64, 68, 88, 92, 96),
        ]
    }

    #[test]
    fn test_lookup_code_range_hits_every_begin() {
        let ranges = ranges();
        for r in &ranges {
            assert_eq!(lookup_code_range(&ranges, r.begin).unwrap().begin, r.begin);
        }
    }

    #[test]
    fn test_lookup_code_range_interior_and_gaps() {
        let ranges = ranges();
        assert_eq!(lookup_code_range(&ranges, 30).unwrap().begin, 16);
        assert_eq!(lookup_code_range(&ranges, 47).unwrap().begin, 16);
        // end is exclusive
        assert!(lookup_code_range(&ranges, 48).is_none());
        assert!(lookup_code_range(&ranges, 55).is_none());
        assert!(lookup_code_range(&ranges, 96).is_none());
        assert_eq!(lookup_code_range(&ranges, 95).unwrap().begin, 64);
    }

    #[test]
    fn test_lookup_call_site_exact_only() {
        let sites = vec![
            CallSite {
                kind: CallSiteKind::Internal,
                return_offset: 24,
                stack_depth: 16,
            },
            CallSite {
                kind: CallSiteKind::Internal,
                return_offset: 72,
                stack_depth: 32,
            },
        ];
        assert_eq!(lookup_call_site(&sites, 24).unwrap().stack_depth, 16);
        assert_eq!(lookup_call_site(&sites, 72).unwrap().stack_depth, 32);
        assert!(lookup_call_site(&sites, 25).is_none());
    }

    #[test]
    fn test_lookup_heap_access() {
        let accesses = vec![
            HeapAccess {
                insn_offset: 40,
                length_check: Some(LengthCheck {
                    imm_offset: 36,
                    base: 8,
                }),
            },
            HeapAccess {
                insn_offset: 80,
                length_check: None,
            },
        ];
        assert!(lookup_heap_access(&accesses, 40).unwrap().length_check.is_some());
        assert!(lookup_heap_access(&accesses, 80).unwrap().length_check.is_none());
        assert!(lookup_heap_access(&accesses, 60).is_none());
    }
}
