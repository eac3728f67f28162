//! The linked module: an executable code buffer plus the metadata, link
//! records, and lifecycle state needed to patch it in place.
//!
//! A module is built by the code generator through `ModuleBuilder`
//! (function-by-function code append plus metadata records), frozen by
//! `finish()`, made callable by `static_link()` + `dynamic_link()`, and from
//! then on mutated only through the heap binder and the profiling toggle.
//! The unresolved link records are retained for the module's whole life so
//! a clone or a cache reload can be relinked without regenerating code.

pub mod cache;
pub mod heap;
pub mod link;
pub mod metadata;
pub mod profiling;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::arch;
use crate::builtins::SymbolicAddress;
use crate::memory::{ExecutableMemory, MemoryError};
use heap::HeapBuffer;
use link::{AbsoluteLink, LinkData, RelativeLink};
use metadata::{
    CallSite, CallSiteKind, CodeRange, Exit, Export, FuncName, FuncPtrTable, Global, HeapAccess,
    LengthCheck,
};

/// Size of the heap-pointer cell at the start of global data.
pub(crate) const HEAP_CELL_BYTES: u32 = 8;

/// Signature of an exported entry trampoline: takes the marshalled argument
/// array, returns nonzero on success.
pub type EntryFn = unsafe extern "C" fn(*mut u64) -> i32;

/// Errors reported to the caller. Precondition violations (detach with no
/// heap attached, profiling toggle mid-interrupt, diverged patch pre-images
/// during a toggle) are asserts, not variants: they are programmer errors or
/// invariant breaks, never recoverable outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// Executable allocation failed; nothing was retained.
    OutOfMemory,
    /// Page-protection change failed.
    Protection,
    /// A value-checked patch site or table terminator did not contain the
    /// expected bytes. Discard the cache entry and recompile.
    CorruptCache(&'static str),
    /// Machine fingerprint, source text, or format version mismatch. Fall
    /// back to full compilation.
    CacheMiss(&'static str),
    /// Serialized data ended early.
    UnexpectedEof,
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::OutOfMemory => write!(f, "executable memory allocation failed"),
            LinkError::Protection => write!(f, "memory protection change failed"),
            LinkError::CorruptCache(what) => write!(f, "corrupt cache entry: {}", what),
            LinkError::CacheMiss(what) => write!(f, "cache miss: {}", what),
            LinkError::UnexpectedEof => write!(f, "unexpected end of cache data"),
        }
    }
}

impl std::error::Error for LinkError {}

impl From<MemoryError> for LinkError {
    fn from(e: MemoryError) -> Self {
        match e {
            MemoryError::AllocationFailed | MemoryError::InvalidSize => LinkError::OutOfMemory,
            MemoryError::ProtectionFailed => LinkError::Protection,
        }
    }
}

/// Plain-old-data module header, copied verbatim on clone and serialized
/// field-for-field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModulePod {
    pub code_bytes: u32,
    pub global_data_bytes: u32,
    pub strict: bool,
    pub uses_signal_handlers: bool,
    pub min_heap_length: u32,
    pub max_heap_length: u32,
}

/// A fully built module. See the module docs for the lifecycle.
pub struct Module {
    pub(crate) code: ExecutableMemory,
    pub(crate) pod: ModulePod,
    pub(crate) names: Vec<FuncName>,
    pub(crate) globals: Vec<Global>,
    pub(crate) exits: Vec<Exit>,
    pub(crate) exports: Vec<Export>,
    pub(crate) call_sites: Vec<CallSite>,
    pub(crate) code_ranges: Vec<CodeRange>,
    pub(crate) func_ptr_tables: Vec<FuncPtrTable>,
    pub(crate) heap_accesses: Vec<HeapAccess>,
    pub(crate) link_data: LinkData,
    pub(crate) statically_linked: bool,
    pub(crate) dynamically_linked: bool,
    pub(crate) loaded_from_cache: bool,
    pub(crate) profiling_enabled: bool,
    pub(crate) interrupted: bool,
    pub(crate) heap: Option<Arc<HeapBuffer>>,
}

impl Module {
    pub fn pod(&self) -> &ModulePod {
        &self.pod
    }

    /// Total allocation size: code + global data, rounded to a page
    /// multiple by the allocator.
    pub fn total_bytes(&self) -> usize {
        self.code.size()
    }

    pub fn code_base(&self) -> *const u8 {
        self.code.as_ptr()
    }

    pub fn code_bytes(&self) -> u32 {
        self.pod.code_bytes
    }

    /// The code segment as bytes (global data excluded).
    pub fn code(&self) -> &[u8] {
        &self.code.as_slice()[..self.pod.code_bytes as usize]
    }

    pub fn names(&self) -> &[FuncName] {
        &self.names
    }

    pub fn globals(&self) -> &[Global] {
        &self.globals
    }

    pub fn exits(&self) -> &[Exit] {
        &self.exits
    }

    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    pub fn call_sites(&self) -> &[CallSite] {
        &self.call_sites
    }

    pub fn code_ranges(&self) -> &[CodeRange] {
        &self.code_ranges
    }

    pub fn func_ptr_tables(&self) -> &[FuncPtrTable] {
        &self.func_ptr_tables
    }

    pub fn heap_accesses(&self) -> &[HeapAccess] {
        &self.heap_accesses
    }

    pub fn link_data(&self) -> &LinkData {
        &self.link_data
    }

    pub fn is_statically_linked(&self) -> bool {
        self.statically_linked
    }

    pub fn is_dynamically_linked(&self) -> bool {
        self.dynamically_linked
    }

    pub fn is_loaded_from_cache(&self) -> bool {
        self.loaded_from_cache
    }

    pub fn is_profiling_enabled(&self) -> bool {
        self.profiling_enabled
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    /// Mark the module dynamically linked: the embedder has validated its
    /// imports and the module may now have a heap attached, be called, and
    /// have profiling toggled.
    pub fn dynamic_link(&mut self) {
        assert!(self.statically_linked, "dynamic link before static link");
        self.dynamically_linked = true;
    }

    /// Interrupt-handler bookkeeping. Read-checked by the patching
    /// operations; never itself patches code.
    pub fn set_interrupted(&mut self, interrupted: bool) {
        assert_ne!(self.interrupted, interrupted, "re-entrant interrupt flag");
        self.interrupted = interrupted;
    }

    pub fn attached_heap(&self) -> Option<&Arc<HeapBuffer>> {
        self.heap.as_ref()
    }

    /// True when `pc` points into this module's code segment.
    pub fn contains_code_pc(&self, pc: *const u8) -> bool {
        let base = self.code.as_ptr() as usize;
        let pc = pc as usize;
        pc >= base && pc < base + self.pod.code_bytes as usize
    }

    fn code_offset_of(&self, pc: *const u8) -> Option<u32> {
        if !self.contains_code_pc(pc) {
            return None;
        }
        Some((pc as usize - self.code.as_ptr() as usize) as u32)
    }

    /// Code range containing `pc`, or `None` for out-of-module pcs.
    pub fn lookup_code_range(&self, pc: *const u8) -> Option<&CodeRange> {
        metadata::lookup_code_range(&self.code_ranges, self.code_offset_of(pc)?)
    }

    /// Call site whose return address is `pc`, or `None`.
    pub fn lookup_call_site(&self, pc: *const u8) -> Option<&CallSite> {
        metadata::lookup_call_site(&self.call_sites, self.code_offset_of(pc)?)
    }

    /// Heap access at `pc`, or `None`.
    pub fn lookup_heap_access(&self, pc: *const u8) -> Option<&HeapAccess> {
        metadata::lookup_heap_access(&self.heap_accesses, self.code_offset_of(pc)?)
    }

    /// Address of the interrupt-check stub. Valid once statically linked.
    pub fn interrupt_exit(&self) -> *const u8 {
        assert!(self.statically_linked);
        unsafe {
            self.code
                .as_ptr()
                .add(self.link_data.interrupt_exit_offset as usize)
        }
    }

    /// Entry trampoline of export `index`.
    ///
    /// # Safety
    /// The module must be dynamically linked and the trampoline's machine
    /// code must match `EntryFn`'s calling convention.
    pub unsafe fn export_entry(&self, index: usize) -> Option<EntryFn> {
        let export = self.exports.get(index)?;
        unsafe { self.code.as_fn(export.code_offset as usize) }
    }

    /// Offset of the heap-pointer cell within the allocation.
    pub(crate) fn heap_cell_at(&self) -> usize {
        self.pod.code_bytes as usize
    }

    /// Offset of a global-data slot within the allocation.
    pub(crate) fn global_data_at(&self, global_data_offset: u32) -> usize {
        debug_assert!(global_data_offset + 8 <= self.pod.global_data_bytes);
        (self.pod.code_bytes + global_data_offset) as usize
    }
}

/// The code-generator boundary: collects raw code and metadata, then
/// `finish()` freezes everything into a `Module`.
///
/// Global data is laid out incrementally as exits and function-pointer
/// tables are declared: the heap cell first, then one 8-byte slot per exit,
/// then the table slots, so generated code can bake the offsets in.
pub struct ModuleBuilder {
    strict: bool,
    uses_signal_handlers: bool,
    min_heap_length: u32,
    max_heap_length: u32,
    code: Vec<u8>,
    names: Vec<FuncName>,
    globals: Vec<Global>,
    exits: Vec<Exit>,
    exports: Vec<Export>,
    call_sites: Vec<CallSite>,
    code_ranges: Vec<CodeRange>,
    func_ptr_tables: Vec<FuncPtrTable>,
    heap_accesses: Vec<HeapAccess>,
    relative_links: Vec<RelativeLink>,
    absolute_links: BTreeMap<SymbolicAddress, Vec<u32>>,
    interrupt_exit_offset: u32,
    global_data_bytes: u32,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        ModuleBuilder {
            strict: false,
            uses_signal_handlers: false,
            min_heap_length: 0,
            max_heap_length: u32::MAX,
            code: Vec::new(),
            names: Vec::new(),
            globals: Vec::new(),
            exits: Vec::new(),
            exports: Vec::new(),
            call_sites: Vec::new(),
            code_ranges: Vec::new(),
            func_ptr_tables: Vec::new(),
            heap_accesses: Vec::new(),
            relative_links: Vec::new(),
            absolute_links: BTreeMap::new(),
            interrupt_exit_offset: 0,
            global_data_bytes: HEAP_CELL_BYTES,
        }
    }

    pub fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    pub fn set_uses_signal_handlers(&mut self, uses: bool) {
        self.uses_signal_handlers = uses;
    }

    pub fn set_heap_limits(&mut self, min: u32, max: u32) {
        assert!(min <= max);
        self.min_heap_length = min;
        self.max_heap_length = max;
    }

    /// Append generated code bytes; returns the offset they start at.
    pub fn append_code(&mut self, bytes: &[u8]) -> u32 {
        let offset = self.code.len() as u32;
        self.code.extend_from_slice(bytes);
        offset
    }

    /// Pad the code to `alignment` with zero bytes.
    pub fn align_code(&mut self, alignment: usize) -> u32 {
        let aligned = (self.code.len() + alignment - 1) & !(alignment - 1);
        self.code.resize(aligned, 0);
        self.code.len() as u32
    }

    pub fn current_offset(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn add_func_name(&mut self, text: impl Into<String>, line: u32) -> u32 {
        self.names.push(FuncName {
            text: text.into(),
            line,
        });
        (self.names.len() - 1) as u32
    }

    pub fn add_global(&mut self, global: Global) -> u32 {
        self.globals.push(global);
        (self.globals.len() - 1) as u32
    }

    /// Declare an import exit; returns the global-data offset of its 8-byte
    /// trampoline slot.
    pub fn declare_exit(&mut self, import_index: u32) -> u32 {
        let offset = self.global_data_bytes;
        self.global_data_bytes += 8;
        self.exits.push(Exit {
            import_index,
            global_data_offset: offset,
        });
        offset
    }

    pub fn add_export(&mut self, name: impl Into<String>, code_offset: u32) {
        self.exports.push(Export {
            name: name.into(),
            code_offset,
        });
    }

    pub fn add_call_site(&mut self, site: CallSite) {
        self.call_sites.push(site);
    }

    pub fn add_code_range(&mut self, range: CodeRange) {
        self.code_ranges.push(range);
    }

    pub fn add_heap_access(&mut self, access: HeapAccess) {
        self.heap_accesses.push(access);
    }

    /// Declare an indirect-call table; returns the global-data offset of its
    /// first slot.
    pub fn add_func_ptr_table(&mut self, targets: Vec<u32>) -> u32 {
        let offset = self.global_data_bytes;
        self.global_data_bytes += 8 * targets.len() as u32;
        self.func_ptr_tables.push(FuncPtrTable {
            global_data_offset: offset,
            targets,
        });
        offset
    }

    /// Record a patch site at `patch_at_offset` that must come to hold the
    /// address of `target_offset` within this module's code.
    pub fn add_relative_link(&mut self, patch_at_offset: u32, target_offset: u32) {
        self.relative_links.push(RelativeLink {
            patch_at_offset,
            target_offset,
        });
    }

    /// Record a patch site that must come to hold the address of the named
    /// runtime helper.
    pub fn add_absolute_link(&mut self, target: SymbolicAddress, patch_at_offset: u32) {
        self.absolute_links.entry(target).or_default().push(patch_at_offset);
    }

    pub fn set_interrupt_exit(&mut self, code_offset: u32) {
        self.interrupt_exit_offset = code_offset;
    }

    /// Freeze the module: allocate executable memory, copy the code in,
    /// install patch-site sentinels and generator-base bounds immediates,
    /// sort the metadata tables, and seal the pages read/execute.
    ///
    /// Fails with `OutOfMemory` when the executable allocation fails; no
    /// partial allocation is retained.
    pub fn finish(mut self) -> Result<Module, LinkError> {
        assert!(self.code.len() <= u32::MAX as usize, "code too large");
        let code_bytes = self.code.len() as u32;

        for link in &self.relative_links {
            assert!(link.patch_at_offset + 8 <= code_bytes, "relative link out of code");
            assert!(link.target_offset <= code_bytes);
        }
        for sites in self.absolute_links.values() {
            for &site in sites {
                assert!(site + 8 <= code_bytes, "absolute link out of code");
            }
        }

        let total = code_bytes as usize + self.global_data_bytes as usize;
        let mut mem = ExecutableMemory::new(total)?;
        mem.write(0, &self.code)?;

        // Install the unlinked-state byte patterns the value-checked
        // patches key off.
        mem.patch(|bytes| {
            for link in &self.relative_links {
                arch::write_u64_at(
                    bytes,
                    link.patch_at_offset as usize,
                    arch::relative_sentinel(link.target_offset),
                );
            }
            for (&target, sites) in &self.absolute_links {
                for &site in sites {
                    arch::write_u64_at(bytes, site as usize, arch::absolute_sentinel(target as u32));
                }
            }
            for access in &self.heap_accesses {
                if let Some(LengthCheck { imm_offset, base }) = access.length_check {
                    arch::write_u32_at(bytes, imm_offset as usize, base);
                }
            }
        })?;
        mem.seal()?;

        self.call_sites.sort_by_key(|s| s.return_offset);
        self.code_ranges.sort_by_key(|r| r.begin);
        self.heap_accesses.sort_by_key(|a| a.insn_offset);
        for pair in self.code_ranges.windows(2) {
            debug_assert!(pair[0].end <= pair[1].begin, "overlapping code ranges");
        }

        let absolute_links = self
            .absolute_links
            .into_iter()
            .map(|(target, patch_sites)| AbsoluteLink {
                target,
                patch_sites,
            })
            .collect();

        Ok(Module {
            code: mem,
            pod: ModulePod {
                code_bytes,
                global_data_bytes: self.global_data_bytes,
                strict: self.strict,
                uses_signal_handlers: self.uses_signal_handlers,
                min_heap_length: self.min_heap_length,
                max_heap_length: self.max_heap_length,
            },
            names: self.names,
            globals: self.globals,
            exits: self.exits,
            exports: self.exports,
            call_sites: self.call_sites,
            code_ranges: self.code_ranges,
            func_ptr_tables: self.func_ptr_tables,
            heap_accesses: self.heap_accesses,
            link_data: LinkData {
                relative_links: self.relative_links,
                absolute_links,
                interrupt_exit_offset: self.interrupt_exit_offset,
            },
            statically_linked: false,
            dynamically_linked: false,
            loaded_from_cache: false,
            profiling_enabled: false,
            interrupted: false,
            heap: None,
        })
    }
}

impl Default for ModuleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::page_size;

    #[test]
    fn test_finish_page_aligns_total() {
        let mut b = ModuleBuilder::new();
        b.append_code(&[0u8; 100]);
        let m = b.finish().unwrap();
        assert_eq!(m.total_bytes() % page_size(), 0);
        assert_eq!(m.code_bytes(), 100);
        assert!(!m.is_statically_linked());
        assert!(!m.is_loaded_from_cache());
    }

    #[test]
    fn test_global_data_layout() {
        let mut b = ModuleBuilder::new();
        b.append_code(&[0u8; 64]);
        let exit0 = b.declare_exit(0);
        let exit1 = b.declare_exit(1);
        let table = b.add_func_ptr_table(vec![0, 16]);
        assert_eq!(exit0, HEAP_CELL_BYTES);
        assert_eq!(exit1, HEAP_CELL_BYTES + 8);
        assert_eq!(table, HEAP_CELL_BYTES + 16);

        let m = b.finish().unwrap();
        assert_eq!(m.pod().global_data_bytes, HEAP_CELL_BYTES + 16 + 16);
    }

    #[test]
    fn test_finish_installs_sentinels() {
        let mut b = ModuleBuilder::new();
        b.append_code(&[0u8; 64]);
        b.add_relative_link(8, 32);
        b.add_absolute_link(SymbolicAddress::SinD, 24);
        let m = b.finish().unwrap();

        let bytes = m.code.as_slice();
        assert_eq!(arch::read_u64_at(bytes, 8), arch::relative_sentinel(32));
        assert_eq!(
            arch::read_u64_at(bytes, 24),
            arch::absolute_sentinel(SymbolicAddress::SinD as u32)
        );
    }

    #[test]
    fn test_tables_sorted_after_finish() {
        let mut b = ModuleBuilder::new();
        b.append_code(&[0u8; 128]);
        b.add_call_site(CallSite {
            kind: CallSiteKind::Internal,
            return_offset: 90,
            stack_depth: 8,
        });
        b.add_call_site(CallSite {
            kind: CallSiteKind::Internal,
            return_offset: 20,
            stack_depth: 0,
        });
        let m = b.finish().unwrap();
        assert_eq!(m.call_sites()[0].return_offset, 20);
        assert_eq!(m.call_sites()[1].return_offset, 90);
    }

    #[test]
    fn test_pc_lookup_outside_module_is_none() {
        let mut b = ModuleBuilder::new();
        b.append_code(&[0u8; 64]);
        let m = b.finish().unwrap();
        let outside = [0u8; 8];
        assert!(m.lookup_code_range(outside.as_ptr()).is_none());
        assert!(!m.contains_code_pc(outside.as_ptr()));
        assert!(m.contains_code_pc(m.code_base()));
    }
}
