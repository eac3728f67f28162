//! Static linking: resolving the retained link records against the code
//! buffer.
//!
//! Link records are kept for the module's whole life, so linking is a
//! repeatable transformation: `static_link` resolves every site from its
//! sentinel (or re-checks it against its own resolved value when already
//! linked), and `unlink` reverses every patch back to the sentinel state so
//! a cloned buffer can be relinked against its own base address.

use std::sync::Arc;

use crate::arch;
use crate::builtins::SymbolicAddress;
use crate::memory::ExecutableMemory;

use super::heap::HeapBuffer;
use super::metadata::{self, CodeRange, CodeRangeKind, LengthCheck};
use super::{LinkError, Module};

/// A patch site that must hold the address of another location in the same
/// module's code (switch tables, indirect jumps).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelativeLink {
    pub patch_at_offset: u32,
    pub target_offset: u32,
}

/// All patch sites resolving to one runtime helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbsoluteLink {
    pub target: SymbolicAddress,
    pub patch_sites: Vec<u32>,
}

/// The unresolved link records. Retained after linking so the module can be
/// relinked after clone or cache reload without regenerating code.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinkData {
    pub relative_links: Vec<RelativeLink>,
    pub absolute_links: Vec<AbsoluteLink>,
    pub interrupt_exit_offset: u32,
}

/// Where a code-relative link target resolves, honoring the profiling
/// redirect: a target at a function's normal entry goes to the profiling
/// entry while profiling is enabled.
pub(crate) fn resolve_relative_target(
    ranges: &[CodeRange],
    profiling: bool,
    target_offset: u32,
) -> u32 {
    if !profiling {
        return target_offset;
    }
    match metadata::lookup_code_range(ranges, target_offset) {
        Some(r) if r.is_function() && r.entry == target_offset => r.profiling_entry,
        _ => target_offset,
    }
}

/// Begin offset of this module's profiling thunk for `sym`, if the code
/// generator emitted one.
pub(crate) fn thunk_offset(ranges: &[CodeRange], sym: SymbolicAddress) -> Option<u32> {
    ranges
        .iter()
        .find(|r| r.kind == CodeRangeKind::Thunk(sym))
        .map(|r| r.begin)
}

/// Address an absolute link resolves to: the raw helper, or the module's
/// profiling thunk for instrumentable helpers while profiling is enabled.
pub(crate) fn resolve_absolute(
    ranges: &[CodeRange],
    profiling: bool,
    base: u64,
    sym: SymbolicAddress,
) -> u64 {
    if profiling && sym.is_instrumentable() {
        if let Some(thunk) = thunk_offset(ranges, sym) {
            return base + thunk as u64;
        }
    }
    sym.address()
}

impl Module {
    /// Resolve every link record in place. Postcondition: the module is
    /// callable for all exported entry points (once dynamically linked).
    ///
    /// Idempotent: when the module is already linked, every patch is
    /// value-checked against its own resolved value and rewritten
    /// unchanged. Not destructive of the link records, so it can be re-run
    /// after `clone_module` or a cache reload.
    pub fn static_link(&mut self) -> Result<(), LinkError> {
        let Module {
            ref mut code,
            ref pod,
            ref link_data,
            ref code_ranges,
            ref exits,
            ref func_ptr_tables,
            profiling_enabled,
            statically_linked: already,
            ..
        } = *self;
        let base = code.as_ptr() as u64;

        code.patch(|bytes| -> Result<(), LinkError> {
            for link in &link_data.relative_links {
                let resolved = resolve_relative_target(code_ranges, profiling_enabled, link.target_offset);
                let expected = if already {
                    base + resolved as u64
                } else {
                    arch::relative_sentinel(link.target_offset)
                };
                arch::native::patch_relative(bytes, link.patch_at_offset as usize, base, resolved, expected)
                    .map_err(|_| LinkError::CorruptCache("relative link site"))?;
            }

            for bucket in &link_data.absolute_links {
                let value = resolve_absolute(code_ranges, profiling_enabled, base, bucket.target);
                let expected = if already {
                    value
                } else {
                    arch::absolute_sentinel(bucket.target as u32)
                };
                for &site in &bucket.patch_sites {
                    arch::native::patch_absolute(bytes, site as usize, value, expected)
                        .map_err(|_| LinkError::CorruptCache("absolute link site"))?;
                }
            }

            // Every import exit calls out through the generic interpreter
            // trampoline until the embedder installs something faster.
            let interp = SymbolicAddress::InvokeFromInterpreter.address();
            for exit in exits {
                let at = (pod.code_bytes + exit.global_data_offset) as usize;
                arch::write_u64_at(bytes, at, interp);
            }

            for table in func_ptr_tables {
                for (i, &target) in table.targets.iter().enumerate() {
                    let at = (pod.code_bytes + table.global_data_offset) as usize + i * 8;
                    let resolved = resolve_relative_target(code_ranges, profiling_enabled, target);
                    arch::write_u64_at(bytes, at, base + resolved as u64);
                }
            }

            Ok(())
        })??;

        self.statically_linked = true;
        Ok(())
    }

    /// Reverse every absolute/relative/heap patch back to the sentinel
    /// state. `prior_base`/`prior_heap` describe the buffer the bytes were
    /// copied from, since the copied pointers still refer to it.
    fn unlink(
        &mut self,
        prior_base: u64,
        prior_heap: Option<(u64, u32)>,
    ) -> Result<(), LinkError> {
        let Module {
            ref mut code,
            ref pod,
            ref link_data,
            ref code_ranges,
            ref exits,
            ref func_ptr_tables,
            ref heap_accesses,
            profiling_enabled,
            statically_linked,
            ..
        } = *self;
        assert!(statically_linked, "unlink of unlinked module");

        code.patch(|bytes| -> Result<(), LinkError> {
            for link in &link_data.relative_links {
                let resolved = resolve_relative_target(code_ranges, profiling_enabled, link.target_offset);
                arch::patch_u64_checked(
                    bytes,
                    link.patch_at_offset as usize,
                    arch::relative_sentinel(link.target_offset),
                    prior_base + resolved as u64,
                )
                .map_err(|_| LinkError::CorruptCache("relative link site"))?;
            }

            for bucket in &link_data.absolute_links {
                let value = resolve_absolute(code_ranges, profiling_enabled, prior_base, bucket.target);
                for &site in &bucket.patch_sites {
                    arch::patch_u64_checked(
                        bytes,
                        site as usize,
                        arch::absolute_sentinel(bucket.target as u32),
                        value,
                    )
                    .map_err(|_| LinkError::CorruptCache("absolute link site"))?;
                }
            }

            for exit in exits {
                let at = (pod.code_bytes + exit.global_data_offset) as usize;
                arch::write_u64_at(bytes, at, 0);
            }
            for table in func_ptr_tables {
                for i in 0..table.targets.len() {
                    let at = (pod.code_bytes + table.global_data_offset) as usize + i * 8;
                    arch::write_u64_at(bytes, at, 0);
                }
            }
            arch::write_u64_at(bytes, pod.code_bytes as usize, 0);

            if let Some((_, heap_len)) = prior_heap {
                for access in heap_accesses {
                    if let Some(LengthCheck { imm_offset, base }) = access.length_check {
                        arch::native::patch_bounds_immediate(
                            bytes,
                            imm_offset as usize,
                            base,
                            base + heap_len,
                        )
                        .map_err(|_| LinkError::CorruptCache("bounds immediate"))?;
                    }
                }
            }

            Ok(())
        })??;

        self.statically_linked = false;
        Ok(())
    }

    /// Produce an independent copy of this module by copy-then-relink:
    /// verbatim byte copy, deep-copied metadata and link records, reversal
    /// of every patch, then a fresh `static_link` against the new base.
    /// This keeps the clone self-consistent whatever heap or profiling
    /// state the source is in.
    ///
    /// The clone carries the source's profiling byte state but starts with
    /// no heap attached and not dynamically linked.
    pub fn clone_module(&self) -> Result<Module, LinkError> {
        let total = self.pod.code_bytes as usize + self.pod.global_data_bytes as usize;
        let mut mem = ExecutableMemory::new(total)?;
        mem.write(0, self.code.as_slice())?;
        mem.seal()?;

        let mut out = Module {
            code: mem,
            pod: self.pod,
            names: self.names.clone(),
            globals: self.globals.clone(),
            exits: self.exits.clone(),
            exports: self.exports.clone(),
            call_sites: self.call_sites.clone(),
            code_ranges: self.code_ranges.clone(),
            func_ptr_tables: self.func_ptr_tables.clone(),
            heap_accesses: self.heap_accesses.clone(),
            link_data: self.link_data.clone(),
            statically_linked: self.statically_linked,
            dynamically_linked: false,
            loaded_from_cache: false,
            profiling_enabled: self.profiling_enabled,
            interrupted: false,
            heap: None,
        };

        if out.statically_linked {
            let prior_heap = self
                .heap
                .as_ref()
                .map(|h: &Arc<HeapBuffer>| (h.base() as u64, h.len() as u32));
            out.unlink(self.code.as_ptr() as u64, prior_heap)?;
        }
        out.static_link()?;
        Ok(out)
    }
}
