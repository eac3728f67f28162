//! In-place rerouting of calls through profiling instrumentation.
//!
//! Five passes, each reversible and each asserting the exact pre-image it
//! overwrites: internal call sites, relative link sites,
//! function-pointer-table slots, the reserved nop/jump slot in every
//! function epilogue, and absolute link sites for instrumentable builtins
//! (redirected through per-module thunks
//! that keep a frame marker so stack walks never lose the innermost module
//! frame). A pre-image mismatch means the patch bookkeeping and the code
//! have diverged; that is fatal in release builds too.

use crate::arch;

use super::link::{resolve_absolute, resolve_relative_target, thunk_offset};
use super::metadata::CallSiteKind;
use super::Module;

impl Module {
    /// Route every call through (or stop routing through) the profiling
    /// stubs. No-op when already in the requested state.
    ///
    /// Caller contract: no thread may hold a live call frame in the module.
    pub fn set_profiling_enabled(&mut self, enable: bool) {
        assert!(self.dynamically_linked, "profiling toggle before dynamic link");
        assert!(!self.interrupted, "profiling toggle during interrupt handling");
        if self.profiling_enabled == enable {
            return;
        }

        let Module {
            ref mut code,
            ref pod,
            ref link_data,
            ref code_ranges,
            ref call_sites,
            ref func_ptr_tables,
            ..
        } = *self;
        let base = code.as_ptr() as u64;

        code.patch(|bytes| {
            // Pass 1: direct intra-module calls.
            for site in call_sites {
                if site.kind != CallSiteKind::Internal {
                    continue;
                }
                let ret = site.return_offset as usize;
                let target = arch::native::call_target(bytes, ret)
                    .unwrap_or_else(|| panic!("no call encoding before return offset {ret:#x}"));
                let range = super::metadata::lookup_code_range(code_ranges, target as u32)
                    .unwrap_or_else(|| panic!("call target {target:#x} outside any code range"));
                if !range.is_function() {
                    continue;
                }
                let (old, new) = if enable {
                    (range.entry, range.profiling_entry)
                } else {
                    (range.profiling_entry, range.entry)
                };
                arch::native::retarget_call(bytes, ret, old as usize, new as usize)
                    .unwrap_or_else(|e| panic!("internal call site diverged: {e}"));
            }

            // Pass 2: relative link sites (switch tables, indirect jumps).
            // These hold resolved entry addresses, so they follow the same
            // entry redirect as everything else; without this, a relink or
            // unlink under the new profiling state would see stale values.
            for link in &link_data.relative_links {
                let old = base
                    + resolve_relative_target(code_ranges, !enable, link.target_offset) as u64;
                let new = base
                    + resolve_relative_target(code_ranges, enable, link.target_offset) as u64;
                if old == new {
                    continue;
                }
                arch::patch_u64_checked(bytes, link.patch_at_offset as usize, new, old)
                    .unwrap_or_else(|e| panic!("relative link site diverged: {e}"));
            }

            // Pass 3: indirect-call table slots in global data.
            for table in func_ptr_tables {
                for (i, &target) in table.targets.iter().enumerate() {
                    let at = (pod.code_bytes + table.global_data_offset) as usize + i * 8;
                    let old = base + resolve_relative_target(code_ranges, !enable, target) as u64;
                    let new = base + resolve_relative_target(code_ranges, enable, target) as u64;
                    arch::patch_u64_checked(bytes, at, new, old)
                        .unwrap_or_else(|e| panic!("function-pointer table slot diverged: {e}"));
                }
            }

            // Pass 4: epilogue nop/jump pairs.
            for range in code_ranges {
                if !range.is_function() {
                    continue;
                }
                let at = range.profiling_jump as usize;
                if enable {
                    assert!(
                        arch::native::profiling_slot_is_nop(bytes, at),
                        "profiling jump slot at {at:#x} is not a nop"
                    );
                    arch::native::write_profiling_jump(
                        bytes,
                        at,
                        range.profiling_epilogue as usize,
                    );
                } else {
                    assert_eq!(
                        arch::native::profiling_jump_target(bytes, at),
                        Some(range.profiling_epilogue as usize),
                        "profiling jump slot at {at:#x} does not jump to the epilogue"
                    );
                    arch::native::write_profiling_nop(bytes, at);
                }
            }

            // Pass 5: instrumentable builtin call sites, via the module's
            // thunks.
            for bucket in &link_data.absolute_links {
                if !bucket.target.is_instrumentable() {
                    continue;
                }
                if thunk_offset(code_ranges, bucket.target).is_none() {
                    continue;
                }
                let old = resolve_absolute(code_ranges, !enable, base, bucket.target);
                let new = resolve_absolute(code_ranges, enable, base, bucket.target);
                for &site in &bucket.patch_sites {
                    arch::patch_u64_checked(bytes, site as usize, new, old)
                        .unwrap_or_else(|e| panic!("builtin call site diverged: {e}"));
                }
            }
        })
        .expect("re-protecting code pages failed");

        self.profiling_enabled = enable;
    }
}
