//! Module serialization for the persistent compilation cache.
//!
//! Binary format (little-endian throughout):
//! - Magic: "AOTL" (4 bytes)
//! - Version: u32
//! - Machine fingerprint: cpu-feature word + build-id byte vector
//! - Originating source text (exact bytes)
//! - Pod header
//! - Raw code bytes (code only; global data is re-derived at link time)
//! - Metadata vectors: names, globals, exits, exports, call sites,
//!   code ranges, function-pointer tables, heap accesses
//! - Link data (relative links, absolute buckets, interrupt exit)
//! - End marker
//!
//! Vectors are a u32 length followed by that many elements; strings are
//! `u32 (length << 1 | is_latin1)` followed by raw character bytes (zero
//! means absent). Only a pristine module (never statically linked) may be
//! serialized: the sentinel patch-site bytes are position-independent,
//! resolved addresses are not.
//!
//! A fingerprint or source mismatch is a cache miss, never a partial load.

use std::io::{self, Read, Write};

use crate::builtins::SymbolicAddress;
use crate::memory::ExecutableMemory;

use super::link::{AbsoluteLink, LinkData, RelativeLink};
use super::metadata::{
    CallSite, CallSiteKind, CodeRange, CodeRangeKind, Exit, Export, FuncName, FuncPtrTable,
    Global, GlobalKind, HeapAccess, LengthCheck,
};
use super::{LinkError, Module, ModulePod};

/// Magic bytes for serialized modules.
pub const MAGIC: &[u8; 4] = b"AOTL";

/// Current cache format version.
pub const VERSION: u32 = 1;

const END_MARKER: u32 = 0x4C4E4B45;

// Defensive cap so a corrupt length prefix cannot drive a huge allocation.
const MAX_VEC_LEN: u32 = 1 << 24;

// Same idea for the pod's segment sizes, which drive the executable
// mapping. No real module comes anywhere near 256 MiB of code.
const MAX_SEGMENT_BYTES: u32 = 1 << 28;

/// Machine identity baked into every cache entry. Serialized code is only
/// trusted on the exact CPU-feature set and build that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineId {
    pub cpu_features: u32,
    pub build_id: Vec<u8>,
}

impl MachineId {
    pub fn current() -> Self {
        MachineId {
            cpu_features: cpu_feature_word(),
            build_id: env!("CARGO_PKG_VERSION").as_bytes().to_vec(),
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn cpu_feature_word() -> u32 {
    let mut word = 1;
    if std::arch::is_x86_feature_detected!("ssse3") {
        word |= 1 << 1;
    }
    if std::arch::is_x86_feature_detected!("sse4.1") {
        word |= 1 << 2;
    }
    if std::arch::is_x86_feature_detected!("avx") {
        word |= 1 << 3;
    }
    if std::arch::is_x86_feature_detected!("avx2") {
        word |= 1 << 4;
    }
    if std::arch::is_x86_feature_detected!("fma") {
        word |= 1 << 5;
    }
    word
}

#[cfg(target_arch = "aarch64")]
fn cpu_feature_word() -> u32 {
    let mut word = 1 << 16;
    if std::arch::is_aarch64_feature_detected!("neon") {
        word |= 1 << 17;
    }
    if std::arch::is_aarch64_feature_detected!("lse") {
        word |= 1 << 18;
    }
    word
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn cpu_feature_word() -> u32 {
    0
}

/// Serialize a pristine module together with the source text that produced
/// it.
pub fn serialize_module(module: &Module, source: &[u8]) -> Vec<u8> {
    assert!(
        !module.statically_linked && !module.profiling_enabled && !module.interrupted,
        "only a pristine module may be serialized"
    );

    let mut buf = Vec::new();
    write_module(&mut buf, module, source).expect("writing to Vec cannot fail");
    buf
}

/// Deserialize a cache entry, validating the machine fingerprint and the
/// exact source text, and statically link the result. Sets
/// `loaded_from_cache`.
pub fn deserialize_module(data: &[u8], source: &[u8]) -> Result<Module, LinkError> {
    let mut cursor = io::Cursor::new(data);
    let mut module = read_module(&mut cursor, source)?;
    module.loaded_from_cache = true;
    module.static_link()?;
    Ok(module)
}

fn write_module<W: Write>(w: &mut W, module: &Module, source: &[u8]) -> io::Result<()> {
    w.write_all(MAGIC)?;
    write_u32(w, VERSION)?;

    let machine = MachineId::current();
    write_u32(w, machine.cpu_features)?;
    write_bytes(w, &machine.build_id)?;
    write_bytes(w, source)?;

    write_pod(w, &module.pod)?;
    w.write_all(&module.code.as_slice()[..module.pod.code_bytes as usize])?;

    write_vec(w, &module.names, write_func_name)?;
    write_vec(w, &module.globals, write_global)?;
    write_vec(w, &module.exits, write_exit)?;
    write_vec(w, &module.exports, write_export)?;
    write_vec(w, &module.call_sites, write_call_site)?;
    write_vec(w, &module.code_ranges, write_code_range)?;
    write_vec(w, &module.func_ptr_tables, write_func_ptr_table)?;
    write_vec(w, &module.heap_accesses, write_heap_access)?;

    write_vec(w, &module.link_data.relative_links, write_relative_link)?;
    write_vec(w, &module.link_data.absolute_links, write_absolute_link)?;
    write_u32(w, module.link_data.interrupt_exit_offset)?;

    write_u32(w, END_MARKER)
}

fn read_module<R: Read>(r: &mut R, source: &[u8]) -> Result<Module, LinkError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)
        .map_err(|_| LinkError::UnexpectedEof)?;
    if &magic != MAGIC {
        return Err(LinkError::CorruptCache("bad magic"));
    }

    let version = read_u32(r)?;
    if version != VERSION {
        return Err(LinkError::CacheMiss("format version"));
    }

    let machine = MachineId {
        cpu_features: read_u32(r)?,
        build_id: read_bytes(r)?,
    };
    if machine != MachineId::current() {
        return Err(LinkError::CacheMiss("machine fingerprint"));
    }

    let stored_source = read_bytes(r)?;
    if stored_source != source {
        return Err(LinkError::CacheMiss("source text"));
    }

    let pod = read_pod(r)?;
    if pod.code_bytes > MAX_SEGMENT_BYTES || pod.global_data_bytes > MAX_SEGMENT_BYTES {
        return Err(LinkError::CorruptCache("segment size"));
    }
    let mut code = vec![0u8; pod.code_bytes as usize];
    r.read_exact(&mut code)
        .map_err(|_| LinkError::UnexpectedEof)?;

    let names = read_vec(r, read_func_name)?;
    let globals = read_vec(r, read_global)?;
    let exits = read_vec(r, read_exit)?;
    let exports = read_vec(r, read_export)?;
    let call_sites = read_vec(r, read_call_site)?;
    let code_ranges = read_vec(r, read_code_range)?;
    let func_ptr_tables = read_vec(r, read_func_ptr_table)?;
    let heap_accesses = read_vec(r, read_heap_access)?;

    let relative_links = read_vec(r, read_relative_link)?;
    let absolute_links = read_vec(r, read_absolute_link)?;
    let interrupt_exit_offset = read_u32(r)?;

    if read_u32(r)? != END_MARKER {
        return Err(LinkError::CorruptCache("end marker"));
    }

    let link_data = LinkData {
        relative_links,
        absolute_links,
        interrupt_exit_offset,
    };
    check_offsets(
        &pod,
        &exits,
        &exports,
        &call_sites,
        &code_ranges,
        &func_ptr_tables,
        &heap_accesses,
        &link_data,
    )?;

    let total = pod.code_bytes as usize + pod.global_data_bytes as usize;
    let mut mem = ExecutableMemory::new(total)?;
    mem.write(0, &code)?;
    mem.seal()?;

    Ok(Module {
        code: mem,
        pod,
        names,
        globals,
        exits,
        exports,
        call_sites,
        code_ranges,
        func_ptr_tables,
        heap_accesses,
        link_data,
        statically_linked: false,
        dynamically_linked: false,
        loaded_from_cache: false,
        profiling_enabled: false,
        interrupted: false,
        heap: None,
    })
}

/// Reject any deserialized offset that a later patch would dereference
/// outside the segments the pod declares. The link path indexes code and
/// global data with these values, so trusting a corrupt entry here would
/// turn into an out-of-bounds access instead of a recoverable error.
#[allow(clippy::too_many_arguments)]
fn check_offsets(
    pod: &ModulePod,
    exits: &[Exit],
    exports: &[Export],
    call_sites: &[CallSite],
    code_ranges: &[CodeRange],
    func_ptr_tables: &[FuncPtrTable],
    heap_accesses: &[HeapAccess],
    link_data: &LinkData,
) -> Result<(), LinkError> {
    let code_bytes = pod.code_bytes as u64;
    let global_data_bytes = pod.global_data_bytes as u64;

    for link in &link_data.relative_links {
        if link.patch_at_offset as u64 + 8 > code_bytes || link.target_offset as u64 > code_bytes {
            return Err(LinkError::CorruptCache("relative link offset"));
        }
    }
    for bucket in &link_data.absolute_links {
        for &site in &bucket.patch_sites {
            if site as u64 + 8 > code_bytes {
                return Err(LinkError::CorruptCache("absolute link offset"));
            }
        }
    }
    if link_data.interrupt_exit_offset as u64 > code_bytes {
        return Err(LinkError::CorruptCache("interrupt exit offset"));
    }

    for access in heap_accesses {
        if access.insn_offset as u64 > code_bytes {
            return Err(LinkError::CorruptCache("heap access offset"));
        }
        if let Some(LengthCheck { imm_offset, .. }) = access.length_check {
            if imm_offset as u64 + 4 > code_bytes {
                return Err(LinkError::CorruptCache("heap access offset"));
            }
        }
    }

    for range in code_ranges {
        let within = |offset: u32| range.contains(offset) || offset == range.end;
        if range.begin > range.end || range.end as u64 > code_bytes {
            return Err(LinkError::CorruptCache("code range bounds"));
        }
        if !within(range.entry)
            || !within(range.profiling_entry)
            || !within(range.profiling_jump)
            || !within(range.profiling_epilogue)
        {
            return Err(LinkError::CorruptCache("code range bounds"));
        }
    }
    for site in call_sites {
        if site.return_offset as u64 > code_bytes {
            return Err(LinkError::CorruptCache("call site offset"));
        }
    }
    for export in exports {
        if export.code_offset as u64 > code_bytes {
            return Err(LinkError::CorruptCache("export offset"));
        }
    }

    for exit in exits {
        if exit.global_data_offset as u64 + 8 > global_data_bytes {
            return Err(LinkError::CorruptCache("global data offset"));
        }
    }
    for table in func_ptr_tables {
        let end = table.global_data_offset as u64 + 8 * table.targets.len() as u64;
        if end > global_data_bytes {
            return Err(LinkError::CorruptCache("global data offset"));
        }
        for &target in &table.targets {
            if target as u64 > code_bytes {
                return Err(LinkError::CorruptCache("relative link offset"));
            }
        }
    }

    Ok(())
}

// ==================== element codecs ====================

fn write_pod<W: Write>(w: &mut W, pod: &ModulePod) -> io::Result<()> {
    write_u32(w, pod.code_bytes)?;
    write_u32(w, pod.global_data_bytes)?;
    write_u8(w, pod.strict as u8)?;
    write_u8(w, pod.uses_signal_handlers as u8)?;
    write_u32(w, pod.min_heap_length)?;
    write_u32(w, pod.max_heap_length)
}

fn read_pod<R: Read>(r: &mut R) -> Result<ModulePod, LinkError> {
    Ok(ModulePod {
        code_bytes: read_u32(r)?,
        global_data_bytes: read_u32(r)?,
        strict: read_u8(r)? != 0,
        uses_signal_handlers: read_u8(r)? != 0,
        min_heap_length: read_u32(r)?,
        max_heap_length: read_u32(r)?,
    })
}

fn write_func_name<W: Write>(w: &mut W, name: &FuncName) -> io::Result<()> {
    write_name(w, &name.text)?;
    write_u32(w, name.line)
}

fn read_func_name<R: Read>(r: &mut R) -> Result<FuncName, LinkError> {
    Ok(FuncName {
        text: read_name(r)?,
        line: read_u32(r)?,
    })
}

fn write_global<W: Write>(w: &mut W, global: &Global) -> io::Result<()> {
    write_name(w, &global.name)?;
    match &global.kind {
        GlobalKind::Constant(v) => {
            write_u8(w, 0)?;
            w.write_all(&v.to_bits().to_le_bytes())
        }
        GlobalKind::Import { field } => {
            write_u8(w, 1)?;
            write_name(w, field)
        }
    }
}

fn read_global<R: Read>(r: &mut R) -> Result<Global, LinkError> {
    let name = read_name(r)?;
    let kind = match read_u8(r)? {
        0 => {
            let mut bits = [0u8; 8];
            r.read_exact(&mut bits).map_err(|_| LinkError::UnexpectedEof)?;
            GlobalKind::Constant(f64::from_bits(u64::from_le_bytes(bits)))
        }
        1 => GlobalKind::Import {
            field: read_name(r)?,
        },
        _ => return Err(LinkError::CorruptCache("global kind")),
    };
    Ok(Global { name, kind })
}

fn write_exit<W: Write>(w: &mut W, exit: &Exit) -> io::Result<()> {
    write_u32(w, exit.import_index)?;
    write_u32(w, exit.global_data_offset)
}

fn read_exit<R: Read>(r: &mut R) -> Result<Exit, LinkError> {
    Ok(Exit {
        import_index: read_u32(r)?,
        global_data_offset: read_u32(r)?,
    })
}

fn write_export<W: Write>(w: &mut W, export: &Export) -> io::Result<()> {
    write_name(w, &export.name)?;
    write_u32(w, export.code_offset)
}

fn read_export<R: Read>(r: &mut R) -> Result<Export, LinkError> {
    Ok(Export {
        name: read_name(r)?,
        code_offset: read_u32(r)?,
    })
}

fn write_call_site<W: Write>(w: &mut W, site: &CallSite) -> io::Result<()> {
    write_u8(
        w,
        match site.kind {
            CallSiteKind::Internal => 0,
            CallSiteKind::Indirect => 1,
        },
    )?;
    write_u32(w, site.return_offset)?;
    write_u32(w, site.stack_depth)
}

fn read_call_site<R: Read>(r: &mut R) -> Result<CallSite, LinkError> {
    let kind = match read_u8(r)? {
        0 => CallSiteKind::Internal,
        1 => CallSiteKind::Indirect,
        _ => return Err(LinkError::CorruptCache("call site kind")),
    };
    Ok(CallSite {
        kind,
        return_offset: read_u32(r)?,
        stack_depth: read_u32(r)?,
    })
}

fn write_code_range<W: Write>(w: &mut W, range: &CodeRange) -> io::Result<()> {
    match range.kind {
        CodeRangeKind::Function => write_u8(w, 0)?,
        CodeRangeKind::Entry => write_u8(w, 1)?,
        CodeRangeKind::Thunk(sym) => {
            write_u8(w, 2)?;
            write_u32(w, sym as u32)?;
        }
        CodeRangeKind::Interrupt => write_u8(w, 3)?,
    }
    write_u32(w, range.begin)?;
    write_u32(w, range.end)?;
    write_u32(w, range.entry)?;
    write_u32(w, range.profiling_entry)?;
    write_u32(w, range.profiling_jump)?;
    write_u32(w, range.profiling_epilogue)?;
    write_u32(w, range.name_index)?;
    write_u32(w, range.line)
}

fn read_code_range<R: Read>(r: &mut R) -> Result<CodeRange, LinkError> {
    let kind = match read_u8(r)? {
        0 => CodeRangeKind::Function,
        1 => CodeRangeKind::Entry,
        2 => {
            let sym = SymbolicAddress::from_u32(read_u32(r)?)
                .ok_or(LinkError::CorruptCache("thunk builtin id"))?;
            CodeRangeKind::Thunk(sym)
        }
        3 => CodeRangeKind::Interrupt,
        _ => return Err(LinkError::CorruptCache("code range kind")),
    };
    Ok(CodeRange {
        kind,
        begin: read_u32(r)?,
        end: read_u32(r)?,
        entry: read_u32(r)?,
        profiling_entry: read_u32(r)?,
        profiling_jump: read_u32(r)?,
        profiling_epilogue: read_u32(r)?,
        name_index: read_u32(r)?,
        line: read_u32(r)?,
    })
}

fn write_func_ptr_table<W: Write>(w: &mut W, table: &FuncPtrTable) -> io::Result<()> {
    write_u32(w, table.global_data_offset)?;
    write_u32(w, table.targets.len() as u32)?;
    for &target in &table.targets {
        write_u32(w, target)?;
    }
    Ok(())
}

fn read_func_ptr_table<R: Read>(r: &mut R) -> Result<FuncPtrTable, LinkError> {
    let global_data_offset = read_u32(r)?;
    let count = read_u32(r)?;
    if count > MAX_VEC_LEN {
        return Err(LinkError::CorruptCache("vector length"));
    }
    let mut targets = Vec::with_capacity(count as usize);
    for _ in 0..count {
        targets.push(read_u32(r)?);
    }
    Ok(FuncPtrTable {
        global_data_offset,
        targets,
    })
}

fn write_heap_access<W: Write>(w: &mut W, access: &HeapAccess) -> io::Result<()> {
    write_u32(w, access.insn_offset)?;
    match access.length_check {
        None => write_u8(w, 0),
        Some(LengthCheck { imm_offset, base }) => {
            write_u8(w, 1)?;
            write_u32(w, imm_offset)?;
            write_u32(w, base)
        }
    }
}

fn read_heap_access<R: Read>(r: &mut R) -> Result<HeapAccess, LinkError> {
    let insn_offset = read_u32(r)?;
    let length_check = match read_u8(r)? {
        0 => None,
        1 => Some(LengthCheck {
            imm_offset: read_u32(r)?,
            base: read_u32(r)?,
        }),
        _ => return Err(LinkError::CorruptCache("heap access flag")),
    };
    Ok(HeapAccess {
        insn_offset,
        length_check,
    })
}

fn write_relative_link<W: Write>(w: &mut W, link: &RelativeLink) -> io::Result<()> {
    write_u32(w, link.patch_at_offset)?;
    write_u32(w, link.target_offset)
}

fn read_relative_link<R: Read>(r: &mut R) -> Result<RelativeLink, LinkError> {
    Ok(RelativeLink {
        patch_at_offset: read_u32(r)?,
        target_offset: read_u32(r)?,
    })
}

fn write_absolute_link<W: Write>(w: &mut W, link: &AbsoluteLink) -> io::Result<()> {
    write_u32(w, link.target as u32)?;
    write_u32(w, link.patch_sites.len() as u32)?;
    for &site in &link.patch_sites {
        write_u32(w, site)?;
    }
    Ok(())
}

fn read_absolute_link<R: Read>(r: &mut R) -> Result<AbsoluteLink, LinkError> {
    let target = SymbolicAddress::from_u32(read_u32(r)?)
        .ok_or(LinkError::CorruptCache("symbolic address id"))?;
    let count = read_u32(r)?;
    if count > MAX_VEC_LEN {
        return Err(LinkError::CorruptCache("vector length"));
    }
    let mut patch_sites = Vec::with_capacity(count as usize);
    for _ in 0..count {
        patch_sites.push(read_u32(r)?);
    }
    Ok(AbsoluteLink {
        target,
        patch_sites,
    })
}

// ==================== primitive codecs ====================

fn write_u8<W: Write>(w: &mut W, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8, LinkError> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf).map_err(|_| LinkError::UnexpectedEof)?;
    Ok(buf[0])
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, LinkError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(|_| LinkError::UnexpectedEof)?;
    Ok(u32::from_le_bytes(buf))
}

fn write_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    write_u32(w, bytes.len() as u32)?;
    w.write_all(bytes)
}

fn read_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>, LinkError> {
    let len = read_u32(r)?;
    if len > MAX_VEC_LEN {
        return Err(LinkError::CorruptCache("byte vector length"));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).map_err(|_| LinkError::UnexpectedEof)?;
    Ok(buf)
}

/// Strings: `u32 (length << 1 | is_latin1)` + raw character bytes. Latin-1
/// when every char fits a byte, UTF-16 code units otherwise.
fn write_name<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    if s.chars().all(|c| (c as u32) < 256) {
        let len = s.chars().count() as u32;
        write_u32(w, (len << 1) | 1)?;
        for c in s.chars() {
            write_u8(w, c as u8)?;
        }
    } else {
        let units: Vec<u16> = s.encode_utf16().collect();
        write_u32(w, (units.len() as u32) << 1)?;
        for unit in units {
            w.write_all(&unit.to_le_bytes())?;
        }
    }
    Ok(())
}

fn read_name<R: Read>(r: &mut R) -> Result<String, LinkError> {
    let tag = read_u32(r)?;
    let len = tag >> 1;
    if len > MAX_VEC_LEN {
        return Err(LinkError::CorruptCache("string length"));
    }
    if tag & 1 == 1 {
        let mut bytes = vec![0u8; len as usize];
        r.read_exact(&mut bytes).map_err(|_| LinkError::UnexpectedEof)?;
        Ok(bytes.into_iter().map(|b| b as char).collect())
    } else {
        let mut units = Vec::with_capacity(len as usize);
        for _ in 0..len {
            let mut buf = [0u8; 2];
            r.read_exact(&mut buf).map_err(|_| LinkError::UnexpectedEof)?;
            units.push(u16::from_le_bytes(buf));
        }
        String::from_utf16(&units).map_err(|_| LinkError::CorruptCache("utf-16 string"))
    }
}

// ==================== inspection (no link, no checks) ====================

/// Header and table counts of a cache entry, parsed without allocating
/// executable memory and without machine/source validation. For tooling.
#[derive(Debug, serde::Serialize)]
pub struct CacheSummary {
    pub version: u32,
    pub cpu_features: u32,
    pub build_id: String,
    pub source_bytes: u32,
    pub code_bytes: u32,
    pub global_data_bytes: u32,
    pub strict: bool,
    pub uses_signal_handlers: bool,
    pub min_heap_length: u32,
    pub max_heap_length: u32,
    pub matches_this_machine: bool,
    pub exports: Vec<String>,
    pub functions: Vec<FunctionSummary>,
    pub num_globals: u32,
    pub num_exits: u32,
    pub num_call_sites: u32,
    pub num_heap_accesses: u32,
    pub num_func_ptr_tables: u32,
    pub num_relative_links: u32,
    pub num_absolute_links: u32,
}

#[derive(Debug, serde::Serialize)]
pub struct FunctionSummary {
    pub name: String,
    pub line: u32,
    pub begin: u32,
    pub end: u32,
}

/// Parse a cache entry's self-describing parts.
pub fn read_summary(data: &[u8]) -> Result<CacheSummary, LinkError> {
    let mut cursor = io::Cursor::new(data);
    let r = &mut cursor;

    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)
        .map_err(|_| LinkError::UnexpectedEof)?;
    if &magic != MAGIC {
        return Err(LinkError::CorruptCache("bad magic"));
    }
    let version = read_u32(r)?;
    if version != VERSION {
        return Err(LinkError::CacheMiss("format version"));
    }

    let machine = MachineId {
        cpu_features: read_u32(r)?,
        build_id: read_bytes(r)?,
    };
    let source = read_bytes(r)?;
    let pod = read_pod(r)?;
    if pod.code_bytes > MAX_SEGMENT_BYTES || pod.global_data_bytes > MAX_SEGMENT_BYTES {
        return Err(LinkError::CorruptCache("segment size"));
    }

    let mut code = vec![0u8; pod.code_bytes as usize];
    r.read_exact(&mut code)
        .map_err(|_| LinkError::UnexpectedEof)?;

    let names = read_vec(r, read_func_name)?;
    let globals = read_vec(r, read_global)?;
    let exits = read_vec(r, read_exit)?;
    let exports = read_vec(r, read_export)?;
    let call_sites = read_vec(r, read_call_site)?;
    let code_ranges = read_vec(r, read_code_range)?;
    let func_ptr_tables = read_vec(r, read_func_ptr_table)?;
    let heap_accesses = read_vec(r, read_heap_access)?;
    let relative_links = read_vec(r, read_relative_link)?;
    let absolute_links = read_vec(r, read_absolute_link)?;

    let functions = code_ranges
        .iter()
        .filter(|range| range.is_function())
        .map(|range| FunctionSummary {
            name: names
                .get(range.name_index as usize)
                .map(|n| n.text.clone())
                .unwrap_or_default(),
            line: range.line,
            begin: range.begin,
            end: range.end,
        })
        .collect();

    Ok(CacheSummary {
        version,
        cpu_features: machine.cpu_features,
        build_id: String::from_utf8_lossy(&machine.build_id).into_owned(),
        source_bytes: source.len() as u32,
        code_bytes: pod.code_bytes,
        global_data_bytes: pod.global_data_bytes,
        strict: pod.strict,
        uses_signal_handlers: pod.uses_signal_handlers,
        min_heap_length: pod.min_heap_length,
        max_heap_length: pod.max_heap_length,
        matches_this_machine: machine == MachineId::current(),
        exports: exports.into_iter().map(|e| e.name).collect(),
        functions,
        num_globals: globals.len() as u32,
        num_exits: exits.len() as u32,
        num_call_sites: call_sites.len() as u32,
        num_heap_accesses: heap_accesses.len() as u32,
        num_func_ptr_tables: func_ptr_tables.len() as u32,
        num_relative_links: relative_links.len() as u32,
        num_absolute_links: absolute_links.len() as u32,
    })
}

fn write_vec<W: Write, T>(
    w: &mut W,
    items: &[T],
    f: impl Fn(&mut W, &T) -> io::Result<()>,
) -> io::Result<()> {
    write_u32(w, items.len() as u32)?;
    for item in items {
        f(w, item)?;
    }
    Ok(())
}

fn read_vec<R: Read, T>(
    r: &mut R,
    f: impl Fn(&mut R) -> Result<T, LinkError>,
) -> Result<Vec<T>, LinkError> {
    let count = read_u32(r)?;
    if count > MAX_VEC_LEN {
        return Err(LinkError::CorruptCache("vector length"));
    }
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        items.push(f(r)?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch;
    use crate::module::ModuleBuilder;

    fn sample_module() -> Module {
        let mut b = ModuleBuilder::new();
        b.set_strict(true);
        b.set_heap_limits(4096, 1 << 24);
        b.append_code(&[0u8; 128]);
        let f = b.add_func_name("répondre", 7);
        b.add_code_range(CodeRange::function(f, 7, 0, 0, 8, 40, 44, 64));
        b.add_code_range(CodeRange::entry_stub(CodeRangeKind::Entry, 64, 96));
        b.add_global(Global {
            name: "π".into(),
            kind: GlobalKind::Constant(3.141592653589793),
        });
        b.add_global(Global {
            name: "log".into(),
            kind: GlobalKind::Import {
                field: "Math.log".into(),
            },
        });
        b.declare_exit(0);
        b.add_export("run", 64);
        b.add_call_site(CallSite {
            kind: CallSiteKind::Internal,
            return_offset: 32,
            stack_depth: 16,
        });
        b.add_heap_access(HeapAccess {
            insn_offset: 48,
            length_check: Some(LengthCheck {
                imm_offset: 44,
                base: 8,
            }),
        });
        b.add_func_ptr_table(vec![8]);
        b.add_relative_link(96, 0);
        b.add_absolute_link(SymbolicAddress::LogD, 112);
        b.set_interrupt_exit(64);
        b.finish().unwrap()
    }

    #[test]
    fn test_roundtrip_preserves_everything() {
        let m = sample_module();
        let source = b"function f(x) { return log(x); }";
        let bytes = serialize_module(&m, source);

        let m2 = deserialize_module(&bytes, source).unwrap();
        assert!(m2.is_loaded_from_cache());
        assert!(m2.is_statically_linked());

        assert_eq!(m2.pod, m.pod);
        assert_eq!(m2.names, m.names);
        assert_eq!(m2.globals, m.globals);
        assert_eq!(m2.exits, m.exits);
        assert_eq!(m2.exports, m.exports);
        assert_eq!(m2.call_sites, m.call_sites);
        assert_eq!(m2.code_ranges, m.code_ranges);
        assert_eq!(m2.func_ptr_tables, m.func_ptr_tables);
        assert_eq!(m2.heap_accesses, m.heap_accesses);
        assert_eq!(m2.link_data, m.link_data);

        // Patched sites resolve against the new base; everything else is a
        // verbatim copy.
        let base2 = m2.code.as_ptr() as u64;
        assert_eq!(arch::read_u64_at(m2.code.as_slice(), 96), base2);
        assert_eq!(
            arch::read_u64_at(m2.code.as_slice(), 112),
            SymbolicAddress::LogD.address()
        );
        let code1 = &m.code.as_slice()[..96];
        let code2 = &m2.code.as_slice()[..96];
        assert_eq!(code1, code2);
    }

    #[test]
    fn test_source_mismatch_is_cache_miss() {
        let m = sample_module();
        let bytes = serialize_module(&m, b"source A");
        match deserialize_module(&bytes, b"source B") {
            Err(LinkError::CacheMiss("source text")) => {}
            other => panic!("expected source miss, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_fingerprint_mismatch_is_cache_miss() {
        let m = sample_module();
        let mut bytes = serialize_module(&m, b"src");
        // cpu-feature word sits right after magic + version
        bytes[8] ^= 0x40;
        match deserialize_module(&bytes, b"src") {
            Err(LinkError::CacheMiss("machine fingerprint")) => {}
            other => panic!("expected fingerprint miss, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_truncated_data_is_an_error() {
        let m = sample_module();
        let bytes = serialize_module(&m, b"src");
        for cut in [3, 16, bytes.len() / 2, bytes.len() - 1] {
            match deserialize_module(&bytes[..cut], b"src") {
                Err(_) => {}
                Ok(_) => panic!("truncation at {cut} accepted"),
            }
        }
    }

    #[test]
    fn test_bad_magic_is_corrupt() {
        let m = sample_module();
        let mut bytes = serialize_module(&m, b"src");
        bytes[0] = b'X';
        match deserialize_module(&bytes, b"src") {
            Err(LinkError::CorruptCache("bad magic")) => {}
            other => panic!("expected corrupt magic, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_out_of_range_link_offset_is_corrupt_not_a_panic() {
        let m = sample_module();
        let mut bytes = serialize_module(&m, b"src");
        // The trailer is [relative links][absolute links][interrupt exit]
        // [end marker]; with one relative link and one single-site bucket
        // the link's patch_at_offset field sits 32 bytes from the end.
        let at = bytes.len() - 32;
        bytes[at..at + 4].copy_from_slice(&0xFFFF_0000u32.to_le_bytes());
        match deserialize_module(&bytes, b"src") {
            Err(LinkError::CorruptCache("relative link offset")) => {}
            other => panic!("expected corrupt link offset, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_absurd_segment_size_is_corrupt_not_an_allocation() {
        let m = sample_module();
        let source = b"src";
        let mut bytes = serialize_module(&m, source);
        // pod.code_bytes follows the magic, version, fingerprint, and
        // source blocks.
        let pod_at = 4 + 4 + 4 + (4 + env!("CARGO_PKG_VERSION").len()) + (4 + source.len());
        bytes[pod_at..pod_at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        match deserialize_module(&bytes, source) {
            Err(LinkError::CorruptCache("segment size")) => {}
            other => panic!("expected corrupt segment size, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_name_codec_handles_latin1_and_utf16() {
        let mut buf = Vec::new();
        for s in ["", "run", "répondre", "日本語", "aπb"] {
            buf.clear();
            write_name(&mut buf, s).unwrap();
            let got = read_name(&mut io::Cursor::new(&buf)).unwrap();
            assert_eq!(got, s);
        }
    }

    #[test]
    fn test_summary_counts() {
        let m = sample_module();
        let bytes = serialize_module(&m, b"src");
        let summary = read_summary(&bytes).unwrap();
        assert_eq!(summary.version, VERSION);
        assert_eq!(summary.code_bytes, 128);
        assert!(summary.matches_this_machine);
        assert_eq!(summary.exports, vec!["run".to_string()]);
        assert_eq!(summary.functions.len(), 1);
        assert_eq!(summary.functions[0].name, "répondre");
        assert_eq!(summary.num_absolute_links, 1);
        assert!(summary.strict);
    }

    #[test]
    #[should_panic(expected = "pristine")]
    fn test_serialize_linked_module_is_programmer_error() {
        let mut m = sample_module();
        m.static_link().unwrap();
        let _ = serialize_module(&m, b"src");
    }
}
