//! End-to-end tests that drive the public API the way an embedder would:
//! build a module, link it, persist it, and call into its code.

use std::sync::Arc;

use aotlink::arch;
use aotlink::builtins::SymbolicAddress;
use aotlink::module::cache;
use aotlink::module::heap::HeapBuffer;
use aotlink::module::metadata::{CodeRange, CodeRangeKind, HeapAccess, LengthCheck};
use aotlink::{Module, ModuleBuilder, ModuleRegistry};

/// Hand-assembled `fn(arg) -> 42` matching `EntryFn`'s signature: the
/// argument is ignored and 42 is returned in the integer return register.
fn write_return_42(code: &mut [u8], at: usize) {
    #[cfg(target_arch = "x86_64")]
    code[at..at + 6].copy_from_slice(&[0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3]);
    #[cfg(target_arch = "aarch64")]
    {
        // mov w0, #42 ; ret
        code[at..at + 4].copy_from_slice(&0x5280_0540u32.to_le_bytes());
        code[at + 4..at + 8].copy_from_slice(&0xd65f_03c0u32.to_le_bytes());
    }
}

/// A module with one exported entry stub and one bounds-checked heap
/// access (immediate at 32, generator base 8).
fn build_module() -> Module {
    let mut builder = ModuleBuilder::new();
    builder.set_heap_limits(4096, 1 << 24);

    let mut code = [0u8; 128];
    write_return_42(&mut code, 64);
    builder.append_code(&code);

    let name = builder.add_func_name("kernel", 3);
    builder.add_code_range(CodeRange::function(name, 3, 0, 0, 8, 40, 44, 64));
    builder.add_code_range(CodeRange::entry_stub(CodeRangeKind::Entry, 64, 96));
    builder.add_heap_access(HeapAccess {
        insn_offset: 36,
        length_check: Some(LengthCheck {
            imm_offset: 32,
            base: 8,
        }),
    });
    builder.add_export("kernel", 64);
    builder.add_absolute_link(SymbolicAddress::SinD, 96);
    builder.set_interrupt_exit(64);
    builder.finish().unwrap()
}

fn bounds_imm(module: &Module) -> u32 {
    arch::native::read_bounds_immediate(module.code(), 32)
}

#[test]
fn test_exported_entry_is_callable() {
    let mut module = build_module();
    module.static_link().unwrap();
    module.dynamic_link();

    let entry = unsafe { module.export_entry(0) }.expect("export missing");
    let mut arg = 0u64;
    let ret = unsafe { entry(&mut arg) };
    assert_eq!(ret, 42);
}

#[test]
fn test_cache_file_roundtrip_produces_callable_module() {
    let module = build_module();
    let source = b"function kernel() { return 42; }";
    let bytes = cache::serialize_module(&module, source);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kernel.aotcache");
    std::fs::write(&path, &bytes).unwrap();

    let data = std::fs::read(&path).unwrap();
    let mut restored = cache::deserialize_module(&data, source).unwrap();
    assert!(restored.is_loaded_from_cache());
    restored.dynamic_link();

    let entry = unsafe { restored.export_entry(0) }.expect("export missing");
    let mut arg = 0u64;
    assert_eq!(unsafe { entry(&mut arg) }, 42);
}

#[test]
fn test_cache_summary_of_written_file() {
    let module = build_module();
    let bytes = cache::serialize_module(&module, b"src");
    let summary = cache::read_summary(&bytes).unwrap();
    assert_eq!(summary.exports, vec!["kernel".to_string()]);
    assert_eq!(summary.functions.len(), 1);
    assert_eq!(summary.functions[0].name, "kernel");
    assert_eq!(summary.num_heap_accesses, 1);
    assert!(summary.matches_this_machine);
}

#[test]
fn test_truncated_cache_file_is_rejected() {
    let module = build_module();
    let bytes = cache::serialize_module(&module, b"src");
    assert!(cache::deserialize_module(&bytes[..bytes.len() / 3], b"src").is_err());
    assert!(cache::read_summary(&bytes[..10]).is_err());
}

#[test]
fn test_clone_heap_binding_is_isolated() {
    let mut source = build_module();
    source.static_link().unwrap();
    source.dynamic_link();

    let mut clone = source.clone_module().unwrap();
    clone.dynamic_link();

    let pristine_imm = bounds_imm(&source);
    assert_eq!(pristine_imm, 8);

    let heap = HeapBuffer::new(65536);
    clone.attach_heap(Arc::clone(&heap)).unwrap();
    assert_eq!(bounds_imm(&clone), 8 + 65536);
    assert_eq!(bounds_imm(&source), pristine_imm);

    // And the other direction.
    let other = HeapBuffer::new(131072);
    source.attach_heap(Arc::clone(&other)).unwrap();
    assert_eq!(bounds_imm(&source), 8 + 131072);
    assert_eq!(bounds_imm(&clone), 8 + 65536);

    clone.detach_heap().unwrap();
    assert_eq!(bounds_imm(&clone), 8);
    assert_eq!(bounds_imm(&source), 8 + 131072);
}

#[test]
fn test_clone_of_cached_module_is_callable() {
    let module = build_module();
    let bytes = cache::serialize_module(&module, b"src");
    let restored = cache::deserialize_module(&bytes, b"src").unwrap();

    let mut clone = restored.clone_module().unwrap();
    clone.dynamic_link();
    let entry = unsafe { clone.export_entry(0) }.expect("export missing");
    let mut arg = 0u64;
    assert_eq!(unsafe { entry(&mut arg) }, 42);
}

#[test]
fn test_registry_names_modules_attached_to_a_buffer() {
    let registry = ModuleRegistry::new();

    let mut a = build_module();
    a.static_link().unwrap();
    a.dynamic_link();
    let mut b = build_module();
    b.static_link().unwrap();
    b.dynamic_link();

    let heap = HeapBuffer::new(65536);
    a.attach_heap(Arc::clone(&heap)).unwrap();
    registry.register(1, heap.base() as usize);
    b.attach_heap(Arc::clone(&heap)).unwrap();
    registry.register(2, heap.base() as usize);

    // The buffer is going away: detach exactly the modules the registry
    // names, then both immediates are back to their generator values.
    let affected = registry.notify_detached(heap.base() as usize);
    assert_eq!(affected, vec![1, 2]);
    for (id, module) in [(1, &mut a), (2, &mut b)] {
        assert!(affected.contains(&id));
        module.detach_heap().unwrap();
        assert_eq!(bounds_imm(module), 8);
    }
}
