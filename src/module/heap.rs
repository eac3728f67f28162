//! Attaching and detaching the module's heap buffer.
//!
//! Attach folds the heap's byte length into every recorded bounds-check
//! immediate and publishes the heap's data pointer in the global-data heap
//! cell; detach restores the generator-base immediates and nulls the cell.
//! Both directions are value-checked against the base immediate stored in
//! the heap-access record, so a divergence fails loudly instead of silently
//! corrupting the next attach.
//!
//! Caller contract: no thread may hold a live call frame in the module
//! while these run; the code pages are briefly writable.

use std::sync::Arc;

use crate::arch;

use super::metadata::LengthCheck;
use super::{LinkError, Module};

/// An external growable byte buffer shared between the embedder and any
/// modules it is attached to. Growth is modeled as a new buffer plus a
/// detach/attach chain on every attached module.
pub struct HeapBuffer {
    bytes: Box<[u8]>,
}

impl HeapBuffer {
    pub fn new(len: usize) -> Arc<Self> {
        Arc::new(HeapBuffer {
            bytes: vec![0u8; len].into_boxed_slice(),
        })
    }

    pub fn base(&self) -> *const u8 {
        self.bytes.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Module {
    /// Patch every length-checked heap access for `heap` and publish its
    /// data pointer. Requires a dynamically linked module with no heap
    /// currently attached, and a heap within the module's declared limits.
    pub fn attach_heap(&mut self, heap: Arc<HeapBuffer>) -> Result<(), LinkError> {
        assert!(self.dynamically_linked, "attach before dynamic link");
        assert!(self.heap.is_none(), "heap already attached");
        assert!(heap.len() <= u32::MAX as usize);
        let heap_len = heap.len() as u32;
        assert!(
            heap_len >= self.pod.min_heap_length && heap_len <= self.pod.max_heap_length,
            "heap length outside module limits"
        );

        let Module {
            ref mut code,
            ref heap_accesses,
            ref pod,
            ..
        } = *self;
        let heap_base = heap.base() as u64;

        code.patch(|bytes| -> Result<(), LinkError> {
            for access in heap_accesses {
                if let Some(LengthCheck { imm_offset, base }) = access.length_check {
                    arch::native::patch_bounds_immediate(
                        bytes,
                        imm_offset as usize,
                        base + heap_len,
                        base,
                    )
                    .map_err(|_| LinkError::CorruptCache("bounds immediate"))?;
                }
            }
            arch::write_u64_at(bytes, pod.code_bytes as usize, heap_base);
            Ok(())
        })??;

        self.heap = Some(heap);
        Ok(())
    }

    /// The exact inverse of `attach_heap`: restores every bounds immediate
    /// to its generator-base bit pattern and nulls the heap cell. Returns
    /// the buffer so the embedder can re-attach a replacement.
    ///
    /// Detaching while the interrupt handler is running is a fatal error.
    pub fn detach_heap(&mut self) -> Result<Arc<HeapBuffer>, LinkError> {
        assert!(!self.interrupted, "detach during interrupt handling");
        let heap = self.heap.take().expect("no heap attached");
        let heap_len = heap.len() as u32;

        let Module {
            ref mut code,
            ref heap_accesses,
            ref pod,
            ..
        } = *self;

        code.patch(|bytes| -> Result<(), LinkError> {
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
            arch::write_u64_at(bytes, pod.code_bytes as usize, 0);
            Ok(())
        })??;

        Ok(heap)
    }

    /// Swap the attached heap for `new_heap` (a grown replacement buffer).
    pub fn change_heap(&mut self, new_heap: Arc<HeapBuffer>) -> Result<Arc<HeapBuffer>, LinkError> {
        let old = self.detach_heap()?;
        self.attach_heap(new_heap)?;
        Ok(old)
    }

    /// Current value of the global-data heap cell.
    pub fn heap_cell(&self) -> u64 {
        arch::read_u64_at(self.code.as_slice(), self.heap_cell_at())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleBuilder;
    use crate::module::metadata::HeapAccess;

    fn module_with_access(base: u32) -> Module {
        let mut b = ModuleBuilder::new();
        b.append_code(&[0u8; 64]);
        b.add_heap_access(HeapAccess {
            insn_offset: 40,
            length_check: Some(LengthCheck {
                imm_offset: 36,
                base,
            }),
        });
        let mut m = b.finish().unwrap();
        m.static_link().unwrap();
        m.dynamic_link();
        m
    }

    fn bounds_at(m: &Module, at: usize) -> u32 {
        arch::native::read_bounds_immediate(m.code.as_slice(), at)
    }

    #[test]
    fn test_attach_detach_scenario() {
        let mut m = module_with_access(8);
        assert_eq!(bounds_at(&m, 36), 8);

        m.attach_heap(HeapBuffer::new(65536)).unwrap();
        assert_eq!(bounds_at(&m, 36), 8 + 65536);
        assert_ne!(m.heap_cell(), 0);

        m.detach_heap().unwrap();
        assert_eq!(bounds_at(&m, 36), 8);
        assert_eq!(m.heap_cell(), 0);

        m.attach_heap(HeapBuffer::new(131072)).unwrap();
        assert_eq!(bounds_at(&m, 36), 8 + 131072);
    }

    #[test]
    fn test_detach_restores_exact_bytes() {
        let mut m = module_with_access(16);
        let before = m.code.as_slice().to_vec();

        m.attach_heap(HeapBuffer::new(4096)).unwrap();
        assert_ne!(m.code.as_slice(), &before[..]);
        m.detach_heap().unwrap();
        assert_eq!(m.code.as_slice(), &before[..]);
    }

    #[test]
    fn test_change_heap_chains() {
        let mut m = module_with_access(0);
        let first = HeapBuffer::new(1024);
        let first_base = first.base() as u64;
        m.attach_heap(first).unwrap();
        assert_eq!(m.heap_cell(), first_base);

        let second = HeapBuffer::new(2048);
        let second_base = second.base() as u64;
        let old = m.change_heap(second).unwrap();
        assert_eq!(old.base() as u64, first_base);
        assert_eq!(m.heap_cell(), second_base);
        assert_eq!(bounds_at(&m, 36), 2048);
    }

    #[test]
    #[should_panic(expected = "attach before dynamic link")]
    fn test_attach_requires_dynamic_link() {
        let mut b = ModuleBuilder::new();
        b.append_code(&[0u8; 64]);
        let mut m = b.finish().unwrap();
        m.static_link().unwrap();
        let _ = m.attach_heap(HeapBuffer::new(64));
    }

    #[test]
    #[should_panic(expected = "detach during interrupt handling")]
    fn test_detach_during_interrupt_is_fatal() {
        let mut m = module_with_access(0);
        m.attach_heap(HeapBuffer::new(64)).unwrap();
        m.set_interrupted(true);
        let _ = m.detach_heap();
    }

    #[test]
    #[should_panic(expected = "no heap attached")]
    fn test_detach_without_heap_is_programmer_error() {
        let mut m = module_with_access(0);
        let _ = m.detach_heap();
    }
}
