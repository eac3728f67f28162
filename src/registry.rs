//! Heap-detach notification registry.
//!
//! When the embedder is about to move or free a shared heap buffer, every
//! module still bound to it must be detached first. The registry maps each
//! heap's base address to the ids of the modules currently attached, so a
//! detach event can name exactly the modules affected. The embedder owns
//! the registry; modules never hold prev/next pointers into it.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Embedder-chosen module identifier.
pub type ModuleId = u64;

#[derive(Debug, Default)]
pub struct ModuleRegistry {
    attached: Mutex<HashMap<usize, HashSet<ModuleId>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        ModuleRegistry {
            attached: Mutex::new(HashMap::new()),
        }
    }

    /// Record that `module_id` is now attached to the heap at `heap_base`.
    /// A module is attached to at most one heap, so any earlier entry for
    /// the same id is dropped first.
    pub fn register(&self, module_id: ModuleId, heap_base: usize) {
        let mut attached = self.attached.lock().expect("registry lock poisoned");
        for ids in attached.values_mut() {
            ids.remove(&module_id);
        }
        attached.retain(|_, ids| !ids.is_empty());
        attached.entry(heap_base).or_default().insert(module_id);
    }

    /// Remove `module_id` from whatever heap it was registered under.
    /// Idempotent.
    pub fn unregister(&self, module_id: ModuleId) {
        let mut attached = self.attached.lock().expect("registry lock poisoned");
        for ids in attached.values_mut() {
            ids.remove(&module_id);
        }
        attached.retain(|_, ids| !ids.is_empty());
    }

    /// The heap at `heap_base` is going away. Returns the ids of every
    /// module still attached to it, in ascending order, and forgets them.
    /// The caller must detach each returned module before releasing the
    /// buffer.
    pub fn notify_detached(&self, heap_base: usize) -> Vec<ModuleId> {
        let mut attached = self.attached.lock().expect("registry lock poisoned");
        let mut ids: Vec<ModuleId> = attached
            .remove(&heap_base)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub fn num_attached(&self) -> usize {
        let attached = self.attached.lock().expect("registry lock poisoned");
        attached.values().map(HashSet::len).sum()
    }
}
