//! aotlink - ahead-of-time module linking and runtime code patching
//!
//! This library takes the output of an ahead-of-time code generator (a raw
//! code buffer plus metadata tables and unresolved link records), places it
//! in executable memory, resolves its internal and runtime-helper
//! references, and keeps the machine code patchable afterwards: heap
//! buffers can be attached and detached, profiling instrumentation toggled,
//! and whole modules cloned or round-tripped through a byte-exact
//! serialization cache. Every patch is value-checked against the bytes it
//! expects to overwrite.

pub mod arch;
pub mod builtins;
pub mod memory;
pub mod module;
pub mod registry;

// Re-export commonly used types
pub use builtins::SymbolicAddress;
pub use memory::{ExecutableMemory, MemoryError};
pub use module::heap::HeapBuffer;
pub use module::{EntryFn, LinkError, Module, ModuleBuilder};
pub use registry::{ModuleId, ModuleRegistry};
