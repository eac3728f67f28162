//! Executable memory management using mmap.
//!
//! A linked module owns a single page-aligned allocation holding its machine
//! code followed by a read-write global-data segment. The allocation starts
//! writable so code can be copied in and patch sites resolved, is sealed to
//! read/execute once linked, and can be temporarily re-opened for patching
//! through a scoped region that re-protects (and flushes the instruction
//! cache) when it ends.

use std::ptr::NonNull;

/// Error type for memory operations.
#[derive(Debug)]
pub enum MemoryError {
    AllocationFailed,
    ProtectionFailed,
    InvalidSize,
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "executable allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "memory protection change failed"),
            MemoryError::InvalidSize => write!(f, "invalid memory size"),
        }
    }
}

impl std::error::Error for MemoryError {}

/// Page size for the current system.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

/// A page-aligned block of memory that can hold executable code.
///
/// The block is writable until `seal()` flips it to read/execute. After
/// sealing, mutation goes through `patch()`, which re-enables write access
/// for the duration of a closure and restores read/execute afterward.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    sealed: bool,
}

impl ExecutableMemory {
    /// Allocate a block of at least `size` bytes, rounded up to a page
    /// multiple. The memory is zeroed and writable.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }

        let page = page_size();
        let aligned_size = (size + page - 1) & !(page - 1);
        let ptr = Self::mmap_alloc(aligned_size)?;

        Ok(Self {
            ptr,
            size: aligned_size,
            sealed: false,
        })
    }

    #[cfg(unix)]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        use std::ptr;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }

        NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)
    }

    #[cfg(not(unix))]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        let layout = std::alloc::Layout::from_size_align(size, page_size())
            .map_err(|_| MemoryError::InvalidSize)?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(MemoryError::AllocationFailed)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Base address as an integer, for patch-value arithmetic.
    pub fn base(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Allocated size (page multiple, >= the requested size).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Read-only view of the whole block. Valid sealed or not, since the
    /// block always keeps read permission.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    /// Copy bytes into the block at `offset`. Only valid before sealing;
    /// later mutation must go through `patch()`.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if self.sealed {
            return Err(MemoryError::ProtectionFailed);
        }
        if offset + data.len() > self.size {
            return Err(MemoryError::InvalidSize);
        }

        unsafe {
            let dest = self.ptr.as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dest, data.len());
        }

        Ok(())
    }

    /// Flip the block to read/execute.
    pub fn seal(&mut self) -> Result<(), MemoryError> {
        if self.sealed {
            return Ok(());
        }
        self.protect_exec()?;
        self.sealed = true;
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Run `f` with write access to the block, then restore read/execute and
    /// flush the instruction cache. No other thread may be executing inside
    /// the patched ranges while `f` runs; that is the caller's contract.
    pub fn patch<R>(
        &mut self,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, MemoryError> {
        let was_sealed = self.sealed;
        if was_sealed {
            self.protect_write()?;
        }

        let result = {
            let bytes = unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) };
            f(bytes)
        };

        if was_sealed {
            self.protect_exec()?;
            flush_icache(self.ptr.as_ptr(), self.size);
        }
        Ok(result)
    }

    #[cfg(unix)]
    fn protect_exec(&mut self) -> Result<(), MemoryError> {
        let rc = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            return Err(MemoryError::ProtectionFailed);
        }
        Ok(())
    }

    #[cfg(unix)]
    fn protect_write(&mut self) -> Result<(), MemoryError> {
        let rc = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            return Err(MemoryError::ProtectionFailed);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn protect_exec(&mut self) -> Result<(), MemoryError> {
        Ok(())
    }

    #[cfg(not(unix))]
    fn protect_write(&mut self) -> Result<(), MemoryError> {
        Ok(())
    }

    /// Get a function pointer to `offset` within the block. The block must
    /// be sealed.
    ///
    /// # Safety
    /// The caller must ensure the offset points at valid machine code for
    /// the target architecture with the expected signature.
    pub unsafe fn as_fn<F>(&self, offset: usize) -> Option<F>
    where
        F: Copy,
    {
        if !self.sealed || offset >= self.size {
            return None;
        }
        if std::mem::size_of::<F>() != std::mem::size_of::<fn()>() {
            return None;
        }
        let ptr = unsafe { self.ptr.as_ptr().add(offset) };
        // SAFETY: Caller guarantees the memory contains valid code
        Some(unsafe { std::mem::transmute_copy(&ptr) })
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            }
        }
        #[cfg(not(unix))]
        {
            let layout = std::alloc::Layout::from_size_align(self.size, page_size())
                .expect("invalid layout");
            unsafe {
                std::alloc::dealloc(self.ptr.as_ptr(), layout);
            }
        }
    }
}

// ExecutableMemory owns its mapping; the sealed flag is only mutated through
// &mut methods.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

/// Make instruction fetches observe freshly patched bytes. x86 keeps the
/// icache coherent with stores; ARM needs an explicit flush.
#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
fn flush_icache(start: *mut u8, len: usize) {
    unsafe extern "C" {
        fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
    }
    unsafe {
        __clear_cache(
            start as *mut libc::c_char,
            start.add(len) as *mut libc::c_char,
        );
    }
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
fn flush_icache(start: *mut u8, len: usize) {
    unsafe extern "C" {
        fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
    }
    unsafe {
        sys_icache_invalidate(start as *mut libc::c_void, len);
    }
}

#[cfg(not(all(any(target_os = "linux", target_os = "macos"), target_arch = "aarch64")))]
fn flush_icache(_start: *mut u8, _len: usize) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_rounds_to_page() {
        let mem = ExecutableMemory::new(100).unwrap();
        assert!(mem.size() >= 100);
        assert_eq!(mem.size() % page_size(), 0);
        assert!(!mem.is_sealed());
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            ExecutableMemory::new(0),
            Err(MemoryError::InvalidSize)
        ));
    }

    #[test]
    fn test_write_then_seal() {
        let mut mem = ExecutableMemory::new(4096).unwrap();
        mem.write(0, &[0x90, 0x90, 0x90, 0x90]).unwrap();
        mem.seal().unwrap();
        assert!(mem.is_sealed());
        assert_eq!(&mem.as_slice()[..4], &[0x90, 0x90, 0x90, 0x90]);
    }

    #[test]
    fn test_plain_write_refused_after_seal() {
        let mut mem = ExecutableMemory::new(4096).unwrap();
        mem.seal().unwrap();
        assert!(mem.write(0, &[0x90]).is_err());
    }

    #[test]
    fn test_patch_reopens_and_reseals() {
        let mut mem = ExecutableMemory::new(4096).unwrap();
        mem.write(0, &[0x01, 0x02]).unwrap();
        mem.seal().unwrap();

        mem.patch(|bytes| {
            bytes[0] = 0xAA;
            bytes[1] = 0xBB;
        })
        .unwrap();

        assert!(mem.is_sealed());
        assert_eq!(&mem.as_slice()[..2], &[0xAA, 0xBB]);
    }
}
