//! Executable memory for the code arena
//!
//! A block is in exactly one of three states. Writing requires
//! [`NativeMemory::map_for_write`], which hands out the only mutable view and
//! drops execute permission; [`NativeMemory::map_for_execute`] drops write
//! permission again before anything may jump into the block.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NativeMemoryError {
    #[error("mapping {len} bytes failed: {source}")]
    Map { len: usize, source: std::io::Error },
    #[error("changing protection failed: {0}")]
    Protect(std::io::Error),
    #[error("allocator refused {len} bytes")]
    Exhausted { len: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protection {
    ReadOnly,
    Writable,
    Executable,
}

/// Granularity of host page protection
pub const NATIVE_PAGE_SIZE: usize = 0x1000;

pub trait NativeMemory: Send {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn protection(&self) -> Protection;

    fn make_read_only(&mut self) -> Result<(), NativeMemoryError>;

    /// Drop execute permission and return the writable view
    fn map_for_write(&mut self) -> Result<&mut [u8], NativeMemoryError>;

    /// Drop write permission and allow execution
    fn map_for_execute(&mut self) -> Result<(), NativeMemoryError>;

    /// Contents; readable in every state
    fn as_slice(&self) -> &[u8];

    fn as_ptr(&self) -> *const u8 {
        self.as_slice().as_ptr()
    }
}

pub trait NativeMemoryAllocator: Send {
    fn allocate(&self, len: usize) -> Result<Box<dyn NativeMemory>, NativeMemoryError>;

    /// Blocks really become executable, so native code may run from them
    fn is_native(&self) -> bool;
}

fn round_to_native(len: usize) -> usize {
    len.max(1).div_ceil(NATIVE_PAGE_SIZE) * NATIVE_PAGE_SIZE
}

#[cfg(unix)]
mod host {
    use super::*;
    use std::ptr::NonNull;

    /// Anonymous `mmap` region
    pub struct MmapMemory {
        ptr: NonNull<u8>,
        len: usize,
        protection: Protection,
    }

    // The mapping is owned exclusively by this value
    unsafe impl Send for MmapMemory {}

    impl MmapMemory {
        pub fn new(len: usize) -> Result<Self, NativeMemoryError> {
            let len = round_to_native(len);
            // SAFETY: anonymous private mapping with no address hint
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(NativeMemoryError::Map {
                    len,
                    source: std::io::Error::last_os_error(),
                });
            }
            let ptr = NonNull::new(ptr as *mut u8).ok_or(NativeMemoryError::Exhausted { len })?;
            Ok(MmapMemory {
                ptr,
                len,
                protection: Protection::ReadOnly,
            })
        }

        fn protect(&mut self, prot: libc::c_int, protection: Protection) -> Result<(), NativeMemoryError> {
            if self.protection == protection {
                return Ok(());
            }
            // SAFETY: the range is exactly the mapping created in `new`
            let rc = unsafe { libc::mprotect(self.ptr.as_ptr() as *mut libc::c_void, self.len, prot) };
            if rc != 0 {
                return Err(NativeMemoryError::Protect(std::io::Error::last_os_error()));
            }
            self.protection = protection;
            Ok(())
        }
    }

    impl NativeMemory for MmapMemory {
        fn len(&self) -> usize {
            self.len
        }

        fn protection(&self) -> Protection {
            self.protection
        }

        fn make_read_only(&mut self) -> Result<(), NativeMemoryError> {
            self.protect(libc::PROT_READ, Protection::ReadOnly)
        }

        fn map_for_write(&mut self) -> Result<&mut [u8], NativeMemoryError> {
            self.protect(libc::PROT_READ | libc::PROT_WRITE, Protection::Writable)?;
            // SAFETY: mapped read/write, and `&mut self` makes this the only view
            Ok(unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) })
        }

        fn map_for_execute(&mut self) -> Result<(), NativeMemoryError> {
            self.protect(libc::PROT_READ | libc::PROT_EXEC, Protection::Executable)
        }

        fn as_slice(&self) -> &[u8] {
            // SAFETY: every state keeps PROT_READ
            unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
        }
    }

    impl Drop for MmapMemory {
        fn drop(&mut self) {
            // SAFETY: unmapping the region created in `new`
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
            }
        }
    }

    pub struct HostAllocator;

    impl NativeMemoryAllocator for HostAllocator {
        fn allocate(&self, len: usize) -> Result<Box<dyn NativeMemory>, NativeMemoryError> {
            Ok(Box::new(MmapMemory::new(len)?))
        }

        fn is_native(&self) -> bool {
            true
        }
    }
}

#[cfg(unix)]
pub use host::{HostAllocator, MmapMemory};

/// Heap buffer that tracks the protection state without enforcing it.
/// Good for code that is interpreted rather than jumped into.
pub struct HeapMemory {
    bytes: Vec<u8>,
    protection: Protection,
}

impl HeapMemory {
    pub fn new(len: usize) -> Self {
        HeapMemory {
            bytes: vec![0; round_to_native(len)],
            protection: Protection::ReadOnly,
        }
    }
}

impl NativeMemory for HeapMemory {
    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn protection(&self) -> Protection {
        self.protection
    }

    fn make_read_only(&mut self) -> Result<(), NativeMemoryError> {
        self.protection = Protection::ReadOnly;
        Ok(())
    }

    fn map_for_write(&mut self) -> Result<&mut [u8], NativeMemoryError> {
        self.protection = Protection::Writable;
        Ok(&mut self.bytes)
    }

    fn map_for_execute(&mut self) -> Result<(), NativeMemoryError> {
        self.protection = Protection::Executable;
        Ok(())
    }

    fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

pub struct HeapAllocator;

impl NativeMemoryAllocator for HeapAllocator {
    fn allocate(&self, len: usize) -> Result<Box<dyn NativeMemory>, NativeMemoryError> {
        Ok(Box::new(HeapMemory::new(len)))
    }

    fn is_native(&self) -> bool {
        false
    }
}

/// Best allocator for this host
pub fn default_allocator() -> Box<dyn NativeMemoryAllocator> {
    #[cfg(unix)]
    {
        Box::new(HostAllocator)
    }
    #[cfg(not(unix))]
    {
        Box::new(HeapAllocator)
    }
}
