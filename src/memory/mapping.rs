//! Process-local CPU mappings of memory handles.

use super::MemoryHandle;
use rustix::mm::{MapFlags, ProtFlags};
use std::ptr::NonNull;

/// A `MAP_SHARED` mapping of a [`MemoryHandle`].
///
/// Every process that maps the same handle sees the same physical pages.
/// The mapping is unmapped on drop.
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
    writable: bool,
}

impl Mapping {
    /// Map the whole buffer described by `handle`.
    ///
    /// Read-only mappings are created with `PROT_READ` only, so a stray
    /// write faults instead of corrupting shared memory.
    pub fn new(handle: &MemoryHandle, writable: bool) -> rustix::io::Result<Self> {
        let len = handle.size();
        let prot = if writable {
            ProtFlags::READ | ProtFlags::WRITE
        } else {
            ProtFlags::READ
        };

        // SAFETY: We request a fresh mapping (null hint) of a descriptor we
        // own; nothing else aliases the returned range yet.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                MapFlags::SHARED,
                handle.fd(),
                0,
            )?
        };

        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(rustix::io::Errno::NOMEM)?;

        Ok(Self { ptr, len, writable })
    }

    /// Base address of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the mapping is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Was the mapping created with write permission?
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("writable", &self.writable)
            .finish()
    }
}

// SAFETY: The mapping is plain shared memory. Access through the raw pointer
// is synchronized by lock sessions and fences, not by this type.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{BufferDescriptor, BufferLayout};

    fn handle(size: usize) -> MemoryHandle {
        let fd = rustix::fs::memfd_create("mapping-test", rustix::fs::MemfdFlags::CLOEXEC).unwrap();
        rustix::fs::ftruncate(&fd, size as u64).unwrap();
        let desc = BufferDescriptor::blob(size as u32);
        MemoryHandle::new(fd, desc, BufferLayout::for_descriptor(&desc, 1).unwrap())
    }

    #[test]
    fn test_two_mappings_share_pages() {
        let handle = handle(8192);
        let a = Mapping::new(&handle, true).unwrap();
        let b = Mapping::new(&handle, false).unwrap();
        assert_eq!(a.len(), 8192);
        assert!(a.is_writable());
        assert!(!b.is_writable());

        unsafe {
            a.as_ptr().as_ptr().add(100).write(0xAB);
            assert_eq!(b.as_ptr().as_ptr().add(100).read(), 0xAB);
        }
    }
}
