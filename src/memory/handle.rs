//! Memory handles: the OS-level backing of a hardware buffer.

use crate::descriptor::{BufferDescriptor, BufferLayout};
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// An owned descriptor for a buffer's physical memory plus the metadata
/// needed to map it without re-allocating.
///
/// A handle is never implicitly copied. [`try_clone`](Self::try_clone)
/// duplicates the descriptor explicitly and dropping the handle (or calling
/// [`close`](Self::close)) closes it.
#[derive(Debug)]
pub struct MemoryHandle {
    /// The memory file descriptor (a memfd for the default allocator).
    fd: OwnedFd,
    /// What the memory was allocated for.
    descriptor: BufferDescriptor,
    /// How the bytes are laid out.
    layout: BufferLayout,
}

impl MemoryHandle {
    /// Wrap an existing descriptor.
    ///
    /// The caller guarantees that `fd` refers to at least `layout.size`
    /// bytes of mappable memory.
    pub fn new(fd: OwnedFd, descriptor: BufferDescriptor, layout: BufferLayout) -> Self {
        Self {
            fd,
            descriptor,
            layout,
        }
    }

    /// Duplicate the handle. Both handles refer to the same physical memory.
    pub fn try_clone(&self) -> rustix::io::Result<Self> {
        Ok(Self {
            fd: rustix::io::fcntl_dupfd_cloexec(&self.fd, 0)?,
            descriptor: self.descriptor,
            layout: self.layout,
        })
    }

    /// Close the handle.
    pub fn close(self) {}

    /// Size of the backing object as reported by the kernel.
    pub fn backing_size(&self) -> rustix::io::Result<u64> {
        let stat = rustix::fs::fstat(&self.fd)?;
        Ok(stat.st_size.max(0) as u64)
    }

    /// The buffer descriptor.
    #[inline]
    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.descriptor
    }

    /// The memory layout.
    #[inline]
    pub fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    /// Size of the buffer in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.layout.size
    }

    /// Borrow the file descriptor.
    #[inline]
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Get the raw file descriptor.
    #[inline]
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Take the file descriptor, discarding the metadata.
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

impl AsFd for MemoryHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
