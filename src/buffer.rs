//! Reference-counted hardware buffers.
//!
//! A [`HardwareBuffer`] is a handle to one buffer object in this process.
//! Cloning it (or calling [`acquire`](HardwareBuffer::acquire)) adds a
//! reference; dropping it (or calling [`release`](HardwareBuffer::release))
//! removes one. When the last reference in this process goes away the CPU
//! mapping is unmapped and the memory handle goes back to its allocator.
//!
//! Reference counts are per process. A buffer received from another process
//! starts with its own count of 1 and its own duplicate of the memory handle,
//! so the two sides release independently.
//!
//! # Example
//!
//! ```rust,ignore
//! use hwbuffer::prelude::*;
//!
//! let desc = BufferDescriptor::new(64, 64, PixelFormat::R8G8B8A8Unorm)
//!     .with_usage(Usage::CPU_READ | Usage::CPU_WRITE);
//! let buffer = HardwareBuffer::allocate(&desc)?;
//!
//! let second = buffer.acquire();
//! assert_eq!(buffer.ref_count(), 2);
//! second.release();
//! ```

use crate::descriptor::{BufferDescriptor, BufferLayout};
use crate::error::AllocationError;
use crate::format::Usage;
use crate::lock::LockTable;
use crate::memory::{Allocator, MemoryHandle, shared_allocator};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Global counter for buffer ids.
static BUFFER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_buffer_id() -> u64 {
    BUFFER_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Shared state behind every reference to one buffer.
pub(crate) struct BufferInner {
    refcount: AtomicU32,
    id: u64,
    handle: MemoryHandle,
    allocator: Arc<dyn Allocator>,
    locks: Mutex<LockTable>,
}

impl BufferInner {
    #[inline]
    fn inc_ref(&self) {
        let old = self.refcount.fetch_add(1, Ordering::Relaxed);
        if old > i32::MAX as u32 {
            // Leaked references on this scale cannot be recovered from.
            std::process::abort();
        }
    }

    /// Returns true if this was the last reference.
    #[inline]
    fn dec_ref(&self) -> bool {
        let old = self.refcount.fetch_sub(1, Ordering::Release);
        debug_assert!(old > 0, "refcount underflow");
        old == 1
    }
}

/// A reference-counted, cross-process shareable memory buffer.
pub struct HardwareBuffer {
    inner: NonNull<BufferInner>,
}

impl HardwareBuffer {
    /// Allocate a buffer from the process-wide memfd allocator.
    ///
    /// The new buffer has a reference count of 1. On failure nothing is left
    /// allocated.
    pub fn allocate(desc: &BufferDescriptor) -> Result<Self, AllocationError> {
        Self::allocate_with(shared_allocator(), desc)
    }

    /// Allocate a buffer from a specific allocator.
    pub fn allocate_with(
        allocator: Arc<dyn Allocator>,
        desc: &BufferDescriptor,
    ) -> Result<Self, AllocationError> {
        let handle = allocator.allocate(desc)?;
        let buffer = Self::from_handle(allocator, handle);
        tracing::debug!(
            buffer = buffer.id(),
            size = buffer.size(),
            stride = buffer.stride(),
            "allocated hardware buffer"
        );
        Ok(buffer)
    }

    /// Wrap a handle the allocator has already accounted for.
    pub(crate) fn from_handle(allocator: Arc<dyn Allocator>, handle: MemoryHandle) -> Self {
        let inner = Box::new(BufferInner {
            refcount: AtomicU32::new(1),
            id: next_buffer_id(),
            handle,
            allocator,
            locks: Mutex::new(LockTable::default()),
        });
        Self {
            inner: NonNull::from(Box::leak(inner)),
        }
    }

    #[inline]
    pub(crate) fn inner(&self) -> &BufferInner {
        // SAFETY: inner stays valid while any reference exists, and self is one.
        unsafe { self.inner.as_ref() }
    }

    /// Take another reference to the same buffer.
    ///
    /// Equivalent to [`Clone::clone`]. Never fails.
    #[inline]
    pub fn acquire(&self) -> Self {
        self.clone()
    }

    /// Give this reference back.
    ///
    /// Equivalent to dropping it. Releasing the last reference frees the
    /// memory handle.
    #[inline]
    pub fn release(self) {}

    /// Number of references to this buffer held in this process.
    ///
    /// The value may be stale by the time it is read if other threads are
    /// acquiring or releasing concurrently.
    pub fn ref_count(&self) -> u32 {
        self.inner().refcount.load(Ordering::Acquire)
    }

    /// Process-local buffer id, used in logs and error messages.
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner().id
    }

    /// The descriptor the buffer was allocated with.
    #[inline]
    pub fn describe(&self) -> BufferDescriptor {
        *self.inner().handle.descriptor()
    }

    /// Usage flags.
    #[inline]
    pub fn usage(&self) -> Usage {
        self.inner().handle.descriptor().usage
    }

    /// Byte layout.
    #[inline]
    pub fn layout(&self) -> BufferLayout {
        *self.inner().handle.layout()
    }

    /// Row stride in bytes.
    #[inline]
    pub fn stride(&self) -> usize {
        self.inner().handle.layout().stride
    }

    /// Total size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.inner().handle.size()
    }

    /// Borrow the native memory handle.
    ///
    /// The handle stays owned by the buffer. Use
    /// [`MemoryHandle::try_clone`] to keep it past the buffer's lifetime.
    #[inline]
    pub fn native_handle(&self) -> &MemoryHandle {
        &self.inner().handle
    }

    /// The allocator that will free this buffer.
    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.inner().allocator
    }

    /// True if both handles refer to the same buffer object in this process.
    #[inline]
    pub fn same_buffer(&self, other: &HardwareBuffer) -> bool {
        self.inner == other.inner
    }

    pub(crate) fn lock_table(&self) -> MutexGuard<'_, LockTable> {
        self.inner()
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clone for HardwareBuffer {
    fn clone(&self) -> Self {
        self.inner().inc_ref();
        Self { inner: self.inner }
    }
}

impl Drop for HardwareBuffer {
    fn drop(&mut self) {
        if !self.inner().dec_ref() {
            return;
        }
        atomic::fence(Ordering::Acquire);

        // SAFETY: this was the last reference; nothing else can reach inner.
        let inner = unsafe { Box::from_raw(self.inner.as_ptr()) };
        let BufferInner {
            id,
            handle,
            allocator,
            locks,
            ..
        } = *inner;

        let mut table = locks.into_inner().unwrap_or_else(PoisonError::into_inner);
        let leaked = table.open_sessions();
        if leaked > 0 {
            tracing::warn!(buffer = id, sessions = leaked, "buffer freed with lock sessions open");
        }
        // Unmap before the memory goes back to the allocator.
        drop(table.take_mapping());

        tracing::debug!(buffer = id, size = handle.size(), "freeing hardware buffer");
        allocator.free(handle);
    }
}

impl fmt::Debug for HardwareBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareBuffer")
            .field("id", &self.id())
            .field("descriptor", &self.describe())
            .field("stride", &self.stride())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

// SAFETY: BufferInner only holds Send + Sync state (atomics, a mutex, an owned
// fd, an Arc<dyn Allocator> whose trait requires Send + Sync), and it is freed
// exactly once by the last reference.
unsafe impl Send for HardwareBuffer {}
unsafe impl Sync for HardwareBuffer {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelFormat;
    use crate::memory::MemfdAllocator;
    use std::thread;

    fn desc() -> BufferDescriptor {
        BufferDescriptor::new(32, 16, PixelFormat::R8G8B8A8Unorm)
            .with_usage(Usage::CPU_READ | Usage::CPU_WRITE)
    }

    #[test]
    fn test_allocate_describe() {
        let buffer = HardwareBuffer::allocate(&desc()).unwrap();
        assert_eq!(buffer.describe(), desc());
        assert_eq!(buffer.ref_count(), 1);
        assert_eq!(buffer.stride(), 128);
        assert_eq!(buffer.size(), 128 * 16);
        assert_eq!(buffer.native_handle().size(), buffer.size());
    }

    #[test]
    fn test_acquire_release_frees_on_last() {
        let alloc = Arc::new(MemfdAllocator::new());
        let buffer = HardwareBuffer::allocate_with(alloc.clone(), &desc()).unwrap();

        let refs: Vec<_> = (0..5).map(|_| buffer.acquire()).collect();
        assert_eq!(buffer.ref_count(), 6);
        assert!(refs.iter().all(|r| r.same_buffer(&buffer)));

        for r in refs {
            r.release();
        }
        assert_eq!(buffer.ref_count(), 1);
        assert_eq!(alloc.stats().live_handles, 1);

        buffer.release();
        let stats = alloc.stats();
        assert_eq!(stats.frees, 1);
        assert_eq!(stats.live_handles, 0);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let alloc = Arc::new(MemfdAllocator::new());
        let buffer = HardwareBuffer::allocate_with(alloc.clone(), &desc()).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = buffer.acquire();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let extra = b.acquire();
                        extra.release();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(buffer.ref_count(), 1);
        drop(buffer);
        assert_eq!(alloc.stats().live_handles, 0);
    }

    #[test]
    fn test_failed_allocation_leaves_nothing() {
        let alloc = Arc::new(MemfdAllocator::new());
        let bad = BufferDescriptor::new(0, 16, PixelFormat::R8G8B8A8Unorm);
        assert!(HardwareBuffer::allocate_with(alloc.clone(), &bad).is_err());
        assert_eq!(alloc.stats().allocations, 0);
    }

    #[test]
    fn test_distinct_buffers() {
        let a = HardwareBuffer::allocate(&desc()).unwrap();
        let b = HardwareBuffer::allocate(&desc()).unwrap();
        assert!(!a.same_buffer(&b));
        assert_ne!(a.id(), b.id());
    }
}
