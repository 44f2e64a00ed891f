//! CPU lock sessions.
//!
//! Locking maps the buffer into this process (once per buffer) and hands out
//! a [`LockSession`] that points at the requested region. The lock waits on
//! the caller's input fence first, so a producer that is still writing
//! (a GPU, a codec, another process) finishes before the CPU looks.
//!
//! Per buffer, sessions move through:
//!
//! ```text
//! Unlocked --lock(read)--> SharedRead(n) --unlock--> ... --> Unlocked
//! Unlocked --lock(write)-> Exclusive ------unlock----------> Unlocked
//! ```
//!
//! Opening a write session while any other session is open, or a read
//! session while a write session is open, is a caller error. Under
//! [`ConflictPolicy::Report`] it is rejected with [`LockError::Conflict`];
//! under [`ConflictPolicy::Permit`] it proceeds and the contents of the region
//! are indeterminate. Either way nothing blocks. Detection only sees sessions
//! opened in this process.
//!
//! `Permit` lets two sessions hand out overlapping slices, so it can only be
//! selected through the `unsafe` [`LockOptions::with_conflict`].

use crate::buffer::HardwareBuffer;
use crate::descriptor::{BufferDescriptor, BufferLayout, Rect};
use crate::error::{LockError, UnlockError};
use crate::fence::Fence;
use crate::format::Usage;
use crate::memory::{Mapping, MemoryHandle};
use crate::observability::span_buffer_op;
use smallvec::SmallVec;
use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicU64, Ordering};
use std::time::Duration;

/// Global counter for lock session ids.
static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_session_id() -> u64 {
    SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// What to do when a lock would overlap a write session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Fail with [`LockError::Conflict`].
    #[default]
    Report,
    /// Log a warning and open the session anyway.
    Permit,
}

/// Options for [`HardwareBuffer::lock_with_options`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockOptions {
    /// Longest time to wait for the input fence. `None` waits forever.
    pub timeout: Option<Duration>,
    conflict: ConflictPolicy,
}

impl LockOptions {
    /// Bound the input fence wait.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the conflict policy.
    ///
    /// # Safety
    ///
    /// With [`ConflictPolicy::Permit`], sessions opened over a conflict share
    /// bytes with a write session. The caller must not hold slices from
    /// overlapping sessions ([`LockSession::as_slice`],
    /// [`LockSession::as_mut_slice`]) while either side writes through the
    /// other.
    pub unsafe fn with_conflict(mut self, conflict: ConflictPolicy) -> Self {
        self.conflict = conflict;
        self
    }

    /// Configured conflict policy.
    pub fn conflict(&self) -> ConflictPolicy {
        self.conflict
    }
}

/// Lock state of a buffer, as seen from this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// No sessions open.
    Unlocked,
    /// Only read sessions open.
    SharedRead(u32),
    /// At least one write session open.
    Exclusive {
        /// Open write sessions. More than one means a permitted conflict.
        writers: u32,
        /// Read sessions open alongside.
        readers: u32,
    },
}

#[derive(Debug, Clone, Copy)]
struct OpenSession {
    id: u64,
    exclusive: bool,
}

/// Per-buffer lock bookkeeping. Lives inside the buffer behind a mutex.
#[derive(Debug, Default)]
pub(crate) struct LockTable {
    mapping: Option<Mapping>,
    open: SmallVec<[OpenSession; 4]>,
}

impl LockTable {
    fn counts(&self) -> (u32, u32) {
        self.open.iter().fold((0, 0), |(readers, writers), s| {
            if s.exclusive {
                (readers, writers + 1)
            } else {
                (readers + 1, writers)
            }
        })
    }

    fn state(&self) -> LockState {
        match self.counts() {
            (0, 0) => LockState::Unlocked,
            (readers, 0) => LockState::SharedRead(readers),
            (readers, writers) => LockState::Exclusive { writers, readers },
        }
    }

    fn base(&mut self, handle: &MemoryHandle, writable: bool) -> Result<NonNull<u8>, LockError> {
        if let Some(mapping) = &self.mapping {
            return Ok(mapping.as_ptr());
        }
        let mapping = Mapping::new(handle, writable).map_err(LockError::Map)?;
        let base = mapping.as_ptr();
        self.mapping = Some(mapping);
        Ok(base)
    }

    fn close(&mut self, id: u64) -> bool {
        match self.open.iter().position(|s| s.id == id) {
            Some(index) => {
                self.open.swap_remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn open_sessions(&self) -> usize {
        self.open.len()
    }

    pub(crate) fn take_mapping(&mut self) -> Option<Mapping> {
        self.mapping.take()
    }
}

/// An open CPU lock on a buffer region.
///
/// The session keeps a reference to its buffer. Close it with
/// [`unlock`](Self::unlock) or [`HardwareBuffer::unlock`]. Dropping an open
/// session leaks its bookkeeping until the buffer is freed.
pub struct LockSession {
    buffer: HardwareBuffer,
    id: u64,
    access: Usage,
    region: Option<Rect>,
    ptr: NonNull<u8>,
    len: usize,
    unlocked: bool,
}

impl LockSession {
    /// Session id, unique within this process.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The locked buffer.
    #[inline]
    pub fn buffer(&self) -> &HardwareBuffer {
        &self.buffer
    }

    /// Address of the first byte of the region: pixel `(left, top)` of
    /// layer 0, or the start of the buffer for a whole-buffer lock.
    #[inline]
    pub fn address(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Bytes from [`address`](Self::address) to the last byte of the region.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the session covers no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Access requested when locking.
    #[inline]
    pub fn access(&self) -> Usage {
        self.access
    }

    /// Locked region. `None` is the whole buffer.
    #[inline]
    pub fn region(&self) -> Option<Rect> {
        self.region
    }

    /// Row stride of the underlying buffer.
    #[inline]
    pub fn stride(&self) -> usize {
        self.buffer.stride()
    }

    /// The locked bytes.
    ///
    /// For a sub-rectangle this includes the row padding between rows;
    /// only the columns inside the rectangle belong to the session.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr..ptr+len lies inside the buffer's mapping, which lives
        // as long as the buffer reference this session holds.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The locked bytes, writable. `None` for read-only sessions.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        if !self.access.can_cpu_write() {
            return None;
        }
        // SAFETY: as for as_slice; write sessions always map read-write.
        Some(unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) })
    }

    /// Close the session. See [`HardwareBuffer::unlock`].
    pub fn unlock(self) -> Result<Fence, UnlockError> {
        let buffer = self.buffer.clone();
        buffer.unlock(self)
    }
}

impl Drop for LockSession {
    fn drop(&mut self) {
        if !self.unlocked {
            tracing::warn!(
                buffer = self.buffer.id(),
                session = self.id,
                "lock session dropped without unlock"
            );
        }
    }
}

impl std::fmt::Debug for LockSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockSession")
            .field("id", &self.id)
            .field("buffer", &self.buffer.id())
            .field("access", &self.access)
            .field("region", &self.region)
            .field("len", &self.len)
            .finish()
    }
}

// SAFETY: the raw pointer refers to the buffer's shared mapping, which is
// itself Send + Sync and outlives the session.
unsafe impl Send for LockSession {}
unsafe impl Sync for LockSession {}

impl HardwareBuffer {
    /// Lock a region for CPU access.
    ///
    /// `usage` must contain only CPU read/write bits that the buffer was
    /// allocated with. The call blocks until `fence` signals; pass
    /// [`Fence::signaled()`] to skip the wait. `rect` of `None` locks the
    /// whole buffer.
    pub fn lock(
        &self,
        usage: Usage,
        fence: Fence,
        rect: Option<Rect>,
    ) -> Result<LockSession, LockError> {
        self.lock_with_options(usage, fence, rect, LockOptions::default())
    }

    /// Lock with a fence timeout and conflict policy.
    ///
    /// On [`LockError::Timeout`] no session is opened.
    pub fn lock_with_options(
        &self,
        usage: Usage,
        fence: Fence,
        rect: Option<Rect>,
        options: LockOptions,
    ) -> Result<LockSession, LockError> {
        let _span = span_buffer_op("lock", self.id()).entered();

        check_access(usage, self.usage())?;
        let (offset, len) = region_span(&self.describe(), &self.layout(), rect)?;
        let exclusive = usage.can_cpu_write();

        wait_for(&fence, options.timeout)?;
        fence.close();

        let mut table = self.lock_table();
        let (readers, writers) = table.counts();
        let conflicting = writers > 0 || (exclusive && readers > 0);
        if conflicting {
            match options.conflict {
                ConflictPolicy::Report => {
                    return Err(LockError::Conflict { readers, writers });
                }
                ConflictPolicy::Permit => tracing::warn!(
                    buffer = self.id(),
                    readers,
                    writers,
                    exclusive,
                    "lock opened over a write conflict"
                ),
            }
        }

        let base = table.base(self.native_handle(), self.usage().can_cpu_write())?;
        let id = next_session_id();
        table.open.push(OpenSession { id, exclusive });
        drop(table);

        // Pairs with the release fence in unlock, possibly in another process.
        atomic::fence(Ordering::Acquire);
        tracing::trace!(buffer = self.id(), session = id, ?usage, ?rect, "locked");

        Ok(LockSession {
            buffer: self.clone(),
            id,
            access: usage,
            region: rect,
            // SAFETY: region_span keeps offset + len within the buffer size.
            ptr: unsafe { base.add(offset) },
            len,
            unlocked: false,
        })
    }

    /// Close a lock session and get a fence for the written data.
    ///
    /// CPU writes through the mapping are visible to other mappings once
    /// this returns, so the fence is always already signaled.
    ///
    /// A session that is not open on this buffer comes back inside
    /// [`UnlockError::InvalidState`] and can be unlocked on its own buffer.
    pub fn unlock(&self, mut session: LockSession) -> Result<Fence, UnlockError> {
        let _span = span_buffer_op("unlock", self.id()).entered();

        if !session.buffer.same_buffer(self) || !self.lock_table().close(session.id) {
            return Err(UnlockError::InvalidState {
                session,
                buffer: self.id(),
            });
        }

        atomic::fence(Ordering::Release);
        session.unlocked = true;
        tracing::trace!(buffer = self.id(), session = session.id, "unlocked");
        Ok(Fence::signaled())
    }

    /// Current lock state in this process.
    pub fn lock_state(&self) -> LockState {
        self.lock_table().state()
    }
}

fn check_access(requested: Usage, available: Usage) -> Result<(), LockError> {
    let unsupported = || LockError::UnsupportedAccess {
        requested,
        available,
    };

    if !Usage::CPU_MASK.contains(requested) {
        return Err(unsupported());
    }
    if !requested.can_cpu_read() && !requested.can_cpu_write() {
        return Err(unsupported());
    }
    if requested.can_cpu_read() && !available.can_cpu_read() {
        return Err(unsupported());
    }
    if requested.can_cpu_write() && !available.can_cpu_write() {
        return Err(unsupported());
    }
    Ok(())
}

/// Byte offset and length of a lock region.
fn region_span(
    desc: &BufferDescriptor,
    layout: &BufferLayout,
    rect: Option<Rect>,
) -> Result<(usize, usize), LockError> {
    let Some(rect) = rect else {
        return Ok((0, layout.size));
    };

    if rect.is_empty() {
        return Err(LockError::InvalidRegion(format!("empty rectangle {rect:?}")));
    }
    if !rect.fits_within(desc.width, desc.height) {
        return Err(LockError::InvalidRegion(format!(
            "{rect:?} exceeds {}x{}",
            desc.width, desc.height
        )));
    }

    let bpp = desc.format.bytes_per_pixel();
    let start = rect.top as usize * layout.stride + rect.left as usize * bpp;
    let end = (rect.bottom as usize - 1) * layout.stride + rect.right as usize * bpp;
    Ok((start, end - start))
}

fn wait_for(fence: &Fence, timeout: Option<Duration>) -> Result<(), LockError> {
    if fence.is_trivially_signaled() {
        return Ok(());
    }
    let Some(timeout) = timeout else {
        return Ok(fence.wait()?);
    };
    if fence.wait_timeout(timeout)? {
        Ok(())
    } else {
        Err(LockError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelFormat;

    fn rgba(width: u32, height: u32, usage: Usage) -> HardwareBuffer {
        let desc = BufferDescriptor::new(width, height, PixelFormat::R8G8B8A8Unorm).with_usage(usage);
        HardwareBuffer::allocate(&desc).unwrap()
    }

    #[test]
    fn test_region_span() {
        let desc = BufferDescriptor::new(10, 10, PixelFormat::R8G8B8A8Unorm);
        let layout = BufferLayout::for_descriptor(&desc, 64).unwrap();
        assert_eq!(layout.stride, 64);

        assert_eq!(region_span(&desc, &layout, None).unwrap(), (0, 640));
        // Row 2, column 3 through row 4, column 5 (exclusive).
        let rect = Rect::new(3, 2, 5, 5);
        assert_eq!(region_span(&desc, &layout, Some(rect)).unwrap(), (140, 2 * 64 + 8));
    }

    #[test]
    fn test_region_span_rejects_bad_rects() {
        let desc = BufferDescriptor::new(10, 10, PixelFormat::R8G8B8A8Unorm);
        let layout = BufferLayout::for_descriptor(&desc, 1).unwrap();
        for rect in [Rect::new(2, 2, 2, 5), Rect::new(0, 0, 11, 1), Rect::new(0, 9, 1, 11)] {
            assert!(matches!(
                region_span(&desc, &layout, Some(rect)),
                Err(LockError::InvalidRegion(_))
            ));
        }
    }

    #[test]
    fn test_check_access() {
        let rw = Usage::CPU_READ | Usage::CPU_WRITE;
        check_access(Usage::CPU_READ, rw).unwrap();
        check_access(Usage::CPU_WRITE_OFTEN, Usage::CPU_WRITE).unwrap();
        check_access(Usage::CPU_READ, Usage::CPU_READ_OFTEN).unwrap();
        assert!(check_access(Usage::CPU_WRITE, Usage::CPU_READ).is_err());
        assert!(check_access(Usage::GPU_SAMPLED_IMAGE, rw | Usage::GPU_SAMPLED_IMAGE).is_err());
        assert!(check_access(Usage::empty(), rw).is_err());
    }

    #[test]
    fn test_lock_state_transitions() {
        let buffer = rgba(8, 8, Usage::CPU_READ | Usage::CPU_WRITE);
        assert_eq!(buffer.lock_state(), LockState::Unlocked);

        let r1 = buffer.lock(Usage::CPU_READ, Fence::signaled(), None).unwrap();
        let r2 = buffer.lock(Usage::CPU_READ, Fence::signaled(), None).unwrap();
        assert_eq!(buffer.lock_state(), LockState::SharedRead(2));
        assert_eq!(buffer.ref_count(), 3);

        r1.unlock().unwrap();
        assert_eq!(buffer.lock_state(), LockState::SharedRead(1));
        r2.unlock().unwrap();
        assert_eq!(buffer.lock_state(), LockState::Unlocked);

        let w = buffer.lock(Usage::CPU_WRITE, Fence::signaled(), None).unwrap();
        assert_eq!(
            buffer.lock_state(),
            LockState::Exclusive {
                writers: 1,
                readers: 0
            }
        );
        let fence = buffer.unlock(w).unwrap();
        assert!(fence.is_signaled().unwrap());
        assert_eq!(buffer.lock_state(), LockState::Unlocked);
        assert_eq!(buffer.ref_count(), 1);
    }

    #[test]
    fn test_conflict_report_and_permit() {
        let buffer = rgba(8, 8, Usage::CPU_READ | Usage::CPU_WRITE);
        let w = buffer.lock(Usage::CPU_WRITE, Fence::signaled(), None).unwrap();

        let err = buffer.lock(Usage::CPU_WRITE, Fence::signaled(), None).unwrap_err();
        assert!(matches!(err, LockError::Conflict { readers: 0, writers: 1 }));
        let err = buffer.lock(Usage::CPU_READ, Fence::signaled(), None).unwrap_err();
        assert!(matches!(err, LockError::Conflict { readers: 0, writers: 1 }));

        // SAFETY: no slices are taken from any of these sessions.
        let permit = unsafe { LockOptions::default().with_conflict(ConflictPolicy::Permit) };
        assert_eq!(permit.conflict(), ConflictPolicy::Permit);
        let r = buffer
            .lock_with_options(Usage::CPU_READ, Fence::signaled(), None, permit)
            .unwrap();
        let w2 = buffer
            .lock_with_options(Usage::CPU_WRITE, Fence::signaled(), None, permit)
            .unwrap();
        assert_eq!(
            buffer.lock_state(),
            LockState::Exclusive {
                writers: 2,
                readers: 1
            }
        );

        for session in [w, r, w2] {
            session.unlock().unwrap();
        }
        assert_eq!(buffer.lock_state(), LockState::Unlocked);
    }

    #[test]
    fn test_reader_waits_out_writer() {
        let buffer = rgba(8, 8, Usage::CPU_READ | Usage::CPU_WRITE);
        let mut w = buffer.lock(Usage::CPU_WRITE, Fence::signaled(), None).unwrap();
        w.as_mut_slice().unwrap()[0] = 0x77;

        // No read slice can exist next to the live write slice.
        assert!(matches!(
            buffer.lock(Usage::CPU_READ, Fence::signaled(), None),
            Err(LockError::Conflict { readers: 0, writers: 1 })
        ));
        assert_eq!(buffer.ref_count(), 2);

        w.unlock().unwrap();
        let r = buffer.lock(Usage::CPU_READ, Fence::signaled(), None).unwrap();
        assert_eq!(r.as_slice()[0], 0x77);
        r.unlock().unwrap();
    }

    #[test]
    fn test_unlock_on_wrong_buffer() {
        let a = rgba(8, 8, Usage::CPU_READ | Usage::CPU_WRITE);
        let b = rgba(8, 8, Usage::CPU_READ | Usage::CPU_WRITE);
        let session = a.lock(Usage::CPU_WRITE, Fence::signaled(), None).unwrap();
        let id = session.id();

        let err = b.unlock(session).unwrap_err();
        assert!(matches!(
            &err,
            UnlockError::InvalidState { session, buffer } if session.id() == id && *buffer == b.id()
        ));
        assert_eq!(b.lock_state(), LockState::Unlocked);

        // The session comes back and closes on its own buffer.
        let session = err.into_session();
        a.unlock(session).unwrap();
        assert_eq!(a.lock_state(), LockState::Unlocked);
        let w = a.lock(Usage::CPU_WRITE, Fence::signaled(), None).unwrap();
        w.unlock().unwrap();
        assert_eq!(a.ref_count(), 1);
    }

    #[test]
    fn test_read_session_has_no_mut_slice() {
        let buffer = rgba(4, 4, Usage::CPU_READ | Usage::CPU_WRITE);
        let mut session = buffer.lock(Usage::CPU_READ, Fence::signaled(), None).unwrap();
        assert!(session.as_mut_slice().is_none());
        assert_eq!(session.as_slice().len(), buffer.size());
        session.unlock().unwrap();
    }

    #[test]
    fn test_lock_timeout_opens_nothing() {
        let buffer = rgba(4, 4, Usage::CPU_READ);
        let fence = Fence::new().unwrap();
        let options = LockOptions::default().with_timeout(Duration::from_millis(10));

        let err = buffer
            .lock_with_options(Usage::CPU_READ, fence, None, options)
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout));
        assert_eq!(buffer.lock_state(), LockState::Unlocked);
        assert_eq!(buffer.ref_count(), 1);
    }
}
