//! Error types for hardware buffer operations.
//!
//! Each operation family has its own error enum so callers can match on the
//! failure that is actually possible. [`Error`] wraps all of them for code
//! that just wants to propagate.

use crate::format::Usage;
use crate::lock::LockSession;
use thiserror::Error;

/// Result type alias using the crate-wide [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Umbrella error for callers that mix operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Allocation failed.
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    /// Lock failed.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Unlock failed.
    #[error(transparent)]
    Unlock(#[from] UnlockError),

    /// Sending or receiving a buffer failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A fence operation failed.
    #[error(transparent)]
    Fence(#[from] FenceError),
}

/// Errors from [`HardwareBuffer::allocate`](crate::HardwareBuffer::allocate).
///
/// Allocation never leaves a partially constructed buffer behind.
#[derive(Error, Debug)]
pub enum AllocationError {
    /// Zero dimensions, overflowing layout, or format-specific constraint violated.
    #[error("invalid buffer descriptor: {0}")]
    InvalidDescriptor(String),

    /// The format value is not one of the supported pixel formats.
    #[error("unsupported pixel format: {0:#x}")]
    UnsupportedFormat(u32),

    /// The usage combination is inconsistent or not supported by the allocator.
    #[error("unsupported usage {usage0:#x}/{usage1:#x}: {reason}")]
    UnsupportedUsage {
        /// Primary usage bits.
        usage0: u64,
        /// Reserved usage bits.
        usage1: u64,
        /// What is wrong with the combination.
        reason: &'static str,
    },

    /// The allocator could not reserve the memory.
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory {
        /// Requested size in bytes.
        size: usize,
    },

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

/// Errors from [`HardwareBuffer::lock`](crate::HardwareBuffer::lock).
#[derive(Error, Debug)]
pub enum LockError {
    /// The requested access is not CPU access, or the buffer was not
    /// allocated with the matching CPU usage bit.
    #[error("unsupported access {requested:?} for buffer usage {available:?}")]
    UnsupportedAccess {
        /// Usage bits passed to lock.
        requested: Usage,
        /// Usage bits the buffer was allocated with.
        available: Usage,
    },

    /// The region is empty or lies outside the buffer.
    #[error("invalid lock region: {0}")]
    InvalidRegion(String),

    /// The lock would overlap an open write session, or a write lock was
    /// requested while another session is open.
    ///
    /// Detection is opportunistic and limited to the calling process.
    #[error("conflicting lock: {readers} read and {writers} write sessions open")]
    Conflict {
        /// Open read-only sessions.
        readers: u32,
        /// Open write or read-write sessions.
        writers: u32,
    },

    /// The input fence did not signal within the configured timeout.
    #[error("timed out waiting for input fence")]
    Timeout,

    /// Waiting on the input fence failed.
    #[error("input fence: {0}")]
    Fence(#[from] FenceError),

    /// Mapping the buffer into this process failed.
    #[error("failed to map buffer: {0}")]
    Map(rustix::io::Errno),
}

/// Errors from [`HardwareBuffer::unlock`](crate::HardwareBuffer::unlock).
#[derive(Error, Debug)]
pub enum UnlockError {
    /// The session is not open on this buffer.
    #[error("lock session {} is not open on buffer {buffer}", .session.id())]
    InvalidState {
        /// The session, still open on the buffer it was locked on.
        session: LockSession,
        /// Buffer id the unlock was issued against.
        buffer: u64,
    },
}

impl UnlockError {
    /// Take back the session that failed to unlock.
    pub fn into_session(self) -> LockSession {
        match self {
            Self::InvalidState { session, .. } => session,
        }
    }
}

/// Errors from the handle transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The buffer handle cannot be sent or reconstructed.
    #[error("invalid buffer: {0}")]
    InvalidBuffer(String),

    /// The received payload is not a valid wire handle.
    #[error("malformed wire handle: {0}")]
    Malformed(String),

    /// I/O error on the socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

/// Errors from fence operations.
#[derive(Error, Debug)]
pub enum FenceError {
    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),

    /// I/O error from the async reactor.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The producer hung up without signaling.
    #[error("fence producer hung up without signaling")]
    Abandoned,
}
