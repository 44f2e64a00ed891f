//! # hwbuffer
//!
//! Cross-process hardware buffers for Linux: reference-counted memory that
//! CPU code, GPUs, codecs and sensors can share without copying.
//!
//! ## Features
//!
//! - **Shared by construction**: every buffer is a sealed memfd mapped with
//!   `MAP_SHARED`, so any process holding the descriptor sees the same pages
//! - **Per-process refcounting**: [`HardwareBuffer`] handles are cloned and
//!   dropped like `Arc`, and the memory goes back to its [`Allocator`] when the
//!   last one in this process is gone
//! - **Fenced CPU access**: [`HardwareBuffer::lock`] waits on an input
//!   [`Fence`] before handing out the mapped region
//! - **Handle transport**: [`ipc::send`] / [`ipc::receive`] pass buffers over a
//!   unix socket with `SCM_RIGHTS`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use hwbuffer::prelude::*;
//!
//! let desc = BufferDescriptor::new(64, 64, PixelFormat::R8G8B8A8Unorm)
//!     .with_usage(Usage::CPU_READ | Usage::CPU_WRITE);
//! let buffer = HardwareBuffer::allocate(&desc)?;
//!
//! let mut session = buffer.lock(Usage::CPU_WRITE, Fence::signaled(), None)?;
//! session.as_mut_slice().unwrap().fill(0xff);
//! let fence = session.unlock()?;
//!
//! let session = buffer.lock(Usage::CPU_READ, fence, None)?;
//! assert!(session.as_slice().iter().all(|&b| b == 0xff));
//! session.unlock()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod descriptor;
pub mod error;
pub mod fence;
pub mod format;
pub mod ipc;
pub mod lock;
pub mod memory;
pub mod observability;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buffer::HardwareBuffer;
    pub use crate::descriptor::{BufferDescriptor, Rect};
    pub use crate::error::{Error, Result};
    pub use crate::fence::Fence;
    pub use crate::format::{PixelFormat, Usage};
    pub use crate::lock::{ConflictPolicy, LockOptions, LockSession, LockState};
    pub use crate::memory::{Allocator, MemfdAllocator};
}

pub use buffer::HardwareBuffer;
pub use descriptor::{BufferDescriptor, BufferLayout, Rect};
pub use error::{
    AllocationError, Error, FenceError, LockError, Result, TransportError, UnlockError,
};
pub use fence::Fence;
pub use format::{PixelFormat, Usage};
pub use ipc::WireHandle;
pub use lock::{ConflictPolicy, LockOptions, LockSession, LockState};
pub use memory::{Allocator, AllocatorConfig, AllocatorStats, MemfdAllocator, MemoryHandle};
