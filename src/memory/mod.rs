//! Backing memory for hardware buffers.
//!
//! - [`MemoryHandle`]: owned memfd plus the descriptor and layout needed to map it
//! - [`Allocator`]: the allocate/free/import contract, with [`MemfdAllocator`]
//!   as the default implementation
//! - [`Mapping`]: a `MAP_SHARED` view of a handle in this process
//!
//! Every process that maps the same handle sees the same physical pages, so a
//! buffer handed to another process is shared, never copied.

mod allocator;
mod handle;
mod mapping;

pub use allocator::{
    Allocator, AllocatorConfig, AllocatorStats, DEFAULT_MAX_DIMENSION, DEFAULT_ROW_ALIGNMENT,
    MemfdAllocator, shared_allocator,
};
pub use handle::MemoryHandle;
pub use mapping::Mapping;
