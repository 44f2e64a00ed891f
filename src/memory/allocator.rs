//! The allocator collaborator and its memfd-backed default.
//!
//! An [`Allocator`] turns a [`BufferDescriptor`] into a [`MemoryHandle`] and
//! takes it back when the last reference in this process is gone. Handles
//! that arrive from another process are registered with
//! [`Allocator::import`] so the same allocator frees them.
//!
//! [`MemfdAllocator`] backs every buffer with an anonymous memfd:
//!
//! - `memfd_create` + `ftruncate` reserve the memory
//! - optional `F_SEAL_SHRINK | F_SEAL_GROW | F_SEAL_SEAL` make the size
//!   trustworthy for receivers
//! - the fd can be passed to other processes with `SCM_RIGHTS`

use super::MemoryHandle;
use crate::descriptor::{BufferDescriptor, BufferLayout};
use crate::error::AllocationError;
use crate::format::{PixelFormat, Usage};
use rustix::fs::{MemfdFlags, SealFlags};
use rustix::io::Errno;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Default row alignment in bytes.
pub const DEFAULT_ROW_ALIGNMENT: usize = 64;

/// Default upper bound for width and height.
pub const DEFAULT_MAX_DIMENSION: u32 = 16384;

/// Source of physical memory for hardware buffers.
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Human-readable allocator name.
    fn name(&self) -> &str;

    /// Reserve memory for `desc`.
    ///
    /// Implementations validate the descriptor and never return a handle
    /// smaller than the computed layout.
    fn allocate(&self, desc: &BufferDescriptor) -> Result<MemoryHandle, AllocationError>;

    /// Give a handle back. The handle is closed when this returns.
    fn free(&self, handle: MemoryHandle);

    /// Adopt a handle reconstructed from another process.
    ///
    /// Fails if the backing object cannot hold the handle's layout.
    fn import(&self, handle: MemoryHandle) -> Result<MemoryHandle, AllocationError>;

    /// Allocation statistics.
    fn stats(&self) -> AllocatorStats {
        AllocatorStats::default()
    }
}

/// Configuration for [`MemfdAllocator`].
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Prefix of the memfd name, visible in `/proc/<pid>/fd`.
    pub name_prefix: String,
    /// Row alignment in bytes. Must be a power of two.
    pub row_alignment: usize,
    /// Seal the memfd against resizing after allocation.
    pub seal: bool,
    /// Accept `PROTECTED_CONTENT`. memfd memory is not actually protected.
    pub allow_protected_content: bool,
    /// Largest accepted width or height.
    pub max_dimension: u32,
    /// Reject imported memory that is not sealed against shrinking.
    /// When unset, such imports are accepted with a warning.
    pub require_sealed_imports: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            name_prefix: "hwbuffer".to_string(),
            row_alignment: DEFAULT_ROW_ALIGNMENT,
            seal: true,
            allow_protected_content: false,
            max_dimension: DEFAULT_MAX_DIMENSION,
            require_sealed_imports: false,
        }
    }
}

impl AllocatorConfig {
    /// Set the memfd name prefix.
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Set the row alignment. Values that are not a power of two are
    /// rounded up to the next one.
    pub fn with_row_alignment(mut self, alignment: usize) -> Self {
        self.row_alignment = alignment.max(1).next_power_of_two();
        self
    }

    /// Enable or disable sealing.
    pub fn with_seal(mut self, seal: bool) -> Self {
        self.seal = seal;
        self
    }

    /// Accept or reject `PROTECTED_CONTENT`.
    pub fn with_protected_content(mut self, allow: bool) -> Self {
        self.allow_protected_content = allow;
        self
    }

    /// Set the largest accepted width or height.
    pub fn with_max_dimension(mut self, max: u32) -> Self {
        self.max_dimension = max;
        self
    }

    /// Require imported memory to carry a shrink seal.
    pub fn with_require_sealed_imports(mut self, require: bool) -> Self {
        self.require_sealed_imports = require;
        self
    }
}

/// Point-in-time allocator statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Successful allocations.
    pub allocations: u64,
    /// Handles returned through [`Allocator::free`].
    pub frees: u64,
    /// Handles adopted through [`Allocator::import`].
    pub imports: u64,
    /// Handles currently outstanding.
    pub live_handles: u64,
    /// Bytes currently outstanding.
    pub live_bytes: u64,
}

/// Allocator backed by `memfd_create`.
pub struct MemfdAllocator {
    config: AllocatorConfig,
    next_id: AtomicU64,
    allocations: AtomicU64,
    frees: AtomicU64,
    imports: AtomicU64,
    live_bytes: AtomicUsize,
}

impl MemfdAllocator {
    /// Create an allocator with the default configuration.
    pub fn new() -> Self {
        Self::with_config(AllocatorConfig::default())
    }

    /// Create an allocator with a custom configuration.
    pub fn with_config(config: AllocatorConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            imports: AtomicU64::new(0),
            live_bytes: AtomicUsize::new(0),
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    fn check_supported(&self, desc: &BufferDescriptor) -> Result<(), AllocationError> {
        // Blob width is a byte count, not a pixel dimension.
        let oversized =
            desc.width > self.config.max_dimension || desc.height > self.config.max_dimension;
        if oversized && desc.format != PixelFormat::Blob {
            return Err(AllocationError::InvalidDescriptor(format!(
                "{}x{} exceeds the maximum dimension {}",
                desc.width, desc.height, self.config.max_dimension
            )));
        }
        if desc.usage.contains(Usage::PROTECTED_CONTENT) && !self.config.allow_protected_content {
            return Err(AllocationError::UnsupportedUsage {
                usage0: desc.usage.bits(),
                usage1: desc.usage1,
                reason: "protected content is not available",
            });
        }
        Ok(())
    }
}

impl Default for MemfdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemfdAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemfdAllocator")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Allocator for MemfdAllocator {
    fn name(&self) -> &str {
        "memfd"
    }

    fn allocate(&self, desc: &BufferDescriptor) -> Result<MemoryHandle, AllocationError> {
        desc.validate()?;
        self.check_supported(desc)?;
        let layout = BufferLayout::for_descriptor(desc, self.config.row_alignment)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}:{}", self.config.name_prefix, id);
        let mut flags = MemfdFlags::CLOEXEC;
        if self.config.seal {
            flags |= MemfdFlags::ALLOW_SEALING;
        }

        let fd = rustix::fs::memfd_create(name.as_str(), flags).map_err(out_of_memory(layout.size))?;
        rustix::fs::ftruncate(&fd, layout.size as u64).map_err(out_of_memory(layout.size))?;
        if self.config.seal {
            rustix::fs::fcntl_add_seals(&fd, SealFlags::SHRINK | SealFlags::GROW | SealFlags::SEAL)?;
        }

        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_add(layout.size, Ordering::Relaxed);
        tracing::debug!(
            allocator = self.name(),
            name = %name,
            width = desc.width,
            height = desc.height,
            layers = desc.layers,
            format = ?desc.format,
            size = layout.size,
            "allocated memory handle"
        );

        Ok(MemoryHandle::new(fd, *desc, layout))
    }

    fn free(&self, handle: MemoryHandle) {
        self.frees.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(handle.size(), Ordering::Relaxed);
        tracing::debug!(
            allocator = self.name(),
            fd = handle.raw_fd(),
            size = handle.size(),
            "freed memory handle"
        );
        handle.close();
    }

    fn import(&self, handle: MemoryHandle) -> Result<MemoryHandle, AllocationError> {
        let backing = handle.backing_size()?;
        if backing < handle.size() as u64 {
            return Err(AllocationError::InvalidDescriptor(format!(
                "backing object holds {} bytes, layout needs {}",
                backing,
                handle.size()
            )));
        }
        // The sender can still shrink an unsealed object under our mapping.
        if !shrink_sealed(&handle) {
            if self.config.require_sealed_imports {
                return Err(AllocationError::InvalidDescriptor(
                    "backing object is not sealed against shrinking".to_string(),
                ));
            }
            tracing::warn!(
                allocator = self.name(),
                fd = handle.raw_fd(),
                "imported memory is not sealed against shrinking"
            );
        }

        self.imports.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_add(handle.size(), Ordering::Relaxed);
        tracing::debug!(
            allocator = self.name(),
            fd = handle.raw_fd(),
            size = handle.size(),
            "imported memory handle"
        );
        Ok(handle)
    }

    fn stats(&self) -> AllocatorStats {
        let allocations = self.allocations.load(Ordering::Relaxed);
        let imports = self.imports.load(Ordering::Relaxed);
        let frees = self.frees.load(Ordering::Relaxed);
        AllocatorStats {
            allocations,
            frees,
            imports,
            live_handles: (allocations + imports).saturating_sub(frees),
            live_bytes: self.live_bytes.load(Ordering::Relaxed) as u64,
        }
    }
}

/// True if the backing object refuses to shrink. Objects without seal
/// support (anything but a memfd) count as unsealed.
fn shrink_sealed(handle: &MemoryHandle) -> bool {
    rustix::fs::fcntl_get_seals(handle.fd())
        .is_ok_and(|seals| seals.contains(SealFlags::SHRINK))
}

fn out_of_memory(size: usize) -> impl Fn(Errno) -> AllocationError {
    move |err| match err {
        Errno::NOMEM | Errno::NOSPC | Errno::FBIG | Errno::MFILE | Errno::NFILE => {
            AllocationError::OutOfMemory { size }
        }
        other => AllocationError::System(other),
    }
}

/// The process-wide allocator used by
/// [`HardwareBuffer::allocate`](crate::HardwareBuffer::allocate).
pub fn shared_allocator() -> Arc<dyn Allocator> {
    static SHARED: OnceLock<Arc<MemfdAllocator>> = OnceLock::new();
    SHARED.get_or_init(|| Arc::new(MemfdAllocator::new())).clone()
}
