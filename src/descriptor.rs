//! Buffer descriptors, memory layout and lock regions.

use crate::error::AllocationError;
use crate::format::{PixelFormat, Usage};

/// Immutable description of a hardware buffer.
///
/// # Example
///
/// ```rust,ignore
/// use hwbuffer::{BufferDescriptor, PixelFormat, Usage};
///
/// let desc = BufferDescriptor::new(64, 64, PixelFormat::R8G8B8A8Unorm)
///     .with_usage(Usage::CPU_READ | Usage::CPU_WRITE);
/// desc.validate()?;
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferDescriptor {
    /// Width in pixels (bytes for [`PixelFormat::Blob`]).
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Number of image layers.
    pub layers: u32,
    /// Pixel format.
    pub format: PixelFormat,
    /// Usage flags.
    pub usage: Usage,
    /// Reserved usage bits. Must be zero when allocating.
    pub usage1: u64,
}

impl BufferDescriptor {
    /// Create a single-layer descriptor with no usage bits.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            layers: 1,
            format,
            usage: Usage::empty(),
            usage1: 0,
        }
    }

    /// Descriptor for an opaque byte buffer of `size` bytes.
    pub fn blob(size: u32) -> Self {
        Self::new(size, 1, PixelFormat::Blob)
    }

    /// Set the layer count.
    pub fn with_layers(mut self, layers: u32) -> Self {
        self.layers = layers;
        self
    }

    /// Set the usage flags.
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    /// Check the descriptor for internal consistency.
    pub fn validate(&self) -> Result<(), AllocationError> {
        if self.width == 0 || self.height == 0 || self.layers == 0 {
            return Err(AllocationError::InvalidDescriptor(format!(
                "dimensions must be non-zero, got {}x{}x{}",
                self.width, self.height, self.layers
            )));
        }

        if self.format == PixelFormat::Blob && (self.height != 1 || self.layers != 1) {
            return Err(AllocationError::InvalidDescriptor(
                "blob buffers must have height 1 and a single layer".into(),
            ));
        }

        if self.usage.unknown_bits() != 0 {
            return Err(self.unsupported("unknown usage bits"));
        }
        if self.usage1 != 0 {
            return Err(self.unsupported("usage1 is reserved and must be zero"));
        }
        if self.usage.contains(Usage::PROTECTED_CONTENT) && self.usage.has_cpu_access() {
            return Err(self.unsupported("protected content cannot be CPU accessible"));
        }
        if self.usage.contains(Usage::GPU_CUBEMAP)
            && (self.width != self.height || self.layers % 6 != 0)
        {
            return Err(self.unsupported("cubemaps must be square with a multiple of 6 layers"));
        }

        Ok(())
    }

    fn unsupported(&self, reason: &'static str) -> AllocationError {
        AllocationError::UnsupportedUsage {
            usage0: self.usage.bits(),
            usage1: self.usage1,
            reason,
        }
    }
}

/// Byte layout of a buffer's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferLayout {
    /// Bytes between the starts of consecutive rows.
    pub stride: usize,
    /// Bytes between the starts of consecutive layers.
    pub layer_stride: usize,
    /// Total size in bytes.
    pub size: usize,
}

impl BufferLayout {
    /// Compute the layout for a descriptor.
    ///
    /// Rows are padded to `row_alignment` bytes (a power of two); blob
    /// buffers are never padded.
    pub fn for_descriptor(
        desc: &BufferDescriptor,
        row_alignment: usize,
    ) -> Result<Self, AllocationError> {
        let row_bytes = (desc.width as usize)
            .checked_mul(desc.format.bytes_per_pixel())
            .ok_or_else(|| overflow(desc))?;

        let stride = if desc.format == PixelFormat::Blob || row_alignment <= 1 {
            row_bytes
        } else {
            debug_assert!(row_alignment.is_power_of_two());
            row_bytes
                .checked_add(row_alignment - 1)
                .ok_or_else(|| overflow(desc))?
                & !(row_alignment - 1)
        };

        Self::with_stride(desc, stride)
    }

    /// Rebuild a layout from a descriptor and a known row stride.
    ///
    /// Used when a stride arrives from another process.
    pub fn with_stride(desc: &BufferDescriptor, stride: usize) -> Result<Self, AllocationError> {
        let row_bytes = (desc.width as usize)
            .checked_mul(desc.format.bytes_per_pixel())
            .ok_or_else(|| overflow(desc))?;
        if stride < row_bytes {
            return Err(AllocationError::InvalidDescriptor(format!(
                "stride {} is smaller than a row ({} bytes)",
                stride, row_bytes
            )));
        }

        let layer_stride = stride
            .checked_mul(desc.height as usize)
            .ok_or_else(|| overflow(desc))?;
        let size = layer_stride
            .checked_mul(desc.layers as usize)
            .ok_or_else(|| overflow(desc))?;

        Ok(Self {
            stride,
            layer_stride,
            size,
        })
    }
}

fn overflow(desc: &BufferDescriptor) -> AllocationError {
    AllocationError::InvalidDescriptor(format!(
        "layout of {}x{}x{} {:?} overflows",
        desc.width, desc.height, desc.layers, desc.format
    ))
}

/// Half-open pixel rectangle `[left, right) x [top, bottom)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    /// First column.
    pub left: u32,
    /// First row.
    pub top: u32,
    /// One past the last column.
    pub right: u32,
    /// One past the last row.
    pub bottom: u32,
}

impl Rect {
    /// Create a rectangle from its edges.
    pub fn new(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Rectangle covering a whole `width x height` image.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Width in pixels.
    #[inline]
    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    /// Height in pixels.
    #[inline]
    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    /// True if the rectangle covers no pixels.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// True if the rectangle lies inside a `width x height` image.
    #[inline]
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.right <= width && self.bottom <= height
    }
}
