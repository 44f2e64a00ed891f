//! Pixel formats and usage flags.
//!
//! The numeric values match the platform's hardware buffer ABI and are part
//! of the wire format, so they must never be renumbered.

use crate::error::AllocationError;
use bitflags::bitflags;

/// Pixel format of a hardware buffer.
///
/// The core never interprets pixel contents; the format only determines the
/// bytes per pixel used to lay out rows.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8 bits per channel RGBA. Vulkan `R8G8B8A8_UNORM`, GL `RGBA8`.
    R8G8B8A8Unorm = 1,
    /// RGBA with the alpha channel ignored.
    R8G8B8X8Unorm = 2,
    /// Packed 24-bit RGB.
    R8G8B8Unorm = 3,
    /// 16-bit RGB 5:6:5.
    R5G6B5Unorm = 4,
    /// Half-float RGBA.
    R16G16B16A16Sfloat = 0x16,
    /// Opaque bytes. Height must be 1 and width is the size in bytes.
    Blob = 0x21,
}

impl PixelFormat {
    /// All supported formats.
    pub const ALL: [PixelFormat; 6] = [
        PixelFormat::R8G8B8A8Unorm,
        PixelFormat::R8G8B8X8Unorm,
        PixelFormat::R8G8B8Unorm,
        PixelFormat::R5G6B5Unorm,
        PixelFormat::R16G16B16A16Sfloat,
        PixelFormat::Blob,
    ];

    /// Bytes occupied by one pixel.
    #[inline]
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::R8G8B8A8Unorm | PixelFormat::R8G8B8X8Unorm => 4,
            PixelFormat::R8G8B8Unorm => 3,
            PixelFormat::R5G6B5Unorm => 2,
            PixelFormat::R16G16B16A16Sfloat => 8,
            PixelFormat::Blob => 1,
        }
    }

    /// Raw ABI value.
    #[inline]
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for PixelFormat {
    type Error = AllocationError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        PixelFormat::ALL
            .into_iter()
            .find(|f| f.as_u32() == value)
            .ok_or(AllocationError::UnsupportedFormat(value))
    }
}

bitflags! {
    /// Intended producers and consumers of a buffer (the `usage0` field).
    ///
    /// The `*_OFTEN` variants include their plain counterpart, so
    /// `CPU_READ_OFTEN.contains(CPU_READ)` holds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Usage: u64 {
        /// Sometimes read by the CPU.
        const CPU_READ = 1 << 1;
        /// Often read by the CPU.
        const CPU_READ_OFTEN = (1 << 2) | Self::CPU_READ.bits();
        /// Sometimes written by the CPU.
        const CPU_WRITE = 1 << 5;
        /// Often written by the CPU.
        const CPU_WRITE_OFTEN = (1 << 6) | Self::CPU_WRITE.bits();
        /// Sampled by the GPU.
        const GPU_SAMPLED_IMAGE = 1 << 10;
        /// Rendered to by the GPU.
        const GPU_COLOR_OUTPUT = 1 << 11;
        /// Read and written by the GPU.
        const GPU_STORAGE_IMAGE = Self::GPU_SAMPLED_IMAGE.bits() | Self::GPU_COLOR_OUTPUT.bits();
        /// Used as a cubemap texture.
        const GPU_CUBEMAP = 1 << 13;
        /// Used as a shader storage or uniform buffer.
        const GPU_DATA_BUFFER = 1 << 14;
        /// Must stay on a protected hardware path.
        const PROTECTED_CONTENT = 1 << 18;
        /// Read by a hardware video encoder.
        const VIDEO_ENCODE = 1 << 21;
        /// Sensor direct data channel.
        const SENSOR_DIRECT_DATA = 1 << 29;
    }
}

impl Usage {
    /// Every bit that grants CPU access.
    pub const CPU_MASK: Usage = Usage::CPU_READ_OFTEN.union(Usage::CPU_WRITE_OFTEN);

    /// Does this usage include any CPU access?
    #[inline]
    pub fn has_cpu_access(self) -> bool {
        self.intersects(Usage::CPU_MASK)
    }

    /// Does this usage grant CPU reads?
    #[inline]
    pub fn can_cpu_read(self) -> bool {
        self.contains(Usage::CPU_READ)
    }

    /// Does this usage grant CPU writes?
    #[inline]
    pub fn can_cpu_write(self) -> bool {
        self.contains(Usage::CPU_WRITE)
    }

    /// Bits not defined by this version of the ABI.
    #[inline]
    pub fn unknown_bits(self) -> u64 {
        self.bits() & !Usage::all().bits()
    }
}
