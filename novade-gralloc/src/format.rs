//! Pixel-format and usage translation.
//!
//! Gralloc clients speak in HAL pixel formats and HAL usage bits. The allocator
//! device only understands DRM fourcc codes and GBM bind flags, so every
//! allocation and import goes through [`translate_format`] and
//! [`translate_usage`] first.

use bitflags::bitflags;
use std::fmt;

/// HAL pixel formats accepted by the allocator.
///
/// The discriminants are the raw HAL codes carried in a buffer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PixelFormat {
    Rgba8888 = 1,
    Rgbx8888 = 2,
    Rgb888 = 3,
    Rgb565 = 4,
    Bgra8888 = 5,
    /// Semi-planar 4:2:2, not backed by any native format.
    YCbCr422Sp = 0x10,
    /// Semi-planar 4:2:0 (NV21), not backed by any native format.
    YCrCb420Sp = 0x11,
    /// Planar YUV 4:2:0 with V before U.
    Yv12 = 0x3231_5659,
}

impl PixelFormat {
    /// Every format the enum knows about, supported or not.
    pub const ALL: [PixelFormat; 8] = [
        PixelFormat::Rgba8888,
        PixelFormat::Rgbx8888,
        PixelFormat::Rgb888,
        PixelFormat::Rgb565,
        PixelFormat::Bgra8888,
        PixelFormat::YCbCr422Sp,
        PixelFormat::YCrCb420Sp,
        PixelFormat::Yv12,
    ];

    /// Looks up a raw HAL code.
    pub fn from_raw(raw: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|format| *format as i32 == raw)
    }

    /// Raw HAL code as stored in a handle.
    pub fn as_raw(self) -> i32 {
        self as i32
    }

    /// `true` for the planar format that is packed into a single-plane buffer.
    pub fn is_packed_planar(self) -> bool {
        self == PixelFormat::Yv12
    }
}

/// Geometry of a packed planar buffer.
///
/// YV12 is allocated as GR88 (16 bits per pixel), so the width is halved and
/// the chroma rows are stacked below the luma rows. `None` when the stacked
/// height does not fit in a `u32`.
pub fn planar_extent(width: u32, height: u32) -> Option<(u32, u32)> {
    height.checked_add(height / 2).map(|height| (width / 2, height))
}

/// A DRM fourcc code understood by the allocator device.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeFormat(u32);

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

impl NativeFormat {
    pub const ABGR8888: NativeFormat = NativeFormat(fourcc(b"AB24"));
    pub const XBGR8888: NativeFormat = NativeFormat(fourcc(b"XB24"));
    pub const RGB888: NativeFormat = NativeFormat(fourcc(b"RG24"));
    pub const RGB565: NativeFormat = NativeFormat(fourcc(b"RG16"));
    pub const ARGB8888: NativeFormat = NativeFormat(fourcc(b"AR24"));
    pub const GR88: NativeFormat = NativeFormat(fourcc(b"GR88"));

    /// Wraps a fourcc code. Zero is the "unsupported" code and yields `None`.
    pub fn from_code(code: u32) -> Option<Self> {
        (code != 0).then_some(NativeFormat(code))
    }

    pub fn code(self) -> u32 {
        self.0
    }

    /// Bytes per pixel of the single plane.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            NativeFormat::RGB888 => 3,
            NativeFormat::RGB565 | NativeFormat::GR88 => 2,
            _ => 4,
        }
    }
}

impl fmt::Debug for NativeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_le_bytes();
        match std::str::from_utf8(&bytes) {
            Ok(name) => write!(f, "NativeFormat({name})"),
            Err(_) => write!(f, "NativeFormat({:#010x})", self.0),
        }
    }
}

bitflags! {
    /// HAL usage bits declared on a handle or requested on lock.
    ///
    /// The software read/write entries are multi-bit values inside their masks.
    /// Like the HAL, the allocator tests them bitwise, so a RARELY value also
    /// matches `intersects(SW_READ_OFTEN)`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UsageFlags: u32 {
        const SW_READ_RARELY = 0x0000_0002;
        const SW_READ_OFTEN = 0x0000_0003;
        const SW_READ_MASK = 0x0000_000F;
        const SW_WRITE_RARELY = 0x0000_0020;
        const SW_WRITE_OFTEN = 0x0000_0030;
        const SW_WRITE_MASK = 0x0000_00F0;
        const HW_TEXTURE = 0x0000_0100;
        const HW_RENDER = 0x0000_0200;
        const HW_2D = 0x0000_0400;
        const HW_COMPOSER = 0x0000_0800;
        const HW_FB = 0x0000_1000;
        const CURSOR = 0x0000_8000;
        const HW_VIDEO_ENCODER = 0x0001_0000;
    }
}

impl UsageFlags {
    /// Every bit that requires a CPU mapping.
    pub const SW_MASK: UsageFlags =
        UsageFlags::SW_READ_MASK.union(UsageFlags::SW_WRITE_MASK);

    pub fn needs_cpu_access(self) -> bool {
        self.intersects(Self::SW_MASK)
    }

    pub fn wants_cpu_write(self) -> bool {
        self.intersects(Self::SW_WRITE_MASK)
    }
}

bitflags! {
    /// GBM buffer-object bind flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BindFlags: u32 {
        const SCANOUT = 1 << 0;
        const CURSOR = 1 << 1;
        const RENDERING = 1 << 2;
        const WRITE = 1 << 3;
        const LINEAR = 1 << 4;
    }
}

bitflags! {
    /// Access requested when mapping a buffer object.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TransferFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// Maps a HAL format to the native format the device allocates.
///
/// Returns `None` for formats the device cannot back; callers must reject
/// those before touching the device.
pub fn translate_format(format: PixelFormat) -> Option<NativeFormat> {
    match format {
        PixelFormat::Rgba8888 => Some(NativeFormat::ABGR8888),
        PixelFormat::Rgbx8888 => Some(NativeFormat::XBGR8888),
        PixelFormat::Rgb888 => Some(NativeFormat::RGB888),
        PixelFormat::Rgb565 => Some(NativeFormat::RGB565),
        PixelFormat::Bgra8888 => Some(NativeFormat::ARGB8888),
        // Only single-plane buffer objects exist, so YV12 is requested as GR88.
        PixelFormat::Yv12 => Some(NativeFormat::GR88),
        PixelFormat::YCbCr422Sp | PixelFormat::YCrCb420Sp => None,
    }
}

/// Same as [`translate_format`] for a raw HAL code; unknown codes are unsupported.
pub fn translate_raw_format(raw: i32) -> Option<NativeFormat> {
    PixelFormat::from_raw(raw).and_then(translate_format)
}

/// Maps HAL usage bits to GBM bind flags.
pub fn translate_usage(usage: UsageFlags) -> BindFlags {
    let mut bind = BindFlags::empty();

    if usage.intersects(UsageFlags::SW_READ_OFTEN | UsageFlags::SW_WRITE_OFTEN) {
        bind |= BindFlags::LINEAR;
    }
    // CURSOR is accepted but does not request cursor-capable buffers.
    if usage.intersects(UsageFlags::HW_RENDER | UsageFlags::HW_TEXTURE) {
        bind |= BindFlags::RENDERING;
    }
    if usage.contains(UsageFlags::HW_FB) {
        bind |= BindFlags::SCANOUT;
    }

    bind
}
