//! Software allocator backed by anonymous shared memory.
//!
//! Every buffer object is a fixed-size `memfd`. Its descriptor can be sent to
//! another process and imported there exactly like a dma-buf, which makes this
//! backend a drop-in for machines without a render node and for tests.

use super::{ImportDescriptor, MapRegion, Mapping, NativeBackend, NativeBo, NativeDevice, NativeError};
use crate::format::{BindFlags, NativeFormat, TransferFlags};
use memmap2::{MmapMut, MmapOptions};
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::debug;

/// Row pitch alignment, matching what most scanout engines expect.
pub const STRIDE_ALIGN: u32 = 64;

/// `DRM_FORMAT_MOD_LINEAR`.
pub const MODIFIER_LINEAR: u64 = 0;

#[derive(Debug, Clone)]
pub struct MemfdBackend {
    modifiers: bool,
}

impl MemfdBackend {
    pub fn new() -> Self {
        Self { modifiers: true }
    }

    /// A backend whose buffers report no modifier, like older GBM builds.
    pub fn without_modifiers() -> Self {
        Self { modifiers: false }
    }
}

impl Default for MemfdBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeBackend for MemfdBackend {
    fn name(&self) -> &'static str {
        "memfd"
    }

    fn create_context(&self, fd: OwnedFd) -> Result<Arc<dyn NativeDevice>, NativeError> {
        Ok(Arc::new(MemfdDevice {
            _device_fd: fd,
            modifiers: self.modifiers,
        }))
    }
}

/// Device context of the memfd backend. The opened device descriptor is only
/// held so that its lifetime matches a real device context.
#[derive(Debug)]
pub struct MemfdDevice {
    _device_fd: OwnedFd,
    modifiers: bool,
}

fn memfd_create() -> io::Result<File> {
    let name = b"novade-gralloc\0";
    // SAFETY: `name` is NUL terminated and outlives the call.
    let raw = unsafe { libc::memfd_create(name.as_ptr().cast(), libc::MFD_CLOEXEC) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `raw` is a freshly created descriptor that nothing else owns.
    Ok(File::from(unsafe { OwnedFd::from_raw_fd(raw) }))
}

fn align_up(value: u32, align: u32) -> Option<u32> {
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

fn buffer_len(stride: u32, height: u32) -> io::Result<u64> {
    let len = u64::from(stride) * u64::from(height);
    if len == 0 || usize::try_from(len).is_err() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid buffer size"));
    }
    Ok(len)
}

impl NativeDevice for MemfdDevice {
    fn create_bo(
        &self,
        width: u32,
        height: u32,
        format: NativeFormat,
        flags: BindFlags,
    ) -> Result<Box<dyn NativeBo>, NativeError> {
        if width == 0 || height == 0 {
            return Err(NativeError::Io(io::Error::new(io::ErrorKind::InvalidInput, "empty buffer")));
        }
        let stride = width
            .checked_mul(format.bytes_per_pixel())
            .and_then(|row| align_up(row, STRIDE_ALIGN))
            .ok_or_else(|| NativeError::Io(io::Error::new(io::ErrorKind::InvalidInput, "stride overflow")))?;
        let len = buffer_len(stride, height)?;

        let file = memfd_create()?;
        file.set_len(len)?;
        debug!(width, height, ?format, ?flags, stride, "created memfd buffer");

        Ok(Box::new(MemfdBo {
            file,
            width,
            height,
            format,
            stride,
            modifier: self.modifiers.then_some(MODIFIER_LINEAR),
            mapping: None,
        }))
    }

    fn import_bo(&self, desc: &ImportDescriptor<'_>) -> Result<Box<dyn NativeBo>, NativeError> {
        if let Some(modifier) = desc.modifier {
            if modifier != MODIFIER_LINEAR {
                return Err(NativeError::Unsupported(format!("modifier {modifier:#x}")));
            }
        }
        let min_stride = u64::from(desc.width) * u64::from(desc.format.bytes_per_pixel());
        if desc.width == 0 || u64::from(desc.stride) < min_stride {
            return Err(NativeError::Io(io::Error::new(io::ErrorKind::InvalidInput, "stride too small")));
        }
        let len = buffer_len(desc.stride, desc.height)?;

        let file = File::from(desc.fd.try_clone_to_owned()?);
        if file.metadata()?.len() < len {
            return Err(NativeError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "descriptor is smaller than the described buffer",
            )));
        }
        debug!(width = desc.width, height = desc.height, stride = desc.stride, "imported memfd buffer");

        Ok(Box::new(MemfdBo {
            file,
            width: desc.width,
            height: desc.height,
            format: desc.format,
            stride: desc.stride,
            modifier: self.modifiers.then_some(MODIFIER_LINEAR),
            mapping: None,
        }))
    }

    fn supports_modifiers(&self) -> bool {
        self.modifiers
    }
}

#[derive(Debug)]
struct MemfdBo {
    file: File,
    width: u32,
    height: u32,
    format: NativeFormat,
    stride: u32,
    modifier: Option<u64>,
    mapping: Option<MmapMut>,
}

impl NativeBo for MemfdBo {
    fn export_fd(&self) -> Result<OwnedFd, NativeError> {
        Ok(self.file.as_fd().try_clone_to_owned()?)
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn format(&self) -> NativeFormat {
        self.format
    }

    fn stride(&self) -> u32 {
        self.stride
    }

    fn modifier(&self) -> Option<u64> {
        self.modifier
    }

    fn map(&mut self, region: MapRegion, flags: TransferFlags) -> Result<Mapping, NativeError> {
        let fits = region.x.checked_add(region.width).map_or(false, |right| right <= self.width)
            && region.y.checked_add(region.height).map_or(false, |bottom| bottom <= self.height);
        if !fits {
            return Err(NativeError::OutOfBounds {
                region,
                width: self.width,
                height: self.height,
            });
        }
        if self.mapping.is_some() {
            return Err(NativeError::CallFailed("map: buffer already mapped"));
        }

        let len = buffer_len(self.stride, self.height)? as usize;
        // SAFETY: the memfd is never truncated after creation, so the mapping
        // stays backed for its whole lifetime.
        let mut mmap = unsafe { MmapOptions::new().len(len).map_mut(&self.file)? };
        let addr = NonNull::new(mmap.as_mut_ptr()).ok_or(NativeError::CallFailed("mmap"))?;
        debug!(?region, ?flags, "mapped memfd buffer");
        self.mapping = Some(mmap);

        Ok(Mapping {
            addr,
            stride: self.stride,
        })
    }

    fn unmap(&mut self) {
        self.mapping = None;
    }
}
