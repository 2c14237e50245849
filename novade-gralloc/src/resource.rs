//! Process-local buffer resources and the allocation/import engine.

use crate::device::Device;
use crate::error::{AllocError, ImportError};
use crate::format::{planar_extent, translate_raw_format, translate_usage, BindFlags, PixelFormat, UsageFlags};
use crate::handle::BufferHandle;
use crate::native::{ImportDescriptor, Mapping, NativeBo};
use std::os::fd::AsRawFd;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error};

/// Hardware minimum for cursor planes, per side.
pub const CURSOR_MIN_SIZE: u32 = 64;

/// Lock/map bookkeeping of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockState {
    pub lock_count: u32,
    pub locked_for: UsageFlags,
    pub mapped: bool,
}

#[derive(Debug)]
pub(crate) struct ResourceState {
    pub(crate) bo: Box<dyn NativeBo>,
    pub(crate) mapping: Option<Mapping>,
    pub(crate) lock_count: u32,
    pub(crate) locked_for: UsageFlags,
}

/// The live, process-local side of a buffer.
///
/// Owns the native buffer object; dropping or [releasing](Self::release) the
/// resource destroys it. All lock and map state sits behind one mutex, so a
/// resource may be locked from several threads.
#[derive(Debug)]
pub struct ResourceObject {
    state: Mutex<ResourceState>,
}

impl ResourceObject {
    fn new(bo: Box<dyn NativeBo>) -> Self {
        Self {
            state: Mutex::new(ResourceState {
                bo,
                mapping: None,
                lock_count: 0,
                locked_for: UsageFlags::empty(),
            }),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ResourceState> {
        // Counters stay consistent even if a holder panicked, so keep going.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lock_state(&self) -> LockState {
        let state = self.state();
        LockState {
            lock_count: state.lock_count,
            locked_for: state.locked_for,
            mapped: state.mapping.is_some(),
        }
    }

    pub fn stride(&self) -> u32 {
        self.state().bo.stride()
    }

    /// Runs `f` with the native buffer object, holding the state mutex. `f`
    /// must not lock, unlock or query this resource again.
    pub fn with_native_bo<R>(&self, f: impl FnOnce(&dyn NativeBo) -> R) -> R {
        f(self.state().bo.as_ref())
    }

    /// Destroys the native buffer object, then the resource.
    pub fn release(self) {
        let state = self.state.into_inner().unwrap_or_else(PoisonError::into_inner);
        debug!(bo = ?state.bo, "releasing buffer object");
        drop(state.bo);
    }
}

/// Geometry actually requested from the device for a buffer.
///
/// Cursor buffers are clamped to [`CURSOR_MIN_SIZE`], and packed planar formats
/// get the chroma rows stacked below the luma rows. `None` when the packed
/// height overflows.
pub fn alloc_extent(
    width: u32,
    height: u32,
    format: Option<PixelFormat>,
    usage: UsageFlags,
    bind: BindFlags,
) -> Option<(u32, u32)> {
    let (mut w, mut h) = (width, height);
    if bind.contains(BindFlags::CURSOR) || usage.contains(UsageFlags::CURSOR) {
        w = w.max(CURSOR_MIN_SIZE);
        h = h.max(CURSOR_MIN_SIZE);
    }
    if format.map_or(false, PixelFormat::is_packed_planar) {
        // The packing is derived from the requested height, not the clamped one.
        w /= 2;
        h = h.checked_add(height / 2)?;
    }
    Some((w, h))
}

/// Allocates a fresh buffer for `handle` and records its descriptor, stride and
/// modifier in the handle.
///
/// # Errors
///
/// [`AllocError::UnsupportedFormat`] for formats without a native equivalent,
/// [`AllocError::Native`] when the device refuses, and [`AllocError::Export`]
/// when the descriptor cannot be exported (the new buffer is released).
pub fn allocate(device: &Device, handle: &mut BufferHandle) -> Result<ResourceObject, AllocError> {
    let format = translate_raw_format(handle.raw_format()).ok_or(AllocError::UnsupportedFormat {
        format: handle.raw_format(),
    })?;
    let usage = handle.usage();
    let bind = translate_usage(usage);
    let (width, height) = alloc_extent(handle.width(), handle.height(), handle.format(), usage, bind).ok_or(
        AllocError::Geometry {
            width: handle.width(),
            height: handle.height(),
            format: handle.raw_format(),
        },
    )?;

    debug!(
        width = handle.width(),
        height = handle.height(),
        format = handle.raw_format(),
        ?bind,
        "create bo"
    );
    let bo = device.native().create_bo(width, height, format, bind).map_err(|source| {
        error!(
            width = handle.width(),
            height = handle.height(),
            format = handle.raw_format(),
            ?bind,
            "failed to create bo"
        );
        AllocError::Native {
            width: handle.width(),
            height: handle.height(),
            format: handle.raw_format(),
            usage,
            source,
        }
    })?;

    // `bo` is dropped, and so destroyed, if the export fails.
    let fd = bo.export_fd().map_err(AllocError::Export)?;
    let modifier = if device.native().supports_modifiers() {
        bo.modifier()
    } else {
        None
    };
    handle.set_allocation(fd, bo.stride(), modifier);

    Ok(ResourceObject::new(bo))
}

/// Rebuilds a local resource from the descriptor carried by `handle`.
///
/// Only the planar packing is applied to the stated geometry; cursor clamping
/// is the allocating side's business.
///
/// # Errors
///
/// [`ImportError::MissingDescriptor`] when the handle holds no descriptor,
/// [`ImportError::UnsupportedFormat`], [`ImportError::Geometry`] and
/// [`ImportError::Native`] otherwise.
pub fn import(device: &Device, handle: &BufferHandle) -> Result<ResourceObject, ImportError> {
    let fd = handle.fd().ok_or(ImportError::MissingDescriptor)?;
    let raw_fd = fd.as_raw_fd();
    let format = translate_raw_format(handle.raw_format()).ok_or(ImportError::UnsupportedFormat {
        format: handle.raw_format(),
    })?;

    let (mut width, mut height) = (handle.width(), handle.height());
    if handle.is_packed_planar() {
        (width, height) = planar_extent(width, height).ok_or(ImportError::Geometry {
            width,
            height,
            format: handle.raw_format(),
        })?;
    }

    let desc = ImportDescriptor {
        fd,
        width,
        height,
        format,
        stride: handle.stride(),
        modifier: if device.native().supports_modifiers() {
            handle.modifier()
        } else {
            None
        },
    };
    debug!(fd = raw_fd, width, height, stride = desc.stride, "import bo");
    let bo = device
        .native()
        .import_bo(&desc)
        .map_err(|source| ImportError::Native { fd: raw_fd, source })?;

    Ok(ResourceObject::new(bo))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{NativeFormat, TransferFlags};
    use crate::native::{MapRegion, NativeDevice, NativeError};
    use crate::test_util::memfd_device;
    use std::os::fd::OwnedFd;
    use std::sync::Arc;

    /// Device that records the geometry it was asked for and then refuses.
    #[derive(Debug, Default)]
    struct RecordingDevice {
        requests: Mutex<Vec<(u32, u32, NativeFormat, BindFlags)>>,
    }

    impl NativeDevice for RecordingDevice {
        fn create_bo(&self, width: u32, height: u32, format: NativeFormat, flags: BindFlags) -> Result<Box<dyn NativeBo>, NativeError> {
            self.requests.lock().unwrap().push((width, height, format, flags));
            Err(NativeError::Unsupported("allocation".into()))
        }

        fn import_bo(&self, _desc: &ImportDescriptor<'_>) -> Result<Box<dyn NativeBo>, NativeError> {
            Err(NativeError::Unsupported("import".into()))
        }

        fn supports_modifiers(&self) -> bool {
            false
        }
    }

    #[derive(Debug)]
    struct NoExportBo;

    impl NativeBo for NoExportBo {
        fn export_fd(&self) -> Result<OwnedFd, NativeError> {
            Err(NativeError::CallFailed("export"))
        }
        fn width(&self) -> u32 { 1 }
        fn height(&self) -> u32 { 1 }
        fn format(&self) -> NativeFormat { NativeFormat::ABGR8888 }
        fn stride(&self) -> u32 { 64 }
        fn modifier(&self) -> Option<u64> { None }
        fn map(&mut self, _region: MapRegion, _flags: TransferFlags) -> Result<Mapping, NativeError> {
            Err(NativeError::CallFailed("map"))
        }
        fn unmap(&mut self) {}
    }

    #[derive(Debug, Default)]
    struct NoExportDevice;

    impl NativeDevice for NoExportDevice {
        fn create_bo(&self, _: u32, _: u32, _: NativeFormat, _: BindFlags) -> Result<Box<dyn NativeBo>, NativeError> {
            Ok(Box::new(NoExportBo))
        }
        fn import_bo(&self, _desc: &ImportDescriptor<'_>) -> Result<Box<dyn NativeBo>, NativeError> {
            Err(NativeError::Unsupported("import".into()))
        }
        fn supports_modifiers(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_planar_alloc_extent() {
        let extent = alloc_extent(64, 64, Some(PixelFormat::Yv12), UsageFlags::SW_WRITE_OFTEN, BindFlags::LINEAR);
        assert_eq!(extent, Some((32, 96)));
        let overflow = alloc_extent(64, 0xC000_0000, Some(PixelFormat::Yv12), UsageFlags::HW_TEXTURE, BindFlags::RENDERING);
        assert_eq!(overflow, None);
        // Non-planar formats never grow, whatever the height.
        assert_eq!(
            alloc_extent(64, u32::MAX, Some(PixelFormat::Rgba8888), UsageFlags::HW_TEXTURE, BindFlags::RENDERING),
            Some((64, u32::MAX))
        );
    }

    #[test]
    fn test_cursor_clamp() {
        let (w, h) = alloc_extent(16, 16, Some(PixelFormat::Rgba8888), UsageFlags::CURSOR, BindFlags::empty()).unwrap();
        assert!(w >= 64 && h >= 64, "cursor buffer was {w}x{h}");
        assert_eq!(alloc_extent(16, 200, None, UsageFlags::empty(), BindFlags::CURSOR), Some((64, 200)));
        assert_eq!(alloc_extent(16, 16, None, UsageFlags::HW_RENDER, BindFlags::RENDERING), Some((16, 16)));
    }

    #[test]
    fn test_allocate_fills_handle() {
        let device = memfd_device();
        let mut handle = BufferHandle::new(100, 50, PixelFormat::Rgba8888, UsageFlags::HW_RENDER).unwrap();
        let resource = allocate(&device, &mut handle).unwrap();

        assert!(handle.shareable_fd() >= 0);
        assert_eq!(handle.stride(), resource.stride());
        assert_eq!(handle.stride(), 448);
        assert_eq!(handle.modifier(), Some(0));
        assert_eq!(resource.lock_state(), LockState { lock_count: 0, locked_for: UsageFlags::empty(), mapped: false });

        resource.release();
        handle.close_fd();
    }

    #[test]
    fn test_allocate_then_import_keeps_stride() {
        let device = memfd_device();
        let mut handle = BufferHandle::new(64, 64, PixelFormat::Yv12, UsageFlags::SW_READ_OFTEN).unwrap();
        let allocated = allocate(&device, &mut handle).unwrap();
        allocated.with_native_bo(|bo| assert_eq!((bo.width(), bo.height()), (32, 96)));

        let imported = import(&device, &handle).unwrap();
        assert_eq!(imported.stride(), handle.stride());
        imported.with_native_bo(|bo| {
            assert_eq!((bo.width(), bo.height()), (32, 96));
            assert_eq!(bo.format(), NativeFormat::GR88);
        });

        imported.release();
        allocated.release();
        handle.close_fd();
    }

    #[test]
    fn test_allocate_reports_requested_geometry() {
        let recorder = Arc::new(RecordingDevice::default());
        let device = Device::from_native(recorder.clone(), "recording");
        let mut handle = BufferHandle::new(16, 16, PixelFormat::Yv12, UsageFlags::CURSOR).unwrap();

        match allocate(&device, &mut handle) {
            Err(AllocError::Native { width, height, format, usage, .. }) => {
                assert_eq!((width, height), (16, 16));
                assert_eq!(format, PixelFormat::Yv12.as_raw());
                assert_eq!(usage, UsageFlags::CURSOR);
            }
            other => panic!("expected native allocation failure, got {other:?}"),
        }
        let requests = recorder.requests.lock().unwrap();
        assert_eq!(requests.as_slice(), &[(32, 72, NativeFormat::GR88, BindFlags::empty())]);
        assert_eq!(handle.shareable_fd(), -1, "A failed allocation must leave the handle untouched.");
    }

    #[test]
    fn test_allocate_rejects_unsupported_format() {
        let device = memfd_device();
        let mut handle = BufferHandle::new(8, 8, PixelFormat::YCrCb420Sp, UsageFlags::HW_TEXTURE).unwrap();
        assert!(matches!(allocate(&device, &mut handle), Err(AllocError::UnsupportedFormat { .. })));
    }

    #[test]
    fn test_allocate_export_failure() {
        let device = Device::from_native(Arc::new(NoExportDevice), "no-export");
        let mut handle = BufferHandle::new(8, 8, PixelFormat::Rgba8888, UsageFlags::HW_TEXTURE).unwrap();
        assert!(matches!(allocate(&device, &mut handle), Err(AllocError::Export(_))));
        assert_eq!(handle.shareable_fd(), -1);
    }

    #[test]
    fn test_allocate_rejects_overflowing_planar_height() {
        let recorder = Arc::new(RecordingDevice::default());
        let device = Device::from_native(recorder.clone(), "recording");
        let mut handle = BufferHandle::new(64, 0xC000_0000, PixelFormat::Yv12, UsageFlags::HW_TEXTURE).unwrap();

        assert!(matches!(
            allocate(&device, &mut handle),
            Err(AllocError::Geometry { width: 64, height: 0xC000_0000, .. })
        ));
        assert!(recorder.requests.lock().unwrap().is_empty(), "Nothing may reach the device.");
    }

    #[test]
    fn test_import_rejects_overflowing_planar_height() {
        let mut wire = BufferHandle::new(64, 0xC000_0000, PixelFormat::Yv12, UsageFlags::HW_TEXTURE)
            .unwrap()
            .to_wire();
        wire.stride = 64;
        let handle = BufferHandle::from_wire(wire, Some(OwnedFd::from(tempfile::tempfile().unwrap())));

        let device = memfd_device();
        assert!(matches!(import(&device, &handle), Err(ImportError::Geometry { .. })));
    }

    #[test]
    fn test_import_does_not_clamp_cursor() {
        // An allocator that never clamps cursors hands out a plain 16x16 buffer.
        let device = memfd_device();
        let bo = device
            .native()
            .create_bo(16, 16, NativeFormat::ABGR8888, BindFlags::empty())
            .unwrap();
        let mut handle = BufferHandle::new(16, 16, PixelFormat::Rgba8888, UsageFlags::CURSOR).unwrap();
        handle.set_allocation(bo.export_fd().unwrap(), bo.stride(), bo.modifier());

        let imported = import(&device, &handle).unwrap();
        imported.with_native_bo(|bo| assert_eq!((bo.width(), bo.height()), (16, 16)));
    }

    #[test]
    fn test_import_requires_descriptor() {
        let device = memfd_device();
        let handle = BufferHandle::new(8, 8, PixelFormat::Rgba8888, UsageFlags::HW_TEXTURE).unwrap();
        assert!(matches!(import(&device, &handle), Err(ImportError::MissingDescriptor)));
    }

    #[test]
    fn test_import_native_failure() {
        let device = memfd_device();
        let mut handle = BufferHandle::new(8, 8, PixelFormat::Rgba8888, UsageFlags::HW_TEXTURE).unwrap();
        let resource = allocate(&device, &mut handle).unwrap();

        let refusing = Device::from_native(Arc::new(RecordingDevice::default()), "recording");
        assert!(matches!(import(&refusing, &handle), Err(ImportError::Native { .. })));

        resource.release();
        handle.close_fd();
    }
}
