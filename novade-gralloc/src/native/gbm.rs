//! libgbm backend.
//!
//! Talks to a DRM render node through the raw libgbm entry points. The device
//! context owns the node descriptor and every buffer object holds the context,
//! so `gbm_device_destroy` always runs after the last `gbm_bo_destroy` and
//! before the descriptor is closed.

use super::{ImportDescriptor, MapRegion, Mapping, NativeBackend, NativeBo, NativeDevice, NativeError};
use crate::format::{BindFlags, NativeFormat, TransferFlags};
use gbm_sys as ffi;
use std::ffi::c_void;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};
use std::sync::Arc;
use tracing::{debug, error};

const GBM_BO_IMPORT_FD_MODIFIER: u32 = 0x5504;

#[derive(Debug, Default, Clone)]
pub struct GbmBackend;

impl NativeBackend for GbmBackend {
    fn name(&self) -> &'static str {
        "gbm"
    }

    fn create_context(&self, fd: OwnedFd) -> Result<Arc<dyn NativeDevice>, NativeError> {
        // SAFETY: the descriptor is valid for the lifetime of the context,
        // which takes ownership of it below.
        let raw = unsafe { ffi::gbm_create_device(fd.as_raw_fd()) };
        let raw = NonNull::new(raw).ok_or(NativeError::CallFailed("gbm_create_device"))?;
        Ok(Arc::new(GbmContextRef(Arc::new(GbmContext { raw, _fd: fd }))))
    }
}

#[derive(Debug)]
struct GbmContext {
    raw: NonNull<ffi::gbm_device>,
    // Declared after `raw` and closed only after `Drop::drop` destroyed the device.
    _fd: OwnedFd,
}

// SAFETY: libgbm device handles may be used from any thread; callers never
// share a buffer object's map state without the resource mutex.
unsafe impl Send for GbmContext {}
unsafe impl Sync for GbmContext {}

impl Drop for GbmContext {
    fn drop(&mut self) {
        // SAFETY: every buffer object holds an `Arc` of this context, so none
        // is alive anymore.
        unsafe { ffi::gbm_device_destroy(self.raw.as_ptr()) };
    }
}

/// `NativeDevice` view of a context; buffer objects clone the inner `Arc`.
#[derive(Debug)]
struct GbmContextRef(Arc<GbmContext>);

impl NativeDevice for GbmContextRef {
    fn create_bo(
        &self,
        width: u32,
        height: u32,
        format: NativeFormat,
        flags: BindFlags,
    ) -> Result<Box<dyn NativeBo>, NativeError> {
        // SAFETY: the device pointer is live for as long as `self.0` is.
        let bo = unsafe { ffi::gbm_bo_create(self.0.raw.as_ptr(), width, height, format.code(), flags.bits()) };
        let bo = NonNull::new(bo).ok_or_else(|| NativeError::Io(io::Error::last_os_error()))?;
        Ok(Box::new(GbmBo::new(self.0.clone(), bo, width, height, format)))
    }

    fn import_bo(&self, desc: &ImportDescriptor<'_>) -> Result<Box<dyn NativeBo>, NativeError> {
        let stride = i32::try_from(desc.stride)
            .map_err(|_| NativeError::Io(io::Error::new(io::ErrorKind::InvalidInput, "stride overflow")))?;
        let mut data = ffi::gbm_import_fd_modifier_data {
            width: desc.width,
            height: desc.height,
            format: desc.format.code(),
            num_fds: 1,
            fds: [desc.fd.as_raw_fd(), 0, 0, 0],
            strides: [stride, 0, 0, 0],
            offsets: [0; 4],
            modifier: desc.modifier.unwrap_or(0),
        };
        // SAFETY: `data` outlives the call and libgbm dups the descriptor.
        let bo = unsafe {
            ffi::gbm_bo_import(
                self.0.raw.as_ptr(),
                GBM_BO_IMPORT_FD_MODIFIER,
                (&mut data as *mut ffi::gbm_import_fd_modifier_data).cast::<c_void>(),
                0,
            )
        };
        let bo = NonNull::new(bo).ok_or_else(|| NativeError::Io(io::Error::last_os_error()))?;
        Ok(Box::new(GbmBo::new(self.0.clone(), bo, desc.width, desc.height, desc.format)))
    }

    fn supports_modifiers(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct GbmBo {
    raw: NonNull<ffi::gbm_bo>,
    map_data: Option<NonNull<c_void>>,
    width: u32,
    height: u32,
    format: NativeFormat,
    _device: Arc<GbmContext>,
}

// SAFETY: see `GbmContext`; map state is only touched through `&mut self`.
unsafe impl Send for GbmBo {}
unsafe impl Sync for GbmBo {}

impl GbmBo {
    fn new(device: Arc<GbmContext>, raw: NonNull<ffi::gbm_bo>, width: u32, height: u32, format: NativeFormat) -> Self {
        Self {
            raw,
            map_data: None,
            width,
            height,
            format,
            _device: device,
        }
    }
}

impl NativeBo for GbmBo {
    fn export_fd(&self) -> Result<OwnedFd, NativeError> {
        // SAFETY: `raw` is a live buffer object.
        let fd = unsafe { ffi::gbm_bo_get_fd(self.raw.as_ptr()) };
        if fd < 0 {
            return Err(NativeError::CallFailed("gbm_bo_get_fd"));
        }
        // SAFETY: gbm_bo_get_fd returns a new descriptor owned by the caller.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
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
        // SAFETY: `raw` is a live buffer object.
        unsafe { ffi::gbm_bo_get_stride(self.raw.as_ptr()) }
    }

    fn modifier(&self) -> Option<u64> {
        // SAFETY: `raw` is a live buffer object.
        Some(unsafe { ffi::gbm_bo_get_modifier(self.raw.as_ptr()) })
    }

    fn map(&mut self, region: MapRegion, flags: TransferFlags) -> Result<Mapping, NativeError> {
        if self.map_data.is_some() {
            return Err(NativeError::CallFailed("gbm_bo_map: buffer already mapped"));
        }
        let mut stride = 0u32;
        let mut map_data: *mut c_void = ptr::null_mut();
        // SAFETY: out-pointers are valid locals; region bounds are checked by libgbm.
        let addr = unsafe {
            ffi::gbm_bo_map(
                self.raw.as_ptr(),
                region.x,
                region.y,
                region.width,
                region.height,
                flags.bits(),
                &mut stride,
                &mut map_data,
            )
        };
        let Some(addr) = NonNull::new(addr.cast::<u8>()) else {
            error!(?region, "gbm_bo_map returned no address");
            return Err(NativeError::CallFailed("gbm_bo_map"));
        };
        self.map_data = NonNull::new(map_data);
        debug!(?region, stride, "mapped gbm buffer");
        Ok(Mapping { addr, stride })
    }

    fn unmap(&mut self) {
        if let Some(map_data) = self.map_data.take() {
            // SAFETY: `map_data` came from the matching gbm_bo_map call.
            unsafe { ffi::gbm_bo_unmap(self.raw.as_ptr(), map_data.as_ptr()) };
        }
    }
}

impl Drop for GbmBo {
    fn drop(&mut self) {
        self.unmap();
        // SAFETY: the object is destroyed exactly once, here.
        unsafe { ffi::gbm_bo_destroy(self.raw.as_ptr()) };
    }
}
