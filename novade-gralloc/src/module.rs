//! The allocator module as the HAL sees it.
//!
//! [`GrallocModule`] ties one opened [`Device`] to the buffer entry points.
//! Every entry point returns a [`GrallocError`]; the HAL glue turns it into a
//! negative errno with [`GrallocError::errno`].

use crate::config::{BackendKind, GrallocConfig};
use crate::device::Device;
use crate::error::{DeviceOpenError, GrallocError};
use crate::format::{PixelFormat, UsageFlags};
use crate::handle::BufferHandle;
use crate::lock::{self, Rect};
use crate::native::memfd::MemfdBackend;
use crate::native::{NativeBackend, NativeBo};
use crate::ownership;
use crate::resource;
use std::ptr::NonNull;
use tracing::{debug, info};

#[derive(Debug)]
pub struct GrallocModule {
    device: Device,
}

impl GrallocModule {
    /// Opens the configured backend on the configured device node.
    ///
    /// # Errors
    ///
    /// [`DeviceOpenError::BackendUnavailable`] when the configured backend was
    /// not compiled in, or any error of [`Device::create`].
    pub fn open(config: &GrallocConfig) -> Result<Self, GrallocError> {
        let backend = backend_for(config.device.backend)?;
        let device = Device::create(backend.as_ref(), config)?;
        info!(path = ?device.path(), backend = device.backend_name(), "gralloc module ready");
        Ok(Self { device })
    }

    /// Uses an already opened device.
    pub fn with_device(device: Device) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Allocates a buffer. The returned handle is registered in this process.
    pub fn alloc(&self, width: u32, height: u32, format: PixelFormat, usage: UsageFlags) -> Result<BufferHandle, GrallocError> {
        let mut handle = BufferHandle::new(width, height, format, usage)?;
        let resource = resource::allocate(&self.device, &mut handle)?;
        handle.attach(resource);
        debug!(width, height, ?format, stride = handle.stride(), fd = handle.shareable_fd(), "allocated buffer");
        Ok(handle)
    }

    /// Destroys a buffer allocated by [`alloc`](Self::alloc) and closes its
    /// descriptor.
    ///
    /// # Errors
    ///
    /// [`GrallocError::Validation`] when the handle is not owned by this
    /// process. The handle's own descriptor is closed regardless.
    pub fn free(&self, mut handle: BufferHandle) -> Result<(), GrallocError> {
        let result = ownership::unregister_handle(&mut handle);
        handle.close_fd();
        result
    }

    /// Makes a handle received from another process usable here.
    pub fn register(&self, handle: &mut BufferHandle) -> Result<(), GrallocError> {
        ownership::register_handle(handle, &self.device)
    }

    pub fn unregister(&self, handle: &mut BufferHandle) -> Result<(), GrallocError> {
        ownership::unregister_handle(handle)
    }

    pub fn lock(&self, handle: &BufferHandle, usage: UsageFlags, region: Rect) -> Result<Option<NonNull<u8>>, GrallocError> {
        lock::lock(handle, usage, region)
    }

    pub fn unlock(&self, handle: &BufferHandle) -> Result<(), GrallocError> {
        lock::unlock(handle)
    }

    /// Runs `f` with the native buffer object behind a registered handle.
    ///
    /// `f` runs with the resource mutex held. Calling [`lock`](Self::lock),
    /// [`unlock`](Self::unlock) or anything else that touches the same buffer
    /// from inside `f` deadlocks.
    pub fn native_bo<R>(&self, handle: &BufferHandle, f: impl FnOnce(&dyn NativeBo) -> R) -> Option<R> {
        ownership::with_native_bo(handle, f)
    }
}

fn backend_for(kind: BackendKind) -> Result<Box<dyn NativeBackend>, DeviceOpenError> {
    match kind {
        BackendKind::Memfd => Ok(Box::new(MemfdBackend::new())),
        #[cfg(feature = "gbm")]
        BackendKind::Gbm => Ok(Box::new(crate::native::gbm::GbmBackend)),
        #[cfg(not(feature = "gbm"))]
        BackendKind::Gbm => Err(DeviceOpenError::BackendUnavailable(
            "gbm support is not compiled in".to_string(),
        )),
    }
}
