//! Allocator device lifecycle.

use crate::config::{PropertySource, DEFAULT_DEVICE_PATH, DEVICE_PROPERTY};
use crate::error::DeviceOpenError;
use crate::native::{NativeBackend, NativeDevice};
use std::fs::OpenOptions;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

/// An opened allocator device.
///
/// Buffer objects created from it share the underlying context, so dropping
/// the `Device` while buffers are alive is safe: the context is torn down with
/// the last of them.
#[derive(Debug, Clone)]
pub struct Device {
    native: Arc<dyn NativeDevice>,
    path: PathBuf,
    backend: &'static str,
}

impl Device {
    /// Opens the device named by the `gralloc.gbm.device` property and builds
    /// the backend context on it.
    ///
    /// # Errors
    ///
    /// [`DeviceOpenError::Open`] if the node cannot be opened read/write, and
    /// [`DeviceOpenError::Context`] if the backend rejects it. In the latter
    /// case the descriptor has already been closed.
    pub fn create(backend: &dyn NativeBackend, properties: &dyn PropertySource) -> Result<Self, DeviceOpenError> {
        let path = PathBuf::from(properties.string_property(DEVICE_PROPERTY, DEFAULT_DEVICE_PATH));
        Self::open(backend, &path)
    }

    /// Opens `path` directly, bypassing property lookup.
    pub fn open(backend: &dyn NativeBackend, path: &Path) -> Result<Self, DeviceOpenError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .map_err(|source| {
                error!(?path, %source, "failed to open allocator device");
                DeviceOpenError::Open {
                    path: path.to_path_buf(),
                    source,
                }
            })?;

        // On failure the backend drops the descriptor, which closes it.
        let native = backend.create_context(OwnedFd::from(file)).map_err(|source| {
            error!(?path, backend = backend.name(), %source, "failed to create device context");
            DeviceOpenError::Context {
                path: path.to_path_buf(),
                source,
            }
        })?;

        info!(?path, backend = backend.name(), "allocator device opened");
        Ok(Self {
            native,
            path: path.to_path_buf(),
            backend: backend.name(),
        })
    }

    /// Wraps an existing context, e.g. one shared with a compositor.
    pub fn from_native(native: Arc<dyn NativeDevice>, backend: &'static str) -> Self {
        Self {
            native,
            path: PathBuf::new(),
            backend,
        }
    }

    /// Releases this reference to the device. The context is destroyed before
    /// its descriptor is closed once no buffer object uses it anymore.
    pub fn destroy(self) {
        debug!(path = ?self.path, "destroying allocator device");
        drop(self);
    }

    pub fn native(&self) -> &dyn NativeDevice {
        self.native.as_ref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend
    }
}
