//! Capability surface of the allocator device.
//!
//! The core never talks to a kernel driver directly. A [`NativeBackend`] turns
//! an opened device descriptor into a [`NativeDevice`], which creates and
//! imports [`NativeBo`] buffer objects. Two backends ship with the crate:
//!
//! - [`memfd::MemfdBackend`]: anonymous shared memory, no GPU required.
//! - `gbm::GbmBackend` (feature `gbm`): libgbm on a DRM render node.

use crate::format::{BindFlags, NativeFormat, TransferFlags};
use std::fmt;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::Arc;
use thiserror::Error;

#[cfg(feature = "gbm")]
pub mod gbm;
pub mod memfd;

/// Errors reported by a backend.
#[derive(Debug, Error)]
pub enum NativeError {
    #[error("native I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} is not supported by this device")]
    Unsupported(String),

    #[error("region {region:?} exceeds buffer of {width}x{height}")]
    OutOfBounds { region: MapRegion, width: u32, height: u32 },

    #[error("native call {0} failed")]
    CallFailed(&'static str),
}

/// A rectangle inside a buffer object, in buffer-object pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MapRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Everything needed to rebuild a buffer object from a foreign descriptor.
#[derive(Debug, Clone, Copy)]
pub struct ImportDescriptor<'a> {
    pub fd: BorrowedFd<'a>,
    pub width: u32,
    pub height: u32,
    pub format: NativeFormat,
    pub stride: u32,
    /// Only forwarded when the device supports explicit modifiers.
    pub modifier: Option<u64>,
}

/// A live CPU mapping of a buffer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub addr: NonNull<u8>,
    pub stride: u32,
}

// SAFETY: the address is only dereferenced by the lock holder, and the
// mapping state it belongs to is guarded by the owning resource's mutex.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// Builds device contexts from opened device descriptors.
pub trait NativeBackend {
    /// Short name used in logs and configuration.
    fn name(&self) -> &'static str;

    /// Creates the device context. The descriptor is owned by the context on
    /// success and closed when it is dropped on failure.
    fn create_context(&self, fd: OwnedFd) -> Result<Arc<dyn NativeDevice>, NativeError>;
}

/// A device context able to create and import buffer objects.
///
/// Buffer objects keep their device alive, so the context is only torn down
/// once the last buffer object created from it is gone.
pub trait NativeDevice: Send + Sync + fmt::Debug {
    fn create_bo(
        &self,
        width: u32,
        height: u32,
        format: NativeFormat,
        flags: BindFlags,
    ) -> Result<Box<dyn NativeBo>, NativeError>;

    fn import_bo(&self, desc: &ImportDescriptor<'_>) -> Result<Box<dyn NativeBo>, NativeError>;

    /// Whether buffers carry an explicit tiling/compression modifier.
    fn supports_modifiers(&self) -> bool;
}

/// A native buffer object. Dropping it destroys the object.
pub trait NativeBo: Send + Sync + fmt::Debug {
    /// Exports a new shareable descriptor for the buffer.
    fn export_fd(&self) -> Result<OwnedFd, NativeError>;

    fn width(&self) -> u32;

    fn height(&self) -> u32;

    fn format(&self) -> NativeFormat;

    fn stride(&self) -> u32;

    /// `None` when the device does not track modifiers.
    fn modifier(&self) -> Option<u64>;

    /// Maps `region` for CPU access. At most one mapping is active per object.
    fn map(&mut self, region: MapRegion, flags: TransferFlags) -> Result<Mapping, NativeError>;

    /// Ends the active mapping. Does nothing when nothing is mapped.
    fn unmap(&mut self);
}
