//! # NovaDE Graphics Buffer Allocator (`novade-gralloc`)
//!
//! `novade-gralloc` implements the graphics buffer allocator HAL on top of a
//! native buffer backend (libgbm on a DRM render node, or anonymous shared
//! memory for software rendering and tests).
//!
//! ## Overview
//!
//! - **Formats and usage**: HAL pixel formats and usage bits are translated to
//!   native formats and bind flags in [`format`].
//! - **Handles**: a [`BufferHandle`] is the fixed-layout record passed between
//!   processes. The resource backing it lives in a process-local slot that is
//!   never encoded.
//! - **Registration**: [`ownership`] imports handles received from other
//!   processes and decides when a cached resource can be trusted.
//! - **Locking**: [`lock`] grants CPU or hardware access with nesting rules and
//!   at most one CPU mapping per buffer.
//! - **Configuration and logging**: TOML configuration and `tracing` based
//!   logging, see [`config`] and [`logging`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use novade_gralloc::{GrallocConfig, GrallocModule, PixelFormat, Rect, UsageFlags};
//!
//! let config = GrallocConfig::load_from_path("/etc/novade/gralloc.toml".as_ref())?;
//! novade_gralloc::logging::init_logging(&config.logging)?;
//! let module = GrallocModule::open(&config)?;
//!
//! let handle = module.alloc(1920, 1080, PixelFormat::Rgba8888, UsageFlags::HW_RENDER)?;
//! let addr = module.lock(&handle, UsageFlags::SW_READ_OFTEN, Rect::new(0, 0, 1920, 1080))?;
//! module.unlock(&handle)?;
//! module.free(handle)?;
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod handle;
pub mod lock;
pub mod logging;
pub mod module;
pub mod native;
pub mod ownership;
pub mod resource;

#[cfg(test)]
mod test_util;

pub use config::{BackendKind, GrallocConfig, PropertySource};
pub use device::Device;
pub use error::{AllocError, ConfigError, DeviceOpenError, GrallocError, ImportError, LockError, Result};
pub use format::{BindFlags, NativeFormat, PixelFormat, UsageFlags};
pub use handle::{BufferHandle, HandleWire};
pub use lock::Rect;
pub use module::GrallocModule;
pub use resource::{LockState, ResourceObject};
