//! Error handling for the allocator core.
//!
//! Every fallible operation returns a [`GrallocError`], which wraps the more
//! specific error of the stage that failed. The HAL glue does not understand
//! Rust errors, so [`GrallocError::errno`] flattens them into the negative
//! integer codes it hands up the stack unchanged.

use crate::format::UsageFlags;
use crate::native::NativeError;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type of the allocator.
#[derive(Debug, Error)]
pub enum GrallocError {
    /// The allocator device could not be opened or its context created.
    #[error("Device Error: {0}")]
    DeviceOpen(#[from] DeviceOpenError),

    /// The native layer refused to allocate a buffer.
    #[error("Allocation Error: {0}")]
    Alloc(#[from] AllocError),

    /// A buffer could not be imported from its shareable descriptor.
    #[error("Import Error: {0}")]
    Import(#[from] ImportError),

    /// A lock request was rejected or the CPU mapping failed.
    #[error("Lock Error: {0}")]
    Lock(#[from] LockError),

    /// The handle is missing, malformed or not owned by this process.
    #[error("Invalid Handle: {0}")]
    Validation(String),

    /// Configuration could not be read or parsed.
    #[error("Configuration Error: {0}")]
    Config(#[from] ConfigError),

    /// The global tracing subscriber could not be installed.
    #[error("Logging Initialization Failed: {0}")]
    LoggingInitialization(String),
}

impl GrallocError {
    /// Negative errno-style status for the HAL entry points.
    pub fn errno(&self) -> i32 {
        match self {
            GrallocError::Alloc(_) | GrallocError::Lock(LockError::MapFailed(_)) => -libc::ENOMEM,
            _ => -libc::EINVAL,
        }
    }
}

/// Failures while bringing up the allocator device.
#[derive(Debug, Error)]
pub enum DeviceOpenError {
    #[error("failed to open {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create device context on {path:?}")]
    Context {
        path: PathBuf,
        #[source]
        source: NativeError,
    },

    /// The configured backend was not compiled into this build.
    #[error("allocator backend '{0}' is not available in this build")]
    BackendUnavailable(String),
}

/// Allocation failure. Carries the geometry the caller asked for, not the
/// adjusted geometry sent to the device.
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("format {format:#x} has no native equivalent")]
    UnsupportedFormat { format: i32 },

    /// The adjusted geometry does not fit the native size type.
    #[error("buffer size {width}x{height} overflows for format {format:#x}")]
    Geometry { width: u32, height: u32, format: i32 },

    #[error("failed to create buffer, size={width}x{height}, fmt={format:#x}, usage={usage:?}")]
    Native {
        width: u32,
        height: u32,
        format: i32,
        usage: UsageFlags,
        #[source]
        source: NativeError,
    },

    /// The buffer was created but its descriptor could not be exported.
    #[error("failed to export shareable descriptor")]
    Export(#[source] NativeError),
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("handle carries no shareable descriptor")]
    MissingDescriptor,

    #[error("format {format:#x} has no native equivalent")]
    UnsupportedFormat { format: i32 },

    #[error("buffer size {width}x{height} overflows for format {format:#x}")]
    Geometry { width: u32, height: u32, format: i32 },

    #[error("native import rejected descriptor {fd}")]
    Native {
        fd: i32,
        #[source]
        source: NativeError,
    },
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock requested without any usage bits")]
    EmptyUsage,

    #[error("buffer declared for {declared:?} cannot be locked for {requested:?}")]
    IncompatibleUsage {
        declared: UsageFlags,
        requested: UsageFlags,
    },

    #[error("buffer already locked for {locked_for:?}, request {requested:?} is not a subset")]
    ConcurrentUsage {
        locked_for: UsageFlags,
        requested: UsageFlags,
    },

    #[error("buffer is already mapped")]
    AlreadyMapped,

    #[error("failed to map buffer")]
    MapFailed(#[source] NativeError),
}

/// Errors from reading or validating the allocator configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file from {path:?}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

pub type Result<T, E = GrallocError> = std::result::Result<T, E>;
