//! CPU access locking.
//!
//! Each resource tracks how many lock holders it has and the union of the
//! usages they were granted. Locks with compatible usage nest; a software
//! usage additionally needs a CPU mapping, and only one mapping may be active
//! at a time. Nothing here waits: a conflicting request fails immediately.
//! For hardware-only usage the driver is expected to synchronize access.

use crate::error::{GrallocError, LockError};
use crate::format::{planar_extent, TransferFlags, UsageFlags};
use crate::handle::BufferHandle;
use crate::native::{MapRegion, NativeError};
use std::ptr::NonNull;
use tracing::{error, info, warn};

/// Rectangle a caller wants to access, in logical buffer pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }
}

/// Declared usages that may be locked for anything, so that software
/// rendering fallbacks can reach hardware buffers.
fn lock_exempt(declared: UsageFlags) -> bool {
    declared.intersects(UsageFlags::SW_READ_OFTEN | UsageFlags::HW_FB | UsageFlags::HW_TEXTURE)
}

/// Locks a registered buffer for `usage`.
///
/// Returns the CPU address of the buffer origin when the combined usage needs
/// software access, `None` for hardware-only locks.
///
/// # Errors
///
/// [`GrallocError::Validation`] if the handle has no local resource, and a
/// [`LockError`] for incompatible usage, an existing mapping or a failed map.
pub fn lock(handle: &BufferHandle, usage: UsageFlags, region: Rect) -> Result<Option<NonNull<u8>>, GrallocError> {
    let resource = handle
        .local_resource()
        .ok_or_else(|| GrallocError::Validation("lock on unregistered handle".to_string()))?;
    if usage.is_empty() {
        return Err(LockError::EmptyUsage.into());
    }

    let mut state = resource.state();
    info!(lock_count = state.lock_count, ?usage, "lock bo");

    let declared = handle.usage();
    if !declared.contains(usage) && !lock_exempt(declared) {
        error!(?declared, requested = ?usage, "usage not allowed by buffer");
        return Err(LockError::IncompatibleUsage { declared, requested: usage }.into());
    }

    if state.lock_count > 0 && !state.locked_for.contains(usage) {
        return Err(LockError::ConcurrentUsage {
            locked_for: state.locked_for,
            requested: usage,
        }
        .into());
    }

    let combined = usage | state.locked_for;
    let mut addr = None;
    if combined.needs_cpu_access() {
        if state.mapping.is_some() {
            return Err(LockError::AlreadyMapped.into());
        }

        let (mut width, mut height) = (region.width, region.height);
        if handle.is_packed_planar() {
            if region.x != 0 || region.y != 0 {
                warn!(x = region.x, y = region.y, "can't map planar buffer with offset");
            }
            (width, height) = planar_extent(width, height).ok_or_else(|| {
                let region = MapRegion {
                    x: region.x,
                    y: region.y,
                    width,
                    height,
                };
                error!(?region, "planar lock region overflows");
                LockError::MapFailed(NativeError::OutOfBounds {
                    region,
                    width: handle.width(),
                    height: handle.height(),
                })
            })?;
        }

        let flags = if combined.wants_cpu_write() {
            TransferFlags::READ_WRITE
        } else {
            TransferFlags::READ
        };
        let map_region = MapRegion {
            x: 0,
            y: 0,
            width: region.x.saturating_add(width),
            height: region.y.saturating_add(height),
        };
        let mapping = state.bo.map(map_region, flags).map_err(|err| {
            error!(%err, ?map_region, "failed to map bo");
            LockError::MapFailed(err)
        })?;
        addr = Some(mapping.addr);
        state.mapping = Some(mapping);
    }

    state.lock_count += 1;
    state.locked_for |= combined;
    Ok(addr)
}

/// Drops one lock on a registered buffer. Unlocking an unlocked buffer is a
/// no-op.
///
/// # Errors
///
/// [`GrallocError::Validation`] if the handle has no local resource.
pub fn unlock(handle: &BufferHandle) -> Result<(), GrallocError> {
    let resource = handle
        .local_resource()
        .ok_or_else(|| GrallocError::Validation("unlock on unregistered handle".to_string()))?;
    let mut state = resource.state();

    if state.lock_count == 0 {
        return Ok(());
    }

    if state.locked_for.needs_cpu_access() && state.mapping.take().is_some() {
        state.bo.unmap();
    }

    state.lock_count -= 1;
    if state.lock_count == 0 {
        state.locked_for = UsageFlags::empty();
    }
    Ok(())
}
