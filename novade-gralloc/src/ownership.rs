//! Resolving a handle to this process's resource, plus registration.
//!
//! A handle either already carries a resource created in this process (fast
//! path) or came from elsewhere and needs its descriptor imported first.

use crate::device::Device;
use crate::error::GrallocError;
use crate::handle::{current_pid, BufferHandle};
use crate::native::NativeBo;
use crate::resource::{self, ResourceObject};
use tracing::{debug, warn};

/// Returns the resource of `handle` for the calling process.
///
/// With `device == None` this only checks for a local resource. Otherwise a
/// missing resource is imported and cached in the handle. An import failure
/// yields `None` and leaves the handle untouched.
pub fn resolve<'a>(handle: &'a mut BufferHandle, device: Option<&Device>) -> Option<&'a ResourceObject> {
    if handle.local_resource().is_some() {
        return handle.local_resource();
    }

    let device = device?;
    debug!(
        owner = handle.owner_pid(),
        pid = current_pid(),
        fd = handle.shareable_fd(),
        "importing foreign handle"
    );
    match resource::import(device, handle) {
        Ok(resource) => Some(handle.attach(resource)),
        Err(err) => {
            warn!(%err, "failed to import buffer handle");
            None
        }
    }
}

/// Makes a handle received from another process usable here.
pub fn register_handle(handle: &mut BufferHandle, device: &Device) -> Result<(), GrallocError> {
    resolve(handle, Some(device))
        .map(|_| ())
        .ok_or_else(|| GrallocError::Validation("cannot import buffer handle".to_string()))
}

/// Releases this process's resource and clears the owner, so the handle can
/// be registered again from scratch.
///
/// # Errors
///
/// [`GrallocError::Validation`] when the handle has no local resource.
pub fn unregister_handle(handle: &mut BufferHandle) -> Result<(), GrallocError> {
    let resource = handle
        .detach()
        .ok_or_else(|| GrallocError::Validation("handle is not registered in this process".to_string()))?;
    resource.release();
    Ok(())
}

/// Runs `f` with the native buffer object behind a locally owned handle.
pub fn with_native_bo<R>(handle: &BufferHandle, f: impl FnOnce(&dyn NativeBo) -> R) -> Option<R> {
    handle.local_resource().map(|resource| resource.with_native_bo(f))
}
