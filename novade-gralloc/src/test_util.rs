//! Fixtures shared by the unit tests.

use crate::device::Device;
use crate::native::memfd::MemfdBackend;
use crate::native::NativeBackend;
use std::mem::MaybeUninit;
use std::os::fd::{OwnedFd, RawFd};

/// A memfd-backed device that does not need a real device node.
pub(crate) fn memfd_device() -> Device {
    let file = tempfile::tempfile().expect("tempfile for device node");
    let native = MemfdBackend::new()
        .create_context(OwnedFd::from(file))
        .expect("memfd context");
    Device::from_native(native, "memfd")
}

/// `(st_dev, st_ino)` of the file behind `fd`, or `None` if it is not open.
pub(crate) fn fd_identity(fd: RawFd) -> Option<(u64, u64)> {
    let mut stat = MaybeUninit::<libc::stat>::uninit();
    // SAFETY: fstat only writes into `stat` and reports a bad descriptor as an error.
    if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } != 0 {
        return None;
    }
    // SAFETY: fstat succeeded, so `stat` is initialized.
    let stat = unsafe { stat.assume_init() };
    Some((stat.st_dev as u64, stat.st_ino as u64))
}
