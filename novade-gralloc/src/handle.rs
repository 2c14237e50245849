//! Buffer handles.
//!
//! A [`BufferHandle`] is what travels between processes. Its wire part,
//! [`HandleWire`], is a fixed-size POD copied by value by the transport. The
//! live [`ResourceObject`] is cached next to it in a process-local slot that is
//! never encoded: a decoded handle always starts without a resource, whatever
//! `owner_pid` it carries.

use crate::error::GrallocError;
use crate::format::{PixelFormat, UsageFlags};
use crate::resource::ResourceObject;
use byteorder::{ByteOrder, LittleEndian};
use once_cell::sync::Lazy;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Magic tag identifying an encoded handle.
pub const HANDLE_MAGIC: u32 = 0x5f47_424d;

const FLAG_HAS_MODIFIER: u32 = 1 << 0;

static PID: Lazy<u32> = Lazy::new(std::process::id);

/// Id of the calling process, computed once.
pub fn current_pid() -> u32 {
    *PID
}

/// Wire form of a buffer handle. Field order and size are fixed for a build.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleWire {
    pub magic: u32,
    pub width: u32,
    pub height: u32,
    pub format: i32,
    pub usage: u32,
    pub stride: u32,
    pub flags: u32,
    /// Process that attached a resource last; 0 when none.
    pub owner_pid: u32,
    pub modifier: u64,
    /// Shareable descriptor, -1 until allocated.
    pub fd: i32,
    pub reserved: u32,
}

impl HandleWire {
    pub const ENCODED_LEN: usize = 48;
    /// Descriptors the transport has to pass alongside the integers.
    pub const NUM_FDS: usize = 1;
    /// 32-bit integers in the encoded form, descriptors excluded.
    pub const NUM_INTS: usize = Self::ENCODED_LEN / 4 - Self::NUM_FDS;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        LittleEndian::write_u32(&mut buf[0..4], self.magic);
        LittleEndian::write_u32(&mut buf[4..8], self.width);
        LittleEndian::write_u32(&mut buf[8..12], self.height);
        LittleEndian::write_i32(&mut buf[12..16], self.format);
        LittleEndian::write_u32(&mut buf[16..20], self.usage);
        LittleEndian::write_u32(&mut buf[20..24], self.stride);
        LittleEndian::write_u32(&mut buf[24..28], self.flags);
        LittleEndian::write_u32(&mut buf[28..32], self.owner_pid);
        LittleEndian::write_u64(&mut buf[32..40], self.modifier);
        LittleEndian::write_i32(&mut buf[40..44], self.fd);
        LittleEndian::write_u32(&mut buf[44..48], self.reserved);
        buf
    }

    /// Parses an encoded handle.
    ///
    /// # Errors
    ///
    /// [`GrallocError::Validation`] on a wrong length or magic.
    pub fn decode(bytes: &[u8]) -> Result<Self, GrallocError> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(GrallocError::Validation(format!(
                "encoded handle is {} bytes, expected {}",
                bytes.len(),
                Self::ENCODED_LEN
            )));
        }
        let wire = Self {
            magic: LittleEndian::read_u32(&bytes[0..4]),
            width: LittleEndian::read_u32(&bytes[4..8]),
            height: LittleEndian::read_u32(&bytes[8..12]),
            format: LittleEndian::read_i32(&bytes[12..16]),
            usage: LittleEndian::read_u32(&bytes[16..20]),
            stride: LittleEndian::read_u32(&bytes[20..24]),
            flags: LittleEndian::read_u32(&bytes[24..28]),
            owner_pid: LittleEndian::read_u32(&bytes[28..32]),
            modifier: LittleEndian::read_u64(&bytes[32..40]),
            fd: LittleEndian::read_i32(&bytes[40..44]),
            reserved: LittleEndian::read_u32(&bytes[44..48]),
        };
        if wire.magic != HANDLE_MAGIC {
            return Err(GrallocError::Validation(format!("bad handle magic {:#x}", wire.magic)));
        }
        Ok(wire)
    }
}

#[derive(Debug)]
struct LocalResource {
    pid: u32,
    resource: Box<ResourceObject>,
}

/// A graphics buffer as seen by one process.
///
/// The handle owns its shareable descriptor and closes it when dropped. The
/// `fd` field of the wire form always mirrors that descriptor, or is -1.
#[derive(Debug)]
pub struct BufferHandle {
    wire: HandleWire,
    fd: Option<OwnedFd>,
    local: Option<LocalResource>,
}

impl BufferHandle {
    /// Describes a buffer that has not been allocated yet.
    ///
    /// # Errors
    ///
    /// [`GrallocError::Validation`] when a dimension is zero.
    pub fn new(width: u32, height: u32, format: PixelFormat, usage: UsageFlags) -> Result<Self, GrallocError> {
        if width == 0 || height == 0 {
            return Err(GrallocError::Validation(format!("invalid buffer size {width}x{height}")));
        }
        Ok(Self {
            wire: HandleWire {
                magic: HANDLE_MAGIC,
                width,
                height,
                format: format.as_raw(),
                usage: usage.bits(),
                stride: 0,
                flags: 0,
                owner_pid: 0,
                modifier: 0,
                fd: -1,
                reserved: 0,
            },
            fd: None,
            local: None,
        })
    }

    /// Rebuilds a handle received from the transport, adopting the descriptor
    /// that was passed alongside it. The descriptor number carried in `wire`
    /// belongs to the sender and is replaced. No resource is attached.
    pub fn from_wire(mut wire: HandleWire, fd: Option<OwnedFd>) -> Self {
        wire.fd = fd.as_ref().map_or(-1, AsRawFd::as_raw_fd);
        Self { wire, fd, local: None }
    }

    /// Decodes and validates an encoded handle, adopting `fd` as in
    /// [`from_wire`](Self::from_wire).
    pub fn decode(bytes: &[u8], fd: Option<OwnedFd>) -> Result<Self, GrallocError> {
        let wire = HandleWire::decode(bytes)?;
        if wire.width == 0 || wire.height == 0 {
            return Err(GrallocError::Validation(format!(
                "invalid buffer size {}x{}",
                wire.width, wire.height
            )));
        }
        Ok(Self::from_wire(wire, fd))
    }

    /// Copies the handle the way a transport does: same wire fields, a
    /// duplicated descriptor and no resource.
    pub fn try_clone(&self) -> io::Result<Self> {
        let fd = self.fd.as_ref().map(|fd| fd.try_clone()).transpose()?;
        Ok(Self::from_wire(self.wire, fd))
    }

    pub fn to_wire(&self) -> HandleWire {
        self.wire
    }

    pub fn encode(&self) -> [u8; HandleWire::ENCODED_LEN] {
        self.wire.encode()
    }

    pub fn width(&self) -> u32 {
        self.wire.width
    }

    pub fn height(&self) -> u32 {
        self.wire.height
    }

    /// Raw HAL format code.
    pub fn raw_format(&self) -> i32 {
        self.wire.format
    }

    /// `None` when the handle carries a code this build does not know.
    pub fn format(&self) -> Option<PixelFormat> {
        PixelFormat::from_raw(self.wire.format)
    }

    pub fn usage(&self) -> UsageFlags {
        UsageFlags::from_bits_retain(self.wire.usage)
    }

    pub fn shareable_fd(&self) -> RawFd {
        self.wire.fd
    }

    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(AsFd::as_fd)
    }

    pub fn stride(&self) -> u32 {
        self.wire.stride
    }

    pub fn modifier(&self) -> Option<u64> {
        (self.wire.flags & FLAG_HAS_MODIFIER != 0).then_some(self.wire.modifier)
    }

    pub fn owner_pid(&self) -> u32 {
        self.wire.owner_pid
    }

    /// Whether the planar packing rule applies to this buffer.
    pub fn is_packed_planar(&self) -> bool {
        self.format().map_or(false, PixelFormat::is_packed_planar)
    }

    /// Closes the shareable descriptor, if any.
    pub fn close_fd(&mut self) {
        self.fd = None;
        self.wire.fd = -1;
    }

    pub(crate) fn set_allocation(&mut self, fd: OwnedFd, stride: u32, modifier: Option<u64>) {
        self.wire.fd = fd.as_raw_fd();
        self.fd = Some(fd);
        self.wire.stride = stride;
        match modifier {
            Some(modifier) => {
                self.wire.flags |= FLAG_HAS_MODIFIER;
                self.wire.modifier = modifier;
            }
            None => {
                self.wire.flags &= !FLAG_HAS_MODIFIER;
                self.wire.modifier = 0;
            }
        }
    }

    /// The cached resource, trusted only when both the wire owner and the slot
    /// belong to the calling process.
    pub(crate) fn local_resource(&self) -> Option<&ResourceObject> {
        let pid = current_pid();
        match &self.local {
            Some(local) if local.pid == pid && self.wire.owner_pid == pid => Some(&*local.resource),
            _ => None,
        }
    }

    pub(crate) fn attach(&mut self, resource: ResourceObject) -> &ResourceObject {
        let pid = current_pid();
        self.wire.owner_pid = pid;
        let local = self.local.insert(LocalResource {
            pid,
            resource: Box::new(resource),
        });
        &*local.resource
    }

    /// Removes the locally owned resource and clears the owner.
    pub(crate) fn detach(&mut self) -> Option<ResourceObject> {
        self.local_resource()?;
        self.wire.owner_pid = 0;
        self.local.take().map(|local| *local.resource)
    }

    #[cfg(test)]
    pub(crate) fn set_owner_pid(&mut self, pid: u32) {
        self.wire.owner_pid = pid;
    }
}
