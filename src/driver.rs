//! The real device: an open hwbinder node plus its read-only payload mapping.

use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::Arc;

use nix::fcntl::{OFlag, open};
use nix::sys::stat::Mode;

use crate::abi::{BinderObject, BinderVersion, BinderWriteRead, NodeDebugInfo, NodeInfoForRef};
use crate::region::SharedRegion;
use crate::traits::{Driver, Transfer};
use crate::{BinderError, Result};

/// `struct flat_binder_object`, as BINDER_SET_CONTEXT_MGR_EXT takes it.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FlatBinderObject {
    pub hdr_type: u32,
    pub flags: u32,
    pub binder: u64,
    pub cookie: u64,
}

mod ioctl {
    use super::FlatBinderObject;
    use crate::abi::{BinderVersion, BinderWriteRead, NodeDebugInfo, NodeInfoForRef};

    nix::ioctl_readwrite!(write_read, b'b', 1, BinderWriteRead);
    nix::ioctl_write_ptr!(set_max_threads, b'b', 5, u32);
    nix::ioctl_write_ptr!(set_context_mgr, b'b', 7, i32);
    nix::ioctl_write_ptr!(thread_exit, b'b', 8, i32);
    nix::ioctl_readwrite!(version, b'b', 9, BinderVersion);
    nix::ioctl_readwrite!(node_debug_info, b'b', 11, NodeDebugInfo);
    nix::ioctl_readwrite!(node_info_for_ref, b'b', 12, NodeInfoForRef);
    nix::ioctl_write_ptr!(set_context_mgr_ext, b'b', 13, FlatBinderObject);
    nix::ioctl_write_ptr!(enable_oneway_spam_detection, b'b', 16, u32);
}

#[derive(Debug)]
pub struct DeviceDriver {
    fd: OwnedFd,
    region: Arc<SharedRegion>,
}

impl DeviceDriver {
    /// Opens `path` and maps `mmap_size` bytes of it.
    pub fn open(path: &Path, mmap_size: usize) -> Result<Self> {
        let raw = open(path, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())
            .map_err(|e| BinderError::errno(e).ctx(format_args!("opening {}", path.display())))?;
        // SAFETY: `open` just returned this descriptor and nothing else owns it.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let region = SharedRegion::map(fd.as_fd(), mmap_size)?;
        Ok(Self { fd, region: Arc::new(region) })
    }

    fn raw(&self) -> RawFd { self.fd.as_raw_fd() }
}

impl Driver for DeviceDriver {
    fn version(&self) -> nix::Result<i32> {
        let mut v = BinderVersion::default();
        // SAFETY: valid fd and a properly sized out-struct.
        unsafe { ioctl::version(self.raw(), &mut v) }?;
        Ok(v.protocol_version)
    }

    fn write_read(&self, write: &[u8], read: &mut [u8]) -> nix::Result<Transfer> {
        let mut bwr = BinderWriteRead {
            write_size: write.len() as u64,
            write_buffer: write.as_ptr() as u64,
            read_size: read.len() as u64,
            read_buffer: read.as_mut_ptr() as u64,
            ..Default::default()
        };
        // SAFETY: both spans outlive the call; the driver stays within the sizes given.
        unsafe { ioctl::write_read(self.raw(), &mut bwr) }?;
        Ok(Transfer { write_consumed: bwr.write_consumed as usize, read_consumed: bwr.read_consumed as usize })
    }

    fn set_max_threads(&self, max: u32) -> nix::Result<()> {
        // SAFETY: pointer to a live u32.
        unsafe { ioctl::set_max_threads(self.raw(), &max) }.map(drop)
    }

    fn enable_oneway_spam_detection(&self, enable: bool) -> nix::Result<()> {
        let enable = enable as u32;
        // SAFETY: pointer to a live u32.
        unsafe { ioctl::enable_oneway_spam_detection(self.raw(), &enable) }.map(drop)
    }

    fn set_context_manager_ext(&self, obj: &BinderObject) -> nix::Result<()> {
        let flat = match *obj {
            BinderObject::Binder { ptr, cookie, flags, .. } => {
                FlatBinderObject { hdr_type: obj.kind(), flags, binder: ptr, cookie }
            }
            _ => return Err(nix::errno::Errno::EINVAL),
        };
        // SAFETY: pointer to a live, fully initialized struct.
        unsafe { ioctl::set_context_mgr_ext(self.raw(), &flat) }.map(drop)
    }

    fn set_context_manager(&self) -> nix::Result<()> {
        let unused = 0i32;
        // SAFETY: pointer to a live i32.
        unsafe { ioctl::set_context_mgr(self.raw(), &unused) }.map(drop)
    }

    fn node_debug_info(&self, ptr: u64) -> nix::Result<NodeDebugInfo> {
        let mut info = NodeDebugInfo { ptr, ..Default::default() };
        // SAFETY: valid fd and a properly sized in/out struct.
        unsafe { ioctl::node_debug_info(self.raw(), &mut info) }?;
        Ok(info)
    }

    fn node_info_for_ref(&self, handle: u32) -> nix::Result<NodeInfoForRef> {
        let mut info = NodeInfoForRef { handle, ..Default::default() };
        // SAFETY: valid fd and a properly sized in/out struct.
        unsafe { ioctl::node_info_for_ref(self.raw(), &mut info) }?;
        Ok(info)
    }

    fn thread_exit(&self) -> nix::Result<()> {
        let unused = 0i32;
        // SAFETY: pointer to a live i32.
        unsafe { ioctl::thread_exit(self.raw(), &unused) }.map(drop)
    }

    fn region(&self) -> Option<Arc<SharedRegion>> { Some(self.region.clone()) }

    fn poll_fd(&self) -> Option<RawFd> { Some(self.raw()) }
}
