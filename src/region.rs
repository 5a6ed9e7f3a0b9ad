//! The read-only region the driver delivers transaction payloads into.
//!
//! Addresses handed out by the driver are plain integers; every access goes
//! through [`SharedRegion::slice`], which refuses anything outside the mapping.

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::os::fd::BorrowedFd;
use std::ptr::NonNull;

use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};

use crate::{BinderError, Result, StatusCode};

enum Backing {
    Mapped,
    /// Process-local memory standing in for a driver mapping.
    Heap(#[allow(dead_code)] Box<[UnsafeCell<u8>]>),
}

pub struct SharedRegion {
    base: NonNull<u8>,
    len: usize,
    backing: Backing,
}

// SAFETY: the region is only read through bounds-checked shared slices; heap-backed
// regions are written by their emulated driver into ranges no reader has been given yet.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.backing {
            Backing::Mapped => "mapped",
            Backing::Heap(_) => "heap",
        };
        write!(f, "SharedRegion({kind}, {:#x}+{:#x})", self.base(), self.len)
    }
}

impl SharedRegion {
    /// Maps `len` bytes of the driver fd read-only.
    pub fn map(fd: BorrowedFd<'_>, len: usize) -> Result<Self> {
        let size = NonZeroUsize::new(len).ok_or_else(|| BinderError::bad_value("zero-sized mapping"))?;
        // SAFETY: fresh private mapping of a device fd; nothing else aliases it.
        let ptr = unsafe {
            mmap(None, size, ProtFlags::PROT_READ, MapFlags::MAP_PRIVATE | MapFlags::MAP_NORESERVE, fd, 0)
        }
        .map_err(|e| BinderError::errno(e).ctx(format_args!("mmap of {len} bytes failed")))?;
        Ok(Self { base: ptr.cast(), len, backing: Backing::Mapped })
    }

    /// Allocates a zeroed region in process memory.
    pub fn heap(len: usize) -> Self {
        let cells: Box<[UnsafeCell<u8>]> = (0..len.max(1)).map(|_| UnsafeCell::new(0)).collect();
        // UnsafeCell<u8> is repr(transparent) over u8.
        let base = NonNull::new(cells.as_ptr() as *mut u8).unwrap_or(NonNull::dangling());
        Self { base, len, backing: Backing::Heap(cells) }
    }

    pub fn base(&self) -> u64 { self.base.as_ptr() as u64 }
    pub fn len(&self) -> usize { self.len }
    pub fn is_empty(&self) -> bool { self.len == 0 }

    pub fn contains(&self, addr: u64, len: usize) -> bool {
        let base = self.base();
        addr >= base
            && addr.checked_add(len as u64).is_some_and(|end| end <= base + self.len as u64)
    }

    /// Resolves a driver-supplied address range to bytes.
    pub fn slice(&self, addr: u64, len: usize) -> Result<&[u8]> {
        if !self.contains(addr, len) {
            return Err(BinderError::new(StatusCode::BadValue)
                .ctx(format_args!("range {addr:#x}+{len} outside {self:?}")));
        }
        if len == 0 {
            return Ok(&[]);
        }
        let offset = (addr - self.base()) as usize;
        // SAFETY: bounds checked above; the range stays mapped for the life of `self`.
        Ok(unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(offset), len) })
    }

    /// Copies `data` into a heap-backed region at `addr`.
    ///
    /// The caller must not have handed out the target range to any reader.
    pub(crate) fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        if !matches!(self.backing, Backing::Heap(_)) {
            return Err(BinderError::new(StatusCode::InvalidOperation).ctx("driver mapping is read-only"));
        }
        if !self.contains(addr, data.len()) {
            return Err(BinderError::bad_value(format_args!("write {addr:#x}+{} outside region", data.len())));
        }
        let offset = (addr - self.base()) as usize;
        // SAFETY: in bounds, and heap cells permit interior mutation.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.base.as_ptr().add(offset), data.len());
        }
        Ok(())
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Backing::Mapped = self.backing {
            // SAFETY: base/len came from our own successful mmap.
            if let Err(e) = unsafe { munmap(self.base.cast::<c_void>(), self.len) } {
                log::warn!("munmap of binder region failed: {e}");
            }
        }
    }
}
