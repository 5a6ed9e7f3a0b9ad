//! Embedded objects: binders, file descriptors, scatter-gather buffers and
//! native handles, plus the object-table bookkeeping that goes with them.

use std::os::fd::RawFd;

use crate::abi::{BINDER_BUFFER_FLAG_HAS_PARENT, BinderObject};
use crate::binder::{Binder, LocalObject, WeakBinder};
use crate::process::ProcessState;
use crate::refs::{Sp, Wp};
use crate::{BinderError, Result, StatusCode};

use super::{BufferEntry, Held, Parcel, Storage};

const NATIVE_HANDLE_HEADER: usize = 12;
const NATIVE_HANDLE_VERSION: i32 = NATIVE_HANDLE_HEADER as i32;
const NATIVE_HANDLE_MAX_FDS: i32 = 1024;
const NATIVE_HANDLE_MAX_INTS: i32 = 1024;
const BUFFER_ALIGNMENT: u64 = 8;

/// A bundle of file descriptors and integers moved as one unit.
///
/// The Parcel never owns the fds of a written handle. Fds of a read handle belong
/// to the received buffer; dup them to keep them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NativeHandle {
    pub fds: Vec<RawFd>,
    pub ints: Vec<i32>,
}

impl NativeHandle {
    fn encoded_len(&self) -> usize {
        NATIVE_HANDLE_HEADER + 4 * (self.fds.len() + self.ints.len())
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let num_fds = i32::try_from(self.fds.len()).ok().filter(|n| *n <= NATIVE_HANDLE_MAX_FDS);
        let num_ints = i32::try_from(self.ints.len()).ok().filter(|n| *n <= NATIVE_HANDLE_MAX_INTS);
        let (Some(num_fds), Some(num_ints)) = (num_fds, num_ints) else {
            return Err(BinderError::bad_value("native handle too large"));
        };
        let mut out = Vec::with_capacity(self.encoded_len());
        for v in [NATIVE_HANDLE_VERSION, num_fds, num_ints].into_iter().chain(self.fds.iter().copied()).chain(self.ints.iter().copied()) {
            out.extend_from_slice(&v.to_ne_bytes());
        }
        Ok(out)
    }
}

fn i32_at(bytes: &[u8], index: usize) -> i32 {
    let at = index * 4;
    i32::from_ne_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Null objects are handed back as-is and never looked up in the object table.
fn is_null_on_read(obj: &BinderObject) -> bool {
    match *obj {
        BinderObject::Binder { ptr, cookie, .. } => ptr == 0 && cookie == 0,
        BinderObject::Handle { handle, cookie, .. } => handle == 0 && cookie == 0,
        BinderObject::Buffer { buffer, .. } => buffer == 0,
        BinderObject::Fd { .. } | BinderObject::FdArray { .. } => false,
    }
}

fn close_fd(fd: RawFd) {
    if let Err(e) = nix::unistd::close(fd) {
        log::warn!("closing received fd {fd}: {e}");
    }
}

impl Parcel {
    pub(crate) fn object_size_at(&self, off: usize) -> Option<usize> {
        let bytes = self.data().get(off..)?;
        BinderObject::peek_kind(bytes).ok().and_then(BinderObject::size_of_kind)
    }

    fn object_at(&self, off: u64) -> Result<BinderObject> {
        let bytes = usize::try_from(off).ok().and_then(|o| self.data().get(o..)).unwrap_or_default();
        BinderObject::decode(bytes)
    }

    fn object_at_index(&self, index: usize) -> Result<BinderObject> {
        let off = *self
            .objects
            .get(index)
            .ok_or_else(|| BinderError::bad_value(format_args!("object index {index} out of range")))?;
        self.object_at(off)
    }

    /// Appends an object, entering it in the object table unless it is null.
    ///
    /// No references are taken for binder objects written this way; use
    /// [`Parcel::write_strong_binder`] for that.
    pub fn write_object(&mut self, obj: &BinderObject) -> Result<()> {
        self.write_object_held(obj, None)
    }

    fn write_object_held(&mut self, obj: &BinderObject, held: Option<Held>) -> Result<()> {
        let carries_fds = matches!(obj, BinderObject::Fd { .. } | BinderObject::FdArray { .. });
        if carries_fds && !self.allow_fds {
            return Err(BinderError::new(StatusCode::FdsNotAllowed));
        }
        let offset = self.data_size() as u64;
        self.objects.try_reserve(1).map_err(|_| BinderError::no_memory(self.objects.len() + 1))?;
        self.write_unpadded(&obj.encode())?;
        if obj.is_null() {
            return Ok(());
        }
        self.objects.push(offset);
        if carries_fds {
            self.fds_known.set(Some(true));
        }
        if let Some(held) = held {
            self.held.push((offset, held));
        }
        Ok(())
    }

    /// Reads the object under the cursor.
    pub fn read_object(&self) -> Result<BinderObject> {
        self.read_object_indexed().map(|(obj, _)| obj)
    }

    /// The object under the cursor and, unless null, its index in the object table.
    pub(crate) fn read_object_indexed(&self) -> Result<(BinderObject, Option<usize>)> {
        let dpos = self.read_pos.get();
        let bytes = self.data().get(dpos..).unwrap_or_default();
        let kind = BinderObject::peek_kind(bytes)?;
        let size = BinderObject::size_of_kind(kind)
            .ok_or_else(|| BinderError::bad_type(format_args!("object type {kind:#010x} at {dpos}")))?;
        if bytes.len() < size {
            return Err(BinderError::not_enough_data(size, bytes.len()));
        }
        let obj = BinderObject::decode(&bytes[..size])?;
        if is_null_on_read(&obj) {
            self.read_pos.set(dpos + size);
            return Ok((obj, None));
        }
        match self.find_object_index(dpos as u64) {
            Some(index) => {
                self.read_pos.set(dpos + size);
                self.next_object_hint.set(index + 1);
                Ok((obj, Some(index)))
            }
            None => {
                log::warn!("object at {dpos} is not in the object table ({} entries)", self.objects.len());
                Err(BinderError::bad_value(format_args!("no object recorded at offset {dpos}")))
            }
        }
    }

    /// Scans forward then backward from the hint.
    fn find_object_index(&self, dpos: u64) -> Option<usize> {
        let objs = &self.objects;
        let n = objs.len();
        if n == 0 {
            return None;
        }
        let mut opos = self.next_object_hint.get();
        if opos < n {
            while opos < n - 1 && objs[opos] < dpos {
                opos += 1;
            }
        } else {
            opos = n - 1;
        }
        if objs[opos] == dpos {
            return Some(opos);
        }
        while opos > 0 && objs[opos] > dpos {
            opos -= 1;
        }
        (objs[opos] == dpos).then_some(opos)
    }

    // ---- binders ----

    pub fn write_strong_binder(&mut self, binder: Option<&Binder>) -> Result<()> {
        match binder {
            None => self.write_object(&BinderObject::null_binder()),
            Some(Binder::Local(local)) => {
                if let Some(process) = self.process() {
                    process.publish_local(local);
                }
                let obj = BinderObject::Binder {
                    weak: false,
                    ptr: local.token(),
                    cookie: local.cookie(),
                    flags: local.flat_flags(),
                };
                self.write_object_held(&obj, Some(Held::Local(local.clone())))
            }
            Some(Binder::Remote(proxy)) => {
                let obj = BinderObject::Handle {
                    weak: false,
                    handle: proxy.handle(),
                    cookie: 0,
                    flags: crate::abi::FLAT_BINDER_FLAG_ACCEPTS_FDS,
                };
                self.write_object_held(&obj, Some(Held::Remote(proxy.clone())))
            }
        }
    }

    pub fn write_weak_binder(&mut self, binder: Option<&WeakBinder>) -> Result<()> {
        match binder {
            None => self.write_object(&BinderObject::Binder { weak: true, ptr: 0, cookie: 0, flags: 0 }),
            Some(WeakBinder::Local(local)) => {
                let obj = local.unsafe_get();
                let obj_desc = BinderObject::Binder {
                    weak: true,
                    ptr: obj.token(),
                    cookie: obj.cookie(),
                    flags: obj.flat_flags(),
                };
                self.write_object_held(&obj_desc, Some(Held::LocalWeak(local.clone())))
            }
            Some(WeakBinder::Remote(proxy)) => {
                let obj = BinderObject::Handle {
                    weak: true,
                    handle: proxy.unsafe_get().handle(),
                    cookie: 0,
                    flags: crate::abi::FLAT_BINDER_FLAG_ACCEPTS_FDS,
                };
                self.write_object_held(&obj, Some(Held::RemoteWeak(proxy.clone())))
            }
        }
    }

    fn require_process(&self) -> Result<std::sync::Arc<ProcessState>> {
        self.process()
            .ok_or_else(|| BinderError::new(StatusCode::NoInit).ctx("no driver gateway to resolve binder objects"))
    }

    fn resolve_local(&self, ptr: u64, cookie: u64) -> Result<std::sync::Arc<LocalObject>> {
        let held = self.held.iter().find_map(|(_, h)| match h {
            Held::Local(sp) if sp.token() == ptr && sp.cookie() == cookie => Some(Sp::as_arc(sp).clone()),
            Held::LocalWeak(wp) if wp.unsafe_get().token() == ptr && wp.unsafe_get().cookie() == cookie => {
                Some(wp.unsafe_get().clone())
            }
            _ => None,
        });
        if let Some(obj) = held {
            return Ok(obj);
        }
        self.require_process()?
            .lookup_local(ptr, cookie)
            .ok_or_else(|| BinderError::bad_value(format_args!("no local object {ptr:#x}/{cookie:#x}")))
    }

    pub fn read_strong_binder(&self) -> Result<Option<Binder>> {
        match self.read_object()? {
            BinderObject::Binder { weak: false, ptr: 0, .. } => Ok(None),
            BinderObject::Binder { weak: false, ptr, cookie, .. } => {
                let obj = self.resolve_local(ptr, cookie)?;
                LocalObject::promote(&obj)
                    .map(|sp| Some(Binder::Local(sp)))
                    .ok_or_else(|| BinderError::new(StatusCode::DeadObject).ctx("local object already released"))
            }
            BinderObject::Handle { weak: false, handle, .. } => {
                let process = self.require_process()?;
                Ok(process.get_strong_proxy_for_handle(handle).map(Binder::Remote))
            }
            other => Err(BinderError::bad_type(format_args!("expected strong binder, found {:#010x}", other.kind()))),
        }
    }

    pub fn read_weak_binder(&self) -> Result<Option<WeakBinder>> {
        match self.read_object()? {
            BinderObject::Binder { ptr: 0, .. } => Ok(None),
            BinderObject::Binder { ptr, cookie, .. } => {
                let obj = self.resolve_local(ptr, cookie)?;
                Ok(Some(WeakBinder::Local(Wp::new(obj))))
            }
            BinderObject::Handle { handle, .. } => {
                let process = self.require_process()?;
                Ok(process.get_weak_proxy_for_handle(handle).map(WeakBinder::Remote))
            }
            other => Err(BinderError::bad_type(format_args!("expected binder, found {:#010x}", other.kind()))),
        }
    }

    // ---- file descriptors ----

    /// Writes `fd`. With `take_ownership` the Parcel closes it when released.
    pub fn write_file_descriptor(&mut self, fd: RawFd, take_ownership: bool) -> Result<()> {
        self.write_object(&BinderObject::Fd { fd, cookie: take_ownership as u64 })
    }

    /// The fd stays owned by the Parcel; dup it to keep it.
    pub fn read_file_descriptor(&self) -> Result<RawFd> {
        match self.read_object()? {
            BinderObject::Fd { fd, .. } => Ok(fd),
            other => Err(BinderError::bad_type(format_args!("expected fd, found {:#010x}", other.kind()))),
        }
    }

    pub fn has_fds(&self) -> bool {
        if self.fds_known.get().is_none() {
            self.scan_for_fds();
        }
        self.fds_known.get().unwrap_or(false)
    }

    pub(crate) fn scan_for_fds(&self) {
        let found = self.objects.iter().any(|&off| {
            matches!(self.object_at(off), Ok(BinderObject::Fd { .. } | BinderObject::FdArray { .. }))
        });
        self.fds_known.set(Some(found));
    }

    /// Closes every fd object, owned or not.
    pub fn close_file_descriptors(&self) {
        for &off in self.objects.iter().rev() {
            if let Ok(BinderObject::Fd { fd, .. }) = self.object_at(off) {
                close_fd(fd);
            }
        }
    }

    /// Closes owned fds among the objects from `first` on.
    pub(crate) fn release_objects_from(&self, first: usize) {
        for &off in self.objects.iter().skip(first).rev() {
            if let Ok(BinderObject::Fd { fd, cookie }) = self.object_at(off) {
                if cookie != 0 {
                    close_fd(fd);
                }
            }
        }
    }

    /// Takes a reference for every binder object, as a fresh owner of copied bytes.
    pub(crate) fn acquire_objects(&mut self) {
        let process = self.process();
        let offsets = self.objects.clone();
        for off in offsets.into_iter().rev() {
            let held = match self.object_at(off) {
                Ok(BinderObject::Binder { ptr, cookie, weak, .. }) if ptr != 0 => {
                    let obj = process.as_ref().and_then(|p| p.lookup_local(ptr, cookie));
                    match (obj, weak) {
                        (Some(obj), true) => Some(Held::LocalWeak(Wp::new(obj))),
                        (Some(obj), false) => LocalObject::promote(&obj).map(Held::Local),
                        (None, _) => None,
                    }
                }
                Ok(BinderObject::Handle { handle, weak, .. }) => match (&process, weak) {
                    (Some(p), true) => p.get_weak_proxy_for_handle(handle).map(Held::RemoteWeak),
                    (Some(p), false) => p.get_strong_proxy_for_handle(handle).map(Held::Remote),
                    (None, _) => None,
                },
                Ok(BinderObject::Fd { fd, .. }) => {
                    self.mark_fd_owned(off, fd);
                    None
                }
                _ => None,
            };
            match held {
                Some(held) => self.held.push((off, held)),
                None if matches!(self.object_at(off), Ok(BinderObject::Binder { .. } | BinderObject::Handle { .. })) => {
                    log::warn!("could not acquire binder object at {off}");
                }
                None => {}
            }
        }
    }

    fn mark_fd_owned(&mut self, off: u64, fd: RawFd) {
        let raw = BinderObject::Fd { fd, cookie: 1 }.encode();
        if let Storage::Owned(v) = &mut self.storage {
            let at = off as usize;
            v[at..at + raw.len()].copy_from_slice(&raw);
        }
    }

    // ---- scatter-gather buffers ----

    /// Checks that every buffer object points at bytes this parcel holds, so no
    /// span it hands the driver is one it does not own.
    pub(crate) fn check_buffers(&self) -> Result<()> {
        for &off in &self.objects {
            if let BinderObject::Buffer { buffer, length, .. } = self.object_at(off)? {
                self.buffer_bytes(buffer, length).map_err(|e| {
                    log::warn!("buffer object at {off} refers to {buffer:#x}+{length}, which this parcel does not hold");
                    e
                })?;
            }
        }
        Ok(())
    }

    /// Total bytes of out-of-line buffers, each 8-byte aligned, as the driver sizes them.
    pub fn ipc_buffer_size(&self) -> usize {
        self.objects
            .iter()
            .filter_map(|&off| match self.object_at(off) {
                Ok(BinderObject::Buffer { length, .. }) => Some(length),
                _ => None,
            })
            .try_fold(0u64, |acc, len| {
                let aligned = len.checked_add(BUFFER_ALIGNMENT - 1)? & !(BUFFER_ALIGNMENT - 1);
                acc.checked_add(aligned)
            })
            .map_or_else(
                || {
                    log::error!("ipc_buffer_size: invalid buffer sizes");
                    0
                },
                |n| n as usize,
            )
    }

    fn attach(&mut self, data: &[u8]) -> Result<u64> {
        self.attachments.try_reserve(1).map_err(|_| BinderError::no_memory(data.len()))?;
        let boxed: Box<[u8]> = data.into();
        let addr = boxed.as_ptr() as u64;
        self.attachments.push(boxed);
        Ok(addr)
    }

    /// Bytes of an out-of-line buffer, wherever they live.
    fn buffer_bytes(&self, addr: u64, len: u64) -> Result<&[u8]> {
        let len = usize::try_from(len).map_err(|_| BinderError::bad_value("buffer length"))?;
        match &self.storage {
            Storage::Borrowed(b) => b.region.slice(addr, len),
            Storage::Owned(_) => self
                .attachments
                .iter()
                .find(|a| a.as_ptr() as u64 == addr && a.len() >= len)
                .map(|a| &a[..len])
                .ok_or_else(|| BinderError::bad_value(format_args!("buffer {addr:#x}+{len} not held by this parcel"))),
        }
    }

    /// The parent's address, after checking it can hold a pointer at `parent_offset`.
    fn validate_buffer_parent(&self, parent: usize, parent_offset: u64) -> Result<u64> {
        match self.object_at_index(parent)? {
            BinderObject::Buffer { buffer, length, .. } if length >= 8 && parent_offset <= length - 8 => Ok(buffer),
            BinderObject::Buffer { length, .. } => Err(BinderError::bad_value(format_args!(
                "offset {parent_offset} does not fit a pointer in parent of {length} bytes"
            ))),
            other => Err(BinderError::bad_value(format_args!("parent {parent} is type {:#010x}, not a buffer", other.kind()))),
        }
    }

    fn validate_buffer_child(&self, child: u64, child_offset: u64) -> Result<()> {
        match self.object_at_index(child as usize)? {
            BinderObject::Buffer { length, .. } if child_offset <= length => Ok(()),
            BinderObject::Buffer { length, .. } => {
                Err(BinderError::bad_value(format_args!("child offset {child_offset} past buffer of {length}")))
            }
            other => Err(BinderError::bad_value(format_args!("child {child} is type {:#010x}, not a buffer", other.kind()))),
        }
    }

    /// The pointer value stored in the parent buffer at `parent_offset`.
    fn pointer_in_parent(&self, parent: usize, parent_offset: u64) -> Result<u64> {
        let BinderObject::Buffer { buffer, length, .. } = self.object_at_index(parent)? else {
            return Err(BinderError::bad_value(format_args!("parent {parent} is not a buffer")));
        };
        if length < 8 || parent_offset > length - 8 {
            return Err(BinderError::bad_value(format_args!("offset {parent_offset} outside parent of {length}")));
        }
        let bytes = self.buffer_bytes(buffer, length)?;
        let at = parent_offset as usize;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[at..at + 8]);
        Ok(u64::from_ne_bytes(raw))
    }

    /// Copies `data` out of line; returns the buffer's object index.
    pub fn write_buffer(&mut self, data: &[u8]) -> Result<usize> {
        let index = self.objects.len();
        let buffer = self.attach(data)?;
        let obj = BinderObject::Buffer { flags: 0, buffer, length: data.len() as u64, parent: 0, parent_offset: 0 };
        self.write_object(&obj)?;
        Ok(index)
    }

    pub fn write_nullable_buffer(&mut self, data: Option<&[u8]>) -> Result<Option<usize>> {
        match data {
            Some(data) => self.write_buffer(data).map(Some),
            None => {
                self.write_object(&BinderObject::Buffer { flags: 0, buffer: 0, length: 0, parent: 0, parent_offset: 0 })?;
                Ok(None)
            }
        }
    }

    /// Copies `data` out of line as a child of buffer `parent`, and stores the
    /// child's address inside the parent at `parent_offset`.
    pub fn write_embedded_buffer(&mut self, data: &[u8], parent: usize, parent_offset: u64) -> Result<usize> {
        self.write_embedded(Some(data), parent, parent_offset)
            .and_then(|index| index.ok_or_else(|| BinderError::new(StatusCode::UnknownError)))
    }

    pub fn write_nullable_embedded_buffer(
        &mut self,
        data: Option<&[u8]>,
        parent: usize,
        parent_offset: u64,
    ) -> Result<Option<usize>> {
        self.write_embedded(data, parent, parent_offset)
    }

    fn write_embedded(&mut self, data: Option<&[u8]>, parent: usize, parent_offset: u64) -> Result<Option<usize>> {
        let parent_addr = self.validate_buffer_parent(parent, parent_offset)?;
        let slot = self
            .attachments
            .iter()
            .position(|a| a.as_ptr() as u64 == parent_addr)
            .ok_or_else(|| BinderError::bad_value(format_args!("parent buffer {parent} is not writable")))?;
        let index = self.objects.len();
        let (buffer, length) = match data {
            Some(data) => (self.attach(data)?, data.len() as u64),
            None => (0, 0),
        };
        let obj = BinderObject::Buffer {
            flags: BINDER_BUFFER_FLAG_HAS_PARENT,
            buffer,
            length,
            parent: parent as u64,
            parent_offset,
        };
        if let Err(e) = self.write_object(&obj) {
            if data.is_some() {
                self.attachments.pop();
            }
            return Err(e);
        }
        let at = parent_offset as usize;
        self.attachments[slot][at..at + 8].copy_from_slice(&buffer.to_ne_bytes());
        Ok(data.map(|_| index))
    }

    /// Checks a received buffer object against what the reader expects of it.
    fn verify_buffer_object(&self, obj: &BinderObject, size: usize, parent: Option<(usize, u64)>) -> Result<()> {
        let BinderObject::Buffer { flags, buffer, length, parent: p, parent_offset } = *obj else {
            return Err(BinderError::bad_type(format_args!("expected buffer, found {:#010x}", obj.kind())));
        };
        if length != size as u64 {
            return Err(BinderError::bad_value(format_args!("buffer length {length}, expected {size}")));
        }
        let expected_flags = if parent.is_some() { BINDER_BUFFER_FLAG_HAS_PARENT } else { 0 };
        if flags != expected_flags {
            return Err(BinderError::bad_value(format_args!("buffer flags {flags:#x}, expected {expected_flags:#x}")));
        }
        if let Some((parent, expected_offset)) = parent {
            if p != parent as u64 || parent_offset != expected_offset {
                return Err(BinderError::bad_value(format_args!(
                    "buffer parent {p}@{parent_offset}, expected {parent}@{expected_offset}"
                )));
            }
            let stored = self.pointer_in_parent(parent, expected_offset)?;
            if stored != buffer {
                log::warn!("buffer {buffer:#x} does not match pointer {stored:#x} stored in parent {parent}");
                return Err(BinderError::bad_value("child buffer not referenced by its parent"));
            }
        }
        Ok(())
    }

    fn read_buffer_impl(&self, size: usize, parent: Option<(usize, u64)>) -> Result<Option<(usize, &[u8])>> {
        let (obj, index) = self.read_object_indexed()?;
        self.verify_buffer_object(&obj, size, parent)?;
        let BinderObject::Buffer { buffer, length, .. } = obj else {
            return Err(BinderError::bad_type("expected buffer"));
        };
        match index {
            None => Ok(None),
            Some(index) => Ok(Some((index, self.buffer_bytes(buffer, length)?))),
        }
    }

    /// Returns the buffer's object index and bytes.
    pub fn read_buffer(&self, size: usize) -> Result<(usize, &[u8])> {
        self.read_buffer_impl(size, None)?.ok_or_else(|| BinderError::new(StatusCode::UnexpectedNull))
    }

    pub fn read_nullable_buffer(&self, size: usize) -> Result<Option<(usize, &[u8])>> {
        self.read_buffer_impl(size, None)
    }

    pub fn read_embedded_buffer(&self, size: usize, parent: usize, parent_offset: u64) -> Result<(usize, &[u8])> {
        self.read_buffer_impl(size, Some((parent, parent_offset)))?
            .ok_or_else(|| BinderError::new(StatusCode::UnexpectedNull))
    }

    pub fn read_nullable_embedded_buffer(
        &self,
        size: usize,
        parent: usize,
        parent_offset: u64,
    ) -> Result<Option<(usize, &[u8])>> {
        self.read_buffer_impl(size, Some((parent, parent_offset)))
    }

    fn update_buffer_cache(&self) {
        let mut cache = self.buf_cache.borrow_mut();
        for index in cache.scanned..self.objects.len() {
            if let Ok(BinderObject::Buffer { buffer, length, .. }) = self.object_at(self.objects[index]) {
                cache.entries.push(BufferEntry { index, start: buffer, end: buffer.saturating_add(length) });
            }
        }
        cache.scanned = self.objects.len();
    }

    /// Locates the buffer containing `ptr..ptr+length`: its object index and the
    /// offset of `ptr` inside it.
    pub fn find_buffer(&self, ptr: u64, length: u64) -> Result<Option<(usize, u64)>> {
        self.update_buffer_cache();
        let cache = self.buf_cache.borrow();
        for entry in cache.entries.iter().rev() {
            if ptr >= entry.start && ptr < entry.end {
                if length > entry.end - ptr {
                    log::error!("buffer at {ptr:#x} of {length} overruns buffer {} ending at {:#x}", entry.index, entry.end);
                    return Err(BinderError::bad_value("range exceeds containing buffer"));
                }
                return Ok(Some((entry.index, ptr - entry.start)));
            }
        }
        Ok(None)
    }

    /// Object index of the buffer starting exactly at `ptr`.
    pub fn quick_find_buffer(&self, ptr: u64) -> Result<usize> {
        self.update_buffer_cache();
        self.buf_cache
            .borrow()
            .entries
            .iter()
            .find(|e| e.start == ptr)
            .map(|e| e.index)
            .ok_or_else(|| BinderError::new(StatusCode::NoInit).ctx(format_args!("no buffer at {ptr:#x}")))
    }

    /// Validates that `child_offset` lies inside buffer `child`.
    pub fn check_buffer_child(&self, child: u64, child_offset: u64) -> Result<()> {
        self.validate_buffer_child(child, child_offset)
    }

    // ---- native handles ----

    pub fn write_native_handle(&mut self, handle: Option<&NativeHandle>) -> Result<()> {
        self.write_native_handle_impl(handle, None)
    }

    pub fn write_embedded_native_handle(
        &mut self,
        handle: Option<&NativeHandle>,
        parent: usize,
        parent_offset: u64,
    ) -> Result<()> {
        self.write_native_handle_impl(handle, Some((parent, parent_offset)))
    }

    fn write_native_handle_impl(&mut self, handle: Option<&NativeHandle>, parent: Option<(usize, u64)>) -> Result<()> {
        let Some(handle) = handle else { return self.write_u64(0) };
        let encoded = handle.encode()?;
        self.write_u64(encoded.len() as u64)?;
        let buffer = match parent {
            Some((parent, offset)) => self.write_embedded_buffer(&encoded, parent, offset)?,
            None => self.write_buffer(&encoded)?,
        };
        self.write_object(&BinderObject::FdArray {
            num_fds: handle.fds.len() as u64,
            parent: buffer as u64,
            parent_offset: NATIVE_HANDLE_HEADER as u64,
        })
    }

    pub fn read_native_handle(&self) -> Result<NativeHandle> {
        self.read_nullable_native_handle()?.ok_or_else(|| BinderError::new(StatusCode::UnexpectedNull))
    }

    pub fn read_nullable_native_handle(&self) -> Result<Option<NativeHandle>> {
        self.read_native_handle_impl(None)
    }

    pub fn read_nullable_embedded_native_handle(&self, parent: usize, parent_offset: u64) -> Result<Option<NativeHandle>> {
        self.read_native_handle_impl(Some((parent, parent_offset)))
    }

    fn read_native_handle_impl(&self, parent: Option<(usize, u64)>) -> Result<Option<NativeHandle>> {
        let size = self.read_u64().map_err(|e| BinderError::bad_value(e))?;
        if size == 0 {
            if let Some((parent, offset)) = parent {
                let stored = self.pointer_in_parent(parent, offset)?;
                if stored != 0 {
                    log::error!("null native handle but parent {parent} holds pointer {stored:#x}");
                    return Err(BinderError::bad_value("null handle with non-null parent pointer"));
                }
            }
            return Ok(None);
        }
        let size = usize::try_from(size)
            .ok()
            .filter(|s| *s >= NATIVE_HANDLE_HEADER)
            .ok_or_else(|| BinderError::bad_value(format_args!("native handle size {size} too small")))?;

        let (buffer, bytes) = self
            .read_buffer_impl(size, parent)?
            .ok_or_else(|| BinderError::bad_value("expecting non-null handle buffer"))?;
        let num_fds = i32_at(bytes, 1);
        let num_ints = i32_at(bytes, 2);
        if !(0..=NATIVE_HANDLE_MAX_FDS).contains(&num_fds) {
            return Err(BinderError::bad_value(format_args!("native handle with {num_fds} fds")));
        }
        if !(0..=NATIVE_HANDLE_MAX_INTS).contains(&num_ints) {
            return Err(BinderError::bad_value(format_args!("native handle with {num_ints} ints")));
        }
        let (num_fds, num_ints) = (num_fds as usize, num_ints as usize);
        if size != NATIVE_HANDLE_HEADER + 4 * (num_fds + num_ints) {
            return Err(BinderError::bad_value("native handle size does not match its counts"));
        }

        match self.read_object() {
            Ok(BinderObject::FdArray { num_fds: n, parent: p, parent_offset })
                if n == num_fds as u64 && p == buffer as u64 && parent_offset == NATIVE_HANDLE_HEADER as u64 => {}
            Ok(other) => {
                log::error!("native handle fd array mismatch: {other:?}");
                return Err(BinderError::bad_value("fd array does not describe the native handle"));
            }
            Err(e) => return Err(BinderError::bad_value(format_args!("fd array for native handle: {e}"))),
        }

        let values: Vec<i32> = (3..3 + num_fds + num_ints).map(|i| i32_at(bytes, i)).collect();
        let (fds, ints) = values.split_at(num_fds);
        Ok(Some(NativeHandle { fds: fds.to_vec(), ints: ints.to_vec() }))
    }
}
