//! Parcel: the marshaling buffer.
//!
//! A Parcel is a byte payload plus a table of offsets of the embedded objects the
//! driver must translate (binders, handles, fds, out-of-line buffers). It either
//! owns its bytes or borrows a received buffer from the driver region, in which
//! case dropping it hands the buffer back through a release callback.
//!
//! Writes always append; reads use an independent cursor.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::sync::Arc;

use crate::binder::{LocalObject, RemoteProxy};
use crate::process::ProcessState;
use crate::refs::{Sp, Wp};
use crate::region::SharedRegion;
use crate::{BinderError, Result, StatusCode};

pub mod object;
pub mod postcard;
pub mod cbor;

pub use object::NativeHandle;

/// Largest size any length or capacity may take.
pub(crate) const MAX_SIZE: usize = i32::MAX as usize;

/// Rounds `len` up to the 4-byte wire alignment.
pub fn pad_size(len: usize) -> Result<usize> {
    len.checked_add(3)
        .map(|n| n & !3)
        .ok_or_else(|| BinderError::bad_value(format_args!("padded size of {len} overflows")))
}

/// Hands a borrowed driver buffer back; receives the buffer address.
pub type ReleaseFn = Box<dyn FnOnce(u64) + Send>;

/// A reference kept alive by an embedded object until the Parcel lets go of it.
pub(crate) enum Held {
    Local(Sp<LocalObject>),
    LocalWeak(Wp<LocalObject>),
    Remote(Sp<RemoteProxy>),
    RemoteWeak(Wp<RemoteProxy>),
}

struct Borrowed {
    region: Arc<SharedRegion>,
    addr: u64,
    len: usize,
    release: Option<ReleaseFn>,
}

enum Storage {
    Owned(Vec<u8>),
    Borrowed(Borrowed),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct BufferEntry {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Default)]
pub(crate) struct BufferCache {
    /// Object count the cache was last brought up to.
    pub scanned: usize,
    pub entries: Vec<BufferEntry>,
}

pub struct Parcel {
    storage: Storage,
    capacity: usize,
    read_pos: Cell<usize>,
    objects: Vec<u64>,
    next_object_hint: Cell<usize>,
    held: Vec<(u64, Held)>,
    attachments: Vec<Box<[u8]>>,
    buf_cache: RefCell<BufferCache>,
    error: Option<StatusCode>,
    allow_fds: bool,
    fds_known: Cell<Option<bool>>,
    sensitive: bool,
    process: Option<Arc<ProcessState>>,
}

impl Default for Parcel {
    fn default() -> Self { Self::new() }
}

impl Parcel {
    pub fn new() -> Self {
        Self {
            storage: Storage::Owned(Vec::new()),
            capacity: 0,
            read_pos: Cell::new(0),
            objects: Vec::new(),
            next_object_hint: Cell::new(0),
            held: Vec::new(),
            attachments: Vec::new(),
            buf_cache: RefCell::new(BufferCache::default()),
            error: None,
            allow_fds: true,
            fds_known: Cell::new(Some(false)),
            sensitive: false,
            process: None,
        }
    }

    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut p = Self::new();
        p.set_data_capacity(capacity)?;
        Ok(p)
    }

    /// A Parcel that resolves handles and local objects against `process`.
    pub fn for_process(process: &Arc<ProcessState>) -> Self {
        let mut p = Self::new();
        p.process = Some(process.clone());
        p
    }

    pub fn bind_process(&mut self, process: &Arc<ProcessState>) { self.process = Some(process.clone()); }

    /// The bound gateway, falling back to the global one.
    pub fn process(&self) -> Option<Arc<ProcessState>> {
        self.process.clone().or_else(ProcessState::global)
    }

    pub fn data(&self) -> &[u8] {
        match &self.storage {
            Storage::Owned(v) => v,
            Storage::Borrowed(b) => b.region.slice(b.addr, b.len).unwrap_or_default(),
        }
    }

    pub fn data_size(&self) -> usize { self.data().len() }
    pub fn data_position(&self) -> usize { self.read_pos.get() }
    pub fn data_avail(&self) -> usize { self.data_size().saturating_sub(self.read_pos.get()) }

    pub fn data_capacity(&self) -> usize {
        match &self.storage {
            Storage::Owned(_) => self.capacity,
            Storage::Borrowed(b) => b.len,
        }
    }

    pub fn is_borrowed(&self) -> bool { matches!(self.storage, Storage::Borrowed(_)) }

    /// Moves the read cursor; also restarts the object lookup hint.
    pub fn set_data_position(&self, pos: usize) {
        self.read_pos.set(pos);
        self.next_object_hint.set(0);
    }

    pub fn set_data_size(&mut self, size: usize) -> Result<()> {
        if size > MAX_SIZE {
            return Err(BinderError::bad_value(format_args!("data size {size} too large")));
        }
        if size < self.data_size() {
            self.truncate_objects(size);
        }
        if size > self.data_capacity() {
            self.set_capacity_exact(size)?;
        }
        self.owned()?.resize(size, 0);
        if self.read_pos.get() > size {
            self.read_pos.set(size);
        }
        Ok(())
    }

    pub fn set_data_capacity(&mut self, size: usize) -> Result<()> {
        if size > MAX_SIZE {
            return Err(BinderError::bad_value(format_args!("capacity {size} too large")));
        }
        if size > self.data_capacity() || self.is_borrowed() {
            self.owned()?;
            if size > self.capacity {
                self.set_capacity_exact(size)?;
            }
        }
        Ok(())
    }

    /// Replaces the contents with a copy of `bytes`; the object table is cleared.
    pub fn set_data(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > MAX_SIZE {
            return Err(BinderError::bad_value(format_args!("data size {} too large", bytes.len())));
        }
        self.restart_write(bytes.len())?;
        self.owned()?.extend_from_slice(bytes);
        Ok(())
    }

    /// Drops all contents and prepares for writing `desired` bytes.
    pub fn restart_write(&mut self, desired: usize) -> Result<()> {
        if desired > MAX_SIZE {
            return Err(BinderError::bad_value(format_args!("capacity {desired} too large")));
        }
        self.release_storage();
        self.set_capacity_exact(desired)
    }

    /// Releases everything and returns to the freshly constructed state.
    pub fn free_data(&mut self) {
        self.release_storage();
        self.error = None;
        self.allow_fds = true;
    }

    pub fn error_check(&self) -> Result<()> {
        match self.error {
            Some(code) => Err(BinderError::new(code)),
            None => Ok(()),
        }
    }

    pub fn set_error(&mut self, err: Option<StatusCode>) { self.error = err; }
    pub fn error(&self) -> Option<StatusCode> { self.error }

    pub fn allow_fds(&self) -> bool { self.allow_fds }

    /// Sets whether fds may be written; returns the previous setting.
    pub fn push_allow_fds(&mut self, allow: bool) -> bool {
        let prev = self.allow_fds;
        if !allow {
            self.allow_fds = false;
        }
        prev
    }

    pub fn restore_allow_fds(&mut self, prev: bool) { self.allow_fds = prev; }

    /// Zero the bytes before they are released or reallocated.
    pub fn mark_sensitive(&mut self) { self.sensitive = true; }
    pub fn is_sensitive(&self) -> bool { self.sensitive }

    pub fn objects(&self) -> &[u64] { &self.objects }
    pub fn objects_count(&self) -> usize { self.objects.len() }

    // ---- write side ----

    /// Appends `data`, zero-padding to 4 bytes.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let dst = self.write_inplace(data.len())?;
        dst.copy_from_slice(data);
        Ok(())
    }

    /// Appends `data` without padding.
    pub fn write_unpadded(&mut self, data: &[u8]) -> Result<()> {
        self.reserve(data.len())?;
        self.owned()?.extend_from_slice(data);
        Ok(())
    }

    /// Reserves `len` bytes (plus padding) at the end and returns them for filling.
    pub fn write_inplace(&mut self, len: usize) -> Result<&mut [u8]> {
        if len > MAX_SIZE {
            return Err(BinderError::bad_value(format_args!("write of {len} bytes too large")));
        }
        let padded = pad_size(len)?;
        self.reserve(padded)?;
        let v = self.owned()?;
        let start = v.len();
        v.resize(start + padded, 0);
        Ok(&mut v[start..start + len])
    }

    fn write_aligned<const N: usize>(&mut self, bytes: [u8; N]) -> Result<()> {
        debug_assert_eq!(N % 4, 0);
        self.write_unpadded(&bytes)
    }

    pub fn write_i8(&mut self, v: i8) -> Result<()> { self.write(&v.to_ne_bytes()) }
    pub fn write_u8(&mut self, v: u8) -> Result<()> { self.write(&[v]) }
    pub fn write_bool(&mut self, v: bool) -> Result<()> { self.write(&[v as u8]) }
    pub fn write_i16(&mut self, v: i16) -> Result<()> { self.write(&v.to_ne_bytes()) }
    pub fn write_u16(&mut self, v: u16) -> Result<()> { self.write(&v.to_ne_bytes()) }
    pub fn write_i32(&mut self, v: i32) -> Result<()> { self.write_aligned(v.to_ne_bytes()) }
    pub fn write_u32(&mut self, v: u32) -> Result<()> { self.write_aligned(v.to_ne_bytes()) }
    pub fn write_i64(&mut self, v: i64) -> Result<()> { self.write_aligned(v.to_ne_bytes()) }
    pub fn write_u64(&mut self, v: u64) -> Result<()> { self.write_aligned(v.to_ne_bytes()) }
    pub fn write_f32(&mut self, v: f32) -> Result<()> { self.write_aligned(v.to_ne_bytes()) }
    pub fn write_f64(&mut self, v: f64) -> Result<()> { self.write_aligned(v.to_ne_bytes()) }
    pub fn write_pointer(&mut self, v: u64) -> Result<()> { self.write_aligned(v.to_ne_bytes()) }

    /// NUL-terminated, padded.
    pub fn write_c_string(&mut self, s: &str) -> Result<()> {
        if s.as_bytes().contains(&0) {
            return Err(BinderError::bad_value("interior NUL in C string"));
        }
        let dst = self.write_inplace(s.len() + 1)?;
        dst[..s.len()].copy_from_slice(s.as_bytes());
        dst[s.len()] = 0;
        Ok(())
    }

    /// UTF-16 unit count, units, a zero unit, padding. `None` is written as length -1.
    pub fn write_string16(&mut self, s: Option<&str>) -> Result<()> {
        let Some(s) = s else { return self.write_i32(-1) };
        let units: Vec<u16> = s.encode_utf16().collect();
        let len = i32::try_from(units.len())
            .ok()
            .filter(|n| (*n as usize) < MAX_SIZE / 2)
            .ok_or_else(|| BinderError::bad_value("string16 too long"))?;
        self.write_i32(len)?;
        let dst = self.write_inplace((units.len() + 1) * 2)?;
        for (chunk, unit) in dst.chunks_exact_mut(2).zip(units.iter().chain(std::iter::once(&0))) {
            chunk.copy_from_slice(&unit.to_ne_bytes());
        }
        Ok(())
    }

    /// i32 length followed by padded bytes.
    pub fn write_byte_array(&mut self, bytes: &[u8]) -> Result<()> {
        let len = i32::try_from(bytes.len()).map_err(|_| BinderError::bad_value("byte array too long"))?;
        self.write_i32(len)?;
        self.write(bytes)
    }

    pub fn write_interface_token(&mut self, interface: &str) -> Result<()> {
        self.write_c_string(interface)
    }

    // ---- read side ----

    /// Consumes `len` bytes plus padding and borrows the unpadded part.
    pub fn read_inplace(&self, len: usize) -> Result<&[u8]> {
        if len > MAX_SIZE {
            return Err(BinderError::bad_value(format_args!("read of {len} bytes too large")));
        }
        let padded = pad_size(len)?;
        let pos = self.read_pos.get();
        let data = self.data();
        match pos.checked_add(padded) {
            Some(end) if end <= data.len() => {
                self.read_pos.set(end);
                Ok(&data[pos..pos + len])
            }
            _ => Err(BinderError::not_enough_data(padded, data.len().saturating_sub(pos))),
        }
    }

    pub fn read(&self, out: &mut [u8]) -> Result<()> {
        out.copy_from_slice(self.read_inplace(out.len())?);
        Ok(())
    }

    fn read_aligned<const N: usize>(&self) -> Result<[u8; N]> {
        let pos = self.read_pos.get();
        let data = self.data();
        match pos.checked_add(N) {
            Some(end) if end <= data.len() => {
                let mut out = [0u8; N];
                out.copy_from_slice(&data[pos..end]);
                self.read_pos.set(end);
                Ok(out)
            }
            _ => Err(BinderError::not_enough_data(N, data.len().saturating_sub(pos))),
        }
    }

    fn read_padded<const N: usize>(&self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        self.read(&mut out)?;
        Ok(out)
    }

    pub fn read_i8(&self) -> Result<i8> { Ok(i8::from_ne_bytes(self.read_padded()?)) }
    pub fn read_u8(&self) -> Result<u8> { Ok(u8::from_ne_bytes(self.read_padded()?)) }
    pub fn read_bool(&self) -> Result<bool> { Ok(self.read_u8()? != 0) }
    pub fn read_i16(&self) -> Result<i16> { Ok(i16::from_ne_bytes(self.read_padded()?)) }
    pub fn read_u16(&self) -> Result<u16> { Ok(u16::from_ne_bytes(self.read_padded()?)) }
    pub fn read_i32(&self) -> Result<i32> { Ok(i32::from_ne_bytes(self.read_aligned()?)) }
    pub fn read_u32(&self) -> Result<u32> { Ok(u32::from_ne_bytes(self.read_aligned()?)) }
    pub fn read_i64(&self) -> Result<i64> { Ok(i64::from_ne_bytes(self.read_aligned()?)) }
    pub fn read_u64(&self) -> Result<u64> { Ok(u64::from_ne_bytes(self.read_aligned()?)) }
    pub fn read_f32(&self) -> Result<f32> { Ok(f32::from_ne_bytes(self.read_aligned()?)) }
    pub fn read_f64(&self) -> Result<f64> { Ok(f64::from_ne_bytes(self.read_aligned()?)) }
    pub fn read_pointer(&self) -> Result<u64> { self.read_u64() }

    pub fn read_c_string(&self) -> Result<&str> {
        let pos = self.read_pos.get();
        let rest = self.data().get(pos..).unwrap_or_default();
        let Some(len) = rest.iter().position(|&b| b == 0) else {
            return Err(BinderError::new(StatusCode::NotEnoughData).ctx("unterminated C string"));
        };
        let bytes = self.read_inplace(len + 1)?;
        std::str::from_utf8(&bytes[..len]).map_err(|e| BinderError::bad_value(e))
    }

    pub fn read_nullable_string16(&self) -> Result<Option<String>> {
        let len = self.read_i32()?;
        if len < 0 {
            return Ok(None);
        }
        let len = len as usize;
        let raw = self.read_inplace((len + 1) * 2)?;
        let mut units: Vec<u16> = raw.chunks_exact(2).map(|c| u16::from_ne_bytes([c[0], c[1]])).collect();
        if units.pop() != Some(0) {
            return Err(BinderError::bad_value("string16 not terminated"));
        }
        String::from_utf16(&units).map(Some).map_err(|e| BinderError::bad_value(e))
    }

    pub fn read_string16(&self) -> Result<String> {
        self.read_nullable_string16()?.ok_or_else(|| BinderError::new(StatusCode::UnexpectedNull))
    }

    pub fn read_byte_array(&self) -> Result<&[u8]> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(BinderError::new(StatusCode::UnexpectedNull));
        }
        self.read_inplace(len as usize)
    }

    /// Reads the interface token and checks it names `interface`.
    pub fn enforce_interface(&self, interface: &str) -> bool {
        match self.read_c_string() {
            Ok(token) if token == interface => true,
            Ok(token) => {
                log::error!("expected interface {interface:?}, parcel carries {token:?}");
                false
            }
            Err(e) => {
                log::error!("reading interface token for {interface:?}: {e}");
                false
            }
        }
    }

    // ---- storage ----

    /// The owned byte vector, copying out of the driver buffer first if borrowed.
    fn owned(&mut self) -> Result<&mut Vec<u8>> {
        if self.is_borrowed() {
            self.take_ownership()?;
        }
        match &mut self.storage {
            Storage::Owned(v) => Ok(v),
            Storage::Borrowed(_) => Err(BinderError::new(StatusCode::InvalidOperation).ctx("parcel still borrowed")),
        }
    }

    fn reserve(&mut self, len: usize) -> Result<()> {
        self.owned()?;
        let size = self.data_size();
        let needed = size.checked_add(len).ok_or_else(|| BinderError::no_memory(usize::MAX))?;
        if needed <= self.capacity {
            return Ok(());
        }
        let grown = needed
            .checked_mul(3)
            .map(|n| n / 2)
            .filter(|&n| n <= MAX_SIZE)
            .ok_or_else(|| BinderError::no_memory(needed))?;
        self.set_capacity_exact(grown)
    }

    fn set_capacity_exact(&mut self, cap: usize) -> Result<()> {
        let sensitive = self.sensitive;
        let v = self.owned()?;
        if cap < v.len() {
            return Err(BinderError::bad_value(format_args!("capacity {cap} below data size {}", v.len())));
        }
        if sensitive {
            let mut fresh = Vec::new();
            fresh.try_reserve_exact(cap).map_err(|_| BinderError::no_memory(cap))?;
            fresh.extend_from_slice(v);
            zero(v);
            *v = fresh;
        } else {
            let extra = cap - v.len();
            v.try_reserve_exact(extra).map_err(|_| BinderError::no_memory(cap))?;
        }
        self.capacity = cap;
        Ok(())
    }

    /// Copies a borrowed buffer into owned memory, then returns the original.
    fn take_ownership(&mut self) -> Result<()> {
        let Storage::Borrowed(b) = &mut self.storage else { return Ok(()) };
        let bytes = b.region.slice(b.addr, b.len)?;
        let mut copy = Vec::new();
        copy.try_reserve_exact(bytes.len()).map_err(|_| BinderError::no_memory(bytes.len()))?;
        copy.extend_from_slice(bytes);
        let addr = b.addr;
        let release = b.release.take();

        self.capacity = copy.len();
        self.storage = Storage::Owned(copy);
        self.fds_known.set(None);
        self.acquire_objects();
        if let Some(release) = release {
            release(addr);
        }
        Ok(())
    }

    fn truncate_objects(&mut self, size: usize) {
        let keep = self
            .objects
            .iter()
            .take_while(|&&off| {
                let off = off as usize;
                self.object_size_at(off).is_some_and(|len| off + len <= size)
            })
            .count();
        let cut = self.objects.get(keep).copied();
        if let Some(cut) = cut {
            self.release_objects_from(keep);
            self.held.retain(|(off, _)| *off < cut);
            self.objects.truncate(keep);
            self.buf_cache.replace(BufferCache::default());
            self.fds_known.set(None);
        }
        if self.next_object_hint.get() > self.objects.len() {
            self.next_object_hint.set(0);
        }
    }

    fn release_storage(&mut self) {
        if self.is_borrowed() {
            self.close_file_descriptors();
        } else {
            self.release_objects_from(0);
        }
        self.held.clear();
        let sensitive = self.sensitive;
        match std::mem::replace(&mut self.storage, Storage::Owned(Vec::new())) {
            Storage::Borrowed(mut b) => {
                if let Some(release) = b.release.take() {
                    release(b.addr);
                }
            }
            Storage::Owned(mut v) => {
                if sensitive {
                    zero(&mut v);
                }
            }
        }
        if sensitive {
            self.attachments.iter_mut().for_each(|a| zero(a));
        }
        self.attachments.clear();
        self.objects.clear();
        self.capacity = 0;
        self.read_pos.set(0);
        self.next_object_hint.set(0);
        self.buf_cache.replace(BufferCache::default());
        self.fds_known.set(Some(false));
    }

    /// Adopts a received driver buffer.
    ///
    /// Offsets that are not strictly increasing (objects may not overlap) or that run
    /// past the data drop the whole object table.
    pub(crate) fn set_data_reference(
        &mut self,
        region: Arc<SharedRegion>,
        addr: u64,
        len: usize,
        offsets: Vec<u64>,
        release: ReleaseFn,
    ) -> Result<()> {
        region.slice(addr, len)?;
        self.free_data();
        self.storage = Storage::Borrowed(Borrowed { region, addr, len, release: Some(release) });
        self.capacity = len;

        let mut min_offset = 0u64;
        let mut valid = true;
        for &off in &offsets {
            let fits = self.object_size_at(off as usize).is_some_and(|n| off as usize + n <= len);
            if off < min_offset || !fits {
                log::error!(
                    "invalid object offset {off:#x} (min {min_offset:#x}, data {len}): ignoring {} objects",
                    offsets.len()
                );
                valid = false;
                break;
            }
            min_offset = off + crate::abi::FLAT_OBJECT_SIZE as u64;
        }
        self.objects = if valid { offsets } else { Vec::new() };
        self.fds_known.set(None);
        self.scan_for_fds();
        Ok(())
    }

    /// Resizes to `cap`, zeroes, and returns the bytes for the driver to fill.
    pub(crate) fn receive_window(&mut self, cap: usize) -> Result<&mut [u8]> {
        if self.objects_count() > 0 {
            self.free_data();
        }
        if self.data_capacity() < cap {
            self.set_data_capacity(cap)?;
        }
        self.owned()?;
        self.read_pos.set(0);
        let v = self.owned()?;
        v.clear();
        v.resize(cap, 0);
        Ok(&mut v[..])
    }

    pub(crate) fn held_locals(&self) -> impl Iterator<Item = &Sp<LocalObject>> {
        self.held.iter().filter_map(|(_, h)| match h {
            Held::Local(sp) => Some(sp),
            _ => None,
        })
    }
}

impl Drop for Parcel {
    fn drop(&mut self) {
        self.release_storage();
    }
}

fn zero(buf: &mut [u8]) {
    for b in buf.iter_mut() {
        // SAFETY: plain byte store through a valid &mut; volatile keeps it from being elided.
        unsafe { std::ptr::write_volatile(b, 0) };
    }
}

impl fmt::Debug for Parcel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parcel")
            .field("size", &self.data_size())
            .field("capacity", &self.data_capacity())
            .field("pos", &self.data_position())
            .field("objects", &self.objects)
            .field("borrowed", &self.is_borrowed())
            .field("error", &self.error)
            .finish()
    }
}

impl fmt::Display for Parcel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(err) = self.error {
            return writeln!(f, "Parcel(error: {err:?})");
        }
        writeln!(f, "Parcel({} bytes, {} objects)", self.data_size(), self.objects.len())?;
        for (row, chunk) in self.data().chunks(16).enumerate() {
            write!(f, "  {:04x}:", row * 16)?;
            for b in chunk {
                write!(f, " {b:02x}")?;
            }
            writeln!(f)?;
        }
        for off in &self.objects {
            writeln!(f, "  object @{off:#x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_roundtrip() {
        let mut p = Parcel::new();
        p.write_i8(-3).unwrap();
        p.write_u16(0xbeef).unwrap();
        p.write_bool(true).unwrap();
        p.write_i32(-42).unwrap();
        p.write_u64(u64::MAX - 1).unwrap();
        p.write_f32(1.5).unwrap();
        p.write_f64(-2.25).unwrap();
        p.write_pointer(0xdead_0000).unwrap();

        assert_eq!(p.read_i8().unwrap(), -3);
        assert_eq!(p.read_u16().unwrap(), 0xbeef);
        assert!(p.read_bool().unwrap());
        assert_eq!(p.read_i32().unwrap(), -42);
        assert_eq!(p.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(p.read_f32().unwrap(), 1.5);
        assert_eq!(p.read_f64().unwrap(), -2.25);
        assert_eq!(p.read_pointer().unwrap(), 0xdead_0000);
        assert_eq!(p.data_avail(), 0);
    }

    #[test]
    fn small_writes_are_padded_to_four() {
        let mut p = Parcel::new();
        p.write_u8(0xff).unwrap();
        p.write_i16(-1).unwrap();
        assert_eq!(p.data(), &[0xff, 0, 0, 0, 0xff, 0xff, 0, 0]);
    }

    #[test]
    fn c_string_is_nul_terminated_and_padded() {
        let mut p = Parcel::new();
        p.write_c_string("abc").unwrap();
        p.write_c_string("abcd").unwrap();
        assert_eq!(p.data_size(), 4 + 8);
        assert_eq!(&p.data()[..4], b"abc\0");
        assert_eq!(p.read_c_string().unwrap(), "abc");
        assert_eq!(p.read_c_string().unwrap(), "abcd");
        assert_eq!(p.data_position(), 12);
    }

    #[test]
    fn c_string_without_nul_is_rejected() {
        let mut p = Parcel::new();
        p.write_u32(u32::from_ne_bytes(*b"abcd")).unwrap();
        assert!(p.read_c_string().unwrap_err().is(StatusCode::NotEnoughData));
        assert!(p.write_c_string("a\0b").is_err());
    }

    #[test]
    fn string16_layout_and_null() {
        let mut p = Parcel::new();
        p.write_string16(Some("hé")).unwrap();
        p.write_string16(None).unwrap();
        // len + 3 units padded to 8 + null marker
        assert_eq!(p.data_size(), 4 + 8 + 4);
        assert_eq!(p.read_string16().unwrap(), "hé");
        assert_eq!(p.read_nullable_string16().unwrap(), None);

        p.set_data_position(p.data_size() - 4);
        assert!(p.read_string16().unwrap_err().is(StatusCode::UnexpectedNull));
    }

    #[test]
    fn reads_past_end_are_not_enough_data() {
        let mut p = Parcel::new();
        p.write_u32(1).unwrap();
        assert_eq!(p.read_u32().unwrap(), 1);
        assert!(p.read_u32().unwrap_err().is(StatusCode::NotEnoughData));
        assert!(p.read_inplace(1).unwrap_err().is(StatusCode::NotEnoughData));
        // cursor does not move on failure
        assert_eq!(p.data_position(), 4);
    }

    #[test]
    fn padded_size_overflow_is_an_error() {
        assert!(pad_size(usize::MAX).is_err());
        assert_eq!(pad_size(5).unwrap(), 8);
        assert_eq!(pad_size(8).unwrap(), 8);
        let p = Parcel::new();
        assert!(p.read_inplace(usize::MAX).unwrap_err().is(StatusCode::BadValue));
    }

    #[test]
    fn growth_is_one_and_a_half_times() {
        let mut p = Parcel::new();
        p.write_u32(7).unwrap();
        assert_eq!(p.data_capacity(), 6);
        p.write_u64(9).unwrap();
        assert_eq!(p.data_capacity(), 18);
    }

    #[test]
    fn incremental_and_bulk_writes_agree() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut bulk = Parcel::new();
        bulk.write(&payload).unwrap();

        let mut step = Parcel::new();
        for chunk in payload.chunks(4) {
            step.write_unpadded(chunk).unwrap();
        }
        assert_eq!(bulk.data(), step.data());
    }

    #[test]
    fn size_limits_are_enforced() {
        let mut p = Parcel::new();
        assert!(p.set_data_size(MAX_SIZE + 1).unwrap_err().is(StatusCode::BadValue));
        assert!(p.set_data_capacity(MAX_SIZE + 1).unwrap_err().is(StatusCode::BadValue));
        assert!(p.restart_write(MAX_SIZE + 1).is_err());
    }

    #[test]
    fn set_data_size_truncates_and_clamps_cursor() {
        let mut p = Parcel::new();
        p.write_u64(1).unwrap();
        p.write_u64(2).unwrap();
        p.set_data_position(16);
        p.set_data_size(8).unwrap();
        assert_eq!(p.data_size(), 8);
        assert_eq!(p.data_position(), 8);
    }

    #[test]
    fn set_data_copies_and_rewinds() {
        let mut p = Parcel::new();
        p.set_data(&[1, 0, 0, 0, 2, 0, 0, 0]).unwrap();
        assert_eq!(p.read_u32().unwrap(), u32::from_ne_bytes([1, 0, 0, 0]));
        assert_eq!(p.objects_count(), 0);
    }

    #[test]
    fn interface_token() {
        let mut p = Parcel::new();
        p.write_interface_token("android.hardware.boot@1.0::IBootControl").unwrap();
        assert!(p.enforce_interface("android.hardware.boot@1.0::IBootControl"));
        p.set_data_position(0);
        assert!(!p.enforce_interface("other"));
    }

    #[test]
    fn byte_array_roundtrip() {
        let mut p = Parcel::new();
        p.write_byte_array(b"xyz").unwrap();
        assert_eq!(p.data_size(), 8);
        assert_eq!(p.read_byte_array().unwrap(), b"xyz");
    }

    #[test]
    fn error_state() {
        let mut p = Parcel::new();
        assert!(p.error_check().is_ok());
        p.set_error(Some(StatusCode::NoMemory));
        assert!(p.error_check().unwrap_err().is(StatusCode::NoMemory));
        p.free_data();
        assert!(p.error_check().is_ok());
    }
}
