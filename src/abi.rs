//! Kernel ABI of the binder driver (64-bit protocol, version 8).
//!
//! Command and return codes are the `_IOW('c', ..)` / `_IOR('r', ..)` values the
//! driver expects; record layouts are fixed by the kernel and encoded here field by
//! field through [`WireReader`] / [`WireWriter`] in native byte order.

use crate::{BinderError, Result, TransactionFlags};

pub const BINDER_CURRENT_PROTOCOL_VERSION: i32 = 8;

const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, ty: u8, nr: u32, size: usize) -> u32 {
    (dir << 30) | ((size as u32) << 16) | ((ty as u32) << 8) | nr
}
const fn io(ty: u8, nr: u32) -> u32 { ioc(IOC_NONE, ty, nr, 0) }
const fn iow(ty: u8, nr: u32, size: usize) -> u32 { ioc(IOC_WRITE, ty, nr, size) }
const fn ior(ty: u8, nr: u32, size: usize) -> u32 { ioc(IOC_READ, ty, nr, size) }

pub const fn pack_chars(c1: u8, c2: u8, c3: u8, c4: u8) -> u32 {
    ((c1 as u32) << 24) | ((c2 as u32) << 16) | ((c3 as u32) << 8) | (c4 as u32)
}

pub const TYPE_LARGE: u8 = 0x85;

pub const BINDER_TYPE_BINDER: u32 = pack_chars(b's', b'b', b'*', TYPE_LARGE);
pub const BINDER_TYPE_WEAK_BINDER: u32 = pack_chars(b'w', b'b', b'*', TYPE_LARGE);
pub const BINDER_TYPE_HANDLE: u32 = pack_chars(b's', b'h', b'*', TYPE_LARGE);
pub const BINDER_TYPE_WEAK_HANDLE: u32 = pack_chars(b'w', b'h', b'*', TYPE_LARGE);
pub const BINDER_TYPE_FD: u32 = pack_chars(b'f', b'd', b'*', TYPE_LARGE);
pub const BINDER_TYPE_FDA: u32 = pack_chars(b'f', b'd', b'a', TYPE_LARGE);
pub const BINDER_TYPE_PTR: u32 = pack_chars(b'p', b't', b'*', TYPE_LARGE);

pub const FLAT_BINDER_FLAG_PRIORITY_MASK: u32 = 0xff;
pub const FLAT_BINDER_FLAG_ACCEPTS_FDS: u32 = 0x100;
pub const FLAT_BINDER_FLAG_SCHED_POLICY_SHIFT: u32 = 9;
pub const FLAT_BINDER_FLAG_SCHED_POLICY_MASK: u32 = 3 << FLAT_BINDER_FLAG_SCHED_POLICY_SHIFT;
pub const FLAT_BINDER_FLAG_INHERIT_RT: u32 = 0x800;
pub const FLAT_BINDER_FLAG_TXN_SECURITY_CTX: u32 = 0x1000;

pub const BINDER_BUFFER_FLAG_HAS_PARENT: u32 = 0x01;

pub const TRANSACTION_DATA_SIZE: usize = 64;
pub const TRANSACTION_DATA_SG_SIZE: usize = 72;
pub const TRANSACTION_DATA_SECCTX_SIZE: usize = 72;
pub const PTR_COOKIE_SIZE: usize = 16;
pub const HANDLE_COOKIE_SIZE: usize = 12;
pub const PRI_DESC_SIZE: usize = 8;
pub const PRI_PTR_COOKIE_SIZE: usize = 24;

pub const FLAT_OBJECT_SIZE: usize = 24;
pub const FD_OBJECT_SIZE: usize = 24;
pub const FDA_OBJECT_SIZE: usize = 32;
pub const BUFFER_OBJECT_SIZE: usize = 40;

/// Driver commands (written by userspace).
pub mod bc {
    use super::*;

    pub const TRANSACTION: u32 = iow(b'c', 0, TRANSACTION_DATA_SIZE);
    pub const REPLY: u32 = iow(b'c', 1, TRANSACTION_DATA_SIZE);
    pub const ACQUIRE_RESULT: u32 = iow(b'c', 2, 4);
    pub const FREE_BUFFER: u32 = iow(b'c', 3, 8);
    pub const INCREFS: u32 = iow(b'c', 4, 4);
    pub const ACQUIRE: u32 = iow(b'c', 5, 4);
    pub const RELEASE: u32 = iow(b'c', 6, 4);
    pub const DECREFS: u32 = iow(b'c', 7, 4);
    pub const INCREFS_DONE: u32 = iow(b'c', 8, PTR_COOKIE_SIZE);
    pub const ACQUIRE_DONE: u32 = iow(b'c', 9, PTR_COOKIE_SIZE);
    pub const ATTEMPT_ACQUIRE: u32 = iow(b'c', 10, PRI_DESC_SIZE);
    pub const REGISTER_LOOPER: u32 = io(b'c', 11);
    pub const ENTER_LOOPER: u32 = io(b'c', 12);
    pub const EXIT_LOOPER: u32 = io(b'c', 13);
    pub const REQUEST_DEATH_NOTIFICATION: u32 = iow(b'c', 14, HANDLE_COOKIE_SIZE);
    pub const CLEAR_DEATH_NOTIFICATION: u32 = iow(b'c', 15, HANDLE_COOKIE_SIZE);
    pub const DEAD_BINDER_DONE: u32 = iow(b'c', 16, 8);
    pub const TRANSACTION_SG: u32 = iow(b'c', 17, TRANSACTION_DATA_SG_SIZE);
    pub const REPLY_SG: u32 = iow(b'c', 18, TRANSACTION_DATA_SG_SIZE);

    pub fn name(cmd: u32) -> &'static str {
        match cmd {
            TRANSACTION => "BC_TRANSACTION",
            REPLY => "BC_REPLY",
            ACQUIRE_RESULT => "BC_ACQUIRE_RESULT",
            FREE_BUFFER => "BC_FREE_BUFFER",
            INCREFS => "BC_INCREFS",
            ACQUIRE => "BC_ACQUIRE",
            RELEASE => "BC_RELEASE",
            DECREFS => "BC_DECREFS",
            INCREFS_DONE => "BC_INCREFS_DONE",
            ACQUIRE_DONE => "BC_ACQUIRE_DONE",
            ATTEMPT_ACQUIRE => "BC_ATTEMPT_ACQUIRE",
            REGISTER_LOOPER => "BC_REGISTER_LOOPER",
            ENTER_LOOPER => "BC_ENTER_LOOPER",
            EXIT_LOOPER => "BC_EXIT_LOOPER",
            REQUEST_DEATH_NOTIFICATION => "BC_REQUEST_DEATH_NOTIFICATION",
            CLEAR_DEATH_NOTIFICATION => "BC_CLEAR_DEATH_NOTIFICATION",
            DEAD_BINDER_DONE => "BC_DEAD_BINDER_DONE",
            TRANSACTION_SG => "BC_TRANSACTION_SG",
            REPLY_SG => "BC_REPLY_SG",
            _ => "BC_UNKNOWN",
        }
    }
}

/// Driver returns (read by userspace).
pub mod br {
    use super::*;

    pub const ERROR: u32 = ior(b'r', 0, 4);
    pub const OK: u32 = io(b'r', 1);
    pub const TRANSACTION_SEC_CTX: u32 = ior(b'r', 2, TRANSACTION_DATA_SECCTX_SIZE);
    pub const TRANSACTION: u32 = ior(b'r', 2, TRANSACTION_DATA_SIZE);
    pub const REPLY: u32 = ior(b'r', 3, TRANSACTION_DATA_SIZE);
    pub const ACQUIRE_RESULT: u32 = ior(b'r', 4, 4);
    pub const DEAD_REPLY: u32 = io(b'r', 5);
    pub const TRANSACTION_COMPLETE: u32 = io(b'r', 6);
    pub const INCREFS: u32 = ior(b'r', 7, PTR_COOKIE_SIZE);
    pub const ACQUIRE: u32 = ior(b'r', 8, PTR_COOKIE_SIZE);
    pub const RELEASE: u32 = ior(b'r', 9, PTR_COOKIE_SIZE);
    pub const DECREFS: u32 = ior(b'r', 10, PTR_COOKIE_SIZE);
    pub const ATTEMPT_ACQUIRE: u32 = ior(b'r', 11, PRI_PTR_COOKIE_SIZE);
    pub const NOOP: u32 = io(b'r', 12);
    pub const SPAWN_LOOPER: u32 = io(b'r', 13);
    pub const FINISHED: u32 = io(b'r', 14);
    pub const DEAD_BINDER: u32 = ior(b'r', 15, 8);
    pub const CLEAR_DEATH_NOTIFICATION_DONE: u32 = ior(b'r', 16, 8);
    pub const FAILED_REPLY: u32 = io(b'r', 17);
    pub const FROZEN_REPLY: u32 = io(b'r', 18);
    pub const ONEWAY_SPAM_SUSPECT: u32 = io(b'r', 19);

    pub fn name(cmd: u32) -> &'static str {
        match cmd {
            ERROR => "BR_ERROR",
            OK => "BR_OK",
            TRANSACTION_SEC_CTX => "BR_TRANSACTION_SEC_CTX",
            TRANSACTION => "BR_TRANSACTION",
            REPLY => "BR_REPLY",
            ACQUIRE_RESULT => "BR_ACQUIRE_RESULT",
            DEAD_REPLY => "BR_DEAD_REPLY",
            TRANSACTION_COMPLETE => "BR_TRANSACTION_COMPLETE",
            INCREFS => "BR_INCREFS",
            ACQUIRE => "BR_ACQUIRE",
            RELEASE => "BR_RELEASE",
            DECREFS => "BR_DECREFS",
            ATTEMPT_ACQUIRE => "BR_ATTEMPT_ACQUIRE",
            NOOP => "BR_NOOP",
            SPAWN_LOOPER => "BR_SPAWN_LOOPER",
            FINISHED => "BR_FINISHED",
            DEAD_BINDER => "BR_DEAD_BINDER",
            CLEAR_DEATH_NOTIFICATION_DONE => "BR_CLEAR_DEATH_NOTIFICATION_DONE",
            FAILED_REPLY => "BR_FAILED_REPLY",
            FROZEN_REPLY => "BR_FROZEN_REPLY",
            ONEWAY_SPAM_SUSPECT => "BR_ONEWAY_SPAM_SUSPECT",
            _ => "BR_UNKNOWN",
        }
    }
}

/// Bounds-checked little cursor over a received byte span.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self { Self { buf, pos: 0 } }
    pub fn position(&self) -> usize { self.pos }
    pub fn remaining(&self) -> usize { self.buf.len() - self.pos }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(BinderError::not_enough_data(len, self.remaining()));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u32(&mut self) -> Result<u32> { Ok(u32::from_ne_bytes(self.array()?)) }
    pub fn i32(&mut self) -> Result<i32> { Ok(i32::from_ne_bytes(self.array()?)) }
    pub fn u64(&mut self) -> Result<u64> { Ok(u64::from_ne_bytes(self.array()?)) }
}

/// Fixed-size record builder.
#[derive(Debug)]
pub struct WireWriter<const N: usize> {
    out: [u8; N],
    pos: usize,
}

impl<const N: usize> Default for WireWriter<N> {
    fn default() -> Self { Self { out: [0u8; N], pos: 0 } }
}

impl<const N: usize> WireWriter<N> {
    pub fn new() -> Self { Self::default() }

    pub fn bytes(mut self, src: &[u8]) -> Self {
        self.out[self.pos..self.pos + src.len()].copy_from_slice(src);
        self.pos += src.len();
        self
    }

    pub fn u32(self, v: u32) -> Self { self.bytes(&v.to_ne_bytes()) }
    pub fn i32(self, v: i32) -> Self { self.bytes(&v.to_ne_bytes()) }
    pub fn u64(self, v: u64) -> Self { self.bytes(&v.to_ne_bytes()) }

    pub fn finish(self) -> [u8; N] {
        debug_assert_eq!(self.pos, N, "record not fully written");
        self.out
    }
}

/// Union of a 32-bit handle and a 64-bit pointer, as laid out by the kernel.
fn handle_union(handle: u32) -> [u8; 8] {
    let mut raw = [0u8; 8];
    raw[..4].copy_from_slice(&handle.to_ne_bytes());
    raw
}

fn union_handle(raw: &[u8; 8]) -> u32 {
    u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]])
}

/// `struct binder_transaction_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionData {
    pub(crate) target: [u8; 8],
    pub cookie: u64,
    pub code: u32,
    pub flags: TransactionFlags,
    pub sender_pid: i32,
    pub sender_euid: u32,
    pub data_size: u64,
    pub offsets_size: u64,
    pub data_buffer: u64,
    pub data_offsets: u64,
}

impl TransactionData {
    pub fn to_handle(handle: u32) -> Self {
        Self { target: handle_union(handle), ..Default::default() }
    }

    pub fn to_ptr(ptr: u64) -> Self {
        Self { target: ptr.to_ne_bytes(), ..Default::default() }
    }

    pub fn handle(&self) -> u32 { union_handle(&self.target) }
    pub fn ptr(&self) -> u64 { u64::from_ne_bytes(self.target) }
    pub fn set_ptr(&mut self, ptr: u64) { self.target = ptr.to_ne_bytes(); }

    pub fn encode(&self) -> [u8; TRANSACTION_DATA_SIZE] {
        WireWriter::new()
            .bytes(&self.target)
            .u64(self.cookie)
            .u32(self.code)
            .u32(self.flags.bits())
            .i32(self.sender_pid)
            .u32(self.sender_euid)
            .u64(self.data_size)
            .u64(self.offsets_size)
            .u64(self.data_buffer)
            .u64(self.data_offsets)
            .finish()
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            target: r.array()?,
            cookie: r.u64()?,
            code: r.u32()?,
            flags: TransactionFlags::from_bits_retain(r.u32()?),
            sender_pid: r.i32()?,
            sender_euid: r.u32()?,
            data_size: r.u64()?,
            offsets_size: r.u64()?,
            data_buffer: r.u64()?,
            data_offsets: r.u64()?,
        })
    }
}

/// `struct binder_transaction_data_sg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionDataSg {
    pub tr: TransactionData,
    pub buffers_size: u64,
}

impl TransactionDataSg {
    pub fn encode(&self) -> [u8; TRANSACTION_DATA_SG_SIZE] {
        WireWriter::new().bytes(&self.tr.encode()).u64(self.buffers_size).finish()
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self { tr: TransactionData::decode(r)?, buffers_size: r.u64()? })
    }
}

/// `struct binder_ptr_cookie`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtrCookie {
    pub ptr: u64,
    pub cookie: u64,
}

impl PtrCookie {
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self { ptr: r.u64()?, cookie: r.u64()? })
    }

    pub fn encode(&self) -> [u8; PTR_COOKIE_SIZE] {
        WireWriter::new().u64(self.ptr).u64(self.cookie).finish()
    }
}

/// One embedded object, as it appears in a transaction payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinderObject {
    /// Local object: the driver-visible weak-ref pointer plus the object cookie.
    Binder { weak: bool, ptr: u64, cookie: u64, flags: u32 },
    Handle { weak: bool, handle: u32, cookie: u64, flags: u32 },
    /// `cookie != 0` means the fd is closed when the owning Parcel releases it.
    Fd { fd: i32, cookie: u64 },
    FdArray { num_fds: u64, parent: u64, parent_offset: u64 },
    Buffer { flags: u32, buffer: u64, length: u64, parent: u64, parent_offset: u64 },
}

impl BinderObject {
    pub fn null_binder() -> Self {
        BinderObject::Binder { weak: false, ptr: 0, cookie: 0, flags: 0 }
    }

    pub fn kind(&self) -> u32 {
        match self {
            Self::Binder { weak: false, .. } => BINDER_TYPE_BINDER,
            Self::Binder { weak: true, .. } => BINDER_TYPE_WEAK_BINDER,
            Self::Handle { weak: false, .. } => BINDER_TYPE_HANDLE,
            Self::Handle { weak: true, .. } => BINDER_TYPE_WEAK_HANDLE,
            Self::Fd { .. } => BINDER_TYPE_FD,
            Self::FdArray { .. } => BINDER_TYPE_FDA,
            Self::Buffer { .. } => BINDER_TYPE_PTR,
        }
    }

    pub fn size(&self) -> usize {
        Self::size_of_kind(self.kind()).unwrap_or(FLAT_OBJECT_SIZE)
    }

    pub fn size_of_kind(kind: u32) -> Option<usize> {
        match kind {
            BINDER_TYPE_BINDER | BINDER_TYPE_WEAK_BINDER | BINDER_TYPE_HANDLE | BINDER_TYPE_WEAK_HANDLE => {
                Some(FLAT_OBJECT_SIZE)
            }
            BINDER_TYPE_FD => Some(FD_OBJECT_SIZE),
            BINDER_TYPE_FDA => Some(FDA_OBJECT_SIZE),
            BINDER_TYPE_PTR => Some(BUFFER_OBJECT_SIZE),
            _ => None,
        }
    }

    /// Null objects need no kernel fix-up and are not entered in the object table.
    pub fn is_null(&self) -> bool {
        match *self {
            Self::Binder { ptr, .. } => ptr == 0,
            Self::Handle { handle, .. } => handle == 0,
            Self::Buffer { buffer, .. } => buffer == 0,
            Self::Fd { .. } | Self::FdArray { .. } => false,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Self::Binder { ptr, cookie, flags, .. } => {
                WireWriter::<FLAT_OBJECT_SIZE>::new().u32(self.kind()).u32(flags).u64(ptr).u64(cookie).finish().to_vec()
            }
            Self::Handle { handle, cookie, flags, .. } => WireWriter::<FLAT_OBJECT_SIZE>::new()
                .u32(self.kind())
                .u32(flags)
                .bytes(&handle_union(handle))
                .u64(cookie)
                .finish()
                .to_vec(),
            Self::Fd { fd, cookie } => WireWriter::<FD_OBJECT_SIZE>::new()
                .u32(self.kind())
                .u32(0)
                .bytes(&handle_union(fd as u32))
                .u64(cookie)
                .finish()
                .to_vec(),
            Self::FdArray { num_fds, parent, parent_offset } => WireWriter::<FDA_OBJECT_SIZE>::new()
                .u32(self.kind())
                .u32(0)
                .u64(num_fds)
                .u64(parent)
                .u64(parent_offset)
                .finish()
                .to_vec(),
            Self::Buffer { flags, buffer, length, parent, parent_offset } => WireWriter::<BUFFER_OBJECT_SIZE>::new()
                .u32(self.kind())
                .u32(flags)
                .u64(buffer)
                .u64(length)
                .u64(parent)
                .u64(parent_offset)
                .finish()
                .to_vec(),
        }
    }

    /// Decodes the object starting at the front of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(bytes);
        let kind = r.u32()?;
        let obj = match kind {
            BINDER_TYPE_BINDER | BINDER_TYPE_WEAK_BINDER => Self::Binder {
                weak: kind == BINDER_TYPE_WEAK_BINDER,
                flags: r.u32()?,
                ptr: r.u64()?,
                cookie: r.u64()?,
            },
            BINDER_TYPE_HANDLE | BINDER_TYPE_WEAK_HANDLE => Self::Handle {
                weak: kind == BINDER_TYPE_WEAK_HANDLE,
                flags: r.u32()?,
                handle: union_handle(&r.array()?),
                cookie: r.u64()?,
            },
            BINDER_TYPE_FD => {
                let _pad = r.u32()?;
                Self::Fd { fd: union_handle(&r.array()?) as i32, cookie: r.u64()? }
            }
            BINDER_TYPE_FDA => {
                let _pad = r.u32()?;
                Self::FdArray { num_fds: r.u64()?, parent: r.u64()?, parent_offset: r.u64()? }
            }
            BINDER_TYPE_PTR => Self::Buffer {
                flags: r.u32()?,
                buffer: r.u64()?,
                length: r.u64()?,
                parent: r.u64()?,
                parent_offset: r.u64()?,
            },
            other => return Err(BinderError::bad_type(format_args!("object type {other:#010x}"))),
        };
        Ok(obj)
    }

    /// Reads only the type header.
    pub fn peek_kind(bytes: &[u8]) -> Result<u32> {
        WireReader::new(bytes).u32()
    }
}

/// `struct binder_write_read`, passed to `BINDER_WRITE_READ`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct BinderWriteRead {
    pub write_size: u64,
    pub write_consumed: u64,
    pub write_buffer: u64,
    pub read_size: u64,
    pub read_consumed: u64,
    pub read_buffer: u64,
}

/// `struct binder_version`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct BinderVersion {
    pub protocol_version: i32,
}

/// `struct binder_node_debug_info`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NodeDebugInfo {
    pub ptr: u64,
    pub cookie: u64,
    pub has_strong_ref: u32,
    pub has_weak_ref: u32,
}

/// `struct binder_node_info_for_ref`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfoForRef {
    pub handle: u32,
    pub strong_count: u32,
    pub weak_count: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    pub reserved3: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes_match_kernel_values() {
        assert_eq!(bc::TRANSACTION, 0x4040_6300);
        assert_eq!(bc::FREE_BUFFER, 0x4008_6303);
        assert_eq!(bc::ENTER_LOOPER, 0x630c);
        assert_eq!(bc::REQUEST_DEATH_NOTIFICATION, 0x400c_630e);
        assert_eq!(bc::TRANSACTION_SG, 0x4048_6311);
        assert_eq!(br::TRANSACTION, 0x8040_7202);
        assert_eq!(br::TRANSACTION_SEC_CTX, 0x8048_7202);
        assert_eq!(br::NOOP, 0x720c);
        assert_eq!(br::DEAD_BINDER, 0x8008_720f);
        assert_eq!(br::ONEWAY_SPAM_SUSPECT, 0x7213);
    }

    #[test]
    fn object_type_codes() {
        assert_eq!(BINDER_TYPE_BINDER, 0x7362_2a85);
        assert_eq!(BINDER_TYPE_HANDLE, 0x7368_2a85);
        assert_eq!(BINDER_TYPE_FDA, 0x6664_6185);
        assert_eq!(BINDER_TYPE_PTR, 0x7074_2a85);
    }

    #[test]
    fn transaction_record_layout() {
        let mut tr = TransactionData::to_handle(5);
        tr.code = 1;
        tr.flags = TransactionFlags::ACCEPT_FDS;
        tr.data_size = 4;
        let raw = tr.encode();
        assert_eq!(&raw[0..4], &5u32.to_ne_bytes());
        assert_eq!(&raw[4..8], &[0, 0, 0, 0]);
        assert_eq!(&raw[16..20], &1u32.to_ne_bytes());
        assert_eq!(&raw[20..24], &0x10u32.to_ne_bytes());
        assert_eq!(&raw[32..40], &4u64.to_ne_bytes());

        let back = TransactionData::decode(&mut WireReader::new(&raw)).expect("decode");
        assert_eq!(back, tr);
        assert_eq!(back.handle(), 5);
    }

    #[test]
    fn buffer_object_layout() {
        let obj = BinderObject::Buffer {
            flags: BINDER_BUFFER_FLAG_HAS_PARENT,
            buffer: 0x1000,
            length: 32,
            parent: 2,
            parent_offset: 8,
        };
        let raw = obj.encode();
        assert_eq!(raw.len(), BUFFER_OBJECT_SIZE);
        assert_eq!(BinderObject::decode(&raw).expect("decode"), obj);
    }

    #[test]
    fn unknown_object_type_is_rejected() {
        let raw = [0xffu8; FLAT_OBJECT_SIZE];
        let err = BinderObject::decode(&raw).unwrap_err();
        assert!(err.is(crate::StatusCode::BadType));
    }

    #[test]
    fn short_object_is_not_enough_data() {
        let raw = BinderObject::null_binder().encode();
        let err = BinderObject::decode(&raw[..10]).unwrap_err();
        assert!(err.is(crate::StatusCode::NotEnoughData));
    }
}
