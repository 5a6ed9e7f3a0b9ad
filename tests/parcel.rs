mod common;

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;

use common::{config, lookup, serve};
use hwbinder::abi::BinderObject;
use hwbinder::{Binder, BinderError, Loopback, NativeHandle, Parcel, Sp, StatusCode, TransactionFlags};

const ECHO_TREE: u32 = 1;
const READ_FD: u32 = 2;
const READ_HANDLE: u32 = 3;
const ECHO_BINDER: u32 = 4;
const STRAY_REPLY: u32 = 5;

fn stray_buffer() -> BinderObject {
    BinderObject::Buffer { flags: 0, buffer: 0x10, length: 4096, parent: 0, parent_offset: 0 }
}

fn drain(fd: RawFd) -> hwbinder::Result<Vec<u8>> {
    // SAFETY: the fd belongs to the parcel being dispatched and outlives this call.
    let owned = unsafe { BorrowedFd::borrow_raw(fd) }.try_clone_to_owned().map_err(BinderError::from)?;
    let mut stream = UnixStream::from(owned);
    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).map_err(BinderError::from)?;
    Ok(buf[..n].to_vec())
}

fn inspector() -> Binder {
    Binder::local(|code: u32, data: &Parcel, reply: &mut Parcel, _flags: TransactionFlags| match code {
        ECHO_TREE => {
            let (parent, header) = data.read_buffer(16)?;
            let mut len = [0u8; 8];
            len.copy_from_slice(&header[8..16]);
            let (_, child) = data.read_embedded_buffer(u64::from_ne_bytes(len) as usize, parent, 0)?;
            reply.write_byte_array(child)
        }
        READ_FD => reply.write_byte_array(&drain(data.read_file_descriptor()?)?),
        READ_HANDLE => {
            let handle = data.read_native_handle()?;
            reply.write_i32(handle.ints.iter().sum())?;
            reply.write_byte_array(&drain(handle.fds[0])?)
        }
        ECHO_BINDER => reply.write_strong_binder(data.read_strong_binder()?.as_ref()),
        STRAY_REPLY => reply.write_object(&stray_buffer()),
        _ => Err(BinderError::new(StatusCode::UnknownTransaction)),
    })
}

fn call(service: &Binder, code: u32, data: &Parcel) -> Parcel {
    let mut reply = Parcel::new();
    service.transact(code, data, Some(&mut reply), TransactionFlags::empty()).unwrap();
    reply
}

#[test]
fn embedded_buffer_is_relinked_in_receiver() {
    let lb = Loopback::new();
    let _server = serve(&lb, inspector());
    let client = lb.open(config()).unwrap();
    let service = lookup(&client);

    let child = b"scatter-gather payload";
    let mut header = [0u8; 16];
    header[8..].copy_from_slice(&(child.len() as u64).to_ne_bytes());
    let mut data = Parcel::new();
    let parent = data.write_buffer(&header).unwrap();
    data.write_embedded_buffer(child, parent, 0).unwrap();
    assert_eq!(data.ipc_buffer_size(), 16 + child.len().next_multiple_of(8));

    let reply = call(&service, ECHO_TREE, &data);
    assert_eq!(reply.read_byte_array().unwrap(), child);
}

#[test]
fn file_descriptor_is_duplicated_into_receiver() {
    let lb = Loopback::new();
    let _server = serve(&lb, inspector());
    let client = lb.open(config()).unwrap();
    let service = lookup(&client);

    let (mut tx, rx) = UnixStream::pair().unwrap();
    tx.write_all(b"through the driver").unwrap();
    let mut data = Parcel::new();
    data.write_file_descriptor(rx.as_raw_fd(), false).unwrap();
    assert!(data.has_fds());

    let reply = call(&service, READ_FD, &data);
    assert_eq!(reply.read_byte_array().unwrap(), b"through the driver");
}

#[test]
fn native_handle_carries_fds_and_ints() {
    let lb = Loopback::new();
    let _server = serve(&lb, inspector());
    let client = lb.open(config()).unwrap();
    let service = lookup(&client);

    let (mut tx, rx) = UnixStream::pair().unwrap();
    tx.write_all(b"handle").unwrap();
    let handle = NativeHandle { fds: vec![rx.as_raw_fd()], ints: vec![5, 6, 7] };
    let mut data = Parcel::new();
    data.write_native_handle(Some(&handle)).unwrap();

    let reply = call(&service, READ_HANDLE, &data);
    assert_eq!(reply.read_i32().unwrap(), 18);
    assert_eq!(reply.read_byte_array().unwrap(), b"handle");
}

#[test]
fn own_binder_comes_home_as_local() {
    let lb = Loopback::new();
    let _server = serve(&lb, inspector());
    let client = lb.open(config()).unwrap();
    let service = lookup(&client);

    let mine = Binder::local(|_: u32, _: &Parcel, _: &mut Parcel, _: TransactionFlags| Ok(()));
    let mut data = Parcel::new();
    data.write_strong_binder(Some(&mine)).unwrap();
    let reply = call(&service, ECHO_BINDER, &data);

    let back = reply.read_strong_binder().unwrap().expect("binder echoed");
    let back = back.as_local().expect("local again");
    assert!(Sp::ptr_eq(back, mine.as_local().unwrap()));

    let mut data = Parcel::new();
    data.write_strong_binder(None).unwrap();
    let reply = call(&service, ECHO_BINDER, &data);
    assert!(reply.read_strong_binder().unwrap().is_none());
}

#[test]
fn service_proxy_is_cached_per_handle() {
    let lb = Loopback::new();
    let _server = serve(&lb, inspector());
    let client = lb.open(config()).unwrap();

    let first = lookup(&client);
    let second = lookup(&client);
    assert!(Sp::ptr_eq(first.as_remote().unwrap(), second.as_remote().unwrap()));
}

#[test]
fn buffer_outside_the_parcel_is_refused_before_sending() {
    let lb = Loopback::new();
    let _server = serve(&lb, inspector());
    let client = lb.open(config()).unwrap();
    let service = lookup(&client);

    let mut data = Parcel::new();
    data.write_object(&stray_buffer()).unwrap();
    let mut reply = Parcel::new();
    let err = service.transact(ECHO_TREE, &data, Some(&mut reply), TransactionFlags::empty()).unwrap_err();
    assert!(err.is(StatusCode::BadValue));
    assert_eq!(reply.error(), Some(StatusCode::BadValue));

    let err = service.transact(STRAY_REPLY, &Parcel::new(), Some(&mut reply), TransactionFlags::empty()).unwrap_err();
    assert!(err.is(StatusCode::BadValue));

    let mut data = Parcel::new();
    data.write_strong_binder(None).unwrap();
    let reply = call(&service, ECHO_BINDER, &data);
    assert!(reply.read_strong_binder().unwrap().is_none());
}
