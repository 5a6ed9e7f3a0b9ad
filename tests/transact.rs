mod common;

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use common::{config, eventually, lookup, serve};
use hwbinder::{
    Binder, BinderError, DeathRecipient, LocalObject, Loopback, Parcel, RemoteProxy, StatusCode, ThreadState,
    TransactionFlags,
};

const ADD_ONE: u32 = 1;
const TAKE_BINDER: u32 = 2;
const NOTE: u32 = 3;
const CALL_BACK: u32 = 4;
const WHO_AM_I: u32 = 5;

fn adder() -> Binder {
    Binder::local(|code: u32, data: &Parcel, reply: &mut Parcel, _flags: TransactionFlags| match code {
        ADD_ONE => reply.write_i32(data.read_i32()? + 1),
        TAKE_BINDER => {
            let held = data.read_strong_binder()?.ok_or_else(|| BinderError::new(StatusCode::UnexpectedNull))?;
            reply.write_bool(held.as_remote().is_some())
        }
        CALL_BACK => {
            let callback = data.read_strong_binder()?.ok_or_else(|| BinderError::new(StatusCode::UnexpectedNull))?;
            let mut args = Parcel::new();
            args.write_i32(data.read_i32()?)?;
            let mut answer = Parcel::new();
            callback.transact(ADD_ONE, &args, Some(&mut answer), TransactionFlags::empty())?;
            reply.write_i32(answer.read_i32()?)
        }
        WHO_AM_I => {
            let process = data.process().ok_or_else(|| BinderError::new(StatusCode::NoInit))?;
            let (pid, sid) = ThreadState::with_current(&process, |t| (t.calling_pid(), t.calling_sid()))
                .ok_or_else(|| BinderError::new(StatusCode::NoInit))?;
            reply.write_i32(pid)?;
            reply.write_c_string(sid.as_deref().unwrap_or(""))
        }
        _ => Err(BinderError::new(StatusCode::UnknownTransaction)),
    })
}

fn add_one(service: &Binder, value: i32) -> hwbinder::Result<i32> {
    let mut data = Parcel::new();
    data.write_i32(value)?;
    let mut reply = Parcel::new();
    service.transact(ADD_ONE, &data, Some(&mut reply), TransactionFlags::empty())?;
    reply.read_i32()
}

struct Obituary(Mutex<Sender<(u32, u64)>>);

impl DeathRecipient for Obituary {
    fn binder_died(&self, who: &RemoteProxy, cookie: u64) {
        let _ = self.0.lock().unwrap().send((who.handle(), cookie));
    }
}

#[test]
fn call_reaches_service_through_context_manager() {
    let lb = Loopback::new();
    let _server = serve(&lb, adder());
    let client = lb.open(config()).unwrap();

    let service = lookup(&client);
    let handle = service.as_remote().expect("service is remote").handle();
    assert_ne!(handle, 0);
    service.ping().unwrap();
    assert_eq!(add_one(&service, 42).unwrap(), 43);

    let mut data = Parcel::new();
    data.write_i32(7).unwrap();
    let mut reply = Parcel::new();
    ThreadState::with_current(&client, |t| {
        t.transact(handle, ADD_ONE, &data, Some(&mut reply), TransactionFlags::empty())
    })
    .unwrap()
    .unwrap();
    assert_eq!(reply.read_i32().unwrap(), 8);
}

#[test]
fn handler_error_comes_back_as_status() {
    let lb = Loopback::new();
    let _server = serve(&lb, adder());
    let client = lb.open(config()).unwrap();
    let service = lookup(&client);

    let mut reply = Parcel::new();
    let err = service.transact(99, &Parcel::new(), Some(&mut reply), TransactionFlags::empty()).unwrap_err();
    assert!(err.is(StatusCode::UnknownTransaction));

    // A short request fails inside the handler and the connection stays usable.
    let err = service.transact(ADD_ONE, &Parcel::new(), Some(&mut reply), TransactionFlags::empty()).unwrap_err();
    assert!(!err.is(StatusCode::DeadObject));
    assert_eq!(add_one(&service, 1).unwrap(), 2);
}

#[test]
fn remote_references_return_to_baseline() {
    let lb = Loopback::new();
    let _server = serve(&lb, adder());
    let client = lb.open(config()).unwrap();
    client.start_thread_pool();
    let service = lookup(&client);

    let token = Binder::local(|_: u32, _: &Parcel, _: &mut Parcel, _: TransactionFlags| Ok(()));
    let local = token.as_local().unwrap().clone();
    for _ in 0..5 {
        let mut data = Parcel::new();
        data.write_strong_binder(Some(&token)).unwrap();
        let mut reply = Parcel::new();
        service.transact(TAKE_BINDER, &data, Some(&mut reply), TransactionFlags::empty()).unwrap();
        assert!(reply.read_bool().unwrap(), "server should see a proxy");
    }
    drop(token);

    eventually("driver references to drop", || {
        local.remote_state() == hwbinder::binder::RemoteState::LocalOnly && local.strong_count() == 1
    });
}

#[test]
fn proxy_holds_a_driver_reference() {
    let lb = Loopback::new();
    let node = LocalObject::new(|_: u32, _: &Parcel, _: &mut Parcel, _: TransactionFlags| Ok(()));
    let token = node.token();
    let server = serve(&lb, Binder::from(node));
    let client = lb.open(config()).unwrap();
    let service = lookup(&client);
    let handle = service.as_remote().unwrap().handle();
    ThreadState::with_current(&client, ThreadState::flush_commands);

    assert!(client.strong_ref_count_for_handle(handle).is_some_and(|n| n >= 1));
    eventually("the owner to be told", || {
        server.kernel_references().unwrap().iter().any(|n| n.ptr == token && n.has_strong_ref == 1)
    });
}

#[test]
fn death_notice_follows_kill() {
    let lb = Loopback::new();
    let server = serve(&lb, adder());
    let client = lb.open(config()).unwrap();
    client.start_thread_pool();
    let service = lookup(&client);
    let handle = service.as_remote().unwrap().handle();

    let (tx, rx) = mpsc::channel();
    let recipient: Arc<dyn DeathRecipient> = Arc::new(Obituary(Mutex::new(tx)));
    service.link_to_death(&recipient, 7).unwrap();
    lb.kill(&server);

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (handle, 7));
    assert!(!service.is_alive());
    assert!(add_one(&service, 1).unwrap_err().is(StatusCode::DeadObject));
    assert!(service.link_to_death(&recipient, 8).unwrap_err().is(StatusCode::DeadObject));
}

#[test]
fn unlinked_recipient_hears_nothing() {
    let lb = Loopback::new();
    let server = serve(&lb, adder());
    let client = lb.open(config()).unwrap();
    client.start_thread_pool();
    let service = lookup(&client);

    let (tx, rx) = mpsc::channel();
    let recipient: Arc<dyn DeathRecipient> = Arc::new(Obituary(Mutex::new(tx)));
    service.link_to_death(&recipient, 1).unwrap();
    let removed = service.unlink_to_death(Some(&recipient), 1).unwrap();
    assert!(removed.is_some_and(|r| Arc::ptr_eq(&r, &recipient)));
    assert!(service.unlink_to_death(None, 1).unwrap_err().is(StatusCode::NameNotFound));

    lb.kill(&server);
    assert!(add_one(&service, 1).unwrap_err().is(StatusCode::DeadObject));
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn one_way_calls_arrive_without_replies() {
    let lb = Loopback::new();
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let sink = Binder::local(move |code: u32, data: &Parcel, _reply: &mut Parcel, flags: TransactionFlags| {
        if code != NOTE {
            return Err(BinderError::new(StatusCode::UnknownTransaction));
        }
        let value = data.read_i32()?;
        let _ = tx.lock().unwrap().send((value, flags.contains(TransactionFlags::ONE_WAY)));
        Ok(())
    });
    let _server = serve(&lb, sink);
    let client = lb.open(config()).unwrap();
    let service = lookup(&client);

    for value in 0..5 {
        let mut data = Parcel::new();
        data.write_i32(value).unwrap();
        service.transact(NOTE, &data, None, TransactionFlags::ONE_WAY).unwrap();
    }
    let mut seen: Vec<(i32, bool)> = (0..5).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
    seen.sort();
    assert_eq!(seen, (0..5).map(|v| (v, true)).collect::<Vec<_>>());
}

#[test]
fn nested_call_runs_on_the_waiting_thread() {
    let lb = Loopback::new();
    let _server = serve(&lb, adder());
    let client = lb.open(config()).unwrap();
    let service = lookup(&client);

    let ran_on: Arc<Mutex<Option<ThreadId>>> = Arc::default();
    let seen = ran_on.clone();
    let doubler = Binder::local(move |code: u32, data: &Parcel, reply: &mut Parcel, _flags: TransactionFlags| {
        assert_eq!(code, ADD_ONE);
        *seen.lock().unwrap() = Some(thread::current().id());
        reply.write_i32(data.read_i32()? * 2)
    });

    let mut data = Parcel::new();
    data.write_strong_binder(Some(&doubler)).unwrap();
    data.write_i32(21).unwrap();
    let mut reply = Parcel::new();
    service.transact(CALL_BACK, &data, Some(&mut reply), TransactionFlags::empty()).unwrap();

    assert_eq!(reply.read_i32().unwrap(), 42);
    assert_eq!(*ran_on.lock().unwrap(), Some(thread::current().id()));
}

#[test]
fn caller_identity_reaches_service() {
    let lb = Loopback::new();
    let service = adder();
    service.as_local().unwrap().set_request_sid(true);
    let _server = serve(&lb, service);
    let client = lb.open(config()).unwrap();
    let service = lookup(&client);

    let mut reply = Parcel::new();
    service.transact(WHO_AM_I, &Parcel::new(), Some(&mut reply), TransactionFlags::empty()).unwrap();
    assert_eq!(reply.read_i32().unwrap(), std::process::id() as i32);
    let sid = reply.read_c_string().unwrap();
    assert!(sid.starts_with("u:r:loopback_") && sid.ends_with(":s0"), "unexpected sid {sid:?}");
}

#[test]
fn idle_helper_threads_are_finished() {
    let lb = Loopback::with_idle_timeout(Duration::from_millis(50));
    let server = serve(&lb, adder());
    let client = lb.open(config()).unwrap();
    let service = lookup(&client);

    // The main pool thread never times out, so the server keeps answering.
    thread::sleep(Duration::from_millis(200));
    assert_eq!(add_one(&service, 9).unwrap(), 10);
    assert_eq!(server.executing_threads(), 0);
}
