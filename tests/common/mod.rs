#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hwbinder::{Binder, BinderError, LocalObject, Loopback, Parcel, ProcessConfig, ProcessState, StatusCode, TransactionFlags};

/// Handed to the context manager to fetch the service it publishes.
pub const GET_SERVICE: u32 = 1;

pub fn config() -> ProcessConfig {
    ProcessConfig { mmap_size: 128 * 1024, ..Default::default() }
}

/// Opens a process that manages the context and answers `GET_SERVICE` with `service`.
pub fn serve(lb: &Loopback, service: Binder) -> Arc<ProcessState> {
    let server = lb.open(config()).unwrap();
    server.become_context_manager().unwrap();
    let root = LocalObject::new(move |code: u32, _data: &Parcel, reply: &mut Parcel, _flags: TransactionFlags| {
        match code {
            GET_SERVICE => reply.write_strong_binder(Some(&service)),
            _ => Err(BinderError::new(StatusCode::UnknownTransaction)),
        }
    });
    server.set_context_object(root);
    server.start_thread_pool();
    server
}

pub fn lookup(client: &Arc<ProcessState>) -> Binder {
    let manager = client.context_object().unwrap();
    let mut reply = Parcel::new();
    manager.transact(GET_SERVICE, &Parcel::new(), Some(&mut reply), TransactionFlags::empty()).unwrap();
    reply.read_strong_binder().unwrap().expect("service binder")
}

pub fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}
