//! The Transaction Engine: one per thread per gateway.
//!
//! Commands are batched in `output` and driver returns are parsed from `input`;
//! a single `BINDER_WRITE_READ` moves both. Replies are matched to calls by the
//! thread that made them, so [`ThreadState::transact`] simply keeps reading
//! until its reply shows up, executing whatever else the driver hands it first.
//!
//! No `RefCell` borrow is held while user code runs or while a reference is
//! dropped: both can re-enter the engine on the same thread.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use nix::errno::Errno;

use crate::abi::{
    PtrCookie, TRANSACTION_DATA_SIZE, TransactionData, TransactionDataSg, WireReader, bc, br,
};
use crate::binder::{Binder, LocalObject, RemoteProxy, WeakBinder};
use crate::error::fatal;
use crate::process::ProcessState;
use crate::refs::{Sp, Wp};
use crate::{BinderError, CallRestriction, Driver, Parcel, Result, StatusCode, TransactionFlags};

const IN_CAPACITY: usize = 256;
const OUT_CAPACITY: usize = 256;
const MAX_SID_LEN: usize = 4096;

thread_local! {
    static CURRENT: RefCell<Vec<Rc<ThreadState>>> = const { RefCell::new(Vec::new()) };
}

type PostCommandTask = Box<dyn FnOnce()>;

/// Outgoing payload spans, as the driver is told about them.
struct Payload<'a> {
    data: &'a [u8],
    offsets: &'a [u64],
    buffers_size: usize,
}

impl<'a> Payload<'a> {
    fn of(parcel: &'a Parcel) -> Self {
        Self { data: parcel.data(), offsets: parcel.objects(), buffers_size: parcel.ipc_buffer_size() }
    }
}

pub struct ThreadState {
    process: Arc<ProcessState>,
    driver: Arc<dyn Driver>,
    input: RefCell<Parcel>,
    output: RefCell<Parcel>,
    pending_strong: RefCell<Vec<Arc<LocalObject>>>,
    pending_weak: RefCell<Vec<Arc<LocalObject>>>,
    post_write_strong: RefCell<Vec<Binder>>,
    post_write_weak: RefCell<Vec<WeakBinder>>,
    post_command: RefCell<Vec<PostCommandTask>>,
    calling_pid: Cell<i32>,
    calling_uid: Cell<u32>,
    calling_sid: Cell<u64>,
    last_flags: Cell<TransactionFlags>,
    call_restriction: Cell<CallRestriction>,
    is_looper: Cell<bool>,
    is_polling: Cell<bool>,
}

impl std::fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadState")
            .field("calling_pid", &self.calling_pid.get())
            .field("calling_uid", &self.calling_uid.get())
            .field("is_looper", &self.is_looper.get())
            .finish_non_exhaustive()
    }
}

impl ThreadState {
    fn new(process: &Arc<ProcessState>) -> Self {
        let input = Parcel::with_capacity(IN_CAPACITY).unwrap_or_default();
        let output = Parcel::with_capacity(OUT_CAPACITY).unwrap_or_default();
        Self {
            driver: process.driver().clone(),
            call_restriction: Cell::new(process.call_restriction()),
            process: process.clone(),
            input: RefCell::new(input),
            output: RefCell::new(output),
            pending_strong: RefCell::default(),
            pending_weak: RefCell::default(),
            post_write_strong: RefCell::default(),
            post_write_weak: RefCell::default(),
            post_command: RefCell::default(),
            calling_pid: Cell::new(std::process::id() as i32),
            calling_uid: Cell::new(nix::unistd::geteuid().as_raw()),
            calling_sid: Cell::new(0),
            last_flags: Cell::new(TransactionFlags::empty()),
            is_looper: Cell::new(false),
            is_polling: Cell::new(false),
        }
    }

    /// This thread's engine for `process`, created on first use.
    ///
    /// `None` once thread-local storage is being torn down.
    pub fn current(process: &Arc<ProcessState>) -> Option<Rc<ThreadState>> {
        let found = CURRENT
            .try_with(|all| all.borrow().iter().find(|t| Arc::ptr_eq(&t.process, process)).cloned())
            .ok()?;
        if found.is_some() {
            return found;
        }
        let fresh = Rc::new(ThreadState::new(process));
        CURRENT.try_with(|all| all.borrow_mut().push(fresh.clone())).ok()?;
        Some(fresh)
    }

    pub fn with_current<R>(process: &Arc<ProcessState>, f: impl FnOnce(&ThreadState) -> R) -> Option<R> {
        Self::current(process).map(|t| f(&t))
    }

    /// Drops this thread's engine for `process`, flushing pending commands.
    pub fn detach(process: &Arc<ProcessState>) {
        let taken = CURRENT.try_with(|all| {
            let mut all = all.borrow_mut();
            let pos = all.iter().position(|t| Arc::ptr_eq(&t.process, process))?;
            Some(all.remove(pos))
        });
        drop(taken);
    }

    pub fn process(&self) -> &Arc<ProcessState> { &self.process }

    // ---- identity ----

    pub fn calling_pid(&self) -> i32 { self.calling_pid.get() }
    pub fn calling_uid(&self) -> u32 { self.calling_uid.get() }
    pub fn last_transaction_flags(&self) -> TransactionFlags { self.last_flags.get() }

    /// Security context of the caller, when its target asked for one.
    pub fn calling_sid(&self) -> Option<String> {
        let addr = self.calling_sid.get();
        if addr == 0 {
            return None;
        }
        let region = self.driver.region()?;
        let end = region.base() + region.len() as u64;
        let avail = (end.saturating_sub(addr) as usize).min(MAX_SID_LEN);
        let bytes = region.slice(addr, avail).ok()?;
        let len = bytes.iter().position(|&b| b == 0)?;
        std::str::from_utf8(&bytes[..len]).ok().map(str::to_owned)
    }

    /// Resets the caller to this process; returns a token for [`Self::restore_calling_identity`].
    pub fn clear_calling_identity(&self) -> i64 {
        let token = ((self.calling_uid.get() as i64) << 32) | self.calling_pid.get() as u32 as i64;
        self.calling_uid.set(nix::unistd::geteuid().as_raw());
        self.calling_pid.set(std::process::id() as i32);
        token
    }

    pub fn restore_calling_identity(&self, token: i64) {
        self.calling_uid.set((token >> 32) as u32);
        self.calling_pid.set(token as i32);
    }

    pub fn set_call_restriction(&self, restriction: CallRestriction) { self.call_restriction.set(restriction); }
    pub fn call_restriction(&self) -> CallRestriction { self.call_restriction.get() }

    pub fn is_looper(&self) -> bool { self.is_looper.get() }
    pub fn is_polling(&self) -> bool { self.is_polling.get() }

    /// Runs `task` after the command being executed returns.
    pub fn add_post_command_task(&self, task: impl FnOnce() + 'static) {
        self.post_command.borrow_mut().push(Box::new(task));
    }

    // ---- command writers ----

    fn write_command(&self, cmd: u32, payload: &[u8]) {
        log::trace!("queue {}", bc::name(cmd));
        let mut out = self.output.borrow_mut();
        if let Err(e) = out.write_u32(cmd).and_then(|()| out.write(payload)) {
            log::error!("cannot queue {}: {e}", bc::name(cmd));
        }
    }

    /// `BC_ACQUIRE`; `keep` is released once the driver has taken the command.
    pub fn inc_strong_handle(&self, handle: u32, keep: Sp<RemoteProxy>) {
        self.write_command(bc::ACQUIRE, &handle.to_ne_bytes());
        self.post_write_strong.borrow_mut().push(Binder::Remote(keep));
    }

    pub fn dec_strong_handle(&self, handle: u32) { self.write_command(bc::RELEASE, &handle.to_ne_bytes()); }

    pub fn inc_weak_handle(&self, handle: u32, keep: Wp<RemoteProxy>) {
        self.write_command(bc::INCREFS, &handle.to_ne_bytes());
        self.post_write_weak.borrow_mut().push(WeakBinder::Remote(keep));
    }

    pub fn dec_weak_handle(&self, handle: u32) { self.write_command(bc::DECREFS, &handle.to_ne_bytes()); }

    /// Not supported by the driver.
    pub fn attempt_inc_strong_handle(&self, handle: u32) -> Result<()> {
        Err(BinderError::new(StatusCode::InvalidOperation).ctx(format_args!("attempt acquire of handle {handle}")))
    }

    pub fn request_death_notification(&self, handle: u32, cookie: u64) {
        let mut payload = [0u8; 12];
        payload[..4].copy_from_slice(&handle.to_ne_bytes());
        payload[4..].copy_from_slice(&cookie.to_ne_bytes());
        self.write_command(bc::REQUEST_DEATH_NOTIFICATION, &payload);
    }

    pub fn clear_death_notification(&self, handle: u32, cookie: u64) {
        let mut payload = [0u8; 12];
        payload[..4].copy_from_slice(&handle.to_ne_bytes());
        payload[4..].copy_from_slice(&cookie.to_ne_bytes());
        self.write_command(bc::CLEAR_DEATH_NOTIFICATION, &payload);
    }

    /// Returns a received buffer to the driver.
    pub fn free_buffer(&self, addr: u64) {
        log::trace!("free buffer {addr:#x}");
        self.write_command(bc::FREE_BUFFER, &addr.to_ne_bytes());
    }

    fn write_transaction_data(
        &self,
        cmd: u32,
        flags: TransactionFlags,
        handle: u32,
        code: u32,
        payload: Payload<'_>,
    ) -> Result<()> {
        let tr = TransactionData {
            code,
            flags,
            data_size: payload.data.len() as u64,
            offsets_size: (payload.offsets.len() * 8) as u64,
            data_buffer: payload.data.as_ptr() as u64,
            data_offsets: payload.offsets.as_ptr() as u64,
            ..TransactionData::to_handle(handle)
        };
        let sg = TransactionDataSg { tr, buffers_size: payload.buffers_size as u64 };
        let mut out = self.output.borrow_mut();
        out.write_u32(cmd)?;
        out.write(&sg.encode())
    }

    /// Publishes local objects carried by `parcel` and keeps them alive until written.
    fn publish_held(&self, parcel: &Parcel) {
        for local in parcel.held_locals() {
            self.process.publish_local(local);
            self.post_write_strong.borrow_mut().push(Binder::Local(local.clone()));
        }
    }

    // ---- driver round trips ----

    /// One `BINDER_WRITE_READ`. Reads only once `input` is drained.
    pub(crate) fn talk_with_driver(&self, do_receive: bool) -> Result<()> {
        let mut input = self.input.borrow_mut();
        let mut output = self.output.borrow_mut();
        let need_read = input.data_position() >= input.data_size();
        let out_avail = if !do_receive || need_read { output.data_size() } else { 0 };
        let read_cap = if do_receive && need_read { IN_CAPACITY } else { 0 };
        if out_avail == 0 && read_cap == 0 {
            return Ok(());
        }

        let result = {
            let read_buf: &mut [u8] = if read_cap > 0 { input.receive_window(read_cap)? } else { &mut [] };
            let write_buf = &output.data()[..out_avail];
            log::trace!("write_read: {out_avail} out, {read_cap} in");
            loop {
                match self.driver.write_read(write_buf, &mut *read_buf) {
                    Err(Errno::EINTR) => continue,
                    other => break other,
                }
            }
        };
        if read_cap > 0 {
            let got = result.as_ref().map_or(0, |t| t.read_consumed);
            input.set_data_size(got)?;
            input.set_data_position(0);
        }
        let transfer = result.map_err(|e| BinderError::errno(e).ctx("BINDER_WRITE_READ"))?;

        if transfer.write_consumed > 0 {
            if transfer.write_consumed < output.data_size() {
                fatal!(
                    "driver consumed {} of {} command bytes",
                    transfer.write_consumed,
                    output.data_size()
                );
            }
            output.set_data_size(0)?;
            output.set_data_position(0);
            drop(output);
            drop(input);
            self.process_post_write_derefs();
        }
        Ok(())
    }

    fn process_post_write_derefs(&self) {
        let weak = std::mem::take(&mut *self.post_write_weak.borrow_mut());
        drop(weak);
        let strong = std::mem::take(&mut *self.post_write_strong.borrow_mut());
        drop(strong);
    }

    /// Pushes queued commands to the driver without waiting for anything.
    pub fn flush_commands(&self) {
        if let Err(e) = self.talk_with_driver(false) {
            log::debug!("flush_commands: {e}");
        }
        if self.output.borrow().data_size() > 0 {
            if let Err(e) = self.talk_with_driver(false) {
                log::debug!("flush_commands retry: {e}");
            }
        }
        let left = self.output.borrow().data_size();
        if left > 0 {
            log::warn!("flush_commands: {left} bytes still queued");
        }
    }

    fn read_in<T>(&self, f: impl FnOnce(&Parcel) -> Result<T>) -> Result<T> {
        let input = self.input.borrow();
        f(&input)
    }

    fn read_transaction(&self) -> Result<TransactionData> {
        self.read_in(|input| TransactionData::decode(&mut WireReader::new(input.read_inplace(TRANSACTION_DATA_SIZE)?)))
    }

    fn read_ptr_cookie(&self) -> Result<PtrCookie> {
        self.read_in(|input| PtrCookie::decode(&mut WireReader::new(input.read_inplace(16)?)))
    }

    /// Hands a received buffer to `parcel`; it goes back to the driver when `parcel` lets go.
    fn adopt_buffer(&self, parcel: &mut Parcel, tr: &TransactionData) -> Result<()> {
        let region = self
            .driver
            .region()
            .ok_or_else(|| BinderError::new(StatusCode::NoInit).ctx("driver has no payload region"))?;
        let offsets = match tr.offsets_size {
            0 => Vec::new(),
            len => region
                .slice(tr.data_offsets, len as usize)?
                .chunks_exact(8)
                .map(|c| u64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        };
        parcel.bind_process(&self.process);
        let process = self.process.clone();
        let release = Box::new(move |addr: u64| {
            if ThreadState::with_current(&process, |t| t.free_buffer(addr)).is_none() {
                log::warn!("buffer {addr:#x} not returned: engine gone");
            }
        });
        parcel.set_data_reference(region, tr.data_buffer, tr.data_size as usize, offsets, release)
    }

    fn read_status(&self, tr: &TransactionData) -> Result<i32> {
        let region = self.driver.region().ok_or_else(|| BinderError::new(StatusCode::NoInit))?;
        let bytes = region.slice(tr.data_buffer, 4)?;
        Ok(i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    // ---- client side ----

    /// Sends a transaction to `handle` and, unless one-way, waits for its reply.
    pub fn transact(
        &self,
        handle: u32,
        code: u32,
        data: &Parcel,
        reply: Option<&mut Parcel>,
        flags: TransactionFlags,
    ) -> Result<()> {
        let flags = flags | TransactionFlags::ACCEPT_FDS;
        log::debug!("transact handle={handle} code={code} flags={:#x} size={}", flags.bits(), data.data_size());
        let written = data.error_check().and_then(|()| data.check_buffers()).and_then(|()| {
            self.publish_held(data);
            self.write_transaction_data(bc::TRANSACTION_SG, flags, handle, code, Payload::of(data))
        });
        if let Err(e) = written {
            if let Some(reply) = reply {
                reply.set_error(Some(e.code));
            }
            return Err(e);
        }

        if flags.contains(TransactionFlags::ONE_WAY) {
            return self.wait_for_response(None);
        }
        match self.call_restriction.get() {
            CallRestriction::None => {}
            CallRestriction::ErrorIfNotOneway => {
                log::error!("two-way call to handle {handle} code {code} from a restricted thread");
            }
            CallRestriction::FatalIfNotOneway => {
                fatal!("two-way call to handle {handle} code {code} from a restricted thread");
            }
        }
        match reply {
            Some(reply) => self.wait_for_response(Some(reply)),
            None => {
                let mut scratch = Parcel::for_process(&self.process);
                self.wait_for_response(Some(&mut scratch))
            }
        }
    }

    fn wait_for_response(&self, mut reply: Option<&mut Parcel>) -> Result<()> {
        let result = self.await_reply(reply.as_deref_mut());
        if let (Err(e), Some(reply)) = (&result, reply) {
            reply.set_error(Some(e.code));
        }
        result
    }

    fn await_reply(&self, mut reply: Option<&mut Parcel>) -> Result<()> {
        loop {
            self.talk_with_driver(true)?;
            let cmd = {
                let input = self.input.borrow();
                input.error_check()?;
                if input.data_avail() == 0 {
                    continue;
                }
                input.read_u32()?
            };
            log::trace!("wait: {}", br::name(cmd));
            match cmd {
                br::ONEWAY_SPAM_SUSPECT | br::TRANSACTION_COMPLETE => {
                    if cmd == br::ONEWAY_SPAM_SUSPECT {
                        log::error!("process is sending too many one-way calls; driver flagged spam");
                    }
                    if reply.is_none() {
                        return Ok(());
                    }
                }
                br::DEAD_REPLY => return Err(BinderError::new(StatusCode::DeadObject)),
                br::FAILED_REPLY => return Err(BinderError::new(StatusCode::FailedTransaction)),
                br::FROZEN_REPLY => {
                    return Err(BinderError::new(StatusCode::FailedTransaction).ctx("target process is frozen"));
                }
                br::ACQUIRE_RESULT => {
                    let result = self.read_in(Parcel::read_i32)?;
                    log::warn!("unexpected BR_ACQUIRE_RESULT {result}");
                }
                br::REPLY => {
                    let tr = self.read_transaction()?;
                    let Some(reply) = reply.as_deref_mut() else {
                        self.free_buffer(tr.data_buffer);
                        continue;
                    };
                    if !tr.flags.contains(TransactionFlags::STATUS_CODE) {
                        if let Err(e) = self.adopt_buffer(reply, &tr) {
                            self.free_buffer(tr.data_buffer);
                            return Err(e);
                        }
                        return Ok(());
                    }
                    let status = self.read_status(&tr);
                    self.free_buffer(tr.data_buffer);
                    return match BinderError::from_status(status?) {
                        None => Ok(()),
                        Some(e) => Err(e),
                    };
                }
                other => self.execute_command(other)?,
            }
        }
    }

    // ---- server side ----

    fn send_reply(&self, reply: &Parcel, flags: TransactionFlags) -> Result<()> {
        let flags = flags & TransactionFlags::CLEAR_BUF;
        let status;
        let error = reply.error().or_else(|| reply.check_buffers().err().map(|e| e.code));
        match error {
            None => {
                self.publish_held(reply);
                self.write_transaction_data(bc::REPLY_SG, flags, u32::MAX, 0, Payload::of(reply))?;
            }
            Some(code) => {
                status = code.status().to_ne_bytes();
                let payload = Payload { data: &status, offsets: &[], buffers_size: 0 };
                self.write_transaction_data(bc::REPLY_SG, flags | TransactionFlags::STATUS_CODE, u32::MAX, 0, payload)?;
            }
        }
        self.wait_for_response(None)
    }

    fn local_for(&self, pc: &PtrCookie, cmd: u32) -> Arc<LocalObject> {
        match self.process.lookup_local(pc.ptr, pc.cookie) {
            Some(obj) => obj,
            None => fatal!("{} for unknown node {:#x}/{:#x}", br::name(cmd), pc.ptr, pc.cookie),
        }
    }

    fn execute_command(&self, cmd: u32) -> Result<()> {
        log::trace!("execute {}", br::name(cmd));
        match cmd {
            br::ERROR => {
                let status = self.read_in(Parcel::read_i32)?;
                return match BinderError::from_status(status) {
                    None => Ok(()),
                    Some(e) => Err(e),
                };
            }
            br::OK | br::NOOP => {}
            br::ACQUIRE => {
                let pc = self.read_ptr_cookie()?;
                let obj = self.local_for(&pc, cmd);
                LocalObject::kernel_inc_strong(&obj);
                self.write_command(bc::ACQUIRE_DONE, &pc.encode());
            }
            br::RELEASE => {
                let pc = self.read_ptr_cookie()?;
                let obj = self.local_for(&pc, cmd);
                self.pending_strong.borrow_mut().push(obj);
            }
            br::INCREFS => {
                let pc = self.read_ptr_cookie()?;
                let obj = self.local_for(&pc, cmd);
                LocalObject::kernel_inc_weak(&obj);
                self.write_command(bc::INCREFS_DONE, &pc.encode());
            }
            br::DECREFS => {
                let pc = self.read_ptr_cookie()?;
                let obj = self.local_for(&pc, cmd);
                self.pending_weak.borrow_mut().push(obj);
            }
            br::ATTEMPT_ACQUIRE => {
                let (_priority, pc) = self.read_in(|input| {
                    let mut r = WireReader::new(input.read_inplace(24)?);
                    let priority = r.i32()?;
                    let _pad = r.u32()?;
                    Ok((priority, PtrCookie { ptr: r.u64()?, cookie: r.u64()? }))
                })?;
                let acquired = self
                    .process
                    .lookup_local(pc.ptr, pc.cookie)
                    .is_some_and(|obj| LocalObject::kernel_attempt_inc_strong(&obj));
                self.write_command(bc::ACQUIRE_RESULT, &(acquired as i32).to_ne_bytes());
            }
            br::TRANSACTION | br::TRANSACTION_SEC_CTX => {
                let tr = self.read_transaction()?;
                let sid = if cmd == br::TRANSACTION_SEC_CTX { self.read_in(Parcel::read_u64)? } else { 0 };
                self.dispatch(tr, sid);
            }
            br::DEAD_BINDER => {
                let cookie = self.read_in(Parcel::read_u64)?;
                match self.process.death_proxy(cookie) {
                    Some(proxy) => proxy.send_obituary(),
                    None => log::warn!("BR_DEAD_BINDER for unknown cookie {cookie:#x}"),
                }
                self.write_command(bc::DEAD_BINDER_DONE, &cookie.to_ne_bytes());
            }
            br::CLEAR_DEATH_NOTIFICATION_DONE => {
                let cookie = self.read_in(Parcel::read_u64)?;
                self.process.unregister_death(cookie);
            }
            br::FINISHED => return Err(BinderError::new(StatusCode::TimedOut)),
            br::SPAWN_LOOPER => self.process.spawn_pooled_thread(false),
            other => {
                log::error!("bad command {other:#x} from driver");
                return Err(BinderError::new(StatusCode::UnknownError).ctx(format_args!("command {other:#x}")));
            }
        }
        Ok(())
    }

    /// Runs one inbound transaction against its target and sends the reply.
    fn dispatch(&self, tr: TransactionData, sid: u64) {
        let mut buffer = Parcel::for_process(&self.process);
        if let Err(e) = self.adopt_buffer(&mut buffer, &tr) {
            log::warn!("rejected inbound transaction: {e}");
            self.free_buffer(tr.data_buffer);
            if !tr.flags.contains(TransactionFlags::ONE_WAY) {
                let mut reply = Parcel::for_process(&self.process);
                reply.set_error(Some(e.code));
                if let Err(e) = self.send_reply(&reply, tr.flags) {
                    log::error!("failed to send error reply: {e}");
                }
            }
            return;
        }

        let saved = (self.calling_pid.get(), self.calling_uid.get(), self.calling_sid.get(), self.last_flags.get());
        self.calling_pid.set(tr.sender_pid);
        self.calling_uid.set(tr.sender_euid);
        self.calling_sid.set(sid);
        self.last_flags.set(tr.flags);

        let one_way = tr.flags.contains(TransactionFlags::ONE_WAY);
        let mut reply = Parcel::for_process(&self.process);
        let mut reply_sent = false;
        let target = if tr.ptr() != 0 {
            self.process.lookup_local(tr.ptr(), tr.cookie).and_then(|o| LocalObject::promote(&o))
        } else {
            self.process.served_context_object()
        };
        let result = match &target {
            Some(target) => {
                let mut send = |r: &mut Parcel| {
                    if reply_sent {
                        log::error!("dropping reply: one was already sent");
                        return;
                    }
                    reply_sent = true;
                    if one_way {
                        log::error!("not sending reply to one-way transaction code {}", tr.code);
                        return;
                    }
                    r.set_error(None);
                    if let Err(e) = self.send_reply(r, tr.flags) {
                        log::error!("failed to send reply: {e}");
                    }
                };
                target.transact(tr.code, &buffer, &mut reply, tr.flags, &mut send)
            }
            None => Err(BinderError::new(StatusCode::UnknownTransaction)
                .ctx(format_args!("no target for {:#x}/{:#x}", tr.ptr(), tr.cookie))),
        };
        drop(target);

        if !one_way {
            if !reply_sent {
                reply.set_error(result.as_ref().err().map(|e| e.code));
                if let Err(e) = self.send_reply(&reply, tr.flags) {
                    log::error!("failed to send reply: {e}");
                }
            } else if let Err(e) = &result {
                log::error!("transaction code {} failed after its reply was sent: {e}", tr.code);
            }
        } else if let Err(e) = &result {
            log::debug!("one-way transaction code {} failed: {e}", tr.code);
        }

        let (pid, uid, sid, flags) = saved;
        self.calling_pid.set(pid);
        self.calling_uid.set(uid);
        self.calling_sid.set(sid);
        self.last_flags.set(flags);
        drop(reply);
        drop(buffer);
    }

    /// Drops deferred node references once the input buffer is fully consumed.
    ///
    /// Weak decrements go first; strong ones one at a time, since each may queue
    /// more weak work.
    pub fn process_pending_derefs(&self) {
        {
            let input = self.input.borrow();
            if input.data_position() < input.data_size() {
                return;
            }
        }
        loop {
            loop {
                let weak = std::mem::take(&mut *self.pending_weak.borrow_mut());
                if weak.is_empty() {
                    break;
                }
                for obj in weak {
                    obj.kernel_dec_weak();
                }
            }
            let Some(obj) = ({
                let mut pending = self.pending_strong.borrow_mut();
                (!pending.is_empty()).then(|| pending.remove(0))
            }) else {
                return;
            };
            obj.kernel_dec_strong();
        }
    }

    fn process_post_command_tasks(&self) {
        let tasks = std::mem::take(&mut *self.post_command.borrow_mut());
        for task in tasks {
            task();
        }
    }

    fn get_and_execute_command(&self) -> Result<()> {
        self.talk_with_driver(true)?;
        let cmd = {
            let input = self.input.borrow();
            if input.data_avail() < 4 {
                return Ok(());
            }
            input.read_u32()?
        };
        self.process.executing_thread_begin();
        let result = self.execute_command(cmd);
        self.process.executing_thread_end();
        self.process_post_command_tasks();
        result
    }

    /// Serves inbound transactions until the driver goes away or, for helper
    /// threads, the pool times out.
    pub fn join_thread_pool(&self, is_main: bool) {
        log::debug!("thread {:?} joining pool (main={is_main})", std::thread::current().name());
        self.write_command(if is_main { bc::ENTER_LOOPER } else { bc::REGISTER_LOOPER }, &[]);
        self.is_looper.set(true);
        loop {
            self.process_pending_derefs();
            match self.get_and_execute_command() {
                Ok(()) => {}
                Err(e) if e.is(StatusCode::TimedOut) => {
                    if !is_main {
                        break;
                    }
                }
                Err(e) if matches!(e.os_errno(), Some(Errno::ECONNREFUSED | Errno::EBADF)) => break,
                Err(e) => fatal!("pool thread got unexpected error: {e}"),
            }
        }
        log::debug!("thread {:?} leaving pool", std::thread::current().name());
        self.write_command(bc::EXIT_LOOPER, &[]);
        self.is_looper.set(false);
        if let Err(e) = self.talk_with_driver(false) {
            log::debug!("exit looper: {e}");
        }
    }

    /// Switches this thread to caller-driven polling and returns the fd to poll.
    pub fn setup_polling(&self) -> Result<std::os::fd::RawFd> {
        let fd = self
            .driver
            .poll_fd()
            .ok_or_else(|| BinderError::errno(Errno::EBADF).ctx("driver cannot be polled"))?;
        self.process.set_thread_pool_configuration(1, true)?;
        self.is_polling.set(true);
        self.write_command(bc::ENTER_LOOPER, &[]);
        self.flush_commands();
        Ok(fd)
    }

    /// Executes everything the driver has queued after the polled fd became readable.
    pub fn handle_polled_commands(&self) -> Result<()> {
        let mut result;
        loop {
            result = self.get_and_execute_command();
            let input = self.input.borrow();
            if input.data_position() >= input.data_size() {
                break;
            }
        }
        self.process_pending_derefs();
        self.flush_commands();
        result
    }
}

impl Drop for ThreadState {
    fn drop(&mut self) {
        self.flush_commands();
        if let Err(e) = self.driver.thread_exit() {
            log::debug!("BINDER_THREAD_EXIT failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProcessConfig;
    use crate::testing::{ScriptedDriver, Stream};

    fn engine() -> (Arc<ScriptedDriver>, Arc<ProcessState>) {
        let driver = Arc::new(ScriptedDriver::new());
        let process = ProcessState::with_driver(driver.clone(), ProcessConfig::default()).expect("gateway");
        (driver, process)
    }

    fn commands(bytes: &[u8]) -> Vec<u32> {
        let mut r = WireReader::new(bytes);
        let mut out = Vec::new();
        while r.remaining() >= 4 {
            let cmd = r.u32().unwrap();
            let skip = match cmd {
                bc::TRANSACTION_SG | bc::REPLY_SG => 72,
                bc::FREE_BUFFER | bc::DEAD_BINDER_DONE => 8,
                bc::INCREFS | bc::ACQUIRE | bc::RELEASE | bc::DECREFS | bc::ACQUIRE_RESULT => 4,
                bc::INCREFS_DONE | bc::ACQUIRE_DONE => 16,
                bc::REQUEST_DEATH_NOTIFICATION | bc::CLEAR_DEATH_NOTIFICATION => 12,
                _ => 0,
            };
            r.bytes(skip).unwrap();
            out.push(cmd);
        }
        out
    }

    #[test]
    fn one_way_returns_on_transaction_complete() {
        let (driver, process) = engine();
        driver.push(Stream::new().cmd(br::NOOP).cmd(br::TRANSACTION_COMPLETE));
        let t = ThreadState::current(&process).unwrap();
        let mut data = Parcel::new();
        data.write_i32(7).unwrap();
        t.transact(3, 9, &data, None, TransactionFlags::ONE_WAY).expect("one-way");
        let writes = driver.written();
        assert_eq!(commands(&writes), vec![bc::TRANSACTION_SG]);
        let mut r = WireReader::new(&writes[4..]);
        let sg = TransactionDataSg::decode(&mut r).unwrap();
        assert_eq!(sg.tr.handle(), 3);
        assert_eq!(sg.tr.code, 9);
        assert!(sg.tr.flags.contains(TransactionFlags::ONE_WAY | TransactionFlags::ACCEPT_FDS));
        assert_eq!(sg.tr.data_size, 4);
        ThreadState::detach(&process);
    }

    #[test]
    fn dead_and_failed_replies_surface_as_status() {
        let (driver, process) = engine();
        let t = ThreadState::current(&process).unwrap();
        driver.push(Stream::new().cmd(br::TRANSACTION_COMPLETE).cmd(br::DEAD_REPLY));
        let mut reply = Parcel::new();
        let err = t.transact(1, 1, &Parcel::new(), Some(&mut reply), TransactionFlags::empty()).unwrap_err();
        assert!(err.is(StatusCode::DeadObject));
        assert_eq!(reply.error(), Some(StatusCode::DeadObject));

        driver.push(Stream::new().cmd(br::TRANSACTION_COMPLETE).cmd(br::FROZEN_REPLY));
        let err = t.transact(1, 1, &Parcel::new(), None, TransactionFlags::empty()).unwrap_err();
        assert!(err.is(StatusCode::FailedTransaction));
        ThreadState::detach(&process);
    }

    #[test]
    fn reply_is_adopted_and_freed_on_drop() {
        let (driver, process) = engine();
        let t = ThreadState::current(&process).unwrap();
        let addr = driver.stage(&43i32.to_ne_bytes());
        driver.push(Stream::new().cmd(br::TRANSACTION_COMPLETE).reply(addr, 4, TransactionFlags::empty()));
        let mut reply = Parcel::new();
        t.transact(5, 1, &Parcel::new(), Some(&mut reply), TransactionFlags::empty()).expect("reply");
        assert!(reply.is_borrowed());
        assert_eq!(reply.read_i32().unwrap(), 43);
        drop(reply);
        t.flush_commands();
        let cmds = commands(&driver.written());
        assert_eq!(cmds.last(), Some(&bc::FREE_BUFFER));
        ThreadState::detach(&process);
    }

    #[test]
    fn status_code_reply_becomes_error() {
        let (driver, process) = engine();
        let t = ThreadState::current(&process).unwrap();
        let addr = driver.stage(&StatusCode::PermissionDenied.status().to_ne_bytes());
        driver.push(Stream::new().cmd(br::TRANSACTION_COMPLETE).reply(addr, 4, TransactionFlags::STATUS_CODE));
        let mut reply = Parcel::new();
        let err = t.transact(5, 1, &Parcel::new(), Some(&mut reply), TransactionFlags::empty()).unwrap_err();
        assert!(err.is(StatusCode::PermissionDenied));
        assert!(!reply.is_borrowed());
        ThreadState::detach(&process);
    }

    #[test]
    fn interrupted_ioctl_is_retried() {
        let (driver, process) = engine();
        let t = ThreadState::current(&process).unwrap();
        driver.fail_next(Errno::EINTR);
        driver.push(Stream::new().cmd(br::TRANSACTION_COMPLETE));
        t.transact(2, 2, &Parcel::new(), None, TransactionFlags::ONE_WAY).expect("retried after EINTR");
        ThreadState::detach(&process);
    }

    #[test]
    fn inbound_transaction_dispatches_and_replies() {
        let (driver, process) = engine();
        let obj = LocalObject::new(|code: u32, data: &Parcel, reply: &mut Parcel, _f: TransactionFlags| {
            assert_eq!(code, 1);
            reply.write_i32(data.read_i32()? + 1)
        });
        process.publish_local(&obj);
        let t = ThreadState::current(&process).unwrap();
        let addr = driver.stage(&41i32.to_ne_bytes());
        driver.push(Stream::new().transaction(obj.token(), obj.cookie(), 1, addr, 4, TransactionFlags::empty()));
        driver.push(Stream::new().cmd(br::TRANSACTION_COMPLETE));
        t.get_and_execute_command().expect("execute");
        let writes = driver.written();
        assert_eq!(commands(&writes), vec![bc::REPLY_SG]);
        let sg = TransactionDataSg::decode(&mut WireReader::new(&writes[4..])).unwrap();
        assert_eq!(sg.tr.handle(), u32::MAX);
        assert_eq!(sg.tr.data_size, 4);
        t.flush_commands();
        assert_eq!(commands(&driver.written()), vec![bc::FREE_BUFFER]);
        assert_eq!(t.calling_pid(), std::process::id() as i32);
        ThreadState::detach(&process);
    }

    #[test]
    fn unknown_target_gets_status_reply() {
        let (driver, process) = engine();
        let t = ThreadState::current(&process).unwrap();
        let addr = driver.stage(&[0u8; 4]);
        driver.push(Stream::new().transaction(0xdead_0000, 0xbeef_0000, 1, addr, 4, TransactionFlags::empty()));
        driver.push(Stream::new().cmd(br::TRANSACTION_COMPLETE));
        t.get_and_execute_command().expect("execute");
        let writes = driver.written();
        let sg = TransactionDataSg::decode(&mut WireReader::new(&writes[4..])).unwrap();
        assert!(sg.tr.flags.contains(TransactionFlags::STATUS_CODE));
        assert_eq!(sg.tr.data_size, 4);
        ThreadState::detach(&process);
    }

    #[test]
    fn release_is_deferred_until_input_drains() {
        let (driver, process) = engine();
        let obj = LocalObject::new(|_: u32, _: &Parcel, _: &mut Parcel, _: TransactionFlags| Ok(()));
        process.publish_local(&obj);
        let pc = PtrCookie { ptr: obj.token(), cookie: obj.cookie() };
        let t = ThreadState::current(&process).unwrap();
        driver.push(
            Stream::new()
                .ptr_cookie(br::INCREFS, pc)
                .ptr_cookie(br::ACQUIRE, pc)
                .ptr_cookie(br::RELEASE, pc)
                .ptr_cookie(br::DECREFS, pc),
        );
        for _ in 0..3 {
            t.get_and_execute_command().expect("execute");
            t.process_pending_derefs();
        }
        assert_eq!(obj.remote_state(), crate::binder::RemoteState::SentRemote { strong: 1, weak: 1 });
        t.get_and_execute_command().expect("decrefs");
        t.process_pending_derefs();
        assert_eq!(obj.remote_state(), crate::binder::RemoteState::LocalOnly);
        assert_eq!(obj.strong_count(), 1);
        t.flush_commands();
        assert_eq!(commands(&driver.written()), vec![bc::INCREFS_DONE, bc::ACQUIRE_DONE]);
        ThreadState::detach(&process);
    }

    #[test]
    fn deferred_derefs_for_several_nodes_drain_in_one_pass() {
        let (driver, process) = engine();
        let objs: Vec<_> = (0..2)
            .map(|_| LocalObject::new(|_: u32, _: &Parcel, _: &mut Parcel, _: TransactionFlags| Ok(())))
            .collect();
        let t = ThreadState::current(&process).unwrap();
        let mut acquire = Stream::new();
        let mut release = Stream::new();
        for obj in &objs {
            process.publish_local(obj);
            let pc = PtrCookie { ptr: obj.token(), cookie: obj.cookie() };
            acquire = acquire.ptr_cookie(br::INCREFS, pc).ptr_cookie(br::ACQUIRE, pc);
            release = release.ptr_cookie(br::RELEASE, pc).ptr_cookie(br::DECREFS, pc);
        }
        driver.push(acquire);
        for _ in 0..4 {
            t.get_and_execute_command().expect("acquire");
        }
        driver.push(release);
        for _ in 0..4 {
            t.get_and_execute_command().expect("release");
        }
        assert_eq!(t.pending_strong.borrow().len(), 2);
        assert_eq!(t.pending_weak.borrow().len(), 2);

        t.process_pending_derefs();
        assert!(t.pending_strong.borrow().is_empty());
        assert!(t.pending_weak.borrow().is_empty());
        for obj in &objs {
            assert_eq!(obj.remote_state(), crate::binder::RemoteState::LocalOnly);
            assert_eq!(obj.strong_count(), 1);
        }
        ThreadState::detach(&process);
    }

    #[test]
    fn post_command_tasks_run_after_the_command() {
        let (driver, process) = engine();
        let t = ThreadState::current(&process).unwrap();
        let ran = Rc::new(Cell::new(0));
        let seen = ran.clone();
        t.add_post_command_task(move || seen.set(seen.get() + 1));
        driver.push(Stream::new().cmd(br::NOOP));
        t.get_and_execute_command().expect("noop");
        assert_eq!(ran.get(), 1);
        ThreadState::detach(&process);
    }

    #[test]
    fn pool_loop_exits_on_finished_for_helpers() {
        let (driver, process) = engine();
        let t = ThreadState::current(&process).unwrap();
        driver.push(Stream::new().cmd(br::NOOP).cmd(br::FINISHED));
        t.join_thread_pool(false);
        let cmds = commands(&driver.written());
        assert_eq!(cmds.first(), Some(&bc::REGISTER_LOOPER));
        assert_eq!(cmds.last(), Some(&bc::EXIT_LOOPER));
        assert!(!t.is_looper());
        ThreadState::detach(&process);
    }

    #[test]
    fn pool_loop_exits_when_driver_closes() {
        let (driver, process) = engine();
        let t = ThreadState::current(&process).unwrap();
        driver.fail_next(Errno::EBADF);
        t.join_thread_pool(true);
        assert_eq!(commands(&driver.written()).first(), Some(&bc::ENTER_LOOPER));
        ThreadState::detach(&process);
    }

    #[test]
    fn identity_token_round_trips() {
        let (_driver, process) = engine();
        let t = ThreadState::current(&process).unwrap();
        t.calling_pid.set(1234);
        t.calling_uid.set(1000);
        let token = t.clear_calling_identity();
        assert_eq!(t.calling_pid(), std::process::id() as i32);
        t.restore_calling_identity(token);
        assert_eq!((t.calling_pid(), t.calling_uid()), (1234, 1000));
        ThreadState::detach(&process);
    }

    #[test]
    fn death_requests_carry_handle_and_cookie() {
        let (driver, process) = engine();
        let t = ThreadState::current(&process).unwrap();
        t.request_death_notification(4, 0xabcd);
        t.flush_commands();
        let writes = driver.written();
        let mut r = WireReader::new(&writes);
        assert_eq!(r.u32().unwrap(), bc::REQUEST_DEATH_NOTIFICATION);
        assert_eq!(r.u32().unwrap(), 4);
        assert_eq!(r.u64().unwrap(), 0xabcd);
        assert!(t.attempt_inc_strong_handle(4).unwrap_err().is(StatusCode::InvalidOperation));
        ThreadState::detach(&process);
    }

    #[test]
    fn polling_requires_a_pollable_driver() {
        let (driver, process) = engine();
        let t = ThreadState::current(&process).unwrap();
        assert!(t.setup_polling().is_err());
        driver.set_poll_fd(9);
        assert_eq!(t.setup_polling().expect("pollable"), 9);
        assert_eq!(commands(&driver.written()), vec![bc::ENTER_LOOPER]);
        driver.push(Stream::new().cmd(br::NOOP).cmd(br::NOOP));
        t.handle_polled_commands().expect("drain");
        ThreadState::detach(&process);
    }
}
