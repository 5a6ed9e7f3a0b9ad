//! Endpoints: the local object a service exposes and the proxy standing in for a
//! remote one.
//!
//! Both are counted with [`Sp`]/[`Wp`]. A [`RemoteProxy`] turns its first strong
//! reference, its last strong reference and its last weak reference into
//! `BC_ACQUIRE`, `BC_RELEASE` and `BC_DECREFS` for its handle. A [`LocalObject`]
//! keeps the references the driver holds on it as guards of its own, so it lives
//! while another process does.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::abi::{
    FLAT_BINDER_FLAG_ACCEPTS_FDS, FLAT_BINDER_FLAG_INHERIT_RT, FLAT_BINDER_FLAG_PRIORITY_MASK,
    FLAT_BINDER_FLAG_SCHED_POLICY_SHIFT, FLAT_BINDER_FLAG_TXN_SECURITY_CTX, pack_chars,
};
use crate::process::ProcessState;
use crate::refs::{Lifetime, RefCounted, RefCounts, Sp, Wp};
use crate::thread::ThreadState;
use crate::{BinderError, DeathRecipient, Dispatch, Parcel, Result, StatusCode, TransactionFlags, lock};

/// Liveness check answered by every local object without reaching its dispatcher.
pub const PING_TRANSACTION: u32 = pack_chars(0x0f, b'P', b'N', b'G');

/// References the driver holds on a local object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    LocalOnly,
    SentRemote { strong: usize, weak: usize },
}

#[derive(Default)]
struct KernelRefs {
    strong: Vec<Sp<LocalObject>>,
    weak: Vec<Wp<LocalObject>>,
}

/// Scheduling hints published with the object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedPolicy {
    pub policy: u8,
    pub priority: u8,
    pub inherit_rt: bool,
}

pub struct LocalObject {
    refs: RefCounts,
    dispatch: Box<dyn Dispatch>,
    sched: SchedPolicy,
    request_sid: AtomicBool,
    owner: OnceLock<Weak<ProcessState>>,
    kernel: Mutex<KernelRefs>,
}

impl fmt::Debug for LocalObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalObject").field("token", &format_args!("{:#x}", self.token())).field("refs", &self.refs).finish()
    }
}

impl RefCounted for LocalObject {
    fn refs(&self) -> &RefCounts { &self.refs }

    fn on_last_weak_ref(&self) {
        if let Some(process) = self.owner.get().and_then(Weak::upgrade) {
            process.forget_local(self.token(), self.cookie());
        }
    }
}

impl LocalObject {
    pub fn new(dispatch: impl Dispatch + 'static) -> Sp<Self> {
        Self::with_sched(dispatch, SchedPolicy::default())
    }

    pub fn with_sched(dispatch: impl Dispatch + 'static, sched: SchedPolicy) -> Sp<Self> {
        Sp::new(Arc::new(Self {
            refs: RefCounts::new(Lifetime::Strong),
            dispatch: Box::new(dispatch),
            sched,
            request_sid: AtomicBool::new(false),
            owner: OnceLock::new(),
            kernel: Mutex::new(KernelRefs::default()),
        }))
    }

    /// The driver-visible pointer: address of the reference counts.
    pub fn token(&self) -> u64 { &self.refs as *const RefCounts as u64 }

    /// The driver-visible cookie: address of the object.
    pub fn cookie(&self) -> u64 { self as *const Self as u64 }

    /// Ask for the caller's security context with every transaction.
    pub fn set_request_sid(&self, on: bool) { self.request_sid.store(on, Ordering::Relaxed); }

    pub(crate) fn flat_flags(&self) -> u32 {
        let mut flags = (self.sched.priority as u32 & FLAT_BINDER_FLAG_PRIORITY_MASK) | FLAT_BINDER_FLAG_ACCEPTS_FDS;
        if self.sched.inherit_rt {
            flags |= FLAT_BINDER_FLAG_INHERIT_RT;
        }
        flags |= ((self.sched.policy as u32) & 3) << FLAT_BINDER_FLAG_SCHED_POLICY_SHIFT;
        if self.request_sid.load(Ordering::Relaxed) {
            flags |= FLAT_BINDER_FLAG_TXN_SECURITY_CTX;
        }
        flags
    }

    pub(crate) fn promote(obj: &Arc<Self>) -> Option<Sp<Self>> { Wp::new(obj.clone()).promote() }

    /// Records which gateway published this object; the first one wins.
    pub(crate) fn set_owner(&self, process: &Arc<ProcessState>) -> bool {
        let owner = self.owner.get_or_init(|| Arc::downgrade(process));
        Weak::ptr_eq(owner, &Arc::downgrade(process))
    }

    pub fn remote_state(&self) -> RemoteState {
        let k = lock(&self.kernel);
        match (k.strong.len(), k.weak.len()) {
            (0, 0) => RemoteState::LocalOnly,
            (strong, weak) => RemoteState::SentRemote { strong, weak },
        }
    }

    pub fn strong_count(&self) -> i32 { self.refs.strong_count() }
    pub fn weak_count(&self) -> i32 { self.refs.weak_count() }

    pub(crate) fn kernel_inc_strong(obj: &Arc<Self>) {
        let sp = Sp::force(obj.clone());
        lock(&obj.kernel).strong.push(sp);
    }

    pub(crate) fn kernel_inc_weak(obj: &Arc<Self>) {
        let wp = Wp::new(obj.clone());
        lock(&obj.kernel).weak.push(wp);
    }

    /// Takes a driver strong reference only if the object is still strongly alive.
    pub(crate) fn kernel_attempt_inc_strong(obj: &Arc<Self>) -> bool {
        match Self::promote(obj) {
            Some(sp) => {
                lock(&obj.kernel).strong.push(sp);
                true
            }
            None => false,
        }
    }

    /// Drops one driver-held strong reference. The guard is released outside the lock.
    pub(crate) fn kernel_dec_strong(&self) {
        let popped = lock(&self.kernel).strong.pop();
        if popped.is_none() {
            log::error!("BR_RELEASE for {self:?} without a matching BR_ACQUIRE");
        }
        drop(popped);
    }

    pub(crate) fn kernel_dec_weak(&self) {
        let popped = lock(&self.kernel).weak.pop();
        if popped.is_none() {
            log::error!("BR_DECREFS for {self:?} without a matching BR_INCREFS");
        }
        drop(popped);
    }

    /// Dispatches one transaction. Pings are answered here.
    pub fn transact(
        &self,
        code: u32,
        data: &Parcel,
        reply: &mut Parcel,
        flags: TransactionFlags,
        reply_cb: crate::ReplyCallback<'_>,
    ) -> Result<()> {
        data.set_data_position(0);
        if code == PING_TRANSACTION {
            reply_cb(reply);
            return Ok(());
        }
        self.dispatch.on_transact(code, data, reply, flags, reply_cb)
    }
}

struct Obituary {
    recipient: Weak<dyn DeathRecipient>,
    cookie: u64,
}

struct Obituaries {
    sent: bool,
    list: Option<Vec<Obituary>>,
}

/// Proxy for an object in another process, addressed by handle.
pub struct RemoteProxy {
    refs: RefCounts,
    handle: u32,
    process: Arc<ProcessState>,
    me: Weak<RemoteProxy>,
    alive: AtomicBool,
    obits: Mutex<Obituaries>,
}

impl fmt::Debug for RemoteProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteProxy(handle={}, {:?})", self.handle, self.refs)
    }
}

impl RemoteProxy {
    /// Creates the proxy and tells the driver this process now holds `handle` weakly.
    pub(crate) fn create(process: &Arc<ProcessState>, handle: u32) -> Arc<Self> {
        let proxy = Arc::new_cyclic(|me| Self {
            refs: RefCounts::new(Lifetime::Weak),
            handle,
            process: process.clone(),
            me: me.clone(),
            alive: AtomicBool::new(true),
            obits: Mutex::new(Obituaries { sent: false, list: None }),
        });
        let weak = Wp::new(proxy.clone());
        let sent = ThreadState::with_current(process, |t| t.inc_weak_handle(handle, weak));
        if sent.is_none() {
            log::warn!("no thread state to announce handle {handle}");
        }
        proxy
    }

    pub fn handle(&self) -> u32 { self.handle }
    pub fn process(&self) -> &Arc<ProcessState> { &self.process }
    pub fn is_alive(&self) -> bool { self.alive.load(Ordering::Acquire) }

    /// The death-notification cookie: the proxy's address.
    pub(crate) fn death_cookie(&self) -> u64 { self as *const Self as u64 }

    pub fn transact(&self, code: u32, data: &Parcel, reply: Option<&mut Parcel>, flags: TransactionFlags) -> Result<()> {
        if !self.is_alive() {
            return Err(BinderError::new(StatusCode::DeadObject));
        }
        let res = ThreadState::with_current(&self.process, |t| t.transact(self.handle, code, data, reply, flags))
            .unwrap_or_else(|| Err(BinderError::new(StatusCode::NoInit).ctx("thread state torn down")));
        if let Err(e) = &res {
            if e.is(StatusCode::DeadObject) {
                self.alive.store(false, Ordering::Release);
            }
        }
        res
    }

    pub fn link_to_death(&self, recipient: &Arc<dyn DeathRecipient>, cookie: u64) -> Result<()> {
        let Some(me) = self.me.upgrade() else {
            return Err(BinderError::new(StatusCode::DeadObject));
        };
        let first = {
            let mut obits = lock(&self.obits);
            if obits.sent {
                return Err(BinderError::new(StatusCode::DeadObject));
            }
            let first = obits.list.is_none();
            obits.list.get_or_insert_with(Vec::new).push(Obituary { recipient: Arc::downgrade(recipient), cookie });
            first
        };
        if first {
            log::debug!("requesting death notification for handle {}", self.handle);
            self.process.register_death(self.death_cookie(), Wp::new(me));
            ThreadState::with_current(&self.process, |t| {
                t.request_death_notification(self.handle, self.death_cookie());
                t.flush_commands();
            });
        }
        Ok(())
    }

    /// Removes a registration; `None` matches any recipient with `cookie`.
    /// Returns the recipient that was removed.
    pub fn unlink_to_death(
        &self,
        recipient: Option<&Arc<dyn DeathRecipient>>,
        cookie: u64,
    ) -> Result<Option<Arc<dyn DeathRecipient>>> {
        let mut obits = lock(&self.obits);
        if obits.sent {
            return Err(BinderError::new(StatusCode::DeadObject));
        }
        let Some(list) = obits.list.as_mut() else {
            return Err(BinderError::new(StatusCode::NameNotFound));
        };
        let found = list.iter().position(|o| {
            o.cookie == cookie && recipient.is_none_or(|r| Weak::ptr_eq(&o.recipient, &Arc::downgrade(r)))
        });
        let Some(index) = found else {
            return Err(BinderError::new(StatusCode::NameNotFound));
        };
        let removed = list.remove(index);
        if list.is_empty() {
            obits.list = None;
            ThreadState::with_current(&self.process, |t| {
                t.clear_death_notification(self.handle, self.death_cookie());
                t.flush_commands();
            });
        }
        Ok(removed.recipient.upgrade())
    }

    /// Delivers death notices to every registered recipient, once.
    pub(crate) fn send_obituary(&self) {
        log::debug!("handle {} died", self.handle);
        self.alive.store(false, Ordering::Release);
        let list = {
            let mut obits = lock(&self.obits);
            if obits.sent {
                return;
            }
            obits.sent = true;
            obits.list.take()
        };
        if list.is_some() {
            ThreadState::with_current(&self.process, |t| {
                t.clear_death_notification(self.handle, self.death_cookie());
                t.flush_commands();
            });
        }
        for obit in list.into_iter().flatten() {
            if let Some(recipient) = obit.recipient.upgrade() {
                recipient.binder_died(self, obit.cookie);
            }
        }
    }
}

impl RefCounted for RemoteProxy {
    fn refs(&self) -> &RefCounts { &self.refs }

    fn on_first_ref(&self) {
        let Some(me) = self.me.upgrade() else { return };
        let handle = self.handle;
        let keep = Sp::new(me);
        ThreadState::with_current(&self.process, |t| t.inc_strong_handle(handle, keep));
    }

    fn on_last_strong_ref(&self) {
        let pending = lock(&self.obits).list.take();
        let handle = self.handle;
        let cookie = self.death_cookie();
        let sent = ThreadState::with_current(&self.process, |t| {
            if let Some(list) = &pending {
                if !list.is_empty() {
                    log::info!("last strong ref to handle {handle} dropped with {} death recipients", list.len());
                }
                t.clear_death_notification(handle, cookie);
            }
            t.dec_strong_handle(handle);
        });
        if sent.is_none() {
            log::warn!("BC_RELEASE for handle {handle} lost: thread state gone");
        }
    }

    fn on_last_weak_ref(&self) {
        self.process.expunge_handle(self.handle, self);
        let handle = self.handle;
        let sent = ThreadState::with_current(&self.process, |t| t.dec_weak_handle(handle));
        if sent.is_none() {
            log::warn!("BC_DECREFS for handle {handle} lost: thread state gone");
        }
    }
}

/// An endpoint: served here, or proxied to another process.
#[derive(Clone)]
pub enum Binder {
    Local(Sp<LocalObject>),
    Remote(Sp<RemoteProxy>),
}

impl fmt::Debug for Binder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binder::Local(l) => write!(f, "Binder::Local({:#x})", l.token()),
            Binder::Remote(r) => write!(f, "Binder::Remote({})", r.handle()),
        }
    }
}

impl From<Sp<LocalObject>> for Binder {
    fn from(obj: Sp<LocalObject>) -> Self { Binder::Local(obj) }
}

impl From<Sp<RemoteProxy>> for Binder {
    fn from(proxy: Sp<RemoteProxy>) -> Self { Binder::Remote(proxy) }
}

impl Binder {
    pub fn local(dispatch: impl Dispatch + 'static) -> Self { Binder::Local(LocalObject::new(dispatch)) }

    /// Sends a transaction. Local objects are called directly on this thread.
    pub fn transact(&self, code: u32, data: &Parcel, reply: Option<&mut Parcel>, flags: TransactionFlags) -> Result<()> {
        match self {
            Binder::Remote(proxy) => proxy.transact(code, data, reply, flags),
            Binder::Local(obj) => {
                let mut scratch = Parcel::new();
                let mut sent: Option<Parcel> = None;
                let res = obj.transact(code, data, &mut scratch, flags, &mut |r: &mut Parcel| {
                    if sent.is_none() {
                        sent = Some(std::mem::take(r));
                    }
                });
                if let Some(reply) = reply {
                    *reply = sent.unwrap_or(scratch);
                    reply.set_data_position(0);
                }
                res
            }
        }
    }

    pub fn ping(&self) -> Result<()> {
        let mut reply = Parcel::new();
        self.transact(PING_TRANSACTION, &Parcel::new(), Some(&mut reply), TransactionFlags::empty())
    }

    pub fn is_alive(&self) -> bool {
        match self {
            Binder::Local(_) => true,
            Binder::Remote(proxy) => proxy.is_alive(),
        }
    }

    pub fn link_to_death(&self, recipient: &Arc<dyn DeathRecipient>, cookie: u64) -> Result<()> {
        match self {
            Binder::Local(_) => Err(BinderError::new(StatusCode::InvalidOperation)),
            Binder::Remote(proxy) => proxy.link_to_death(recipient, cookie),
        }
    }

    pub fn unlink_to_death(
        &self,
        recipient: Option<&Arc<dyn DeathRecipient>>,
        cookie: u64,
    ) -> Result<Option<Arc<dyn DeathRecipient>>> {
        match self {
            Binder::Local(_) => Err(BinderError::new(StatusCode::InvalidOperation)),
            Binder::Remote(proxy) => proxy.unlink_to_death(recipient, cookie),
        }
    }

    pub fn downgrade(&self) -> WeakBinder {
        match self {
            Binder::Local(l) => WeakBinder::Local(Sp::downgrade(l)),
            Binder::Remote(r) => WeakBinder::Remote(Sp::downgrade(r)),
        }
    }

    pub fn as_local(&self) -> Option<&Sp<LocalObject>> {
        match self {
            Binder::Local(l) => Some(l),
            Binder::Remote(_) => None,
        }
    }

    pub fn as_remote(&self) -> Option<&Sp<RemoteProxy>> {
        match self {
            Binder::Remote(r) => Some(r),
            Binder::Local(_) => None,
        }
    }
}

#[derive(Clone)]
pub enum WeakBinder {
    Local(Wp<LocalObject>),
    Remote(Wp<RemoteProxy>),
}

impl fmt::Debug for WeakBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeakBinder::Local(l) => write!(f, "WeakBinder::Local({:#x})", l.unsafe_get().token()),
            WeakBinder::Remote(r) => write!(f, "WeakBinder::Remote({})", r.unsafe_get().handle()),
        }
    }
}

impl WeakBinder {
    pub fn promote(&self) -> Option<Binder> {
        match self {
            WeakBinder::Local(l) => l.promote().map(Binder::Local),
            WeakBinder::Remote(r) => r.promote().map(Binder::Remote),
        }
    }
}
