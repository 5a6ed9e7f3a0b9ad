//! Strong/weak counted lifecycle for binder endpoints.
//!
//! Memory is owned by `Arc`; these counts drive *protocol* events instead. The first
//! strong reference, the last strong reference and the last weak reference each fire
//! a hook on the object, which is where endpoints talk to the driver. [`Sp`] and
//! [`Wp`] are the scoped guards that hold one count each.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering, fence};

const INITIAL_STRONG: i32 = 1 << 28;

/// Whether a zero strong count ends the object's life for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// Promotion fails once the last strong reference is gone.
    Strong,
    /// The object may be revived while weak references remain.
    Weak,
}

pub struct RefCounts {
    strong: AtomicI32,
    weak: AtomicI32,
    lifetime: Lifetime,
}

impl fmt::Debug for RefCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RefCounts(strong={}, weak={})", self.strong_count(), self.weak_count())
    }
}

impl RefCounts {
    pub fn new(lifetime: Lifetime) -> Self {
        Self { strong: AtomicI32::new(INITIAL_STRONG), weak: AtomicI32::new(0), lifetime }
    }

    pub fn strong_count(&self) -> i32 {
        match self.strong.load(Ordering::Relaxed) {
            INITIAL_STRONG => 0,
            n => n,
        }
    }

    pub fn weak_count(&self) -> i32 { self.weak.load(Ordering::Relaxed) }

    /// Was ever strongly held and is not any more.
    pub fn is_released(&self) -> bool { self.strong.load(Ordering::Relaxed) == 0 }
}

pub trait RefCounted: Send + Sync + 'static {
    fn refs(&self) -> &RefCounts;
    fn on_first_ref(&self) {}
    fn on_last_strong_ref(&self) {}
    fn on_last_weak_ref(&self) {}
}

pub(crate) fn inc_weak<T: RefCounted + ?Sized>(obj: &T) {
    obj.refs().weak.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn dec_weak<T: RefCounted + ?Sized>(obj: &T) {
    let prev = obj.refs().weak.fetch_sub(1, Ordering::Release);
    debug_assert!(prev > 0, "weak count underflow");
    if prev == 1 {
        fence(Ordering::Acquire);
        obj.on_last_weak_ref();
    }
}

pub(crate) fn inc_strong<T: RefCounted + ?Sized>(obj: &T) {
    inc_weak(obj);
    let refs = obj.refs();
    if refs.strong.fetch_add(1, Ordering::Relaxed) == INITIAL_STRONG {
        refs.strong.fetch_sub(INITIAL_STRONG, Ordering::Relaxed);
        obj.on_first_ref();
    }
}

pub(crate) fn dec_strong<T: RefCounted + ?Sized>(obj: &T) {
    let prev = obj.refs().strong.fetch_sub(1, Ordering::Release);
    debug_assert!(prev > 0, "strong count underflow");
    if prev == 1 {
        fence(Ordering::Acquire);
        obj.on_last_strong_ref();
    }
    dec_weak(obj);
}

/// Increments strong even from zero, re-running `on_first_ref`.
pub(crate) fn force_inc_strong<T: RefCounted + ?Sized>(obj: &T) {
    inc_weak(obj);
    let refs = obj.refs();
    match refs.strong.fetch_add(1, Ordering::Relaxed) {
        INITIAL_STRONG => {
            refs.strong.fetch_sub(INITIAL_STRONG, Ordering::Relaxed);
            obj.on_first_ref();
        }
        0 => obj.on_first_ref(),
        _ => {}
    }
}

pub(crate) fn attempt_inc_weak<T: RefCounted + ?Sized>(obj: &T) -> bool {
    let weak = &obj.refs().weak;
    let mut cur = weak.load(Ordering::Relaxed);
    while cur > 0 {
        match weak.compare_exchange_weak(cur, cur + 1, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return true,
            Err(actual) => cur = actual,
        }
    }
    false
}

pub(crate) fn attempt_inc_strong<T: RefCounted + ?Sized>(obj: &T) -> bool {
    inc_weak(obj);
    let refs = obj.refs();
    let mut cur = refs.strong.load(Ordering::Relaxed);
    while cur > 0 && cur != INITIAL_STRONG {
        match refs.strong.compare_exchange_weak(cur, cur + 1, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return true,
            Err(actual) => cur = actual,
        }
    }
    if cur <= 0 && refs.lifetime == Lifetime::Strong {
        dec_weak(obj);
        return false;
    }
    match refs.strong.fetch_add(1, Ordering::Relaxed) {
        INITIAL_STRONG => {
            refs.strong.fetch_sub(INITIAL_STRONG, Ordering::Relaxed);
            obj.on_first_ref();
        }
        0 => obj.on_first_ref(),
        _ => {}
    }
    true
}

/// One strong reference.
pub struct Sp<T: RefCounted>(Arc<T>);

impl<T: RefCounted> Sp<T> {
    pub fn new(obj: Arc<T>) -> Self {
        inc_strong(&*obj);
        Self(obj)
    }

    pub(crate) fn force(obj: Arc<T>) -> Self {
        force_inc_strong(&*obj);
        Self(obj)
    }

    /// Wraps a count that was already taken.
    pub(crate) fn adopt(obj: Arc<T>) -> Self { Self(obj) }

    pub fn downgrade(this: &Self) -> Wp<T> { Wp::new(this.0.clone()) }
    pub fn as_arc(this: &Self) -> &Arc<T> { &this.0 }
    pub fn ptr_eq(a: &Self, b: &Self) -> bool { Arc::ptr_eq(&a.0, &b.0) }
}

impl<T: RefCounted> Clone for Sp<T> {
    fn clone(&self) -> Self { Sp::new(self.0.clone()) }
}

impl<T: RefCounted> Drop for Sp<T> {
    fn drop(&mut self) { dec_strong(&*self.0); }
}

impl<T: RefCounted> Deref for Sp<T> {
    type Target = T;
    fn deref(&self) -> &T { &self.0 }
}

impl<T: RefCounted + fmt::Debug> fmt::Debug for Sp<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "Sp({:?})", self.0) }
}

/// One weak reference. Keeps the object resolvable, not alive.
pub struct Wp<T: RefCounted>(Arc<T>);

impl<T: RefCounted> Wp<T> {
    pub fn new(obj: Arc<T>) -> Self {
        inc_weak(&*obj);
        Self(obj)
    }

    pub(crate) fn adopt(obj: Arc<T>) -> Self { Self(obj) }

    pub fn promote(&self) -> Option<Sp<T>> {
        attempt_inc_strong(&*self.0).then(|| Sp::adopt(self.0.clone()))
    }

    /// Borrow of the object without claiming it is still strongly alive.
    pub fn unsafe_get(&self) -> &Arc<T> { &self.0 }
}

impl<T: RefCounted> Clone for Wp<T> {
    fn clone(&self) -> Self { Wp::new(self.0.clone()) }
}

impl<T: RefCounted> Drop for Wp<T> {
    fn drop(&mut self) { dec_weak(&*self.0); }
}

impl<T: RefCounted + fmt::Debug> fmt::Debug for Wp<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "Wp({:?})", self.0) }
}
