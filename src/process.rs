//! The Driver Gateway: one per process, shared by every thread's engine.
//!
//! Owns the driver, the handle table of remote proxies, the table of local
//! objects published to the driver, the death-notification registry and the
//! thread-pool bookkeeping. All tables live behind one mutex; no strong or weak
//! reference is ever dropped while it is held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use crate::abi::{BinderObject, FLAT_BINDER_FLAG_TXN_SECURITY_CTX, NodeDebugInfo};
use crate::binder::{LocalObject, RemoteProxy};
use crate::driver::DeviceDriver;
use crate::error::fatal;
use crate::refs::{self, Sp, Wp};
use crate::thread::ThreadState;
use crate::{BinderError, CallRestriction, Driver, ProcessConfig, Result, ThreadPoolPlan, lock};

/// Set by the first [`ProcessState::init`]; `None` records a device that could not be opened.
static GLOBAL: OnceLock<Option<Arc<ProcessState>>> = OnceLock::new();

struct Tables {
    /// Indexed by handle. Plain `Weak`: the table must not hold a protocol count.
    handles: Vec<Weak<RemoteProxy>>,
    /// Published local objects by driver-visible token.
    locals: HashMap<u64, Weak<LocalObject>>,
    /// One weak reference per outstanding death-notification request.
    deaths: HashMap<u64, Vec<Wp<RemoteProxy>>>,
    max_threads: u32,
    spawn_on_start: bool,
    executing: u32,
    starvation_start: Option<Instant>,
}

pub struct ProcessState {
    driver: Arc<dyn Driver>,
    config: ProcessConfig,
    tables: Mutex<Tables>,
    pool_started: AtomicBool,
    thread_seq: AtomicU32,
    starvation_episodes: AtomicU64,
    call_restriction: Mutex<CallRestriction>,
    context_object: Mutex<Option<Sp<LocalObject>>>,
    warned_ref_info: AtomicBool,
}

impl std::fmt::Debug for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessState")
            .field("driver_path", &self.config.driver_path)
            .field("mmap_size", &self.config.mmap_size)
            .field("pool_started", &self.pool_started.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ProcessState {
    /// Initializes the process-wide gateway once. Later calls return the same one,
    /// or `None` again if the first could not open the device.
    ///
    /// An unopenable device is fatal with `require_driver`, and `None` otherwise.
    pub fn init(config: ProcessConfig) -> Option<Arc<Self>> {
        let mut fresh = false;
        let process = GLOBAL.get_or_init(|| {
            fresh = true;
            match Self::open(config.clone()) {
                Ok(process) => Some(process),
                Err(e) if config.require_driver => fatal!("hwbinder driver required but unavailable: {e}"),
                Err(e) => {
                    log::error!("hwbinder driver unavailable: {e}");
                    None
                }
            }
        });
        if let Some(existing) = process.as_ref().filter(|_| !fresh) {
            if config.require_mmap_size && existing.config.mmap_size != config.mmap_size {
                fatal!(
                    "hwbinder already initialized with mmap size {}, {} requested",
                    existing.config.mmap_size,
                    config.mmap_size
                );
            }
        }
        process.clone()
    }

    /// The gateway created by [`ProcessState::init`], if any.
    pub fn global() -> Option<Arc<Self>> { GLOBAL.get().cloned().flatten() }

    /// Opens the device named in `config` and maps its payload region.
    pub fn open(config: ProcessConfig) -> Result<Arc<Self>> {
        let driver = DeviceDriver::open(&config.driver_path, config.mmap_size)?;
        Self::with_driver(Arc::new(driver), config)
    }

    /// Wraps an already open driver: checks the protocol version and applies `config`.
    pub fn with_driver(driver: Arc<dyn Driver>, config: ProcessConfig) -> Result<Arc<Self>> {
        let version = driver.version().map_err(|e| BinderError::errno(e).ctx("BINDER_VERSION failed"))?;
        if version != crate::abi::BINDER_CURRENT_PROTOCOL_VERSION {
            return Err(BinderError::new(crate::StatusCode::NoInit).ctx(format_args!(
                "driver protocol {version} does not match {}",
                crate::abi::BINDER_CURRENT_PROTOCOL_VERSION
            )));
        }
        if let Err(e) = driver.set_max_threads(config.max_threads) {
            log::error!("BINDER_SET_MAX_THREADS failed: {e}");
        }
        if config.oneway_spam_detection {
            if let Err(e) = driver.enable_oneway_spam_detection(true) {
                log::debug!("oneway spam detection unsupported: {e}");
            }
        }
        log::debug!("hwbinder gateway on {} ({} byte region)", config.driver_path.display(), config.mmap_size);
        Ok(Arc::new(Self {
            driver,
            call_restriction: Mutex::new(config.call_restriction),
            tables: Mutex::new(Tables {
                handles: Vec::new(),
                locals: HashMap::new(),
                deaths: HashMap::new(),
                max_threads: config.max_threads,
                spawn_on_start: true,
                executing: 0,
                starvation_start: None,
            }),
            config,
            pool_started: AtomicBool::new(false),
            thread_seq: AtomicU32::new(1),
            starvation_episodes: AtomicU64::new(0),
            context_object: Mutex::new(None),
            warned_ref_info: AtomicBool::new(false),
        }))
    }

    pub(crate) fn driver(&self) -> &Arc<dyn Driver> { &self.driver }
    pub fn config(&self) -> &ProcessConfig { &self.config }
    pub fn mmap_size(&self) -> usize { self.config.mmap_size }

    // ---- handle table ----

    fn handle_slot(tables: &mut Tables, handle: u32) -> &mut Weak<RemoteProxy> {
        let index = handle as usize;
        if tables.handles.len() <= index {
            tables.handles.resize_with(index + 1, Weak::new);
        }
        &mut tables.handles[index]
    }

    /// Returns the proxy for `handle`, creating one if the cached entry is gone or dying.
    pub fn get_strong_proxy_for_handle(self: &Arc<Self>, handle: u32) -> Option<Sp<RemoteProxy>> {
        let mut tables = lock(&self.tables);
        let slot = Self::handle_slot(&mut tables, handle);
        if let Some(existing) = slot.upgrade() {
            if refs::attempt_inc_weak(&*existing) {
                let sp = Sp::force(existing.clone());
                // Still weakly held by `sp`, so this never reaches zero here.
                refs::dec_weak(&*existing);
                return Some(sp);
            }
        }
        let proxy = RemoteProxy::create(self, handle);
        *slot = Arc::downgrade(&proxy);
        Some(Sp::new(proxy))
    }

    pub fn get_weak_proxy_for_handle(self: &Arc<Self>, handle: u32) -> Option<Wp<RemoteProxy>> {
        let mut tables = lock(&self.tables);
        let slot = Self::handle_slot(&mut tables, handle);
        if let Some(existing) = slot.upgrade() {
            if refs::attempt_inc_weak(&*existing) {
                return Some(Wp::adopt(existing));
            }
        }
        let proxy = RemoteProxy::create(self, handle);
        *slot = Arc::downgrade(&proxy);
        Some(Wp::new(proxy))
    }

    /// Clears the slot for `handle`, but only while it still refers to `proxy`.
    pub fn expunge_handle(&self, handle: u32, proxy: &RemoteProxy) {
        let mut tables = lock(&self.tables);
        if let Some(slot) = tables.handles.get_mut(handle as usize) {
            if std::ptr::eq(slot.as_ptr(), proxy) {
                *slot = Weak::new();
            }
        }
    }

    /// Strong proxy for handle 0.
    pub fn context_object(self: &Arc<Self>) -> Option<Sp<RemoteProxy>> { self.get_strong_proxy_for_handle(0) }

    // ---- local objects ----

    /// Makes `local` resolvable from the pointer/cookie pair the driver hands back.
    pub fn publish_local(self: &Arc<Self>, local: &Sp<LocalObject>) {
        if !local.set_owner(self) {
            log::warn!("{local:?} is already published by another gateway");
            return;
        }
        let weak = Arc::downgrade(Sp::as_arc(local));
        lock(&self.tables).locals.insert(local.token(), weak);
    }

    pub fn lookup_local(&self, ptr: u64, cookie: u64) -> Option<Arc<LocalObject>> {
        let tables = lock(&self.tables);
        let weak = tables.locals.get(&ptr)?;
        if weak.as_ptr() as u64 != cookie {
            return None;
        }
        weak.upgrade()
    }

    pub(crate) fn forget_local(&self, ptr: u64, cookie: u64) {
        let mut tables = lock(&self.tables);
        if tables.locals.get(&ptr).is_some_and(|w| w.as_ptr() as u64 == cookie) {
            tables.locals.remove(&ptr);
        }
    }

    /// The object serving transactions addressed to handle 0.
    pub fn set_context_object(&self, local: Sp<LocalObject>) {
        let prev = lock(&self.context_object).replace(local);
        drop(prev);
    }

    pub(crate) fn served_context_object(&self) -> Option<Sp<LocalObject>> { lock(&self.context_object).clone() }

    /// Registers with the driver as the handle-0 dispatcher.
    pub fn become_context_manager(&self) -> Result<()> {
        let obj = BinderObject::Binder { weak: false, ptr: 0, cookie: 0, flags: FLAT_BINDER_FLAG_TXN_SECURITY_CTX };
        match self.driver.set_context_manager_ext(&obj) {
            Ok(()) => Ok(()),
            Err(ext) => {
                log::debug!("BINDER_SET_CONTEXT_MGR_EXT failed ({ext}), trying the legacy ioctl");
                self.driver.set_context_manager().map_err(|e| {
                    log::error!("unable to become context manager: {e}");
                    BinderError::errno(e).ctx("BINDER_SET_CONTEXT_MGR")
                })
            }
        }
    }

    // ---- death notifications ----

    pub(crate) fn register_death(&self, cookie: u64, proxy: Wp<RemoteProxy>) {
        lock(&self.tables).deaths.entry(cookie).or_default().push(proxy);
    }

    pub(crate) fn unregister_death(&self, cookie: u64) {
        let released = {
            let mut tables = lock(&self.tables);
            let Some(list) = tables.deaths.get_mut(&cookie) else {
                log::warn!("BR_CLEAR_DEATH_NOTIFICATION_DONE for unknown cookie {cookie:#x}");
                return;
            };
            let released = list.pop();
            if list.is_empty() {
                tables.deaths.remove(&cookie);
            }
            released
        };
        drop(released);
    }

    pub(crate) fn death_proxy(&self, cookie: u64) -> Option<Arc<RemoteProxy>> {
        lock(&self.tables).deaths.get(&cookie).and_then(|l| l.first()).map(|wp| wp.unsafe_get().clone())
    }

    // ---- driver queries ----

    /// Every node this process owns in the driver, as reported by BINDER_GET_NODE_DEBUG_INFO.
    pub fn kernel_references(&self) -> Result<Vec<NodeDebugInfo>> {
        let mut nodes = Vec::new();
        let mut ptr = 0;
        loop {
            let info = self.driver.node_debug_info(ptr).map_err(|e| BinderError::errno(e).ctx("BINDER_GET_NODE_DEBUG_INFO"))?;
            if info.ptr == 0 {
                return Ok(nodes);
            }
            ptr = info.ptr;
            nodes.push(info);
        }
    }

    /// Strong references the driver holds for `handle`, or `None` when it cannot tell.
    pub fn strong_ref_count_for_handle(&self, handle: u32) -> Option<u32> {
        match self.driver.node_info_for_ref(handle) {
            Ok(info) => Some(info.strong_count),
            Err(e) => {
                if !self.warned_ref_info.swap(true, Ordering::Relaxed) {
                    log::warn!("BINDER_GET_NODE_INFO_FOR_REF unavailable: {e}");
                }
                None
            }
        }
    }

    pub fn set_call_restriction(&self, restriction: CallRestriction) {
        *lock(&self.call_restriction) = restriction;
    }

    pub fn call_restriction(&self) -> CallRestriction { *lock(&self.call_restriction) }

    // ---- thread pool ----

    pub fn start_thread_pool(self: &Arc<Self>) {
        if self.pool_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let spawn = lock(&self.tables).spawn_on_start;
        if spawn {
            self.spawn_pooled_thread(true);
        }
    }

    pub fn is_thread_pool_started(&self) -> bool { self.pool_started.load(Ordering::Acquire) }

    pub fn make_thread_name(&self) -> String {
        let seq = self.thread_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}:{}_{:X}", self.config.thread_name_prefix, std::process::id(), seq)
    }

    /// Starts one pool thread. A no-op until the pool is started.
    pub fn spawn_pooled_thread(self: &Arc<Self>, is_main: bool) {
        if !self.is_thread_pool_started() {
            return;
        }
        let name = self.make_thread_name();
        log::debug!("spawning pool thread {name}");
        let process = self.clone();
        let spawned = std::thread::Builder::new().name(name.clone()).spawn(move || {
            if ThreadState::with_current(&process, |t| t.join_thread_pool(is_main)).is_none() {
                log::error!("pool thread has no engine");
            }
            ThreadState::detach(&process);
        });
        if let Err(e) = spawned {
            log::error!("failed to spawn {name}: {e}");
        }
    }

    /// Sets the pool size. Shrinking a started pool is fatal.
    pub fn set_thread_pool_configuration(&self, max_threads: u32, caller_joins: bool) -> Result<()> {
        let plan = ThreadPoolPlan::compute(max_threads, caller_joins);
        let mut tables = lock(&self.tables);
        if self.is_thread_pool_started() && max_threads < tables.max_threads {
            fatal!("thread pool already started with {} threads, cannot shrink to {max_threads}", tables.max_threads);
        }
        self.driver
            .set_max_threads(plan.kernel_max_threads)
            .map_err(|e| BinderError::errno(e).ctx("BINDER_SET_MAX_THREADS"))?;
        tables.max_threads = plan.max_threads;
        tables.spawn_on_start = plan.spawn_on_start;
        Ok(())
    }

    pub fn max_threads(&self) -> u32 { lock(&self.tables).max_threads }

    pub fn executing_threads(&self) -> u32 { lock(&self.tables).executing }

    /// Starvation episodes reported so far.
    pub fn starvation_episodes(&self) -> u64 { self.starvation_episodes.load(Ordering::Relaxed) }

    pub(crate) fn executing_thread_begin(&self) {
        let mut tables = lock(&self.tables);
        tables.executing += 1;
        if tables.executing >= tables.max_threads && tables.max_threads > 1 && tables.starvation_start.is_none() {
            tables.starvation_start = Some(Instant::now());
        }
    }

    /// Returns how long the pool was saturated when this ends a reported episode.
    pub(crate) fn executing_thread_end(&self) -> Option<Duration> {
        let mut tables = lock(&self.tables);
        tables.executing = tables.executing.saturating_sub(1);
        if tables.executing >= tables.max_threads {
            return None;
        }
        let started = tables.starvation_start.take()?;
        let starved = started.elapsed();
        if starved > self.config.starvation_threshold() {
            log::warn!(
                "all {} pool threads busy for {} ms",
                tables.max_threads,
                starved.as_millis()
            );
            self.starvation_episodes.fetch_add(1, Ordering::Relaxed);
            return Some(starved);
        }
        None
    }
}
