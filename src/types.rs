use std::path::PathBuf;
use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::fatal;

bitflags! {
    /// `transaction_flags` of `binder_transaction_data`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TransactionFlags: u32 {
        /// No reply expected.
        const ONE_WAY = 0x01;
        const ROOT_OBJECT = 0x04;
        /// Payload is a single `status_t`.
        const STATUS_CODE = 0x08;
        const ACCEPT_FDS = 0x10;
        /// Zero the buffer once the receiver frees it.
        const CLEAR_BUF = 0x20;
        const UPDATE_TXN = 0x40;
    }
}

impl Default for TransactionFlags {
    fn default() -> Self { Self::empty() }
}

/// What to do when a thread makes a two-way call under a restricted policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CallRestriction {
    #[default]
    None,
    /// Log the offending call and let it proceed.
    ErrorIfNotOneway,
    /// Abort the process.
    FatalIfNotOneway,
}

/// The kernel's default transaction buffer: 1 MiB minus two guard pages.
pub fn default_mmap_size() -> usize {
    let page = nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map_or(4096, |p| p as usize);
    1024 * 1024 - page * 2
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub driver_path: PathBuf,
    pub mmap_size: usize,

    /// Abort when an already-created global gateway was mapped with a different size.
    pub require_mmap_size: bool,

    /// Abort instead of returning `None` when the device cannot be opened.
    pub require_driver: bool,

    /// Thread ceiling handed to the driver at open time.
    pub max_threads: u32,

    pub oneway_spam_detection: bool,

    /// How long every pool thread may stay busy before starvation is reported.
    pub starvation_threshold_ms: u64,

    pub call_restriction: CallRestriction,
    pub thread_name_prefix: String,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            driver_path: PathBuf::from("/dev/hwbinder"),
            mmap_size: default_mmap_size(),
            require_mmap_size: false,
            require_driver: false,
            max_threads: 0,
            oneway_spam_detection: true,
            starvation_threshold_ms: 100,
            call_restriction: CallRestriction::None,
            thread_name_prefix: "HwBinder".to_string(),
        }
    }
}

impl ProcessConfig {
    pub fn starvation_threshold(&self) -> Duration {
        Duration::from_millis(self.starvation_threshold_ms)
    }
}

/// How a requested pool size is split between eager spawning and the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadPoolPlan {
    /// Ceiling handed to the driver for `BR_SPAWN_LOOPER` requests.
    pub kernel_max_threads: u32,
    /// Spawn one pooled thread as soon as the pool starts.
    pub spawn_on_start: bool,
    /// Total threads the pool may run, caller included.
    pub max_threads: u32,
}

impl ThreadPoolPlan {
    /// Splits `max_threads` into the driver ceiling and eager spawn.
    ///
    /// A joining caller counts as one of the threads; the eagerly spawned
    /// thread counts as another.
    pub fn compute(max_threads: u32, caller_joins: bool) -> Self {
        if max_threads == 0 && caller_joins {
            fatal!("thread pool: max_threads is 0 but the caller joins the pool");
        }
        let mut to_allocate = max_threads;
        if caller_joins {
            to_allocate -= 1;
        }
        let spawn_on_start = to_allocate > 0;
        if spawn_on_start {
            to_allocate -= 1;
        }
        Self { kernel_max_threads: to_allocate, spawn_on_start, max_threads }
    }
}
