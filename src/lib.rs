//! # hwbinder
//! Userspace transport for the hwbinder kernel driver.
//!
//! Processes talk to each other through the driver by exchanging transactions:
//! a target, a code, and a [`Parcel`] payload that may carry binder objects,
//! file descriptors and out-of-line buffers. The driver translates the objects
//! on the way through and tells each process when remote references to its
//! objects come and go.
//!
//! ## Layers
//! * **Gateway:** [`ProcessState`] opens the device, maps the receive region,
//!   keeps the handle table and runs the thread pool.
//! * **Engine:** [`ThreadState`] is the per-thread command loop. It writes
//!   `BC_*` commands, executes `BR_*` returns and dispatches inbound calls.
//! * **Parcel:** [`Parcel`] marshals primitives, strings, objects and
//!   scatter-gather buffers in the driver's wire layout.
//! * **Endpoints:** [`LocalObject`] stubs serve calls; [`RemoteProxy`] objects
//!   forward them to a handle. [`Binder`] is either one.
//!
//! [`Loopback`] runs the whole stack in one process, with an emulated driver
//! standing in for `/dev/hwbinder`.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod abi;
pub mod binder;
pub mod driver;
pub mod error;
pub mod loopback;
pub mod parcel;
pub mod process;
pub mod refs;
pub mod region;
pub mod thread;
pub mod traits;
pub mod types;

#[cfg(test)]
mod testing;

pub use binder::{Binder, LocalObject, PING_TRANSACTION, RemoteProxy, SchedPolicy, WeakBinder};
pub use error::*;
pub use loopback::Loopback;
pub use parcel::{NativeHandle, Parcel};
pub use process::ProcessState;
pub use refs::{Sp, Wp};
pub use thread::ThreadState;
pub use traits::*;
pub use types::*;

/// Locks `m`, carrying on with the data if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }
