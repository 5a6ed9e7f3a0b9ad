use std::os::fd::RawFd;
use std::sync::Arc;

use crate::abi::{BinderObject, NodeDebugInfo, NodeInfoForRef};
use crate::binder::RemoteProxy;
use crate::region::SharedRegion;
use crate::{Parcel, Result, TransactionFlags};

/// Sends the reply for the transaction being dispatched. Only the first call counts.
pub type ReplyCallback<'a> = &'a mut dyn FnMut(&mut Parcel);

/// The local-stub dispatch hook.
pub trait Dispatch: Send + Sync {
    fn on_transact(
        &self,
        code: u32,
        data: &Parcel,
        reply: &mut Parcel,
        flags: TransactionFlags,
        reply_cb: ReplyCallback<'_>,
    ) -> Result<()>;
}

/// Plain closures dispatch without touching the callback; the engine replies with
/// `reply` once they return.
impl<F> Dispatch for F
where
    F: Fn(u32, &Parcel, &mut Parcel, TransactionFlags) -> Result<()> + Send + Sync,
{
    fn on_transact(
        &self,
        code: u32,
        data: &Parcel,
        reply: &mut Parcel,
        flags: TransactionFlags,
        _reply_cb: ReplyCallback<'_>,
    ) -> Result<()> {
        self(code, data, reply, flags)
    }
}

pub trait DeathRecipient: Send + Sync {
    fn binder_died(&self, who: &RemoteProxy, cookie: u64);
}

impl std::fmt::Debug for dyn DeathRecipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DeathRecipient")
    }
}

/// Byte counts the driver reports after one `BINDER_WRITE_READ`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transfer {
    pub write_consumed: usize,
    pub read_consumed: usize,
}

/// The ioctl surface of the binder device.
pub trait Driver: Send + Sync {
    fn version(&self) -> nix::Result<i32>;
    fn write_read(&self, write: &[u8], read: &mut [u8]) -> nix::Result<Transfer>;
    fn set_max_threads(&self, max: u32) -> nix::Result<()>;
    fn enable_oneway_spam_detection(&self, enable: bool) -> nix::Result<()>;
    fn set_context_manager_ext(&self, obj: &BinderObject) -> nix::Result<()>;
    fn set_context_manager(&self) -> nix::Result<()>;
    fn node_debug_info(&self, ptr: u64) -> nix::Result<NodeDebugInfo>;
    fn node_info_for_ref(&self, handle: u32) -> nix::Result<NodeInfoForRef>;
    fn thread_exit(&self) -> nix::Result<()>;

    /// Where received payloads live.
    fn region(&self) -> Option<Arc<SharedRegion>>;

    /// Pollable fd, when the driver has one.
    fn poll_fd(&self) -> Option<RawFd> { None }
}
