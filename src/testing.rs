//! A `Driver` double that replays prepared return streams and records command bytes.

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use nix::errno::Errno;

use crate::abi::{
    BINDER_CURRENT_PROTOCOL_VERSION, BinderObject, NodeDebugInfo, NodeInfoForRef, PtrCookie, TransactionData, br,
};
use crate::region::SharedRegion;
use crate::traits::{Driver, Transfer};
use crate::{TransactionFlags, lock};

const REGION_SIZE: usize = 64 * 1024;

/// One `read` buffer's worth of driver returns.
#[derive(Debug, Default)]
pub struct Stream(Vec<u8>);

impl Stream {
    pub fn new() -> Self { Self::default() }

    pub fn cmd(mut self, cmd: u32) -> Self {
        self.0.extend_from_slice(&cmd.to_ne_bytes());
        self
    }

    pub fn ptr_cookie(self, cmd: u32, pc: PtrCookie) -> Self {
        let mut s = self.cmd(cmd);
        s.0.extend_from_slice(&pc.encode());
        s
    }

    pub fn reply(self, addr: u64, len: u64, flags: TransactionFlags) -> Self {
        let tr = TransactionData { flags, data_size: len, data_buffer: addr, ..TransactionData::to_handle(0) };
        let mut s = self.cmd(br::REPLY);
        s.0.extend_from_slice(&tr.encode());
        s
    }

    pub fn transaction(self, ptr: u64, cookie: u64, code: u32, addr: u64, len: u64, flags: TransactionFlags) -> Self {
        let tr = TransactionData {
            cookie,
            code,
            flags,
            sender_pid: std::process::id() as i32,
            data_size: len,
            data_buffer: addr,
            ..TransactionData::to_ptr(ptr)
        };
        let mut s = self.cmd(br::TRANSACTION);
        s.0.extend_from_slice(&tr.encode());
        s
    }
}

#[derive(Default)]
struct Script {
    version: Option<i32>,
    streams: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    fail: Option<Errno>,
    max_threads: Vec<u32>,
    spam_detection: bool,
    nodes: Vec<(u64, u64)>,
    context_ext_fails: bool,
    context_manager: bool,
    poll_fd: Option<RawFd>,
    staged: usize,
}

pub struct ScriptedDriver {
    script: Mutex<Script>,
    region: Arc<SharedRegion>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self { script: Mutex::new(Script::default()), region: Arc::new(SharedRegion::heap(REGION_SIZE)) }
    }

    pub fn push(&self, stream: Stream) { lock(&self.script).streams.push_back(stream.0); }

    /// Command bytes written since the last call.
    pub fn written(&self) -> Vec<u8> { std::mem::take(&mut lock(&self.script).written) }

    pub fn fail_next(&self, errno: Errno) { lock(&self.script).fail = Some(errno); }
    pub fn set_version(&self, version: i32) { lock(&self.script).version = Some(version); }
    pub fn max_threads_set(&self) -> Vec<u32> { lock(&self.script).max_threads.clone() }
    pub fn spam_detection(&self) -> bool { lock(&self.script).spam_detection }
    pub fn set_nodes(&self, nodes: Vec<(u64, u64)>) { lock(&self.script).nodes = nodes; }
    pub fn fail_context_manager_ext(&self) { lock(&self.script).context_ext_fails = true; }
    pub fn is_context_manager(&self) -> bool { lock(&self.script).context_manager }
    pub fn set_poll_fd(&self, fd: RawFd) { lock(&self.script).poll_fd = Some(fd); }

    /// Copies `bytes` into the payload region and returns their address.
    pub fn stage(&self, bytes: &[u8]) -> u64 {
        let mut script = lock(&self.script);
        let addr = self.region.base() + script.staged as u64;
        self.region.write(addr, bytes).expect("staged payload fits");
        script.staged += bytes.len().next_multiple_of(8).max(8);
        addr
    }
}

impl Driver for ScriptedDriver {
    fn version(&self) -> nix::Result<i32> {
        Ok(lock(&self.script).version.unwrap_or(BINDER_CURRENT_PROTOCOL_VERSION))
    }

    fn write_read(&self, write: &[u8], read: &mut [u8]) -> nix::Result<Transfer> {
        let mut script = lock(&self.script);
        if let Some(errno) = script.fail.take() {
            return Err(errno);
        }
        let mut read_consumed = 0;
        if !read.is_empty() {
            let Some(stream) = script.streams.pop_front() else {
                return Err(Errno::EBADF);
            };
            assert!(stream.len() <= read.len(), "scripted stream larger than read buffer");
            read[..stream.len()].copy_from_slice(&stream);
            read_consumed = stream.len();
        }
        script.written.extend_from_slice(write);
        Ok(Transfer { write_consumed: write.len(), read_consumed })
    }

    fn set_max_threads(&self, max: u32) -> nix::Result<()> {
        lock(&self.script).max_threads.push(max);
        Ok(())
    }

    fn enable_oneway_spam_detection(&self, enable: bool) -> nix::Result<()> {
        lock(&self.script).spam_detection = enable;
        Ok(())
    }

    fn set_context_manager_ext(&self, _obj: &BinderObject) -> nix::Result<()> {
        let mut script = lock(&self.script);
        if script.context_ext_fails {
            return Err(Errno::EINVAL);
        }
        script.context_manager = true;
        Ok(())
    }

    fn set_context_manager(&self) -> nix::Result<()> {
        lock(&self.script).context_manager = true;
        Ok(())
    }

    fn node_debug_info(&self, ptr: u64) -> nix::Result<NodeDebugInfo> {
        let script = lock(&self.script);
        let next = script.nodes.iter().find(|(p, _)| *p > ptr);
        Ok(next.map_or_else(NodeDebugInfo::default, |&(ptr, cookie)| NodeDebugInfo {
            ptr,
            cookie,
            has_strong_ref: 1,
            has_weak_ref: 1,
        }))
    }

    fn node_info_for_ref(&self, _handle: u32) -> nix::Result<NodeInfoForRef> { Err(Errno::EINVAL) }

    fn thread_exit(&self) -> nix::Result<()> { Ok(()) }

    fn region(&self) -> Option<Arc<SharedRegion>> { Some(self.region.clone()) }

    fn poll_fd(&self) -> Option<RawFd> { lock(&self.script).poll_fd }
}
