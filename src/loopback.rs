//! An in-process stand-in for the binder driver.
//!
//! A [`Loopback`] plays the driver for several gateways at once, each opened
//! with [`Loopback::open`] as if it lived in its own process. Commands run the
//! way the kernel runs them: payloads are copied into the receiver's region,
//! embedded objects are translated between nodes and handles, and node
//! reference changes go back to the owner as `BR_INCREFS`/`BR_ACQUIRE`/
//! `BR_RELEASE`/`BR_DECREFS` work.
//!
//! Only the transaction engine talks to these drivers, and it points every
//! command at memory that stays live for the whole `BINDER_WRITE_READ`; the
//! copies below rely on that the same way the kernel relies on user pointers.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::os::fd::RawFd;
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use nix::errno::Errno;

use crate::abi::{
    BINDER_BUFFER_FLAG_HAS_PARENT, BINDER_CURRENT_PROTOCOL_VERSION, BinderObject, FLAT_BINDER_FLAG_TXN_SECURITY_CTX,
    NodeDebugInfo, NodeInfoForRef, PTR_COOKIE_SIZE, PtrCookie, TRANSACTION_DATA_SIZE, TransactionData, WireReader, bc,
    br,
};
use crate::process::ProcessState;
use crate::region::SharedRegion;
use crate::traits::{Driver, Transfer};
use crate::{ProcessConfig, Result, TransactionFlags, lock};

type ProcId = u32;
type NodeId = u64;
type TxnId = u64;
type KResult<T> = std::result::Result<T, Errno>;

/// Undelivered one-way calls from one sender before its calls are flagged.
const ONEWAY_SPAM_THRESHOLD: usize = 50;

fn align8(n: usize) -> usize { n.next_multiple_of(8) }

/// Malformed command streams are `EPROTO`; they stop command processing.
fn short<T>(r: Result<T>) -> KResult<T> { r.map_err(|_| Errno::EPROTO) }

fn parent_buffer(buffers: &[Option<(usize, u64)>], parent: u64) -> KResult<(usize, u64)> {
    buffers.get(parent as usize).copied().flatten().ok_or(Errno::EINVAL)
}

/// Reads `len` bytes at `addr` the way the kernel copies from user space.
///
/// # Safety
/// The span must be readable for the duration of the enclosing `write_read`.
unsafe fn user_bytes<'a>(addr: u64, len: u64) -> KResult<&'a [u8]> {
    if len == 0 {
        return Ok(&[]);
    }
    if addr == 0 {
        return Err(Errno::EFAULT);
    }
    let len = usize::try_from(len).map_err(|_| Errno::EINVAL)?;
    // SAFETY: per the caller's contract.
    Ok(unsafe { std::slice::from_raw_parts(addr as *const u8, len) })
}

fn push_cmd(out: &mut Vec<u8>, cmd: u32, payload: &[u8]) {
    out.extend_from_slice(&cmd.to_ne_bytes());
    out.extend_from_slice(payload);
}

#[derive(Debug)]
enum Work {
    Complete,
    SpamSuspect,
    Transaction { tr: TransactionData, secctx: u64, txn: Option<TxnId>, from: ProcId },
    Reply(TransactionData),
    DeadReply,
    FailedReply,
    /// The node's wanted references differ from what its owner was told.
    Node(NodeId),
    DeadBinder(u64),
    ClearDone(u64),
}

impl Work {
    /// Upper bound on the bytes this item takes in a read buffer.
    fn max_len(&self) -> usize {
        match self {
            Work::Transaction { .. } => 4 + TRANSACTION_DATA_SIZE + 8,
            Work::Reply(_) => 4 + TRANSACTION_DATA_SIZE,
            Work::Node(_) => 4 * (4 + PTR_COOKIE_SIZE),
            Work::DeadBinder(_) | Work::ClearDone(_) => 12,
            Work::Complete | Work::SpamSuspect | Work::DeadReply | Work::FailedReply => 4,
        }
    }
}

#[derive(Debug)]
struct Node {
    owner: ProcId,
    ptr: u64,
    cookie: u64,
    flags: u32,
    /// Refs holding the node strongly.
    internal_strong: u32,
    refs: u32,
    /// Holds by in-flight buffers and increments the owner has not acknowledged.
    local_strong: u32,
    local_weak: u32,
    has_strong: bool,
    has_weak: bool,
    queued: bool,
}

impl Node {
    fn wanted(&self) -> (bool, bool) {
        let strong = self.internal_strong > 0 || self.local_strong > 0;
        (strong, strong || self.refs > 0 || self.local_weak > 0)
    }

    fn is_unused(&self) -> bool {
        self.wanted() == (false, false) && !self.has_strong && !self.has_weak && !self.queued
    }
}

#[derive(Debug)]
struct Ref {
    node: NodeId,
    strong: u32,
    weak: u32,
    death: Option<u64>,
}

/// A reference a delivered buffer keeps until it is freed.
#[derive(Debug, Clone, Copy)]
enum Hold {
    Ref { handle: u32, strong: bool },
    Node { node: NodeId, strong: bool },
}

#[derive(Debug)]
struct Buffer {
    len: usize,
    holds: Vec<Hold>,
    /// Fds installed through fd arrays; closed with the buffer.
    fds: Vec<RawFd>,
    clear: bool,
}

impl Buffer {
    fn close_fds(&self) {
        for &fd in &self.fds {
            let _ = nix::unistd::close(fd);
        }
    }
}

#[derive(Debug)]
struct Txn {
    from_proc: ProcId,
    from_thread: ThreadId,
    to_proc: ProcId,
}

#[derive(Debug, Default)]
struct ThreadRec {
    todo: VecDeque<Work>,
    /// Two-way transactions this thread is serving, innermost last.
    incoming: Vec<TxnId>,
    waiting: Option<TxnId>,
    registered: bool,
    entered: bool,
}

impl ThreadRec {
    fn is_looper(&self) -> bool { self.registered || self.entered }
}

#[derive(Debug)]
struct Proc {
    region: Arc<SharedRegion>,
    /// Region offset -> length.
    allocations: BTreeMap<usize, usize>,
    buffers: HashMap<u64, Buffer>,
    refs: BTreeMap<u32, Ref>,
    handles: HashMap<NodeId, u32>,
    todo: VecDeque<Work>,
    threads: HashMap<ThreadId, ThreadRec>,
    max_threads: u32,
    requested_threads: u32,
    started_threads: u32,
    idle_threads: u32,
    spam_detection: bool,
    dead: bool,
}

impl Proc {
    fn new(region: Arc<SharedRegion>) -> Self {
        Self {
            region,
            allocations: BTreeMap::new(),
            buffers: HashMap::new(),
            refs: BTreeMap::new(),
            handles: HashMap::new(),
            todo: VecDeque::new(),
            threads: HashMap::new(),
            max_threads: 0,
            requested_threads: 0,
            started_threads: 0,
            idle_threads: 0,
            spam_detection: false,
            dead: false,
        }
    }

    /// First fit; every buffer gets at least 8 bytes so its address is unique.
    fn allocate(&mut self, len: usize) -> Option<u64> {
        let len = align8(len.max(8));
        let mut at = 0;
        for (&start, &size) in &self.allocations {
            if start - at >= len {
                break;
            }
            at = start + size;
        }
        if at + len > self.region.len() {
            return None;
        }
        self.allocations.insert(at, len);
        Some(self.region.base() + at as u64)
    }

    fn deallocate(&mut self, addr: u64) {
        let offset = (addr - self.region.base()) as usize;
        self.allocations.remove(&offset);
    }

    fn push_thread(&mut self, tid: ThreadId, work: Work) {
        match self.threads.get_mut(&tid) {
            Some(t) => t.todo.push_back(work),
            None => log::debug!("dropping {work:?}: thread gone"),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    procs: HashMap<ProcId, Proc>,
    nodes: HashMap<NodeId, Node>,
    node_index: HashMap<(ProcId, u64), NodeId>,
    txns: HashMap<TxnId, Txn>,
    context_manager: Option<NodeId>,
    next_proc: ProcId,
    next_node: NodeId,
    next_txn: TxnId,
}

impl State {
    fn add_process(&mut self, region: Arc<SharedRegion>) -> ProcId {
        self.next_proc += 1;
        self.procs.insert(self.next_proc, Proc::new(region));
        self.next_proc
    }

    fn live(&mut self, pid: ProcId) -> KResult<&mut Proc> {
        self.procs.get_mut(&pid).filter(|p| !p.dead).ok_or(Errno::EBADF)
    }

    fn is_alive(&self, pid: ProcId) -> bool { self.procs.get(&pid).is_some_and(|p| !p.dead) }

    fn push_thread(&mut self, pid: ProcId, tid: ThreadId, work: Work) {
        if let Some(p) = self.procs.get_mut(&pid) {
            p.push_thread(tid, work);
        }
    }

    // ---- nodes and refs ----

    fn node_for(&mut self, owner: ProcId, ptr: u64, cookie: u64, flags: u32) -> KResult<NodeId> {
        if let Some(&id) = self.node_index.get(&(owner, ptr)) {
            let node = &self.nodes[&id];
            if node.cookie != cookie {
                log::warn!("node {ptr:#x} sent with cookie {cookie:#x}, registered with {:#x}", node.cookie);
                return Err(Errno::EINVAL);
            }
            return Ok(id);
        }
        self.next_node += 1;
        let id = self.next_node;
        self.nodes.insert(
            id,
            Node {
                owner,
                ptr,
                cookie,
                flags,
                internal_strong: 0,
                refs: 0,
                local_strong: 0,
                local_weak: 0,
                has_strong: false,
                has_weak: false,
                queued: false,
            },
        );
        self.node_index.insert((owner, ptr), id);
        Ok(id)
    }

    fn remove_node(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.remove(&id) {
            self.node_index.remove(&(node.owner, node.ptr));
            if self.context_manager == Some(id) {
                self.context_manager = None;
            }
        }
    }

    /// Queues node work for the owner when what it holds no longer matches.
    ///
    /// Increments go to `thread` when it belongs to the owner; everything else
    /// goes to the owner's process queue.
    fn attention(&mut self, id: NodeId, thread: Option<(ProcId, ThreadId)>) {
        let Some(node) = self.nodes.get_mut(&id) else { return };
        let owner = node.owner;
        let Some(proc) = self.procs.get_mut(&owner).filter(|p| !p.dead) else {
            if node.refs == 0 {
                self.remove_node(id);
            }
            return;
        };
        if node.queued {
            return;
        }
        let (strong, weak) = node.wanted();
        if strong == node.has_strong && weak == node.has_weak {
            if node.is_unused() {
                self.remove_node(id);
            }
            return;
        }
        node.queued = true;
        match thread.filter(|&(p, _)| p == owner).and_then(|(_, t)| proc.threads.get_mut(&t)) {
            Some(t) => t.todo.push_back(Work::Node(id)),
            None => proc.todo.push_back(Work::Node(id)),
        }
    }

    /// The node behind `handle`; handle 0 names the context manager even without a ref.
    fn ref_node(&self, pid: ProcId, handle: u32) -> KResult<NodeId> {
        let proc = self.procs.get(&pid).ok_or(Errno::EBADF)?;
        match proc.refs.get(&handle) {
            Some(r) => Ok(r.node),
            None if handle == 0 => self.context_manager.ok_or(Errno::EINVAL),
            None => Err(Errno::EINVAL),
        }
    }

    fn ref_for_node(&mut self, pid: ProcId, node: NodeId) -> KResult<u32> {
        let is_context = self.context_manager == Some(node);
        let proc = self.procs.get_mut(&pid).ok_or(Errno::EBADF)?;
        if let Some(&handle) = proc.handles.get(&node) {
            return Ok(handle);
        }
        let handle = if is_context && !proc.refs.contains_key(&0) {
            0
        } else {
            (1u32..).find(|h| !proc.refs.contains_key(h)).ok_or(Errno::ENOSPC)?
        };
        proc.refs.insert(handle, Ref { node, strong: 0, weak: 0, death: None });
        proc.handles.insert(node, handle);
        if let Some(n) = self.nodes.get_mut(&node) {
            n.refs += 1;
        }
        Ok(handle)
    }

    fn inc_ref(&mut self, pid: ProcId, handle: u32, strong: bool, thread: Option<(ProcId, ThreadId)>) -> KResult<()> {
        let node = self.ref_node(pid, handle)?;
        let handle = self.ref_for_node(pid, node)?;
        let proc = self.procs.get_mut(&pid).ok_or(Errno::EBADF)?;
        let r = proc.refs.get_mut(&handle).ok_or(Errno::EINVAL)?;
        if strong {
            r.strong += 1;
            if r.strong == 1 {
                if let Some(n) = self.nodes.get_mut(&node) {
                    n.internal_strong += 1;
                }
            }
        } else {
            r.weak += 1;
        }
        self.attention(node, thread);
        Ok(())
    }

    fn dec_ref(&mut self, pid: ProcId, handle: u32, strong: bool) -> KResult<()> {
        let proc = self.procs.get_mut(&pid).ok_or(Errno::EBADF)?;
        let r = proc.refs.get_mut(&handle).ok_or(Errno::EINVAL)?;
        let node = r.node;
        if strong {
            r.strong = r.strong.checked_sub(1).ok_or(Errno::EINVAL)?;
            if r.strong == 0 {
                if let Some(n) = self.nodes.get_mut(&node) {
                    n.internal_strong = n.internal_strong.saturating_sub(1);
                }
            }
        } else {
            r.weak = r.weak.checked_sub(1).ok_or(Errno::EINVAL)?;
        }
        if r.strong == 0 && r.weak == 0 {
            proc.refs.remove(&handle);
            proc.handles.remove(&node);
            if let Some(n) = self.nodes.get_mut(&node) {
                n.refs = n.refs.saturating_sub(1);
            }
        }
        self.attention(node, None);
        Ok(())
    }

    fn node_commands(&mut self, id: NodeId, out: &mut Vec<u8>) {
        let Some(node) = self.nodes.get_mut(&id) else { return };
        node.queued = false;
        let (strong, weak) = node.wanted();
        let pc = PtrCookie { ptr: node.ptr, cookie: node.cookie }.encode();
        if weak && !node.has_weak {
            node.has_weak = true;
            node.local_weak += 1;
            push_cmd(out, br::INCREFS, &pc);
        }
        if strong && !node.has_strong {
            node.has_strong = true;
            node.local_strong += 1;
            push_cmd(out, br::ACQUIRE, &pc);
        }
        if !strong && node.has_strong {
            node.has_strong = false;
            push_cmd(out, br::RELEASE, &pc);
        }
        if !weak && node.has_weak {
            node.has_weak = false;
            push_cmd(out, br::DECREFS, &pc);
        }
        if node.is_unused() {
            self.remove_node(id);
        }
    }

    fn become_context_manager(&mut self, pid: ProcId, ptr: u64, cookie: u64, flags: u32) -> KResult<()> {
        if let Some(id) = self.context_manager {
            if self.nodes.get(&id).is_some_and(|n| self.is_alive(n.owner)) {
                return Err(Errno::EBUSY);
            }
        }
        let id = self.node_for(pid, ptr, cookie, flags)?;
        if let Some(node) = self.nodes.get_mut(&id) {
            // Pinned for the owner's lifetime; the owner is never asked to acquire it.
            node.local_strong += 1;
            node.local_weak += 1;
            node.has_strong = true;
            node.has_weak = true;
        }
        self.context_manager = Some(id);
        Ok(())
    }

    // ---- buffers ----

    /// Copies a sender's payload into `to`'s region, translating its objects.
    ///
    /// Returns the buffer address, the offsets address and the security-context
    /// address (0 when none was asked for).
    fn copy_payload(
        &mut self,
        from: ProcId,
        tid: ThreadId,
        to: ProcId,
        tr: &TransactionData,
        buffers_size: u64,
        with_secctx: bool,
    ) -> KResult<(u64, u64, u64)> {
        // SAFETY: the engine's payload spans outlive this write_read.
        let data = unsafe { user_bytes(tr.data_buffer, tr.data_size) }?;
        // SAFETY: as above.
        let raw_offsets = unsafe { user_bytes(tr.data_offsets, tr.offsets_size) }?;
        if raw_offsets.len() % 8 != 0 {
            return Err(Errno::EINVAL);
        }
        let offsets: Vec<usize> = raw_offsets
            .chunks_exact(8)
            .map(|c| u64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as usize)
            .collect();
        let label = with_secctx.then(|| format!("u:r:loopback_{from}:s0\0"));

        let data_len = align8(data.len());
        let offsets_len = align8(raw_offsets.len());
        let sg_len = align8(usize::try_from(buffers_size).map_err(|_| Errno::EINVAL)?);
        let label_len = label.as_ref().map_or(0, |l| align8(l.len()));
        let total = data_len + offsets_len + sg_len + label_len;

        let addr = self.live(to)?.allocate(total).ok_or(Errno::ENOSPC)?;
        let mut image = vec![0u8; align8(total.max(8))];
        image[..data.len()].copy_from_slice(data);
        image[data_len..data_len + raw_offsets.len()].copy_from_slice(raw_offsets);
        let sg = data_len + offsets_len..data_len + offsets_len + sg_len;
        let secctx = match &label {
            Some(label) => {
                image[sg.end..sg.end + label.len()].copy_from_slice(label.as_bytes());
                addr + sg.end as u64
            }
            None => 0,
        };

        let mut holds = Vec::new();
        let mut fds = Vec::new();
        let translated = self.translate(from, tid, to, addr, &mut image, data.len(), &offsets, sg, &mut holds, &mut fds);
        let written = translated.and_then(|()| match self.procs.get(&to) {
            Some(p) => p.region.write(addr, &image[..total.max(8)]).map_err(|_| Errno::EFAULT),
            None => Err(Errno::EBADF),
        });
        if let Err(e) = written {
            for (fd, _) in fds {
                let _ = nix::unistd::close(fd);
            }
            self.release_holds(to, &holds);
            if let Some(p) = self.procs.get_mut(&to) {
                p.deallocate(addr);
            }
            return Err(e);
        }
        let clear = tr.flags.contains(TransactionFlags::CLEAR_BUF);
        if let Some(p) = self.procs.get_mut(&to) {
            let fds = fds.into_iter().filter_map(|(fd, in_array)| in_array.then_some(fd)).collect();
            p.buffers.insert(addr, Buffer { len: total.max(8), holds, fds, clear });
        }
        Ok((addr, addr + data_len as u64, secctx))
    }

    #[allow(clippy::too_many_arguments)]
    fn translate(
        &mut self,
        from: ProcId,
        tid: ThreadId,
        to: ProcId,
        addr: u64,
        image: &mut [u8],
        data_size: usize,
        offsets: &[usize],
        mut sg: std::ops::Range<usize>,
        holds: &mut Vec<Hold>,
        fds: &mut Vec<(RawFd, bool)>,
    ) -> KResult<()> {
        // Image offset and length of each buffer object seen so far, by object index.
        let mut buffers: Vec<Option<(usize, u64)>> = vec![None; offsets.len()];
        let mut min = 0;
        for (index, &off) in offsets.iter().enumerate() {
            let kind = if off >= min && off + 4 <= data_size {
                short(BinderObject::peek_kind(&image[off..]))?
            } else {
                return Err(Errno::EINVAL);
            };
            let size = BinderObject::size_of_kind(kind).ok_or(Errno::EINVAL)?;
            if off + size > data_size {
                return Err(Errno::EINVAL);
            }
            let obj = short(BinderObject::decode(&image[off..off + size]))?;
            let out = match obj {
                BinderObject::Binder { ptr: 0, .. } => obj,
                BinderObject::Binder { weak, ptr, cookie, flags } => {
                    let node = self.node_for(from, ptr, cookie, flags)?;
                    let handle = self.ref_for_node(to, node)?;
                    self.inc_ref(to, handle, !weak, Some((from, tid)))?;
                    holds.push(Hold::Ref { handle, strong: !weak });
                    BinderObject::Handle { weak, handle, cookie: 0, flags }
                }
                BinderObject::Handle { weak, handle, flags, .. } => {
                    let id = self.ref_node(from, handle)?;
                    let node = self.nodes.get_mut(&id).ok_or(Errno::EINVAL)?;
                    if node.owner == to {
                        if weak {
                            node.local_weak += 1;
                        } else {
                            node.local_strong += 1;
                        }
                        let obj = BinderObject::Binder { weak, ptr: node.ptr, cookie: node.cookie, flags: node.flags };
                        holds.push(Hold::Node { node: id, strong: !weak });
                        self.attention(id, None);
                        obj
                    } else {
                        let handle = self.ref_for_node(to, id)?;
                        self.inc_ref(to, handle, !weak, None)?;
                        holds.push(Hold::Ref { handle, strong: !weak });
                        BinderObject::Handle { weak, handle, cookie: 0, flags }
                    }
                }
                BinderObject::Fd { fd, .. } => {
                    let dup = nix::unistd::dup(fd)?;
                    fds.push((dup, false));
                    BinderObject::Fd { fd: dup, cookie: 0 }
                }
                BinderObject::FdArray { num_fds, parent, parent_offset } => {
                    let (at, length) = parent_buffer(&buffers, parent)?;
                    let bytes = num_fds.checked_mul(4).ok_or(Errno::EINVAL)?;
                    if parent_offset.checked_add(bytes).is_none_or(|end| end > length) {
                        return Err(Errno::EINVAL);
                    }
                    for k in 0..num_fds as usize {
                        let slot = at + parent_offset as usize + 4 * k;
                        let fd = i32::from_ne_bytes([image[slot], image[slot + 1], image[slot + 2], image[slot + 3]]);
                        let dup = nix::unistd::dup(fd)?;
                        fds.push((dup, true));
                        image[slot..slot + 4].copy_from_slice(&dup.to_ne_bytes());
                    }
                    obj
                }
                BinderObject::Buffer { flags, buffer, length, parent, parent_offset } => {
                    let len = usize::try_from(length).map_err(|_| Errno::EINVAL)?;
                    if sg.start + align8(len) > sg.end {
                        log::warn!("buffer of {length} bytes overflows the declared scatter-gather size");
                        return Err(Errno::EINVAL);
                    }
                    // SAFETY: the sender's attachment outlives this write_read.
                    let src = unsafe { user_bytes(buffer, length) }?;
                    image[sg.start..sg.start + len].copy_from_slice(src);
                    let target = addr + sg.start as u64;
                    if flags & BINDER_BUFFER_FLAG_HAS_PARENT != 0 {
                        let (at, plen) = parent_buffer(&buffers, parent)?;
                        if plen < 8 || parent_offset > plen - 8 {
                            return Err(Errno::EINVAL);
                        }
                        let slot = at + parent_offset as usize;
                        image[slot..slot + 8].copy_from_slice(&target.to_ne_bytes());
                    }
                    buffers[index] = Some((sg.start, length));
                    sg.start += align8(len);
                    BinderObject::Buffer { flags, buffer: target, length, parent, parent_offset }
                }
            };
            image[off..off + size].copy_from_slice(&out.encode());
            min = off + size;
        }
        Ok(())
    }

    fn release_holds(&mut self, pid: ProcId, holds: &[Hold]) {
        for hold in holds.iter().rev() {
            match *hold {
                Hold::Ref { handle, strong } => {
                    if let Err(e) = self.dec_ref(pid, handle, strong) {
                        log::warn!("releasing buffer ref on handle {handle}: {e}");
                    }
                }
                Hold::Node { node, strong } => {
                    if let Some(n) = self.nodes.get_mut(&node) {
                        if strong {
                            n.local_strong = n.local_strong.saturating_sub(1);
                        } else {
                            n.local_weak = n.local_weak.saturating_sub(1);
                        }
                    }
                    self.attention(node, None);
                }
            }
        }
    }

    fn free_buffer(&mut self, pid: ProcId, addr: u64) -> KResult<()> {
        let proc = self.live(pid)?;
        let buffer = proc.buffers.remove(&addr).ok_or(Errno::EINVAL)?;
        if buffer.clear {
            let _ = proc.region.write(addr, &vec![0; buffer.len]);
        }
        proc.deallocate(addr);
        buffer.close_fds();
        self.release_holds(pid, &buffer.holds);
        Ok(())
    }

    // ---- transactions ----

    fn transaction(&mut self, pid: ProcId, tid: ThreadId, tr: &TransactionData, buffers_size: u64) -> KResult<()> {
        let node_id = match self.ref_node(pid, tr.handle()) {
            Ok(id) => id,
            Err(_) if tr.handle() == 0 => {
                log::debug!("transaction to handle 0 with no context manager");
                self.push_thread(pid, tid, Work::DeadReply);
                return Ok(());
            }
            Err(_) => {
                log::warn!("transaction to unknown handle {}", tr.handle());
                self.push_thread(pid, tid, Work::FailedReply);
                return Ok(());
            }
        };
        let (to, ptr, cookie, flags) = match self.nodes.get(&node_id) {
            Some(n) => (n.owner, n.ptr, n.cookie, n.flags),
            None => return Err(Errno::EINVAL),
        };
        if !self.is_alive(to) {
            self.push_thread(pid, tid, Work::DeadReply);
            return Ok(());
        }

        let one_way = tr.flags.contains(TransactionFlags::ONE_WAY);
        // A nested call back into a process already waiting on this thread goes to
        // the thread that is waiting.
        let route = match one_way {
            true => None,
            false => self.procs.get(&pid).and_then(|p| p.threads.get(&tid)).and_then(|t| {
                t.incoming
                    .iter()
                    .rev()
                    .find_map(|id| self.txns.get(id).filter(|txn| txn.from_proc == to).map(|txn| txn.from_thread))
            }),
        };
        let with_secctx = flags & FLAT_BINDER_FLAG_TXN_SECURITY_CTX != 0;
        let (addr, offsets_at, secctx) = match self.copy_payload(pid, tid, to, tr, buffers_size, with_secctx) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("transaction from process {pid} to {to} failed: {e}");
                self.push_thread(pid, tid, Work::FailedReply);
                return Ok(());
            }
        };
        let out = TransactionData {
            cookie,
            code: tr.code,
            flags: tr.flags,
            sender_pid: if one_way { 0 } else { std::process::id() as i32 },
            sender_euid: nix::unistd::geteuid().as_raw(),
            data_size: tr.data_size,
            offsets_size: tr.offsets_size,
            data_buffer: addr,
            data_offsets: offsets_at,
            ..TransactionData::to_ptr(ptr)
        };
        let txn = (!one_way).then(|| {
            self.next_txn += 1;
            self.txns.insert(self.next_txn, Txn { from_proc: pid, from_thread: tid, to_proc: to });
            self.next_txn
        });
        let spam = one_way
            && self.procs.get(&pid).is_some_and(|p| p.spam_detection)
            && self.procs.get(&to).is_some_and(|p| {
                p.todo.iter().filter(|w| matches!(w, Work::Transaction { txn: None, from, .. } if *from == pid)).count()
                    >= ONEWAY_SPAM_THRESHOLD
            });

        let work = Work::Transaction { tr: out, secctx, txn, from: pid };
        let target = self.live(to)?;
        match route.and_then(|t| target.threads.get_mut(&t)) {
            Some(t) => t.todo.push_back(work),
            None => target.todo.push_back(work),
        }
        let me = self.live(pid)?.threads.entry(tid).or_default();
        me.waiting = txn.or(me.waiting);
        me.todo.push_back(if spam { Work::SpamSuspect } else { Work::Complete });
        Ok(())
    }

    fn reply(&mut self, pid: ProcId, tid: ThreadId, tr: &TransactionData, buffers_size: u64) -> KResult<()> {
        let popped = self.live(pid)?.threads.get_mut(&tid).and_then(|t| t.incoming.pop());
        let Some(id) = popped else {
            log::warn!("BC_REPLY from a thread with no transaction to answer");
            self.push_thread(pid, tid, Work::FailedReply);
            return Ok(());
        };
        let caller = self
            .txns
            .remove(&id)
            .filter(|txn| self.procs.get(&txn.from_proc).is_some_and(|p| !p.dead && p.threads.contains_key(&txn.from_thread)));
        let Some(txn) = caller else {
            self.push_thread(pid, tid, Work::DeadReply);
            return Ok(());
        };
        match self.copy_payload(pid, tid, txn.from_proc, tr, buffers_size, false) {
            Ok((addr, offsets_at, _)) => {
                let out = TransactionData {
                    flags: tr.flags,
                    sender_euid: nix::unistd::geteuid().as_raw(),
                    data_size: tr.data_size,
                    offsets_size: tr.offsets_size,
                    data_buffer: addr,
                    data_offsets: offsets_at,
                    ..TransactionData::to_ptr(0)
                };
                self.push_thread(txn.from_proc, txn.from_thread, Work::Reply(out));
                self.push_thread(pid, tid, Work::Complete);
            }
            Err(e) => {
                log::warn!("reply from process {pid} failed: {e}");
                self.push_thread(txn.from_proc, txn.from_thread, Work::FailedReply);
                self.push_thread(pid, tid, Work::FailedReply);
            }
        }
        Ok(())
    }

    // ---- commands ----

    fn command(&mut self, pid: ProcId, tid: ThreadId, cmd: u32, r: &mut WireReader<'_>) -> KResult<()> {
        log::trace!("process {pid}: {}", bc::name(cmd));
        match cmd {
            bc::INCREFS | bc::ACQUIRE => {
                let handle = short(r.u32())?;
                self.inc_ref(pid, handle, cmd == bc::ACQUIRE, None)
            }
            bc::RELEASE | bc::DECREFS => {
                let handle = short(r.u32())?;
                self.dec_ref(pid, handle, cmd == bc::RELEASE)
            }
            bc::INCREFS_DONE | bc::ACQUIRE_DONE => {
                let pc = short(PtrCookie::decode(r))?;
                let id = *self.node_index.get(&(pid, pc.ptr)).ok_or(Errno::EINVAL)?;
                let node = self.nodes.get_mut(&id).ok_or(Errno::EINVAL)?;
                if node.cookie != pc.cookie {
                    return Err(Errno::EINVAL);
                }
                let count = if cmd == bc::INCREFS_DONE { &mut node.local_weak } else { &mut node.local_strong };
                *count = count.checked_sub(1).ok_or(Errno::EINVAL)?;
                self.attention(id, None);
                Ok(())
            }
            bc::FREE_BUFFER => {
                let addr = short(r.u64())?;
                self.free_buffer(pid, addr)
            }
            bc::TRANSACTION | bc::TRANSACTION_SG | bc::REPLY | bc::REPLY_SG => {
                let tr = short(TransactionData::decode(r))?;
                let buffers_size = match cmd {
                    bc::TRANSACTION_SG | bc::REPLY_SG => short(r.u64())?,
                    _ => 0,
                };
                match cmd {
                    bc::REPLY | bc::REPLY_SG => self.reply(pid, tid, &tr, buffers_size),
                    _ => self.transaction(pid, tid, &tr, buffers_size),
                }
            }
            bc::REGISTER_LOOPER => {
                let proc = self.live(pid)?;
                proc.requested_threads = proc.requested_threads.saturating_sub(1);
                proc.started_threads += 1;
                proc.threads.entry(tid).or_default().registered = true;
                Ok(())
            }
            bc::ENTER_LOOPER => {
                self.live(pid)?.threads.entry(tid).or_default().entered = true;
                Ok(())
            }
            bc::EXIT_LOOPER => {
                let proc = self.live(pid)?;
                let t = proc.threads.entry(tid).or_default();
                if std::mem::take(&mut t.registered) {
                    proc.started_threads = proc.started_threads.saturating_sub(1);
                }
                t.entered = false;
                Ok(())
            }
            bc::REQUEST_DEATH_NOTIFICATION => {
                let handle = short(r.u32())?;
                let cookie = short(r.u64())?;
                self.request_death(pid, handle, cookie)
            }
            bc::CLEAR_DEATH_NOTIFICATION => {
                let handle = short(r.u32())?;
                let cookie = short(r.u64())?;
                self.clear_death(pid, tid, handle, cookie)
            }
            bc::DEAD_BINDER_DONE => short(r.u64()).map(drop),
            bc::ACQUIRE_RESULT => short(r.i32()).map(drop),
            bc::ATTEMPT_ACQUIRE => {
                short(r.bytes(8))?;
                log::warn!("BC_ATTEMPT_ACQUIRE is not supported");
                Ok(())
            }
            _ => Err(Errno::EPROTO),
        }
    }

    fn request_death(&mut self, pid: ProcId, handle: u32, cookie: u64) -> KResult<()> {
        let node = {
            let r = self.live(pid)?.refs.get_mut(&handle).ok_or(Errno::EINVAL)?;
            if r.death.is_some() {
                log::warn!("death notification already requested on handle {handle}");
                return Ok(());
            }
            r.death = Some(cookie);
            r.node
        };
        let owner_dead = self.nodes.get(&node).is_none_or(|n| !self.is_alive(n.owner));
        if owner_dead {
            self.live(pid)?.todo.push_back(Work::DeadBinder(cookie));
        }
        Ok(())
    }

    fn clear_death(&mut self, pid: ProcId, tid: ThreadId, handle: u32, cookie: u64) -> KResult<()> {
        let proc = self.live(pid)?;
        let r = proc.refs.get_mut(&handle).ok_or(Errno::EINVAL)?;
        if r.death != Some(cookie) {
            log::warn!("no death notification {cookie:#x} on handle {handle}");
            return Err(Errno::EINVAL);
        }
        r.death = None;
        match proc.threads.get_mut(&tid).filter(|t| t.is_looper()) {
            Some(t) => t.todo.push_back(Work::ClearDone(cookie)),
            None => proc.todo.push_back(Work::ClearDone(cookie)),
        }
        Ok(())
    }

    // ---- reading ----

    fn available_for_proc_work(&self, pid: ProcId, tid: ThreadId) -> bool {
        self.procs.get(&pid).and_then(|p| p.threads.get(&tid)).is_some_and(|t| {
            t.incoming.is_empty() && t.waiting.is_none() && t.todo.is_empty() && t.is_looper()
        })
    }

    /// Moves as much queued work as fits into a read buffer of `cap` bytes.
    fn fill(&mut self, pid: ProcId, tid: ThreadId, cap: usize) -> KResult<Option<Vec<u8>>> {
        let proc_work = self.available_for_proc_work(pid, tid);
        let mut out = br::NOOP.to_ne_bytes().to_vec();
        let mut took_proc_transaction = false;
        loop {
            let proc = self.live(pid)?;
            let thread = proc.threads.entry(tid).or_default();
            let from_thread = !thread.todo.is_empty();
            let need = match (from_thread, proc_work) {
                (true, _) => thread.todo.front().map(Work::max_len),
                (false, true) => proc.todo.front().map(Work::max_len),
                (false, false) => None,
            };
            // Keep room for a trailing BR_SPAWN_LOOPER.
            if need.is_none_or(|n| out.len() + n + 4 > cap) {
                break;
            }
            let work = if from_thread { thread.todo.pop_front() } else { proc.todo.pop_front() };
            let Some(work) = work else { break };
            let is_transaction = matches!(work, Work::Transaction { .. });
            if self.deliver(pid, tid, work, &mut out)? {
                took_proc_transaction = is_transaction && !from_thread;
                break;
            }
        }
        if out.len() == 4 {
            return Ok(None);
        }
        if took_proc_transaction {
            let proc = self.live(pid)?;
            let looper = proc.threads.get(&tid).is_some_and(ThreadRec::is_looper);
            if looper
                && proc.requested_threads == 0
                && proc.idle_threads == 0
                && proc.started_threads < proc.max_threads
            {
                proc.requested_threads += 1;
                out.extend_from_slice(&br::SPAWN_LOOPER.to_ne_bytes());
            }
        }
        Ok(Some(out))
    }

    /// Encodes one work item; true when the read must end after it.
    fn deliver(&mut self, pid: ProcId, tid: ThreadId, work: Work, out: &mut Vec<u8>) -> KResult<bool> {
        let ends = match work {
            Work::Complete => {
                push_cmd(out, br::TRANSACTION_COMPLETE, &[]);
                false
            }
            Work::SpamSuspect => {
                push_cmd(out, br::ONEWAY_SPAM_SUSPECT, &[]);
                false
            }
            Work::Transaction { tr, secctx, txn, .. } => {
                if let Some(id) = txn {
                    self.live(pid)?.threads.entry(tid).or_default().incoming.push(id);
                }
                if secctx != 0 {
                    push_cmd(out, br::TRANSACTION_SEC_CTX, &tr.encode());
                    out.extend_from_slice(&secctx.to_ne_bytes());
                } else {
                    push_cmd(out, br::TRANSACTION, &tr.encode());
                }
                true
            }
            Work::Reply(tr) => {
                self.live(pid)?.threads.entry(tid).or_default().waiting = None;
                push_cmd(out, br::REPLY, &tr.encode());
                true
            }
            Work::DeadReply => {
                self.live(pid)?.threads.entry(tid).or_default().waiting = None;
                push_cmd(out, br::DEAD_REPLY, &[]);
                true
            }
            Work::FailedReply => {
                self.live(pid)?.threads.entry(tid).or_default().waiting = None;
                push_cmd(out, br::FAILED_REPLY, &[]);
                true
            }
            Work::Node(id) => {
                self.node_commands(id, out);
                false
            }
            Work::DeadBinder(cookie) => {
                push_cmd(out, br::DEAD_BINDER, &cookie.to_ne_bytes());
                // Obituaries may start transactions of their own.
                true
            }
            Work::ClearDone(cookie) => {
                push_cmd(out, br::CLEAR_DEATH_NOTIFICATION_DONE, &cookie.to_ne_bytes());
                false
            }
        };
        Ok(ends)
    }

    // ---- teardown ----

    fn thread_exit(&mut self, pid: ProcId, tid: ThreadId) {
        let Some(proc) = self.procs.get_mut(&pid) else { return };
        let Some(thread) = proc.threads.remove(&tid) else { return };
        if thread.registered {
            proc.started_threads = proc.started_threads.saturating_sub(1);
        }
        let mut abandoned = thread.incoming;
        for work in thread.todo {
            match work {
                Work::Node(id) => {
                    if let Some(n) = self.nodes.get_mut(&id) {
                        n.queued = false;
                    }
                    self.attention(id, None);
                }
                Work::DeadBinder(_) | Work::ClearDone(_) => {
                    if let Some(p) = self.procs.get_mut(&pid) {
                        p.todo.push_back(work);
                    }
                }
                Work::Transaction { txn: Some(id), .. } => abandoned.push(id),
                _ => {}
            }
        }
        for id in abandoned {
            if let Some(txn) = self.txns.remove(&id) {
                self.push_thread(txn.from_proc, txn.from_thread, Work::DeadReply);
            }
        }
    }

    fn kill(&mut self, pid: ProcId) {
        let Some(proc) = self.procs.get_mut(&pid) else { return };
        if proc.dead {
            return;
        }
        log::debug!("loopback process {pid} is exiting");
        proc.dead = true;
        proc.todo.clear();
        proc.threads.clear();
        let buffers: Vec<Buffer> = proc.buffers.drain().map(|(_, b)| b).collect();
        for buffer in buffers {
            buffer.close_fds();
            self.release_holds(pid, &buffer.holds);
        }

        let refs = match self.procs.get_mut(&pid) {
            Some(p) => {
                p.handles.clear();
                std::mem::take(&mut p.refs)
            }
            None => BTreeMap::new(),
        };
        for r in refs.values() {
            if let Some(n) = self.nodes.get_mut(&r.node) {
                n.refs = n.refs.saturating_sub(1);
                if r.strong > 0 {
                    n.internal_strong = n.internal_strong.saturating_sub(1);
                }
            }
            self.attention(r.node, None);
        }

        let doomed: Vec<TxnId> =
            self.txns.iter().filter(|(_, t)| t.to_proc == pid || t.from_proc == pid).map(|(&id, _)| id).collect();
        for id in doomed {
            if let Some(txn) = self.txns.remove(&id) {
                if txn.to_proc == pid && txn.from_proc != pid {
                    self.push_thread(txn.from_proc, txn.from_thread, Work::DeadReply);
                }
            }
        }

        let owned: Vec<NodeId> = self.nodes.iter().filter(|(_, n)| n.owner == pid).map(|(&id, _)| id).collect();
        for (_, proc) in self.procs.iter_mut().filter(|(_, p)| !p.dead) {
            for r in proc.refs.values() {
                if let Some(cookie) = r.death.filter(|_| owned.contains(&r.node)) {
                    proc.todo.push_back(Work::DeadBinder(cookie));
                }
            }
        }
        for id in owned {
            if self.context_manager == Some(id) {
                self.context_manager = None;
            }
            if self.nodes.get(&id).is_some_and(|n| n.refs == 0) {
                self.remove_node(id);
            }
        }
    }
}

#[derive(Debug)]
struct Kernel {
    state: Mutex<State>,
    wake: Condvar,
    idle_timeout: Option<Duration>,
}

impl Kernel {
    fn kill(&self, pid: ProcId) {
        lock(&self.state).kill(pid);
        self.wake.notify_all();
    }
}

/// One gateway's view of the loopback.
#[derive(Debug)]
struct LoopbackDriver {
    kernel: Arc<Kernel>,
    pid: ProcId,
    region: Arc<SharedRegion>,
}

impl LoopbackDriver {
    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> KResult<T>) -> KResult<T> {
        let mut st = lock(&self.kernel.state);
        st.live(self.pid)?;
        let result = f(&mut st);
        drop(st);
        self.kernel.wake.notify_all();
        result
    }
}

impl Driver for LoopbackDriver {
    fn version(&self) -> nix::Result<i32> { self.with_state(|_| Ok(BINDER_CURRENT_PROTOCOL_VERSION)) }

    fn write_read(&self, write: &[u8], read: &mut [u8]) -> nix::Result<Transfer> {
        let tid = std::thread::current().id();
        let mut st = lock(&self.kernel.state);
        st.live(self.pid)?.threads.entry(tid).or_default();
        let mut r = WireReader::new(write);
        while r.remaining() >= 4 {
            let Ok(cmd) = r.u32() else { break };
            match st.command(self.pid, tid, cmd, &mut r) {
                Ok(()) => {}
                Err(Errno::EPROTO) => {
                    log::warn!("malformed {} from loopback process {}", bc::name(cmd), self.pid);
                    break;
                }
                Err(e) => log::warn!("{} from loopback process {} failed: {e}", bc::name(cmd), self.pid),
            }
        }
        self.kernel.wake.notify_all();
        let written = Transfer { write_consumed: write.len(), read_consumed: 0 };
        if read.is_empty() {
            return Ok(written);
        }

        let mut idle_since: Option<Instant> = None;
        loop {
            if let Some(out) = st.fill(self.pid, tid, read.len())? {
                read[..out.len()].copy_from_slice(&out);
                drop(st);
                self.kernel.wake.notify_all();
                return Ok(Transfer { read_consumed: out.len(), ..written });
            }
            let for_proc = st.available_for_proc_work(self.pid, tid);
            let helper = st.live(self.pid)?.threads.get(&tid).is_some_and(|t| t.registered);
            let timeout = match self.kernel.idle_timeout {
                Some(limit) if for_proc && helper => {
                    let since = *idle_since.get_or_insert_with(Instant::now);
                    match limit.checked_sub(since.elapsed()).filter(|left| !left.is_zero()) {
                        Some(left) => Some(left),
                        None => {
                            let mut out = br::NOOP.to_ne_bytes().to_vec();
                            push_cmd(&mut out, br::FINISHED, &[]);
                            read[..out.len()].copy_from_slice(&out);
                            return Ok(Transfer { read_consumed: out.len(), ..written });
                        }
                    }
                }
                _ => None,
            };
            if for_proc {
                st.live(self.pid)?.idle_threads += 1;
            }
            st = match timeout {
                Some(left) => {
                    self.kernel.wake.wait_timeout(st, left).map_or_else(|e| e.into_inner().0, |(guard, _)| guard)
                }
                None => self.kernel.wake.wait(st).unwrap_or_else(PoisonError::into_inner),
            };
            if for_proc {
                if let Some(p) = st.procs.get_mut(&self.pid) {
                    p.idle_threads = p.idle_threads.saturating_sub(1);
                }
            }
        }
    }

    fn set_max_threads(&self, max: u32) -> nix::Result<()> {
        self.with_state(|st| {
            st.live(self.pid)?.max_threads = max;
            Ok(())
        })
    }

    fn enable_oneway_spam_detection(&self, enable: bool) -> nix::Result<()> {
        self.with_state(|st| {
            st.live(self.pid)?.spam_detection = enable;
            Ok(())
        })
    }

    fn set_context_manager_ext(&self, obj: &BinderObject) -> nix::Result<()> {
        let BinderObject::Binder { ptr, cookie, flags, .. } = *obj else {
            return Err(Errno::EINVAL);
        };
        self.with_state(|st| st.become_context_manager(self.pid, ptr, cookie, flags))
    }

    fn set_context_manager(&self) -> nix::Result<()> {
        self.with_state(|st| st.become_context_manager(self.pid, 0, 0, 0))
    }

    fn node_debug_info(&self, ptr: u64) -> nix::Result<NodeDebugInfo> {
        self.with_state(|st| {
            let next = st.nodes.values().filter(|n| n.owner == self.pid && n.ptr > ptr).min_by_key(|n| n.ptr);
            Ok(next.map_or_else(NodeDebugInfo::default, |n| NodeDebugInfo {
                ptr: n.ptr,
                cookie: n.cookie,
                has_strong_ref: n.has_strong as u32,
                has_weak_ref: n.has_weak as u32,
            }))
        })
    }

    fn node_info_for_ref(&self, handle: u32) -> nix::Result<NodeInfoForRef> {
        self.with_state(|st| {
            let id = st.live(self.pid)?.refs.get(&handle).map(|r| r.node).ok_or(Errno::EINVAL)?;
            let node = st.nodes.get(&id).ok_or(Errno::EINVAL)?;
            Ok(NodeInfoForRef {
                handle,
                strong_count: node.internal_strong + node.local_strong,
                weak_count: node.refs + node.local_weak,
                ..Default::default()
            })
        })
    }

    fn thread_exit(&self) -> nix::Result<()> {
        let tid = std::thread::current().id();
        self.with_state(|st| {
            st.thread_exit(self.pid, tid);
            Ok(())
        })
    }

    fn region(&self) -> Option<Arc<SharedRegion>> { Some(self.region.clone()) }
}

impl Drop for LoopbackDriver {
    fn drop(&mut self) { self.kernel.kill(self.pid); }
}

/// A driver instance shared by the gateways opened on it.
///
/// Dropping the loopback kills every process still open on it.
#[derive(Debug)]
pub struct Loopback {
    kernel: Arc<Kernel>,
    gateways: Mutex<Vec<(Weak<ProcessState>, ProcId)>>,
}

impl Default for Loopback {
    fn default() -> Self { Self::new() }
}

impl Loopback {
    pub fn new() -> Self { Self::build(None) }

    /// Helper pool threads are sent `BR_FINISHED` after idling this long.
    pub fn with_idle_timeout(timeout: Duration) -> Self { Self::build(Some(timeout)) }

    fn build(idle_timeout: Option<Duration>) -> Self {
        let kernel = Kernel { state: Mutex::new(State::default()), wake: Condvar::new(), idle_timeout };
        Self { kernel: Arc::new(kernel), gateways: Mutex::new(Vec::new()) }
    }

    /// Opens a gateway as a new emulated process. `config.driver_path` is ignored.
    pub fn open(&self, config: ProcessConfig) -> Result<Arc<ProcessState>> {
        let region = Arc::new(SharedRegion::heap(config.mmap_size));
        let pid = lock(&self.kernel.state).add_process(region.clone());
        let driver = Arc::new(LoopbackDriver { kernel: self.kernel.clone(), pid, region });
        let process = ProcessState::with_driver(driver, config)?;
        let mut gateways = lock(&self.gateways);
        gateways.retain(|(w, _)| w.strong_count() > 0);
        gateways.push((Arc::downgrade(&process), pid));
        Ok(process)
    }

    /// Makes `process` exit as far as every other process can tell: its nodes die,
    /// calls into it fail with `BR_DEAD_REPLY`, and its own threads see `EBADF`.
    pub fn kill(&self, process: &Arc<ProcessState>) {
        let pid = lock(&self.gateways)
            .iter()
            .find(|(w, _)| std::ptr::eq(w.as_ptr(), Arc::as_ptr(process)))
            .map(|&(_, pid)| pid);
        match pid {
            Some(pid) => self.kernel.kill(pid),
            None => log::warn!("{process:?} was not opened on this loopback"),
        }
    }
}

impl Drop for Loopback {
    fn drop(&mut self) {
        let pids: Vec<ProcId> = lock(&self.gateways).iter().map(|&(_, pid)| pid).collect();
        for pid in pids {
            self.kernel.kill(pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProcessConfig { ProcessConfig { mmap_size: 64 * 1024, ..Default::default() } }

    #[test]
    fn allocator_reuses_freed_space() {
        let mut proc = Proc::new(Arc::new(SharedRegion::heap(64)));
        let a = proc.allocate(20).unwrap();
        let b = proc.allocate(8).unwrap();
        assert_eq!(b - a, 24);
        assert!(proc.allocate(40).is_none());
        proc.deallocate(a);
        assert_eq!(proc.allocate(16), Some(a));
        assert_eq!(proc.allocate(0), Some(a + 16));
    }

    #[test]
    fn second_context_manager_is_refused_while_first_lives() {
        let lb = Loopback::new();
        let first = lb.open(config()).unwrap();
        let second = lb.open(config()).unwrap();
        first.become_context_manager().unwrap();
        assert!(second.become_context_manager().is_err());
        lb.kill(&first);
        second.become_context_manager().unwrap();
    }

    #[test]
    fn killed_process_sees_ebadf() {
        let lb = Loopback::new();
        let p = lb.open(config()).unwrap();
        lb.kill(&p);
        assert_eq!(p.driver().version(), Err(Errno::EBADF));
    }

    #[test]
    fn call_to_missing_context_manager_is_dead() {
        let lb = Loopback::new();
        let p = lb.open(config()).unwrap();
        let proxy = p.context_object().expect("handle 0 proxy");
        let err = crate::Binder::from(proxy).ping().unwrap_err();
        assert!(err.is(crate::StatusCode::DeadObject));
    }

    #[test]
    fn spam_flag_needs_a_backlog() {
        let mut st = State::default();
        let a = st.add_process(Arc::new(SharedRegion::heap(4096)));
        let b = st.add_process(Arc::new(SharedRegion::heap(4096)));
        st.procs.get_mut(&a).unwrap().spam_detection = true;
        let tid = std::thread::current().id();
        let node = st.node_for(b, 0x1000, 0x2000, 0).unwrap();
        let handle = st.ref_for_node(a, node).unwrap();
        st.inc_ref(a, handle, true, None).unwrap();
        let tr = TransactionData { flags: TransactionFlags::ONE_WAY, ..TransactionData::to_handle(handle) };
        for _ in 0..ONEWAY_SPAM_THRESHOLD {
            st.transaction(a, tid, &tr, 0).unwrap();
        }
        let todo = &st.procs[&a].threads[&tid].todo;
        assert!(todo.iter().all(|w| matches!(w, Work::Complete)));
        st.transaction(a, tid, &tr, 0).unwrap();
        assert!(matches!(st.procs[&a].threads[&tid].todo.back(), Some(Work::SpamSuspect)));
    }
}
