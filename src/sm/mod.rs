// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libna contributors
//
// Shared-memory transport plugin. Messages move through a per-session copy
// pool indexed by 8-byte headers on shared ring buffers; one-sided
// transfers go through cross-process vector I/O. A single poll set
// integrates the listener socket, per-peer handshake sockets and notify
// descriptors.

pub(crate) mod addr;
pub(crate) mod pool;
pub(crate) mod ring;
pub(crate) mod rma;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::context::NaContext;
use crate::error::{NaResult, NaStatus};
use crate::event;
use crate::plugin::{
    MemAccess, NaAddr, NaCallback, NaCbInfo, NaCbPayload, NaCompletion, NaInfo,
    NaInitInfo, NaMemHandle, NaOpId, NaPlugin, NaPluginEntry, NaSegment, ProgressMode,
};
use crate::poll::{PollEvent, PollSet};
use crate::shm::ShmRegion;
use crate::spin_lock::{adaptive_yield, SpinLock};

use addr::{PairName, SmAddr, SockState};
use pool::{POOL_SHM_SIZE, POOL_SLOT_SIZE};
use ring::RING_SHM_SIZE;
use rma::{RmaDir, SmMemHandle};

/// Maximum payload of a single message, bounded by one pool slot.
const MAX_UNEXPECTED_SIZE: usize = POOL_SLOT_SIZE;
const MAX_EXPECTED_SIZE: usize = MAX_UNEXPECTED_SIZE;

/// Minimum spacing between accepted connections.
const ACCEPT_INTERVAL_MS: u64 = 100;

/// Op status bits.
const OP_COMPLETED: u32 = 1 << 0;
const OP_CANCELED: u32 = 1 << 1;
const OP_QUEUED: u32 = 1 << 2;

/// Per-process listener id counter.
static NEXT_SM_ID: AtomicU32 = AtomicU32::new(0);

// ---------------------------------------------------------------------------
// Message header
// ---------------------------------------------------------------------------

/// Operation type carried in completion records and message headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum CbType {
    Lookup = 1,
    SendUnexpected = 2,
    RecvUnexpected = 3,
    SendExpected = 4,
    RecvExpected = 5,
    Put = 6,
    Get = 7,
}

/// 8-byte wire header: bits 0-3 type, 4-11 buffer index, 12-27 buffer
/// size, 28-59 tag, 60-63 reserved. The type is never zero, so a zero
/// word can serve as an empty sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MsgHeader {
    pub msg_type: u8,
    pub buf_idx: u8,
    pub buf_size: u16,
    pub tag: u32,
}

impl MsgHeader {
    pub fn pack(self) -> u64 {
        (u64::from(self.msg_type) & 0xf)
            | (u64::from(self.buf_idx) << 4)
            | (u64::from(self.buf_size) << 12)
            | (u64::from(self.tag) << 28)
    }

    pub fn unpack(val: u64) -> Self {
        Self {
            msg_type: (val & 0xf) as u8,
            buf_idx: ((val >> 4) & 0xff) as u8,
            buf_size: ((val >> 12) & 0xffff) as u16,
            tag: ((val >> 28) & 0xffff_ffff) as u32,
        }
    }
}

// ---------------------------------------------------------------------------
// Operation ids
// ---------------------------------------------------------------------------

#[derive(Default)]
struct OpInner {
    cb_type: Option<CbType>,
    context: Option<NaContext>,
    callback: Option<NaCallback>,
    addr: Option<Arc<SmAddr>>,
    /// Payload retained for sends parked on the retry queue.
    send_payload: Vec<u8>,
    /// Posted receive buffer, handed back through the completion info.
    recv_buf: Vec<u8>,
    buf_size: usize,
    actual_size: usize,
    tag: u32,
}

/// Reusable operation id.
///
/// `ref_count` implements the claim protocol: 1 means free, the posting
/// path CASes it to 2 and the release hook brings it back. `status` holds
/// the `COMPLETED`/`CANCELED`/`QUEUED` bits and is deliberately separate
/// from the count.
pub(crate) struct SmOp {
    status: AtomicU32,
    ref_count: AtomicU32,
    inner: Mutex<OpInner>,
}

impl SmOp {
    fn new() -> Self {
        Self {
            status: AtomicU32::new(OP_COMPLETED),
            ref_count: AtomicU32::new(1),
            inner: Mutex::new(OpInner::default()),
        }
    }

    /// Claim the op for a new operation. Fails `Busy` while the previous
    /// operation has not completed; then spins until the release hook has
    /// restored the count to 1.
    fn claim(&self) -> NaResult<()> {
        if self.status.load(Ordering::Acquire) & OP_COMPLETED == 0 {
            return Err(NaStatus::Busy);
        }
        let mut k = 0u32;
        while self
            .ref_count
            .compare_exchange(1, 2, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            adaptive_yield(&mut k);
        }
        Ok(())
    }

    fn is_queued(&self) -> bool {
        self.status.load(Ordering::Acquire) & OP_QUEUED != 0
    }
}

/// An unexpected message that arrived before a matching receive was
/// posted; payload staged out of the pool into the heap.
struct UnexpectedInfo {
    addr: Arc<SmAddr>,
    buf: Vec<u8>,
    tag: u32,
}

/// Tag attached to every poll-set registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollKind {
    Accept,
    Sock,
    Notify,
}

#[derive(Clone)]
struct PollData {
    addr: Arc<SmAddr>,
    kind: PollKind,
}

// ---------------------------------------------------------------------------
// Plugin class state
// ---------------------------------------------------------------------------

pub(crate) struct SmClass {
    username: String,
    self_addr: Arc<SmAddr>,
    poll_set: PollSet,
    poll_data: SpinLock<HashMap<u64, PollData>>,
    accepted_addrs: SpinLock<Vec<Arc<SmAddr>>>,
    poll_addrs: SpinLock<Vec<Arc<SmAddr>>>,
    unexpected_msgs: SpinLock<VecDeque<UnexpectedInfo>>,
    lookup_ops: SpinLock<Vec<Arc<SmOp>>>,
    unexpected_ops: SpinLock<VecDeque<Arc<SmOp>>>,
    expected_ops: SpinLock<Vec<Arc<SmOp>>>,
    retry_ops: SpinLock<VecDeque<Arc<SmOp>>>,
    copy_buf_lock: SpinLock<()>,
    last_accept: SpinLock<Option<Instant>>,
    no_wait: bool,
    no_retry: bool,
}

impl SmClass {
    fn initialize(
        _info: &NaInfo,
        listen: bool,
        init_info: &NaInitInfo,
    ) -> NaResult<Arc<SmClass>> {
        let pid = unsafe { libc::getpid() };
        let id = NEXT_SM_ID.fetch_add(1, Ordering::AcqRel);
        let self_addr = Arc::new(SmAddr::new_self(pid, id));

        let class = Arc::new(SmClass {
            username: addr::username(),
            self_addr: Arc::clone(&self_addr),
            poll_set: PollSet::new()?,
            poll_data: SpinLock::new(HashMap::new()),
            accepted_addrs: SpinLock::new(Vec::new()),
            poll_addrs: SpinLock::new(Vec::new()),
            unexpected_msgs: SpinLock::new(VecDeque::new()),
            lookup_ops: SpinLock::new(Vec::new()),
            unexpected_ops: SpinLock::new(VecDeque::new()),
            expected_ops: SpinLock::new(Vec::new()),
            retry_ops: SpinLock::new(VecDeque::new()),
            copy_buf_lock: SpinLock::new(()),
            last_accept: SpinLock::new(None),
            no_wait: init_info.progress_mode.contains(ProgressMode::NO_BLOCK),
            no_retry: init_info.progress_mode.contains(ProgressMode::NO_RETRY),
        });

        if listen {
            class.setup_shm()?;
        }

        // Local wakeup so trigger waiters see our own completions.
        #[cfg(target_os = "linux")]
        {
            let fd = event::notify_create()?;
            self_addr.local_notify.store(fd, Ordering::Release);
        }
        #[cfg(not(target_os = "linux"))]
        {
            let mut fds = [0 as libc::c_int; 2];
            if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
                return Err(NaStatus::from_errno());
            }
            for fd in fds {
                unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) };
            }
            self_addr.local_notify.store(fds[0], Ordering::Release);
            self_addr.remote_notify.store(fds[1], Ordering::Release);
        }
        class.poll_register(PollKind::Notify, &self_addr)?;

        debug!("sm class up, addr sm://{pid}/{id}, listen={listen}");
        Ok(class)
    }

    /// Listener setup: copy pool, socket directory tree, listen socket.
    fn setup_shm(&self) -> NaResult<()> {
        let pid = self.self_addr.pid.load(Ordering::Relaxed);
        let id = self.self_addr.id.load(Ordering::Relaxed);

        let region = ShmRegion::create(
            &addr::shm_name(&self.username, pid, id),
            POOL_SHM_SIZE,
        )?;
        addr::pool_view(&region).init();
        self.self_addr.shared.lock().copy_pool = Some(Arc::new(region));

        let dir = addr::sock_dir(&self.username, pid, id);
        let sock = addr::create_sock(&dir, true)?;
        self.self_addr.sock.store(sock, Ordering::Release);

        self.poll_register(PollKind::Accept, &self.self_addr)
    }

    // -- poll-set registration ------------------------------------------------

    fn poll_fd(kind: PollKind, sm_addr: &SmAddr) -> i32 {
        match kind {
            PollKind::Accept | PollKind::Sock => sm_addr.sock.load(Ordering::Acquire),
            PollKind::Notify => sm_addr.local_notify.load(Ordering::Acquire),
        }
    }

    fn poll_register(&self, kind: PollKind, sm_addr: &Arc<SmAddr>) -> NaResult<()> {
        let fd = Self::poll_fd(kind, sm_addr);
        self.poll_set.add(fd, fd as u64)?;
        self.poll_data.lock().insert(
            fd as u64,
            PollData {
                addr: Arc::clone(sm_addr),
                kind,
            },
        );
        Ok(())
    }

    fn poll_deregister(&self, kind: PollKind, sm_addr: &SmAddr) {
        let fd = Self::poll_fd(kind, sm_addr);
        if fd == -1 {
            return;
        }
        let _ = self.poll_set.remove(fd);
        self.poll_data.lock().remove(&(fd as u64));
    }

    // -- address lifecycle ----------------------------------------------------

    /// Release one reference; tear the address down at zero.
    fn addr_release(&self, sm_addr: &Arc<SmAddr>) {
        if sm_addr.ref_decr() > 0 {
            return;
        }
        self.addr_teardown(sm_addr);
    }

    fn addr_teardown(&self, sm_addr: &Arc<SmAddr>) {
        if sm_addr.released.swap(true, Ordering::AcqRel) {
            return;
        }

        if sm_addr.accepted {
            self.accepted_addrs
                .lock()
                .retain(|a| !Arc::ptr_eq(a, sm_addr));
        }

        self.poll_deregister(PollKind::Notify, sm_addr);

        let local = sm_addr.local_notify.swap(-1, Ordering::AcqRel);
        let remote = sm_addr.remote_notify.swap(-1, Ordering::AcqRel);

        if !sm_addr.is_self {
            self.poll_deregister(PollKind::Sock, sm_addr);
            self.poll_addrs.lock().retain(|a| !Arc::ptr_eq(a, sm_addr));

            #[cfg(not(target_os = "linux"))]
            {
                let shared = sm_addr.shared.lock();
                let local_path = shared.local_fifo.clone();
                let remote_path = shared.remote_fifo.clone();
                drop(shared);
                if local != -1 {
                    event::notify_destroy(local, local_path.as_deref().and_then(|p| p.to_str()));
                }
                if remote != -1 {
                    event::notify_destroy(remote, remote_path.as_deref().and_then(|p| p.to_str()));
                }
            }
            #[cfg(target_os = "linux")]
            {
                if local != -1 {
                    event::notify_destroy(local, None);
                }
                if remote != -1 {
                    event::notify_destroy(remote, None);
                }
            }

            let sock = sm_addr.sock.swap(-1, Ordering::AcqRel);
            if sock != -1 {
                addr::close_sock(sock, None);
            }
        } else {
            if local != -1 {
                event::notify_destroy(local, None);
            }
            if remote != -1 {
                event::notify_destroy(remote, None);
            }

            let listening = sm_addr.shared.lock().copy_pool.is_some();
            let sock = sm_addr.sock.swap(-1, Ordering::AcqRel);
            if listening {
                self.poll_deregister_accept_fd(sock);
                if sock != -1 {
                    let pid = sm_addr.pid.load(Ordering::Relaxed);
                    let id = sm_addr.id.load(Ordering::Relaxed);
                    addr::close_sock(sock, Some(&addr::sock_dir(&self.username, pid, id)));
                }
            }
        }

        // Unmap rings and pool; owned regions unlink their names.
        let mut shared = sm_addr.shared.lock();
        shared.send_ring = None;
        shared.recv_ring = None;
        shared.copy_pool = None;
    }

    /// Accept registrations are keyed by the raw fd, which is already
    /// cleared from the address at teardown time.
    fn poll_deregister_accept_fd(&self, fd: i32) {
        if fd == -1 {
            return;
        }
        let _ = self.poll_set.remove(fd);
        self.poll_data.lock().remove(&(fd as u64));
    }

    // -- op lifecycle ---------------------------------------------------------

    fn op_claim_and_reset(&self, op: &Arc<SmOp>, cb_type: CbType) -> NaResult<()> {
        op.claim()?;
        let mut inner = op.inner.lock().unwrap();
        *inner = OpInner {
            cb_type: Some(cb_type),
            ..OpInner::default()
        };
        Ok(())
    }

    /// Roll back a failed post so the op id stays reusable.
    fn op_unclaim(&self, op: &Arc<SmOp>) {
        let mut inner = op.inner.lock().unwrap();
        let addr = inner.addr.take();
        inner.callback = None;
        inner.context = None;
        drop(inner);
        if let Some(addr) = addr {
            self.addr_release(&addr);
        }
        op.status.store(OP_COMPLETED, Ordering::Release);
        op.ref_count.store(1, Ordering::Release);
    }

    /// Release hook run by trigger after the user callback: detach the
    /// address edge and make the op id claimable again.
    fn release_op(self: &Arc<Self>, op: &Arc<SmOp>) {
        if op.status.load(Ordering::Acquire) & OP_COMPLETED == 0 {
            warn!("releasing resources from an uncompleted operation");
        }
        let mut inner = op.inner.lock().unwrap();
        let addr = inner.addr.take();
        inner.send_payload = Vec::new();
        drop(inner);
        if let Some(addr) = addr {
            self.addr_release(&addr);
        }
        op.ref_count.store(1, Ordering::Release);
    }

    /// Move a finished op onto its context's completion pipeline.
    fn complete(self: &Arc<Self>, op: &Arc<SmOp>, ret: NaResult<()>) -> NaResult<()> {
        let canceled =
            op.status.fetch_or(OP_COMPLETED, Ordering::AcqRel) & OP_CANCELED != 0;
        let ret = if canceled { Err(NaStatus::Canceled) } else { ret };

        let mut inner = op.inner.lock().unwrap();
        let cb_type = inner.cb_type.ok_or(NaStatus::Fault)?;
        let context = inner.context.take().ok_or(NaStatus::Fault)?;
        let callback = inner.callback.take();

        let payload = match cb_type {
            CbType::Lookup => {
                let sm_addr = inner.addr.clone().ok_or(NaStatus::Fault)?;
                NaCbPayload::Lookup {
                    addr: NaAddr(sm_addr),
                }
            }
            CbType::SendUnexpected => NaCbPayload::SendUnexpected,
            CbType::SendExpected => NaCbPayload::SendExpected,
            CbType::RecvUnexpected => {
                let mut buf = std::mem::take(&mut inner.recv_buf);
                if canceled {
                    buf.truncate(0);
                    NaCbPayload::RecvUnexpected {
                        buf,
                        source: None,
                        tag: 0,
                    }
                } else {
                    buf.truncate(inner.actual_size);
                    let sm_addr = inner.addr.clone().ok_or(NaStatus::Fault)?;
                    // The user's source handle holds its own reference.
                    sm_addr.ref_incr();
                    NaCbPayload::RecvUnexpected {
                        buf,
                        source: Some(NaAddr(sm_addr)),
                        tag: inner.tag,
                    }
                }
            }
            CbType::RecvExpected => {
                let mut buf = std::mem::take(&mut inner.recv_buf);
                buf.truncate(if canceled { 0 } else { inner.actual_size });
                NaCbPayload::RecvExpected { buf }
            }
            CbType::Put => NaCbPayload::Put,
            CbType::Get => NaCbPayload::Get,
        };
        drop(inner);

        let release = {
            let class = Arc::clone(self);
            let op = Arc::clone(op);
            Box::new(move || class.release_op(&op))
        };
        context.completion_add(NaCompletion {
            callback,
            info: NaCbInfo { ret, payload },
            release: Some(release),
        });
        Ok(())
    }

    // -- send path ------------------------------------------------------------

    fn signal_self(&self) -> NaResult<()> {
        #[cfg(target_os = "linux")]
        let fd = self.self_addr.local_notify.load(Ordering::Acquire);
        #[cfg(not(target_os = "linux"))]
        let fd = self.self_addr.remote_notify.load(Ordering::Acquire);
        event::notify_set(fd)
    }

    /// Publish a reserved pool slot: push the header onto the peer's ring,
    /// wake the peer, complete the send, wake ourselves.
    fn msg_insert(self: &Arc<Self>, op: &Arc<SmOp>, idx: usize) -> NaResult<()> {
        let inner = op.inner.lock().unwrap();
        let sm_addr = inner.addr.clone().ok_or(NaStatus::Fault)?;
        let header = MsgHeader {
            msg_type: inner.cb_type.ok_or(NaStatus::Fault)? as u8,
            buf_idx: idx as u8,
            buf_size: inner.buf_size as u16,
            tag: inner.tag,
        };
        drop(inner);

        let send_region = sm_addr
            .shared
            .lock()
            .send_ring
            .clone()
            .ok_or(NaStatus::ProtocolError)?;
        if !addr::ring_view(&send_region).push(header.pack()) {
            return Err(NaStatus::ProtocolError);
        }

        if !self.no_wait {
            event::notify_set(sm_addr.remote_notify.load(Ordering::Acquire))?;
        }

        self.complete(op, Ok(()))?;

        if !self.no_wait {
            self.signal_self()?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn msg_send(
        self: &Arc<Self>,
        cb_type: CbType,
        context: &NaContext,
        callback: NaCallback,
        buf: &[u8],
        dest: &NaAddr,
        tag: u32,
        op_id: &NaOpId,
    ) -> NaResult<()> {
        if buf.len() > MAX_UNEXPECTED_SIZE {
            return Err(NaStatus::Overflow);
        }
        let sm_addr = dest.downcast::<SmAddr>()?;
        let op = op_id.downcast::<SmOp>()?;

        self.op_claim_and_reset(&op, cb_type)?;
        {
            let mut inner = op.inner.lock().unwrap();
            inner.context = Some(context.clone());
            inner.callback = Some(callback);
            sm_addr.ref_incr();
            inner.addr = Some(Arc::clone(&sm_addr));
            inner.buf_size = buf.len();
            inner.actual_size = buf.len();
            inner.tag = tag;
        }
        op.status.store(0, Ordering::Release);

        let pool_region = match sm_addr.shared.lock().copy_pool.clone() {
            Some(region) => region,
            None => {
                self.op_unclaim(&op);
                return Err(NaStatus::ProtocolError);
            }
        };
        let pool = addr::pool_view(&pool_region);

        match pool.reserve_and_copy(&self.copy_buf_lock, buf) {
            Ok(idx) => {
                if let Err(e) = self.msg_insert(&op, idx) {
                    pool.release(idx);
                    self.op_unclaim(&op);
                    return Err(e);
                }
                Ok(())
            }
            Err(NaStatus::Again) => {
                if self.no_retry {
                    self.op_unclaim(&op);
                    return Err(NaStatus::Again);
                }
                debug!("pool full, queueing send for retry");
                let mut inner = op.inner.lock().unwrap();
                inner.send_payload = buf.to_vec();
                drop(inner);
                let mut retry = self.retry_ops.lock();
                retry.push_back(Arc::clone(&op));
                op.status.fetch_or(OP_QUEUED, Ordering::AcqRel);
                Ok(())
            }
            Err(e) => {
                self.op_unclaim(&op);
                Err(e)
            }
        }
    }

    /// Drain the retry queue head for as long as pool slots keep coming.
    fn progress_retries(self: &Arc<Self>) -> NaResult<()> {
        loop {
            let op = match self.retry_ops.lock().front() {
                Some(op) => Arc::clone(op),
                None => break,
            };

            let (pool_region, reserve_result) = {
                let inner = op.inner.lock().unwrap();
                let sm_addr = inner.addr.clone().ok_or(NaStatus::Fault)?;
                let region = sm_addr
                    .shared
                    .lock()
                    .copy_pool
                    .clone()
                    .ok_or(NaStatus::Fault)?;
                let result = addr::pool_view(&region)
                    .reserve_and_copy(&self.copy_buf_lock, &inner.send_payload);
                (region, result)
            };
            let pool = addr::pool_view(&pool_region);
            let idx = match reserve_result {
                Ok(idx) => idx,
                Err(NaStatus::Again) => break,
                Err(e) => return Err(e),
            };

            let mut canceled = false;
            {
                let mut retry = self.retry_ops.lock();
                if op.status.load(Ordering::Acquire) & OP_CANCELED != 0 {
                    canceled = true;
                    pool.release(idx);
                } else if retry
                    .front()
                    .map(|front| Arc::ptr_eq(front, &op))
                    .unwrap_or(false)
                {
                    retry.pop_front();
                    op.status.fetch_and(!OP_QUEUED, Ordering::AcqRel);
                } else {
                    // Someone else removed it meanwhile; give the slot back.
                    pool.release(idx);
                    continue;
                }
            }

            if !canceled {
                self.msg_insert(&op, idx)?;
            }
        }
        Ok(())
    }

    // -- receive path ---------------------------------------------------------

    fn msg_recv_unexpected(
        self: &Arc<Self>,
        context: &NaContext,
        callback: NaCallback,
        buf: Vec<u8>,
        op_id: &NaOpId,
    ) -> NaResult<()> {
        if buf.len() > MAX_UNEXPECTED_SIZE {
            return Err(NaStatus::Overflow);
        }
        let op = op_id.downcast::<SmOp>()?;
        self.op_claim_and_reset(&op, CbType::RecvUnexpected)?;
        {
            let mut inner = op.inner.lock().unwrap();
            inner.context = Some(context.clone());
            inner.callback = Some(callback);
            inner.buf_size = buf.len();
            inner.recv_buf = buf;
        }
        op.status.store(0, Ordering::Release);

        // A message may already be staged from before this was posted.
        let staged = self.unexpected_msgs.lock().pop_front();
        if let Some(staged) = staged {
            {
                let mut inner = op.inner.lock().unwrap();
                let n = staged.buf.len().min(inner.buf_size);
                inner.recv_buf[..n].copy_from_slice(&staged.buf[..n]);
                inner.actual_size = n;
                inner.tag = staged.tag;
                // The staged reference transfers to the op.
                inner.addr = Some(staged.addr);
            }
            self.complete(&op, Ok(()))
        } else {
            let mut queue = self.unexpected_ops.lock();
            queue.push_back(Arc::clone(&op));
            op.status.fetch_or(OP_QUEUED, Ordering::AcqRel);
            Ok(())
        }
    }

    fn msg_recv_expected(
        self: &Arc<Self>,
        context: &NaContext,
        callback: NaCallback,
        buf: Vec<u8>,
        source: &NaAddr,
        tag: u32,
        op_id: &NaOpId,
    ) -> NaResult<()> {
        if buf.len() > MAX_EXPECTED_SIZE {
            return Err(NaStatus::Overflow);
        }
        let sm_addr = source.downcast::<SmAddr>()?;
        let op = op_id.downcast::<SmOp>()?;
        self.op_claim_and_reset(&op, CbType::RecvExpected)?;
        {
            let mut inner = op.inner.lock().unwrap();
            inner.context = Some(context.clone());
            inner.callback = Some(callback);
            sm_addr.ref_incr();
            inner.addr = Some(sm_addr);
            inner.buf_size = buf.len();
            inner.recv_buf = buf;
            inner.tag = tag;
        }
        op.status.store(0, Ordering::Release);

        // Expected messages are always pre-posted; nothing can have
        // arrived before this call returns.
        let mut queue = self.expected_ops.lock();
        queue.push(Arc::clone(&op));
        op.status.fetch_or(OP_QUEUED, Ordering::AcqRel);
        Ok(())
    }

    fn progress_unexpected(
        self: &Arc<Self>,
        poll_addr: &Arc<SmAddr>,
        header: MsgHeader,
    ) -> NaResult<()> {
        let pool_region = poll_addr
            .shared
            .lock()
            .copy_pool
            .clone()
            .ok_or(NaStatus::ProtocolError)?;
        let pool = addr::pool_view(&pool_region);
        let size = usize::from(header.buf_size);

        let op = {
            let mut queue = self.unexpected_ops.lock();
            let op = queue.pop_front();
            if let Some(op) = &op {
                op.status.fetch_and(!OP_QUEUED, Ordering::AcqRel);
            }
            op
        };

        if let Some(op) = op {
            {
                let mut inner = op.inner.lock().unwrap();
                poll_addr.ref_incr();
                inner.addr = Some(Arc::clone(poll_addr));
                inner.actual_size = size;
                inner.tag = header.tag;
                let n = size.min(inner.buf_size);
                let mut dst = std::mem::take(&mut inner.recv_buf);
                pool.copy_and_release(&self.copy_buf_lock, &mut dst[..n], header.buf_idx.into());
                inner.recv_buf = dst;
            }
            self.complete(&op, Ok(()))
        } else {
            // No receive posted yet: stage the payload on the heap so the
            // pool slot frees immediately.
            let mut buf = vec![0u8; size];
            pool.copy_and_release(&self.copy_buf_lock, &mut buf, header.buf_idx.into());
            poll_addr.ref_incr();
            self.unexpected_msgs.lock().push_back(UnexpectedInfo {
                addr: Arc::clone(poll_addr),
                buf,
                tag: header.tag,
            });
            Ok(())
        }
    }

    fn progress_expected(
        self: &Arc<Self>,
        poll_addr: &Arc<SmAddr>,
        header: MsgHeader,
    ) -> NaResult<()> {
        let op = {
            let mut queue = self.expected_ops.lock();
            let pos = queue.iter().position(|op| {
                let inner = op.inner.lock().unwrap();
                inner.tag == header.tag
                    && inner
                        .addr
                        .as_ref()
                        .map(|a| Arc::ptr_eq(a, poll_addr))
                        .unwrap_or(false)
            });
            match pos {
                Some(pos) => {
                    let op = queue.remove(pos);
                    op.status.fetch_and(!OP_QUEUED, Ordering::AcqRel);
                    op
                }
                None => return Err(NaStatus::ProtocolError),
            }
        };

        let pool_region = poll_addr
            .shared
            .lock()
            .copy_pool
            .clone()
            .ok_or(NaStatus::ProtocolError)?;
        let pool = addr::pool_view(&pool_region);
        let size = usize::from(header.buf_size);
        {
            let mut inner = op.inner.lock().unwrap();
            inner.actual_size = size;
            let n = size.min(inner.buf_size);
            let mut dst = std::mem::take(&mut inner.recv_buf);
            pool.copy_and_release(&self.copy_buf_lock, &mut dst[..n], header.buf_idx.into());
            inner.recv_buf = dst;
        }
        self.complete(&op, Ok(()))
    }

    // -- handshake progress ---------------------------------------------------

    fn progress_accept(self: &Arc<Self>, poll_addr: &Arc<SmAddr>) -> NaResult<bool> {
        if !Arc::ptr_eq(poll_addr, &self.self_addr) {
            return Err(NaStatus::ProtocolError);
        }

        // Rate-limit accepts so a connect storm cannot monopolise progress.
        {
            let mut last = self.last_accept.lock();
            if let Some(stamp) = *last {
                if stamp.elapsed() < Duration::from_millis(ACCEPT_INTERVAL_MS) {
                    return Ok(false);
                }
            }
            *last = Some(Instant::now());
        }

        let listen_fd = self.self_addr.sock.load(Ordering::Acquire);
        let conn_sock = match addr::accept_sock(listen_fd)? {
            Some(fd) => fd,
            None => return Ok(false),
        };

        let self_pid = self.self_addr.pid.load(Ordering::Relaxed);
        let self_id = self.self_addr.id.load(Ordering::Relaxed);
        let conn_id = self.self_addr.conn_id.load(Ordering::Acquire);

        let sm_addr = Arc::new(SmAddr::new_accepted(conn_id));
        sm_addr.sock.store(conn_sock, Ordering::Release);
        sm_addr.shared.lock().copy_pool =
            self.self_addr.shared.lock().copy_pool.clone();

        self.poll_register(PollKind::Sock, &sm_addr)?;

        // Fresh ring pair named after our own (pid, id, conn_id).
        let send_region = ShmRegion::create(
            &addr::ring_name(&self.username, self_pid, self_id, conn_id, PairName::Send),
            RING_SHM_SIZE,
        )?;
        addr::ring_view(&send_region).init();
        let recv_region = ShmRegion::create(
            &addr::ring_name(&self.username, self_pid, self_id, conn_id, PairName::Recv),
            RING_SHM_SIZE,
        )?;
        addr::ring_view(&recv_region).init();
        {
            let mut shared = sm_addr.shared.lock();
            shared.send_ring = Some(Arc::new(send_region));
            shared.recv_ring = Some(Arc::new(recv_region));
        }

        // Notify pair for this session; both ends travel to the peer.
        #[cfg(target_os = "linux")]
        let (local_notify, remote_notify) = (event::notify_create()?, event::notify_create()?);
        #[cfg(not(target_os = "linux"))]
        let (local_notify, remote_notify) = {
            let local_path =
                addr::fifo_name(&self.username, self_pid, self_id, conn_id, PairName::Recv);
            let remote_path =
                addr::fifo_name(&self.username, self_pid, self_id, conn_id, PairName::Send);
            let local = event::notify_create_fifo(local_path.to_str().ok_or(NaStatus::InvalidArg)?)?;
            let remote =
                event::notify_create_fifo(remote_path.to_str().ok_or(NaStatus::InvalidArg)?)?;
            let mut shared = sm_addr.shared.lock();
            shared.local_fifo = Some(local_path);
            shared.remote_fifo = Some(remote_path);
            drop(shared);
            (local, remote)
        };
        sm_addr.local_notify.store(local_notify, Ordering::Release);
        sm_addr.remote_notify.store(remote_notify, Ordering::Release);

        self.poll_register(PollKind::Notify, &sm_addr)?;

        addr::send_conn_id(conn_sock, conn_id, [local_notify, remote_notify])?;
        self.self_addr.conn_id.fetch_add(1, Ordering::AcqRel);

        self.accepted_addrs.lock().push(Arc::clone(&sm_addr));
        debug!("accepted session conn_id={conn_id}");
        Ok(true)
    }

    fn progress_sock(self: &Arc<Self>, poll_addr: &Arc<SmAddr>) -> NaResult<bool> {
        match poll_addr.sock_state() {
            Some(SockState::AddrInfo) => {
                let sock = poll_addr.sock.load(Ordering::Acquire);
                let (pid, id) = match addr::recv_addr_info(sock)? {
                    Some(info) => info,
                    None => return Ok(false),
                };
                poll_addr.pid.store(pid, Ordering::Release);
                poll_addr.id.store(id, Ordering::Release);
                poll_addr.set_sock_state(SockState::Done);

                self.poll_addrs.lock().push(Arc::clone(poll_addr));
                debug!("session peer identified as sm://{pid}/{id}");
                Ok(true)
            }
            Some(SockState::ConnId) => {
                let sock = poll_addr.sock.load(Ordering::Acquire);
                let (conn_id, fds) = match addr::recv_conn_id(sock)? {
                    Some(got) => got,
                    None => return Ok(false),
                };
                poll_addr.conn_id.store(conn_id, Ordering::Release);
                // Invert the pair: what the peer called remote is local here.
                poll_addr.local_notify.store(fds[1], Ordering::Release);
                poll_addr.remote_notify.store(fds[0], Ordering::Release);

                // The peer's send direction is our receive direction.
                let pid = poll_addr.pid.load(Ordering::Relaxed);
                let id = poll_addr.id.load(Ordering::Relaxed);
                let send_region = ShmRegion::open(
                    &addr::ring_name(&self.username, pid, id, conn_id, PairName::Recv),
                    RING_SHM_SIZE,
                )?;
                let recv_region = ShmRegion::open(
                    &addr::ring_name(&self.username, pid, id, conn_id, PairName::Send),
                    RING_SHM_SIZE,
                )?;
                {
                    let mut shared = poll_addr.shared.lock();
                    shared.send_ring = Some(Arc::new(send_region));
                    shared.recv_ring = Some(Arc::new(recv_region));
                }

                self.poll_register(PollKind::Notify, poll_addr)?;
                poll_addr.set_sock_state(SockState::Done);
                self.poll_addrs.lock().push(Arc::clone(poll_addr));

                let op = self.take_lookup_op(poll_addr);
                let op = op.ok_or(NaStatus::ProtocolError)?;
                self.complete(&op, Ok(()))?;
                debug!("session established, conn_id={conn_id}");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn take_lookup_op(&self, poll_addr: &Arc<SmAddr>) -> Option<Arc<SmOp>> {
        let mut queue = self.lookup_ops.lock();
        let pos = queue.iter().position(|op| {
            op.inner
                .lock()
                .unwrap()
                .addr
                .as_ref()
                .map(|a| Arc::ptr_eq(a, poll_addr))
                .unwrap_or(false)
        })?;
        Some(queue.remove(pos))
    }

    fn progress_notify(self: &Arc<Self>, poll_addr: &Arc<SmAddr>) -> NaResult<bool> {
        if Arc::ptr_eq(poll_addr, &self.self_addr) {
            if self.no_wait {
                return Ok(false);
            }
            let fd = poll_addr.local_notify.load(Ordering::Acquire);
            return event::notify_get(fd);
        }

        if !self.no_wait {
            let fd = poll_addr.local_notify.load(Ordering::Acquire);
            if !event::notify_get(fd)? {
                return Ok(false);
            }
        }

        let recv_region = match poll_addr.shared.lock().recv_ring.clone() {
            Some(region) => region,
            None => return Ok(false),
        };
        let ring = addr::ring_view(&recv_region);

        let mut progressed = false;
        while let Some(val) = ring.pop() {
            let header = MsgHeader::unpack(val);
            match header.msg_type {
                t if t == CbType::SendUnexpected as u8 => {
                    self.progress_unexpected(poll_addr, header)?;
                }
                t if t == CbType::SendExpected as u8 => {
                    self.progress_expected(poll_addr, header)?;
                }
                _ => return Err(NaStatus::ProtocolError),
            }
            progressed = true;
        }

        if !self.no_retry {
            self.progress_retries()?;
        }
        Ok(progressed)
    }

    /// Poll error on a peer descriptor: the peer went away. Outstanding
    /// lookups against it surface `ProtocolError`; the address itself is
    /// torn down (idempotent through the refcount).
    fn progress_error(self: &Arc<Self>, poll_addr: &Arc<SmAddr>) -> NaResult<()> {
        if Arc::ptr_eq(poll_addr, &self.self_addr) {
            return Err(NaStatus::ProtocolError);
        }
        if let Some(op) = self.take_lookup_op(poll_addr) {
            self.complete(&op, Err(NaStatus::ProtocolError))?;
        }
        self.addr_release(poll_addr);
        Ok(())
    }

    fn dispatch(self: &Arc<Self>, data: &PollData, error: bool) -> NaResult<bool> {
        if error {
            self.progress_error(&data.addr)?;
            return Ok(true);
        }
        match data.kind {
            PollKind::Accept => self.progress_accept(&data.addr),
            PollKind::Sock => {
                if Arc::ptr_eq(&data.addr, &self.self_addr) {
                    // Self's socket is the listener; routed via Accept.
                    Ok(false)
                } else {
                    self.progress_sock(&data.addr)
                }
            }
            PollKind::Notify => self.progress_notify(&data.addr),
        }
    }

    fn progress(self: &Arc<Self>, timeout_ms: u32) -> NaResult<()> {
        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));
        let mut events: Vec<PollEvent> = Vec::new();

        loop {
            // Drain retries from the progress entry too, so pure one-sided
            // traffic cannot starve parked sends.
            if !self.no_retry {
                self.progress_retries()?;
            }

            let remaining =
                deadline.saturating_duration_since(Instant::now()).as_millis() as u32;
            let mut progressed = false;

            if remaining == 0 {
                // Busy poll: walk every registration once.
                let entries: Vec<PollData> =
                    self.poll_data.lock().values().cloned().collect();
                for data in &entries {
                    progressed |= self.dispatch(data, false)?;
                }
            } else {
                events.clear();
                self.poll_set.wait(remaining, &mut events)?;
                for ev in &events {
                    let data = self.poll_data.lock().get(&ev.token).cloned();
                    // Raced with deregistration.
                    let Some(data) = data else { continue };
                    progressed |= self.dispatch(&data, ev.error)?;
                }
            }

            if progressed {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(NaStatus::Timeout);
            }
        }
    }

    // -- lookup ---------------------------------------------------------------

    fn addr_lookup(
        self: &Arc<Self>,
        context: &NaContext,
        callback: NaCallback,
        name: &str,
        op_id: &NaOpId,
    ) -> NaResult<()> {
        let (pid, id) = addr::parse_name(name)?;
        let op = op_id.downcast::<SmOp>()?;
        self.op_claim_and_reset(&op, CbType::Lookup)?;

        let sm_addr = Arc::new(SmAddr::new_lookup(pid, id));
        {
            let mut inner = op.inner.lock().unwrap();
            inner.context = Some(context.clone());
            inner.callback = Some(callback);
            inner.addr = Some(Arc::clone(&sm_addr));
        }
        op.status.store(0, Ordering::Release);

        let result = (|| {
            let pool_region =
                ShmRegion::open(&addr::shm_name(&self.username, pid, id), POOL_SHM_SIZE)
                    .map_err(|_| NaStatus::ProtocolError)?;
            sm_addr.shared.lock().copy_pool = Some(Arc::new(pool_region));

            let sock = addr::create_sock(&addr::sock_dir(&self.username, pid, id), false)
                .map_err(|_| NaStatus::ProtocolError)?;
            sm_addr.sock.store(sock, Ordering::Release);

            self.lookup_ops.lock().push(Arc::clone(&op));
            self.poll_register(PollKind::Sock, &sm_addr)?;

            let self_pid = self.self_addr.pid.load(Ordering::Relaxed);
            let self_id = self.self_addr.id.load(Ordering::Relaxed);
            addr::send_addr_info(sock, self_pid, self_id)
        })();

        if let Err(e) = result {
            self.lookup_ops.lock().retain(|o| !Arc::ptr_eq(o, &op));
            // Drop the application's reference too; the handle never
            // reached the user.
            sm_addr.ref_decr();
            self.op_unclaim(&op);
            return Err(e);
        }
        Ok(())
    }

    // -- one-sided ------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn rma(
        self: &Arc<Self>,
        dir: RmaDir,
        context: &NaContext,
        callback: NaCallback,
        local: &NaMemHandle,
        local_offset: usize,
        remote: &NaMemHandle,
        remote_offset: usize,
        length: usize,
        remote_addr: &NaAddr,
        op_id: &NaOpId,
    ) -> NaResult<()> {
        let local_handle = local.downcast_ref::<SmMemHandle>()?;
        let remote_handle = remote.downcast_ref::<SmMemHandle>()?;

        let required = match dir {
            RmaDir::Put => MemAccess::WRITE,
            RmaDir::Get => MemAccess::READ,
        };
        if !remote_handle.access.contains(required) {
            return Err(NaStatus::Permission);
        }
        if local_offset + length > local_handle.len
            || remote_offset + length > remote_handle.len
        {
            return Err(NaStatus::InvalidArg);
        }

        let sm_addr = remote_addr.downcast::<SmAddr>()?;
        let op = op_id.downcast::<SmOp>()?;
        let cb_type = match dir {
            RmaDir::Put => CbType::Put,
            RmaDir::Get => CbType::Get,
        };
        self.op_claim_and_reset(&op, cb_type)?;
        {
            let mut inner = op.inner.lock().unwrap();
            inner.context = Some(context.clone());
            inner.callback = Some(callback);
            sm_addr.ref_incr();
            inner.addr = Some(Arc::clone(&sm_addr));
        }
        op.status.store(0, Ordering::Release);

        let local_iov = local_handle.slices_for(local_offset, length);
        let remote_iov = remote_handle.slices_for(remote_offset, length);
        let pid = sm_addr.pid.load(Ordering::Acquire);

        if let Err(e) = rma::vm_transfer(dir, pid, &local_iov, &remote_iov, length) {
            self.op_unclaim(&op);
            return Err(e);
        }

        self.complete(&op, Ok(()))?;
        if !self.no_wait {
            self.signal_self()?;
        }
        Ok(())
    }

    // -- cancel ---------------------------------------------------------------

    fn cancel(self: &Arc<Self>, op_id: &NaOpId) -> NaResult<()> {
        let op = op_id.downcast::<SmOp>()?;

        // A completed op stays completed; cancel is a no-op then.
        if op.status.fetch_or(OP_CANCELED, Ordering::AcqRel) & OP_COMPLETED != 0 {
            return Ok(());
        }
        debug!("canceling operation");

        let cb_type = op.inner.lock().unwrap().cb_type;
        let canceled = match cb_type {
            Some(CbType::RecvUnexpected) => {
                let mut queue = self.unexpected_ops.lock();
                Self::remove_queued_deque(&mut queue, &op)
            }
            Some(CbType::RecvExpected) => {
                let mut queue = self.expected_ops.lock();
                Self::remove_queued_vec(&mut queue, &op)
            }
            Some(CbType::SendUnexpected) | Some(CbType::SendExpected) => {
                let mut queue = self.retry_ops.lock();
                Self::remove_queued_deque(&mut queue, &op)
            }
            // Lookups and one-sided ops cannot be recalled.
            Some(CbType::Lookup) | Some(CbType::Put) | Some(CbType::Get) => false,
            None => return Err(NaStatus::InvalidArg),
        };

        if canceled {
            self.complete(&op, Ok(()))?;
        }
        Ok(())
    }

    fn remove_queued_deque(queue: &mut VecDeque<Arc<SmOp>>, op: &Arc<SmOp>) -> bool {
        if !op.is_queued() {
            return false;
        }
        if let Some(pos) = queue.iter().position(|o| Arc::ptr_eq(o, op)) {
            queue.remove(pos);
            op.status.fetch_and(!OP_QUEUED, Ordering::AcqRel);
            return true;
        }
        false
    }

    fn remove_queued_vec(queue: &mut Vec<Arc<SmOp>>, op: &Arc<SmOp>) -> bool {
        if !op.is_queued() {
            return false;
        }
        if let Some(pos) = queue.iter().position(|o| Arc::ptr_eq(o, op)) {
            queue.remove(pos);
            op.status.fetch_and(!OP_QUEUED, Ordering::AcqRel);
            return true;
        }
        false
    }

    // -- finalize -------------------------------------------------------------

    fn finalize(&self) -> NaResult<()> {
        if !self.lookup_ops.lock().is_empty()
            || !self.unexpected_ops.lock().is_empty()
            || !self.unexpected_msgs.lock().is_empty()
            || !self.expected_ops.lock().is_empty()
            || !self.retry_ops.lock().is_empty()
        {
            return Err(NaStatus::ProtocolError);
        }

        loop {
            let sm_addr = self.accepted_addrs.lock().pop();
            match sm_addr {
                Some(sm_addr) => self.addr_release(&sm_addr),
                None => break,
            }
        }

        self.addr_release(&self.self_addr);
        Ok(())
    }

    fn poll_try_wait(&self) -> bool {
        let addrs = self.poll_addrs.lock();
        for sm_addr in addrs.iter() {
            let region = sm_addr.shared.lock().recv_ring.clone();
            if let Some(region) = region {
                if !addr::ring_view(&region).is_empty() {
                    return false;
                }
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Vtable adapter
// ---------------------------------------------------------------------------

struct SmPlugin(Arc<SmClass>);

impl NaPlugin for SmPlugin {
    fn finalize(&self) -> NaResult<()> {
        self.0.finalize()
    }

    fn op_create(&self) -> NaOpId {
        NaOpId(Arc::new(SmOp::new()))
    }

    fn op_destroy(&self, op_id: &NaOpId) -> NaResult<()> {
        let op = op_id.downcast::<SmOp>()?;
        op.ref_count.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    fn addr_lookup(
        &self,
        context: &NaContext,
        callback: NaCallback,
        name: &str,
        op_id: &NaOpId,
    ) -> NaResult<()> {
        self.0.addr_lookup(context, callback, name, op_id)
    }

    fn addr_free(&self, addr: NaAddr) -> NaResult<()> {
        let sm_addr = addr.downcast::<SmAddr>()?;
        self.0.addr_release(&sm_addr);
        Ok(())
    }

    fn addr_self(&self) -> NaResult<NaAddr> {
        let sm_addr = Arc::clone(&self.0.self_addr);
        sm_addr.ref_incr();
        Ok(NaAddr(sm_addr))
    }

    fn addr_dup(&self, addr: &NaAddr) -> NaResult<NaAddr> {
        let sm_addr = addr.downcast::<SmAddr>()?;
        sm_addr.ref_incr();
        Ok(NaAddr(sm_addr))
    }

    fn addr_cmp(&self, addr1: &NaAddr, addr2: &NaAddr) -> bool {
        match (addr1.downcast::<SmAddr>(), addr2.downcast::<SmAddr>()) {
            (Ok(a), Ok(b)) => {
                a.pid.load(Ordering::Acquire) == b.pid.load(Ordering::Acquire)
                    && a.id.load(Ordering::Acquire) == b.id.load(Ordering::Acquire)
            }
            _ => false,
        }
    }

    fn addr_is_self(&self, addr: &NaAddr) -> bool {
        addr.downcast::<SmAddr>()
            .map(|a| a.is_self)
            .unwrap_or(false)
    }

    fn addr_to_string(&self, addr: &NaAddr) -> NaResult<String> {
        let sm_addr = addr.downcast::<SmAddr>()?;
        Ok(format!(
            "sm://{}/{}",
            sm_addr.pid.load(Ordering::Acquire),
            sm_addr.id.load(Ordering::Acquire)
        ))
    }

    fn msg_max_unexpected_size(&self) -> usize {
        MAX_UNEXPECTED_SIZE
    }

    fn msg_max_expected_size(&self) -> usize {
        MAX_EXPECTED_SIZE
    }

    fn msg_max_tag(&self) -> u32 {
        u32::MAX
    }

    fn msg_send_unexpected(
        &self,
        context: &NaContext,
        callback: NaCallback,
        buf: &[u8],
        dest: &NaAddr,
        tag: u32,
        op_id: &NaOpId,
    ) -> NaResult<()> {
        self.0
            .msg_send(CbType::SendUnexpected, context, callback, buf, dest, tag, op_id)
    }

    fn msg_recv_unexpected(
        &self,
        context: &NaContext,
        callback: NaCallback,
        buf: Vec<u8>,
        op_id: &NaOpId,
    ) -> NaResult<()> {
        self.0.msg_recv_unexpected(context, callback, buf, op_id)
    }

    fn msg_send_expected(
        &self,
        context: &NaContext,
        callback: NaCallback,
        buf: &[u8],
        dest: &NaAddr,
        tag: u32,
        op_id: &NaOpId,
    ) -> NaResult<()> {
        self.0
            .msg_send(CbType::SendExpected, context, callback, buf, dest, tag, op_id)
    }

    fn msg_recv_expected(
        &self,
        context: &NaContext,
        callback: NaCallback,
        buf: Vec<u8>,
        source: &NaAddr,
        tag: u32,
        op_id: &NaOpId,
    ) -> NaResult<()> {
        self.0
            .msg_recv_expected(context, callback, buf, source, tag, op_id)
    }

    fn mem_handle_create(
        &self,
        base: *mut u8,
        len: usize,
        access: MemAccess,
    ) -> NaResult<NaMemHandle> {
        Ok(NaMemHandle(Box::new(SmMemHandle::new(
            vec![NaSegment { base, len }],
            access,
        ))))
    }

    fn mem_handle_create_segments(
        &self,
        segments: &[NaSegment],
        access: MemAccess,
    ) -> NaResult<NaMemHandle> {
        let iov_max = unsafe { libc::sysconf(libc::_SC_IOV_MAX) };
        if iov_max > 0 && segments.len() > iov_max as usize {
            return Err(NaStatus::InvalidArg);
        }
        Ok(NaMemHandle(Box::new(SmMemHandle::new(
            segments.to_vec(),
            access,
        ))))
    }

    fn mem_handle_free(&self, mem_handle: NaMemHandle) -> NaResult<()> {
        mem_handle.downcast_ref::<SmMemHandle>()?;
        Ok(())
    }

    fn mem_handle_serialize_size(&self, mem_handle: &NaMemHandle) -> NaResult<usize> {
        Ok(mem_handle.downcast_ref::<SmMemHandle>()?.serialize_size())
    }

    fn mem_handle_serialize(
        &self,
        buf: &mut [u8],
        mem_handle: &NaMemHandle,
    ) -> NaResult<()> {
        mem_handle.downcast_ref::<SmMemHandle>()?.serialize(buf)
    }

    fn mem_handle_deserialize(&self, buf: &[u8]) -> NaResult<NaMemHandle> {
        Ok(NaMemHandle(Box::new(SmMemHandle::deserialize(buf)?)))
    }

    fn put(
        &self,
        context: &NaContext,
        callback: NaCallback,
        local: &NaMemHandle,
        local_offset: usize,
        remote: &NaMemHandle,
        remote_offset: usize,
        length: usize,
        remote_addr: &NaAddr,
        op_id: &NaOpId,
    ) -> NaResult<()> {
        self.0.rma(
            RmaDir::Put,
            context,
            callback,
            local,
            local_offset,
            remote,
            remote_offset,
            length,
            remote_addr,
            op_id,
        )
    }

    fn get(
        &self,
        context: &NaContext,
        callback: NaCallback,
        local: &NaMemHandle,
        local_offset: usize,
        remote: &NaMemHandle,
        remote_offset: usize,
        length: usize,
        remote_addr: &NaAddr,
        op_id: &NaOpId,
    ) -> NaResult<()> {
        self.0.rma(
            RmaDir::Get,
            context,
            callback,
            local,
            local_offset,
            remote,
            remote_offset,
            length,
            remote_addr,
            op_id,
        )
    }

    fn poll_get_fd(&self) -> Option<std::os::unix::io::RawFd> {
        Some(self.0.poll_set.as_raw_fd())
    }

    fn poll_try_wait(&self) -> bool {
        self.0.poll_try_wait()
    }

    fn progress(&self, timeout_ms: u32) -> NaResult<()> {
        self.0.progress(timeout_ms)
    }

    fn cancel(&self, op_id: &NaOpId) -> NaResult<()> {
        self.0.cancel(op_id)
    }
}

// ---------------------------------------------------------------------------
// Registry hooks
// ---------------------------------------------------------------------------

fn sm_check_protocol(protocol_name: &str) -> bool {
    protocol_name == "sm"
}

fn sm_initialize(
    info: &NaInfo,
    listen: bool,
    init_info: &NaInitInfo,
) -> NaResult<Box<dyn NaPlugin>> {
    let class = SmClass::initialize(info, listen, init_info)?;
    Ok(Box::new(SmPlugin(class)))
}

/// Sweep residue from crashed prior runs of the same user: the socket
/// directory tree and, on Linux, any leftover shm objects under /dev/shm.
fn sm_cleanup() {
    let username = addr::username();
    let _ = std::fs::remove_dir_all(addr::user_dir(&username));

    #[cfg(target_os = "linux")]
    {
        let prefix = format!("{}_{}-", addr::SM_SHM_PREFIX, username);
        if let Ok(entries) = std::fs::read_dir(addr::SM_SHM_PATH) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                if let Some(name) = name.to_str() {
                    if name.starts_with(&prefix) {
                        ShmRegion::unlink_by_name(name);
                    }
                }
            }
        }
    }
}

pub(crate) static PLUGIN_ENTRY: NaPluginEntry = NaPluginEntry {
    name: "na",
    check_protocol: sm_check_protocol,
    initialize: sm_initialize,
    cleanup: Some(sm_cleanup),
};
