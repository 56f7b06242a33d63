// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libna contributors
//
// SM addressing: peer identity is `(pid, id, conn_id)` where `id`
// disambiguates listeners within one process and `conn_id` disambiguates
// sessions on one listener. Sessions are established over a UNIX socket
// bound under a per-user tmp tree; the handshake exchanges `(pid, id)`,
// then `conn_id` plus the two notify descriptors as SCM_RIGHTS ancillary
// data.

use std::ffi::CStr;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{NaResult, NaStatus};
use crate::shm::ShmRegion;
use crate::spin_lock::SpinLock;

/// Build-time naming constants.
pub(crate) const SM_SHM_PREFIX: &str = "na_sm";
pub(crate) const SM_TMP_DIR: &str = "/tmp";
#[cfg(target_os = "linux")]
pub(crate) const SM_SHM_PATH: &str = "/dev/shm";

pub(crate) const LISTEN_BACKLOG: libc::c_int = 64;

/// Ring/FIFO pair names: "s" is the listener's send direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PairName {
    Send,
    Recv,
}

impl PairName {
    fn as_str(self) -> &'static str {
        match self {
            PairName::Send => "s",
            PairName::Recv => "r",
        }
    }
}

/// Username for namespacing shared objects; falls back to "unknown".
pub(crate) fn username() -> String {
    unsafe {
        let passwd = libc::getpwuid(libc::getuid());
        if passwd.is_null() || (*passwd).pw_name.is_null() {
            return "unknown".to_string();
        }
        CStr::from_ptr((*passwd).pw_name)
            .to_string_lossy()
            .into_owned()
    }
}

/// Copy-pool object name: `<prefix>_<username>-<pid>-<id>`.
pub(crate) fn shm_name(username: &str, pid: libc::pid_t, id: u32) -> String {
    format!("{SM_SHM_PREFIX}_{username}-{pid}-{id}")
}

/// Ring-buffer object name: `<prefix>_<username>-<pid>-<id>-<conn_id>-{s|r}`.
pub(crate) fn ring_name(
    username: &str,
    pid: libc::pid_t,
    id: u32,
    conn_id: u32,
    pair: PairName,
) -> String {
    format!(
        "{SM_SHM_PREFIX}_{username}-{pid}-{id}-{conn_id}-{}",
        pair.as_str()
    )
}

/// Socket directory: `<tmp>/<prefix>_<username>/<pid>/<id>`.
pub(crate) fn sock_dir(username: &str, pid: libc::pid_t, id: u32) -> PathBuf {
    PathBuf::from(SM_TMP_DIR)
        .join(format!("{SM_SHM_PREFIX}_{username}"))
        .join(pid.to_string())
        .join(id.to_string())
}

/// Per-user root directory swept by cleanup.
pub(crate) fn user_dir(username: &str) -> PathBuf {
    PathBuf::from(SM_TMP_DIR).join(format!("{SM_SHM_PREFIX}_{username}"))
}

/// FIFO fallback name: `<sock dir>/fifo-<conn_id>-{s|r}`.
#[cfg(not(target_os = "linux"))]
pub(crate) fn fifo_name(
    username: &str,
    pid: libc::pid_t,
    id: u32,
    conn_id: u32,
    pair: PairName,
) -> PathBuf {
    sock_dir(username, pid, id).join(format!("fifo-{conn_id}-{}", pair.as_str()))
}

/// Handshake state of a peer socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum SockState {
    /// Accepted side: expecting the peer's `(pid, id)`.
    AddrInfo = 1,
    /// Connecting side: expecting `conn_id` and the notify descriptors.
    ConnId = 2,
    Done = 3,
}

/// Everything attached to an address after construction, guarded by a spin
/// lock because the handshake path publishes it while send paths read it.
#[derive(Default)]
pub(crate) struct AddrShared {
    pub copy_pool: Option<Arc<ShmRegion>>,
    pub send_ring: Option<Arc<ShmRegion>>,
    pub recv_ring: Option<Arc<ShmRegion>>,
    #[cfg(not(target_os = "linux"))]
    pub local_fifo: Option<PathBuf>,
    #[cfg(not(target_os = "linux"))]
    pub remote_fifo: Option<PathBuf>,
}

/// A peer (or self) address.
///
/// Reference counted by `ref_count`: every queue edge, in-flight operation
/// and application handle counts one. Transport teardown runs when the
/// count hits zero; the `Arc` only keeps the memory alive for stragglers.
pub(crate) struct SmAddr {
    pub pid: AtomicI32,
    pub id: AtomicU32,
    /// Peer: session id on the listener. Self: next conn_id to hand out.
    pub conn_id: AtomicU32,
    pub is_self: bool,
    pub accepted: bool,
    pub ref_count: AtomicI32,
    pub sock: AtomicI32,
    pub sock_state: AtomicU32,
    pub local_notify: AtomicI32,
    pub remote_notify: AtomicI32,
    pub shared: SpinLock<AddrShared>,
    /// Set once teardown has run so it stays idempotent.
    pub released: AtomicBool,
}

impl SmAddr {
    fn empty(ref_count: i32) -> Self {
        Self {
            pid: AtomicI32::new(0),
            id: AtomicU32::new(0),
            conn_id: AtomicU32::new(0),
            is_self: false,
            accepted: false,
            ref_count: AtomicI32::new(ref_count),
            sock: AtomicI32::new(-1),
            sock_state: AtomicU32::new(0),
            local_notify: AtomicI32::new(-1),
            remote_notify: AtomicI32::new(-1),
            shared: SpinLock::new(AddrShared::default()),
            released: AtomicBool::new(false),
        }
    }

    pub fn new_self(pid: libc::pid_t, id: u32) -> Self {
        let mut addr = Self::empty(1);
        addr.is_self = true;
        addr.pid.store(pid, Ordering::Relaxed);
        addr.id.store(id, Ordering::Relaxed);
        addr
    }

    /// Address created by lookup; one reference for the op, one for the
    /// application.
    pub fn new_lookup(pid: libc::pid_t, id: u32) -> Self {
        let addr = Self::empty(2);
        addr.pid.store(pid, Ordering::Relaxed);
        addr.id.store(id, Ordering::Relaxed);
        addr.sock_state.store(SockState::ConnId as u32, Ordering::Relaxed);
        addr
    }

    /// Address created by accept; pid/id arrive later over the socket.
    pub fn new_accepted(conn_id: u32) -> Self {
        let mut addr = Self::empty(1);
        addr.accepted = true;
        addr.conn_id.store(conn_id, Ordering::Relaxed);
        addr.sock_state.store(SockState::AddrInfo as u32, Ordering::Relaxed);
        addr
    }

    pub fn sock_state(&self) -> Option<SockState> {
        match self.sock_state.load(Ordering::Acquire) {
            1 => Some(SockState::AddrInfo),
            2 => Some(SockState::ConnId),
            3 => Some(SockState::Done),
            _ => None,
        }
    }

    pub fn set_sock_state(&self, state: SockState) {
        self.sock_state.store(state as u32, Ordering::Release);
    }

    pub fn ref_incr(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement and return the remaining count.
    pub fn ref_decr(&self) -> i32 {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

impl Drop for SmAddr {
    fn drop(&mut self) {
        // Backstop for addresses that never went through teardown (error
        // paths before publication); descriptors must not leak.
        if self.released.load(Ordering::Acquire) {
            return;
        }
        for fd_cell in [&self.sock, &self.local_notify, &self.remote_notify] {
            let fd = fd_cell.load(Ordering::Acquire);
            if fd != -1 {
                unsafe { libc::close(fd) };
            }
        }
    }
}

// ---------------------------------------------------------------------------
// UNIX socket plumbing
// ---------------------------------------------------------------------------

fn sun_path_from(dir: &Path) -> NaResult<libc::sockaddr_un> {
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let full = dir.join("sock");
    let bytes = full.as_os_str().as_encoded_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(NaStatus::Overflow);
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes.iter()) {
        *dst = *src as libc::c_char;
    }
    Ok(addr)
}

/// Create the session socket: seqpacket where available, stream elsewhere,
/// always non-blocking. Listening side creates the directory tree, binds
/// `<dir>/sock` and listens; connecting side connects to it.
pub(crate) fn create_sock(dir: &Path, listen: bool) -> NaResult<RawFd> {
    #[cfg(target_os = "linux")]
    let fd = unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    #[cfg(not(target_os = "linux"))]
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd == -1 {
        return Err(NaStatus::from_errno());
    }
    #[cfg(not(target_os = "linux"))]
    {
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) };
        if rc == -1 {
            let status = NaStatus::from_errno();
            unsafe { libc::close(fd) };
            return Err(status);
        }
    }

    let result = (|| {
        let addr = sun_path_from(dir)?;
        let addr_len = std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;

        if listen {
            std::fs::create_dir_all(dir).map_err(|e| NaStatus::from_io(&e))?;
            let rc = unsafe {
                libc::bind(fd, &addr as *const _ as *const libc::sockaddr, addr_len)
            };
            if rc == -1 {
                return Err(NaStatus::from_errno());
            }
            let rc = unsafe { libc::listen(fd, LISTEN_BACKLOG) };
            if rc == -1 {
                return Err(NaStatus::from_errno());
            }
        } else {
            let rc = unsafe {
                libc::connect(fd, &addr as *const _ as *const libc::sockaddr, addr_len)
            };
            if rc == -1 {
                return Err(NaStatus::from_errno());
            }
        }
        Ok(())
    })();

    match result {
        Ok(()) => Ok(fd),
        Err(status) => {
            unsafe { libc::close(fd) };
            Err(status)
        }
    }
}

/// Close a session socket; when `dir` is set also unlink `<dir>/sock` and
/// prune the now-empty directories upward.
pub(crate) fn close_sock(fd: RawFd, dir: Option<&Path>) {
    unsafe { libc::close(fd) };
    if let Some(dir) = dir {
        let _ = std::fs::remove_file(dir.join("sock"));
        let mut current = Some(dir);
        while let Some(d) = current {
            if std::fs::remove_dir(d).is_err() {
                break;
            }
            current = d.parent();
        }
    }
}

/// Accept one pending connection, non-blocking. `None` when nothing is
/// queued.
pub(crate) fn accept_sock(listen_fd: RawFd) -> NaResult<Option<RawFd>> {
    #[cfg(target_os = "linux")]
    let fd = unsafe {
        libc::accept4(
            listen_fd,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    #[cfg(not(target_os = "linux"))]
    let fd = unsafe { libc::accept(listen_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
    if fd == -1 {
        let err = std::io::Error::last_os_error();
        if matches!(err.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK)) {
            return Ok(None);
        }
        return Err(NaStatus::from_io(&err));
    }
    #[cfg(not(target_os = "linux"))]
    {
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) };
        if rc == -1 {
            let status = NaStatus::from_errno();
            unsafe { libc::close(fd) };
            return Err(status);
        }
    }
    Ok(Some(fd))
}

/// Send our `(pid, id)` to the peer.
pub(crate) fn send_addr_info(sock: RawFd, pid: libc::pid_t, id: u32) -> NaResult<()> {
    let mut buf = [0u8; 8];
    buf[..4].copy_from_slice(&pid.to_ne_bytes());
    buf[4..].copy_from_slice(&id.to_ne_bytes());
    let n = unsafe {
        libc::send(sock, buf.as_ptr() as *const libc::c_void, buf.len(), 0)
    };
    if n != buf.len() as isize {
        return Err(NaStatus::from_errno());
    }
    Ok(())
}

/// Receive the peer's `(pid, id)`; `None` when the message has not landed
/// yet.
pub(crate) fn recv_addr_info(sock: RawFd) -> NaResult<Option<(libc::pid_t, u32)>> {
    let mut buf = [0u8; 8];
    let n = unsafe {
        libc::recv(sock, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
    };
    if n == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EAGAIN) {
            return Ok(None);
        }
        return Err(NaStatus::from_io(&err));
    }
    if n != buf.len() as isize {
        return Err(NaStatus::ProtocolError);
    }
    let pid = libc::pid_t::from_ne_bytes(buf[..4].try_into().unwrap());
    let id = u32::from_ne_bytes(buf[4..].try_into().unwrap());
    Ok(Some((pid, id)))
}

/// Ancillary-data buffer sized and aligned for two descriptors.
#[repr(C)]
#[allow(dead_code)]
union CmsgBuf {
    hdr: libc::cmsghdr,
    buf: [u8; 64],
}

const FDS_LEN: usize = 2 * std::mem::size_of::<RawFd>();

/// Send `conn_id` plus the two notify descriptors as SCM_RIGHTS.
pub(crate) fn send_conn_id(sock: RawFd, conn_id: u32, fds: [RawFd; 2]) -> NaResult<()> {
    let mut payload = conn_id.to_ne_bytes();
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    let mut cmsg_buf: CmsgBuf = unsafe { std::mem::zeroed() };

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = unsafe { cmsg_buf.buf.as_mut_ptr() } as *mut libc::c_void;
    msg.msg_controllen = unsafe { libc::CMSG_SPACE(FDS_LEN as u32) } as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(FDS_LEN as u32) as _;
        std::ptr::copy_nonoverlapping(
            fds.as_ptr() as *const u8,
            libc::CMSG_DATA(cmsg),
            FDS_LEN,
        );
    }

    let n = unsafe { libc::sendmsg(sock, &msg, 0) };
    if n == -1 {
        return Err(NaStatus::from_errno());
    }
    Ok(())
}

/// Receive `conn_id` and the two notify descriptors. `None` when the
/// message has not landed yet. The caller swaps local/remote: the peer's
/// "remote" descriptor is our local one.
pub(crate) fn recv_conn_id(sock: RawFd) -> NaResult<Option<(u32, [RawFd; 2])>> {
    let mut payload = [0u8; 4];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    let mut cmsg_buf: CmsgBuf = unsafe { std::mem::zeroed() };

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = unsafe { cmsg_buf.buf.as_mut_ptr() } as *mut libc::c_void;
    msg.msg_controllen = unsafe { libc::CMSG_SPACE(FDS_LEN as u32) } as _;

    let n = unsafe { libc::recvmsg(sock, &mut msg, 0) };
    if n == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EAGAIN) {
            return Ok(None);
        }
        return Err(NaStatus::from_io(&err));
    }

    let mut fds = [-1 as RawFd; 2];
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(NaStatus::ProtocolError);
        }
        std::ptr::copy_nonoverlapping(
            libc::CMSG_DATA(cmsg),
            fds.as_mut_ptr() as *mut u8,
            FDS_LEN,
        );
    }

    let conn_id = u32::from_ne_bytes(payload);
    Ok(Some((conn_id, fds)))
}

/// Turn a pool region pointer into a typed view helper.
pub(crate) fn pool_view(region: &ShmRegion) -> &crate::sm::pool::SmCopyPool {
    unsafe { crate::sm::pool::SmCopyPool::from_ptr(region.as_ptr()) }
}

/// Turn a ring region pointer into a typed view helper.
pub(crate) fn ring_view(region: &ShmRegion) -> &crate::sm::ring::SmRing {
    unsafe { crate::sm::ring::SmRing::from_ptr(region.as_ptr()) }
}

/// Parse the `<pid>/<id>` tail of an SM address string, tolerating a
/// leading `sm://` (the class strips `<class>+` before we see it).
pub(crate) fn parse_name(name: &str) -> NaResult<(libc::pid_t, u32)> {
    let tail = match name.split_once("://") {
        Some((_, tail)) => tail,
        None => name,
    };
    let (pid, id) = tail.split_once('/').ok_or(NaStatus::InvalidArg)?;
    let pid: libc::pid_t = pid.parse().map_err(|_| NaStatus::InvalidArg)?;
    let id: u32 = id.parse().map_err(|_| NaStatus::InvalidArg)?;
    Ok((pid, id))
}
