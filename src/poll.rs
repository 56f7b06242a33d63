// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libna contributors
//
// Poll set: one kernel readiness queue per NA class. Registrations carry a
// u64 token the transport resolves back to a tagged record (accept socket,
// handshake socket, notify fd). The set's own descriptor is exposed so an
// outer runtime can wait on the whole class with a single fd.
//
// Linux: epoll, level-triggered. Other unixes: kqueue with EVFILT_READ.

use std::os::unix::io::RawFd;

use crate::error::{NaResult, NaStatus};

/// A readiness event handed back from `wait`.
#[derive(Debug, Clone, Copy)]
pub struct PollEvent {
    pub token: u64,
    /// Error/hangup condition on the fd (peer went away).
    pub error: bool,
}

/// Maximum events drained per wait call.
const POLL_MAX_EVENTS: usize = 64;

pub struct PollSet {
    fd: RawFd,
}

// Safety: the kernel queue is shared-state safe; registration and waiting
// may happen from different threads.
unsafe impl Send for PollSet {}
unsafe impl Sync for PollSet {}

#[cfg(target_os = "linux")]
impl PollSet {
    pub fn new() -> NaResult<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd == -1 {
            return Err(NaStatus::from_errno());
        }
        Ok(Self { fd })
    }

    /// Register `fd` for read readiness under `token`.
    pub fn add(&self, fd: RawFd, token: u64) -> NaResult<()> {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token,
        };
        let rc = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if rc == -1 {
            return Err(NaStatus::from_errno());
        }
        Ok(())
    }

    /// Remove `fd` from the set.
    pub fn remove(&self, fd: RawFd) -> NaResult<()> {
        let rc = unsafe {
            libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if rc == -1 {
            return Err(NaStatus::from_errno());
        }
        Ok(())
    }

    /// Wait up to `timeout_ms` for readiness, appending events to `out`.
    pub fn wait(&self, timeout_ms: u32, out: &mut Vec<PollEvent>) -> NaResult<()> {
        let mut events: [libc::epoll_event; POLL_MAX_EVENTS] =
            unsafe { std::mem::zeroed() };
        let timeout = timeout_ms.min(i32::MAX as u32) as libc::c_int;
        let n = unsafe {
            libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                POLL_MAX_EVENTS as libc::c_int,
                timeout,
            )
        };
        if n == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(NaStatus::from_io(&err));
        }
        for ev in events.iter().take(n as usize) {
            out.push(PollEvent {
                token: ev.u64,
                error: ev.events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0,
            });
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
impl PollSet {
    pub fn new() -> NaResult<Self> {
        let fd = unsafe { libc::kqueue() };
        if fd == -1 {
            return Err(NaStatus::from_errno());
        }
        Ok(Self { fd })
    }

    pub fn add(&self, fd: RawFd, token: u64) -> NaResult<()> {
        let changes = [libc::kevent {
            ident: fd as libc::uintptr_t,
            filter: libc::EVFILT_READ,
            flags: libc::EV_ADD,
            fflags: 0,
            data: 0,
            udata: token as *mut libc::c_void,
        }];
        let rc = unsafe {
            libc::kevent(self.fd, changes.as_ptr(), 1, std::ptr::null_mut(), 0,
                std::ptr::null())
        };
        if rc == -1 {
            return Err(NaStatus::from_errno());
        }
        Ok(())
    }

    pub fn remove(&self, fd: RawFd) -> NaResult<()> {
        let changes = [libc::kevent {
            ident: fd as libc::uintptr_t,
            filter: libc::EVFILT_READ,
            flags: libc::EV_DELETE,
            fflags: 0,
            data: 0,
            udata: std::ptr::null_mut(),
        }];
        let rc = unsafe {
            libc::kevent(self.fd, changes.as_ptr(), 1, std::ptr::null_mut(), 0,
                std::ptr::null())
        };
        if rc == -1 {
            return Err(NaStatus::from_errno());
        }
        Ok(())
    }

    pub fn wait(&self, timeout_ms: u32, out: &mut Vec<PollEvent>) -> NaResult<()> {
        let ts = libc::timespec {
            tv_sec: (timeout_ms / 1000) as libc::time_t,
            tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
        };
        let mut events: [libc::kevent; POLL_MAX_EVENTS] = unsafe { std::mem::zeroed() };
        let n = unsafe {
            libc::kevent(self.fd, std::ptr::null(), 0, events.as_mut_ptr(),
                POLL_MAX_EVENTS as libc::c_int, &ts)
        };
        if n == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(NaStatus::from_io(&err));
        }
        for ev in events.iter().take(n as usize) {
            out.push(PollEvent {
                token: ev.udata as u64,
                error: ev.flags & libc::EV_EOF != 0,
            });
        }
        Ok(())
    }
}

impl PollSet {
    /// The poll set's own descriptor.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for PollSet {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
