// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libna contributors
//
// Per-peer notify channel: the primitive a sender uses to make the
// receiver's poll set fire. Linux uses an eventfd; other unixes fall back
// to a named FIFO because kqueue descriptors cannot travel as ancillary
// data, so the FIFO *name* is exchanged during the handshake instead.

use std::os::unix::io::RawFd;

use crate::error::{NaResult, NaStatus};

/// Create an eventfd-style notify descriptor.
#[cfg(target_os = "linux")]
pub fn notify_create() -> NaResult<RawFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
    if fd == -1 {
        return Err(NaStatus::from_errno());
    }
    Ok(fd)
}

/// Create a notify FIFO at `path` and open it non-blocking.
///
/// Opened O_RDWR so the descriptor stays valid with no peer attached.
#[cfg(not(target_os = "linux"))]
pub fn notify_create_fifo(path: &str) -> NaResult<RawFd> {
    let c_path =
        std::ffi::CString::new(path).map_err(|_| NaStatus::InvalidArg)?;
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), libc::S_IRUSR | libc::S_IWUSR) };
    if rc == -1 {
        return Err(NaStatus::from_errno());
    }
    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR) };
    if fd == -1 {
        return Err(NaStatus::from_errno());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) };
    if rc == -1 {
        let status = NaStatus::from_errno();
        unsafe { libc::close(fd) };
        return Err(status);
    }
    Ok(fd)
}

/// Signal the notify descriptor: increment its counter by one.
pub fn notify_set(fd: RawFd) -> NaResult<()> {
    let count: u64 = 1;
    let n = unsafe {
        libc::write(
            fd,
            &count as *const u64 as *const libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    if n != std::mem::size_of::<u64>() as isize {
        return Err(NaStatus::from_errno());
    }
    Ok(())
}

/// Drain the notify descriptor. Returns whether it was signalled.
pub fn notify_get(fd: RawFd) -> NaResult<bool> {
    let mut count: u64 = 0;
    let n = unsafe {
        libc::read(
            fd,
            &mut count as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    if n != std::mem::size_of::<u64>() as isize {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EAGAIN) {
            return Ok(false);
        }
        return Err(NaStatus::from_io(&err));
    }
    Ok(true)
}

/// Close a notify descriptor; for the FIFO fallback also unlink its path.
pub fn notify_destroy(fd: RawFd, fifo_path: Option<&str>) {
    unsafe { libc::close(fd) };
    if let Some(path) = fifo_path {
        if let Ok(c_path) = std::ffi::CString::new(path) {
            unsafe { libc::unlink(c_path.as_ptr()) };
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_drains() {
        let fd = notify_create().expect("eventfd");
        assert!(!notify_get(fd).unwrap());
        notify_set(fd).unwrap();
        notify_set(fd).unwrap();
        assert!(notify_get(fd).unwrap());
        // Counter semantics: one read drains the accumulated count.
        assert!(!notify_get(fd).unwrap());
        notify_destroy(fd, None);
    }
}
