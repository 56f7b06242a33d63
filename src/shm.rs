// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libna contributors
//
// Named POSIX shared-memory regions (shm_open + mmap).
// Used for the copy pool and the per-connection ring buffers, all of which
// have fixed repr(C) wire layouts shared between two processes.

use std::ffi::CString;
use std::ptr;

use crate::error::{NaResult, NaStatus};

/// Host page size, queried once.
pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// A named shared-memory mapping of exactly `size` bytes.
///
/// The creating side owns the name: dropping a region that was `create`d
/// unlinks the backing object, while a region that was `open`ed only
/// unmaps. `size` should be a multiple of the page size; the warning-level
/// check mirrors what the kernel rounds to anyway.
pub struct ShmRegion {
    mem: *mut u8,
    size: usize,
    name: String,
    owner: bool,
}

// Safety: the mapping is process-shared by design; all mutation of shared
// state goes through atomics inside the mapped layouts.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Create a new named region (fails if it already exists).
    pub fn create(name: &str, size: usize) -> NaResult<Self> {
        Self::acquire(name, size, true)
    }

    /// Open an existing named region.
    pub fn open(name: &str, size: usize) -> NaResult<Self> {
        Self::acquire(name, size, false)
    }

    fn acquire(name: &str, size: usize, create: bool) -> NaResult<Self> {
        if name.is_empty() || size == 0 {
            return Err(NaStatus::InvalidArg);
        }
        if size % page_size() != 0 {
            log::warn!("shm region {name} not page aligned ({size} bytes)");
        }

        let c_name = posix_name(name)?;
        let oflag = if create {
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL
        } else {
            libc::O_RDWR
        };

        // c_uint keeps the mode argument valid for the variadic macOS
        // declaration as well.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), oflag, 0o600 as libc::c_uint) };
        if fd == -1 {
            return Err(NaStatus::from_errno());
        }

        if create {
            let rc = unsafe { libc::ftruncate(fd, size as libc::off_t) };
            if rc != 0 {
                let status = NaStatus::from_errno();
                unsafe {
                    libc::close(fd);
                    libc::shm_unlink(c_name.as_ptr());
                }
                return Err(status);
            }
        }

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if mem == libc::MAP_FAILED {
            if create {
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
            }
            return Err(NaStatus::from_errno());
        }

        Ok(Self {
            mem: mem as *mut u8,
            size,
            name: name.to_string(),
            owner: create,
        })
    }

    /// Base pointer of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.mem
    }

    /// Mapped size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The name this region was acquired under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove a named region without an open handle. Missing objects are
    /// silently ignored (crash residue may already be gone).
    pub fn unlink_by_name(name: &str) {
        if let Ok(c_name) = posix_name(name) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
        if self.owner {
            Self::unlink_by_name(&self.name);
        }
    }
}

/// POSIX shm names need a leading '/'.
fn posix_name(name: &str) -> NaResult<CString> {
    let full = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };
    CString::new(full).map_err(|_| NaStatus::InvalidArg)
}
