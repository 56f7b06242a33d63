// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libna contributors
//
// One-sided transfers: registered-memory handles, their serialised wire
// form, offset translation into iovec slices, and the cross-process copy
// itself (process_vm_writev/readv on Linux, mach_vm calls on macOS).
//
// Serialised base pointers are only ever interpreted by the kernel in the
// owner's address space; the remote side never dereferences them.

use crate::error::{NaResult, NaStatus};
use crate::plugin::{MemAccess, NaSegment};

/// A registered memory region: a vector of segments plus access flags.
pub(crate) struct SmMemHandle {
    pub segments: Vec<NaSegment>,
    pub access: MemAccess,
    pub len: usize,
}

// Safety: the raw segment bases are opaque tokens here; this process only
// dereferences the ones it registered itself, via the kernel copy calls.
unsafe impl Send for SmMemHandle {}
unsafe impl Sync for SmMemHandle {}

impl SmMemHandle {
    pub fn new(segments: Vec<NaSegment>, access: MemAccess) -> Self {
        let len = segments.iter().map(|s| s.len).sum();
        Self {
            segments,
            access,
            len,
        }
    }

    /// Serialised size: `<iovcnt><flags><len>` plus `(base, len)` per
    /// segment, all native 64-bit words.
    pub fn serialize_size(&self) -> usize {
        3 * 8 + self.segments.len() * 2 * 8
    }

    /// Serialise into `buf`; fails `Overflow` when it does not fit.
    pub fn serialize(&self, buf: &mut [u8]) -> NaResult<()> {
        if buf.len() < self.serialize_size() {
            return Err(NaStatus::Overflow);
        }
        let mut off = 0;
        let mut put = |val: u64, buf: &mut [u8]| {
            buf[off..off + 8].copy_from_slice(&val.to_ne_bytes());
            off += 8;
        };
        put(self.segments.len() as u64, buf);
        put(self.access.bits(), buf);
        put(self.len as u64, buf);
        for seg in &self.segments {
            put(seg.base as u64, buf);
            put(seg.len as u64, buf);
        }
        Ok(())
    }

    /// Reconstruct a handle from its serialised form.
    pub fn deserialize(buf: &[u8]) -> NaResult<SmMemHandle> {
        if buf.len() < 3 * 8 {
            return Err(NaStatus::Overflow);
        }
        let mut off = 0;
        let mut take = || -> NaResult<u64> {
            let bytes = buf
                .get(off..off + 8)
                .ok_or(NaStatus::Overflow)?
                .try_into()
                .unwrap();
            off += 8;
            Ok(u64::from_ne_bytes(bytes))
        };
        let iovcnt = take()? as usize;
        if iovcnt == 0 {
            return Err(NaStatus::Fault);
        }
        let access = MemAccess::from_bits(take()?).ok_or(NaStatus::Fault)?;
        let len = take()? as usize;

        let mut segments = Vec::with_capacity(iovcnt);
        for _ in 0..iovcnt {
            let base = take()? as *mut u8;
            let seg_len = take()? as usize;
            segments.push(NaSegment { base, len: seg_len });
        }

        Ok(SmMemHandle {
            segments,
            access,
            len,
        })
    }

    /// Translate `(offset, length)` into iovec slices over the segment
    /// table: the first slice is trimmed by the intra-segment offset, then
    /// successor segments are emitted until the length is exhausted.
    pub fn translate(&self, offset: usize, length: usize) -> Vec<libc::iovec> {
        let mut start_index = 0;
        let mut seg_offset = offset;
        let mut next_offset = 0;
        for (i, seg) in self.segments.iter().enumerate() {
            next_offset += seg.len;
            if offset < next_offset {
                start_index = i;
                break;
            }
            seg_offset -= seg.len;
        }

        let first = &self.segments[start_index];
        let mut iov = Vec::with_capacity(self.segments.len() - start_index);
        let first_len = length.min(first.len - seg_offset);
        iov.push(libc::iovec {
            iov_base: unsafe { first.base.add(seg_offset) } as *mut libc::c_void,
            iov_len: first_len,
        });
        let mut remaining = length - first_len;

        for seg in &self.segments[start_index + 1..] {
            if remaining == 0 {
                break;
            }
            let seg_len = remaining.min(seg.len);
            iov.push(libc::iovec {
                iov_base: seg.base as *mut libc::c_void,
                iov_len: seg_len,
            });
            remaining -= seg_len;
        }

        iov
    }

    /// Full-handle iovec without translation.
    pub fn as_iovec(&self) -> Vec<libc::iovec> {
        self.segments
            .iter()
            .map(|seg| libc::iovec {
                iov_base: seg.base as *mut libc::c_void,
                iov_len: seg.len,
            })
            .collect()
    }

    /// Slices for a transfer, skipping translation when the whole handle
    /// is moved.
    pub fn slices_for(&self, offset: usize, length: usize) -> Vec<libc::iovec> {
        if offset != 0 || length != self.len {
            self.translate(offset, length)
        } else {
            self.as_iovec()
        }
    }
}

/// Direction of a one-sided transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RmaDir {
    Put,
    Get,
}

/// Cross-process vector copy. `local` is always this process's memory.
/// The byte count must match `length` exactly; a short copy is `MsgSize`.
#[cfg(target_os = "linux")]
pub(crate) fn vm_transfer(
    dir: RmaDir,
    pid: libc::pid_t,
    local: &[libc::iovec],
    remote: &[libc::iovec],
    length: usize,
) -> NaResult<()> {
    let n = match dir {
        RmaDir::Put => unsafe {
            libc::process_vm_writev(
                pid,
                local.as_ptr(),
                local.len() as libc::c_ulong,
                remote.as_ptr(),
                remote.len() as libc::c_ulong,
                0,
            )
        },
        RmaDir::Get => unsafe {
            libc::process_vm_readv(
                pid,
                local.as_ptr(),
                local.len() as libc::c_ulong,
                remote.as_ptr(),
                remote.len() as libc::c_ulong,
                0,
            )
        },
    };
    if n < 0 {
        return Err(NaStatus::from_errno());
    }
    if n as usize != length {
        return Err(NaStatus::MsgSize);
    }
    Ok(())
}

#[cfg(target_os = "macos")]
pub(crate) fn vm_transfer(
    dir: RmaDir,
    pid: libc::pid_t,
    local: &[libc::iovec],
    remote: &[libc::iovec],
    length: usize,
) -> NaResult<()> {
    // Only single-segment transfers map onto the mach primitives.
    if local.len() > 1 || remote.len() > 1 {
        return Err(NaStatus::ProtocolError);
    }

    extern "C" {
        fn mach_task_self() -> libc::c_uint;
        fn task_for_pid(
            target: libc::c_uint,
            pid: libc::pid_t,
            task: *mut libc::c_uint,
        ) -> libc::c_int;
        fn mach_vm_write(
            task: libc::c_uint,
            address: u64,
            data: u64,
            count: libc::c_uint,
        ) -> libc::c_int;
        fn mach_vm_read_overwrite(
            task: libc::c_uint,
            address: u64,
            size: u64,
            data: u64,
            out_size: *mut u64,
        ) -> libc::c_int;
    }

    let mut task: libc::c_uint = 0;
    let kret = unsafe { task_for_pid(mach_task_self(), pid, &mut task) };
    if kret != 0 {
        return Err(NaStatus::Permission);
    }

    match dir {
        RmaDir::Put => {
            let kret = unsafe {
                mach_vm_write(
                    task,
                    remote[0].iov_base as u64,
                    local[0].iov_base as u64,
                    length as libc::c_uint,
                )
            };
            if kret != 0 {
                return Err(NaStatus::ProtocolError);
            }
        }
        RmaDir::Get => {
            let mut nread: u64 = 0;
            let kret = unsafe {
                mach_vm_read_overwrite(
                    task,
                    remote[0].iov_base as u64,
                    length as u64,
                    local[0].iov_base as u64,
                    &mut nread,
                )
            };
            if kret != 0 {
                return Err(NaStatus::ProtocolError);
            }
            if nread as usize != length {
                return Err(NaStatus::MsgSize);
            }
        }
    }
    Ok(())
}
