// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libna contributors
//
// NA return-code taxonomy. Every fallible operation in the crate returns
// `NaResult`; operations that complete asynchronously surface their final
// status through the completion callback instead.

use std::io;

use thiserror::Error;

/// Status codes shared by the NA front end and its transport plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NaStatus {
    /// An argument failed validation at the API boundary.
    #[error("invalid argument")]
    InvalidArg,
    /// Allocation failed.
    #[error("out of memory")]
    NoMem,
    /// A size limit was exceeded (message too large, buffer too small).
    #[error("overflow")]
    Overflow,
    /// No registered plugin supports the requested protocol.
    #[error("protocol not supported")]
    ProtoNoSupport,
    /// The selected plugin does not implement the requested operation.
    #[error("operation not supported")]
    OpNotSupported,
    /// Transport-level failure (socket, shm, or wire protocol violation).
    #[error("protocol error")]
    ProtocolError,
    /// The resource is still in use (queued completions, un-completed op id).
    #[error("busy")]
    Busy,
    /// Corrupted or inconsistent data was encountered.
    #[error("fault")]
    Fault,
    /// The memory handle does not grant the required access.
    #[error("permission denied")]
    Permission,
    /// A cross-process copy moved fewer bytes than requested.
    #[error("message size mismatch")]
    MsgSize,
    /// The wait expired before anything completed.
    #[error("timeout")]
    Timeout,
    /// The operation was canceled before it could complete.
    #[error("canceled")]
    Canceled,
    /// Transient resource pressure; retry later.
    #[error("resource temporarily unavailable")]
    Again,
}

/// Result alias used throughout the crate.
pub type NaResult<T> = Result<T, NaStatus>;

impl NaStatus {
    /// Map the current `errno` onto the taxonomy, defaulting to
    /// `ProtocolError` for anything without a closer match.
    pub(crate) fn from_errno() -> Self {
        Self::from_io(&io::Error::last_os_error())
    }

    pub(crate) fn from_io(err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EAGAIN) => NaStatus::Again,
            Some(libc::ENOMEM) => NaStatus::NoMem,
            Some(libc::EACCES) | Some(libc::EPERM) => NaStatus::Permission,
            Some(libc::EINVAL) => NaStatus::InvalidArg,
            Some(libc::EMSGSIZE) => NaStatus::MsgSize,
            _ => NaStatus::ProtocolError,
        }
    }
}
