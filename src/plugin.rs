// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libna contributors
//
// Plugin contract between the NA front end and its transports: the vtable
// trait, the compile-time plugin registry, opaque object handles, and the
// callback/completion payload types.
//
// Optional operations are trait methods with provided bodies; a transport
// that leaves them alone reports `OpNotSupported` (or succeeds as a no-op
// where the front end treats absence as "nothing to do").

use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use bitflags::bitflags;

use crate::context::NaContext;
use crate::error::{NaResult, NaStatus};

bitflags! {
    /// Progress-mode bits accepted at class initialisation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ProgressMode: u32 {
        /// Disable all blocking waits; notify descriptors are neither
        /// written nor drained and `poll_try_wait` always returns false.
        const NO_BLOCK = 1 << 0;
        /// Fail pool-exhausted sends with `Again` instead of queueing them
        /// for retry.
        const NO_RETRY = 1 << 1;
    }
}

bitflags! {
    /// Access rights carried by a registered memory handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemAccess: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl MemAccess {
    pub const READ_ONLY: MemAccess = MemAccess::READ;
    pub const WRITE_ONLY: MemAccess = MemAccess::WRITE;
    pub const READWRITE: MemAccess = MemAccess::READ.union(MemAccess::WRITE);
}

/// Options recognised by `NaClass::initialize_opt`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaInitInfo {
    pub progress_mode: ProgressMode,
}

/// Parsed form of an address/info URI `[<class>+]<protocol>[://[<host>]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NaInfo {
    pub class_name: Option<String>,
    pub protocol_name: String,
    pub host_name: Option<String>,
}

/// One contiguous piece of registered memory.
#[derive(Debug, Clone, Copy)]
pub struct NaSegment {
    pub base: *mut u8,
    pub len: usize,
}

/// Opaque peer address handle. Duplicated and freed through the class.
#[derive(Clone)]
pub struct NaAddr(pub(crate) Arc<dyn Any + Send + Sync>);

/// Opaque operation handle, reusable once the previous operation on it has
/// completed and been released.
#[derive(Clone)]
pub struct NaOpId(pub(crate) Arc<dyn Any + Send + Sync>);

/// Opaque registered-memory handle.
pub struct NaMemHandle(pub(crate) Box<dyn Any + Send + Sync>);

impl NaAddr {
    pub(crate) fn downcast<T: Send + Sync + 'static>(&self) -> NaResult<Arc<T>> {
        Arc::clone(&self.0)
            .downcast::<T>()
            .map_err(|_| NaStatus::InvalidArg)
    }
}

impl NaOpId {
    pub(crate) fn downcast<T: Send + Sync + 'static>(&self) -> NaResult<Arc<T>> {
        Arc::clone(&self.0)
            .downcast::<T>()
            .map_err(|_| NaStatus::InvalidArg)
    }
}

impl NaMemHandle {
    pub(crate) fn downcast_ref<T: 'static>(&self) -> NaResult<&T> {
        self.0.downcast_ref::<T>().ok_or(NaStatus::InvalidArg)
    }
}

/// Typed payload delivered to a completion callback.
pub enum NaCbPayload {
    Lookup {
        addr: NaAddr,
    },
    SendUnexpected,
    RecvUnexpected {
        /// The posted buffer, truncated to the received length.
        buf: Vec<u8>,
        /// Sender address; the receiver owns one reference to it.
        source: Option<NaAddr>,
        tag: u32,
    },
    SendExpected,
    RecvExpected {
        /// The posted buffer, truncated to the received length.
        buf: Vec<u8>,
    },
    Put,
    Get,
}

/// Everything a completion callback gets to see.
pub struct NaCbInfo {
    /// Final status of the operation (`Canceled` when it was canceled).
    pub ret: NaResult<()>,
    pub payload: NaCbPayload,
}

/// User completion callback. The returned value is collected by
/// `NaContext::trigger_collect`.
pub type NaCallback = Box<dyn FnOnce(NaCbInfo) -> i32 + Send + 'static>;

/// A completion record travelling through the context's pipeline.
///
/// `release` runs after the user callback returns; the plugin reclaims the
/// operation's resources there, never earlier.
pub struct NaCompletion {
    pub callback: Option<NaCallback>,
    pub info: NaCbInfo,
    pub release: Option<Box<dyn FnOnce() + Send + 'static>>,
}

/// Transport vtable. Mandatory operations are plain trait methods; optional
/// ones carry provided bodies.
#[allow(clippy::too_many_arguments)]
pub(crate) trait NaPlugin: Send + Sync {
    fn finalize(&self) -> NaResult<()>;

    fn op_create(&self) -> NaOpId;
    fn op_destroy(&self, op_id: &NaOpId) -> NaResult<()>;

    fn addr_lookup(
        &self,
        context: &NaContext,
        callback: NaCallback,
        name: &str,
        op_id: &NaOpId,
    ) -> NaResult<()>;
    fn addr_free(&self, addr: NaAddr) -> NaResult<()>;
    fn addr_self(&self) -> NaResult<NaAddr>;
    fn addr_dup(&self, addr: &NaAddr) -> NaResult<NaAddr>;
    fn addr_cmp(&self, addr1: &NaAddr, addr2: &NaAddr) -> bool;
    fn addr_is_self(&self, addr: &NaAddr) -> bool;
    fn addr_to_string(&self, addr: &NaAddr) -> NaResult<String>;

    /// Optional: transports without a serialisable address form leave
    /// these alone.
    fn addr_serialize(&self, _buf: &mut [u8], _addr: &NaAddr) -> NaResult<()> {
        Err(NaStatus::OpNotSupported)
    }
    fn addr_deserialize(&self, _buf: &[u8]) -> NaResult<NaAddr> {
        Err(NaStatus::OpNotSupported)
    }

    fn msg_max_unexpected_size(&self) -> usize;
    fn msg_max_expected_size(&self) -> usize;
    fn msg_max_tag(&self) -> u32;

    fn msg_send_unexpected(
        &self,
        context: &NaContext,
        callback: NaCallback,
        buf: &[u8],
        dest: &NaAddr,
        tag: u32,
        op_id: &NaOpId,
    ) -> NaResult<()>;
    fn msg_recv_unexpected(
        &self,
        context: &NaContext,
        callback: NaCallback,
        buf: Vec<u8>,
        op_id: &NaOpId,
    ) -> NaResult<()>;
    fn msg_send_expected(
        &self,
        context: &NaContext,
        callback: NaCallback,
        buf: &[u8],
        dest: &NaAddr,
        tag: u32,
        op_id: &NaOpId,
    ) -> NaResult<()>;
    fn msg_recv_expected(
        &self,
        context: &NaContext,
        callback: NaCallback,
        buf: Vec<u8>,
        source: &NaAddr,
        tag: u32,
        op_id: &NaOpId,
    ) -> NaResult<()>;

    fn mem_handle_create(
        &self,
        base: *mut u8,
        len: usize,
        access: MemAccess,
    ) -> NaResult<NaMemHandle>;
    fn mem_handle_create_segments(
        &self,
        _segments: &[NaSegment],
        _access: MemAccess,
    ) -> NaResult<NaMemHandle> {
        Err(NaStatus::OpNotSupported)
    }
    fn mem_handle_free(&self, mem_handle: NaMemHandle) -> NaResult<()>;

    /// Optional: registration is a no-op for transports that need none.
    fn mem_register(&self, _mem_handle: &NaMemHandle) -> NaResult<()> {
        Ok(())
    }
    fn mem_deregister(&self, _mem_handle: &NaMemHandle) -> NaResult<()> {
        Ok(())
    }
    fn mem_publish(&self, _mem_handle: &NaMemHandle) -> NaResult<()> {
        Ok(())
    }
    fn mem_unpublish(&self, _mem_handle: &NaMemHandle) -> NaResult<()> {
        Ok(())
    }

    fn mem_handle_serialize_size(&self, mem_handle: &NaMemHandle) -> NaResult<usize>;
    fn mem_handle_serialize(&self, buf: &mut [u8], mem_handle: &NaMemHandle)
        -> NaResult<()>;
    fn mem_handle_deserialize(&self, buf: &[u8]) -> NaResult<NaMemHandle>;

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
    ) -> NaResult<()>;
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
    ) -> NaResult<()>;

    fn poll_get_fd(&self) -> Option<RawFd> {
        None
    }
    /// Whether it is safe to block on the poll fd (nothing pending).
    fn poll_try_wait(&self) -> bool {
        true
    }

    fn progress(&self, timeout_ms: u32) -> NaResult<()>;
    fn cancel(&self, op_id: &NaOpId) -> NaResult<()>;
}

/// Registry entry for a compiled-in transport.
#[derive(Clone, Copy)]
pub(crate) struct NaPluginEntry {
    pub name: &'static str,
    pub check_protocol: fn(&str) -> bool,
    pub initialize:
        fn(&NaInfo, bool, &NaInitInfo) -> NaResult<Box<dyn NaPlugin>>,
    pub cleanup: Option<fn()>,
}

/// Compile-registered plugin table. SM stays first so it serves as the
/// default for local addresses.
pub(crate) static NA_PLUGIN_TABLE: &[NaPluginEntry] = &[crate::sm::PLUGIN_ENTRY];
