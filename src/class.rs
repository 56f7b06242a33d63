// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libna contributors
//
// NA class: the plugin-dispatch front end. Owns the selected transport,
// validates every call before handing it to the vtable, and serialises
// plugin progress across threads with a cooperative lock so one thread
// drives the transport while the rest wait to be signalled.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use log::debug;

use crate::context::NaContext;
use crate::error::{NaResult, NaStatus};
use crate::plugin::{
    MemAccess, NaAddr, NaCallback, NaInfo, NaInitInfo, NaMemHandle, NaOpId, NaPlugin,
    NaSegment, ProgressMode, NA_PLUGIN_TABLE,
};

/// Class/protocol delimiter in info strings, e.g. "na+sm".
const CLASS_DELIMITER: char = '+';

/// Lock bit of the progress word; the low bits count threads in progress.
const PROGRESS_LOCK: i32 = i32::MIN; // 0x8000_0000

impl NaInfo {
    /// Parse `[<class>+]<protocol>[://[<host>]]`.
    ///
    /// An empty host after `://` is legal; a locator that does not start
    /// with `//` is not.
    pub fn parse(info_string: &str) -> NaResult<NaInfo> {
        if info_string.is_empty() {
            return Err(NaStatus::InvalidArg);
        }

        let (token, locator) = match info_string.split_once(':') {
            Some((t, l)) => (t, Some(l)),
            None => (info_string, None),
        };

        let (class_name, protocol_name) = match token.split_once(CLASS_DELIMITER) {
            Some((class, protocol)) => (Some(class.to_string()), protocol.to_string()),
            None => (None, token.to_string()),
        };

        let host_name = match locator {
            None | Some("") => None,
            Some(locator) => {
                let host = locator
                    .strip_prefix("//")
                    .ok_or(NaStatus::ProtoNoSupport)?;
                if host.is_empty() {
                    None
                } else {
                    Some(host.to_string())
                }
            }
        };

        Ok(NaInfo {
            class_name,
            protocol_name,
            host_name,
        })
    }
}

/// Long-lived per-transport instance.
pub struct NaClass {
    plugin: Box<dyn NaPlugin>,
    class_name: &'static str,
    protocol_name: String,
    listen: bool,
    progress_mode: ProgressMode,
}

impl NaClass {
    /// Initialise a class for `info_string`, optionally listening.
    pub fn initialize(info_string: &str, listen: bool) -> NaResult<NaClass> {
        Self::initialize_opt(info_string, listen, &NaInitInfo::default())
    }

    /// Initialise with explicit options.
    pub fn initialize_opt(
        info_string: &str,
        listen: bool,
        init_info: &NaInitInfo,
    ) -> NaResult<NaClass> {
        if let Ok(level) = std::env::var("HG_NA_LOG_LEVEL") {
            if level == "debug" {
                log::set_max_level(log::LevelFilter::Debug);
            }
        }

        let info = NaInfo::parse(info_string)?;
        debug!(
            "class: {:?}, protocol: {}, hostname: {:?}",
            info.class_name, info.protocol_name, info.host_name
        );

        for entry in NA_PLUGIN_TABLE {
            if let Some(class_name) = &info.class_name {
                if entry.name != class_name {
                    continue;
                }
                // A named class that rejects the protocol is an error, not
                // a reason to keep looking.
                if !(entry.check_protocol)(&info.protocol_name) {
                    return Err(NaStatus::ProtoNoSupport);
                }
            } else if !(entry.check_protocol)(&info.protocol_name) {
                continue;
            }

            let plugin = (entry.initialize)(&info, listen, init_info)?;
            return Ok(NaClass {
                plugin,
                class_name: entry.name,
                protocol_name: info.protocol_name,
                listen,
                progress_mode: init_info.progress_mode,
            });
        }

        Err(NaStatus::ProtoNoSupport)
    }

    /// Finalize the class, releasing transport resources.
    pub fn finalize(self) -> NaResult<()> {
        self.plugin.finalize()
    }

    /// The selected plugin's class name.
    pub fn class_name(&self) -> &str {
        self.class_name
    }

    /// The canonical protocol string this class was initialised with.
    pub fn protocol_name(&self) -> &str {
        &self.protocol_name
    }

    /// Whether the class accepts incoming connections.
    pub fn is_listening(&self) -> bool {
        self.listen
    }

    /// Progress-mode bits the class was initialised with.
    pub fn progress_mode(&self) -> ProgressMode {
        self.progress_mode
    }

    /// Create an execution context on this class.
    pub fn context_create(&self) -> NaResult<NaContext> {
        Ok(NaContext::new())
    }

    /// Verify the context is quiescent. Fails with `Busy` while any
    /// completion sits in either of its queues; once it succeeds the
    /// context may be dropped.
    pub fn context_destroy(&self, context: &NaContext) -> NaResult<()> {
        context.destroy_check()
    }

    /// Create a reusable operation handle.
    pub fn op_create(&self) -> NaOpId {
        self.plugin.op_create()
    }

    /// Release an operation handle.
    pub fn op_destroy(&self, op_id: &NaOpId) -> NaResult<()> {
        self.plugin.op_destroy(op_id)
    }

    /// Look up a peer by address string; completes through `callback`.
    pub fn addr_lookup(
        &self,
        context: &NaContext,
        callback: NaCallback,
        name: &str,
        op_id: &NaOpId,
    ) -> NaResult<()> {
        if name.is_empty() {
            return Err(NaStatus::InvalidArg);
        }
        // Strip an optional class prefix: "na+sm://…" -> "sm://…".
        let short_name = match name.split_once(CLASS_DELIMITER) {
            Some((_, rest)) => rest,
            None => name,
        };
        self.plugin.addr_lookup(context, callback, short_name, op_id)
    }

    /// Release one reference to a peer address.
    pub fn addr_free(&self, addr: NaAddr) -> NaResult<()> {
        self.plugin.addr_free(addr)
    }

    /// The address of this class itself (one reference is transferred).
    pub fn addr_self(&self) -> NaResult<NaAddr> {
        self.plugin.addr_self()
    }

    /// Duplicate an address (the duplicate holds its own reference).
    pub fn addr_dup(&self, addr: &NaAddr) -> NaResult<NaAddr> {
        self.plugin.addr_dup(addr)
    }

    /// Whether two addresses name the same peer.
    pub fn addr_cmp(&self, addr1: &NaAddr, addr2: &NaAddr) -> bool {
        self.plugin.addr_cmp(addr1, addr2)
    }

    /// Whether `addr` is this class's own address.
    pub fn addr_is_self(&self, addr: &NaAddr) -> bool {
        self.plugin.addr_is_self(addr)
    }

    /// Render an address as `<class>+<protocol>://…`.
    pub fn addr_to_string(&self, addr: &NaAddr) -> NaResult<String> {
        let plugin_str = self.plugin.addr_to_string(addr)?;
        Ok(format!("{}{}{}", self.class_name, CLASS_DELIMITER, plugin_str))
    }

    /// Serialise an address; `OpNotSupported` for transports without a
    /// serialisable address form.
    pub fn addr_serialize(&self, buf: &mut [u8], addr: &NaAddr) -> NaResult<()> {
        if buf.is_empty() {
            return Err(NaStatus::InvalidArg);
        }
        self.plugin.addr_serialize(buf, addr)
    }

    /// Reconstruct an address from its serialised form.
    pub fn addr_deserialize(&self, buf: &[u8]) -> NaResult<NaAddr> {
        if buf.is_empty() {
            return Err(NaStatus::InvalidArg);
        }
        self.plugin.addr_deserialize(buf)
    }

    /// Maximum unexpected-message payload size.
    pub fn msg_max_unexpected_size(&self) -> usize {
        self.plugin.msg_max_unexpected_size()
    }

    /// Maximum expected-message payload size.
    pub fn msg_max_expected_size(&self) -> usize {
        self.plugin.msg_max_expected_size()
    }

    /// Maximum usable tag value.
    pub fn msg_max_tag(&self) -> u32 {
        self.plugin.msg_max_tag()
    }

    /// Allocate a zeroed message buffer of at least `buf_size` bytes,
    /// rounded up to page granularity.
    pub fn msg_buf_alloc(&self, buf_size: usize) -> NaResult<Vec<u8>> {
        if buf_size == 0 {
            return Err(NaStatus::InvalidArg);
        }
        let page = crate::shm::page_size();
        let rounded = buf_size.div_ceil(page) * page;
        Ok(vec![0u8; rounded])
    }

    /// Post an unexpected send. Completes through `callback`.
    pub fn msg_send_unexpected(
        &self,
        context: &NaContext,
        callback: NaCallback,
        buf: &[u8],
        dest: &NaAddr,
        tag: u32,
        op_id: &NaOpId,
    ) -> NaResult<()> {
        if buf.is_empty() {
            return Err(NaStatus::InvalidArg);
        }
        self.plugin
            .msg_send_unexpected(context, callback, buf, dest, tag, op_id)
    }

    /// Post an unexpected receive into `buf` (ownership passes to the op
    /// until completion hands it back through the callback info).
    pub fn msg_recv_unexpected(
        &self,
        context: &NaContext,
        callback: NaCallback,
        buf: Vec<u8>,
        op_id: &NaOpId,
    ) -> NaResult<()> {
        if buf.is_empty() {
            return Err(NaStatus::InvalidArg);
        }
        self.plugin.msg_recv_unexpected(context, callback, buf, op_id)
    }

    /// Post an expected send. Completes through `callback`.
    pub fn msg_send_expected(
        &self,
        context: &NaContext,
        callback: NaCallback,
        buf: &[u8],
        dest: &NaAddr,
        tag: u32,
        op_id: &NaOpId,
    ) -> NaResult<()> {
        if buf.is_empty() {
            return Err(NaStatus::InvalidArg);
        }
        self.plugin
            .msg_send_expected(context, callback, buf, dest, tag, op_id)
    }

    /// Post an expected receive matching `(source, tag)`.
    pub fn msg_recv_expected(
        &self,
        context: &NaContext,
        callback: NaCallback,
        buf: Vec<u8>,
        source: &NaAddr,
        tag: u32,
        op_id: &NaOpId,
    ) -> NaResult<()> {
        if buf.is_empty() {
            return Err(NaStatus::InvalidArg);
        }
        self.plugin
            .msg_recv_expected(context, callback, buf, source, tag, op_id)
    }

    /// Register a contiguous memory region for one-sided access.
    ///
    /// # Safety contract
    /// `base..base+len` must stay valid and, for handles the remote will
    /// write through, writable for the lifetime of the handle.
    pub fn mem_handle_create(
        &self,
        base: *mut u8,
        len: usize,
        access: MemAccess,
    ) -> NaResult<NaMemHandle> {
        if base.is_null() || len == 0 {
            return Err(NaStatus::InvalidArg);
        }
        self.plugin.mem_handle_create(base, len, access)
    }

    /// Register a scattered region described by `segments`.
    pub fn mem_handle_create_segments(
        &self,
        segments: &[NaSegment],
        access: MemAccess,
    ) -> NaResult<NaMemHandle> {
        if segments.is_empty() {
            return Err(NaStatus::InvalidArg);
        }
        self.plugin.mem_handle_create_segments(segments, access)
    }

    /// Free a memory handle.
    pub fn mem_handle_free(&self, mem_handle: NaMemHandle) -> NaResult<()> {
        self.plugin.mem_handle_free(mem_handle)
    }

    /// Optional registration step (no-op for SM).
    pub fn mem_register(&self, mem_handle: &NaMemHandle) -> NaResult<()> {
        self.plugin.mem_register(mem_handle)
    }

    /// Optional deregistration step (no-op for SM).
    pub fn mem_deregister(&self, mem_handle: &NaMemHandle) -> NaResult<()> {
        self.plugin.mem_deregister(mem_handle)
    }

    /// Optional publish step (no-op for SM).
    pub fn mem_publish(&self, mem_handle: &NaMemHandle) -> NaResult<()> {
        self.plugin.mem_publish(mem_handle)
    }

    /// Optional unpublish step (no-op for SM).
    pub fn mem_unpublish(&self, mem_handle: &NaMemHandle) -> NaResult<()> {
        self.plugin.mem_unpublish(mem_handle)
    }

    /// Serialised size of a memory handle.
    pub fn mem_handle_serialize_size(&self, mem_handle: &NaMemHandle) -> NaResult<usize> {
        self.plugin.mem_handle_serialize_size(mem_handle)
    }

    /// Serialise a memory handle into `buf`.
    pub fn mem_handle_serialize(
        &self,
        buf: &mut [u8],
        mem_handle: &NaMemHandle,
    ) -> NaResult<()> {
        if buf.is_empty() {
            return Err(NaStatus::InvalidArg);
        }
        self.plugin.mem_handle_serialize(buf, mem_handle)
    }

    /// Reconstruct a memory handle from its serialised form.
    pub fn mem_handle_deserialize(&self, buf: &[u8]) -> NaResult<NaMemHandle> {
        if buf.is_empty() {
            return Err(NaStatus::InvalidArg);
        }
        self.plugin.mem_handle_deserialize(buf)
    }

    /// One-sided put: copy `length` bytes of local memory into the remote
    /// region. Completes through `callback`.
    #[allow(clippy::too_many_arguments)]
    pub fn put(
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
        if length == 0 {
            return Err(NaStatus::InvalidArg);
        }
        self.plugin.put(
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

    /// One-sided get: copy `length` bytes of remote memory into the local
    /// region. Completes through `callback`.
    #[allow(clippy::too_many_arguments)]
    pub fn get(
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
        if length == 0 {
            return Err(NaStatus::InvalidArg);
        }
        self.plugin.get(
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

    /// The transport's poll-set descriptor, if it exposes one.
    pub fn poll_get_fd(&self, _context: &NaContext) -> Option<std::os::unix::io::RawFd> {
        self.plugin.poll_get_fd()
    }

    /// Whether it is safe to block waiting on the poll fd.
    pub fn poll_try_wait(&self, context: &NaContext) -> bool {
        if self.progress_mode.contains(ProgressMode::NO_BLOCK) {
            return false;
        }
        if !context.completion_queues_empty() {
            return false;
        }
        self.plugin.poll_try_wait()
    }

    /// Drive the transport for up to `timeout_ms` milliseconds.
    ///
    /// At most one thread calls into the plugin per context; the others
    /// wait on the progress condvar and return as soon as the completion
    /// queue turns non-empty or the timeout expires.
    pub fn progress(&self, context: &NaContext, timeout_ms: u32) -> NaResult<()> {
        let inner = &*context.inner;
        let mut remaining = Duration::from_millis(u64::from(timeout_ms));

        inner.progressing.fetch_add(1, Ordering::AcqRel);
        loop {
            let old = inner.progressing.load(Ordering::Acquire) & !PROGRESS_LOCK;
            let num = old | PROGRESS_LOCK;
            if inner
                .progressing
                .compare_exchange(old, num, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break; // No other thread is progressing.
            }

            if remaining.is_zero() {
                inner.progressing.fetch_sub(1, Ordering::AcqRel);
                return Err(NaStatus::Timeout);
            }

            let t1 = Instant::now();
            {
                let guard = inner.progress_mutex.lock().unwrap();
                // No need to enter the wait if the lock was just released.
                let num = inner.progressing.load(Ordering::Acquire);
                if num & PROGRESS_LOCK != 0 {
                    let (_guard, wait) = inner
                        .progress_cond
                        .wait_timeout(guard, remaining)
                        .unwrap();
                    if wait.timed_out() {
                        inner.progressing.fetch_sub(1, Ordering::AcqRel);
                        return Err(NaStatus::Timeout);
                    }
                }
            }
            remaining = remaining.saturating_sub(t1.elapsed());
        }

        // Short-circuit: anything already queued counts as progress.
        let ret = if !context.completion_queues_empty() {
            Ok(())
        } else {
            self.plugin.progress(remaining.as_millis() as u32)
        };

        // Clear the lock bit while decrementing the count.
        let mut num;
        loop {
            let old = inner.progressing.load(Ordering::Acquire);
            num = (old - 1) ^ PROGRESS_LOCK;
            if inner
                .progressing
                .compare_exchange(old, num, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        if num > 0 {
            // Other threads piled up in progress; hand one the lock.
            let _guard = inner.progress_mutex.lock().unwrap();
            inner.progress_cond.notify_one();
        }

        ret
    }

    /// Cancel a posted operation. Completed ops are left untouched.
    pub fn cancel(&self, _context: &NaContext, op_id: &NaOpId) -> NaResult<()> {
        self.plugin.cancel(op_id)
    }
}

/// Remove residue (sockets, shm objects) left by crashed prior runs of the
/// same user. Safe to call without any live class.
pub fn cleanup() {
    for entry in NA_PLUGIN_TABLE {
        if let Some(cleanup) = entry.cleanup {
            cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_protocol_only() {
        let info = NaInfo::parse("sm").unwrap();
        assert_eq!(info.class_name, None);
        assert_eq!(info.protocol_name, "sm");
        assert_eq!(info.host_name, None);
    }

    #[test]
    fn parse_class_and_protocol() {
        let info = NaInfo::parse("na+sm").unwrap();
        assert_eq!(info.class_name.as_deref(), Some("na"));
        assert_eq!(info.protocol_name, "sm");
    }

    #[test]
    fn parse_full_uri() {
        let info = NaInfo::parse("na+sm://12345/0").unwrap();
        assert_eq!(info.class_name.as_deref(), Some("na"));
        assert_eq!(info.protocol_name, "sm");
        assert_eq!(info.host_name.as_deref(), Some("12345/0"));
    }

    #[test]
    fn parse_empty_host_is_legal() {
        let info = NaInfo::parse("sm://").unwrap();
        assert_eq!(info.protocol_name, "sm");
        assert_eq!(info.host_name, None);
    }

    #[test]
    fn parse_bad_locator_fails() {
        assert_eq!(NaInfo::parse("sm:/oops"), Err(NaStatus::ProtoNoSupport));
        assert_eq!(NaInfo::parse(""), Err(NaStatus::InvalidArg));
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        assert!(matches!(
            NaClass::initialize("tcp://localhost:4444", false),
            Err(NaStatus::ProtoNoSupport)
        ));
    }

    #[test]
    fn wrong_class_name_is_rejected() {
        assert!(matches!(
            NaClass::initialize("ofi+sm", false),
            Err(NaStatus::ProtoNoSupport)
        ));
    }
}
