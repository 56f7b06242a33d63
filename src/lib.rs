// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libna contributors
//
// Pluggable network abstraction (NA) layer for RPC frameworks: message
// passing and one-sided memory transfers dispatched through a transport
// vtable, with a shared-memory transport built in.
//
// The front end (`NaClass`, `NaContext`) validates calls, serialises
// plugin progress across threads, and runs completions through a
// per-context pipeline. The SM transport moves payloads through shared
// ring buffers and an atomically reserved copy pool, and uses
// cross-process vector I/O for put/get.

mod class;
mod context;
mod error;
mod event;
mod plugin;
mod poll;
mod shm;
mod sm;
mod spin_lock;

pub use class::{cleanup, NaClass};
pub use context::NaContext;
pub use error::{NaResult, NaStatus};
pub use plugin::{
    MemAccess, NaAddr, NaCallback, NaCbInfo, NaCbPayload, NaInfo, NaInitInfo,
    NaMemHandle, NaOpId, NaSegment, ProgressMode,
};
