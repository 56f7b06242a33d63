// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libna contributors
//
// Shared copy pool: a 64-bit availability bitmap (bit set = slot free) in
// front of 64 payload slots of 4 KiB each. Slot ownership crosses process
// boundaries purely through full-word CAS on the bitmap; the per-process
// spin lock around the scan only keeps local threads from fighting over
// the same CAS attempt.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{NaResult, NaStatus};
use crate::spin_lock::SpinLock;

/// Number of payload slots.
pub const POOL_SLOT_COUNT: usize = 64;

/// Payload slot size; also the transport's maximum message size.
pub const POOL_SLOT_SIZE: usize = 4096;

const CACHE_LINE: usize = 64;

/// Mapped size of a pool region: one header cache line, the slots, the
/// remainder padded out to page granularity.
pub const POOL_SHM_SIZE: usize =
    (CACHE_LINE + POOL_SLOT_COUNT * POOL_SLOT_SIZE).div_ceil(POOL_SLOT_SIZE)
        * POOL_SLOT_SIZE;

/// The shared pool, viewed in place over a mapped region.
#[repr(C)]
pub struct SmCopyPool {
    /// Availability bitmap; bit i set means slot i is free.
    available: AtomicU64,
    _pad: [u8; CACHE_LINE - 8],
    // POOL_SLOT_COUNT slots of POOL_SLOT_SIZE bytes follow.
}

impl SmCopyPool {
    /// View a mapped region as a pool.
    ///
    /// # Safety
    /// `base` must point to at least `POOL_SHM_SIZE` mapped bytes valid
    /// for `'a`.
    pub unsafe fn from_ptr<'a>(base: *mut u8) -> &'a SmCopyPool {
        &*(base as *const SmCopyPool)
    }

    /// Mark every slot free; creating side only.
    pub fn init(&self) {
        self.available.store(!0u64, Ordering::Release);
    }

    /// Current availability word (diagnostics and backpressure checks).
    pub fn available(&self) -> u64 {
        self.available.load(Ordering::Acquire)
    }

    fn slot_ptr(&self, idx: usize) -> *mut u8 {
        debug_assert!(idx < POOL_SLOT_COUNT);
        unsafe { (self as *const SmCopyPool as *mut u8).add(CACHE_LINE + idx * POOL_SLOT_SIZE) }
    }

    /// Reserve a free slot and copy `buf` into it. Scans bits LSB→MSB and
    /// claims the first free one by full-word CAS; `Again` when no bit is
    /// set. `scan_lock` serialises local threads over the scan.
    pub fn reserve_and_copy(&self, scan_lock: &SpinLock<()>, buf: &[u8]) -> NaResult<usize> {
        debug_assert!(buf.len() <= POOL_SLOT_SIZE);
        let _guard = scan_lock.lock();

        let mut bit = 1u64;
        let mut i = 0;
        loop {
            let available = self.available.load(Ordering::Acquire);
            if available == 0 {
                return Err(NaStatus::Again);
            }
            if available & bit != bit {
                // Already reserved, move on.
                if i == POOL_SLOT_COUNT - 1 {
                    return Err(NaStatus::Again);
                }
                i += 1;
                bit <<= 1;
                continue;
            }
            if self
                .available
                .compare_exchange(
                    available,
                    available & !bit,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                unsafe {
                    std::ptr::copy_nonoverlapping(buf.as_ptr(), self.slot_ptr(i), buf.len());
                }
                return Ok(i);
            }
            // CAS lost a cross-process race; re-read and retry this bit.
        }
    }

    /// Copy slot `idx` out into `buf` and release the slot.
    pub fn copy_and_release(&self, scan_lock: &SpinLock<()>, buf: &mut [u8], idx: usize) {
        let _guard = scan_lock.lock();
        unsafe {
            std::ptr::copy_nonoverlapping(self.slot_ptr(idx), buf.as_mut_ptr(), buf.len());
        }
        self.available.fetch_or(1u64 << idx, Ordering::AcqRel);
    }

    /// Release slot `idx` without reading it (failed sends, cancellation).
    pub fn release(&self, idx: usize) {
        self.available.fetch_or(1u64 << idx, Ordering::AcqRel);
    }
}
