// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libna contributors
//
// Lock-free MPMC ring buffer of 8-byte message headers, laid out for a
// shared-memory mapping so producer and consumer may live in different
// address spaces. Producers claim a slot by advancing the producer head,
// then publish in claim order by advancing the producer tail once their
// predecessor has; consumers mirror the protocol with their own cursors.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::spin_lock::adaptive_yield;

/// Number of header slots per ring.
pub const RING_SLOT_COUNT: usize = 64;

/// Mapped size of one ring region (header + slots, padded to a page).
pub const RING_SHM_SIZE: usize = 4096;

const CACHE_LINE: usize = 64;

/// Ring header: six 32-bit cursors/masks, padded to a cache line.
#[repr(C)]
struct RingIndices {
    size: AtomicU32,
    mask: AtomicU32,
    prod_head: AtomicU32,
    prod_tail: AtomicU32,
    cons_head: AtomicU32,
    cons_tail: AtomicU32,
    _pad: [u8; CACHE_LINE - 6 * 4],
}

/// The shared ring. Obtained by casting the base of a mapped region; never
/// constructed by value.
#[repr(C)]
pub struct SmRing {
    idx: RingIndices,
    slots: [AtomicU64; RING_SLOT_COUNT],
}

const _: () = assert!(std::mem::size_of::<SmRing>() <= RING_SHM_SIZE);

impl SmRing {
    /// View a mapped region as a ring.
    ///
    /// # Safety
    /// `base` must point to at least `RING_SHM_SIZE` mapped bytes that
    /// remain valid for `'a`, initialised by `init` on exactly one side.
    pub unsafe fn from_ptr<'a>(base: *mut u8) -> &'a SmRing {
        &*(base as *const SmRing)
    }

    /// Initialise cursors; runs on the creating side only, before the
    /// name is revealed to the peer.
    pub fn init(&self) {
        self.idx.size.store(RING_SLOT_COUNT as u32, Ordering::Relaxed);
        self.idx.mask.store(RING_SLOT_COUNT as u32 - 1, Ordering::Relaxed);
        self.idx.prod_head.store(0, Ordering::Relaxed);
        self.idx.prod_tail.store(0, Ordering::Relaxed);
        self.idx.cons_head.store(0, Ordering::Relaxed);
        self.idx.cons_tail.store(0, Ordering::Release);
    }

    /// Multi-producer push. Returns false when the ring is full.
    pub fn push(&self, value: u64) -> bool {
        let size = self.idx.size.load(Ordering::Relaxed);
        let mask = self.idx.mask.load(Ordering::Relaxed);

        let mut claimed;
        loop {
            claimed = self.idx.prod_head.load(Ordering::Relaxed);
            let cons_tail = self.idx.cons_tail.load(Ordering::Acquire);
            if claimed.wrapping_sub(cons_tail) >= size {
                return false;
            }
            if self
                .idx
                .prod_head
                .compare_exchange_weak(
                    claimed,
                    claimed.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }

        self.slots[(claimed & mask) as usize].store(value, Ordering::Release);

        // Publish in claim order: wait for the predecessor's publish.
        let mut k = 0u32;
        while self.idx.prod_tail.load(Ordering::Acquire) != claimed {
            adaptive_yield(&mut k);
        }
        self.idx
            .prod_tail
            .store(claimed.wrapping_add(1), Ordering::Release);
        true
    }

    /// Multi-consumer pop. Returns `None` when the ring is empty.
    pub fn pop(&self) -> Option<u64> {
        let mask = self.idx.mask.load(Ordering::Relaxed);

        let mut claimed;
        loop {
            claimed = self.idx.cons_head.load(Ordering::Relaxed);
            let prod_tail = self.idx.prod_tail.load(Ordering::Acquire);
            if claimed == prod_tail {
                return None;
            }
            if self
                .idx
                .cons_head
                .compare_exchange_weak(
                    claimed,
                    claimed.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }

        let value = self.slots[(claimed & mask) as usize].load(Ordering::Acquire);

        let mut k = 0u32;
        while self.idx.cons_tail.load(Ordering::Acquire) != claimed {
            adaptive_yield(&mut k);
        }
        self.idx
            .cons_tail
            .store(claimed.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Whether the ring holds no published entries.
    pub fn is_empty(&self) -> bool {
        self.idx.cons_head.load(Ordering::Acquire)
            == self.idx.prod_tail.load(Ordering::Acquire)
    }
}
