// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libna contributors
//
// NA execution context: the per-context completion pipeline and the state
// backing the cooperative progress gate.
//
// Completions take a bounded lock-free fast path; when that fills they
// spill into a mutex-guarded backfill queue. Trigger drains fast path
// first, then backfill, and only sleeps on the condvar when it has
// delivered nothing yet.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::CachePadded;

use crate::error::{NaResult, NaStatus};
use crate::plugin::NaCompletion;

/// Fast-path completion queue depth.
const COMPLETION_QUEUE_SIZE: usize = 1024;

pub(crate) struct ContextInner {
    /// Bounded MPMC fast path.
    completion_queue: ArrayQueue<NaCompletion>,
    /// Unbounded spillover, also the channel trigger sleeps on.
    backfill_queue: Mutex<VecDeque<NaCompletion>>,
    backfill_count: CachePadded<AtomicI32>,
    completion_cond: Condvar,
    /// Number of threads currently sleeping in trigger.
    trigger_waiting: CachePadded<AtomicI32>,

    /// Progress gate: `(in_progress_count | PROGRESS_LOCK)`.
    pub(crate) progressing: CachePadded<AtomicI32>,
    pub(crate) progress_mutex: Mutex<()>,
    pub(crate) progress_cond: Condvar,
}

/// Execution context attached to an `NaClass`. Cheap to clone; all clones
/// share one completion pipeline.
#[derive(Clone)]
pub struct NaContext {
    pub(crate) inner: Arc<ContextInner>,
}

impl NaContext {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                completion_queue: ArrayQueue::new(COMPLETION_QUEUE_SIZE),
                backfill_queue: Mutex::new(VecDeque::new()),
                backfill_count: CachePadded::new(AtomicI32::new(0)),
                completion_cond: Condvar::new(),
                trigger_waiting: CachePadded::new(AtomicI32::new(0)),
                progressing: CachePadded::new(AtomicI32::new(0)),
                progress_mutex: Mutex::new(()),
                progress_cond: Condvar::new(),
            }),
        }
    }

    /// Whether both completion queues are empty.
    pub(crate) fn completion_queues_empty(&self) -> bool {
        self.inner.completion_queue.is_empty()
            && self.inner.backfill_count.load(Ordering::Acquire) == 0
    }

    /// Enqueue a completion record. Called by plugins when an operation
    /// finishes; wakes one trigger waiter if any.
    pub(crate) fn completion_add(&self, completion: NaCompletion) {
        let inner = &*self.inner;
        if let Err(completion) = inner.completion_queue.push(completion) {
            // Queue is full, spill over.
            let mut backfill = inner.backfill_queue.lock().unwrap();
            backfill.push_back(completion);
            inner.backfill_count.fetch_add(1, Ordering::AcqRel);
        }

        if inner.trigger_waiting.load(Ordering::Acquire) > 0 {
            let _guard = inner.backfill_queue.lock().unwrap();
            inner.completion_cond.notify_one();
        }
    }

    /// Run up to `max_count` completion callbacks, waiting up to
    /// `timeout_ms` if none are ready. Returns the number delivered, or
    /// `Timeout` when the wait expired with nothing delivered.
    pub fn trigger(&self, timeout_ms: u32, max_count: u32) -> NaResult<u32> {
        self.trigger_collect(timeout_ms, max_count, None)
    }

    /// Like `trigger`, but collects each callback's return value.
    pub fn trigger_collect(
        &self,
        timeout_ms: u32,
        max_count: u32,
        mut callback_rets: Option<&mut Vec<i32>>,
    ) -> NaResult<u32> {
        let inner = &*self.inner;
        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));
        let mut count = 0u32;

        while count < max_count {
            let completion = match inner.completion_queue.pop() {
                Some(c) => c,
                None => {
                    if inner.backfill_count.load(Ordering::Acquire) > 0 {
                        let mut backfill = inner.backfill_queue.lock().unwrap();
                        match backfill.pop_front() {
                            Some(c) => {
                                inner.backfill_count.fetch_sub(1, Ordering::AcqRel);
                                c
                            }
                            // Raced with another consumer; try again.
                            None => continue,
                        }
                    } else {
                        // If something was already processed, leave.
                        if count > 0 {
                            break;
                        }

                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            return Err(NaStatus::Timeout);
                        }

                        inner.trigger_waiting.fetch_add(1, Ordering::AcqRel);
                        let mut timed_out = false;
                        {
                            let mut guard = inner.backfill_queue.lock().unwrap();
                            while inner.completion_queue.is_empty()
                                && inner.backfill_count.load(Ordering::Acquire) == 0
                            {
                                let remaining =
                                    deadline.saturating_duration_since(Instant::now());
                                if remaining.is_zero() {
                                    timed_out = true;
                                    break;
                                }
                                let (g, wait) = inner
                                    .completion_cond
                                    .wait_timeout(guard, remaining)
                                    .unwrap();
                                guard = g;
                                if wait.timed_out() {
                                    timed_out = true;
                                    break;
                                }
                            }
                        }
                        inner.trigger_waiting.fetch_sub(1, Ordering::AcqRel);
                        if timed_out {
                            return Err(NaStatus::Timeout);
                        }
                        continue; // Give another chance to grab one.
                    }
                }
            };

            // User callback first, then the plugin release hook: resources
            // must outlive the user's view of them.
            let NaCompletion {
                callback,
                info,
                release,
            } = completion;
            if let Some(callback) = callback {
                let cb_ret = callback(info);
                if let Some(rets) = callback_rets.as_mut() {
                    rets.push(cb_ret);
                }
            }
            if let Some(release) = release {
                release();
            }

            count += 1;
        }

        Ok(count)
    }

    /// Validate that the context is quiescent: both completion queues must
    /// be empty, otherwise `Busy`. The context may be dropped afterwards.
    pub(crate) fn destroy_check(&self) -> NaResult<()> {
        if !self.inner.completion_queue.is_empty() {
            return Err(NaStatus::Busy);
        }
        let backfill = self.inner.backfill_queue.lock().unwrap();
        if !backfill.is_empty() {
            return Err(NaStatus::Busy);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{NaCbInfo, NaCbPayload};
    use std::sync::atomic::AtomicU32;

    fn completion(order: Arc<Mutex<Vec<&'static str>>>) -> NaCompletion {
        let order2 = Arc::clone(&order);
        NaCompletion {
            callback: Some(Box::new(move |_info| {
                order.lock().unwrap().push("callback");
                0
            })),
            info: NaCbInfo {
                ret: Ok(()),
                payload: NaCbPayload::SendUnexpected,
            },
            release: Some(Box::new(move || {
                order2.lock().unwrap().push("release");
            })),
        }
    }

    #[test]
    fn trigger_runs_callback_before_release() {
        let ctx = NaContext::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        ctx.completion_add(completion(Arc::clone(&order)));

        let n = ctx.trigger(0, 10).unwrap();
        assert_eq!(n, 1);
        assert_eq!(&*order.lock().unwrap(), &["callback", "release"]);
    }

    #[test]
    fn trigger_times_out_when_empty() {
        let ctx = NaContext::new();
        assert_eq!(ctx.trigger(10, 1), Err(NaStatus::Timeout));
    }

    #[test]
    fn trigger_respects_max_count() {
        let ctx = NaContext::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..5 {
            ctx.completion_add(completion(Arc::clone(&order)));
        }
        assert_eq!(ctx.trigger(0, 3).unwrap(), 3);
        assert_eq!(ctx.trigger(0, 10).unwrap(), 2);
    }

    #[test]
    fn spillover_preserves_records() {
        let ctx = NaContext::new();
        let delivered = Arc::new(AtomicU32::new(0));
        let total = COMPLETION_QUEUE_SIZE as u32 + 100;
        for _ in 0..total {
            let delivered = Arc::clone(&delivered);
            ctx.completion_add(NaCompletion {
                callback: Some(Box::new(move |_| {
                    delivered.fetch_add(1, Ordering::Relaxed);
                    0
                })),
                info: NaCbInfo {
                    ret: Ok(()),
                    payload: NaCbPayload::SendUnexpected,
                },
                release: None,
            });
        }
        let mut remaining = total;
        while remaining > 0 {
            remaining -= ctx.trigger(0, 64).unwrap();
        }
        assert_eq!(delivered.load(Ordering::Relaxed), total);
    }

    #[test]
    fn destroy_check_busy_until_drained() {
        let ctx = NaContext::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        ctx.completion_add(completion(order));
        assert_eq!(ctx.destroy_check(), Err(NaStatus::Busy));
        ctx.trigger(0, 1).unwrap();
        assert!(ctx.destroy_check().is_ok());
    }

    #[test]
    fn waiting_trigger_wakes_on_add() {
        let ctx = NaContext::new();
        let ctx2 = ctx.clone();
        let t = std::thread::spawn(move || ctx2.trigger(5000, 1));
        std::thread::sleep(Duration::from_millis(50));
        let order = Arc::new(Mutex::new(Vec::new()));
        ctx.completion_add(completion(order));
        assert_eq!(t.join().unwrap().unwrap(), 1);
    }
}
