//! Reservation + drain-to-frontier protocol.
//!
//! Three counters cooperate without a lock:
//!
//! - `write`: next free position. Writers claim `[old, old + n)` with a CAS.
//! - `dirty`: total bytes whose copy has finished, in any order.
//! - `ready`: the frontier readers may consume up to.
//!
//! `dirty` is a count, not a position: a finished writer only knows the ring
//! is fully written below `dirty` when `dirty == write`, i.e. no reservation
//! is still being copied. The writer that observes that equality pushes
//! `ready` forward. Several such "last finishers" may race on `ready`; the
//! forward-only CAS makes the race harmless.
//!
//! Invariant at every instant: `ready <= dirty <= write`.
//!
//! A writer that dies between reserving and committing leaves `dirty` short
//! forever, so `ready` stops advancing for every producer until the queue is
//! reset. There is no recovery for this.

use std::hint;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the three counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub write: u64,
    pub dirty: u64,
    pub ready: u64,
}

impl CounterSnapshot {
    /// Bytes reserved but not yet visible to readers.
    pub fn in_flight(&self) -> u64 {
        self.write - self.ready
    }

    pub fn is_consistent(&self) -> bool {
        self.ready <= self.dirty && self.dirty <= self.write
    }
}

/// Moves `counter` forward to `target` unless it is already there or beyond.
/// Returns whether this call moved it.
#[inline]
pub fn advance_to(counter: &AtomicU64, target: u64) -> bool {
    let mut current = counter.load(Ordering::Relaxed);
    while current < target {
        match counter.compare_exchange_weak(current, target, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
    false
}

/// Borrowed view of a queue's `write`/`dirty`/`ready` triple.
pub(crate) struct Frontier<'a> {
    pub write: &'a AtomicU64,
    pub dirty: &'a AtomicU64,
    pub ready: &'a AtomicU64,
}

impl Frontier<'_> {
    /// Claims `total` bytes and returns the start of the claimed range.
    ///
    /// With `limit = Some(c)` the caller spins until the claim would leave at
    /// most `c` bytes between `ready` and the end of the claim, so a writer
    /// can never overwrite a range another writer is still copying.
    #[inline]
    pub fn reserve(&self, total: u64, limit: Option<u64>) -> u64 {
        let mut old = self.write.load(Ordering::Relaxed);
        loop {
            if let Some(limit) = limit {
                let ready = self.ready.load(Ordering::Acquire);
                if (old + total).saturating_sub(ready) > limit {
                    hint::spin_loop();
                    old = self.write.load(Ordering::Relaxed);
                    continue;
                }
            }
            match self.write.compare_exchange_weak(
                old,
                old + total,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return old,
                Err(actual) => old = actual,
            }
        }
    }

    /// Marks `total` bytes as written and, if nothing else is in flight,
    /// publishes everything written so far.
    #[inline]
    pub fn commit(&self, total: u64) {
        // AcqRel: releases this writer's payload bytes and acquires every
        // earlier committer's, so whoever advances `ready` publishes all of
        // them.
        let done = self.dirty.fetch_add(total, Ordering::AcqRel) + total;
        if done == self.write.load(Ordering::Acquire) {
            advance_to(self.ready, done);
        }
    }

    /// Loads in `ready`, `dirty`, `write` order so the snapshot satisfies the
    /// invariant even while writers are active.
    pub fn snapshot(&self) -> CounterSnapshot {
        let ready = self.ready.load(Ordering::Acquire);
        let dirty = self.dirty.load(Ordering::Acquire);
        let write = self.write.load(Ordering::Acquire);
        CounterSnapshot {
            write,
            dirty,
            ready,
        }
    }

    /// Zeroes all three counters, lowest first to keep the invariant.
    /// Only meaningful while no writer is active.
    pub fn reset(&self) {
        self.ready.store(0, Ordering::Release);
        self.dirty.store(0, Ordering::Release);
        self.write.store(0, Ordering::Release);
    }
}
