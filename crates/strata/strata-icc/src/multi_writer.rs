//! Multi-writer, multi-reader queue of variable-length records.
//!
//! # Record format
//!
//! ```text
//! ┌──────────────────────┬───────────────────────┐
//! │ len: i32 (native)    │ payload: len bytes     │
//! └──────────────────────┴───────────────────────┘
//! ```
//!
//! No checksum, no padding: records are packed back to back and may straddle
//! the end of the ring.
//!
//! # Design
//! - **Writers** claim a byte range with a CAS on `write`, copy without
//!   holding anything, then commit through the [`frontier`](crate::frontier)
//!   protocol. `put` returns the start of the claimed range; it is unique for
//!   the life of the queue and doubles as a correlation id.
//! - **Readers** own a cursor each and only ever see the fully written prefix
//!   below `ready`.
//!
//! # Thread Safety
//! - `MultiWriterQueue` is `Send + Sync + Clone`; clones share one ring and
//!   may `put` concurrently.
//! - `RecordReader` is `Send` but not `Sync`; never share a cursor.

use crate::error::{IccError, ReadError};
use crate::frontier::{CounterSnapshot, Frontier};
use crate::ring::RingBuffer;
use crate::shm_layout::{RECORD_HEADER_SIZE, RecordHeader};
use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};
use strata_shm::{Access, OpenStatus, SegmentSpec};
use tracing::info;

/// Size of the length prefix in front of every record.
pub const LEN_PREFIX: usize = size_of::<i32>();

/// What a writer does when the ring is full of unpublished data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdmissionPolicy {
    /// Always proceed; slow readers detect the loss.
    #[default]
    BestEffort,
    /// Spin until the claim fits within one ring of `ready`.
    Blocking,
}

#[derive(Clone)]
pub struct MultiWriterQueue {
    ring: Arc<RingBuffer>,
    policy: AdmissionPolicy,
}

/// Private cursor over a [`MultiWriterQueue`].
pub struct RecordReader {
    ring: Arc<RingBuffer>,
    cursor: u64,
    /// Holds records that straddle the end of the ring.
    scratch: Vec<u8>,
    resyncs: u64,
}

/// A record returned by [`RecordReader::take`].
///
/// Borrowed straight from the ring when contiguous, otherwise from the
/// reader's scratch buffer. Hand [`span`](Self::span) to
/// [`RecordReader::advance`] once done.
#[derive(Debug)]
pub struct Record<'a> {
    pub position: u64,
    pub payload: &'a [u8],
}

impl Record<'_> {
    /// Bytes this record occupies in the ring, prefix included.
    pub fn span(&self) -> u64 {
        (LEN_PREFIX + self.payload.len()) as u64
    }
}

fn check_capacity(capacity: usize) -> Result<(), IccError> {
    if capacity <= LEN_PREFIX {
        return Err(IccError::InvalidCapacity {
            capacity,
            reason: "must exceed the record length prefix",
        });
    }
    Ok(())
}

fn frontier(ring: &RingBuffer) -> Frontier<'_> {
    let h = ring.header::<RecordHeader>();
    Frontier {
        write: &h.writers.write,
        dirty: &h.writers.dirty,
        ready: &h.readers.ready,
    }
}

impl MultiWriterQueue {
    /// Creates a process-local queue of `capacity` bytes.
    ///
    /// # Errors
    /// `InvalidCapacity` unless `capacity` exceeds [`LEN_PREFIX`]; `Alloc`
    /// if the ring cannot be allocated.
    pub fn heap(capacity: usize, policy: AdmissionPolicy) -> Result<Self, IccError> {
        check_capacity(capacity)?;
        let ring = RingBuffer::heap(capacity, RECORD_HEADER_SIZE)?;
        Self::init(ring, policy)
    }

    /// Creates or attaches the named shared queue for writing (and reading).
    ///
    /// A segment of another size is resized and its header cleared.
    ///
    /// # Errors
    /// - `ReadOnly` for a read-only `spec`
    /// - `InvalidCapacity` as for [`heap`](Self::heap)
    /// - The segment cannot be opened or mapped
    /// - The existing header belongs to another queue type or version
    pub fn open(spec: &SegmentSpec, capacity: usize, policy: AdmissionPolicy) -> Result<Self, IccError> {
        if spec.access == Access::ReadOnly {
            return Err(IccError::ReadOnly);
        }
        check_capacity(capacity)?;
        let ring = RingBuffer::shared(spec, capacity, RECORD_HEADER_SIZE)?;
        Self::init(ring, policy)
    }

    fn init(ring: RingBuffer, policy: AdmissionPolicy) -> Result<Self, IccError> {
        let header = ring.header::<RecordHeader>();
        if matches!(ring.open_status(), Some(OpenStatus::Resized { .. })) {
            header.clear();
        }
        if header.stamp(ring.capacity() as u64)? {
            info!(capacity = ring.capacity(), ?policy, "initialised multi-writer queue");
        }
        Ok(Self {
            ring: Arc::new(ring),
            policy,
        })
    }

    /// Appends one record and returns its position.
    ///
    /// # Errors
    /// `PayloadTooLarge` when prefix plus payload exceeds the capacity.
    #[inline]
    pub fn put(&self, payload: &[u8]) -> Result<u64, IccError> {
        self.put_vectored(&[payload])
    }

    /// Appends one record whose payload is the concatenation of `parts`.
    pub fn put_vectored(&self, parts: &[&[u8]]) -> Result<u64, IccError> {
        let len: usize = parts.iter().map(|p| p.len()).sum();
        let total = LEN_PREFIX + len;
        if total > self.ring.capacity() || len > i32::MAX as usize {
            return Err(IccError::PayloadTooLarge {
                len,
                capacity: self.ring.capacity(),
            });
        }

        let f = frontier(&self.ring);
        let limit = match self.policy {
            AdmissionPolicy::BestEffort => None,
            AdmissionPolicy::Blocking => Some(self.ring.capacity() as u64),
        };
        let start = f.reserve(total as u64, limit);

        self.ring.copy_in(start, &(len as i32).to_ne_bytes());
        let mut pos = start + LEN_PREFIX as u64;
        for part in parts {
            self.ring.copy_in(pos, part);
            pos += part.len() as u64;
        }

        f.commit(total as u64);
        Ok(start)
    }

    /// Consistent snapshot of `ready <= dirty <= write`.
    pub fn counters(&self) -> CounterSnapshot {
        frontier(&self.ring).snapshot()
    }

    /// Out-of-band reset of the whole queue. Readers will see `Desync` and
    /// must resynchronise. Must not race with `put`.
    pub fn reset(&self) {
        frontier(&self.ring).reset();
        info!(capacity = self.ring.capacity(), "queue reset");
    }

    /// A reader that only sees records published from now on.
    pub fn reader(&self) -> RecordReader {
        let ready = frontier(&self.ring).ready.load(Ordering::Acquire);
        self.reader_at(ready)
    }

    /// A reader starting at an explicit position, e.g. `0` for a reader that
    /// was logically present before any write.
    pub fn reader_at(&self, position: u64) -> RecordReader {
        RecordReader::new(Arc::clone(&self.ring), position)
    }

    /// Size of the data area in bytes.
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// What `put` does when the ring is full of unpublished data.
    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    pub fn is_shared(&self) -> bool {
        self.ring.is_shared()
    }
}

impl std::fmt::Debug for MultiWriterQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiWriterQueue")
            .field("ring", &self.ring)
            .field("policy", &self.policy)
            .field("counters", &self.counters())
            .finish()
    }
}

impl RecordReader {
    fn new(ring: Arc<RingBuffer>, cursor: u64) -> Self {
        Self {
            ring,
            cursor,
            scratch: Vec::new(),
            resyncs: 0,
        }
    }

    /// Attaches read-only to a shared queue owned by other processes,
    /// tail-following from the current `ready`.
    ///
    /// # Errors
    /// - Segment does not exist or has another size
    /// - Header is unstamped, of another queue type, or another capacity
    pub fn attach(spec: &SegmentSpec, capacity: usize) -> Result<Self, IccError> {
        check_capacity(capacity)?;
        let ring = RingBuffer::shared(&spec.clone().read_only(), capacity, RECORD_HEADER_SIZE)?;
        ring.header::<RecordHeader>().validate(capacity as u64)?;
        let cursor = frontier(&ring).ready.load(Ordering::Acquire);
        Ok(Self::new(Arc::new(ring), cursor))
    }

    #[inline(always)]
    fn lapped(&self, write: u64) -> bool {
        write.saturating_sub(self.cursor) >= self.ring.capacity() as u64
    }

    #[inline(always)]
    fn write_pos(&self) -> u64 {
        frontier(&self.ring).write.load(Ordering::Acquire)
    }

    /// Exposes the next record without consuming it.
    ///
    /// - `Again`: nothing new below `ready`.
    /// - `Desync`: the cursor is ahead of the queue (it was reset).
    /// - `Overflow`: writers have lapped the cursor.
    ///
    /// After `Overflow`/`Desync` call [`sync_pos`](Self::sync_pos).
    #[inline]
    pub fn take(&mut self) -> Result<Record<'_>, ReadError> {
        let f = frontier(&self.ring);
        let ready = f.ready.load(Ordering::Acquire);
        if ready == self.cursor {
            return Err(ReadError::Again);
        }
        let write = f.write.load(Ordering::Acquire);
        // ready <= write, so this also covers a cursor past `write`
        if self.cursor > ready {
            return Err(ReadError::Desync);
        }
        if self.lapped(write) {
            return Err(ReadError::Overflow);
        }

        let mut prefix = [0u8; LEN_PREFIX];
        self.ring.copy_out(self.cursor, &mut prefix);
        let len = i32::from_ne_bytes(prefix);
        let backlog = ready - self.cursor;
        if len < 0 || (LEN_PREFIX as u64 + len as u64) > backlog {
            // garbage prefix: either we were lapped mid-read or the ring is corrupt
            return Err(if self.lapped(self.write_pos()) {
                ReadError::Overflow
            } else {
                ReadError::Desync
            });
        }

        let len = len as usize;
        let position = self.cursor;
        let start = position + LEN_PREFIX as u64;
        let payload = match self.ring.try_borrow(start, len) {
            Some(bytes) => bytes,
            None => {
                self.scratch.resize(len, 0);
                self.ring.copy_out(start, &mut self.scratch);
                fence(Ordering::Acquire);
                if self.lapped(f.write.load(Ordering::Acquire)) {
                    return Err(ReadError::Overflow);
                }
                &self.scratch[..]
            }
        };
        Ok(Record { position, payload })
    }

    /// Consumes `span` bytes (a record's [`Record::span`]).
    ///
    /// Reports `Overflow` if writers lapped the record while it was being
    /// read; anything read from it must then be discarded. The cursor moves
    /// either way.
    #[inline]
    pub fn advance(&mut self, span: u64) -> Result<(), ReadError> {
        // order the caller's reads of the record before the re-check
        fence(Ordering::Acquire);
        let lapped = self.lapped(self.write_pos());
        self.cursor += span;
        if lapped {
            return Err(ReadError::Overflow);
        }
        Ok(())
    }

    /// Copies the next record's payload into `out` and consumes it.
    /// Returns the record's position.
    pub fn read_into(&mut self, out: &mut Vec<u8>) -> Result<u64, ReadError> {
        let record = self.take()?;
        let position = record.position;
        let span = record.span();
        out.clear();
        out.extend_from_slice(record.payload);
        self.advance(span)?;
        Ok(position)
    }

    /// Drops any backlog and jumps to the current `ready` boundary.
    pub fn sync_pos(&mut self) {
        self.cursor = frontier(&self.ring).ready.load(Ordering::Acquire);
        self.resyncs += 1;
    }

    pub fn position(&self) -> u64 {
        self.cursor
    }

    /// Published bytes not yet consumed.
    pub fn backlog(&self) -> u64 {
        frontier(&self.ring)
            .ready
            .load(Ordering::Acquire)
            .saturating_sub(self.cursor)
    }

    /// Number of `sync_pos` calls, i.e. gaps this reader accepted.
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}
