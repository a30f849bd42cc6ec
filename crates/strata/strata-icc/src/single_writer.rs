//! Single-writer, multi-reader queue of fixed-size records.
//!
//! One writer overwrites slot after slot without ever waiting; any number of
//! readers follow with private cursors. A reader that falls more than a ring's
//! worth behind is told so (`Overflow`) instead of being handed overwritten
//! bytes.
//!
//! # Thread Safety
//! - `SingleWriterQueue` is `Send` but `put` takes `&mut self`: exactly one
//!   writer per ring.
//! - `SlotReader` is `Send`; each reader owns its cursor.

use crate::error::{IccError, ReadError};
use crate::frontier::advance_to;
use crate::ring::RingBuffer;
use crate::shm_layout::{SLOT_HEADER_SIZE, SlotHeader};
use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};
use strata_shm::{Access, OpenStatus, SegmentSpec};
use tracing::info;

/// The writer side of a fixed-record queue.
pub struct SingleWriterQueue {
    ring: Arc<RingBuffer>,
    /// Record size `D` in bytes.
    record_len: usize,
}

/// A reader with a private cursor over a [`SingleWriterQueue`].
pub struct SlotReader {
    ring: Arc<RingBuffer>,
    record_len: u64,
    /// Position of the next record to read.
    cursor: u64,
    /// Records skipped by `catch_up`.
    overruns: u64,
}

fn check_shape(capacity: usize, record_len: usize) -> Result<(), IccError> {
    if record_len == 0 {
        return Err(IccError::InvalidCapacity {
            capacity,
            reason: "record length must be non-zero",
        });
    }
    if capacity < 2 * record_len {
        return Err(IccError::InvalidCapacity {
            capacity,
            reason: "must hold at least two records",
        });
    }
    Ok(())
}

impl SingleWriterQueue {
    /// Creates a process-local queue.
    ///
    /// # Errors
    /// `InvalidCapacity` when `record_len` is zero or `capacity` holds fewer
    /// than two records.
    pub fn heap(capacity: usize, record_len: usize) -> Result<Self, IccError> {
        check_shape(capacity, record_len)?;
        let ring = RingBuffer::heap(capacity, SLOT_HEADER_SIZE)?;
        Self::init(ring, record_len)
    }

    /// Creates or attaches the named shared queue as its writer.
    ///
    /// # Errors
    /// - `ReadOnly` for a read-only `spec`
    /// - `InvalidCapacity` as for [`heap`](Self::heap)
    /// - The segment cannot be opened or mapped
    /// - The existing header has another capacity or record length
    pub fn create(spec: &SegmentSpec, capacity: usize, record_len: usize) -> Result<Self, IccError> {
        if spec.access == Access::ReadOnly {
            return Err(IccError::ReadOnly);
        }
        check_shape(capacity, record_len)?;
        let ring = RingBuffer::shared(spec, capacity, SLOT_HEADER_SIZE)?;
        Self::init(ring, record_len)
    }

    fn init(ring: RingBuffer, record_len: usize) -> Result<Self, IccError> {
        let header = ring.header::<SlotHeader>();
        if matches!(ring.open_status(), Some(OpenStatus::Resized { .. })) {
            header.clear();
        }
        if header.stamp(ring.capacity() as u64, record_len as u64)? {
            info!(
                capacity = ring.capacity(),
                record_len, "initialised single-writer queue"
            );
        }
        Ok(Self {
            ring: Arc::new(ring),
            record_len,
        })
    }

    #[inline(always)]
    fn header(&self) -> &SlotHeader {
        self.ring.header::<SlotHeader>()
    }

    /// Overwrites the next slot with `content` and publishes it.
    ///
    /// Never waits: slow readers find out through `Overflow`.
    /// Returns the position the record was written at.
    ///
    /// # Errors
    /// `RecordLength` unless `content` is exactly one record long.
    #[inline]
    pub fn put(&mut self, content: &[u8]) -> Result<u64, IccError> {
        if content.len() != self.record_len {
            return Err(IccError::RecordLength {
                expected: self.record_len,
                actual: content.len(),
            });
        }
        let ready = &self.header().ready;
        // only this writer moves `ready`, Relaxed is enough to read it back
        let pos = ready.load(Ordering::Relaxed);
        self.ring.copy_in(pos, content);
        advance_to(ready, pos + self.record_len as u64);
        Ok(pos)
    }

    /// Next unpublished position.
    pub fn ready(&self) -> u64 {
        self.header().ready.load(Ordering::Acquire)
    }

    /// Record size `D` in bytes.
    pub fn record_len(&self) -> usize {
        self.record_len
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// A reader that only sees records published from now on.
    pub fn reader(&self) -> SlotReader {
        SlotReader::new(Arc::clone(&self.ring), self.record_len, self.ready())
    }

    /// A reader positioned at the oldest record still intact.
    pub fn reader_from_bottom(&self) -> SlotReader {
        let mut reader = SlotReader::new(Arc::clone(&self.ring), self.record_len, 0);
        reader.seek_to_bottom();
        reader
    }
}

impl SlotReader {
    fn new(ring: Arc<RingBuffer>, record_len: usize, cursor: u64) -> Self {
        Self {
            ring,
            record_len: record_len as u64,
            cursor,
            overruns: 0,
        }
    }

    /// Attaches read-only to a shared queue created by another process.
    ///
    /// Starts tail-following: only records published after attaching are
    /// returned.
    ///
    /// # Errors
    /// - Segment does not exist or has another size
    /// - Header is unstamped or was stamped with another shape
    pub fn attach(spec: &SegmentSpec, capacity: usize, record_len: usize) -> Result<Self, IccError> {
        check_shape(capacity, record_len)?;
        let ring = RingBuffer::shared(&spec.clone().read_only(), capacity, SLOT_HEADER_SIZE)?;
        let header = ring.header::<SlotHeader>();
        header.validate(capacity as u64, record_len as u64)?;
        let cursor = header.ready.load(Ordering::Acquire);
        Ok(Self::new(Arc::new(ring), record_len, cursor))
    }

    #[inline(always)]
    fn ready(&self) -> u64 {
        self.ring.header::<SlotHeader>().ready.load(Ordering::Acquire)
    }

    /// Largest backlog (in bytes) a reader may have and still find its next
    /// slot intact: `C - D`, rounded down to whole records.
    #[inline(always)]
    fn window(&self) -> u64 {
        let c = self.ring.capacity() as u64;
        ((c - self.record_len) / self.record_len) * self.record_len
    }

    /// Bytes between the cursor and `ready`, or `Desync` when the queue was
    /// reset behind the cursor.
    #[inline(always)]
    fn backlog(&self, ready: u64) -> Result<u64, ReadError> {
        if self.cursor > ready {
            return Err(ReadError::Desync);
        }
        let avail = ready - self.cursor;
        if avail > self.ring.capacity() as u64 - self.record_len {
            return Err(ReadError::Overflow);
        }
        Ok(avail)
    }

    /// Copies the next record into `dst` and advances.
    ///
    /// Returns the record's position. On `Overflow` or `Desync` the cursor is
    /// left where it was; use [`catch_up`](Self::catch_up) or one of the
    /// seeks to resynchronise.
    ///
    /// # Panics
    /// If `dst.len()` is not the queue's record length.
    #[inline]
    pub fn read(&mut self, dst: &mut [u8]) -> Result<u64, ReadError> {
        assert_eq!(dst.len() as u64, self.record_len, "destination must be one record");
        if self.backlog(self.ready())? == 0 {
            return Err(ReadError::Again);
        }
        self.ring.copy_out(self.cursor, dst);
        // the writer may have lapped us, or the queue been reset, while we copied
        fence(Ordering::Acquire);
        self.backlog(self.ready())?;
        let pos = self.cursor;
        self.cursor += self.record_len;
        Ok(pos)
    }

    /// Jumps to the most recently published record.
    pub fn seek_to_top(&mut self) {
        self.cursor = self.ready().saturating_sub(self.record_len);
    }

    /// Jumps to the oldest record that is still intact.
    pub fn seek_to_bottom(&mut self) {
        self.cursor = self.ready().saturating_sub(self.window());
    }

    /// Moves a lapped cursor to the oldest intact record and returns how
    /// many records were skipped. A cursor that is still valid is untouched.
    pub fn catch_up(&mut self) -> u64 {
        let ready = self.ready();
        if self.cursor > ready {
            // queue was reset underneath us: whatever is there now is new
            self.cursor = ready.saturating_sub(self.window());
            return 0;
        }
        if ready - self.cursor <= self.window() {
            return 0;
        }
        let bottom = ready - self.window();
        let skipped = (bottom - self.cursor) / self.record_len;
        self.overruns += skipped;
        self.cursor = bottom;
        skipped
    }

    /// Records published but not yet read (may exceed what is still intact).
    pub fn available(&self) -> u64 {
        self.ready().saturating_sub(self.cursor) / self.record_len
    }

    pub fn position(&self) -> u64 {
        self.cursor
    }

    /// Total records lost to `catch_up` since this reader was created.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }
}
