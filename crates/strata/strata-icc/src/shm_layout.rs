//! Header layouts for the control region at the front of every ring.
//!
//! The header is the only part of a ring that never wraps. It carries the
//! queue's counters plus enough identification for a process attaching to an
//! existing segment to check that it really holds a queue of the expected
//! shape.
//!
//! # Memory Layout
//!
//! ```text
//! SingleWriterQueue (one cache line)
//! ┌────────┬─────────┬──────────┬────────────┬─────────┐
//! │ magic  │ version │ capacity │ record_len │  ready  │
//! └────────┴─────────┴──────────┴────────────┴─────────┘
//!
//! MultiWriterQueue (two cache lines)
//! ┌────────┬─────────┬──────────┬─────────┬─────────┐
//! │ magic  │ version │ capacity │  write  │  dirty  │   line 0: writers
//! ├────────┴─────────┴──────────┴─────────┴─────────┤
//! │ ready                                            │   line 1: readers
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! Every field is an `AtomicU64`: a fresh segment is all zeroes, which is a
//! valid "unstamped" header.

use std::sync::atomic::{AtomicU64, Ordering};

/// "STRATASW": single-writer slot queue.
pub const SLOT_MAGIC: u64 = 0x5354_5241_5441_5357;

/// "STRATAMW": multi-writer record queue.
pub const RECORD_MAGIC: u64 = 0x5354_5241_5441_4D57;

/// Bump on any incompatible layout change.
pub const LAYOUT_VERSION: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("bad magic {found:#018x}")]
    BadMagic { found: u64 },

    #[error("layout version {found}, expected {}", LAYOUT_VERSION)]
    WrongVersion { found: u64 },

    #[error("capacity {found}, expected {expected}")]
    CapacityMismatch { expected: u64, found: u64 },

    #[error("record length {found}, expected {expected}")]
    RecordLenMismatch { expected: u64, found: u64 },
}

/// Marker for types that may be laid over the header region of a ring.
///
/// # Safety
/// Implementors must be `#[repr(C)]`, contain only atomics (so any bit
/// pattern, including all zeroes, is valid and shared access is sound), and
/// have an alignment of at most 64.
pub unsafe trait HeaderLayout: Sized {}

#[repr(C, align(64))]
pub struct SlotHeader {
    pub magic: AtomicU64,
    pub version: AtomicU64,
    pub capacity: AtomicU64,
    pub record_len: AtomicU64,
    /// Next unpublished position.
    pub ready: AtomicU64,
}

// SAFETY: repr(C), atomics only, align 64.
unsafe impl HeaderLayout for SlotHeader {}

#[repr(C, align(64))]
pub struct WriterLine {
    pub magic: AtomicU64,
    pub version: AtomicU64,
    pub capacity: AtomicU64,
    /// Next reservation start.
    pub write: AtomicU64,
    /// Cumulative bytes whose copy has completed.
    pub dirty: AtomicU64,
}

#[repr(C, align(64))]
pub struct ReaderLine {
    /// Everything below this position is fully written.
    pub ready: AtomicU64,
}

#[repr(C)]
pub struct RecordHeader {
    pub writers: WriterLine,
    pub readers: ReaderLine,
}

// SAFETY: repr(C) of two repr(C, align(64)) atomic-only lines.
unsafe impl HeaderLayout for RecordHeader {}

pub const SLOT_HEADER_SIZE: usize = size_of::<SlotHeader>();
pub const RECORD_HEADER_SIZE: usize = size_of::<RecordHeader>();

/// Shared stamping logic: whoever wins the `magic` CAS owns initialisation;
/// everyone else validates what the winner wrote.
fn stamp_or_validate(
    magic_word: &AtomicU64,
    version: &AtomicU64,
    magic: u64,
    init: impl FnOnce(),
    validate: impl FnOnce() -> Result<(), HeaderError>,
) -> Result<bool, HeaderError> {
    if magic_word.load(Ordering::Acquire) == 0 {
        init();
        version.store(LAYOUT_VERSION, Ordering::Relaxed);
        if magic_word
            .compare_exchange(0, magic, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Ok(true);
        }
    }
    check_magic(magic_word, version, magic)?;
    validate()?;
    Ok(false)
}

fn check_magic(magic_word: &AtomicU64, version: &AtomicU64, magic: u64) -> Result<(), HeaderError> {
    let found = magic_word.load(Ordering::Acquire);
    if found != magic {
        return Err(HeaderError::BadMagic { found });
    }
    let found = version.load(Ordering::Relaxed);
    if found != LAYOUT_VERSION {
        return Err(HeaderError::WrongVersion { found });
    }
    Ok(())
}

fn check_capacity(word: &AtomicU64, expected: u64) -> Result<(), HeaderError> {
    let found = word.load(Ordering::Relaxed);
    if found != expected {
        return Err(HeaderError::CapacityMismatch { expected, found });
    }
    Ok(())
}

impl SlotHeader {
    /// Initialises an unstamped header or validates an existing one.
    /// Returns `true` when this call did the stamping.
    pub fn stamp(&self, capacity: u64, record_len: u64) -> Result<bool, HeaderError> {
        stamp_or_validate(
            &self.magic,
            &self.version,
            SLOT_MAGIC,
            || {
                self.capacity.store(capacity, Ordering::Relaxed);
                self.record_len.store(record_len, Ordering::Relaxed);
            },
            || self.validate(capacity, record_len),
        )
    }

    pub fn validate(&self, capacity: u64, record_len: u64) -> Result<(), HeaderError> {
        check_magic(&self.magic, &self.version, SLOT_MAGIC)?;
        check_capacity(&self.capacity, capacity)?;
        let found = self.record_len.load(Ordering::Relaxed);
        if found != record_len {
            return Err(HeaderError::RecordLenMismatch {
                expected: record_len,
                found,
            });
        }
        Ok(())
    }

    /// Returns the header to its unstamped all-zero state.
    pub fn clear(&self) {
        self.magic.store(0, Ordering::Release);
        self.version.store(0, Ordering::Relaxed);
        self.capacity.store(0, Ordering::Relaxed);
        self.record_len.store(0, Ordering::Relaxed);
        self.ready.store(0, Ordering::Release);
    }
}

impl RecordHeader {
    pub fn stamp(&self, capacity: u64) -> Result<bool, HeaderError> {
        let w = &self.writers;
        stamp_or_validate(
            &w.magic,
            &w.version,
            RECORD_MAGIC,
            || w.capacity.store(capacity, Ordering::Relaxed),
            || self.validate(capacity),
        )
    }

    pub fn validate(&self, capacity: u64) -> Result<(), HeaderError> {
        check_magic(&self.writers.magic, &self.writers.version, RECORD_MAGIC)?;
        check_capacity(&self.writers.capacity, capacity)
    }

    pub fn clear(&self) {
        let w = &self.writers;
        w.magic.store(0, Ordering::Release);
        w.version.store(0, Ordering::Relaxed);
        w.capacity.store(0, Ordering::Relaxed);
        self.readers.ready.store(0, Ordering::Release);
        w.dirty.store(0, Ordering::Release);
        w.write.store(0, Ordering::Release);
    }
}
