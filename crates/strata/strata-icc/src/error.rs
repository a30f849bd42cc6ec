use crate::shm_layout::HeaderError;
use strata_shm::ShmError;

/// Outcome of a read that did not produce a record.
///
/// `Again` is normal operation. `Overflow` and `Desync` both mean the reader's
/// cursor no longer points at valid data; the reader must resynchronise and
/// accept a gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    #[error("no new data")]
    Again,

    #[error("reader was lapped by the writers")]
    Overflow,

    #[error("reader cursor is ahead of the queue")]
    Desync,
}

/// Construction and write-side failures.
#[derive(Debug, thiserror::Error)]
pub enum IccError {
    #[error(transparent)]
    Shm(#[from] ShmError),

    #[error("segment header mismatch")]
    Header(#[from] HeaderError),

    #[error("queue is mapped read-only")]
    ReadOnly,

    #[error("invalid capacity {capacity}: {reason}")]
    InvalidCapacity {
        capacity: usize,
        reason: &'static str,
    },

    #[error("record is {actual} bytes, queue expects {expected}")]
    RecordLength { expected: usize, actual: usize },

    #[error("record of {len} bytes does not fit a {capacity}-byte ring")]
    PayloadTooLarge { len: usize, capacity: usize },

    #[error("failed to allocate {0} bytes")]
    Alloc(usize),
}
