mod error;
pub mod frontier;
mod multi_writer;
mod registry;
mod ring;
mod shm_layout;
mod single_writer;

pub use error::{IccError, ReadError};
pub use frontier::CounterSnapshot;
pub use multi_writer::{AdmissionPolicy, LEN_PREFIX, MultiWriterQueue, Record, RecordReader};
pub use registry::QueueRegistry;
pub use ring::{RingBuffer, position_to_offset};
pub use shm_layout::{HeaderError, RECORD_HEADER_SIZE, SLOT_HEADER_SIZE};
pub use single_writer::{SingleWriterQueue, SlotReader};
pub use strata_shm::{Access, SegmentSpec, ShmError};
