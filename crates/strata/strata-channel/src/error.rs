use std::time::Duration;
use strata_icc::{IccError, ReadError};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("no reply to request {reference} within {waited:?}")]
    Timeout { reference: u64, waited: Duration },

    /// The inbound reader was resynchronised; messages were lost.
    #[error("inbound gap: {0}")]
    Gap(ReadError),

    #[error("record of {len} bytes is too short for a message")]
    Malformed { len: usize },

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Queue(#[from] IccError),
}
