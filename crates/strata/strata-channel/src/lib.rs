//! Request/response and publish/subscribe messaging over a pair of
//! multi-writer queues.
//!
//! A channel reads from one queue ("inbound") and writes to another
//! ("outbound"). A client and the servers it talks to use the same two
//! queues with the roles swapped:
//!
//! ```text
//! client  --put-->  [requests]  --take-->  server(s)
//! client  <--take-- [responses] <--put---  server(s)
//! ```
//!
//! Requests are correlated by the position the request was reserved at in
//! the requests queue. The server learns that position from its own cursor,
//! so no id table is kept on either side.

mod channel;
mod error;
mod message;

pub use channel::{ChannelOptions, MessageChannel};
pub use error::ChannelError;
pub use message::{ACK, MESSAGE_HEADER_SIZE, Message, UNSET_REF};
