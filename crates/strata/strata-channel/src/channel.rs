use crate::{ACK, ChannelError, MESSAGE_HEADER_SIZE, Message, UNSET_REF};
use std::time::{Duration, Instant};
use strata_icc::{MultiWriterQueue, ReadError, RecordReader};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Timeout used by [`MessageChannel::request`].
    pub request_timeout: Duration,
    /// Sleep between empty polls while waiting for a reply.
    pub poll_interval: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_micros(50),
        }
    }
}

/// One reader on the inbound queue paired with a writer on the outbound
/// queue.
///
/// # Thread Safety
///
/// A channel owns a private cursor and is not `Sync`-shareable in any useful
/// way: give each thread its own channel. Any number of channels may point
/// at the same two queues.
pub struct MessageChannel {
    inbound: RecordReader,
    outbound: MultiWriterQueue,
    options: ChannelOptions,
}

impl MessageChannel {
    pub fn new(inbound: RecordReader, outbound: MultiWriterQueue, options: ChannelOptions) -> Self {
        Self {
            inbound,
            outbound,
            options,
        }
    }

    /// Server end over `requests`/`responses`, reading requests published
    /// from now on.
    pub fn server(requests: &MultiWriterQueue, responses: &MultiWriterQueue, options: ChannelOptions) -> Self {
        Self::new(requests.reader(), responses.clone(), options)
    }

    /// Client end over `requests`/`responses`.
    pub fn client(requests: &MultiWriterQueue, responses: &MultiWriterQueue, options: ChannelOptions) -> Self {
        Self::new(responses.reader(), requests.clone(), options)
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    /// Times the inbound reader had to skip lost data.
    pub fn resyncs(&self) -> u64 {
        self.inbound.resyncs()
    }

    /// Writes `msg` to the outbound queue as is. Returns its position.
    pub fn publish(&self, msg: &Message) -> Result<u64, ChannelError> {
        self.send(msg.kind, msg.reference, &msg.body)
    }

    fn send(&self, kind: i32, reference: u64, body: &[u8]) -> Result<u64, ChannelError> {
        let mut header = [0u8; MESSAGE_HEADER_SIZE];
        Message::write_header(kind, reference, &mut header);
        Ok(self.outbound.put_vectored(&[&header, body])?)
    }

    /// Returns the next inbound message whose kind is in `filter` (any kind
    /// when `filter` is empty), or `None` once the queue is drained.
    ///
    /// Fresh requests come back with `reference` set to their position, which
    /// is what the requester waits for. Replies built with
    /// [`Message::reply`] carry it back.
    pub fn next_message(&mut self, filter: &[i32]) -> Result<Option<Message>, ChannelError> {
        while let Some((position, mut msg)) = self.read_one()? {
            if !filter.is_empty() && !filter.contains(&msg.kind) {
                trace!(kind = msg.kind, position, "skipping filtered message");
                continue;
            }
            if msg.is_unmatched() {
                msg.reference = position;
            }
            return Ok(Some(msg));
        }
        Ok(None)
    }

    /// Sends `msg` as a fresh request and waits up to `timeout` for the
    /// first reply carrying its reference.
    pub fn request_sync(&mut self, msg: &Message, timeout: Duration) -> Result<Message, ChannelError> {
        let reference = self.send(msg.kind, UNSET_REF, &msg.body)?;
        debug!(kind = msg.kind, reference, "request sent");
        let mut replies = self.await_replies(reference, timeout, true)?;
        Ok(replies.swap_remove(0))
    }

    /// [`request_sync`](Self::request_sync) with the configured timeout.
    pub fn request(&mut self, msg: &Message) -> Result<Message, ChannelError> {
        self.request_sync(msg, self.options.request_timeout)
    }

    /// Sends `msg` as a fresh request and collects every reply that arrives
    /// within `window`. Several servers may answer the same request.
    pub fn request_all(&mut self, msg: &Message, window: Duration) -> Result<Vec<Message>, ChannelError> {
        let reference = self.send(msg.kind, UNSET_REF, &msg.body)?;
        debug!(kind = msg.kind, reference, "fan-out request sent");
        self.await_replies(reference, window, false)
    }

    /// Acknowledges `request` by sending it back with an `ACK` body.
    pub fn update_ack(&self, request: &Message) -> Result<u64, ChannelError> {
        self.send(request.kind, request.reference, ACK)
    }

    /// Rejects `request`; the requester sees `reason`.
    pub fn nack(&self, request: &Message, reason: &str) -> Result<u64, ChannelError> {
        self.send(request.kind, request.reference, reason.as_bytes())
    }

    /// Sends `msg` and expects an `ACK` back.
    pub fn request_and_check_ack(&mut self, msg: &Message, timeout: Duration) -> Result<(), ChannelError> {
        let reply = self.request_sync(msg, timeout)?;
        if reply.is_ack() {
            Ok(())
        } else {
            Err(ChannelError::Rejected(String::from_utf8_lossy(&reply.body).into_owned()))
        }
    }

    fn await_replies(&mut self, reference: u64, timeout: Duration, first_only: bool) -> Result<Vec<Message>, ChannelError> {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut replies = Vec::new();
        loop {
            match self.read_one() {
                Ok(Some((_, reply))) if reply.reference == reference => {
                    debug!(reference, elapsed = ?start.elapsed(), "reply matched");
                    replies.push(reply);
                    if first_only {
                        return Ok(replies);
                    }
                }
                Ok(Some((position, other))) => {
                    trace!(position, kind = other.kind, reference = other.reference, "dropping unrelated message");
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    std::thread::sleep(self.options.poll_interval);
                    continue;
                }
                // the reader already resynced and logged; keep waiting
                Err(ChannelError::Gap(_)) => {}
                Err(ChannelError::Malformed { len }) => {
                    warn!(len, "dropping malformed inbound record");
                }
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                break;
            }
        }
        if replies.is_empty() {
            warn!(reference, ?timeout, "request timed out");
            return Err(ChannelError::Timeout {
                reference,
                waited: timeout,
            });
        }
        Ok(replies)
    }

    /// Decodes and consumes one inbound record.
    fn read_one(&mut self) -> Result<Option<(u64, Message)>, ChannelError> {
        let (position, span, decoded) = match self.inbound.take() {
            Ok(rec) => (rec.position, rec.span(), Message::decode(rec.payload)),
            Err(ReadError::Again) => return Ok(None),
            Err(e) => return Err(self.resync(e)),
        };
        // a lap during decode invalidates what was copied
        if let Err(e) = self.inbound.advance(span) {
            return Err(self.resync(e));
        }
        decoded.map(|msg| Some((position, msg)))
    }

    fn resync(&mut self, cause: ReadError) -> ChannelError {
        let from = self.inbound.position();
        self.inbound.sync_pos();
        warn!(%cause, from, to = self.inbound.position(), "inbound reader resynchronised");
        ChannelError::Gap(cause)
    }
}

impl std::fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageChannel")
            .field("inbound_position", &self.inbound.position())
            .field("outbound", &self.outbound)
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_icc::AdmissionPolicy;

    fn queues() -> (MultiWriterQueue, MultiWriterQueue) {
        (
            MultiWriterQueue::heap(4096, AdmissionPolicy::BestEffort).unwrap(),
            MultiWriterQueue::heap(4096, AdmissionPolicy::BestEffort).unwrap(),
        )
    }

    fn quick() -> ChannelOptions {
        ChannelOptions {
            request_timeout: Duration::from_millis(20),
            poll_interval: Duration::from_micros(10),
        }
    }

    #[test]
    fn server_sees_request_position_as_reference() {
        let (requests, responses) = queues();
        let mut server = MessageChannel::server(&requests, &responses, quick());
        let client = MessageChannel::client(&requests, &responses, quick());

        client.publish(&Message::new(1, "a")).unwrap();
        let pos = client.send(1, UNSET_REF, b"b").unwrap();

        let first = server.next_message(&[]).unwrap().unwrap();
        assert_eq!(first.reference, 0);
        let second = server.next_message(&[]).unwrap().unwrap();
        assert_eq!(second.reference, pos);
        assert_eq!(second.body, b"b");
        assert!(server.next_message(&[]).unwrap().is_none());
    }

    #[test]
    fn set_references_pass_through() {
        let (requests, responses) = queues();
        let mut server = MessageChannel::server(&requests, &responses, quick());
        let client = MessageChannel::client(&requests, &responses, quick());

        let mut msg = Message::new(4, "update");
        msg.reference = 77;
        client.publish(&msg).unwrap();
        assert_eq!(server.next_message(&[]).unwrap(), Some(msg));
    }

    #[test]
    fn request_matches_prepublished_reply() {
        let (requests, responses) = queues();
        let mut client = MessageChannel::client(&requests, &responses, quick());
        let server = MessageChannel::server(&requests, &responses, quick());

        // noise first, then the reply for the position the request will get
        server.publish(&Message::new(2, "noise")).unwrap();
        let expected = requests.counters().write;
        let mut reply = Message::new(5, "pong");
        reply.reference = expected;
        server.publish(&reply).unwrap();

        let got = client.request(&Message::new(5, "ping")).unwrap();
        assert_eq!(got, reply);
    }

    #[test]
    fn request_times_out() {
        let (requests, responses) = queues();
        let mut client = MessageChannel::client(&requests, &responses, quick());
        let err = client.request(&Message::new(1, "lonely")).unwrap_err();
        assert!(matches!(err, ChannelError::Timeout { reference: 0, .. }));
    }

    #[test]
    fn filter_skips_other_kinds() {
        let (requests, responses) = queues();
        let mut server = MessageChannel::server(&requests, &responses, quick());
        let client = MessageChannel::client(&requests, &responses, quick());

        for kind in [1, 2, 3, 2] {
            client.publish(&Message::new(kind, vec![kind as u8])).unwrap();
        }
        let a = server.next_message(&[2]).unwrap().unwrap();
        let b = server.next_message(&[2]).unwrap().unwrap();
        assert_eq!((a.kind, b.kind), (2, 2));
        assert!(a.reference < b.reference);
        assert!(server.next_message(&[2]).unwrap().is_none());
    }

    #[test]
    fn malformed_record_is_reported_then_skipped() {
        let (requests, responses) = queues();
        let mut server = MessageChannel::server(&requests, &responses, quick());
        requests.put(b"short").unwrap();
        let client = MessageChannel::client(&requests, &responses, quick());
        client.publish(&Message::new(1, "ok")).unwrap();

        assert!(matches!(server.next_message(&[]), Err(ChannelError::Malformed { len: 5 })));
        assert_eq!(server.next_message(&[]).unwrap().unwrap().body, b"ok");
    }

    #[test]
    fn reset_queue_surfaces_gap_and_recovers() {
        let (requests, responses) = queues();
        let mut server = MessageChannel::server(&requests, &responses, quick());
        let client = MessageChannel::client(&requests, &responses, quick());

        client.publish(&Message::new(1, "before")).unwrap();
        assert!(server.next_message(&[]).unwrap().is_some());
        requests.reset();
        assert!(matches!(server.next_message(&[]), Err(ChannelError::Gap(ReadError::Desync))));
        assert_eq!(server.resyncs(), 1);

        client.publish(&Message::new(1, "after")).unwrap();
        assert_eq!(server.next_message(&[]).unwrap().unwrap().body, b"after");
    }

    #[test]
    fn fan_out_window_holds_under_a_stream_of_replies() {
        let (requests, responses) = queues();
        let server = MessageChannel::server(&requests, &responses, quick());
        let mut client = MessageChannel::client(&requests, &responses, quick());

        let mut req = Message::new(4, "quote?");
        req.reference = requests.counters().write;
        for _ in 0..100 {
            server.update_ack(&req).unwrap();
        }
        // an elapsed window stops collection even though more replies match
        let replies = client.request_all(&Message::new(4, "quote?"), Duration::ZERO).unwrap();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].is_ack());
    }

    #[test]
    fn ack_and_nack_helpers() {
        let (requests, responses) = queues();
        let server = MessageChannel::server(&requests, &responses, quick());
        let mut client = MessageChannel::client(&requests, &responses, quick());

        let mut req = Message::new(8, "order");
        req.reference = requests.counters().write;
        server.update_ack(&req).unwrap();
        client.request_and_check_ack(&Message::new(8, "order"), Duration::from_millis(20)).unwrap();

        req.reference = requests.counters().write;
        server.nack(&req, "insufficient margin").unwrap();
        let err = client
            .request_and_check_ack(&Message::new(8, "order"), Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, ChannelError::Rejected(reason) if reason == "insufficient margin"));
    }
}
