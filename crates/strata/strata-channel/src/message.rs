use crate::ChannelError;

/// Reference carried by a request that has not been matched yet.
pub const UNSET_REF: u64 = u64::MAX;

/// Body of a positive acknowledgement.
pub const ACK: &[u8] = b"ACK";

/// `[kind: i32][reference: u64]` ahead of the body.
pub const MESSAGE_HEADER_SIZE: usize = 12;

/// A channel message.
///
/// ```text
/// [0..4)   kind:      i32, native endian
/// [4..12)  reference: u64, native endian (UNSET_REF on fresh requests)
/// [12..)   body
/// ```
///
/// Both ends of a queue live on the same host, so no byte order is imposed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: i32,
    pub reference: u64,
    pub body: Vec<u8>,
}

impl Message {
    /// A fresh message with an unset reference.
    pub fn new(kind: i32, body: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            reference: UNSET_REF,
            body: body.into(),
        }
    }

    /// A reply to `self`: same kind and reference, new body.
    pub fn reply(&self, body: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: self.kind,
            reference: self.reference,
            body: body.into(),
        }
    }

    #[inline]
    pub fn is_unmatched(&self) -> bool {
        self.reference == UNSET_REF
    }

    #[inline]
    pub fn is_ack(&self) -> bool {
        self.body == ACK
    }

    pub fn encoded_len(&self) -> usize {
        MESSAGE_HEADER_SIZE + self.body.len()
    }

    /// Writes the 12-byte header into `buf` (must be >= 12 bytes).
    pub fn write_header(kind: i32, reference: u64, buf: &mut [u8]) {
        assert!(buf.len() >= MESSAGE_HEADER_SIZE);
        buf[0..4].copy_from_slice(&kind.to_ne_bytes());
        buf[4..12].copy_from_slice(&reference.to_ne_bytes());
    }

    /// Encodes into a freshly allocated buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0; self.encoded_len()];
        Self::write_header(self.kind, self.reference, &mut out);
        out[MESSAGE_HEADER_SIZE..].copy_from_slice(&self.body);
        out
    }

    /// Decodes a record payload, copying the body.
    pub fn decode(buf: &[u8]) -> Result<Self, ChannelError> {
        if buf.len() < MESSAGE_HEADER_SIZE {
            return Err(ChannelError::Malformed { len: buf.len() });
        }
        Ok(Self {
            kind: i32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]),
            reference: u64::from_ne_bytes([
                buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
            ]),
            body: buf[MESSAGE_HEADER_SIZE..].to_vec(),
        })
    }
}
