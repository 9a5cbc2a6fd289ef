//! Wire format of the three frame kinds and the Internet-style checksum that protects them.
//!
//! ```ascii
//!  0: checksum (u16 LE) - one's complement checksum over the whole frame
//!  2: length (u16 LE) - total encoded length, also determines the frame kind
//!  4: ack number (u32 LE) - cumulative ack: everything up to and including this id is received
//!  8: sequence number (u32 LE) - DATA and EOS only
//! 12: payload - DATA only, `length - 12` bytes
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt::{Display, Formatter};

/// Encoded length of an ACK frame
pub const ACK_LEN: usize = 8;
/// Encoded length of a DATA / EOS frame without payload
pub const HEADER_LEN: usize = 12;
/// This is the biggest UDP payload over IPV4 - frames must fit into a single datagram
pub const MAX_DATAGRAM_LEN: usize = 65507;
pub const MAX_PAYLOAD_LEN: usize = MAX_DATAGRAM_LEN - HEADER_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    EndOfStream,
    Ack,
}

impl FrameKind {
    /// The frame kind is not transmitted explicitly, it is derived from the frame's length
    pub fn for_length(length: u16) -> Result<FrameKind, FrameError> {
        match length as usize {
            ACK_LEN => Ok(FrameKind::Ack),
            HEADER_LEN => Ok(FrameKind::EndOfStream),
            len if len > HEADER_LEN => Ok(FrameKind::Data),
            _ => Err(FrameError::BadLength { length }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// shorter than the smallest possible frame
    Truncated { received: usize },
    /// the length field does not correspond to any frame kind
    BadLength { length: u16 },
    /// the length field disagrees with the number of bytes that actually arrived
    LengthMismatch { length: u16, received: usize },
    ChecksumMismatch,
    PayloadTooLarge { payload_len: usize },
}

impl Display for FrameError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Truncated { received } => write!(f, "frame truncated: only {} bytes", received),
            FrameError::BadLength { length } => write!(f, "length field {} does not denote a frame kind", length),
            FrameError::LengthMismatch { length, received } => write!(f, "length field is {} but {} bytes were received", length, received),
            FrameError::ChecksumMismatch => write!(f, "checksum verification failed"),
            FrameError::PayloadTooLarge { payload_len } => write!(f, "payload of {} bytes exceeds the maximum of {}", payload_len, MAX_PAYLOAD_LEN),
        }
    }
}

impl std::error::Error for FrameError {}

/// A frame is immutable once built. The factory functions compute the checksum over the fully
///  populated frame, and [Frame::decode] only returns frames whose checksum verified, so the
///  fields of a `Frame` can always be trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    checksum: u16,
    length: u16,
    ack_number: u32,
    seq_number: u32,
    payload: Bytes,
}

impl Frame {
    pub fn ack(ack_number: u32) -> Frame {
        Self::finish(FrameKind::Ack, ack_number, 0, Bytes::new())
    }

    /// NB: An empty payload is rejected since it would be indistinguishable from end-of-stream
    ///  on the wire
    pub fn data(ack_number: u32, seq_number: u32, payload: Bytes) -> Result<Frame, FrameError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge { payload_len: payload.len() });
        }
        if payload.is_empty() {
            return Err(FrameError::BadLength { length: HEADER_LEN as u16 });
        }
        Ok(Self::finish(FrameKind::Data, ack_number, seq_number, payload))
    }

    pub fn end_of_stream(ack_number: u32, seq_number: u32) -> Frame {
        Self::finish(FrameKind::EndOfStream, ack_number, seq_number, Bytes::new())
    }

    fn finish(kind: FrameKind, ack_number: u32, seq_number: u32, payload: Bytes) -> Frame {
        let length = match kind {
            FrameKind::Ack => ACK_LEN,
            FrameKind::Data | FrameKind::EndOfStream => HEADER_LEN + payload.len(),
        };

        let mut frame = Frame {
            kind,
            checksum: 0,
            length: length as u16,
            ack_number,
            seq_number,
            payload,
        };
        frame.checksum = checksum(&frame.encode());
        frame
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn ack_number(&self) -> u32 {
        self.ack_number
    }

    /// ACK frames do not carry a sequence number
    pub fn seq_number(&self) -> Option<u32> {
        match self.kind {
            FrameKind::Ack => None,
            FrameKind::Data | FrameKind::EndOfStream => Some(self.seq_number),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.len());
        self.ser(&mut buf);
        buf
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.checksum);
        buf.put_u16_le(self.length);
        buf.put_u32_le(self.ack_number);
        if self.kind != FrameKind::Ack {
            debug_assert_eq!(self.len(), HEADER_LEN + self.payload.len(), "length field is inconsistent with the payload");
            buf.put_u32_le(self.seq_number);
            buf.put_slice(&self.payload);
        }
    }

    /// Parses a received datagram. Frames with a malformed length are rejected before the
    ///  checksum is even looked at; all other frames are returned only if their checksum
    ///  verifies.
    pub fn decode(buf: &[u8]) -> Result<Frame, FrameError> {
        if buf.len() < ACK_LEN {
            return Err(FrameError::Truncated { received: buf.len() });
        }

        let mut parse_buf = buf;
        let checksum = parse_buf.get_u16_le();
        let length = parse_buf.get_u16_le();
        let ack_number = parse_buf.get_u32_le();

        let kind = FrameKind::for_length(length)?;
        if length as usize != buf.len() {
            return Err(FrameError::LengthMismatch { length, received: buf.len() });
        }

        let seq_number = match kind {
            FrameKind::Ack => 0,
            FrameKind::Data | FrameKind::EndOfStream => parse_buf.get_u32_le(),
        };

        if self::checksum(buf) != 0 {
            return Err(FrameError::ChecksumMismatch);
        }

        Ok(Frame {
            kind,
            checksum,
            length,
            ack_number,
            seq_number,
            payload: Bytes::copy_from_slice(parse_buf),
        })
    }
}

/// Internet-style one's complement checksum (RFC 1071) over little-endian 16 bit words. An odd
///  trailing byte is treated as the low byte of a final word.
///
/// Computing this over a frame whose checksum field is zero yields the value to put into that
///  field; computing it over a received frame (including its checksum) yields zero iff the
///  frame is intact.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u16::from_le_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = words.remainder() {
        sum += *last as u32;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
