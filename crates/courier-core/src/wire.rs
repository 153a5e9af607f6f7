//! Courier wire format — one chunk record per UDP datagram.
//!
//! These types ARE the protocol. Every field, every size, every reserved bit
//! is part of the wire format. A record is a fixed 20-byte header followed by
//! an optional payload. A record without payload is a retry request: it asks
//! the original sender to retransmit the chunk at `index`.
//!
//! Multi-byte fields are little-endian and use zerocopy byteorder types, so
//! the header has alignment 1 and is read straight out of the receive buffer.
//! There is no unsafe code in this module.

use std::fmt;

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Message Identifier ───────────────────────────────────────────────────────

/// Width of a message identifier in bytes.
pub const MESSAGE_ID_LEN: usize = 8;

/// Opaque random token correlating every chunk and retry record of one message.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId([u8; MESSAGE_ID_LEN]);

impl MessageId {
    pub const fn from_bytes(bytes: [u8; MESSAGE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Draw a fresh identifier from the thread RNG.
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", hex::encode(self.0))
    }
}

// ── Record Header ────────────────────────────────────────────────────────────

/// Header preceding every chunk record.
///
/// Wire size: 20 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct RecordHeader {
    /// Random identifier shared by every record of one message.
    pub message_id: [u8; MESSAGE_ID_LEN],

    /// Position of this chunk within the message. Always `< length`.
    pub index: U32<LittleEndian>,

    /// Total chunk count of the message. Identical on every record, never zero.
    pub length: U32<LittleEndian>,

    /// Bytes following the header. Zero on retry records.
    pub payload_len: U16<LittleEndian>,

    /// Bit flags:
    ///   bit    0: payload present (clear = retry request)
    ///   bits 1-7: reserved, must be zero
    pub flags: u8,

    /// Wire format version. Currently 0x01.
    pub version: u8,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(RecordHeader, [u8; 20]);

// ── Constants ─────────────────────────────────────────────────────────────────

/// Size of [`RecordHeader`] on the wire.
pub const HEADER_LEN: usize = 20;

/// Bytes of every packet reserved for the record envelope. A packet size at
/// or below this leaves no room for payload and is rejected.
pub const ENVELOPE_OVERHEAD: usize = 26;

/// Current record format version.
pub const RECORD_VERSION: u8 = 0x01;

/// `flags` bit marking a payload-bearing record.
pub const FLAG_PAYLOAD: u8 = 0x01;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

// ── Chunk Record ──────────────────────────────────────────────────────────────

/// One decoded datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub message_id: MessageId,
    pub index: u32,
    pub length: u32,
    /// `None` turns the record into a retry request for `index`.
    pub payload: Option<Bytes>,
}

impl ChunkRecord {
    /// A payload-bearing record.
    pub fn data(message_id: MessageId, index: u32, length: u32, payload: Bytes) -> Self {
        Self {
            message_id,
            index,
            length,
            payload: Some(payload),
        }
    }

    /// A retry request asking the sender of `message_id` to resend `index`.
    pub fn retry(message_id: MessageId, index: u32, length: u32) -> Self {
        Self {
            message_id,
            index,
            length,
            payload: None,
        }
    }

    pub fn is_retry(&self) -> bool {
        self.payload.is_none()
    }

    /// Serialize into a single datagram.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        if self.length == 0 {
            return Err(WireError::ZeroLength);
        }
        if self.index >= self.length {
            return Err(WireError::IndexOutOfRange {
                index: self.index,
                length: self.length,
            });
        }

        let payload: &[u8] = self.payload.as_deref().unwrap_or_default();
        let payload_len =
            u16::try_from(payload.len()).map_err(|_| WireError::PayloadTooLarge(payload.len()))?;

        let header = RecordHeader {
            message_id: self.message_id.0,
            index: U32::new(self.index),
            length: U32::new(self.length),
            payload_len: U16::new(payload_len),
            flags: if self.payload.is_some() { FLAG_PAYLOAD } else { 0 },
            version: RECORD_VERSION,
        };

        let mut datagram = Vec::with_capacity(HEADER_LEN + payload.len());
        datagram.extend_from_slice(header.as_bytes());
        datagram.extend_from_slice(payload);
        Ok(datagram)
    }

    /// Parse a received datagram. Anything malformed is rejected whole.
    pub fn decode(datagram: &[u8]) -> Result<Self, WireError> {
        let header = RecordHeader::read_from_prefix(datagram)
            .ok_or(WireError::Truncated(datagram.len()))?;

        if header.version != RECORD_VERSION {
            return Err(WireError::UnknownVersion(header.version));
        }
        if header.flags & !FLAG_PAYLOAD != 0 {
            return Err(WireError::ReservedFlagsSet(header.flags));
        }

        let declared = usize::from(header.payload_len.get());
        let actual = datagram.len() - HEADER_LEN;
        if declared != actual {
            return Err(WireError::PayloadLengthMismatch { declared, actual });
        }

        let has_payload = header.flags & FLAG_PAYLOAD != 0;
        if !has_payload && declared != 0 {
            return Err(WireError::PayloadOnRetry(declared));
        }

        let index = header.index.get();
        let length = header.length.get();
        if length == 0 {
            return Err(WireError::ZeroLength);
        }
        if index >= length {
            return Err(WireError::IndexOutOfRange { index, length });
        }

        let payload = has_payload.then(|| Bytes::copy_from_slice(&datagram[HEADER_LEN..]));

        Ok(Self {
            message_id: MessageId(header.message_id),
            index,
            length,
            payload,
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram of {0} bytes is shorter than the {}-byte header", HEADER_LEN)]
    Truncated(usize),

    #[error("unknown record version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),

    #[error("header declares {declared} payload bytes, datagram carries {actual}")]
    PayloadLengthMismatch { declared: usize, actual: usize },

    #[error("retry record carries {0} payload bytes")]
    PayloadOnRetry(usize),

    #[error("message length is zero")]
    ZeroLength,

    #[error("chunk index {index} outside message of {length} chunks")]
    IndexOutOfRange { index: u32, length: u32 },

    #[error("payload length {0} exceeds maximum {}", u16::MAX)]
    PayloadTooLarge(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
