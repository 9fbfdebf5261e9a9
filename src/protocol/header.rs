//! Segment header encoding and decoding.
//!
//! Wire format (16 bytes, network byte order):
//! ```text
//! +---------+------+------+---------+---------+-------+----------+---------+
//! | Length  | Type | Doff | Source  | Dest    | Check | Reserved | Seq     |
//! | 2 bytes | 1    | 1    | 2 bytes | 2 bytes | 2     | 2        | 4 bytes |
//! +---------+------+------+---------+---------+-------+----------+---------+
//! ```
//! The checksum is written as zero; integrity is left to the carrying stream.

use thiserror::Error;

use crate::core::constants::{DATA_OFFSET, HEADER_SIZE};

/// Errors decoding a segment header.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// Buffer shorter than required.
    #[error("segment too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size.
        actual: usize,
    },

    /// Unknown segment type.
    #[error("invalid segment type: 0x{0:02x}")]
    InvalidType(u8),

    /// Data offset does not describe a 16-byte header.
    #[error("invalid data offset: 0x{0:02x}")]
    InvalidDataOffset(u8),

    /// Payload shorter than the header claims.
    #[error("payload truncated: header says {declared} bytes, {available} available")]
    Truncated {
        /// Length from the header.
        declared: usize,
        /// Bytes present after the header.
        available: usize,
    },

    /// A SYNC or SYNC_ACK without its 4-byte length payload.
    #[error("handshake segment without total length")]
    MissingLength,
}

/// Segment type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SegmentType {
    /// Payload bytes.
    Data = 0x01,
    /// Connection request carrying the total message length.
    Sync = 0x02,
    /// Connection acceptance.
    SyncAck = 0x03,
    /// Receiver grant; `seq` is the new grant watermark.
    Token = 0x04,
    /// Cumulative acknowledgement; `seq` is the receiver's `rcv_nxt`.
    Ack = 0x05,
    /// End of connection.
    Fin = 0x06,
}

impl SegmentType {
    /// Parse segment type from a byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Data),
            0x02 => Some(Self::Sync),
            0x03 => Some(Self::SyncAck),
            0x04 => Some(Self::Token),
            0x05 => Some(Self::Ack),
            0x06 => Some(Self::Fin),
            _ => None,
        }
    }

    /// Convert segment type to its byte representation.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether this type is a control segment (no application payload).
    pub fn is_control(self) -> bool {
        self != Self::Data
    }
}

/// Decoded segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Payload length in bytes.
    pub len: u16,
    /// Segment type.
    pub kind: SegmentType,
    /// Source port.
    pub source: u16,
    /// Destination port.
    pub dest: u16,
    /// Sequence field; meaning depends on `kind`.
    pub seq: u32,
}

impl SegmentHeader {
    /// Serialize header to bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.len.to_be_bytes());
        buf[2] = self.kind.as_byte();
        buf[3] = DATA_OFFSET;
        buf[4..6].copy_from_slice(&self.source.to_be_bytes());
        buf[6..8].copy_from_slice(&self.dest.to_be_bytes());
        // check (8..10) and reserved (10..12) stay zero
        buf[12..16].copy_from_slice(&self.seq.to_be_bytes());
        buf
    }

    /// Parse header from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HeaderError> {
        if bytes.len() < HEADER_SIZE {
            return Err(HeaderError::TooShort {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let kind = SegmentType::from_byte(bytes[2]).ok_or(HeaderError::InvalidType(bytes[2]))?;
        if bytes[3] & 0xF0 != DATA_OFFSET {
            return Err(HeaderError::InvalidDataOffset(bytes[3]));
        }

        Ok(Self {
            len: u16::from_be_bytes([bytes[0], bytes[1]]),
            kind,
            source: u16::from_be_bytes([bytes[4], bytes[5]]),
            dest: u16::from_be_bytes([bytes[6], bytes[7]]),
            seq: u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        })
    }

    /// Total wire size of the segment this header describes.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.len as usize
    }
}

/// Length of the next complete segment at the front of `buf`, if any.
///
/// Returns `Ok(None)` while the header or payload is still incomplete.
pub fn peek_segment_len(buf: &[u8]) -> Result<Option<usize>, HeaderError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let header = SegmentHeader::from_bytes(buf)?;
    let total = header.wire_len();
    Ok((buf.len() >= total).then_some(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_type_roundtrip() {
        for byte in 0x01..=0x06 {
            let kind = SegmentType::from_byte(byte).unwrap();
            assert_eq!(kind.as_byte(), byte);
        }
        assert!(SegmentType::from_byte(0x00).is_none());
        assert!(SegmentType::from_byte(0x07).is_none());
    }

    #[test]
    fn test_header_wire_layout() {
        let header = SegmentHeader {
            len: 1500,
            kind: SegmentType::Data,
            source: 40000,
            dest: 9000,
            seq: 3000,
        };
        let bytes = header.to_bytes();
        assert_eq!(hex::encode(bytes), "05dc01409c4023280000000000000bb8");
    }

    #[test]
    fn test_header_decode() {
        let bytes = hex::decode("0000044000501f900000000000010000").unwrap();
        let header = SegmentHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.kind, SegmentType::Token);
        assert_eq!(header.source, 80);
        assert_eq!(header.dest, 8080);
        assert_eq!(header.seq, 65536);
        assert_eq!(header.len, 0);
    }

    #[test]
    fn test_header_too_short() {
        let result = SegmentHeader::from_bytes(&[0u8; 10]);
        assert!(matches!(
            result,
            Err(HeaderError::TooShort {
                expected: 16,
                actual: 10
            })
        ));
    }

    #[test]
    fn test_header_invalid_type_and_offset() {
        let mut bytes = SegmentHeader {
            len: 0,
            kind: SegmentType::Ack,
            source: 1,
            dest: 2,
            seq: 0,
        }
        .to_bytes();
        bytes[2] = 0x42;
        assert_eq!(
            SegmentHeader::from_bytes(&bytes),
            Err(HeaderError::InvalidType(0x42))
        );

        bytes[2] = SegmentType::Ack.as_byte();
        bytes[3] = 0x50;
        assert_eq!(
            SegmentHeader::from_bytes(&bytes),
            Err(HeaderError::InvalidDataOffset(0x50))
        );
    }

    #[test]
    fn test_peek_segment_len() {
        let header = SegmentHeader {
            len: 4,
            kind: SegmentType::Data,
            source: 1,
            dest: 2,
            seq: 0,
        };
        let mut buf = header.to_bytes().to_vec();
        assert_eq!(peek_segment_len(&buf[..8]).unwrap(), None);
        assert_eq!(peek_segment_len(&buf).unwrap(), None);
        buf.extend_from_slice(b"abcd");
        assert_eq!(peek_segment_len(&buf).unwrap(), Some(20));
        buf.extend_from_slice(b"next");
        assert_eq!(peek_segment_len(&buf).unwrap(), Some(20));
    }
}
