//! Owned segments.
//!
//! A [`Segment`] is move-only: ownership passes from the framing layer to the
//! reassembly tree, then to the reader queue, and finally to the reader that
//! copies the payload out. Nothing shares a segment's buffer.

use crate::core::constants::{HEADER_SIZE, SYNC_PAYLOAD_SIZE};

use super::header::{HeaderError, SegmentHeader, SegmentType};

/// One ND segment with its payload.
#[derive(Debug, PartialEq, Eq)]
pub struct Segment {
    /// Segment type.
    pub kind: SegmentType,
    /// Source port.
    pub source: u16,
    /// Destination port.
    pub dest: u16,
    /// Sequence field.
    pub seq: u32,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Segment {
    /// Create a segment.
    pub fn new(kind: SegmentType, source: u16, dest: u16, seq: u32, payload: Vec<u8>) -> Self {
        Self {
            kind,
            source,
            dest,
            seq,
            payload,
        }
    }

    /// A payload-less control segment.
    pub fn control(kind: SegmentType, source: u16, dest: u16, seq: u32) -> Self {
        Self::new(kind, source, dest, seq, Vec::new())
    }

    /// A SYNC or SYNC_ACK announcing the total message length.
    pub fn handshake(kind: SegmentType, source: u16, dest: u16, total_length: u32) -> Self {
        Self::new(kind, source, dest, 0, total_length.to_be_bytes().to_vec())
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Sequence number one past the last payload byte, saturating at
    /// `u32::MAX`.
    pub fn end_seq(&self) -> u32 {
        self.seq.saturating_add(self.payload.len() as u32)
    }

    /// Sequence number one past the last payload byte, or `None` when the
    /// payload runs past the end of the sequence space.
    pub fn checked_end_seq(&self) -> Option<u32> {
        self.seq.checked_add(self.payload.len() as u32)
    }

    /// Total message length carried by a handshake segment.
    pub fn total_length(&self) -> Result<u32, HeaderError> {
        let bytes: [u8; SYNC_PAYLOAD_SIZE] = self
            .payload
            .get(..SYNC_PAYLOAD_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or(HeaderError::MissingLength)?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// The header describing this segment.
    pub fn header(&self) -> SegmentHeader {
        SegmentHeader {
            len: self.payload.len() as u16,
            kind: self.kind,
            source: self.source,
            dest: self.dest,
            seq: self.seq,
        }
    }

    /// Encode header and payload into a fresh wire buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.header().to_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode exactly one segment from `bytes`, copying the payload out.
    ///
    /// Trailing bytes after the declared payload are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        let header = SegmentHeader::from_bytes(bytes)?;
        let declared = header.len as usize;
        let available = bytes.len() - HEADER_SIZE;
        if available < declared {
            return Err(HeaderError::Truncated {
                declared,
                available,
            });
        }
        Ok(Self {
            kind: header.kind,
            source: header.source,
            dest: header.dest,
            seq: header.seq,
            payload: bytes[HEADER_SIZE..HEADER_SIZE + declared].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_data() {
        let seg = Segment::new(SegmentType::Data, 40000, 9000, 1500, b"payload".to_vec());
        let wire = seg.encode();
        assert_eq!(wire.len(), HEADER_SIZE + 7);
        let decoded = Segment::decode(&wire).unwrap();
        assert_eq!(decoded, seg);
        assert_eq!(decoded.end_seq(), 1507);
    }

    #[test]
    fn test_decode_truncated_payload() {
        let seg = Segment::new(SegmentType::Data, 1, 2, 0, vec![7u8; 32]);
        let wire = seg.encode();
        let err = Segment::decode(&wire[..HEADER_SIZE + 10]).unwrap_err();
        assert_eq!(
            err,
            HeaderError::Truncated {
                declared: 32,
                available: 10
            }
        );
    }

    #[test]
    fn test_handshake_total_length() {
        let sync = Segment::handshake(SegmentType::Sync, 40000, 9000, 5000);
        let decoded = Segment::decode(&sync.encode()).unwrap();
        assert_eq!(decoded.total_length().unwrap(), 5000);

        let bare = Segment::control(SegmentType::Sync, 1, 2, 0);
        assert_eq!(bare.total_length(), Err(HeaderError::MissingLength));
    }

    #[test]
    fn test_end_seq_at_sequence_limit() {
        let seg = Segment::new(SegmentType::Data, 1, 2, u32::MAX - 10, vec![0u8; 100]);
        assert_eq!(seg.checked_end_seq(), None);
        assert_eq!(seg.end_seq(), u32::MAX);

        let last = Segment::new(SegmentType::Data, 1, 2, u32::MAX - 10, vec![0u8; 10]);
        assert_eq!(last.checked_end_seq(), Some(u32::MAX));
    }
}
