//! Stream-to-segment framing.

use crate::protocol::{HeaderError, Segment, peek_segment_len};

/// Accumulates stream bytes and cuts them into whole segments.
///
/// Each returned [`Segment`] owns a copy of its payload; the pending buffer
/// is compacted lazily once everything before the cursor has been framed.
#[derive(Debug, Default)]
pub struct SegmentFramer {
    pending: Vec<u8>,
    start: usize,
}

impl SegmentFramer {
    /// Create an empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        if self.start > 0 && self.start == self.pending.len() {
            self.pending.clear();
            self.start = 0;
        }
        self.pending.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet framed.
    pub fn buffered(&self) -> usize {
        self.pending.len() - self.start
    }

    /// Cut the next complete segment, if one is buffered.
    ///
    /// A header error means the stream is desynchronized; the caller should
    /// drop the channel.
    pub fn next_segment(&mut self) -> Result<Option<Segment>, HeaderError> {
        let buf = &self.pending[self.start..];
        let Some(len) = peek_segment_len(buf)? else {
            self.compact();
            return Ok(None);
        };
        let segment = Segment::decode(&buf[..len])?;
        self.start += len;
        Ok(Some(segment))
    }

    /// Frame up to `budget` segments.
    pub fn next_batch(&mut self, budget: usize) -> Result<Vec<Segment>, HeaderError> {
        let mut batch = Vec::new();
        while batch.len() < budget {
            match self.next_segment()? {
                Some(segment) => batch.push(segment),
                None => break,
            }
        }
        Ok(batch)
    }

    fn compact(&mut self) {
        if self.start > 0 {
            self.pending.drain(..self.start);
            self.start = 0;
        }
    }
}
