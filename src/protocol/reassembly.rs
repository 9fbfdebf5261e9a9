//! Receive-side reassembly.
//!
//! Data segments land either directly in the reader queue (when they start at
//! `rcv_nxt`) or in an ordered out-of-order tree keyed by sequence number.
//! A byte is never held in both places: any segment overlapping bytes already
//! held or delivered is handed back as a duplicate.

use std::collections::{BTreeMap, VecDeque};

use super::segment::Segment;

/// Where an arriving data segment ended up.
#[derive(Debug)]
pub enum Arrival {
    /// Appended to the reader queue; `rcv_nxt` moved forward by `advanced`.
    InOrder {
        /// Bytes by which `rcv_nxt` advanced, including drained successors.
        advanced: usize,
    },
    /// Parked in the out-of-order tree.
    OutOfOrder,
    /// Overlaps held or delivered bytes; ownership returns to the caller.
    Duplicate(Segment),
}

/// Bytes produced by one read pass.
#[derive(Debug, Default)]
pub struct ReadChunk {
    /// Copied bytes; empty in discard mode.
    pub data: Vec<u8>,
    /// Bytes consumed from the stream.
    pub consumed: usize,
    /// Payload bytes of segments that were fully consumed and dropped.
    pub freed: usize,
}

/// Ordered receive state of one connection.
#[derive(Debug, Default)]
pub struct ReceiveQueue {
    ofo: BTreeMap<u32, Segment>,
    reader: VecDeque<Segment>,
    head_consumed: usize,
    rcv_nxt: u32,
    copied_seq: u32,
    ofo_bytes: usize,
    unread: usize,
    anomalies: u64,
}

impl ReceiveQueue {
    /// Create an empty queue expecting sequence zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next expected in-order sequence number.
    pub fn rcv_nxt(&self) -> u32 {
        self.rcv_nxt
    }

    /// Sequence number up to which the reader has consumed.
    pub fn copied_seq(&self) -> u32 {
        self.copied_seq
    }

    /// Bytes parked in the out-of-order tree.
    pub fn ofo_bytes(&self) -> usize {
        self.ofo_bytes
    }

    /// Bytes ready for the reader.
    pub fn unread(&self) -> usize {
        self.unread
    }

    /// Whether the reader queue holds any segment.
    pub fn has_reader_data(&self) -> bool {
        !self.reader.is_empty()
    }

    /// Number of segments parked out of order.
    pub fn ofo_len(&self) -> usize {
        self.ofo.len()
    }

    /// Rejected segments seen so far: duplicates, overlaps and anything the
    /// engine refused through [`ReceiveQueue::note_anomaly`].
    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }

    /// Count a segment that was rejected before reaching the queue.
    pub fn note_anomaly(&mut self) {
        self.anomalies += 1;
    }

    /// Place an arriving data segment.
    pub fn insert(&mut self, seg: Segment) -> Arrival {
        let start = seg.seq;
        let end = seg.end_seq();

        if seg.is_empty() || start < self.rcv_nxt || self.overlaps_ofo(start, end) {
            self.anomalies += 1;
            return Arrival::Duplicate(seg);
        }

        if start > self.rcv_nxt {
            self.ofo_bytes += seg.len();
            self.ofo.insert(start, seg);
            return Arrival::OutOfOrder;
        }

        let before = self.rcv_nxt;
        self.push_reader(seg);
        while let Some(entry) = self.ofo.first_entry() {
            if *entry.key() != self.rcv_nxt {
                break;
            }
            let next = entry.remove();
            self.ofo_bytes -= next.len();
            self.push_reader(next);
        }
        Arrival::InOrder {
            advanced: (self.rcv_nxt - before) as usize,
        }
    }

    /// Consume up to `max_len` bytes in order.
    ///
    /// Partially consumed segments stay at the head of the reader queue.
    pub fn read(&mut self, max_len: usize, discard: bool) -> ReadChunk {
        let mut chunk = ReadChunk::default();
        while chunk.consumed < max_len {
            let Some(front) = self.reader.front() else {
                break;
            };
            let available = front.len() - self.head_consumed;
            let take = available.min(max_len - chunk.consumed);
            if !discard {
                chunk
                    .data
                    .extend_from_slice(&front.payload[self.head_consumed..self.head_consumed + take]);
            }
            self.head_consumed += take;
            chunk.consumed += take;

            if self.head_consumed == front.len() {
                chunk.freed += front.len();
                self.head_consumed = 0;
                self.reader.pop_front();
            }
        }
        self.copied_seq += chunk.consumed as u32;
        self.unread -= chunk.consumed;
        chunk
    }

    /// Drop every held segment; returns their total payload bytes.
    pub fn purge(&mut self) -> usize {
        let held = self.reader.iter().chain(self.ofo.values()).map(Segment::len).sum();
        self.reader.clear();
        self.ofo.clear();
        self.head_consumed = 0;
        self.ofo_bytes = 0;
        self.unread = 0;
        held
    }

    fn push_reader(&mut self, seg: Segment) {
        self.rcv_nxt = seg.end_seq();
        self.unread += seg.len();
        self.reader.push_back(seg);
    }

    fn overlaps_ofo(&self, start: u32, end: u32) -> bool {
        let before = self
            .ofo
            .range(..=start)
            .next_back()
            .is_some_and(|(_, prev)| prev.end_seq() > start);
        let after = self.ofo.range(start..end).next().is_some();
        before || after
    }
}
