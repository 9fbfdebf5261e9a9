//! Sender-side queues.
//!
//! Application bytes are packed into a write queue of unstamped payloads, each
//! at most `segment_cap` bytes. Pushing stamps them with sequence numbers into
//! the retransmission queue, where they stay until cumulatively acknowledged.
//! Transmission stops exactly at the peer's latest grant: a segment that
//! straddles it is split and only the granted head goes out.

use std::collections::{BTreeMap, VecDeque};

use tracing::trace;

use crate::core::{NdError, NdResult};

use super::header::SegmentType;
use super::segment::Segment;

/// Effect of a cumulative ACK on the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckOutcome {
    /// Payload bytes released from the retransmission queue.
    pub freed: usize,
    /// No progress while data is outstanding: the receiver is nudging.
    pub duplicate: bool,
}

/// Write queue and retransmission queue of one connection.
#[derive(Debug)]
pub struct SendQueue {
    source: u16,
    dest: u16,
    segment_cap: usize,
    write_queue: VecDeque<Vec<u8>>,
    rtx: BTreeMap<u32, Segment>,
    queued: usize,
    write_seq: u32,
    snd_nxt: u32,
    snd_una: u32,
    grant_nxt: u32,
}

impl SendQueue {
    /// Create an empty sender for the given ports.
    pub fn new(source: u16, dest: u16, segment_cap: usize) -> Self {
        Self {
            source,
            dest,
            segment_cap,
            write_queue: VecDeque::new(),
            rtx: BTreeMap::new(),
            queued: 0,
            write_seq: 0,
            snd_nxt: 0,
            snd_una: 0,
            grant_nxt: 0,
        }
    }

    /// Next sequence number to stamp.
    pub fn write_seq(&self) -> u32 {
        self.write_seq
    }

    /// Next sequence number to transmit.
    pub fn snd_nxt(&self) -> u32 {
        self.snd_nxt
    }

    /// Oldest unacknowledged sequence number.
    pub fn snd_una(&self) -> u32 {
        self.snd_una
    }

    /// Latest grant watermark received from the peer.
    pub fn grant_nxt(&self) -> u32 {
        self.grant_nxt
    }

    /// Bytes accepted from the application but not yet stamped.
    pub fn queued(&self) -> usize {
        self.queued
    }

    /// Bytes held by both queues.
    pub fn wmem_queued(&self) -> usize {
        self.queued + (self.write_seq - self.snd_una) as usize
    }

    /// Bytes accepted from the application so far.
    pub fn accepted(&self) -> usize {
        self.write_seq as usize + self.queued
    }

    /// Whether stamped data is waiting for acknowledgement.
    pub fn has_outstanding(&self) -> bool {
        self.snd_una < self.write_seq
    }

    /// Copy up to `room` bytes of `data` into the write queue.
    ///
    /// The tail payload is topped up to `segment_cap` before a new one is
    /// started. Returns the number of bytes taken.
    pub fn append(&mut self, data: &[u8], room: usize) -> usize {
        let mut copied = 0;
        let limit = data.len().min(room);
        while copied < limit {
            let cap = self.segment_cap;
            if self.write_queue.back().is_none_or(|tail| tail.len() >= cap) {
                self.write_queue
                    .push_back(Vec::with_capacity(cap.min(limit - copied)));
            }
            let Some(tail) = self.write_queue.back_mut() else {
                break;
            };
            let take = (cap - tail.len()).min(limit - copied);
            tail.extend_from_slice(&data[copied..copied + take]);
            copied += take;
        }
        self.queued += copied;
        copied
    }

    /// Stamp every queued payload with a sequence number.
    ///
    /// Returns the number of segments stamped.
    pub fn stamp_pending(&mut self) -> usize {
        let count = self.write_queue.len();
        while let Some(payload) = self.write_queue.pop_front() {
            let len = payload.len();
            let seg = Segment::new(SegmentType::Data, self.source, self.dest, self.write_seq, payload);
            trace!(seq = self.write_seq, len, "stamped segment");
            self.write_seq += len as u32;
            self.queued -= len;
            self.rtx.insert(seg.seq, seg);
        }
        count
    }

    /// Raise the grant watermark; returns whether it moved.
    pub fn on_token(&mut self, grant_nxt: u32) -> bool {
        if grant_nxt > self.grant_nxt {
            self.grant_nxt = grant_nxt;
            true
        } else {
            false
        }
    }

    /// Encode every untransmitted byte up to the grant.
    ///
    /// Grants need not fall on segment boundaries; a segment crossing the
    /// grant is cut there and its tail stays queued under its own sequence.
    pub fn take_granted(&mut self) -> Vec<Vec<u8>> {
        let grant_nxt = self.grant_nxt;
        let mut wire = Vec::new();
        while self.snd_nxt < grant_nxt {
            let Some(seg) = self.rtx.get_mut(&self.snd_nxt) else {
                break;
            };
            let tail = (seg.end_seq() > grant_nxt).then(|| {
                let rest = seg.payload.split_off((grant_nxt - seg.seq) as usize);
                Segment::new(SegmentType::Data, seg.source, seg.dest, grant_nxt, rest)
            });
            wire.push(seg.encode());
            self.snd_nxt = seg.end_seq();
            if let Some(tail) = tail {
                trace!(seq = tail.seq, len = tail.len(), "segment split at grant");
                self.rtx.insert(tail.seq, tail);
            }
        }
        wire
    }

    /// Encode every transmitted but unacknowledged segment.
    pub fn retransmit_outstanding(&self) -> Vec<Vec<u8>> {
        self.rtx
            .range(self.snd_una..self.snd_nxt)
            .map(|(_, seg)| seg.encode())
            .collect()
    }

    /// Apply a cumulative ACK.
    pub fn on_ack(&mut self, ack: u32) -> NdResult<AckOutcome> {
        if ack > self.snd_nxt {
            return Err(NdError::Protocol(format!(
                "ack {ack} beyond snd_nxt {}",
                self.snd_nxt
            )));
        }
        if ack <= self.snd_una {
            return Ok(AckOutcome {
                freed: 0,
                duplicate: ack == self.snd_una && self.snd_nxt > self.snd_una,
            });
        }

        self.snd_una = ack;
        let mut freed = 0;
        while let Some(entry) = self.rtx.first_entry() {
            if entry.get().end_seq() > ack {
                break;
            }
            freed += entry.remove().len();
        }
        Ok(AckOutcome {
            freed,
            duplicate: false,
        })
    }

    /// Drop both queues; returns the payload bytes released.
    pub fn purge(&mut self) -> usize {
        let released = self.wmem_queued();
        self.write_queue.clear();
        self.rtx.clear();
        self.queued = 0;
        self.snd_una = self.write_seq;
        self.snd_nxt = self.write_seq;
        released
    }
}
