//! Receiver-driven flow control.
//!
//! The receiver decides how many bytes the sender may put on the wire. A grant
//! is bounded by free receive buffer (minus bytes already granted but not yet
//! arrived), by the batch limit and by what is left of the message, and is
//! rounded down to whole offload units unless it covers the message tail.

use crate::core::NdConfig;

/// What the receiver should do about a flow right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantDecision {
    /// Send a TOKEN covering this many more bytes.
    Grant(usize),
    /// Bytes remain ungranted but no buffer is free; wait in the scheduler.
    Park,
    /// The whole message is already granted.
    Idle,
}

/// Receiver-side grant and acknowledgement state of one flow.
#[derive(Debug, Clone)]
pub struct FlowControl {
    total_length: u32,
    grant_nxt: u32,
    prev_grant_nxt: u32,
    new_grant_nxt: u32,
    in_flight: usize,
    last_ack: u32,
    prev_grant_bytes: usize,
    max_grant_batch: usize,
    max_gso_data: usize,
    ack_interval: usize,
}

impl FlowControl {
    /// Flow state for a message of `total_length` bytes.
    pub fn new(total_length: u32, config: &NdConfig) -> Self {
        Self {
            total_length,
            grant_nxt: 0,
            prev_grant_nxt: 0,
            new_grant_nxt: 0,
            in_flight: 0,
            last_ack: 0,
            prev_grant_bytes: 0,
            max_grant_batch: config.max_grant_batch,
            max_gso_data: config.max_gso_data,
            ack_interval: config.ack_interval(),
        }
    }

    /// Announced message length.
    pub fn total_length(&self) -> u32 {
        self.total_length
    }

    /// Highest sequence the sender is allowed to reach.
    pub fn grant_nxt(&self) -> u32 {
        self.grant_nxt
    }

    /// Grant watermark before the latest TOKEN.
    pub fn prev_grant_nxt(&self) -> u32 {
        self.prev_grant_nxt
    }

    /// Watermark carried by the latest TOKEN.
    pub fn new_grant_nxt(&self) -> u32 {
        self.new_grant_nxt
    }

    /// Granted bytes that have not arrived yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Size of the latest grant.
    pub fn prev_grant_bytes(&self) -> usize {
        self.prev_grant_bytes
    }

    /// Sequence carried by the latest ACK.
    pub fn last_ack(&self) -> u32 {
        self.last_ack
    }

    /// Bytes of the message not yet granted.
    pub fn ungranted(&self) -> usize {
        (self.total_length - self.grant_nxt) as usize
    }

    /// Whether granted bytes are still expected from the sender.
    pub fn outstanding(&self, rcv_nxt: u32) -> bool {
        self.grant_nxt > rcv_nxt
    }

    /// Grant size permitted by the buffer state.
    pub fn calc_grant(&self, rcvbuf: usize, rmem_alloc: usize) -> usize {
        let available = rcvbuf.saturating_sub(rmem_alloc + self.in_flight);
        let remaining = self.ungranted();
        let grant = available.min(self.max_grant_batch).min(remaining);
        if grant < remaining {
            grant - grant % self.max_gso_data
        } else {
            grant
        }
    }

    /// Decide between granting, parking in the scheduler and doing nothing.
    pub fn decide(&self, rcvbuf: usize, rmem_alloc: usize) -> GrantDecision {
        if self.ungranted() == 0 {
            return GrantDecision::Idle;
        }
        match self.calc_grant(rcvbuf, rmem_alloc) {
            0 => GrantDecision::Park,
            bytes => GrantDecision::Grant(bytes),
        }
    }

    /// Record a grant of `bytes`; returns the new watermark for the TOKEN.
    pub fn commit_grant(&mut self, bytes: usize) -> u32 {
        self.prev_grant_nxt = self.grant_nxt;
        self.grant_nxt += bytes as u32;
        self.new_grant_nxt = self.grant_nxt;
        self.in_flight += bytes;
        self.prev_grant_bytes = bytes;
        self.grant_nxt
    }

    /// Account for `len` newly arrived in-order or out-of-order bytes.
    pub fn on_data(&mut self, len: usize) {
        self.in_flight = self.in_flight.saturating_sub(len);
    }

    /// Whether a cumulative ACK is due.
    pub fn should_ack(&self, rcv_nxt: u32) -> bool {
        if rcv_nxt <= self.last_ack {
            return false;
        }
        rcv_nxt as usize >= self.last_ack as usize + self.ack_interval
            || rcv_nxt == self.total_length
    }

    /// Record that an ACK for `rcv_nxt` was sent.
    pub fn mark_acked(&mut self, rcv_nxt: u32) {
        self.last_ack = self.last_ack.max(rcv_nxt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NdConfigBuilder;

    fn config() -> NdConfig {
        NdConfigBuilder::new()
            .rcvbuf(1000)
            .segment_cap(100)
            .max_gso_data(100)
            .max_grant_batch(1000)
            .build()
            .unwrap()
    }

    #[test]
    fn test_grant_follows_buffer_occupancy() {
        let mut flow = FlowControl::new(5000, &config());
        assert_eq!(flow.decide(1000, 0), GrantDecision::Grant(1000));
        flow.commit_grant(1000);
        assert_eq!(flow.grant_nxt(), 1000);

        // 900 granted bytes arrive and sit unread
        flow.on_data(900);
        assert_eq!(flow.in_flight(), 100);
        assert_eq!(flow.decide(1000, 900), GrantDecision::Park);

        // reader consumed 500
        assert_eq!(flow.decide(1000, 400), GrantDecision::Grant(500));
        flow.commit_grant(500);
        assert_eq!(flow.prev_grant_nxt(), 1000);
        assert_eq!(flow.grant_nxt(), 1500);
    }

    #[test]
    fn test_grant_rounds_to_gso_units() {
        let flow = FlowControl::new(5000, &config());
        assert_eq!(flow.calc_grant(1000, 250), 700);
        assert_eq!(flow.calc_grant(1000, 950), 0);
    }

    #[test]
    fn test_tail_grant_is_exact() {
        let mut flow = FlowControl::new(1050, &config());
        flow.commit_grant(1000);
        flow.on_data(1000);
        // 50 bytes left: not a whole unit, still granted
        assert_eq!(flow.decide(1000, 0), GrantDecision::Grant(50));
        flow.commit_grant(50);
        assert_eq!(flow.decide(1000, 0), GrantDecision::Idle);
    }

    #[test]
    fn test_grant_nxt_is_monotonic() {
        let mut flow = FlowControl::new(10_000, &config());
        let mut last = 0;
        for rmem in [0, 300, 700, 100, 0] {
            if let GrantDecision::Grant(bytes) = flow.decide(1000, rmem) {
                let next = flow.commit_grant(bytes);
                assert!(next >= last);
                last = next;
            }
            flow.on_data(200);
        }
    }

    #[test]
    fn test_ack_cadence() {
        let mut flow = FlowControl::new(1000, &config());
        // interval = 1000 / 5
        assert!(!flow.should_ack(0));
        assert!(!flow.should_ack(199));
        assert!(flow.should_ack(200));
        flow.mark_acked(200);
        assert!(!flow.should_ack(300));
        assert!(flow.should_ack(400));
        flow.mark_acked(400);
        // message end always acknowledged
        assert!(flow.should_ack(1000));
    }
}
