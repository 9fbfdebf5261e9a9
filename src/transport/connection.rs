//! Per-connection state.
//!
//! Two locks guard a connection. `inner` is the exclusive connection lock:
//! sender state, grant state, lifecycle and the pending error. `rx` is the
//! receive-queue lock: reassembly and receive memory. Lock order is
//! `inner` then `rx` then a scheduler core lock; neither connection lock is
//! ever taken while a scheduler lock is held, and neither is held across an
//! `.await`.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use super::timer::FlowWaitTimer;
use crate::core::{FlowId, FlowKey, NdConfig, NdError};
use crate::protocol::{FlowControl, ForwardMemory, ReceiveQueue, SendQueue};

/// A grant attempt was deferred and should run at the next opportunity.
pub(crate) const TOKEN_DEFERRED: u8 = 0x01;

/// The flow-wait timer expired and a nudge is pending.
pub(crate) const WAIT_DEFERRED: u8 = 0x02;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Not transferring: never opened, completed, or torn down.
    Closed,
    /// Sending a message.
    Sender,
    /// Receiving a message.
    Receiver,
}

/// Snapshot of a connection's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnStats {
    /// Lifecycle state.
    pub state: ConnState,
    /// Announced message length.
    pub total_length: u32,
    /// Sender: next sequence to stamp.
    pub write_seq: u32,
    /// Sender: next sequence to transmit.
    pub snd_nxt: u32,
    /// Sender: oldest unacknowledged sequence.
    pub snd_una: u32,
    /// Receiver: next expected sequence.
    pub rcv_nxt: u32,
    /// Receiver: sequence consumed by the application.
    pub copied_seq: u32,
    /// Grant watermark (issued by a receiver, observed by a sender).
    pub grant_nxt: u32,
    /// Receiver: granted bytes not yet arrived.
    pub in_flight_bytes: usize,
    /// Receiver: bytes parked out of order.
    pub backlog_len: usize,
    /// Receiver: malformed, out-of-grant, duplicate or overlapping segments dropped.
    pub anomalies: u64,
    /// Sender: segments sent again after a nudge.
    pub retransmits: u64,
    /// Whether the flow is queued in its core's scheduler.
    pub in_pq: bool,
    /// Whether the last arrival was dropped for lack of memory.
    pub rmem_exhausted: bool,
}

pub(crate) struct ConnInner {
    pub(crate) state: ConnState,
    pub(crate) established: bool,
    pub(crate) done: bool,
    pub(crate) closing: bool,
    pub(crate) send: SendQueue,
    pub(crate) wmem: ForwardMemory,
    pub(crate) flow: FlowControl,
    pub(crate) timer: FlowWaitTimer,
    pub(crate) error: Option<NdError>,
    pub(crate) rmem_exhausted: bool,
}

pub(crate) struct RxState {
    pub(crate) queue: ReceiveQueue,
    pub(crate) rmem: ForwardMemory,
}

/// Shared state of one connection.
pub(crate) struct Connection {
    pub(crate) id: FlowId,
    pub(crate) key: FlowKey,
    pub(crate) core_id: usize,
    pub(crate) inner: Mutex<ConnInner>,
    pub(crate) rx: Mutex<RxState>,
    pub(crate) in_pq: Arc<AtomicBool>,
    pub(crate) flags: Arc<AtomicU8>,
    pub(crate) interrupted: AtomicBool,
    pub(crate) torn_down: AtomicBool,
    pub(crate) retransmits: AtomicU64,
    pub(crate) readable: Notify,
    pub(crate) writable: Notify,
    pub(crate) established: Notify,
}

impl Connection {
    pub(crate) fn new(
        id: FlowId,
        key: FlowKey,
        core_id: usize,
        state: ConnState,
        total_length: u32,
        config: &NdConfig,
    ) -> Self {
        let inner = ConnInner {
            state,
            established: state == ConnState::Receiver,
            done: false,
            closing: false,
            send: SendQueue::new(key.local_port, key.remote_port, config.segment_cap),
            wmem: ForwardMemory::new(),
            flow: FlowControl::new(total_length, config),
            timer: FlowWaitTimer::new(),
            error: None,
            rmem_exhausted: false,
        };
        Self {
            id,
            key,
            core_id,
            inner: Mutex::new(inner),
            rx: Mutex::new(RxState {
                queue: ReceiveQueue::new(),
                rmem: ForwardMemory::new(),
            }),
            in_pq: Arc::new(AtomicBool::new(false)),
            flags: Arc::new(AtomicU8::new(0)),
            interrupted: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            retransmits: AtomicU64::new(0),
            readable: Notify::new(),
            writable: Notify::new(),
            established: Notify::new(),
        }
    }

    pub(crate) fn set_flag(&self, flag: u8) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    /// Clear `flag`; returns whether it was set.
    pub(crate) fn take_flag(&self, flag: u8) -> bool {
        self.flags.fetch_and(!flag, Ordering::AcqRel) & flag != 0
    }

    pub(crate) fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    pub(crate) fn wake_all(&self) {
        self.readable.notify_waiters();
        self.writable.notify_waiters();
        self.established.notify_waiters();
    }

    pub(crate) fn stats(&self, inner: &ConnInner, rx: &RxState) -> ConnStats {
        let grant_nxt = match inner.state {
            ConnState::Sender => inner.send.grant_nxt(),
            _ => inner.flow.grant_nxt(),
        };
        ConnStats {
            state: inner.state,
            total_length: inner.flow.total_length(),
            write_seq: inner.send.write_seq(),
            snd_nxt: inner.send.snd_nxt(),
            snd_una: inner.send.snd_una(),
            rcv_nxt: rx.queue.rcv_nxt(),
            copied_seq: rx.queue.copied_seq(),
            grant_nxt,
            in_flight_bytes: inner.flow.in_flight(),
            backlog_len: rx.queue.ofo_bytes(),
            anomalies: rx.queue.anomalies(),
            retransmits: self.retransmits.load(Ordering::Relaxed),
            in_pq: self.in_pq.load(Ordering::Acquire),
            rmem_exhausted: inner.rmem_exhausted,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("core_id", &self.core_id)
            .finish_non_exhaustive()
    }
}
