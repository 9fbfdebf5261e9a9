//! The ND stack: connection registry, segment demultiplexer and driver task.
//!
//! A stack owns everything that the engine shares between connections: the
//! memory pool, the per-core scheduler, the flow table and the listeners.
//! Timer expiries and memory releases are posted as [`EngineEvent`]s to one
//! driver task per stack, which performs the follow-up work under the
//! affected connection's lock.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use super::connection::{ConnInner, ConnState, Connection, TOKEN_DEFERRED, WAIT_DEFERRED};
use super::socket::{NdListener, NdSocket};
use super::wire::{SegmentSink, Transmit};
use crate::core::constants::EPHEMERAL_PORT_START;
use crate::core::{FlowId, FlowKey, NdConfig, NdError, NdResult, PriorityClass, lock};
use crate::protocol::{
    Arrival, CoreScheduler, GrantDecision, MemoryPool, ReadChunk, Segment, SegmentType,
};

/// Work posted to the driver task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EngineEvent {
    /// The flow-wait timer of this flow expired.
    FlowWait(FlowId),
    /// Quota went back to the pool; parked flows may now be granted.
    MemoryFreed,
}

#[derive(Debug, Default)]
struct FlowTable {
    by_key: HashMap<FlowKey, Arc<Connection>>,
    by_id: HashMap<FlowId, Arc<Connection>>,
}

pub(crate) struct StackShared {
    pub(crate) config: NdConfig,
    pub(crate) pool: Arc<MemoryPool>,
    pub(crate) scheduler: CoreScheduler,
    pub(crate) events: UnboundedSender<EngineEvent>,
    pub(crate) runtime: Handle,
    transmit: Arc<dyn Transmit>,
    flows: Mutex<FlowTable>,
    pub(crate) listeners: Mutex<HashMap<u16, UnboundedSender<NdSocket>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    next_flow: AtomicU64,
    next_port: AtomicU32,
    freed_pending: AtomicBool,
    closed: AtomicBool,
}

/// Handle to an ND protocol stack. Cheap to clone.
#[derive(Clone)]
pub struct NdStack {
    shared: Arc<StackShared>,
}

impl NdStack {
    /// Start a stack with its own memory pool.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: NdConfig, transmit: Arc<dyn Transmit>) -> NdResult<Self> {
        let pool = Arc::new(MemoryPool::from_config(&config));
        Self::with_pool(config, transmit, pool)
    }

    /// Start a stack drawing from a shared memory pool.
    pub fn with_pool(
        config: NdConfig,
        transmit: Arc<dyn Transmit>,
        pool: Arc<MemoryPool>,
    ) -> NdResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| NdError::Config("an ND stack needs a tokio runtime".into()))?;
        let (events, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(StackShared {
            scheduler: CoreScheduler::new(config.cores),
            config,
            pool,
            events,
            runtime: runtime.clone(),
            transmit,
            flows: Mutex::default(),
            listeners: Mutex::default(),
            driver: Mutex::new(None),
            next_flow: AtomicU64::new(1),
            next_port: AtomicU32::new(0),
            freed_pending: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let driver = runtime.spawn(drive(Arc::downgrade(&shared), event_rx));
        *lock(&shared.driver) = Some(driver);
        info!(
            cores = shared.scheduler.cores(),
            rcvbuf = shared.config.rcvbuf,
            mem_limits = ?shared.pool.limits(),
            "ND stack started"
        );
        Ok(Self { shared })
    }

    /// Stack configuration.
    pub fn config(&self) -> &NdConfig {
        &self.shared.config
    }

    /// Memory pool backing this stack.
    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.shared.pool
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        lock(&self.shared.flows).by_id.len()
    }

    /// Flows parked in the scheduler across all cores.
    pub fn parked_flows(&self) -> usize {
        let sched = &self.shared.scheduler;
        (0..sched.cores()).map(|core| sched.len(core)).sum()
    }

    /// Open a connection that will send `total_length` bytes to `peer`.
    #[instrument(skip(self))]
    pub async fn connect(
        &self,
        peer: IpAddr,
        remote_port: u16,
        total_length: u32,
    ) -> NdResult<NdSocket> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(NdError::NotConnected);
        }
        let conn = shared.register_outbound(peer, remote_port, total_length)?;
        let socket = NdSocket::new(Arc::clone(&conn), Arc::clone(shared));

        let established = conn.established.notified();
        tokio::pin!(established);
        established.as_mut().enable();
        shared.send_handshake(&conn, SegmentType::Sync, total_length);

        if tokio::time::timeout(shared.config.connect_timeout, established)
            .await
            .is_err()
        {
            warn!(flow = %conn.id, "SYNC not answered");
            return Err(NdError::TimedOut);
        }

        {
            let mut inner = lock(&conn.inner);
            if !inner.established {
                return Err(inner.error.take().unwrap_or(NdError::ConnectionReset));
            }
        }
        info!(flow = %conn.id, key = %conn.key, "connected");
        Ok(socket)
    }

    /// Accept connections addressed to `port`.
    pub fn listen(&self, port: u16) -> NdResult<NdListener> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(NdError::NotConnected);
        }
        let mut listeners = lock(&shared.listeners);
        if listeners.contains_key(&port) {
            return Err(NdError::Io(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("ND port {port} already has a listener"),
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(port, tx);
        debug!(port, "listening");
        Ok(NdListener::new(port, rx, Arc::clone(shared)))
    }

    /// Feed one arrived segment into the demultiplexer.
    pub fn on_segment_arrived(&self, peer: IpAddr, segment: Segment) {
        self.shared.arrive(peer, segment);
    }

    /// Decode and feed one raw segment.
    pub fn on_bytes(&self, peer: IpAddr, raw: &[u8]) -> NdResult<()> {
        let segment = Segment::decode(raw)?;
        self.shared.arrive(peer, segment);
        Ok(())
    }

    /// Abort every connection, drop all listeners and stop the driver.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&shared.listeners).clear();
        let conns: Vec<Arc<Connection>> = lock(&shared.flows).by_id.values().cloned().collect();
        for conn in &conns {
            shared.abort(conn, "stack shutdown");
        }
        if let Some(driver) = lock(&shared.driver).take() {
            driver.abort();
        }
        info!(aborted = conns.len(), "ND stack shut down");
    }
}

impl SegmentSink for NdStack {
    fn deliver(&self, peer: IpAddr, segments: Vec<Segment>) {
        for segment in segments {
            self.shared.arrive(peer, segment);
        }
    }
}

impl std::fmt::Debug for NdStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NdStack")
            .field("connections", &self.connection_count())
            .field("pool_allocated", &self.shared.pool.allocated())
            .finish()
    }
}

async fn drive(shared: Weak<StackShared>, mut events: UnboundedReceiver<EngineEvent>) {
    while let Some(event) = events.recv().await {
        let Some(stack) = shared.upgrade() else {
            break;
        };
        match event {
            EngineEvent::FlowWait(flow) => stack.on_flow_wait(flow),
            EngineEvent::MemoryFreed => stack.on_memory_freed(),
        }
    }
    trace!("driver stopped");
}

impl StackShared {
    fn lookup(&self, key: &FlowKey) -> Option<Arc<Connection>> {
        lock(&self.flows).by_key.get(key).cloned()
    }

    fn lookup_id(&self, id: FlowId) -> Option<Arc<Connection>> {
        lock(&self.flows).by_id.get(&id).cloned()
    }

    fn next_flow_id(&self) -> FlowId {
        FlowId(self.next_flow.fetch_add(1, Ordering::Relaxed))
    }

    fn register_outbound(
        &self,
        peer: IpAddr,
        remote_port: u16,
        total_length: u32,
    ) -> NdResult<Arc<Connection>> {
        let span = u32::from(u16::MAX - EPHEMERAL_PORT_START) + 1;
        let mut flows = lock(&self.flows);
        for _ in 0..span {
            let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % span;
            let port = EPHEMERAL_PORT_START + offset as u16;
            let key = FlowKey::new(port, peer, remote_port);
            if flows.by_key.contains_key(&key) || lock(&self.listeners).contains_key(&port) {
                continue;
            }
            let conn = Arc::new(Connection::new(
                self.next_flow_id(),
                key,
                self.scheduler.assign_core(),
                ConnState::Sender,
                total_length,
                &self.config,
            ));
            flows.by_key.insert(key, Arc::clone(&conn));
            flows.by_id.insert(conn.id, Arc::clone(&conn));
            return Ok(conn);
        }
        Err(NdError::Io(io::Error::new(
            io::ErrorKind::AddrInUse,
            "no free ephemeral ND port",
        )))
    }

    fn emit(&self, peer: IpAddr, class: PriorityClass, frame: Vec<u8>) {
        if let Err(err) = self.transmit.transmit(peer, class, frame) {
            warn!(%peer, ?class, %err, "transmit failed");
        }
    }

    fn send_control(&self, conn: &Connection, kind: SegmentType, seq: u32) {
        let seg = Segment::control(kind, conn.key.local_port, conn.key.remote_port, seq);
        self.emit(conn.key.peer, PriorityClass::Latency, seg.encode());
    }

    fn send_handshake(&self, conn: &Connection, kind: SegmentType, total_length: u32) {
        let seg = Segment::handshake(kind, conn.key.local_port, conn.key.remote_port, total_length);
        self.emit(conn.key.peer, PriorityClass::Latency, seg.encode());
    }

    /// Post at most one `MemoryFreed` event until the driver picks it up.
    fn memory_freed(&self, bytes: usize) {
        if bytes > 0 && !self.freed_pending.swap(true, Ordering::AcqRel) {
            let _ = self.events.send(EngineEvent::MemoryFreed);
        }
    }

    fn arm_flow_wait(&self, conn: &Connection, inner: &ConnInner) {
        inner.timer.arm(
            &self.runtime,
            self.config.flow_wait_timeout,
            conn.id,
            &conn.flags,
            &self.events,
        );
    }

    /// Grant more bytes to a receiving flow, or park it in the scheduler.
    pub(crate) fn try_grant(&self, conn: &Connection, inner: &mut ConnInner) {
        if inner.state != ConnState::Receiver {
            return;
        }
        conn.take_flag(TOKEN_DEFERRED);
        let decision = {
            let rx = lock(&conn.rx);
            match inner.flow.decide(self.config.rcvbuf, rx.rmem.charged()) {
                // an exhausted pool only stops grants the flow's own quota can't hold
                GrantDecision::Grant(bytes)
                    if self.pool.is_exhausted() && rx.rmem.forward_alloc() < bytes =>
                {
                    GrantDecision::Park
                }
                decision => decision,
            }
        };

        match decision {
            GrantDecision::Grant(bytes) => {
                let grant_nxt = inner.flow.commit_grant(bytes);
                if conn.in_pq.load(Ordering::Acquire) {
                    self.scheduler.remove(conn.core_id, conn.id);
                }
                trace!(flow = %conn.id, bytes, grant_nxt, "grant");
                self.send_control(conn, SegmentType::Token, grant_nxt);
                self.arm_flow_wait(conn, inner);
            }
            GrantDecision::Park => {
                let remaining = inner.flow.ungranted();
                if self.scheduler.insert(conn.core_id, conn.id, remaining, &conn.in_pq) {
                    debug!(flow = %conn.id, remaining, core = conn.core_id, "flow parked");
                }
            }
            GrantDecision::Idle => {
                if conn.in_pq.load(Ordering::Acquire) {
                    self.scheduler.remove(conn.core_id, conn.id);
                }
            }
        }
    }

    fn try_send_ack(&self, conn: &Connection, inner: &mut ConnInner, rcv_nxt: u32) {
        if inner.flow.should_ack(rcv_nxt) {
            trace!(flow = %conn.id, rcv_nxt, "ack");
            self.send_control(conn, SegmentType::Ack, rcv_nxt);
            inner.flow.mark_acked(rcv_nxt);
        }
    }

    /// Stamp queued payloads and send whatever the grant allows.
    pub(crate) fn push_pending(&self, conn: &Connection, inner: &mut ConnInner) {
        inner.send.stamp_pending();
        self.transmit_granted(conn, inner);
    }

    fn transmit_granted(&self, conn: &Connection, inner: &mut ConnInner) {
        for frame in inner.send.take_granted() {
            self.emit(conn.key.peer, PriorityClass::Throughput, frame);
        }
    }

    /// Consume from the reader queue and run the receive-side follow-ups.
    pub(crate) fn read_locked(
        &self,
        conn: &Connection,
        inner: &mut ConnInner,
        max_len: usize,
        discard: bool,
    ) -> ReadChunk {
        let (chunk, returned, rcv_nxt, copied_seq) = {
            let mut rx = lock(&conn.rx);
            let chunk = rx.queue.read(max_len, discard);
            let returned = if chunk.freed > 0 {
                let reader_has_data = rx.queue.has_reader_data();
                rx.rmem
                    .release_partial(chunk.freed, reader_has_data, self.config.rcvbuf, &self.pool)
            } else {
                0
            };
            (chunk, returned, rx.queue.rcv_nxt(), rx.queue.copied_seq())
        };
        self.memory_freed(returned);

        if chunk.consumed > 0 {
            self.try_send_ack(conn, inner, rcv_nxt);
            conn.set_flag(TOKEN_DEFERRED);
        }
        if conn.take_flag(TOKEN_DEFERRED) {
            self.try_grant(conn, inner);
        }
        if copied_seq == inner.flow.total_length() {
            inner.state = ConnState::Closed;
            inner.done = true;
        }
        chunk
    }

    fn sender_complete(&self, inner: &ConnInner) -> bool {
        inner.state == ConnState::Sender
            && inner.established
            && inner.send.snd_una() == inner.flow.total_length()
    }

    fn finish_sender(&self, conn: &Connection) {
        let total_length = {
            let mut inner = lock(&conn.inner);
            inner.done = true;
            inner.flow.total_length()
        };
        self.send_control(conn, SegmentType::Fin, total_length);
        info!(flow = %conn.id, total_length, "message delivered");
        self.teardown(conn, "message delivered");
    }

    /// Application close.
    ///
    /// A sender that has handed over the whole message lingers until it is
    /// acknowledged; everything else is aborted with a FIN.
    pub(crate) fn close(&self, conn: &Connection) {
        if conn.is_torn_down() {
            return;
        }
        let linger = {
            let mut inner = lock(&conn.inner);
            let whole_message = inner.send.accepted() == inner.flow.total_length() as usize;
            match inner.state {
                ConnState::Sender if inner.established && whole_message => {
                    inner.closing = true;
                    self.push_pending(conn, &mut inner);
                    true
                }
                _ => false,
            }
        };
        if linger {
            debug!(flow = %conn.id, "closing after delivery");
            return;
        }
        let done = lock(&conn.inner).done;
        if done {
            self.teardown(conn, "closed");
        } else {
            self.abort(conn, "closed by application");
        }
    }

    fn abort(&self, conn: &Connection, reason: &'static str) {
        if conn.is_torn_down() {
            return;
        }
        let seq = {
            let inner = lock(&conn.inner);
            match inner.state {
                ConnState::Sender => Some(inner.send.write_seq()),
                ConnState::Receiver => Some(lock(&conn.rx).queue.rcv_nxt()),
                ConnState::Closed => None,
            }
        };
        if let Some(seq) = seq {
            self.send_control(conn, SegmentType::Fin, seq);
        }
        self.teardown(conn, reason);
    }

    /// Destroy a connection: runs once, however many paths race to it.
    pub(crate) fn teardown(&self, conn: &Connection, reason: &'static str) {
        if conn.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let returned = {
            let mut inner = lock(&conn.inner);
            inner.timer.cancel();
            conn.take_flag(TOKEN_DEFERRED | WAIT_DEFERRED);
            inner.state = ConnState::Closed;
            inner.send.purge();
            let mut returned = inner.wmem.reclaim_all(&self.pool);
            {
                let mut rx = lock(&conn.rx);
                rx.queue.purge();
                returned += rx.rmem.reclaim_all(&self.pool);
            }
            if conn.in_pq.load(Ordering::Acquire) {
                self.scheduler.remove(conn.core_id, conn.id);
            }
            returned
        };
        {
            let mut flows = lock(&self.flows);
            if flows.by_id.remove(&conn.id).is_some() {
                flows.by_key.remove(&conn.key);
            }
        }
        conn.wake_all();
        self.memory_freed(returned);
        debug!(flow = %conn.id, key = %conn.key, reason, "connection torn down");
    }

    pub(crate) fn arrive(self: &Arc<Self>, peer: IpAddr, seg: Segment) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if seg.kind == SegmentType::Sync {
            self.handle_sync(peer, seg);
            return;
        }
        let key = FlowKey::new(seg.dest, peer, seg.source);
        let Some(conn) = self.lookup(&key) else {
            trace!(%key, kind = ?seg.kind, seq = seg.seq, "segment for unknown flow dropped");
            return;
        };
        match seg.kind {
            SegmentType::Data => self.handle_data(&conn, seg),
            SegmentType::SyncAck => self.handle_sync_ack(&conn),
            SegmentType::Token => self.handle_token(&conn, seg.seq),
            SegmentType::Ack => self.handle_ack(&conn, seg.seq),
            SegmentType::Fin => self.handle_fin(&conn),
            SegmentType::Sync => {}
        }
    }

    fn handle_sync(self: &Arc<Self>, peer: IpAddr, seg: Segment) {
        let total_length = match seg.total_length() {
            Ok(total_length) => total_length,
            Err(err) => {
                warn!(%peer, %err, "malformed SYNC dropped");
                return;
            }
        };
        let key = FlowKey::new(seg.dest, peer, seg.source);
        let Some(listener) = lock(&self.listeners).get(&seg.dest).cloned() else {
            debug!(%key, "SYNC for a port without listener dropped");
            return;
        };

        let conn = {
            let mut flows = lock(&self.flows);
            if let Some(existing) = flows.by_key.get(&key).cloned() {
                drop(flows);
                debug!(flow = %existing.id, "duplicate SYNC answered again");
                self.send_handshake(&existing, SegmentType::SyncAck, total_length);
                return;
            }
            let conn = Arc::new(Connection::new(
                self.next_flow_id(),
                key,
                self.scheduler.assign_core(),
                ConnState::Receiver,
                total_length,
                &self.config,
            ));
            flows.by_key.insert(key, Arc::clone(&conn));
            flows.by_id.insert(conn.id, Arc::clone(&conn));
            conn
        };

        info!(flow = %conn.id, %key, total_length, "accepted connection");
        self.send_handshake(&conn, SegmentType::SyncAck, total_length);
        {
            let mut inner = lock(&conn.inner);
            if total_length == 0 {
                inner.state = ConnState::Closed;
                inner.done = true;
            } else {
                self.try_grant(&conn, &mut inner);
            }
        }

        if listener.send(NdSocket::new(conn, Arc::clone(self))).is_err() {
            debug!(%key, "listener closed before accept");
        }
    }

    fn handle_sync_ack(&self, conn: &Connection) {
        let finished = {
            let mut inner = lock(&conn.inner);
            if inner.state != ConnState::Sender || inner.established {
                return;
            }
            inner.established = true;
            self.sender_complete(&inner)
        };
        trace!(flow = %conn.id, "established");
        conn.established.notify_waiters();
        if finished {
            self.finish_sender(conn);
        }
    }

    fn handle_token(&self, conn: &Connection, grant_nxt: u32) {
        let mut inner = lock(&conn.inner);
        if inner.state != ConnState::Sender {
            return;
        }
        if grant_nxt > inner.flow.total_length() {
            warn!(flow = %conn.id, grant_nxt, "grant beyond message end ignored");
            return;
        }
        if inner.send.on_token(grant_nxt) {
            trace!(flow = %conn.id, grant_nxt, "token");
            self.transmit_granted(conn, &mut inner);
        }
    }

    fn handle_ack(&self, conn: &Connection, ack: u32) {
        let finished = {
            let mut inner = lock(&conn.inner);
            if inner.state != ConnState::Sender {
                return;
            }
            let outcome = match inner.send.on_ack(ack) {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(flow = %conn.id, %err, "ACK dropped");
                    return;
                }
            };
            if outcome.freed > 0 {
                let returned = inner.wmem.release_full(outcome.freed, &self.pool);
                self.memory_freed(returned);
                conn.writable.notify_waiters();
            }
            if outcome.duplicate {
                let frames = inner.send.retransmit_outstanding();
                debug!(
                    flow = %conn.id,
                    snd_una = inner.send.snd_una(),
                    segments = frames.len(),
                    "retransmitting after nudge"
                );
                conn.retransmits
                    .fetch_add(frames.len() as u64, Ordering::Relaxed);
                for frame in frames {
                    self.emit(conn.key.peer, PriorityClass::Throughput, frame);
                }
            }
            self.sender_complete(&inner)
        };
        if finished {
            self.finish_sender(conn);
        }
    }

    fn handle_data(&self, conn: &Connection, seg: Segment) {
        let mut inner = lock(&conn.inner);
        if inner.state != ConnState::Receiver {
            trace!(flow = %conn.id, seq = seg.seq, "data for non-receiving flow dropped");
            return;
        }
        let (seq, len) = (seg.seq, seg.len());
        let total_length = inner.flow.total_length();
        let Some(end) = seg.checked_end_seq().filter(|&end| end <= total_length) else {
            lock(&conn.rx).queue.note_anomaly();
            warn!(flow = %conn.id, seq, len, total_length, "data outside the message dropped");
            return;
        };
        let grant_nxt = inner.flow.grant_nxt();
        if end > grant_nxt {
            lock(&conn.rx).queue.note_anomaly();
            warn!(flow = %conn.id, seq, len, grant_nxt, "data beyond grant dropped");
            return;
        }

        let (arrival, rcv_nxt) = {
            let mut rx = lock(&conn.rx);
            if let Err(err) = rx.rmem.charge(len, &self.pool) {
                inner.rmem_exhausted = true;
                warn!(flow = %conn.id, seq, len, %err, "no receive memory, segment dropped");
                return;
            }
            inner.rmem_exhausted = false;
            let arrival = rx.queue.insert(seg);
            if let Arrival::Duplicate(dup) = &arrival {
                rx.rmem.uncharge(dup.len());
            }
            (arrival, rx.queue.rcv_nxt())
        };

        match arrival {
            Arrival::InOrder { advanced } => {
                inner.flow.on_data(len);
                trace!(flow = %conn.id, seq, advanced, rcv_nxt, "in order");
                conn.readable.notify_waiters();
            }
            Arrival::OutOfOrder => {
                inner.flow.on_data(len);
                trace!(flow = %conn.id, seq, rcv_nxt, "out of order");
            }
            Arrival::Duplicate(_) => {
                warn!(flow = %conn.id, seq, len, rcv_nxt, "overlapping segment dropped");
            }
        }

        conn.take_flag(WAIT_DEFERRED);
        if inner.flow.outstanding(rcv_nxt) {
            self.arm_flow_wait(conn, &inner);
        } else {
            // every granted byte is in: grant more or park
            inner.timer.cancel();
            self.try_grant(conn, &mut inner);
        }
    }

    fn handle_fin(&self, conn: &Connection) {
        let reset = {
            let mut inner = lock(&conn.inner);
            let complete = inner.done
                || (inner.state == ConnState::Receiver
                    && lock(&conn.rx).queue.rcv_nxt() == inner.flow.total_length());
            if !complete {
                inner.error = Some(NdError::ConnectionReset);
            }
            !complete
        };
        if reset {
            debug!(flow = %conn.id, "peer closed");
            self.teardown(conn, "peer closed");
        }
    }

    fn on_flow_wait(&self, flow: FlowId) {
        let Some(conn) = self.lookup_id(flow) else {
            return;
        };
        let mut inner = lock(&conn.inner);
        if !conn.take_flag(WAIT_DEFERRED) || inner.state != ConnState::Receiver {
            return;
        }
        let rcv_nxt = lock(&conn.rx).queue.rcv_nxt();
        if inner.flow.outstanding(rcv_nxt) {
            debug!(
                flow = %conn.id,
                rcv_nxt,
                grant_nxt = inner.flow.grant_nxt(),
                "flow silent, nudging sender"
            );
            self.send_control(&conn, SegmentType::Ack, rcv_nxt);
            inner.flow.mark_acked(rcv_nxt);
            self.arm_flow_wait(&conn, &inner);
        }
        if conn.take_flag(TOKEN_DEFERRED) {
            self.try_grant(&conn, &mut inner);
        }
    }

    fn on_memory_freed(&self) {
        self.freed_pending.store(false, Ordering::Release);
        for core in 0..self.scheduler.cores() {
            for flow in self.scheduler.drain(core) {
                let Some(conn) = self.lookup_id(flow) else {
                    continue;
                };
                let mut inner = lock(&conn.inner);
                self.try_grant(&conn, &mut inner);
            }
        }
        let conns: Vec<Arc<Connection>> = lock(&self.flows).by_id.values().cloned().collect();
        for conn in conns {
            conn.writable.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::MEM_QUANTUM;

    struct Discard;

    impl Transmit for Discard {
        fn transmit(&self, _peer: IpAddr, _class: PriorityClass, _frame: Vec<u8>) -> NdResult<()> {
            Ok(())
        }
    }

    fn pending(stack: &NdStack) -> bool {
        stack.shared.freed_pending.load(Ordering::Acquire)
    }

    #[tokio::test]
    async fn test_memory_freed_events_coalesce() {
        let stack = NdStack::new(NdConfig::default(), Arc::new(Discard)).unwrap();

        stack.shared.memory_freed(0);
        assert!(!pending(&stack));

        // the driver has not run yet: one event covers every release
        for _ in 0..64 {
            stack.shared.memory_freed(MEM_QUANTUM);
        }
        assert!(pending(&stack));

        for _ in 0..100 {
            if !pending(&stack) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!pending(&stack));

        stack.shared.memory_freed(MEM_QUANTUM);
        assert!(pending(&stack));
        stack.shutdown();
    }
}
