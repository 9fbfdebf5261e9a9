//! One multiplexed stream channel.
//!
//! A queue wraps a TCP stream. Its I/O task runs a budgeted loop on the
//! queue's worker: read what is available, frame segments, hand them to the
//! engine, flush the send list. A watcher task waits for stream readiness
//! and schedules the I/O task; it is re-armed only after the I/O task went
//! idle, so unread data never makes it spin.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::framing::SegmentFramer;
use super::router::MuxShared;
use crate::core::constants::READ_CHUNK;
use crate::core::{NdError, NdResult, PriorityClass, lock};

/// Lifecycle of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Allocated, stream not yet attached.
    Connecting,
    /// Carrying traffic.
    Live,
    /// Release scheduled; no further I/O.
    Disconnecting,
}

#[derive(Debug)]
struct IoState {
    framer: SegmentFramer,
    scratch: Vec<u8>,
}

#[derive(Debug, Default)]
struct SendList {
    frames: VecDeque<Vec<u8>>,
    offset: usize,
}

/// Snapshot of a queue's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Index in the node's queue table.
    pub idx: usize,
    /// Priority class of the channel.
    pub class: PriorityClass,
    /// Worker the channel is bound to.
    pub io_cpu: usize,
    /// Lifecycle state.
    pub state: QueueState,
    /// Segments framed and delivered.
    pub segments_in: u64,
    /// Frames fully written.
    pub frames_out: u64,
    /// Frames waiting in the send list.
    pub send_backlog: usize,
}

/// A multiplexed stream channel to one peer.
#[derive(Debug)]
pub struct MuxQueue {
    idx: usize,
    class: PriorityClass,
    io_cpu: usize,
    peer: SocketAddr,
    state: Mutex<QueueState>,
    stream: Mutex<Option<Arc<TcpStream>>>,
    io: Mutex<IoState>,
    send_list: Mutex<SendList>,
    pub(crate) io_pending: AtomicBool,
    send_blocked: AtomicBool,
    idle: Notify,
    watcher: Mutex<Option<JoinHandle<()>>>,
    segments_in: AtomicU64,
    frames_out: AtomicU64,
    mux: Weak<MuxShared>,
}

impl MuxQueue {
    pub(crate) fn new(
        idx: usize,
        class: PriorityClass,
        io_cpu: usize,
        stream: TcpStream,
        peer: SocketAddr,
        mux: Weak<MuxShared>,
    ) -> Self {
        Self {
            idx,
            class,
            io_cpu,
            peer,
            state: Mutex::new(QueueState::Connecting),
            stream: Mutex::new(Some(Arc::new(stream))),
            io: Mutex::new(IoState {
                framer: SegmentFramer::new(),
                scratch: vec![0; READ_CHUNK],
            }),
            send_list: Mutex::default(),
            io_pending: AtomicBool::new(false),
            send_blocked: AtomicBool::new(false),
            idle: Notify::new(),
            watcher: Mutex::new(None),
            segments_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            mux,
        }
    }

    /// Index in the node's queue table.
    pub fn idx(&self) -> usize {
        self.idx
    }

    /// Priority class.
    pub fn class(&self) -> PriorityClass {
        self.class
    }

    /// Worker index.
    pub fn io_cpu(&self) -> usize {
        self.io_cpu
    }

    /// Remote end of the stream.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Lifecycle state.
    pub fn state(&self) -> QueueState {
        *lock(&self.state)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            idx: self.idx,
            class: self.class,
            io_cpu: self.io_cpu,
            state: self.state(),
            segments_in: self.segments_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            send_backlog: lock(&self.send_list).frames.len(),
        }
    }

    fn stream(&self) -> Option<Arc<TcpStream>> {
        lock(&self.stream).clone()
    }

    /// Go live: start the readiness watcher and run a first I/O pass.
    pub(crate) fn start(self: &Arc<Self>, mux: &MuxShared) {
        {
            let mut state = lock(&self.state);
            if *state != QueueState::Connecting {
                return;
            }
            *state = QueueState::Live;
        }
        if let Some(stream) = self.stream() {
            let watcher = mux.runtime.spawn(watch(Arc::clone(self), stream));
            *lock(&self.watcher) = Some(watcher);
        }
        mux.workers.schedule(self);
    }

    /// Append an encoded segment to the send list and schedule I/O.
    pub(crate) fn enqueue(self: &Arc<Self>, frame: Vec<u8>) -> NdResult<()> {
        if self.state() == QueueState::Disconnecting {
            return Err(NdError::NotConnected);
        }
        lock(&self.send_list).frames.push_back(frame);
        if let Some(mux) = self.mux.upgrade() {
            mux.workers.schedule(self);
        }
        Ok(())
    }

    /// Budgeted I/O pass; re-queues itself if the budget ran out with work
    /// still pending.
    pub(crate) fn io_work(self: &Arc<Self>) {
        self.io_pending.store(false, Ordering::Release);
        if self.state() != QueueState::Live {
            return;
        }
        let (Some(mux), Some(stream)) = (self.mux.upgrade(), self.stream()) else {
            return;
        };
        let budget = mux.config.io_work_budget;
        let mut io = lock(&self.io);
        let mut ops = 0;

        let pending = loop {
            let mut progress = false;
            match self.try_recv(&stream, &mut io, &mux, budget - ops) {
                Ok(n) => {
                    ops += n;
                    progress |= n > 0;
                }
                Err(err) => {
                    drop(io);
                    self.fail(err);
                    return;
                }
            }
            match self.try_send(&stream, mux.config.send_budget) {
                Ok(n) => {
                    ops += n;
                    progress |= n > 0;
                }
                Err(err) => {
                    drop(io);
                    self.fail(err);
                    return;
                }
            }
            if !progress || ops >= budget {
                break progress;
            }
        };
        drop(io);

        if pending {
            trace!(idx = self.idx, ops, "io budget exhausted, requeueing");
            mux.workers.schedule(self);
        } else {
            self.idle.notify_waiters();
        }
    }

    fn try_recv(
        &self,
        stream: &TcpStream,
        io: &mut IoState,
        mux: &MuxShared,
        budget: usize,
    ) -> io::Result<usize> {
        let limit = budget.min(mux.config.recv_budget);
        let mut batch = Vec::new();
        let mut outcome = Ok(());
        while batch.len() < limit {
            match io.framer.next_batch(limit - batch.len()) {
                Ok(mut framed) if !framed.is_empty() => {
                    batch.append(&mut framed);
                    continue;
                }
                Ok(_) => {}
                Err(err) => {
                    outcome = Err(io::Error::new(io::ErrorKind::InvalidData, err));
                    break;
                }
            }
            match stream.try_read(&mut io.scratch) {
                Ok(0) => {
                    outcome = Err(io::ErrorKind::UnexpectedEof.into());
                    break;
                }
                Ok(n) => io.framer.extend(&io.scratch[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }

        let framed = batch.len();
        if framed > 0 {
            self.segments_in.fetch_add(framed as u64, Ordering::Relaxed);
            mux.deliver(self.peer.ip(), batch);
        }
        outcome.map(|()| framed)
    }

    fn try_send(&self, stream: &TcpStream, budget: usize) -> io::Result<usize> {
        let mut guard = lock(&self.send_list);
        let list = &mut *guard;
        let mut sent = 0;
        while sent < budget {
            let Some(frame) = list.frames.front() else {
                self.send_blocked.store(false, Ordering::Release);
                break;
            };
            match stream.try_write(&frame[list.offset..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    list.offset += n;
                    if list.offset == frame.len() {
                        list.frames.pop_front();
                        list.offset = 0;
                        sent += 1;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.send_blocked.store(true, Ordering::Release);
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        self.frames_out.fetch_add(sent as u64, Ordering::Relaxed);
        Ok(sent)
    }

    fn fail(self: &Arc<Self>, err: io::Error) {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            debug!(idx = self.idx, peer = %self.peer, "channel closed by peer");
        } else {
            warn!(idx = self.idx, peer = %self.peer, %err, "channel failed");
        }
        self.schedule_release();
    }

    /// Move to DISCONNECTING and release asynchronously; runs once.
    pub(crate) fn schedule_release(self: &Arc<Self>) {
        {
            let mut state = lock(&self.state);
            if *state == QueueState::Disconnecting {
                return;
            }
            *state = QueueState::Disconnecting;
        }
        let Some(mux) = self.mux.upgrade() else {
            self.release_now();
            return;
        };
        let queue = Arc::clone(self);
        mux.runtime.spawn(async move {
            queue.release_now();
            if let Some(mux) = queue.mux.upgrade() {
                mux.unregister(&queue);
            }
            debug!(idx = queue.idx, peer = %queue.peer, "queue released");
        });
    }

    /// Stop the watcher, wait out any in-flight I/O pass and close the stream.
    fn release_now(&self) {
        if let Some(watcher) = lock(&self.watcher).take() {
            watcher.abort();
        }
        drop(lock(&self.io));
        lock(&self.send_list).frames.clear();
        lock(&self.stream).take();
    }
}

async fn watch(queue: Arc<MuxQueue>, stream: Arc<TcpStream>) {
    loop {
        let interest = if queue.send_blocked.load(Ordering::Acquire) {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if let Err(err) = stream.ready(interest).await {
            warn!(idx = queue.idx, %err, "readiness wait failed");
            queue.schedule_release();
            return;
        }
        let Some(mux) = queue.mux.upgrade() else {
            return;
        };
        let idle = queue.idle.notified();
        tokio::pin!(idle);
        idle.as_mut().enable();
        mux.workers.schedule(&queue);
        drop(mux);
        idle.await;
    }
}
