//! Node-wide multiplexing state and the outbound routing table.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use super::queue::MuxQueue;
use super::table::QueueTable;
use super::worker::WorkerPool;
use crate::core::{FlowKey, NdConfig, NdError, NdResult, PriorityClass, lock};
use crate::protocol::{Segment, SegmentHeader};
use crate::transport::{SegmentSink, Transmit};

#[derive(Debug, Default)]
struct PeerChannels {
    throughput: Vec<Arc<MuxQueue>>,
    latency: Vec<Arc<MuxQueue>>,
}

impl PeerChannels {
    fn class_mut(&mut self, class: PriorityClass) -> &mut Vec<Arc<MuxQueue>> {
        match class {
            PriorityClass::Throughput => &mut self.throughput,
            PriorityClass::Latency => &mut self.latency,
        }
    }

    /// Channel for `hash` within `class`, falling back to the other class.
    fn pick(&self, class: PriorityClass, hash: usize) -> Option<&Arc<MuxQueue>> {
        let (preferred, other) = match class {
            PriorityClass::Throughput => (&self.throughput, &self.latency),
            PriorityClass::Latency => (&self.latency, &self.throughput),
        };
        let set = if preferred.is_empty() { other } else { preferred };
        (!set.is_empty()).then(|| &set[hash % set.len()])
    }
}

pub(crate) struct MuxShared {
    pub(crate) config: NdConfig,
    pub(crate) runtime: Handle,
    pub(crate) workers: WorkerPool,
    table: QueueTable<MuxQueue>,
    routes: Mutex<HashMap<IpAddr, PeerChannels>>,
    sink: OnceLock<Arc<dyn SegmentSink>>,
    me: Weak<MuxShared>,
}

impl MuxShared {
    pub(crate) fn new(config: NdConfig) -> NdResult<Arc<Self>> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| NdError::Config("the multiplexing layer needs a tokio runtime".into()))?;
        let workers = WorkerPool::new(&runtime, config.io_workers, config.cpu_stride);
        Ok(Arc::new_cyclic(|me| Self {
            config,
            runtime,
            workers,
            table: QueueTable::new(),
            routes: Mutex::default(),
            sink: OnceLock::new(),
            me: me.clone(),
        }))
    }

    /// Set the engine that receives framed segments. Only the first call wins.
    pub(crate) fn attach(&self, sink: Arc<dyn SegmentSink>) -> NdResult<()> {
        self.sink
            .set(sink)
            .map_err(|_| NdError::Config("a segment sink is already attached".into()))
    }

    pub(crate) fn deliver(&self, peer: IpAddr, segments: Vec<Segment>) {
        match self.sink.get() {
            Some(sink) => sink.deliver(peer, segments),
            None => warn!(%peer, dropped = segments.len(), "no engine attached, segments dropped"),
        }
    }

    /// Wrap `stream` in a new queue, register it for routing and start it.
    pub(crate) fn add_stream(&self, stream: TcpStream, peer: SocketAddr) -> NdResult<Arc<MuxQueue>> {
        stream.set_nodelay(true)?;
        let split = self.config.latency_split;
        let queue = self.table.insert_with(|idx| {
            Arc::new(MuxQueue::new(
                idx,
                PriorityClass::for_index(idx, split),
                self.workers.assign_cpu(),
                stream,
                peer,
                self.me.clone(),
            ))
        });
        lock(&self.routes)
            .entry(peer.ip())
            .or_default()
            .class_mut(queue.class())
            .push(Arc::clone(&queue));
        debug!(
            idx = queue.idx(),
            %peer,
            class = ?queue.class(),
            io_cpu = queue.io_cpu(),
            "channel added"
        );
        queue.start(self);
        Ok(queue)
    }

    /// Forget a released queue.
    pub(crate) fn unregister(&self, queue: &MuxQueue) {
        let mut routes = lock(&self.routes);
        if let Some(channels) = routes.get_mut(&queue.peer().ip()) {
            channels
                .class_mut(queue.class())
                .retain(|q| q.idx() != queue.idx());
            if channels.throughput.is_empty() && channels.latency.is_empty() {
                routes.remove(&queue.peer().ip());
            }
        }
        drop(routes);
        self.table.remove(queue.idx());
    }

    pub(crate) fn queues(&self) -> Vec<Arc<MuxQueue>> {
        self.table.snapshot()
    }

    pub(crate) fn channel_count(&self) -> usize {
        self.table.len()
    }

    pub(crate) fn shutdown(&self) {
        for queue in self.table.snapshot() {
            queue.schedule_release();
        }
        self.workers.shutdown();
    }
}

impl Transmit for MuxShared {
    fn transmit(&self, peer: IpAddr, class: PriorityClass, frame: Vec<u8>) -> NdResult<()> {
        let header = SegmentHeader::from_bytes(&frame)?;
        let hash = FlowKey::new(header.source, peer, header.dest).channel_hash();
        let queue = {
            let routes = lock(&self.routes);
            routes
                .get(&peer)
                .and_then(|channels| channels.pick(class, hash))
                .cloned()
        };
        let Some(queue) = queue else {
            trace!(%peer, kind = ?header.kind, "no channel to peer");
            return Err(NdError::NotConnected);
        };
        queue.enqueue(frame)
    }
}

impl std::fmt::Debug for MuxShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxShared")
            .field("channels", &self.channel_count())
            .field("attached", &self.sink.get().is_some())
            .finish_non_exhaustive()
    }
}
