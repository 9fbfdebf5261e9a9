//! Inbound side: the accept loop of a target node.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::queue::QueueStats;
use super::router::MuxShared;
use crate::core::{NdConfig, NdResult, PriorityClass};
use crate::transport::{SegmentSink, Transmit};

/// Back-off after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Accepts stream channels and turns each into a queue.
#[derive(Debug)]
pub struct MuxTarget {
    shared: Arc<MuxShared>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl MuxTarget {
    /// Bind `config.listen_addr` and start accepting.
    #[instrument(skip(config), fields(addr = %config.listen_addr))]
    pub async fn bind(config: NdConfig) -> NdResult<Self> {
        let shared = MuxShared::new(config)?;
        let listener = TcpListener::bind(shared.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let accept_task = shared
            .runtime
            .spawn(accept_loop(listener, Arc::downgrade(&shared)));
        info!(%local_addr, "target listening");
        Ok(Self {
            shared,
            local_addr,
            accept_task,
        })
    }

    /// Attach the engine that receives segments arriving on accepted channels.
    pub fn attach(&self, sink: Arc<dyn SegmentSink>) -> NdResult<()> {
        self.shared.attach(sink)
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live channels.
    pub fn channel_count(&self) -> usize {
        self.shared.channel_count()
    }

    /// Counters of every live channel.
    pub fn channels(&self) -> Vec<QueueStats> {
        self.shared.queues().iter().map(|q| q.stats()).collect()
    }

    /// The outbound path for an [`NdStack`](crate::transport::NdStack);
    /// replies travel back over the accepted channels.
    pub fn transmitter(&self) -> Arc<dyn Transmit> {
        self.shared.clone()
    }

    /// Stop accepting and release every channel.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        self.shared.shutdown();
    }
}

impl Transmit for MuxTarget {
    fn transmit(&self, peer: IpAddr, class: PriorityClass, frame: Vec<u8>) -> NdResult<()> {
        self.shared.transmit(peer, class, frame)
    }
}

impl Drop for MuxTarget {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, shared: Weak<MuxShared>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let Some(mux) = shared.upgrade() else {
                    break;
                };
                match mux.add_stream(stream, peer) {
                    Ok(queue) => debug!(idx = queue.idx(), %peer, "accepted channel"),
                    Err(err) => warn!(%peer, %err, "could not set up channel"),
                }
            }
            Err(err) => {
                warn!(%err, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}
