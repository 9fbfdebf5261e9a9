//! Outbound side: channels from this node to a target node.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpSocket, TcpStream};
use tracing::{info, instrument};

use super::queue::QueueStats;
use super::router::MuxShared;
use crate::core::{NdConfig, NdError, NdResult, PriorityClass};
use crate::transport::{SegmentSink, Transmit};

/// Opens stream channels to target nodes and carries segments over them.
///
/// Cheap to clone; clones share channels and workers.
#[derive(Debug, Clone)]
pub struct MuxHost {
    shared: Arc<MuxShared>,
}

impl MuxHost {
    /// Create a host and its worker tasks. Must be called inside a tokio
    /// runtime.
    pub fn new(config: NdConfig) -> NdResult<Self> {
        Ok(Self {
            shared: MuxShared::new(config)?,
        })
    }

    /// Attach the engine that receives segments arriving on host channels.
    pub fn attach(&self, sink: Arc<dyn SegmentSink>) -> NdResult<()> {
        self.shared.attach(sink)
    }

    /// Open `total_channels` channels to `target`.
    ///
    /// Returns the number of channels opened. Channels already open to other
    /// targets are unaffected.
    #[instrument(skip(self))]
    pub async fn connect(&self, target: SocketAddr) -> NdResult<usize> {
        let config = &self.shared.config;
        for _ in 0..config.total_channels {
            let stream = tokio::time::timeout(config.connect_timeout, self.open(target))
                .await
                .map_err(|_| NdError::TimedOut)??;
            self.shared.add_stream(stream, target)?;
        }
        info!(channels = config.total_channels, "connected to target");
        Ok(config.total_channels)
    }

    async fn open(&self, target: SocketAddr) -> NdResult<TcpStream> {
        let Some(local_ip) = self.shared.config.local_ip else {
            return Ok(TcpStream::connect(target).await?);
        };
        let socket = match local_ip {
            IpAddr::V4(_) => TcpSocket::new_v4()?,
            IpAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.bind(SocketAddr::new(local_ip, 0))?;
        Ok(socket.connect(target).await?)
    }

    /// Number of live channels.
    pub fn channel_count(&self) -> usize {
        self.shared.channel_count()
    }

    /// Counters of every live channel.
    pub fn channels(&self) -> Vec<QueueStats> {
        self.shared.queues().iter().map(|q| q.stats()).collect()
    }

    /// The outbound path for an [`NdStack`](crate::transport::NdStack).
    pub fn transmitter(&self) -> Arc<dyn Transmit> {
        self.shared.clone()
    }

    /// Release every channel and stop the workers.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

impl Transmit for MuxHost {
    fn transmit(&self, peer: IpAddr, class: PriorityClass, frame: Vec<u8>) -> NdResult<()> {
        self.shared.transmit(peer, class, frame)
    }
}
