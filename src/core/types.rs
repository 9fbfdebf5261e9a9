//! Identifiers shared by the engine and the multiplexing layer.

use std::fmt;
use std::net::IpAddr;

/// Process-unique identifier of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlowId(pub u64);

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flow#{}", self.0)
    }
}

/// Demultiplexing key of a connection as seen from the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Local ND port.
    pub local_port: u16,
    /// Address of the peer node.
    pub peer: IpAddr,
    /// Peer ND port.
    pub remote_port: u16,
}

impl FlowKey {
    /// Create a flow key.
    pub fn new(local_port: u16, peer: IpAddr, remote_port: u16) -> Self {
        Self {
            local_port,
            peer,
            remote_port,
        }
    }

    /// Stable hash used to pin a flow to one channel of a class.
    pub fn channel_hash(&self) -> usize {
        let ip = match self.peer {
            IpAddr::V4(v4) => u32::from(v4) as usize,
            IpAddr::V6(v6) => u128::from(v6) as usize,
        };
        ip ^ ((self.local_port as usize) << 16) ^ self.remote_port as usize
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{} <-> {}:{}", self.local_port, self.peer, self.remote_port)
    }
}

/// Static traffic class of a multiplexing channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PriorityClass {
    /// Short control segments.
    Latency,
    /// Bulk data segments.
    Throughput,
}

impl PriorityClass {
    /// Class of a channel given its index and the latency split point.
    ///
    /// Indices below `latency_split` carry throughput traffic.
    pub fn for_index(index: usize, latency_split: usize) -> Self {
        if index >= latency_split {
            PriorityClass::Latency
        } else {
            PriorityClass::Throughput
        }
    }
}
