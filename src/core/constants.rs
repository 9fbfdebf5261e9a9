//! Protocol constants for the ND transport.
//!
//! Wire sizes are fixed by the protocol and MUST NOT be changed. Tunables
//! listed here are only defaults; see [`NdConfig`](super::NdConfig).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// Segment header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// Data offset byte: header length in 32-bit words, upper nibble.
pub const DATA_OFFSET: u8 = ((HEADER_SIZE / 4) as u8) << 4;

/// Size of the SYNC payload carrying the total message length.
pub const SYNC_PAYLOAD_SIZE: usize = 4;

/// Largest payload a single segment can describe.
pub const MAX_SEGMENT_PAYLOAD: usize = u16::MAX as usize;

// =============================================================================
// MEMORY ACCOUNTING
// =============================================================================

/// Allocation unit for forward-allocated memory.
pub const MEM_QUANTUM: usize = 4096;

/// Minimum process-wide memory limit, in quanta.
pub const MIN_MEM_LIMIT: usize = 128;

/// Default process-wide memory budget, in quanta, before the limit formula.
pub const DEFAULT_MEM_BUDGET: usize = 262_144;

/// Default per-connection receive buffer.
pub const DEFAULT_RCVBUF: usize = 6 * 1024 * 1024;

/// Default per-connection send buffer.
pub const DEFAULT_SNDBUF: usize = 6 * 1024 * 1024;

// =============================================================================
// SEGMENTATION AND FLOW CONTROL
// =============================================================================

/// Default payload bytes per data segment.
pub const DEFAULT_SEGMENT_CAP: usize = 9000;

/// Default grant granularity (one offload unit).
pub const DEFAULT_MAX_GSO_DATA: usize = 9000;

/// Default upper bound of a single grant.
pub const DEFAULT_MAX_GRANT_BATCH: usize = 1_440_000;

/// A cumulative ACK is sent every `max_grant_batch / ACK_DIVISOR` bytes.
pub const DEFAULT_ACK_DIVISOR: usize = 5;

/// Silence on a granted flow before the receiver nudges the sender.
pub const DEFAULT_FLOW_WAIT_TIMEOUT: Duration = Duration::from_millis(200);

/// Time allowed for a SYNC to be answered.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// First port handed out to outbound connections.
pub const EPHEMERAL_PORT_START: u16 = 32768;

// =============================================================================
// MULTIPLEXING LAYER
// =============================================================================

/// Segments framed per receive pass of an I/O task.
pub const RECV_BUDGET: usize = 8;

/// Send-list entries flushed per pass of an I/O task.
pub const SEND_BUDGET: usize = 8;

/// Total operations an I/O task may perform before re-queueing itself.
pub const IO_WORK_BUDGET: usize = 128;

/// Default number of channels per peer.
pub const DEFAULT_TOTAL_CHANNELS: usize = 8;

/// Worker index stride between consecutive queues.
pub const DEFAULT_CPU_STRIDE: usize = 4;

/// Default number of I/O workers per priority class.
pub const DEFAULT_IO_WORKERS: usize = 32;

/// Default listen address of the multiplexing target.
pub const DEFAULT_LISTEN_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9000);

/// Size of the per-read scratch buffer of an I/O task.
pub const READ_CHUNK: usize = 64 * 1024;
