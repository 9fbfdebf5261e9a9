//! Connection multiplexing layer.
//!
//! Carries ND segments between nodes over a fixed set of TCP channels:
//!
//! - **Target**: [`MuxTarget`] accepts channels from remote hosts
//! - **Host**: [`MuxHost`] opens channels to a target
//! - **Queues**: [`MuxQueue`], one per channel, with a budgeted I/O task
//!   running on a CPU-indexed worker of the channel's priority class
//! - **Framing**: [`SegmentFramer`] cuts the byte stream into segments
//!
//! Channel `i` carries throughput traffic when `i < latency_split`, latency
//! traffic otherwise. Data segments travel on throughput channels and
//! control segments on latency channels; within a class the channel is
//! picked by flow hash, so one flow's segments stay in order.

mod framing;
mod host;
mod listener;
mod queue;
mod router;
mod table;
mod worker;

pub use framing::*;
pub use host::*;
pub use listener::*;
pub use queue::{MuxQueue, QueueState, QueueStats};
pub use table::IndexAllocator;
