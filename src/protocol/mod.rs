//! ND Protocol - Engine State
//!
//! Runtime-independent building blocks of the ND engine:
//!
//! - **Wire format**: [`SegmentHeader`], [`SegmentType`] and owned [`Segment`]s
//! - **Memory accounting**: [`MemoryPool`] and per-connection [`ForwardMemory`]
//! - **Reassembly**: [`ReceiveQueue`] with its out-of-order tree
//! - **Send queues**: [`SendQueue`] with segmentation and the retransmission queue
//! - **Flow control**: [`FlowControl`] grant computation and ACK cadence
//! - **Scheduling**: [`CoreScheduler`] of flows waiting for a grant
//!
//! Nothing here blocks or spawns; the `transport` layer wires these pieces to
//! tasks, timers and locks.

mod flow;
mod header;
mod memory;
mod reassembly;
mod scheduler;
mod segment;
mod send_queue;

pub use flow::*;
pub use header::*;
pub use memory::*;
pub use reassembly::*;
pub use scheduler::*;
pub use segment::*;
pub use send_queue::*;
