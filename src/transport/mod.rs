//! ND transport engine.
//!
//! Ties the pure protocol state machines in [`crate::protocol`] to tokio:
//!
//! - **Stack**: [`NdStack`] owns the connection registry, demultiplexes
//!   arrived segments and runs the driver task for deferred work
//! - **Sockets**: [`NdSocket`] and [`NdListener`], the application surface
//! - **Seams**: [`Transmit`] and [`SegmentSink`] connect the engine to
//!   whatever carries its segments, normally the [`mux`](crate::mux) layer
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     NdSocket send / recv / close        │
//! ├─────────────────────────────────────────┤
//! │  NdStack: grants, ACKs, reassembly      │  ← This module
//! ├─────────────────────────────────────────┤
//! │     Transmit / SegmentSink              │
//! └─────────────────────────────────────────┘
//! ```

mod connection;
mod socket;
mod stack;
mod timer;
mod wire;

pub use connection::{ConnState, ConnStats};
pub use socket::*;
pub use stack::NdStack;
pub use wire::*;
