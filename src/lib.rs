//! # ND Transport
//!
//! ND is a receiver-driven datacenter transport. A connection carries one
//! message whose length is announced in the handshake; the receiver decides
//! how much the sender may put on the wire by issuing grants (TOKEN
//! segments), so the receive buffer can never be overrun. It provides:
//!
//! - **Receiver-driven flow control**: grants bounded by free buffer, batch
//!   size and remaining message, parked per core when no buffer is free
//! - **Ordered delivery**: out-of-order reassembly with cumulative ACKs and
//!   receiver-triggered retransmission
//! - **Bounded memory**: forward-allocated per-connection quota drawn from a
//!   shared pool with low/default/high watermarks
//! - **Multiplexing**: segments of many connections share a fixed set of TCP
//!   channels split into latency and throughput classes
//!
//! ## Feature Flags
//!
//! - `transport` (default): protocol engine, sockets and timers (tokio)
//! - `mux` (default): TCP channel multiplexing layer
//!
//! ## Modules
//!
//! - [`core`]: constants, configuration, identifiers and errors (always included)
//! - [`protocol`]: wire format and pure protocol state machines (always included)
//! - [`transport`]: the engine (requires `transport` feature)
//! - [`mux`]: the multiplexing layer (requires `mux` feature)
//!
//! ## Example Usage
//!
//! ```rust
//! use nd_transport::prelude::*;
//!
//! let seg = Segment::handshake(SegmentType::Sync, 40000, 9000, 1 << 20);
//! let wire = seg.encode();
//! assert_eq!(wire.len(), HEADER_SIZE + 4);
//!
//! let back = Segment::decode(&wire).unwrap();
//! assert_eq!(back.total_length().unwrap(), 1 << 20);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Wire format and protocol state (always included)
pub mod protocol;

// Engine (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod transport;

// Multiplexing layer (feature-gated)
#[cfg(feature = "mux")]
#[cfg_attr(docsrs, doc(cfg(feature = "mux")))]
pub mod mux;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::constants::HEADER_SIZE;
    pub use crate::core::*;
    pub use crate::protocol::{Segment, SegmentHeader, SegmentType};

    #[cfg(feature = "transport")]
    pub use crate::transport::{
        ConnState, ConnStats, NdListener, NdSocket, NdStack, RecvFlags, SegmentSink, SendFlags,
        Transmit,
    };

    #[cfg(feature = "mux")]
    pub use crate::mux::{MuxHost, MuxTarget};
}

// Re-export commonly used items at crate root
pub use crate::core::{NdConfig, NdConfigBuilder, NdError, NdResult};

#[cfg(feature = "transport")]
pub use crate::transport::{NdListener, NdSocket, NdStack, RecvFlags, SendFlags};

#[cfg(feature = "mux")]
pub use crate::mux::{MuxHost, MuxTarget};
