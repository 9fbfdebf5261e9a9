//! Seams between the engine and whatever carries its segments.

use std::net::IpAddr;

use crate::core::{NdResult, PriorityClass};
use crate::protocol::Segment;

/// Outbound path: hands encoded segments to the carrying layer.
///
/// Implementations must not block and must not call back into the stack
/// synchronously; the engine may invoke this while holding connection locks.
pub trait Transmit: Send + Sync + 'static {
    /// Queue one encoded segment for `peer` on a channel of `class`.
    fn transmit(&self, peer: IpAddr, class: PriorityClass, frame: Vec<u8>) -> NdResult<()>;
}

/// Inbound path: receives framed segments from the carrying layer.
pub trait SegmentSink: Send + Sync + 'static {
    /// Deliver a batch of segments that arrived from `peer`, in arrival order.
    fn deliver(&self, peer: IpAddr, segments: Vec<Segment>);
}
