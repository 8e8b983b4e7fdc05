//! The substrate the active message layer runs on.
//!
//! A [`Conduit`] provides everything the core consumes but does not
//! implement itself: process-group rank and size, ordered packet delivery,
//! writes into a peer's registered segment, a split-phase barrier,
//! split-phase reductions, group abort and orderly release.
//!
//! # Implementations
//!
//! - [`MemConduit`]: in-process fabric, every node a task on one
//!   single-threaded runtime
//! - [`TcpConduit`]: TCP mesh between processes, rank 0 coordinating
//!   collectives
//!
//! # Split-phase collectives
//!
//! Collectives are notify / test pairs so the caller can keep polling for
//! incoming messages while it waits. A node blocked in a barrier without
//! polling would never acknowledge a peer's rendezvous transfer, and that
//! peer would never reach the barrier.
//!
//! Single-core design - no Send bounds needed.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::NodeId;

pub mod mem;
pub mod tcp;

pub use mem::{MemConduit, MemFabric};
pub use tcp::{TcpConduit, TcpConfig};

/// Errors raised by a conduit.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConduitError {
    /// Destination is not part of the group.
    #[error("unknown node {node}")]
    UnknownNode {
        /// The rejected node.
        node: NodeId,
    },

    /// Write or read outside of a registered segment.
    #[error("segment access out of bounds: offset {offset} + {len} bytes exceeds {size}")]
    SegmentOutOfBounds {
        /// Requested offset.
        offset: usize,
        /// Requested length.
        len: usize,
        /// Size of the segment.
        size: usize,
    },

    /// Nodes disagreed on the reduction being performed.
    #[error("collective mismatch: {message}")]
    CollectiveMismatch {
        /// Details about the mismatch.
        message: String,
    },

    /// Link to a peer is gone.
    #[error("link to node {node} closed")]
    LinkClosed {
        /// Peer at the other end.
        node: NodeId,
    },

    /// Connection setup failed.
    #[error("handshake failed: {message}")]
    Handshake {
        /// Details about the failure.
        message: String,
    },

    /// Control message could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Details about the codec failure.
        message: String,
    },

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ConduitError {
    fn from(error: std::io::Error) -> Self {
        ConduitError::Io(error.to_string())
    }
}

impl From<serde_json::Error> for ConduitError {
    fn from(error: serde_json::Error) -> Self {
        ConduitError::Codec {
            message: error.to_string(),
        }
    }
}

/// Reduction applied by [`Conduit::reduce_notify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReduceOp {
    /// Sum of all contributions.
    Sum,
    /// Smallest contribution.
    Min,
    /// Largest contribution.
    Max,
}

impl ReduceOp {
    /// Combine two contributions.
    pub fn apply(self, left: i64, right: i64) -> i64 {
        match self {
            ReduceOp::Sum => left.wrapping_add(right),
            ReduceOp::Min => left.min(right),
            ReduceOp::Max => left.max(right),
        }
    }
}

/// Handle on a barrier this node entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierTicket(pub u64);

/// Handle on a reduction this node contributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReduceTicket(pub u64);

/// Why the group was torn down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortNotice {
    /// Node that initiated the abort.
    pub origin: NodeId,
    /// Reason it reported.
    pub reason: String,
}

/// Process-group substrate consumed by the active message layer.
///
/// Guarantees an implementation must provide:
///
/// - packets from one source are received in the order they were sent
/// - a [`put`](Conduit::put) is visible at the destination before any
///   packet the same source sends afterwards
/// - once [`barrier_done`](Conduit::barrier_done) reports completion, every
///   packet any node sent before entering that barrier is retrievable via
///   [`try_recv`](Conduit::try_recv)
#[async_trait(?Send)]
pub trait Conduit {
    /// This node's rank.
    fn rank(&self) -> NodeId;

    /// Number of nodes in the group.
    fn size(&self) -> usize;

    /// Registered segment size of every node, indexed by rank.
    fn segment_sizes(&self) -> Vec<usize>;

    /// Queue a packet for `dest`.
    fn send_packet(&self, dest: NodeId, packet: Bytes) -> Result<(), ConduitError>;

    /// Next packet received by this node, with its sender.
    fn try_recv(&self) -> Option<(NodeId, Bytes)>;

    /// Write `data` at `offset` into `dest`'s registered segment.
    fn put(&self, dest: NodeId, offset: usize, data: &[u8]) -> Result<(), ConduitError>;

    /// Run `f` over `len` bytes of the local segment starting at `offset`.
    fn with_local_segment(
        &self,
        offset: usize,
        len: usize,
        f: &mut dyn FnMut(&[u8]),
    ) -> Result<(), ConduitError>;

    /// Enter the next barrier.
    fn barrier_notify(&self) -> Result<BarrierTicket, ConduitError>;

    /// Whether every node entered the barrier behind `ticket`.
    fn barrier_done(&self, ticket: BarrierTicket) -> bool;

    /// Contribute `value` to the next reduction.
    fn reduce_notify(&self, op: ReduceOp, value: i64) -> Result<ReduceTicket, ConduitError>;

    /// Result of the reduction behind `ticket`, once every node contributed.
    fn reduce_result(&self, ticket: ReduceTicket) -> Result<Option<i64>, ConduitError>;

    /// Tear the whole group down.
    fn abort(&self, origin: NodeId, reason: &str);

    /// Abort observed by this node, if any.
    fn abort_notice(&self) -> Option<AbortNotice>;

    /// Flush outbound traffic and release the substrate.
    async fn close(&mut self) -> Result<(), ConduitError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_ops() {
        assert_eq!(ReduceOp::Sum.apply(3, 4), 7);
        assert_eq!(ReduceOp::Min.apply(3, -4), -4);
        assert_eq!(ReduceOp::Max.apply(3, -4), 3);
    }

    #[test]
    fn test_sum_wraps_instead_of_panicking() {
        assert_eq!(ReduceOp::Sum.apply(i64::MAX, 1), i64::MIN);
    }
}
