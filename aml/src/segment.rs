//! Remote segment registry and rendezvous flow control.
//!
//! Every node registers one receive segment and publishes its size. The
//! segment is cut into `N - 1` equal slices, one per writer, so rendezvous
//! transfers from different peers never land on the same bytes.
//!
//! # Slice numbering
//!
//! On owner `o`, writer `w` uses slice index
//!
//! ```text
//! index(o, w) = w       if w < o
//!             = w - 1   if w > o
//! ```
//!
//! which keeps the `N - 1` indices dense. Both sides compute it
//! independently: the writer to find where to put, the owner to validate
//! what arrives. A mismatch silently overwrites a neighbour's slice, so the
//! formula lives in exactly one place, [`slice_index`].
//!
//! # Flow control
//!
//! ```text
//!   ┌───────────┐  rendezvous send   ┌──────────┐
//!   │ Available ├───────────────────►│ InFlight │
//!   │           │◄───────────────────┤          │
//!   └───────────┘  completion ack    └──────────┘
//! ```
//!
//! A send towards an `InFlight` slice waits; there is never more than one
//! outstanding rendezvous transfer per ordered pair of nodes.

use std::cmp::Ordering;

use tracing::warn;

use crate::directory::NodeDirectory;
use crate::error::AmlError;
use crate::NodeId;

/// Flow-control state of a slice owned on a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceState {
    /// No transfer outstanding, the slice may be written.
    Available,
    /// A transfer was written and is not acknowledged yet.
    InFlight,
}

/// The part of a peer's segment this node owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteSlice {
    /// Byte offset inside the peer's segment.
    pub offset: usize,
    /// Slice length in bytes.
    pub size: usize,
    /// Flow-control state.
    pub state: SliceState,
}

/// Index of writer `writer`'s slice inside `owner`'s segment.
///
/// `None` when `owner == writer`: a node owns no slice in its own segment.
pub fn slice_index(owner: NodeId, writer: NodeId) -> Option<usize> {
    match writer.cmp(&owner) {
        Ordering::Less => Some(writer.index()),
        Ordering::Equal => None,
        Ordering::Greater => Some(writer.index() - 1),
    }
}

/// Size of every slice in a segment of `segment_size` bytes.
pub fn slice_size(segment_size: usize, node_count: usize) -> usize {
    if node_count <= 1 {
        0
    } else {
        segment_size / (node_count - 1)
    }
}

/// Per-peer slices and their flow-control state.
#[derive(Debug, Clone)]
pub struct SegmentRegistry {
    self_id: NodeId,
    /// Size of the local segment, as published.
    local_size: usize,
    /// Indexed by peer id. `None` at the local id.
    remote: Vec<Option<RemoteSlice>>,
    /// Oversized inline envelopes not yet acknowledged, by peer.
    inline_outstanding: Vec<u32>,
}

impl SegmentRegistry {
    /// Compute every peer's slice from the published segment sizes.
    ///
    /// # Errors
    ///
    /// Returns [`AmlError::Bootstrap`] if `segment_sizes` does not have one
    /// entry per node, or if a segment is too large for the 32-bit wire
    /// offset.
    pub fn new(directory: &NodeDirectory, segment_sizes: &[usize]) -> Result<Self, AmlError> {
        let nodes = directory.node_count();
        if segment_sizes.len() != nodes {
            return Err(AmlError::Bootstrap {
                message: format!(
                    "segment table has {} entries for {} nodes",
                    segment_sizes.len(),
                    nodes
                ),
            });
        }

        if let Some(size) = segment_sizes.iter().find(|size| **size > u32::MAX as usize) {
            return Err(AmlError::Bootstrap {
                message: format!("published segment of {size} bytes exceeds the wire offset range"),
            });
        }

        let self_id = directory.self_id();
        let mut remote = vec![None; nodes];
        for peer in directory.peers() {
            let size = slice_size(segment_sizes[peer.index()], nodes);
            remote[peer.index()] = slice_index(peer, self_id).map(|index| RemoteSlice {
                offset: index * size,
                size,
                state: SliceState::Available,
            });
        }

        Ok(Self {
            self_id,
            local_size: segment_sizes[self_id.index()],
            remote,
            inline_outstanding: vec![0; nodes],
        })
    }

    /// Slice owned on `peer`, `None` for the local node or an unknown id.
    pub fn slice(&self, peer: NodeId) -> Option<&RemoteSlice> {
        self.remote.get(peer.index()).and_then(Option::as_ref)
    }

    /// Whether a rendezvous send to `peer` may proceed right now.
    pub fn is_available(&self, peer: NodeId) -> bool {
        self.slice(peer)
            .map(|slice| slice.state == SliceState::Available)
            .unwrap_or(false)
    }

    /// Mark the slice on `peer` as `InFlight`.
    ///
    /// Returns the slice offset to write at, or `None` if the slice is
    /// already in flight (or does not exist).
    pub fn begin_transfer(&mut self, peer: NodeId) -> Option<usize> {
        let slice = self.remote.get_mut(peer.index())?.as_mut()?;
        if slice.state == SliceState::InFlight {
            return None;
        }
        slice.state = SliceState::InFlight;
        Some(slice.offset)
    }

    /// Mark the slice on `peer` as `Available` after its completion ack.
    ///
    /// Returns `false` for a spurious ack: the slice was not in flight.
    pub fn complete_transfer(&mut self, peer: NodeId) -> bool {
        match self.remote.get_mut(peer.index()).and_then(Option::as_mut) {
            Some(slice) if slice.state == SliceState::InFlight => {
                slice.state = SliceState::Available;
                true
            }
            _ => {
                warn!(%peer, node = %self.self_id, "completion ack without transfer in flight");
                false
            }
        }
    }

    /// Count an oversized inline envelope sent to `peer`.
    pub fn inline_sent(&mut self, peer: NodeId) {
        if let Some(count) = self.inline_outstanding.get_mut(peer.index()) {
            *count += 1;
        }
    }

    /// Recycle an oversized inline envelope after `peer`'s ack.
    pub fn inline_acknowledged(&mut self, peer: NodeId) {
        if let Some(count) = self.inline_outstanding.get_mut(peer.index()) {
            if *count == 0 {
                warn!(%peer, node = %self.self_id, "inline ack without envelope outstanding");
            } else {
                *count -= 1;
            }
        }
    }

    /// Oversized inline envelopes to `peer` still waiting for an ack.
    pub fn inline_outstanding(&self, peer: NodeId) -> u32 {
        self.inline_outstanding
            .get(peer.index())
            .copied()
            .unwrap_or(0)
    }

    /// Where writer `sender` is allowed to land in the local segment.
    ///
    /// Returns `(offset, size)` of that writer's slice.
    pub fn local_slice_of(&self, sender: NodeId) -> Option<(usize, usize)> {
        let nodes = self.remote.len();
        if sender.index() >= nodes {
            return None;
        }
        let size = slice_size(self.local_size, nodes);
        slice_index(self.self_id, sender).map(|index| (index * size, size))
    }

    /// Size of the local segment.
    pub fn local_size(&self) -> usize {
        self.local_size
    }

    /// Peers with a rendezvous transfer still unacknowledged.
    pub fn in_flight(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.remote
            .iter()
            .enumerate()
            .filter(|(_, slice)| matches!(slice, Some(s) if s.state == SliceState::InFlight))
            .map(|(peer, _)| NodeId::new(peer as u32))
    }

    /// Forget every slice.
    pub fn clear(&mut self) {
        self.remote.clear();
        self.inline_outstanding.clear();
    }
}
