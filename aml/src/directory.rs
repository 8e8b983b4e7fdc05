//! Node identity and group size.
//!
//! Every node of a group has an identity in `[0, N)`. Both values are fixed
//! for the lifetime of the group: no node changes identity or leaves without
//! the whole group terminating.

use serde::{Deserialize, Serialize};

use crate::error::AmlError;

/// Identity of a node inside the process group.
///
/// # Examples
///
/// ```
/// use aml::NodeId;
///
/// let node = NodeId::new(3);
/// assert_eq!(node.index(), 3);
/// assert_eq!(node.to_string(), "3");
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct NodeId(u32);

impl NodeId {
    /// Create a node id from its raw value.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw numeric value.
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Value usable as an index into per-node tables.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for NodeId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read-only view of the local identity and the group size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeDirectory {
    self_id: NodeId,
    node_count: usize,
}

impl NodeDirectory {
    /// Build the directory from what the conduit reports.
    ///
    /// # Errors
    ///
    /// Returns [`AmlError::Bootstrap`] if the group is empty or the local
    /// rank falls outside of it.
    pub fn new(self_id: NodeId, node_count: usize) -> Result<Self, AmlError> {
        if node_count == 0 {
            return Err(AmlError::Bootstrap {
                message: "process group is empty".to_string(),
            });
        }
        if self_id.index() >= node_count {
            return Err(AmlError::Bootstrap {
                message: format!("rank {self_id} outside of a group of {node_count} nodes"),
            });
        }
        Ok(Self {
            self_id,
            node_count,
        })
    }

    /// This node's identity.
    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Number of nodes in the group.
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Whether `node` names a member of the group.
    pub fn contains(&self, node: NodeId) -> bool {
        node.index() < self.node_count
    }

    /// Every node of the group except this one, in ascending order.
    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.node_count as u32)
            .map(NodeId::new)
            .filter(move |node| *node != self.self_id)
    }
}
