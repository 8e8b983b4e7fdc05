//! Error types for the active message layer.

use crate::conduit::ConduitError;
use crate::lifecycle::LifecycleState;
use crate::wire::WireError;
use crate::NodeId;

/// Errors surfaced by the active message layer.
///
/// Protocol violations are fatal: by the time one of them is returned the
/// group has already been aborted and the local context is terminated.
#[derive(Debug, thiserror::Error)]
pub enum AmlError {
    /// Handler id outside of `[1, 255]`.
    #[error("handler id {id} not in [1, 255]")]
    InvalidHandlerId {
        /// The rejected id.
        id: u32,
    },

    /// A message arrived for a handler id nobody registered.
    #[error("calling non registered handler with id {handler} on node {node} (sent by node {sender})")]
    UnregisteredHandler {
        /// The handler id carried by the message.
        handler: u8,
        /// Node that sent the message.
        sender: NodeId,
        /// Node that received it.
        node: NodeId,
    },

    /// Destination outside of the process group.
    #[error("destination node {destination} outside of a group of {nodes} nodes")]
    InvalidDestination {
        /// The requested destination.
        destination: NodeId,
        /// Group size.
        nodes: usize,
    },

    /// Payload fits neither the inline tier nor the destination's slice.
    #[error(
        "send failed due to message size: {length} bytes to node {destination} \
         (inline ceiling {inline_max}, slice size {slice_size})"
    )]
    MessageTooLarge {
        /// Requested payload length.
        length: usize,
        /// Destination node.
        destination: NodeId,
        /// Largest payload the inline tier accepts.
        inline_max: usize,
        /// Size of the slice owned on the destination.
        slice_size: usize,
    },

    /// Operation attempted outside of the `Ready` state.
    #[error("{operation} is not valid while {state}")]
    NotReady {
        /// Name of the rejected operation.
        operation: &'static str,
        /// State the context was in.
        state: LifecycleState,
    },

    /// Another node hit a fatal error and tore the group down.
    #[error("process group aborted by node {origin}: {reason}")]
    GroupAborted {
        /// Node that initiated the abort.
        origin: NodeId,
        /// Reason reported by that node.
        reason: String,
    },

    /// Bootstrap could not establish a consistent view of the group.
    #[error("bootstrap failed: {message}")]
    Bootstrap {
        /// Details about the failure.
        message: String,
    },

    /// Configuration rejected by validation or loading.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Details about the rejected configuration.
        message: String,
    },

    /// Malformed packet.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The underlying substrate failed.
    #[error("conduit error: {0}")]
    Conduit(#[from] ConduitError),
}

impl AmlError {
    /// Whether the error is a protocol violation that tears the group down.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            AmlError::InvalidHandlerId { .. }
                | AmlError::UnregisteredHandler { .. }
                | AmlError::InvalidDestination { .. }
                | AmlError::MessageTooLarge { .. }
        )
    }
}

impl From<serde_json::Error> for AmlError {
    fn from(err: serde_json::Error) -> Self {
        AmlError::InvalidConfig {
            message: err.to_string(),
        }
    }
}

/// Result alias for active message operations.
pub type AmlResult<T> = Result<T, AmlError>;
