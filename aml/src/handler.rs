//! HandlerTable: handler id → callback routing.
//!
//! Incoming messages carry a small integer handler id. The table maps each
//! id in `[1, 255]` to a locally registered callback, with O(1) array
//! lookup. Id `0` is reserved.

use tracing::{debug, trace};

use crate::error::AmlError;
use crate::NodeId;

/// Number of slots in the table, id `0` included.
pub const HANDLER_TABLE_SIZE: usize = 256;

/// Smallest id a user handler may use.
pub const MIN_HANDLER_ID: u32 = 1;

/// Largest id a user handler may use.
pub const MAX_HANDLER_ID: u32 = 255;

/// Callback invoked for every message addressed to a registered id.
///
/// Runs synchronously on the task performing receive-side progress. The
/// payload is empty for control messages; for rendezvous transfers it is a
/// view straight into the local receive segment and is only valid for the
/// duration of the call.
pub trait MessageHandler {
    /// Process one incoming message.
    ///
    /// # Arguments
    /// * `sender` - Node that issued the send
    /// * `payload` - Message bytes, interpreted by the handler
    fn handle(&mut self, sender: NodeId, payload: &[u8]);
}

impl<F> MessageHandler for F
where
    F: FnMut(NodeId, &[u8]),
{
    fn handle(&mut self, sender: NodeId, payload: &[u8]) {
        self(sender, payload)
    }
}

/// Validate a raw handler id.
///
/// # Errors
///
/// Returns [`AmlError::InvalidHandlerId`] outside of `[1, 255]`.
pub fn handler_id(raw: u32) -> Result<u8, AmlError> {
    if (MIN_HANDLER_ID..=MAX_HANDLER_ID).contains(&raw) {
        Ok(raw as u8)
    } else {
        Err(AmlError::InvalidHandlerId { id: raw })
    }
}

/// Maps handler ids to callbacks.
pub struct HandlerTable {
    /// Callbacks indexed by id. Slot 0 stays empty.
    slots: [Option<Box<dyn MessageHandler>>; HANDLER_TABLE_SIZE],

    /// Node owning the table, reported on dispatch failures.
    local: NodeId,
}

impl HandlerTable {
    /// Create an empty table for `local`.
    pub fn new(local: NodeId) -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            local,
        }
    }

    /// Install `handler` at `id`, replacing any previous callback.
    ///
    /// Overwrites are silent: keeping ids consistent across the group is
    /// the caller's job.
    ///
    /// # Errors
    ///
    /// Returns [`AmlError::InvalidHandlerId`] outside of `[1, 255]`.
    pub fn insert(&mut self, id: u32, handler: Box<dyn MessageHandler>) -> Result<(), AmlError> {
        let id = handler_id(id)?;
        let previous = self.slots[id as usize].replace(handler);
        if previous.is_some() {
            debug!(handler = id, node = %self.local, "handler overwritten");
        }
        Ok(())
    }

    /// Invoke the callback registered at `id`.
    ///
    /// # Errors
    ///
    /// Returns [`AmlError::UnregisteredHandler`] if nothing is registered
    /// there. Callers treat this as a protocol violation.
    pub fn dispatch(&mut self, id: u8, sender: NodeId, payload: &[u8]) -> Result<(), AmlError> {
        let local = self.local;
        match self.slots[id as usize].as_mut() {
            Some(handler) if id != 0 => {
                trace!(handler = id, %sender, bytes = payload.len(), "dispatch");
                handler.handle(sender, payload);
                Ok(())
            }
            _ => Err(AmlError::UnregisteredHandler {
                handler: id,
                sender,
                node: local,
            }),
        }
    }

    /// Whether a callback is registered at `id`.
    pub fn is_registered(&self, id: u32) -> bool {
        handler_id(id)
            .map(|id| self.slots[id as usize].is_some())
            .unwrap_or(false)
    }

    /// Number of ids with a callback.
    pub fn registered_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Drop every callback.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }
}
