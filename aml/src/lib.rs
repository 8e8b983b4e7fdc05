//! # AML
//!
//! Active message layer for a fixed group of cooperating nodes.
//!
//! Every message names a handler id; the receiver dispatches it straight to
//! the callback registered under that id, without receive matching.
//!
//! This crate provides:
//! - **Handler table**: ids `1..=255` mapped to callbacks, registered
//!   collectively
//! - **Tiered sends**: local delivery, header-only control messages, inline
//!   payloads and zero-copy rendezvous transfers into a peer's segment
//! - **Flow control**: one outstanding rendezvous transfer per peer, released
//!   by the receiver's completion ack
//! - **Collectives**: barrier and `i64` sum / min / max reductions
//! - **Conduits**: an in-process fabric and a TCP mesh
//!
//! ## Example
//!
//! ```
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! use aml::launch::{local_runtime, run_local_group};
//! use aml::{AmlConfig, NodeId};
//!
//! let runtime = local_runtime().expect("runtime");
//! let results = runtime.block_on(run_local_group(2, AmlConfig::local(), |mut aml| async move {
//!     let stored = Rc::new(Cell::new(None));
//!     let slot = stored.clone();
//!     aml.register_handler(4, move |_from: NodeId, payload: &[u8]| {
//!         slot.set(Some(payload.to_vec()));
//!     })
//!     .await?;
//!
//!     let next = NodeId::new((aml.self_id().get() + 1) % aml.node_count() as u32);
//!     aml.send(b"hello", 4, next).await?;
//!     aml.barrier().await?;
//!     aml.finalize().await?;
//!     Ok::<_, aml::AmlError>(stored.take())
//! }));
//!
//! for result in results {
//!     assert_eq!(result.expect("node succeeded"), Some(b"hello".to_vec()));
//! }
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Configuration and presets.
pub mod config;

/// Substrate abstraction and its implementations.
pub mod conduit;

/// Node identity and group size.
pub mod directory;

/// Error types.
pub mod error;

/// Handler id to callback routing.
pub mod handler;

/// Process group launch helpers.
pub mod launch;

/// Lifecycle states.
pub mod lifecycle;

/// Transport counters.
pub mod metrics;

/// Per-peer slices and rendezvous flow control.
pub mod segment;

/// The active message context.
pub mod transport;

/// Packet wire format with CRC32C checksums.
pub mod wire;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use conduit::{Conduit, ConduitError, MemConduit, MemFabric, ReduceOp, TcpConduit, TcpConfig};
pub use config::AmlConfig;
pub use directory::{NodeDirectory, NodeId};
pub use error::{AmlError, AmlResult};
pub use handler::{MessageHandler, MAX_HANDLER_ID, MIN_HANDLER_ID};
pub use lifecycle::LifecycleState;
pub use metrics::TransportMetrics;
pub use transport::Aml;
pub use wire::{Packet, ProtocolHandler, WireError};
