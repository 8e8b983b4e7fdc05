//! Lifecycle states of an active message context.
//!
//! ```text
//! Uninitialized ──init──► Bootstrapping ──barrier──► Ready
//!                                                     │
//!                         Terminated ◄── ShuttingDown ◄┘ finalize
//! ```
//!
//! A fatal error moves the context straight to `Terminated`.

use crate::error::AmlError;

/// Where a context is in its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    /// Nothing established yet.
    #[default]
    Uninitialized,
    /// Directory and segments being set up, initial barrier pending.
    Bootstrapping,
    /// Runtime operations allowed.
    Ready,
    /// Final barriers and conduit release in progress.
    ShuttingDown,
    /// Everything released, or a fatal error occurred.
    Terminated,
}

impl LifecycleState {
    /// Whether the context still holds group resources.
    ///
    /// A live context that gets dropped aborts the group.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            LifecycleState::Bootstrapping | LifecycleState::Ready | LifecycleState::ShuttingDown
        )
    }

    /// Whether the diagram allows moving from `self` to `next`.
    ///
    /// Any state may fall to `Terminated` after a fatal error.
    pub fn can_enter(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Uninitialized, Bootstrapping)
                | (Bootstrapping, Ready)
                | (Ready, ShuttingDown)
                | (_, Terminated)
        ) && self != Terminated
    }

    /// Reject `operation` unless the context is `Ready`.
    pub fn ensure_ready(self, operation: &'static str) -> Result<(), AmlError> {
        if self == LifecycleState::Ready {
            Ok(())
        } else {
            Err(AmlError::NotReady {
                operation,
                state: self,
            })
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Bootstrapping => "bootstrapping",
            LifecycleState::Ready => "ready",
            LifecycleState::ShuttingDown => "shutting down",
            LifecycleState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}
