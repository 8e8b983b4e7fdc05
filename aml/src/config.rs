//! Configuration for the active message layer.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AmlError;

/// Default size of the segment each node registers for rendezvous receives.
pub const DEFAULT_SEGMENT_SIZE: usize = 1024 * 1024;

/// Default inline ceiling: payloads strictly below this travel inside the packet.
pub const DEFAULT_MAX_MEDIUM: usize = 65_000;

/// Default one-shot delivery capacity of the transport.
pub const DEFAULT_MAX_LONG_REQUEST: usize = 65_000;

/// Tunables of the active message layer.
///
/// Every node of a group must use the same `max_medium`: tier selection
/// happens on the sender and the receiver trusts it. Segment sizes may differ
/// per node, each node publishes its own.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmlConfig {
    /// Bytes of the receive segment registered by this node.
    pub segment_size: usize,

    /// Inline tier ceiling. Payloads of `1..max_medium` bytes are copied
    /// into the packet, larger ones go through the rendezvous tier.
    pub max_medium: usize,

    /// Largest payload the transport delivers in one shot.
    ///
    /// Inline payloads above this are acknowledged by the receiver so the
    /// sender can recycle the envelope.
    pub max_long_request: usize,

    /// How long a blocking wait may spin before a warning is logged.
    ///
    /// Diagnostic only, blocking itself is unbounded.
    #[serde(with = "duration_millis")]
    pub stall_warning: Duration,
}

impl Default for AmlConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            max_medium: DEFAULT_MAX_MEDIUM,
            max_long_request: DEFAULT_MAX_LONG_REQUEST,
            stall_warning: Duration::from_secs(10),
        }
    }
}

impl AmlConfig {
    /// Small buffers for in-process groups and tests.
    pub fn local() -> Self {
        Self {
            segment_size: 64 * 1024,
            max_medium: 1024,
            max_long_request: 4096,
            stall_warning: Duration::from_secs(2),
        }
    }

    /// Large segments for multi-process runs.
    pub fn cluster() -> Self {
        Self {
            segment_size: 16 * 1024 * 1024,
            max_medium: DEFAULT_MAX_MEDIUM,
            max_long_request: DEFAULT_MAX_LONG_REQUEST,
            stall_warning: Duration::from_secs(30),
        }
    }

    /// Set the registered segment size.
    pub fn with_segment_size(mut self, segment_size: usize) -> Self {
        self.segment_size = segment_size;
        self
    }

    /// Set the inline tier ceiling.
    pub fn with_max_medium(mut self, max_medium: usize) -> Self {
        self.max_medium = max_medium;
        self
    }

    /// Set the one-shot delivery capacity.
    pub fn with_max_long_request(mut self, max_long_request: usize) -> Self {
        self.max_long_request = max_long_request;
        self
    }

    /// Set the stall warning threshold.
    pub fn with_stall_warning(mut self, stall_warning: Duration) -> Self {
        self.stall_warning = stall_warning;
        self
    }

    /// Check the values are usable.
    ///
    /// # Errors
    ///
    /// Returns [`AmlError::InvalidConfig`] when the inline ceiling is zero,
    /// exceeds what a packet length field can describe, or when the segment
    /// is too large to be addressed by the wire offset.
    pub fn validate(&self) -> Result<(), AmlError> {
        if self.max_medium == 0 {
            return Err(AmlError::InvalidConfig {
                message: "max_medium must be at least 1".to_string(),
            });
        }
        if self.max_medium > crate::wire::MAX_INLINE_PAYLOAD {
            return Err(AmlError::InvalidConfig {
                message: format!(
                    "max_medium {} exceeds the packet limit of {} bytes",
                    self.max_medium,
                    crate::wire::MAX_INLINE_PAYLOAD
                ),
            });
        }
        if u32::try_from(self.segment_size).is_err() {
            return Err(AmlError::InvalidConfig {
                message: format!("segment_size {} does not fit in 32 bits", self.segment_size),
            });
        }
        Ok(())
    }

    /// Load a configuration from a JSON file. Missing fields keep defaults.
    ///
    /// # Errors
    ///
    /// Returns [`AmlError::InvalidConfig`] if the file cannot be read, does
    /// not parse, or fails [`AmlConfig::validate`].
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, AmlError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| AmlError::InvalidConfig {
            message: format!("cannot read {}: {e}", path.display()),
        })?;
        let config: AmlConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
