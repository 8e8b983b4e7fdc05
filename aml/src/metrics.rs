//! Counters kept by the transport.

/// Traffic counters of one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportMetrics {
    /// Sends delivered to the local node without wire traffic
    pub local_deliveries: u64,

    /// Control-tier packets sent
    pub short_sent: u64,

    /// Inline-tier packets sent
    pub medium_sent: u64,

    /// Rendezvous transfers sent
    pub long_sent: u64,

    /// Payload bytes handed to the wire or written into peer segments
    pub bytes_sent: u64,

    /// Payload bytes delivered to the local node
    pub local_bytes: u64,

    /// Packets taken from the conduit
    pub received: u64,

    /// Handler invocations, local deliveries included
    pub dispatched: u64,

    /// Completion acks sent back to senders
    pub acks_sent: u64,

    /// Completion acks received
    pub acks_received: u64,

    /// Rendezvous sends that had to wait for the slice
    pub flow_control_waits: u64,
}

impl TransportMetrics {
    /// Create a zeroed instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a send to the local node.
    pub fn record_local_delivery(&mut self, bytes: usize) {
        self.local_deliveries += 1;
        self.dispatched += 1;
        self.local_bytes += bytes as u64;
    }

    /// Record a control-tier send.
    pub fn record_short_sent(&mut self) {
        self.short_sent += 1;
    }

    /// Record an inline-tier send.
    pub fn record_medium_sent(&mut self, bytes: usize) {
        self.medium_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    /// Record a rendezvous send.
    pub fn record_long_sent(&mut self, bytes: usize) {
        self.long_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    /// Total messages that left this node.
    pub fn wire_sends(&self) -> u64 {
        self.short_sent + self.medium_sent + self.long_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiers_counted_separately() {
        let mut metrics = TransportMetrics::new();
        metrics.record_short_sent();
        metrics.record_medium_sent(10);
        metrics.record_long_sent(4096);
        metrics.record_local_delivery(3);

        assert_eq!(metrics.wire_sends(), 3);
        assert_eq!(metrics.bytes_sent, 4106);
        assert_eq!(metrics.local_bytes, 3);
        assert_eq!(metrics.local_deliveries, 1);
        assert_eq!(metrics.dispatched, 1);
    }
}
