//! The active message context.
//!
//! [`Aml`] owns everything a node needs to take part in the group: the
//! directory, the handler table, the per-peer slices and the conduit. It is
//! created by [`Aml::init`] and consumed by [`Aml::finalize`].
//!
//! # Send tiers
//!
//! ```text
//! dest == self          -> handler runs inline, nothing on the wire
//! len == 0              -> Short   header only
//! 0 < len < max_medium  -> MedLong payload copied into the packet
//! len <= slice size     -> put into the peer's slice, MedLong header
//!                          with the in-segment flag, LongReply ack
//! otherwise             -> fatal, group aborted
//! ```
//!
//! # Progress
//!
//! Nothing is dispatched behind the caller's back. Receive-side progress
//! happens in [`Aml::poll`] and inside every operation that may block, so a
//! node waiting on a barrier still acknowledges the rendezvous transfer its
//! peers are blocked on.

use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};

use crate::conduit::{Conduit, ReduceOp};
use crate::config::AmlConfig;
use crate::directory::{NodeDirectory, NodeId};
use crate::error::AmlError;
use crate::handler::{handler_id, HandlerTable, MessageHandler};
use crate::lifecycle::LifecycleState;
use crate::metrics::TransportMetrics;
use crate::segment::SegmentRegistry;
use crate::wire::{AckTier, Packet, WireError};

/// Payload handed to handlers of control-tier messages.
const EMPTY: &[u8] = &[];

/// One node's active message context.
///
/// Single-threaded: every operation takes `&mut self` and runs on the task
/// that owns the context.
pub struct Aml<C: Conduit> {
    conduit: C,
    config: AmlConfig,
    directory: NodeDirectory,
    handlers: HandlerTable,
    segments: SegmentRegistry,
    state: LifecycleState,
    metrics: TransportMetrics,
}

impl<C: Conduit> Aml<C> {
    /// Bootstrap the local node and wait for the whole group.
    ///
    /// Every node of the group must call `init` with the same `max_medium`.
    /// Returns once all nodes have bootstrapped.
    ///
    /// # Errors
    ///
    /// [`AmlError::InvalidConfig`] or [`AmlError::Bootstrap`] when the
    /// configuration or the conduit's view of the group is unusable. The
    /// group is aborted so peers do not wait on this node.
    pub async fn init(conduit: C, config: AmlConfig) -> Result<Self, AmlError> {
        let prepared = config.validate().and_then(|()| {
            let directory = NodeDirectory::new(conduit.rank(), conduit.size())?;
            let segments = SegmentRegistry::new(&directory, &conduit.segment_sizes())?;
            Ok((directory, segments))
        });
        let (directory, segments) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                error!(rank = %conduit.rank(), error = %err, "bootstrap failed");
                conduit.abort(conduit.rank(), &err.to_string());
                return Err(err);
            }
        };

        if segments.local_size() != config.segment_size {
            debug!(
                published = segments.local_size(),
                configured = config.segment_size,
                "conduit publishes a different segment size, using it"
            );
        }

        let mut aml = Self {
            handlers: HandlerTable::new(directory.self_id()),
            conduit,
            config,
            directory,
            segments,
            state: LifecycleState::default(),
            metrics: TransportMetrics::new(),
        };
        aml.enter(LifecycleState::Bootstrapping);
        info!(
            node = %aml.self_id(),
            nodes = aml.node_count(),
            segment = aml.segments.local_size(),
            "bootstrapping"
        );

        let result = aml.synchronize("init").await;
        result.map_err(|err| aml.fatal(err))?;

        aml.enter(LifecycleState::Ready);
        info!(node = %aml.self_id(), "ready");
        Ok(aml)
    }

    /// This node's identity.
    pub fn self_id(&self) -> NodeId {
        self.directory.self_id()
    }

    /// Number of nodes in the group.
    pub fn node_count(&self) -> usize {
        self.directory.node_count()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Configuration in use.
    pub fn config(&self) -> &AmlConfig {
        &self.config
    }

    /// Traffic counters.
    pub fn metrics(&self) -> &TransportMetrics {
        &self.metrics
    }

    /// The underlying conduit.
    pub fn conduit(&self) -> &C {
        &self.conduit
    }

    /// Whether a handler is registered at `id` on this node.
    pub fn is_registered(&self, id: u32) -> bool {
        self.handlers.is_registered(id)
    }

    /// Largest rendezvous payload `dest` accepts from this node.
    ///
    /// `None` for the local node or a node outside the group.
    pub fn slice_size(&self, dest: NodeId) -> Option<usize> {
        self.segments.slice(dest).map(|slice| slice.size)
    }

    /// Install `handler` at `id` on every node.
    ///
    /// Collective: every node must call it, in the same order. A barrier
    /// before and after the installation guarantees no message for `id`
    /// is in flight while the table changes, and that every node has the
    /// handler once this returns. Registering an id twice replaces the
    /// previous handler.
    ///
    /// # Errors
    ///
    /// An id outside of `[1, 255]` is fatal:
    /// [`AmlError::InvalidHandlerId`] after aborting the group.
    pub async fn register_handler<H>(&mut self, id: u32, handler: H) -> Result<(), AmlError>
    where
        H: MessageHandler + 'static,
    {
        self.state.ensure_ready("register_handler")?;
        let result = self.register_inner(id, Box::new(handler)).await;
        result.map_err(|err| self.fatal(err))
    }

    async fn register_inner(
        &mut self,
        id: u32,
        handler: Box<dyn MessageHandler>,
    ) -> Result<(), AmlError> {
        handler_id(id)?;
        self.synchronize("register_handler").await?;
        self.progress()?;
        self.handlers.insert(id, handler)?;
        debug!(node = %self.self_id(), handler = id, "handler registered");
        self.synchronize("register_handler").await
    }

    /// Deliver `payload` to the handler registered at `handler` on `dest`.
    ///
    /// Returns once the payload has been handed off: the caller may reuse
    /// its buffer immediately. A rendezvous send waits while the previous
    /// rendezvous transfer to `dest` is unacknowledged.
    ///
    /// # Errors
    ///
    /// Fatal, after aborting the group:
    /// - [`AmlError::InvalidHandlerId`] for an id outside of `[1, 255]`
    /// - [`AmlError::InvalidDestination`] for a node outside the group
    /// - [`AmlError::MessageTooLarge`] when the payload fits neither the
    ///   inline tier nor the slice on `dest`
    ///
    /// [`AmlError::GroupAborted`] if another node tore the group down.
    pub async fn send(&mut self, payload: &[u8], handler: u32, dest: NodeId) -> Result<(), AmlError> {
        self.state.ensure_ready("send")?;
        let result = self.send_inner(payload, handler, dest).await;
        result.map_err(|err| self.fatal(err))
    }

    async fn send_inner(&mut self, payload: &[u8], handler: u32, dest: NodeId) -> Result<(), AmlError> {
        self.progress()?;
        let id = handler_id(handler)?;
        if !self.directory.contains(dest) {
            return Err(AmlError::InvalidDestination {
                destination: dest,
                nodes: self.node_count(),
            });
        }

        let len = payload.len();
        if dest == self.self_id() {
            debug!(node = %dest, handler = id, bytes = len, "local delivery");
            self.handlers.dispatch(id, dest, payload)?;
            self.metrics.record_local_delivery(len);
            return Ok(());
        }

        if len == 0 {
            debug!(%dest, handler = id, "short send");
            self.transmit(dest, Packet::Short { handler: id }.encode()?)?;
            self.metrics.record_short_sent();
            return Ok(());
        }

        if len < self.config.max_medium {
            debug!(%dest, handler = id, bytes = len, "medium send");
            self.transmit(dest, Packet::encode_medium(id, payload)?)?;
            if len > self.config.max_long_request {
                self.segments.inline_sent(dest);
            }
            self.metrics.record_medium_sent(len);
            return Ok(());
        }

        let slice_size = self.slice_size(dest).unwrap_or(0);
        if len > slice_size {
            return Err(AmlError::MessageTooLarge {
                length: len,
                destination: dest,
                inline_max: self.config.max_medium - 1,
                slice_size,
            });
        }

        if !self.segments.is_available(dest) {
            self.metrics.flow_control_waits += 1;
            debug!(%dest, "rendezvous slice in flight, waiting for ack");
        }
        let offset = self
            .block_on("rendezvous slice", |aml| {
                Ok(aml.segments.begin_transfer(dest))
            })
            .await?;

        debug!(%dest, handler = id, bytes = len, offset, "long send");
        self.conduit.put(dest, offset, payload)?;
        let header = Packet::Long {
            handler: id,
            offset: offset as u32,
            size: len as u32,
        };
        self.transmit(dest, header.encode()?)?;
        self.metrics.record_long_sent(len);
        Ok(())
    }

    /// Dispatch every message queued for this node.
    ///
    /// Returns the number of packets processed, acknowledgments included.
    ///
    /// # Errors
    ///
    /// [`AmlError::UnregisteredHandler`] (fatal) when a message names an id
    /// nobody registered, [`AmlError::GroupAborted`] if another node tore
    /// the group down.
    pub fn poll(&mut self) -> Result<usize, AmlError> {
        self.state.ensure_ready("poll")?;
        let result = self.progress();
        result.map_err(|err| self.fatal(err))
    }

    /// Keep dispatching incoming messages until `predicate` holds.
    ///
    /// The predicate usually reads state the handlers update.
    pub async fn wait_until<P>(&mut self, mut predicate: P) -> Result<(), AmlError>
    where
        P: FnMut() -> bool,
    {
        self.state.ensure_ready("wait_until")?;
        let result = self
            .block_on("wait_until", |_| Ok(predicate().then_some(())))
            .await;
        result.map_err(|err| self.fatal(err))
    }

    /// Wait until every node reached this barrier.
    ///
    /// Messages any node sent before entering the barrier have been
    /// dispatched on this node when it returns.
    pub async fn barrier(&mut self) -> Result<(), AmlError> {
        self.state.ensure_ready("barrier")?;
        let result = self.synchronize("barrier").await;
        result.map_err(|err| self.fatal(err))
    }

    /// Sum of `value` over every node.
    pub async fn all_sum(&mut self, value: i64) -> Result<i64, AmlError> {
        self.reduce("all_sum", ReduceOp::Sum, value).await
    }

    /// Smallest `value` over every node.
    pub async fn all_min(&mut self, value: i64) -> Result<i64, AmlError> {
        self.reduce("all_min", ReduceOp::Min, value).await
    }

    /// Largest `value` over every node.
    pub async fn all_max(&mut self, value: i64) -> Result<i64, AmlError> {
        self.reduce("all_max", ReduceOp::Max, value).await
    }

    async fn reduce(&mut self, operation: &'static str, op: ReduceOp, value: i64) -> Result<i64, AmlError> {
        self.state.ensure_ready(operation)?;
        let result = self.reduce_inner(operation, op, value).await;
        result.map_err(|err| self.fatal(err))
    }

    async fn reduce_inner(&mut self, operation: &'static str, op: ReduceOp, value: i64) -> Result<i64, AmlError> {
        self.progress()?;
        let ticket = self.conduit.reduce_notify(op, value)?;
        trace!(node = %self.self_id(), ?op, value, "reduction entered");
        self.block_on(operation, |aml| Ok(aml.conduit.reduce_result(ticket)?))
            .await
    }

    /// Leave the group.
    ///
    /// Collective. Two barriers bracket a final poll so every message sent
    /// before `finalize` is dispatched, then the conduit is released.
    pub async fn finalize(mut self) -> Result<(), AmlError> {
        self.state.ensure_ready("finalize")?;
        info!(node = %self.self_id(), "shutting down");
        self.enter(LifecycleState::ShuttingDown);

        let result = self.finalize_inner().await;
        result.map_err(|err| self.fatal(err))?;

        self.enter(LifecycleState::Terminated);
        info!(
            node = %self.self_id(),
            sent = self.metrics.wire_sends(),
            received = self.metrics.received,
            "terminated"
        );
        Ok(())
    }

    async fn finalize_inner(&mut self) -> Result<(), AmlError> {
        self.synchronize("finalize").await?;
        self.progress()?;
        self.synchronize("finalize").await?;

        let pending: Vec<NodeId> = self.segments.in_flight().collect();
        if !pending.is_empty() {
            warn!(node = %self.self_id(), ?pending, "rendezvous transfers unacknowledged at shutdown");
        }

        self.conduit.close().await?;
        self.handlers.clear();
        self.segments.clear();
        Ok(())
    }

    fn enter(&mut self, next: LifecycleState) {
        debug_assert!(self.state.can_enter(next), "{} -> {next}", self.state);
        trace!(node = %self.self_id(), from = %self.state, to = %next, "lifecycle transition");
        self.state = next;
    }

    /// Barrier without the lifecycle check, with a trailing poll.
    async fn synchronize(&mut self, operation: &'static str) -> Result<(), AmlError> {
        self.progress()?;
        let ticket = self.conduit.barrier_notify()?;
        trace!(node = %self.self_id(), operation, ticket = ticket.0, "barrier entered");
        self.block_on(operation, |aml| Ok(aml.conduit.barrier_done(ticket).then_some(())))
            .await?;
        self.progress()?;
        Ok(())
    }

    /// Poll and yield until `ready` produces a value.
    ///
    /// Never times out. Logs once if the wait exceeds `stall_warning`.
    async fn block_on<T, F>(&mut self, operation: &'static str, mut ready: F) -> Result<T, AmlError>
    where
        F: FnMut(&mut Self) -> Result<Option<T>, AmlError>,
    {
        let started = Instant::now();
        let mut warned = false;
        loop {
            self.progress()?;
            if let Some(value) = ready(self)? {
                return Ok(value);
            }
            if !warned && started.elapsed() >= self.config.stall_warning {
                warn!(
                    node = %self.self_id(),
                    operation,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "still blocked"
                );
                warned = true;
            }
            tokio::task::yield_now().await;
        }
    }

    /// Drain the conduit and dispatch what it held.
    fn progress(&mut self) -> Result<usize, AmlError> {
        if let Some(notice) = self.conduit.abort_notice() {
            return Err(AmlError::GroupAborted {
                origin: notice.origin,
                reason: notice.reason,
            });
        }

        let mut processed = 0;
        while let Some((sender, bytes)) = self.conduit.try_recv() {
            self.metrics.received += 1;
            processed += 1;
            self.handle_packet(sender, bytes)?;
        }
        if processed > 0 {
            trace!(node = %self.self_id(), processed, "poll");
        }
        Ok(processed)
    }

    fn handle_packet(&mut self, sender: NodeId, bytes: Bytes) -> Result<(), AmlError> {
        match Packet::decode(bytes)? {
            Packet::Short { handler } => {
                self.handlers.dispatch(handler, sender, EMPTY)?;
                self.metrics.dispatched += 1;
            }
            Packet::Medium { handler, payload } => {
                self.handlers.dispatch(handler, sender, &payload[..])?;
                self.metrics.dispatched += 1;
                if payload.len() > self.config.max_long_request {
                    self.send_ack(sender, AckTier::Inline)?;
                }
            }
            Packet::Long {
                handler,
                offset,
                size,
            } => {
                let (offset, size) = (offset as usize, size as usize);
                match self.segments.local_slice_of(sender) {
                    Some((start, capacity)) if offset == start && size <= capacity => {}
                    _ => {
                        return Err(WireError::Malformed {
                            reason: "rendezvous transfer outside of the sender's slice",
                        }
                        .into())
                    }
                }

                let handlers = &mut self.handlers;
                let mut outcome = Ok(());
                self.conduit.with_local_segment(offset, size, &mut |data: &[u8]| {
                    outcome = handlers.dispatch(handler, sender, data);
                })?;
                outcome?;
                self.metrics.dispatched += 1;
                self.send_ack(sender, AckTier::Rendezvous)?;
            }
            Packet::Ack { tier } => {
                self.metrics.acks_received += 1;
                trace!(node = %self.self_id(), %sender, ?tier, "ack received");
                match tier {
                    AckTier::Rendezvous => {
                        self.segments.complete_transfer(sender);
                    }
                    AckTier::Inline => self.segments.inline_acknowledged(sender),
                }
            }
        }
        Ok(())
    }

    fn send_ack(&mut self, dest: NodeId, tier: AckTier) -> Result<(), AmlError> {
        self.transmit(dest, Packet::Ack { tier }.encode()?)?;
        self.metrics.acks_sent += 1;
        Ok(())
    }

    fn transmit(&self, dest: NodeId, packet: Bytes) -> Result<(), AmlError> {
        self.conduit.send_packet(dest, packet)?;
        Ok(())
    }

    /// Terminate the context after an unrecoverable error.
    ///
    /// Protocol violations and substrate failures abort the whole group;
    /// an abort initiated elsewhere only terminates the local context.
    fn fatal(&mut self, err: AmlError) -> AmlError {
        if self.state == LifecycleState::Terminated {
            return err;
        }
        self.enter(LifecycleState::Terminated);
        if !matches!(err, AmlError::GroupAborted { .. }) {
            error!(node = %self.self_id(), error = %err, "fatal error, aborting process group");
            self.conduit.abort(self.self_id(), &err.to_string());
        }
        err
    }
}

impl<C: Conduit> Drop for Aml<C> {
    fn drop(&mut self) {
        if self.state.is_live() {
            warn!(node = %self.self_id(), state = %self.state, "context dropped while live, aborting group");
            self.conduit
                .abort(self.self_id(), "context dropped without finalize");
        }
    }
}

impl<C: Conduit> std::fmt::Debug for Aml<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aml")
            .field("node", &self.self_id())
            .field("nodes", &self.node_count())
            .field("state", &self.state)
            .field("handlers", &self.handlers.registered_count())
            .finish_non_exhaustive()
    }
}
