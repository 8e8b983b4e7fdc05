//! In-process fabric: every node of the group lives on the same thread.
//!
//! The fabric owns one inbox and one registered segment per node. Packets
//! are pushed straight into the destination inbox, `put` copies straight
//! into the destination segment, so delivery order and put-before-packet
//! visibility hold trivially. Collectives count arrivals per generation.
//!
//! All nodes must run as tasks on one single-threaded runtime (for example
//! inside a `tokio::task::LocalSet`), see [`crate::launch::run_local_group`].

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, error};

use super::{AbortNotice, BarrierTicket, Conduit, ConduitError, ReduceOp, ReduceTicket};
use crate::NodeId;

/// Arrival bookkeeping shared by the barrier and the reductions.
#[derive(Debug)]
struct Collective {
    nodes: usize,
    generation: u64,
    arrived: usize,
    op: Option<ReduceOp>,
    accumulated: Option<i64>,
    /// Last completed generation and its reduced value.
    completed: Option<(u64, Option<i64>)>,
}

impl Collective {
    fn new(nodes: usize) -> Self {
        Self {
            nodes,
            generation: 0,
            arrived: 0,
            op: None,
            accumulated: None,
            completed: None,
        }
    }

    fn arrive(&mut self, contribution: Option<(ReduceOp, i64)>) -> Result<u64, ConduitError> {
        let generation = self.generation;
        if let Some((op, value)) = contribution {
            if let Some(current) = self.op {
                if current != op {
                    return Err(ConduitError::CollectiveMismatch {
                        message: format!("{op:?} contributed to a {current:?} reduction"),
                    });
                }
            }
            self.op = Some(op);
            self.accumulated = Some(match self.accumulated {
                Some(acc) => op.apply(acc, value),
                None => value,
            });
        }

        self.arrived += 1;
        if self.arrived == self.nodes {
            self.completed = Some((generation, self.accumulated.take()));
            self.generation += 1;
            self.arrived = 0;
            self.op = None;
        }
        Ok(generation)
    }

    fn is_complete(&self, generation: u64) -> bool {
        self.generation > generation
    }

    fn result(&self, generation: u64) -> Option<i64> {
        match self.completed {
            Some((done, value)) if done == generation => value,
            _ => None,
        }
    }
}

/// State shared by every conduit of one fabric.
struct FabricState {
    segment_sizes: Vec<usize>,
    inboxes: Vec<RefCell<VecDeque<(NodeId, Bytes)>>>,
    segments: Vec<RefCell<Vec<u8>>>,
    barrier: RefCell<Collective>,
    reduce: RefCell<Collective>,
    abort: RefCell<Option<AbortNotice>>,
    closed: Vec<Cell<bool>>,
}

/// An in-process process group.
///
/// # Examples
///
/// ```
/// use aml::conduit::{Conduit, MemFabric};
///
/// let fabric = MemFabric::uniform(3, 4096);
/// let conduits = fabric.conduits();
/// assert_eq!(conduits.len(), 3);
/// assert_eq!(conduits[2].rank().index(), 2);
/// assert_eq!(conduits[0].segment_sizes(), vec![4096; 3]);
/// ```
#[derive(Clone)]
pub struct MemFabric {
    state: Rc<FabricState>,
}

impl MemFabric {
    /// Create a group with one node per entry of `segment_sizes`.
    pub fn new(segment_sizes: Vec<usize>) -> Self {
        let nodes = segment_sizes.len();
        let state = FabricState {
            inboxes: (0..nodes).map(|_| RefCell::new(VecDeque::new())).collect(),
            segments: segment_sizes
                .iter()
                .map(|size| RefCell::new(vec![0u8; *size]))
                .collect(),
            barrier: RefCell::new(Collective::new(nodes)),
            reduce: RefCell::new(Collective::new(nodes)),
            abort: RefCell::new(None),
            closed: (0..nodes).map(|_| Cell::new(false)).collect(),
            segment_sizes,
        };
        debug!(nodes, "in-process fabric created");
        Self {
            state: Rc::new(state),
        }
    }

    /// Create a group of `nodes` nodes with equal segments.
    pub fn uniform(nodes: usize, segment_size: usize) -> Self {
        Self::new(vec![segment_size; nodes])
    }

    /// Number of nodes.
    pub fn nodes(&self) -> usize {
        self.state.segment_sizes.len()
    }

    /// Conduit for `rank`.
    ///
    /// # Panics
    ///
    /// Panics if `rank` is not part of the fabric.
    pub fn conduit(&self, rank: NodeId) -> MemConduit {
        assert!(rank.index() < self.nodes(), "rank {rank} outside of fabric");
        MemConduit {
            rank,
            state: self.state.clone(),
        }
    }

    /// One conduit per node, in rank order.
    pub fn conduits(&self) -> Vec<MemConduit> {
        (0..self.nodes() as u32)
            .map(|rank| self.conduit(NodeId::new(rank)))
            .collect()
    }

    /// Packets queued for `rank` and not yet received.
    pub fn pending_packets(&self, rank: NodeId) -> usize {
        self.state
            .inboxes
            .get(rank.index())
            .map(|inbox| inbox.borrow().len())
            .unwrap_or(0)
    }

    /// Copy of `rank`'s registered segment.
    pub fn segment_snapshot(&self, rank: NodeId) -> Vec<u8> {
        self.state
            .segments
            .get(rank.index())
            .map(|segment| segment.borrow().clone())
            .unwrap_or_default()
    }

    /// Abort observed by the group, if any.
    pub fn abort_notice(&self) -> Option<AbortNotice> {
        self.state.abort.borrow().clone()
    }
}

/// One node's endpoint on a [`MemFabric`].
pub struct MemConduit {
    rank: NodeId,
    state: Rc<FabricState>,
}

impl MemConduit {
    fn check_node(&self, node: NodeId) -> Result<(), ConduitError> {
        if node.index() < self.state.segment_sizes.len() {
            Ok(())
        } else {
            Err(ConduitError::UnknownNode { node })
        }
    }
}

#[async_trait(?Send)]
impl Conduit for MemConduit {
    fn rank(&self) -> NodeId {
        self.rank
    }

    fn size(&self) -> usize {
        self.state.segment_sizes.len()
    }

    fn segment_sizes(&self) -> Vec<usize> {
        self.state.segment_sizes.clone()
    }

    fn send_packet(&self, dest: NodeId, packet: Bytes) -> Result<(), ConduitError> {
        self.check_node(dest)?;
        self.state.inboxes[dest.index()]
            .borrow_mut()
            .push_back((self.rank, packet));
        Ok(())
    }

    fn try_recv(&self) -> Option<(NodeId, Bytes)> {
        self.state.inboxes[self.rank.index()].borrow_mut().pop_front()
    }

    fn put(&self, dest: NodeId, offset: usize, data: &[u8]) -> Result<(), ConduitError> {
        self.check_node(dest)?;
        let mut segment = self.state.segments[dest.index()].borrow_mut();
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= segment.len())
            .ok_or(ConduitError::SegmentOutOfBounds {
                offset,
                len: data.len(),
                size: segment.len(),
            })?;
        segment[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn with_local_segment(
        &self,
        offset: usize,
        len: usize,
        f: &mut dyn FnMut(&[u8]),
    ) -> Result<(), ConduitError> {
        let segment = self.state.segments[self.rank.index()].borrow();
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= segment.len())
            .ok_or(ConduitError::SegmentOutOfBounds {
                offset,
                len,
                size: segment.len(),
            })?;
        f(&segment[offset..end]);
        Ok(())
    }

    fn barrier_notify(&self) -> Result<BarrierTicket, ConduitError> {
        let generation = self.state.barrier.borrow_mut().arrive(None)?;
        Ok(BarrierTicket(generation))
    }

    fn barrier_done(&self, ticket: BarrierTicket) -> bool {
        self.state.barrier.borrow().is_complete(ticket.0)
    }

    fn reduce_notify(&self, op: ReduceOp, value: i64) -> Result<ReduceTicket, ConduitError> {
        let generation = self.state.reduce.borrow_mut().arrive(Some((op, value)))?;
        Ok(ReduceTicket(generation))
    }

    fn reduce_result(&self, ticket: ReduceTicket) -> Result<Option<i64>, ConduitError> {
        let reduce = self.state.reduce.borrow();
        if !reduce.is_complete(ticket.0) {
            return Ok(None);
        }
        match reduce.result(ticket.0) {
            Some(value) => Ok(Some(value)),
            None => Err(ConduitError::CollectiveMismatch {
                message: format!("result of reduction {} already replaced", ticket.0),
            }),
        }
    }

    fn abort(&self, origin: NodeId, reason: &str) {
        let mut abort = self.state.abort.borrow_mut();
        if abort.is_none() {
            error!(%origin, reason, "process group aborted");
            *abort = Some(AbortNotice {
                origin,
                reason: reason.to_string(),
            });
        }
    }

    fn abort_notice(&self) -> Option<AbortNotice> {
        self.state.abort.borrow().clone()
    }

    async fn close(&mut self) -> Result<(), ConduitError> {
        self.state.closed[self.rank.index()].set(true);
        debug!(rank = %self.rank, "in-process conduit closed");
        Ok(())
    }
}
