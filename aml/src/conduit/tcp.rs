//! TCP mesh between processes.
//!
//! Every pair of nodes shares one TCP connection. Node `r` connects to every
//! node below it and accepts every node above it; both ends then exchange a
//! `Hello` carrying rank and published segment size.
//!
//! # Records
//!
//! ```text
//! [len:4][tag:1][body:len]
//! ```
//!
//! - `Packet`: body is an encoded [`crate::wire::Packet`], queued in the inbox
//! - `Put`: `[offset:8][data]`, applied to the local segment on arrival
//! - `Control`: JSON [`ControlMessage`]
//!
//! A link is served by one reader task and one writer task fed through an
//! unbounded channel, so records from one source are applied in send order
//! and a `Put` lands before any `Packet` sent after it.
//!
//! # Collectives
//!
//! Rank 0 coordinates. Entering barrier `g` sends `Fence { g }` on every link
//! then `BarrierArrive { g }` to rank 0; the barrier is done once rank 0
//! released `g` and a fence for `g` arrived from every peer. Reductions
//! follow the same arrive / result pattern without fences.
//!
//! All tasks are spawned with `spawn_local`: establish the conduit from
//! inside a `tokio::task::LocalSet`.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::{AbortNotice, BarrierTicket, Conduit, ConduitError, ReduceOp, ReduceTicket};
use crate::NodeId;

/// Record header size: 4 + 1 = 5 bytes.
const RECORD_HEADER_SIZE: usize = 5;

/// Connection parameters for [`TcpConduit`].
#[derive(Clone, Debug)]
pub struct TcpConfig {
    /// Delay between two attempts to reach a lower-ranked node.
    pub connect_retry_interval: Duration,

    /// How long setup may take before giving up.
    pub connect_timeout: Duration,

    /// How long `close` waits for every peer to hang up.
    pub shutdown_timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_retry_interval: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordTag {
    Packet = 1,
    Put = 2,
    Control = 3,
}

impl RecordTag {
    fn from_byte(byte: u8) -> Result<Self, ConduitError> {
        match byte {
            1 => Ok(RecordTag::Packet),
            2 => Ok(RecordTag::Put),
            3 => Ok(RecordTag::Control),
            other => Err(ConduitError::Codec {
                message: format!("unknown record tag {other}"),
            }),
        }
    }
}

/// Messages exchanged between conduits, never seen by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlMessage {
    Hello { rank: NodeId, segment_size: usize },
    Fence { generation: u64 },
    BarrierArrive { generation: u64 },
    BarrierRelease { generation: u64 },
    ReduceContribute { generation: u64, op: ReduceOp, value: i64 },
    ReduceResult { generation: u64, value: i64 },
    Abort { origin: NodeId, reason: String },
    Goodbye,
}

fn frame(tag: RecordTag, parts: &[&[u8]]) -> Bytes {
    let len: usize = parts.iter().map(|part| part.len()).sum();
    let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE + len);
    buf.put_u32_le(len as u32);
    buf.put_u8(tag as u8);
    for part in parts {
        buf.put_slice(part);
    }
    buf.freeze()
}

fn control_record(message: &ControlMessage) -> Result<Bytes, ConduitError> {
    let body = serde_json::to_vec(message)?;
    Ok(frame(RecordTag::Control, &[&body]))
}

/// Read one record. `Ok(None)` on a clean end of stream.
async fn read_record<R>(reader: &mut R) -> Result<Option<(RecordTag, Bytes)>, ConduitError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; RECORD_HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let tag = RecordTag::from_byte(header[4])?;
    let mut body = BytesMut::zeroed(len);
    reader.read_exact(&mut body).await?;
    Ok(Some((tag, body.freeze())))
}

/// Arrivals of the collective generation rank 0 is currently gathering.
#[derive(Debug, Default)]
struct Tally {
    generation: u64,
    arrived: usize,
    op: Option<ReduceOp>,
    accumulated: Option<i64>,
}

impl Tally {
    /// Count one arrival. Returns the reduced value once everyone arrived.
    fn arrive(
        &mut self,
        nodes: usize,
        generation: u64,
        contribution: Option<(ReduceOp, i64)>,
    ) -> Result<Option<Option<i64>>, ConduitError> {
        if generation != self.generation {
            return Err(ConduitError::CollectiveMismatch {
                message: format!(
                    "arrival for generation {generation} while gathering {}",
                    self.generation
                ),
            });
        }
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
        if self.arrived < nodes {
            return Ok(None);
        }
        let result = self.accumulated.take();
        self.generation += 1;
        self.arrived = 0;
        self.op = None;
        Ok(Some(result))
    }
}

#[derive(Debug, Default)]
struct Coordinator {
    barrier: Tally,
    reduce: Tally,
}

/// State shared by the conduit and its link tasks.
struct Shared {
    rank: NodeId,
    size: usize,
    /// Outbound record queues, indexed by peer. `None` at the local rank
    /// and after close.
    links: RefCell<Vec<Option<mpsc::UnboundedSender<Bytes>>>>,
    inbox: RefCell<VecDeque<(NodeId, Bytes)>>,
    segment: RefCell<Vec<u8>>,
    /// Highest fenced barrier generation + 1, indexed by peer.
    fences: RefCell<Vec<u64>>,
    /// Highest released barrier generation + 1.
    released: Cell<u64>,
    reduce_result: Cell<Option<(u64, i64)>>,
    coordinator: RefCell<Option<Coordinator>>,
    goodbyes: RefCell<Vec<bool>>,
    abort: RefCell<Option<AbortNotice>>,
}

impl Shared {
    fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.size as u32)
            .map(NodeId::new)
            .filter(move |node| *node != self.rank)
    }

    fn enqueue(&self, dest: NodeId, record: Bytes) -> Result<(), ConduitError> {
        let links = self.links.borrow();
        match links.get(dest.index()) {
            Some(Some(link)) => link
                .send(record)
                .map_err(|_| ConduitError::LinkClosed { node: dest }),
            Some(None) => Err(ConduitError::LinkClosed { node: dest }),
            None => Err(ConduitError::UnknownNode { node: dest }),
        }
    }

    fn send_control(&self, dest: NodeId, message: &ControlMessage) -> Result<(), ConduitError> {
        self.enqueue(dest, control_record(message)?)
    }

    fn broadcast(&self, message: &ControlMessage) {
        let record = match control_record(message) {
            Ok(record) => record,
            Err(err) => {
                error!(error = %err, "control message encoding failed");
                return;
            }
        };
        for peer in self.peers() {
            if let Err(err) = self.enqueue(peer, record.clone()) {
                debug!(%peer, error = %err, "control message dropped");
            }
        }
    }

    fn write_segment(&self, offset: usize, data: &[u8]) -> Result<(), ConduitError> {
        let mut segment = self.segment.borrow_mut();
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

    /// Record an abort. Returns `false` if one was already recorded.
    fn record_abort(&self, origin: NodeId, reason: &str) -> bool {
        let mut abort = self.abort.borrow_mut();
        if abort.is_some() {
            return false;
        }
        error!(%origin, node = %self.rank, reason, "process group aborted");
        *abort = Some(AbortNotice {
            origin,
            reason: reason.to_string(),
        });
        true
    }

    fn abort(&self, origin: NodeId, reason: &str) {
        if self.record_abort(origin, reason) {
            self.broadcast(&ControlMessage::Abort {
                origin,
                reason: reason.to_string(),
            });
        }
    }

    fn coordinate_barrier(&self, generation: u64) -> Result<(), ConduitError> {
        let outcome = match self.coordinator.borrow_mut().as_mut() {
            Some(coordinator) => coordinator.barrier.arrive(self.size, generation, None)?,
            None => {
                return Err(ConduitError::CollectiveMismatch {
                    message: format!("barrier arrival on non-coordinating node {}", self.rank),
                })
            }
        };
        if outcome.is_some() {
            trace!(generation, "barrier released");
            self.released.set(self.released.get().max(generation + 1));
            self.broadcast(&ControlMessage::BarrierRelease { generation });
        }
        Ok(())
    }

    fn coordinate_reduce(&self, generation: u64, op: ReduceOp, value: i64) -> Result<(), ConduitError> {
        let outcome = match self.coordinator.borrow_mut().as_mut() {
            Some(coordinator) => {
                coordinator
                    .reduce
                    .arrive(self.size, generation, Some((op, value)))?
            }
            None => {
                return Err(ConduitError::CollectiveMismatch {
                    message: format!("reduction on non-coordinating node {}", self.rank),
                })
            }
        };
        if let Some(Some(value)) = outcome {
            trace!(generation, value, "reduction complete");
            self.reduce_result.set(Some((generation, value)));
            self.broadcast(&ControlMessage::ReduceResult { generation, value });
        }
        Ok(())
    }

    fn handle_control(&self, peer: NodeId, message: ControlMessage) -> Result<(), ConduitError> {
        match message {
            ControlMessage::Fence { generation } => {
                let mut fences = self.fences.borrow_mut();
                if let Some(fence) = fences.get_mut(peer.index()) {
                    *fence = (*fence).max(generation + 1);
                }
            }
            ControlMessage::BarrierArrive { generation } => self.coordinate_barrier(generation)?,
            ControlMessage::BarrierRelease { generation } => {
                self.released.set(self.released.get().max(generation + 1));
            }
            ControlMessage::ReduceContribute {
                generation,
                op,
                value,
            } => self.coordinate_reduce(generation, op, value)?,
            ControlMessage::ReduceResult { generation, value } => {
                self.reduce_result.set(Some((generation, value)));
            }
            ControlMessage::Abort { origin, reason } => {
                self.record_abort(origin, &reason);
            }
            ControlMessage::Goodbye => {
                debug!(%peer, node = %self.rank, "peer said goodbye");
                if let Some(goodbye) = self.goodbyes.borrow_mut().get_mut(peer.index()) {
                    *goodbye = true;
                }
            }
            ControlMessage::Hello { rank, .. } => {
                warn!(%peer, %rank, "hello after setup ignored");
            }
        }
        Ok(())
    }

    fn handle_record(&self, peer: NodeId, tag: RecordTag, body: Bytes) -> Result<(), ConduitError> {
        match tag {
            RecordTag::Packet => {
                self.inbox.borrow_mut().push_back((peer, body));
            }
            RecordTag::Put => {
                if body.len() < 8 {
                    return Err(ConduitError::Codec {
                        message: "put record without offset".to_string(),
                    });
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&body[..8]);
                self.write_segment(u64::from_le_bytes(raw) as usize, &body[8..])?;
            }
            RecordTag::Control => {
                let message: ControlMessage = serde_json::from_slice(&body)?;
                self.handle_control(peer, message)?;
            }
        }
        Ok(())
    }

    fn said_goodbye(&self, peer: NodeId) -> bool {
        self.goodbyes
            .borrow()
            .get(peer.index())
            .copied()
            .unwrap_or(false)
    }
}

async fn read_loop(shared: Rc<Shared>, peer: NodeId, mut reader: OwnedReadHalf) {
    loop {
        match read_record(&mut reader).await {
            Ok(Some((tag, body))) => {
                if let Err(err) = shared.handle_record(peer, tag, body) {
                    shared.abort(shared.rank, &format!("bad record from node {peer}: {err}"));
                    return;
                }
            }
            Ok(None) if shared.said_goodbye(peer) => {
                debug!(%peer, node = %shared.rank, "link closed");
                return;
            }
            Ok(None) => {
                shared.abort(peer, "connection closed without goodbye");
                return;
            }
            Err(err) => {
                if !shared.said_goodbye(peer) {
                    shared.abort(peer, &format!("connection lost: {err}"));
                }
                return;
            }
        }
    }
}

async fn write_loop(
    shared: Rc<Shared>,
    peer: NodeId,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(record) = outbound.recv().await {
        if let Err(err) = writer.write_all(&record).await {
            warn!(%peer, error = %err, "write failed");
            shared.record_abort(peer, &format!("write failed: {err}"));
            return;
        }
    }
    if let Err(err) = writer.shutdown().await {
        debug!(%peer, error = %err, "shutdown failed");
    }
}

async fn write_control(stream: &mut TcpStream, message: &ControlMessage) -> Result<(), ConduitError> {
    stream.write_all(&control_record(message)?).await?;
    Ok(())
}

async fn read_hello(stream: &mut TcpStream) -> Result<(NodeId, usize), ConduitError> {
    match read_record(stream).await? {
        Some((RecordTag::Control, body)) => match serde_json::from_slice(&body)? {
            ControlMessage::Hello { rank, segment_size } => Ok((rank, segment_size)),
            other => Err(ConduitError::Handshake {
                message: format!("expected hello, got {other:?}"),
            }),
        },
        Some((tag, _)) => Err(ConduitError::Handshake {
            message: format!("expected hello, got {tag:?} record"),
        }),
        None => Err(ConduitError::Handshake {
            message: "connection closed during handshake".to_string(),
        }),
    }
}

async fn connect_with_retry(
    addr: SocketAddr,
    config: &TcpConfig,
    deadline: Instant,
) -> Result<TcpStream, ConduitError> {
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) if Instant::now() + config.connect_retry_interval < deadline => {
                trace!(%addr, error = %err, "connect failed, retrying");
                tokio::time::sleep(config.connect_retry_interval).await;
            }
            Err(err) => {
                return Err(ConduitError::Handshake {
                    message: format!("could not reach {addr}: {err}"),
                })
            }
        }
    }
}

/// [`Conduit`] over a full TCP mesh.
pub struct TcpConduit {
    shared: Rc<Shared>,
    segment_sizes: Vec<usize>,
    config: TcpConfig,
    barrier_generation: Cell<u64>,
    reduce_generation: Cell<u64>,
    readers: Vec<JoinHandle<()>>,
    writers: Vec<JoinHandle<()>>,
    closed: bool,
}

impl TcpConduit {
    /// Join the group.
    ///
    /// `peers` lists the address of every node by rank, this node's own
    /// entry included. `listener` must already be bound to this node's
    /// address.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::Handshake`] when the rank is outside of
    /// `peers`, a peer cannot be reached before `connect_timeout`, or a
    /// peer announces an unexpected rank.
    pub async fn establish(
        listener: TcpListener,
        rank: NodeId,
        peers: Vec<SocketAddr>,
        segment_size: usize,
        config: TcpConfig,
    ) -> Result<Self, ConduitError> {
        let size = peers.len();
        if rank.index() >= size {
            return Err(ConduitError::Handshake {
                message: format!("rank {rank} outside of a group of {size} nodes"),
            });
        }

        let deadline = Instant::now() + config.connect_timeout;
        let hello = ControlMessage::Hello { rank, segment_size };
        let mut streams: Vec<Option<TcpStream>> = (0..size).map(|_| None).collect();
        let mut segment_sizes = vec![0usize; size];
        segment_sizes[rank.index()] = segment_size;

        for (index, addr) in peers.iter().enumerate().take(rank.index()) {
            let expected = NodeId::new(index as u32);
            let mut stream = connect_with_retry(*addr, &config, deadline).await?;
            stream.set_nodelay(true)?;
            write_control(&mut stream, &hello).await?;
            let (announced, peer_segment) = read_hello(&mut stream).await?;
            if announced != expected {
                return Err(ConduitError::Handshake {
                    message: format!("{addr} announced rank {announced}, expected {expected}"),
                });
            }
            debug!(%rank, peer = %expected, "connected");
            segment_sizes[index] = peer_segment;
            streams[index] = Some(stream);
        }

        for _ in rank.index() + 1..size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (mut stream, addr) = tokio::time::timeout(remaining, listener.accept())
                .await
                .map_err(|_| ConduitError::Handshake {
                    message: "timed out waiting for higher ranks".to_string(),
                })??;
            stream.set_nodelay(true)?;
            let (announced, peer_segment) = read_hello(&mut stream).await?;
            let known = streams
                .get(announced.index())
                .map_or(true, Option::is_some);
            if announced <= rank || known {
                return Err(ConduitError::Handshake {
                    message: format!("unexpected hello from rank {announced} at {addr}"),
                });
            }
            write_control(&mut stream, &hello).await?;
            debug!(%rank, peer = %announced, %addr, "accepted");
            segment_sizes[announced.index()] = peer_segment;
            streams[announced.index()] = Some(stream);
        }

        let mut links = Vec::with_capacity(size);
        let mut halves = Vec::new();
        for (index, stream) in streams.into_iter().enumerate() {
            match stream {
                Some(stream) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    links.push(Some(tx));
                    halves.push((NodeId::new(index as u32), stream.into_split(), rx));
                }
                None => links.push(None),
            }
        }

        let shared = Rc::new(Shared {
            rank,
            size,
            links: RefCell::new(links),
            inbox: RefCell::new(VecDeque::new()),
            segment: RefCell::new(vec![0u8; segment_size]),
            fences: RefCell::new(vec![0; size]),
            released: Cell::new(0),
            reduce_result: Cell::new(None),
            coordinator: RefCell::new((rank.index() == 0).then(Coordinator::default)),
            goodbyes: RefCell::new(vec![false; size]),
            abort: RefCell::new(None),
        });

        let mut readers = Vec::with_capacity(halves.len());
        let mut writers = Vec::with_capacity(halves.len());
        for (peer, (read_half, write_half), rx) in halves {
            readers.push(tokio::task::spawn_local(read_loop(
                shared.clone(),
                peer,
                read_half,
            )));
            writers.push(tokio::task::spawn_local(write_loop(
                shared.clone(),
                peer,
                write_half,
                rx,
            )));
        }

        info!(%rank, nodes = size, "tcp conduit established");
        Ok(Self {
            shared,
            segment_sizes,
            config,
            barrier_generation: Cell::new(0),
            reduce_generation: Cell::new(0),
            readers,
            writers,
            closed: false,
        })
    }
}

#[async_trait(?Send)]
impl Conduit for TcpConduit {
    fn rank(&self) -> NodeId {
        self.shared.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn segment_sizes(&self) -> Vec<usize> {
        self.segment_sizes.clone()
    }

    fn send_packet(&self, dest: NodeId, packet: Bytes) -> Result<(), ConduitError> {
        if dest == self.shared.rank {
            self.shared.inbox.borrow_mut().push_back((dest, packet));
            return Ok(());
        }
        self.shared
            .enqueue(dest, frame(RecordTag::Packet, &[&packet]))
    }

    fn try_recv(&self) -> Option<(NodeId, Bytes)> {
        self.shared.inbox.borrow_mut().pop_front()
    }

    fn put(&self, dest: NodeId, offset: usize, data: &[u8]) -> Result<(), ConduitError> {
        if dest == self.shared.rank {
            return self.shared.write_segment(offset, data);
        }
        let size = self
            .segment_sizes
            .get(dest.index())
            .copied()
            .ok_or(ConduitError::UnknownNode { node: dest })?;
        if offset.checked_add(data.len()).map_or(true, |end| end > size) {
            return Err(ConduitError::SegmentOutOfBounds {
                offset,
                len: data.len(),
                size,
            });
        }
        let offset = (offset as u64).to_le_bytes();
        self.shared
            .enqueue(dest, frame(RecordTag::Put, &[&offset, data]))
    }

    fn with_local_segment(
        &self,
        offset: usize,
        len: usize,
        f: &mut dyn FnMut(&[u8]),
    ) -> Result<(), ConduitError> {
        let segment = self.shared.segment.borrow();
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
        let generation = self.barrier_generation.get();
        self.barrier_generation.set(generation + 1);

        let fence = control_record(&ControlMessage::Fence { generation })?;
        for peer in self.shared.peers() {
            self.shared.enqueue(peer, fence.clone())?;
        }
        if self.shared.rank.index() == 0 {
            self.shared.coordinate_barrier(generation)?;
        } else {
            self.shared
                .send_control(NodeId::new(0), &ControlMessage::BarrierArrive { generation })?;
        }
        Ok(BarrierTicket(generation))
    }

    fn barrier_done(&self, ticket: BarrierTicket) -> bool {
        if self.shared.released.get() <= ticket.0 {
            return false;
        }
        let fences = self.shared.fences.borrow();
        self.shared
            .peers()
            .all(|peer| fences[peer.index()] > ticket.0)
    }

    fn reduce_notify(&self, op: ReduceOp, value: i64) -> Result<ReduceTicket, ConduitError> {
        let generation = self.reduce_generation.get();
        self.reduce_generation.set(generation + 1);

        if self.shared.rank.index() == 0 {
            self.shared.coordinate_reduce(generation, op, value)?;
        } else {
            self.shared.send_control(
                NodeId::new(0),
                &ControlMessage::ReduceContribute {
                    generation,
                    op,
                    value,
                },
            )?;
        }
        Ok(ReduceTicket(generation))
    }

    fn reduce_result(&self, ticket: ReduceTicket) -> Result<Option<i64>, ConduitError> {
        match self.shared.reduce_result.get() {
            Some((generation, value)) if generation == ticket.0 => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    fn abort(&self, origin: NodeId, reason: &str) {
        self.shared.abort(origin, reason);
    }

    fn abort_notice(&self) -> Option<AbortNotice> {
        self.shared.abort.borrow().clone()
    }

    async fn close(&mut self) -> Result<(), ConduitError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.shared.broadcast(&ControlMessage::Goodbye);
        self.shared.links.borrow_mut().iter_mut().for_each(|link| *link = None);

        for writer in self.writers.drain(..) {
            if let Err(err) = writer.await {
                warn!(error = %err, "writer task failed");
            }
        }

        let readers = &mut self.readers;
        let drained = async move {
            for reader in readers.iter_mut() {
                let _ = reader.await;
            }
        };
        if tokio::time::timeout(self.config.shutdown_timeout, drained)
            .await
            .is_err()
        {
            warn!(rank = %self.shared.rank, "peers did not hang up in time");
        }
        for reader in self.readers.drain(..) {
            reader.abort();
        }

        info!(rank = %self.shared.rank, "tcp conduit closed");
        Ok(())
    }
}

impl Drop for TcpConduit {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Writers flush what is queued, then exit once their channel is gone.
        self.shared.links.borrow_mut().clear();
        for reader in &self.readers {
            reader.abort();
        }
    }
}
