// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify};

use swarmpi_wire::{Envelope, EnvelopeKind, Payload, Rank, ScalarValue};

use crate::cancel::CancellationFlag;
use crate::error::CommError;
use crate::link::{Link, LinkState};

/// Per-peer inbound FIFO bound (§4.3): once a peer's queue is this deep, its
/// `push` suspends until `recv` drains one, which backpropagates into the
/// bounded outbound/router channels all the way to that peer's socket.
const INBOX_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Prod,
    Min,
    Max,
    All,
    Any,
}

impl ReduceOp {
    /// Folds `values` left-to-right in the given (already rank-ordered)
    /// order, matching the deterministic-reduce requirement for
    /// floating-point reproducibility.
    pub fn fold(self, values: Vec<Payload>) -> Result<Payload, CommError> {
        let mut iter = values.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| CommError::Internal("reduce over an empty group".into()))?;
        iter.try_fold(first, |acc, next| self.combine(acc, next))
    }

    fn combine(self, a: Payload, b: Payload) -> Result<Payload, CommError> {
        match (self, a, b) {
            (ReduceOp::Sum, Payload::Scalar(ScalarValue::F64(a)), Payload::Scalar(ScalarValue::F64(b))) => {
                Ok(Payload::Scalar(ScalarValue::F64(a + b)))
            }
            (ReduceOp::Sum, Payload::Scalar(ScalarValue::I64(a)), Payload::Scalar(ScalarValue::I64(b))) => {
                Ok(Payload::Scalar(ScalarValue::I64(a + b)))
            }
            (ReduceOp::Prod, Payload::Scalar(ScalarValue::F64(a)), Payload::Scalar(ScalarValue::F64(b))) => {
                Ok(Payload::Scalar(ScalarValue::F64(a * b)))
            }
            (ReduceOp::Prod, Payload::Scalar(ScalarValue::I64(a)), Payload::Scalar(ScalarValue::I64(b))) => {
                Ok(Payload::Scalar(ScalarValue::I64(a * b)))
            }
            (ReduceOp::Min, Payload::Scalar(ScalarValue::F64(a)), Payload::Scalar(ScalarValue::F64(b))) => {
                Ok(Payload::Scalar(ScalarValue::F64(a.min(b))))
            }
            (ReduceOp::Max, Payload::Scalar(ScalarValue::F64(a)), Payload::Scalar(ScalarValue::F64(b))) => {
                Ok(Payload::Scalar(ScalarValue::F64(a.max(b))))
            }
            (ReduceOp::All, Payload::Scalar(ScalarValue::Bool(a)), Payload::Scalar(ScalarValue::Bool(b))) => {
                Ok(Payload::Scalar(ScalarValue::Bool(a && b)))
            }
            (ReduceOp::Any, Payload::Scalar(ScalarValue::Bool(a)), Payload::Scalar(ScalarValue::Bool(b))) => {
                Ok(Payload::Scalar(ScalarValue::Bool(a || b)))
            }
            (op, a, b) => Err(CommError::ProtocolViolation(format!(
                "reduce op {op:?} is not defined for operands {a:?} / {b:?}"
            ))),
        }
    }
}

/// The message-passing surface exposed to kernels. All operations are
/// blocking (suspend the calling task, never the OS thread).
#[async_trait]
pub trait Communicator: Send + Sync {
    fn size(&self) -> u32;
    fn rank(&self) -> Rank;
    fn cancellation(&self) -> &CancellationFlag;

    async fn send(&self, to: Rank, payload: Payload) -> Result<(), CommError>;
    async fn recv(&self, from: Rank) -> Result<Payload, CommError>;

    async fn bcast(&self, root: Rank, value: Option<Payload>) -> Result<Payload, CommError>;
    async fn scatter(&self, root: Rank, chunks: Option<Vec<Payload>>) -> Result<Payload, CommError>;
    async fn gather(&self, root: Rank, value: Payload) -> Result<Option<Vec<Payload>>, CommError>;
    async fn reduce(&self, root: Rank, value: Payload, op: ReduceOp) -> Result<Option<Payload>, CommError>;
    async fn barrier(&self) -> Result<(), CommError>;

    /// A rank that wants the whole job cancelled (e.g. `is_prime` finding a
    /// divisor, §9 Q2) calls this instead of setting its own flag in
    /// isolation. On rank 0 it is equivalent to [`ClusterCommunicator::broadcast_cancel`];
    /// on any other rank it asks rank 0 to do so.
    async fn request_cancellation(&self) -> Result<(), CommError>;
}

struct Inbox {
    queues: Mutex<HashMap<Rank, VecDeque<Payload>>>,
    notify: Notify,
    space: Notify,
}

impl Inbox {
    fn new() -> Self {
        Self { queues: Mutex::new(HashMap::new()), notify: Notify::new(), space: Notify::new() }
    }

    /// Suspends once `from`'s queue is at `INBOX_CAPACITY`, until `try_pop`
    /// frees a slot. Registers on `space` before re-checking so a `try_pop`
    /// that lands between the check and the wait is never missed (the same
    /// enable-before-check pattern `try_pop`'s callers use against `notify`).
    async fn push(&self, from: Rank, payload: Payload) {
        let mut payload = Some(payload);
        loop {
            {
                let mut queues = self.queues.lock().await;
                let queue = queues.entry(from).or_default();
                if queue.len() < INBOX_CAPACITY {
                    queue.push_back(payload.take().expect("payload only taken once"));
                    drop(queues);
                    self.notify.notify_waiters();
                    return;
                }
            }

            let waiting = self.space.notified();
            tokio::pin!(waiting);
            waiting.as_mut().enable();

            {
                let mut queues = self.queues.lock().await;
                let queue = queues.entry(from).or_default();
                if queue.len() < INBOX_CAPACITY {
                    queue.push_back(payload.take().expect("payload only taken once"));
                    drop(queues);
                    self.notify.notify_waiters();
                    return;
                }
            }

            waiting.await;
        }
    }

    async fn try_pop(&self, from: Rank) -> Option<Payload> {
        let mut queues = self.queues.lock().await;
        let popped = queues.get_mut(&from).and_then(|q| q.pop_front());
        drop(queues);
        if popped.is_some() {
            self.space.notify_waiters();
        }
        popped
    }
}

/// A real, network-backed communicator. On the master it owns `size - 1`
/// links, one per worker, plus a router task enforcing star routing. On a
/// worker it owns exactly one link, to rank 0.
pub struct ClusterCommunicator {
    rank: Rank,
    size: u32,
    links: Mutex<HashMap<Rank, Link>>,
    inbox: Arc<Inbox>,
    seq: Mutex<HashMap<Rank, u64>>,
    cancel: CancellationFlag,
    control_tx: broadcast::Sender<Envelope>,
    router_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    lost_peers: Mutex<HashSet<Rank>>,
}

impl ClusterCommunicator {
    /// Builds a communicator from an already-assigned link map. `router_rx`
    /// is the channel every link's reader feeds into (see `link::spawn_tcp_link`
    /// callers in `swarmpi-launch`); this constructor spawns the task that
    /// classifies and routes every inbound envelope, plus one watchdog per
    /// link that notices when it goes `Broken` mid-job.
    pub fn new(
        rank: Rank,
        size: u32,
        links: HashMap<Rank, Link>,
        router_rx: mpsc::Receiver<Envelope>,
        cancel: CancellationFlag,
    ) -> Arc<Self> {
        let (control_tx, _) = broadcast::channel(1024);
        let watched_states: Vec<(Rank, watch::Receiver<LinkState>)> =
            links.iter().map(|(&peer, link)| (peer, link.subscribe_state())).collect();
        let comm = Arc::new(Self {
            rank,
            size,
            links: Mutex::new(links),
            inbox: Arc::new(Inbox::new()),
            seq: Mutex::new(HashMap::new()),
            cancel,
            control_tx,
            router_task: std::sync::Mutex::new(None),
            lost_peers: Mutex::new(HashSet::new()),
        });
        let task = tokio::spawn(Self::run_router(comm.clone(), router_rx));
        *comm.router_task.lock().expect("router_task mutex poisoned") = Some(task);
        for (peer, state_rx) in watched_states {
            tokio::spawn(Self::monitor_link(comm.clone(), peer, state_rx));
        }
        comm
    }

    async fn run_router(self: Arc<Self>, mut router_rx: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = router_rx.recv().await {
            self.dispatch(envelope).await;
        }
    }

    /// Watches one link's state until it ends, then marks its peer lost so
    /// any call blocked on it (`recv`, and transitively `bcast`/`scatter`/
    /// `gather`/`reduce`/`barrier`) wakes with `CommError::PeerLost` instead
    /// of hanging forever. `Closed` counts too, not just `Broken`: the only
    /// place this crate calls `Link::close()` is `RunningJob::teardown`,
    /// which removes the link from `self.links` first, so by the time the
    /// writer task settles on `Closed` the cascade below is a no-op — any
    /// other `Closed` transition means the peer's socket saw a clean FIN
    /// while the job was still running, which is exactly the dead-worker
    /// case this monitor exists for.
    async fn monitor_link(self: Arc<Self>, peer: Rank, mut state_rx: watch::Receiver<LinkState>) {
        loop {
            let state = *state_rx.borrow();
            if matches!(state, LinkState::Broken | LinkState::Closed) {
                self.mark_peer_lost(peer).await;
                return;
            }
            if state_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Records `peer` as lost, wakes every blocked `recv`, and — on rank 0
    /// only — cascades CANCEL to the surviving workers (§7: the master is
    /// the sole cancellation authority, so a dead worker unwinds the whole
    /// job rather than leaving the rest of the group stuck in a collective).
    async fn mark_peer_lost(&self, peer: Rank) {
        {
            let mut lost = self.lost_peers.lock().await;
            if !lost.insert(peer) {
                return;
            }
        }
        tracing::warn!(peer, "link broken mid-job, marking peer lost");
        self.cancel.cancel();
        self.inbox.notify.notify_waiters();
        self.inbox.space.notify_waiters();

        if self.rank == 0 {
            let links = self.links.lock().await;
            for (&other, link) in links.iter() {
                if other == peer || link.state() != LinkState::Open {
                    continue;
                }
                let seq = self.next_seq(other).await;
                let _ = link.send(Envelope::cancel(self.rank, other, seq)).await;
            }
        }
    }

    async fn peer_lost_error(&self, from: Rank) -> Option<CommError> {
        if self.lost_peers.lock().await.contains(&from) {
            Some(CommError::PeerLost(from))
        } else {
            None
        }
    }

    async fn dispatch(&self, envelope: Envelope) {
        if envelope.to_rank != self.rank {
            // Star routing: only rank 0 ever forwards.
            let links = self.links.lock().await;
            if let Some(link) = links.get(&envelope.to_rank) {
                if let Err(err) = link.send(envelope).await {
                    tracing::warn!(to = %err, "failed to forward routed envelope");
                }
            } else {
                tracing::warn!(to_rank = envelope.to_rank, "no route to rank, dropping envelope");
            }
            return;
        }

        match envelope.kind {
            EnvelopeKind::Data => {
                self.inbox.push(envelope.from_rank, envelope.payload).await;
            }
            EnvelopeKind::Cancel => {
                self.cancel.cancel();
                if self.rank == 0 {
                    // Master is the sole cancellation authority: a request
                    // that reaches rank 0 (whether self-initiated or a
                    // worker's early-exit signal) cascades to every peer.
                    let peers: Vec<Rank> = self.links.lock().await.keys().copied().collect();
                    for peer in peers {
                        let seq = self.next_seq(peer).await;
                        let links = self.links.lock().await;
                        if let Some(link) = links.get(&peer) {
                            let _ = link.send(Envelope::cancel(self.rank, peer, seq)).await;
                        }
                    }
                }
                let _ = self.control_tx.send(envelope);
            }
            _ => {
                let _ = self.control_tx.send(envelope);
            }
        }
    }

    pub fn subscribe_control(&self) -> broadcast::Receiver<Envelope> {
        self.control_tx.subscribe()
    }

    async fn next_seq(&self, to: Rank) -> u64 {
        let mut seq = self.seq.lock().await;
        let entry = seq.entry(to).or_insert(0);
        let current = *entry;
        *entry += 1;
        current
    }

    async fn route_for(&self, to: Rank) -> Result<Rank, CommError> {
        if self.rank == 0 {
            Ok(to)
        } else {
            // Workers have exactly one physical link: to rank 0, which
            // forwards on our behalf regardless of the logical destination.
            Ok(0)
        }
    }

    /// Only valid on rank 0: sends CANCEL to every worker and sets the
    /// local flag. This is how cancellation actually originates — kernels
    /// only ever *observe* the flag via [`Communicator::cancellation`].
    pub async fn broadcast_cancel(&self) -> Result<(), CommError> {
        self.cancel.cancel();
        let links = self.links.lock().await;
        for (&rank, link) in links.iter() {
            let seq = self.next_seq(rank).await;
            link.send(Envelope::cancel(self.rank, rank, seq)).await?;
        }
        Ok(())
    }

    /// Only valid on rank 0: sends SHUTDOWN to every worker.
    pub async fn shutdown_all(&self) -> Result<(), CommError> {
        let links = self.links.lock().await;
        for (&rank, link) in links.iter() {
            let seq = self.next_seq(rank).await;
            link.send(Envelope::shutdown(self.rank, rank, seq)).await?;
        }
        Ok(())
    }

    pub async fn take_link(&self, rank: Rank) -> Option<Link> {
        self.links.lock().await.remove(&rank)
    }

    /// Aborts the router task. Teardown calls this after closing every link
    /// so a router stuck inside a bounded `Inbox::push` with no one left to
    /// drain it doesn't outlive the job.
    pub fn abort_router(&self) {
        if let Some(task) = self.router_task.lock().expect("router_task mutex poisoned").take() {
            task.abort();
        }
    }

    /// Sends a non-`DATA` envelope (handshake and lifecycle messages). `to`
    /// is the logical destination; on a worker this always physically goes
    /// out over the single link to rank 0.
    pub async fn send_control(&self, to: Rank, kind: EnvelopeKind, payload: Payload) -> Result<(), CommError> {
        let route_to = self.route_for(to).await?;
        let seq = self.next_seq(to).await;
        let envelope = Envelope::new(kind, self.rank, to, seq, payload);
        let links = self.links.lock().await;
        let link = links.get(&route_to).ok_or(CommError::PeerLost(route_to))?;
        link.send(envelope).await
    }
}

#[async_trait]
impl Communicator for ClusterCommunicator {
    fn size(&self) -> u32 {
        self.size
    }

    fn rank(&self) -> Rank {
        self.rank
    }

    fn cancellation(&self) -> &CancellationFlag {
        &self.cancel
    }

    async fn send(&self, to: Rank, payload: Payload) -> Result<(), CommError> {
        if to == self.rank {
            return Err(CommError::ProtocolViolation("send to self".into()));
        }
        let route_to = self.route_for(to).await?;
        let seq = self.next_seq(to).await;
        let envelope = Envelope::new(EnvelopeKind::Data, self.rank, to, seq, payload);
        let links = self.links.lock().await;
        let link = links.get(&route_to).ok_or(CommError::PeerLost(route_to))?;
        link.send(envelope).await
    }

    async fn recv(&self, from: Rank) -> Result<Payload, CommError> {
        loop {
            if let Some(payload) = self.inbox.try_pop(from).await {
                return Ok(payload);
            }
            if let Some(err) = self.peer_lost_error(from).await {
                return Err(err);
            }

            // `enable()` registers this waiter with `notify` before we check
            // state again, so a `push`/`mark_peer_lost` landing right here is
            // not lost — `notify_waiters()` only wakes *already-registered*
            // waiters, and without this a fresh `notified()` built after the
            // race window would never see it.
            let notified = self.inbox.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payload) = self.inbox.try_pop(from).await {
                return Ok(payload);
            }
            if let Some(err) = self.peer_lost_error(from).await {
                return Err(err);
            }

            tokio::select! {
                _ = notified => continue,
                _ = self.cancel.wait() => return Err(CommError::Cancelled),
            }
        }
    }

    async fn bcast(&self, root: Rank, value: Option<Payload>) -> Result<Payload, CommError> {
        if self.rank == root {
            let value = value.ok_or_else(|| {
                CommError::ProtocolViolation("bcast root must supply a value".into())
            })?;
            for peer in 0..self.size {
                if peer != root {
                    self.send(peer, value.clone()).await?;
                }
            }
            Ok(value)
        } else {
            self.recv(root).await
        }
    }

    async fn scatter(&self, root: Rank, chunks: Option<Vec<Payload>>) -> Result<Payload, CommError> {
        if self.rank == root {
            let mut chunks = chunks.ok_or_else(|| {
                CommError::ProtocolViolation("scatter root must supply chunks".into())
            })?;
            if chunks.len() as u32 != self.size {
                return Err(CommError::CollectiveMismatch(format!(
                    "scatter expected {} chunks, got {}",
                    self.size,
                    chunks.len()
                )));
            }
            let mine = chunks[root as usize].clone();
            for peer in 0..self.size {
                if peer != root {
                    let chunk = std::mem::replace(&mut chunks[peer as usize], Payload::Empty);
                    self.send(peer, chunk).await?;
                }
            }
            Ok(mine)
        } else {
            self.recv(root).await
        }
    }

    async fn gather(&self, root: Rank, value: Payload) -> Result<Option<Vec<Payload>>, CommError> {
        if self.rank == root {
            let mut out = Vec::with_capacity(self.size as usize);
            for peer in 0..self.size {
                if peer == root {
                    out.push(value.clone());
                } else {
                    out.push(self.recv(peer).await?);
                }
            }
            Ok(Some(out))
        } else {
            self.send(root, value).await?;
            Ok(None)
        }
    }

    async fn reduce(&self, root: Rank, value: Payload, op: ReduceOp) -> Result<Option<Payload>, CommError> {
        match self.gather(root, value).await? {
            Some(values) => Ok(Some(op.fold(values)?)),
            None => Ok(None),
        }
    }

    async fn barrier(&self) -> Result<(), CommError> {
        let sentinel = Payload::Scalar(ScalarValue::Bool(true));
        self.gather(0, sentinel.clone()).await?;
        self.bcast(0, if self.rank == 0 { Some(sentinel) } else { None }).await?;
        Ok(())
    }

    async fn request_cancellation(&self) -> Result<(), CommError> {
        if self.rank == 0 {
            self.broadcast_cancel().await
        } else {
            self.send_control(0, EnvelopeKind::Cancel, Payload::Empty).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_sum_fold_is_left_to_right() {
        let values = vec![
            Payload::Scalar(ScalarValue::F64(1.0)),
            Payload::Scalar(ScalarValue::F64(2.0)),
            Payload::Scalar(ScalarValue::F64(3.0)),
        ];
        let folded = ReduceOp::Sum.fold(values).unwrap();
        match folded {
            Payload::Scalar(ScalarValue::F64(v)) => assert_eq!(v, 6.0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn any_reduce_is_true_if_one_rank_found_it() {
        let values = vec![
            Payload::Scalar(ScalarValue::Bool(false)),
            Payload::Scalar(ScalarValue::Bool(true)),
            Payload::Scalar(ScalarValue::Bool(false)),
        ];
        let folded = ReduceOp::Any.fold(values).unwrap();
        assert_eq!(folded, Payload::Scalar(ScalarValue::Bool(true)));
    }
}
