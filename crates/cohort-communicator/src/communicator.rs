use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use cohort_transport::{Address, TransportConfig, FLAG_ACK_REQUESTED};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;

use crate::config::CommunicatorConfig;
use crate::connections::{unreachable, ConnectionTable, Route};
use crate::dispatch::{read_loop, Mailbox, Queue};
use crate::error::{CommunicatorError, Result};
use crate::lock;
use crate::rendezvous::{self, Mesh};
use crate::stats::{CommunicatorStats, Stats};
use crate::timeout::Deadline;
use crate::types::{Rank, Tag, Token};

// ── Shared state ─────────────────────────────────────────────────────

/// State shared between the communicator handle and its background tasks.
pub(crate) struct Shared {
    pub rank: Rank,
    pub world_size: usize,
    pub table: ConnectionTable,
    pub mailbox: Mailbox,
    pub stats: Stats,
    pub shutdown: CancellationToken,
    revoked: AtomicBool,
    revoked_signal: CancellationToken,
    stopped: AtomicBool,
    pending_acks: Mutex<HashMap<(Rank, u64), oneshot::Sender<()>>>,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn new(rank: Rank, world_size: usize, table: ConnectionTable, shutdown: CancellationToken) -> Self {
        Self {
            rank,
            world_size,
            table,
            mailbox: Mailbox::default(),
            stats: Stats::new(world_size),
            shutdown,
            revoked: AtomicBool::new(false),
            revoked_signal: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            pending_acks: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    /// Returns `true` only for the call that flipped the flag.
    pub fn mark_revoked(&self) -> bool {
        let first = !self.revoked.swap(true, Ordering::AcqRel);
        if first {
            self.revoked_signal.cancel();
        }
        first
    }

    pub fn on_revoke(&self, from: Rank) {
        if self.mark_revoked() {
            tracing::info!(rank = self.rank, from, "communicator revoked by peer");
            self.broadcast_revoke(Some(from));
        }
    }

    pub fn broadcast_revoke(&self, skip: Option<Rank>) {
        for peer in (0..self.world_size).filter(|&p| p != self.rank && Some(p) != skip) {
            if let Err(e) = self.post(peer, Tag::Revoke, Bytes::new(), None) {
                tracing::debug!(rank = self.rank, peer, "revoke not sent: {e}");
            }
        }
    }

    /// Mark `peer` lost and fail every delivery still waiting on it.
    pub fn peer_lost(&self, peer: Rank) {
        self.table.lost(peer).cancel();
        lock(&self.pending_acks).retain(|&(dst, _), _| dst != peer);
    }

    fn forget_ack(&self, peer: Rank, sequence: u64) {
        lock(&self.pending_acks).remove(&(peer, sequence));
    }

    pub fn resolve_ack(&self, peer: Rank, sequence: u64) {
        if let Some(done) = lock(&self.pending_acks).remove(&(peer, sequence)) {
            let _ = done.send(());
        }
    }

    pub fn acknowledge(&self, peer: Rank, sequence: u64) {
        let payload = Bytes::copy_from_slice(&sequence.to_be_bytes());
        if let Err(e) = self.table.enqueue(peer, Tag::Ack, payload, 0, |_| {}) {
            tracing::debug!(rank = self.rank, peer, "ack not sent: {e}");
        }
    }

    fn check_active(&self, tag: Tag) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(CommunicatorError::NotRunning("communicator stopped".into()));
        }
        if self.is_revoked() && !tag.survives_revoke() {
            return Err(CommunicatorError::Revoked);
        }
        Ok(())
    }

    pub fn check_rank(&self, rank: Rank) -> Result<()> {
        if rank >= self.world_size {
            return Err(CommunicatorError::InvalidArgument(format!(
                "rank {rank} out of range for world size {}",
                self.world_size
            )));
        }
        Ok(())
    }

    /// Queue `payload` for `dst`; never waits for the receiver.
    ///
    /// With `ack` set, the peer acknowledges once the message sits in its
    /// mailbox and `ack` fires.
    pub fn post(
        &self,
        dst: Rank,
        tag: Tag,
        payload: Bytes,
        ack: Option<oneshot::Sender<()>>,
    ) -> Result<Route> {
        self.check_active(tag)?;
        self.check_rank(dst)?;
        let len = payload.len();

        if dst == self.rank {
            self.stats.record_sent(dst, len);
            self.stats.record_received(dst, len);
            self.mailbox.deliver(tag, dst, payload);
            if let Some(done) = ack {
                let _ = done.send(());
            }
            return Ok(Route::Loopback);
        }

        let flags = if ack.is_some() { FLAG_ACK_REQUESTED } else { 0 };
        let pending = &self.pending_acks;
        let route = self.table.enqueue(dst, tag, payload, flags, move |sequence| {
            if let Some(done) = ack {
                lock(pending).insert((dst, sequence), done);
            }
        })?;
        self.stats.record_sent(dst, len);
        Ok(route)
    }

    /// Next message from `src` under `tag`.
    ///
    /// Messages delivered before a peer was lost are still returned;
    /// only then does the receive fail with `NotRunning`.
    pub async fn receive(&self, src: Rank, tag: Tag, deadline: Deadline) -> Result<Bytes> {
        self.check_active(tag)?;
        self.check_rank(src)?;
        let queue = self.mailbox.queue(tag, src);
        let result = self.wait_on(&queue, src, tag, deadline).await;
        self.mailbox.release(tag, src, queue);
        result
    }

    async fn wait_on(&self, queue: &Queue, src: Rank, tag: Tag, deadline: Deadline) -> Result<Bytes> {
        let wait = async {
            let mut rx = queue.rx.lock().await;
            if let Ok(payload) = rx.try_recv() {
                return Ok(payload);
            }
            tokio::select! {
                biased;
                payload = rx.recv() => payload
                    .ok_or_else(|| CommunicatorError::NotRunning("mailbox closed".into())),
                _ = self.revoked_signal.cancelled(), if !tag.survives_revoke() => {
                    Err(CommunicatorError::Revoked)
                }
                _ = self.shutdown.cancelled() => {
                    Err(CommunicatorError::NotRunning("communicator stopped".into()))
                }
                _ = self.table.lost(src).cancelled(), if src != self.rank => {
                    rx.try_recv().map_err(|_| unreachable(src))
                }
            }
        };
        tokio::select! {
            result = wait => result,
            _ = sleep_until(deadline.instant()) => {
                Err(deadline.expired(format!("{tag} from rank {src}")))
            }
        }
    }
}

// ── Communicator ─────────────────────────────────────────────────────

/// A connected group member.
///
/// Created by [`Communicator::connect`] or derived from an existing
/// communicator (`shrink`, `split`, `sub_communicator`). Owns its
/// connections exclusively; they close on [`stop`](Self::stop) or drop.
pub struct Communicator {
    pub(crate) name: String,
    pub(crate) token: Token,
    pub(crate) local_address: Address,
    pub(crate) transport: TransportConfig,
    pub(crate) shared: Arc<Shared>,
    pub(crate) timeout: Mutex<Duration>,
    pub(crate) liveness_round: AtomicU64,
    pub(crate) derive_attempts: Mutex<HashMap<(String, Vec<Rank>), u64>>,
    tasks: Mutex<JoinSet<()>>,
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("name", &self.name)
            .field("rank", &self.shared.rank)
            .field("world_size", &self.shared.world_size)
            .field("revoked", &self.shared.is_revoked())
            .finish_non_exhaustive()
    }
}

impl Communicator {
    /// Join a group: run the rendezvous and start the dispatch tasks.
    pub async fn connect(config: CommunicatorConfig) -> Result<Self> {
        let rank = config.rank;
        let name = config.name.clone();
        let token = config.token.clone();
        let timeout = config.timeout;
        let transport = config.transport.clone();

        let mesh = rendezvous::establish(config).await?;
        Ok(Self::from_mesh(rank, name, token, timeout, transport, mesh))
    }

    fn from_mesh(
        rank: Rank,
        name: String,
        token: Token,
        timeout: Duration,
        transport: TransportConfig,
        mesh: Mesh,
    ) -> Self {
        let world_size = mesh.links.len();
        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let (table, readers) = ConnectionTable::build(
            rank,
            mesh.links,
            transport.frame_limit(),
            &shutdown,
            &mut tasks,
        );

        let shared = Arc::new(Shared::new(rank, world_size, table, shutdown));
        for (peer, reader) in readers {
            tasks.spawn(read_loop(shared.clone(), peer, reader));
        }
        tracing::info!(rank, world_size, name = %name, "communicator ready");

        Self {
            name,
            token,
            local_address: mesh.local_address,
            transport,
            shared,
            timeout: Mutex::new(timeout),
            liveness_round: AtomicU64::new(0),
            derive_attempts: Mutex::new(HashMap::new()),
            tasks: Mutex::new(tasks),
        }
    }

    pub fn rank(&self) -> Rank {
        self.shared.rank
    }

    pub fn world_size(&self) -> usize {
        self.shared.world_size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    /// Address this member listened on while the group formed.
    pub fn local_address(&self) -> &Address {
        &self.local_address
    }

    pub fn transport(&self) -> &TransportConfig {
        &self.transport
    }

    pub fn is_revoked(&self) -> bool {
        self.shared.is_revoked()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Whether the connection to `peer` has failed or closed.
    pub fn is_lost(&self, peer: Rank) -> bool {
        peer < self.world_size() && self.shared.table.is_lost(peer)
    }

    pub fn stats(&self) -> CommunicatorStats {
        self.shared.stats.snapshot()
    }

    // ── Point-to-point ───────────────────────────────────────────────

    /// Send `value` to `dst` under a user tag. Returns once the message is
    /// queued; it never waits for a matching receive.
    pub async fn send<T: Serialize + ?Sized>(&self, dst: Rank, tag: u32, value: &T) -> Result<()> {
        self.send_tagged(dst, user_tag(tag)?, value)
    }

    /// Receive the next value sent by `src` under a user tag.
    pub async fn recv<T: DeserializeOwned>(&self, src: Rank, tag: u32) -> Result<T> {
        self.recv_tagged(src, user_tag(tag)?, self.deadline()).await
    }

    /// Send and get a handle that completes once the receiver's dispatch
    /// loop has put the message in its mailbox.
    pub async fn isend<T: Serialize + ?Sized>(
        &self,
        dst: Rank,
        tag: u32,
        value: &T,
    ) -> Result<SendHandle> {
        let tag = user_tag(tag)?;
        let payload = encode(value)?;
        let (done, delivered) = oneshot::channel();
        let route = self.shared.post(dst, tag, payload, Some(done))?;
        Ok(SendHandle {
            delivered,
            completed: false,
            dst,
            sequence: match route {
                Route::Queued(sequence) => Some(sequence),
                Route::Loopback => None,
            },
            shared: self.shared.clone(),
            timeout: self.timeout(),
        })
    }

    /// Receive in the background.
    pub fn irecv<T>(&self, src: Rank, tag: u32) -> Result<RecvHandle<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let tag = user_tag(tag)?;
        self.shared.check_rank(src)?;
        let shared = self.shared.clone();
        let deadline = self.deadline();
        let task = tokio::spawn(async move {
            let payload = shared.receive(src, tag, deadline).await?;
            decode(&payload)
        });
        Ok(RecvHandle { task })
    }

    pub(crate) fn send_tagged<T: Serialize + ?Sized>(
        &self,
        dst: Rank,
        tag: Tag,
        value: &T,
    ) -> Result<()> {
        self.shared.post(dst, tag, encode(value)?, None)?;
        Ok(())
    }

    pub(crate) async fn recv_tagged<T: DeserializeOwned>(
        &self,
        src: Rank,
        tag: Tag,
        deadline: Deadline,
    ) -> Result<T> {
        let payload = self.shared.receive(src, tag, deadline).await?;
        decode(&payload)
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Flush queued messages, close every connection and wait for the
    /// background tasks. Later operations fail with `NotRunning`.
    pub async fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let flushed = tokio::time::timeout(self.timeout(), self.shared.table.flush_all()).await;
        if flushed.is_err() {
            tracing::warn!(rank = self.rank(), "pending messages not flushed before stop");
        }
        self.shared.shutdown.cancel();

        let mut tasks = std::mem::take(&mut *lock(&self.tasks));
        while tasks.join_next().await.is_some() {}
        tracing::info!(rank = self.rank(), name = %self.name, "communicator stopped");
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        // writers drain what is already queued, then close their half
        self.shared.shutdown.cancel();
        lock(&self.tasks).detach_all();
    }
}

pub(crate) fn user_tag(tag: u32) -> Result<Tag> {
    Tag::user(tag)
        .ok_or_else(|| CommunicatorError::InvalidArgument(format!("tag {tag:#x} is reserved")))
}

pub(crate) fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(rmp_serde::to_vec(value)?))
}

pub(crate) fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(payload)?)
}

// ── Handles ──────────────────────────────────────────────────────────

/// Completion of an [`isend`](Communicator::isend).
#[derive(Debug)]
pub struct SendHandle {
    delivered: oneshot::Receiver<()>,
    completed: bool,
    dst: Rank,
    /// `None` for loopback sends, which complete at once.
    sequence: Option<u64>,
    shared: Arc<Shared>,
    timeout: Duration,
}

impl SendHandle {
    /// Whether the receiver has the message, without waiting.
    pub fn is_completed(&mut self) -> bool {
        if !self.completed {
            self.completed = self.delivered.try_recv().is_ok();
        }
        self.completed
    }

    /// Wait until the receiver has the message.
    pub async fn wait(mut self) -> Result<()> {
        if self.is_completed() {
            return Ok(());
        }
        let deadline = Deadline::after(self.timeout);
        let lost = self.shared.table.lost(self.dst);
        tokio::select! {
            biased;
            delivered = &mut self.delivered => {
                delivered.map_err(|_| unreachable(self.dst))
            }
            _ = lost.cancelled() => Err(unreachable(self.dst)),
            _ = self.shared.shutdown.cancelled() => {
                Err(CommunicatorError::NotRunning("communicator stopped".into()))
            }
            _ = sleep_until(deadline.instant()) => {
                Err(deadline.expired(format!("delivery to rank {}", self.dst)))
            }
        }
    }
}

impl Drop for SendHandle {
    fn drop(&mut self) {
        if let Some(sequence) = self.sequence {
            self.shared.forget_ack(self.dst, sequence);
        }
    }
}

/// Result of an [`irecv`](Communicator::irecv). Dropping the handle
/// cancels the receive.
#[derive(Debug)]
pub struct RecvHandle<T> {
    task: JoinHandle<Result<T>>,
}

impl<T> RecvHandle<T> {
    pub fn is_completed(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(mut self) -> Result<T> {
        match (&mut self.task).await {
            Ok(result) => result,
            Err(e) => Err(CommunicatorError::NotRunning(format!(
                "receive task failed: {e}"
            ))),
        }
    }
}

impl<T> Drop for RecvHandle<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}
