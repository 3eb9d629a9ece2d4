//! Group formation.
//!
//! Rank 0 (the root) collects a `Hello` from every other member, checks
//! that all of them agree on world size, name and token, and answers with
//! the full address list. Members then build the remaining edges of the
//! mesh (rank `i` dials every `0 < j < i` and accepts every `k > i`),
//! report the outcome to the root, and the root turns the reports into a
//! single `Go` or `Abort` for the whole group.
//!
//! Every step is bounded by one deadline taken when the rendezvous starts.

use std::future::Future;
use std::time::Duration;

use cohort_transport::{
    dial, Address, BoxedStream, Connection, Frame, Listener, TlsContext, TransportConfig,
    TransportError,
};
use futures_util::future::join_all;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep_until, timeout_at, Instant};

use crate::config::CommunicatorConfig;
use crate::error::{CommunicatorError, Result};
use crate::types::{Rank, Tag, Token};

/// How long a failing root keeps trying to tell peers why.
const ABORT_GRACE: Duration = Duration::from_millis(200);

// ── Wire messages ────────────────────────────────────────────────────

/// Why a rendezvous failed; shared verbatim with every member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum AbortReason {
    TokenMismatch,
    GroupMismatch(String),
    Timeout,
    EncryptionFailed(String),
    PeerLost(String),
}

impl AbortReason {
    pub(crate) fn into_error(self, timeout: Duration) -> CommunicatorError {
        match self {
            AbortReason::TokenMismatch => CommunicatorError::TokenMismatch,
            AbortReason::GroupMismatch(reason) => CommunicatorError::GroupMismatch(reason),
            AbortReason::Timeout => CommunicatorError::timeout("rendezvous", timeout),
            AbortReason::EncryptionFailed(reason) => CommunicatorError::EncryptionFailed(reason),
            AbortReason::PeerLost(reason) => CommunicatorError::NotRunning(reason),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    rank: Rank,
    world_size: usize,
    name: String,
    token: Token,
    listen: Address,
}

#[derive(Debug, Serialize, Deserialize)]
enum Handshake {
    /// member → root
    Hello(Hello),
    /// root → member: listen address of every rank
    Welcome { addresses: Vec<Address> },
    Abort { reason: AbortReason },
    /// dialer → acceptor while building the mesh
    Dial { rank: Rank, name: String, token: Token },
    Accepted,
    /// member → root once its mesh edges are settled
    Ready { outcome: Result<(), AbortReason> },
    Go,
}

impl Handshake {
    fn kind(&self) -> &'static str {
        match self {
            Handshake::Hello(_) => "Hello",
            Handshake::Welcome { .. } => "Welcome",
            Handshake::Abort { .. } => "Abort",
            Handshake::Dial { .. } => "Dial",
            Handshake::Accepted => "Accepted",
            Handshake::Ready { .. } => "Ready",
            Handshake::Go => "Go",
        }
    }
}

fn unexpected(message: &Handshake) -> AbortReason {
    AbortReason::GroupMismatch(format!("unexpected {} during rendezvous", message.kind()))
}

// ── Entry point ──────────────────────────────────────────────────────

/// A fully connected member: one link per peer, `None` at its own rank.
pub(crate) struct Mesh {
    pub links: Vec<Option<Connection>>,
    pub local_address: Address,
}

/// Run the rendezvous for one member and return its connections.
///
/// Fails for every member with the same error kind when any member
/// disagrees on the token (`TokenMismatch`), on name or world size
/// (`GroupMismatch`), when a TLS handshake fails on any edge
/// (`EncryptionFailed`), or when the group is incomplete at the deadline
/// (`Timeout`).
#[tracing::instrument(
    name = "rendezvous",
    skip_all,
    fields(rank = config.rank, world_size = config.world_size, name = %config.name)
)]
pub(crate) async fn establish(mut config: CommunicatorConfig) -> Result<Mesh> {
    config.validate()?;
    let deadline = Instant::now() + config.timeout;

    let listener = match config.listener.take() {
        Some(listener) => listener,
        None => Listener::bind(&config.bind_address()).await?,
    };
    let local_address = listener.local_address()?;
    let root = config.root_address().clone();
    let tls = config
        .transport
        .tls_config()
        .map(TlsContext::new)
        .transpose()?;

    let rendezvous = Rendezvous {
        rank: config.rank,
        world_size: config.world_size,
        name: config.name,
        token: config.token,
        deadline,
        transport: config.transport,
        tls,
    };
    tracing::debug!(%local_address, "rendezvous started");

    let outcome = if rendezvous.rank == 0 {
        rendezvous.run_root(&listener, &local_address).await
    } else {
        rendezvous
            .run_member(&listener, &local_address, &root)
            .await
    };

    match outcome {
        Ok(links) => {
            tracing::debug!("rendezvous complete");
            Ok(Mesh {
                links,
                local_address,
            })
        }
        Err(reason) => {
            tracing::warn!(?reason, "rendezvous failed");
            Err(reason.into_error(config.timeout))
        }
    }
}

// ── State machine ────────────────────────────────────────────────────

struct Rendezvous {
    rank: Rank,
    world_size: usize,
    name: String,
    token: Token,
    deadline: Instant,
    transport: TransportConfig,
    tls: Option<TlsContext>,
}

type Links = Vec<Option<Connection>>;

impl Rendezvous {
    async fn run_root(&self, listener: &Listener, local: &Address) -> Result<Links, AbortReason> {
        let n = self.world_size;
        let mut links: Links = (0..n).map(|_| None).collect();
        let mut addresses: Vec<Option<Address>> = vec![None; n];
        addresses[0] = Some(local.clone());
        // connections whose hello was rejected still deserve the abort
        let mut rejected = Vec::new();
        let mut failure = None;

        let (greetings, timed_out) =
            accept_many(listener, n - 1, self.deadline, |stream| self.greet_member(stream)).await;
        for greeting in greetings {
            match greeting {
                Ok((conn, hello)) => match self.check_hello(&hello, &links) {
                    Ok(()) => {
                        tracing::debug!(peer = hello.rank, listen = %hello.listen, "member joined");
                        addresses[hello.rank] = Some(hello.listen);
                        links[hello.rank] = Some(conn);
                    }
                    Err(reason) => {
                        tracing::warn!(peer = hello.rank, ?reason, "rejected member");
                        failure.get_or_insert(reason);
                        rejected.push(conn);
                    }
                },
                Err(reason) => {
                    failure.get_or_insert(reason);
                }
            }
        }
        if timed_out {
            failure.get_or_insert(AbortReason::Timeout);
        }
        if let Some(reason) = failure {
            self.abort_all(links.iter_mut().flatten().chain(rejected.iter_mut()), &reason)
                .await;
            return Err(reason);
        }

        let welcome = Handshake::Welcome {
            addresses: addresses.into_iter().flatten().collect(),
        };
        let mut sent = Ok(());
        for conn in links.iter_mut().flatten() {
            sent = self.write(conn, &welcome).await;
            if sent.is_err() {
                break;
            }
        }
        if let Err(reason) = sent {
            self.abort_all(links.iter_mut().flatten(), &reason).await;
            return Err(reason);
        }

        let reports = timeout_at(
            self.deadline,
            join_all(links.iter_mut().flatten().map(|conn| self.await_ready(conn))),
        )
        .await;
        let failure = match reports {
            Err(_) => Some(AbortReason::Timeout),
            Ok(reports) => reports.into_iter().find_map(Result::err),
        };
        if let Some(reason) = failure {
            self.abort_all(links.iter_mut().flatten(), &reason).await;
            return Err(reason);
        }

        for conn in links.iter_mut().flatten() {
            // a member lost now shows up later as a lost connection
            if let Err(reason) = self.write(conn, &Handshake::Go).await {
                tracing::warn!(?reason, "failed to release member");
            }
        }
        Ok(links)
    }

    async fn run_member(
        &self,
        listener: &Listener,
        local: &Address,
        root: &Address,
    ) -> Result<Links, AbortReason> {
        let n = self.world_size;
        let mut root_link = self.dial_peer(root).await?;
        let hello = Handshake::Hello(Hello {
            rank: self.rank,
            world_size: n,
            name: self.name.clone(),
            token: self.token.clone(),
            listen: local.clone(),
        });
        self.write(&mut root_link, &hello).await?;

        let addresses = match self.read(&mut root_link, true).await? {
            Handshake::Welcome { addresses } if addresses.len() == n => addresses,
            Handshake::Abort { reason } => return Err(reason),
            other => return Err(unexpected(&other)),
        };

        let dials = join_all((1..self.rank).map(|peer| self.dial_member(peer, &addresses[peer])));
        let accepts = accept_many(listener, n - 1 - self.rank, self.deadline, |stream| {
            self.greet_dialer(stream)
        });
        let (dialed, (accepted, timed_out)) = tokio::join!(dials, accepts);

        let mut links: Links = (0..n).map(|_| None).collect();
        let mut outcome = Ok(());
        for edge in dialed.into_iter().chain(accepted) {
            match edge {
                Ok((peer, _)) if links[peer].is_some() => {
                    if outcome.is_ok() {
                        outcome = Err(AbortReason::GroupMismatch(format!(
                            "rank {peer} connected twice"
                        )));
                    }
                }
                Ok((peer, conn)) => links[peer] = Some(conn),
                Err(reason) => {
                    if outcome.is_ok() {
                        outcome = Err(reason);
                    }
                }
            }
        }
        if timed_out && outcome.is_ok() {
            outcome = Err(AbortReason::Timeout);
        }

        self.write(
            &mut root_link,
            &Handshake::Ready {
                outcome: outcome.clone(),
            },
        )
        .await?;
        match self.read(&mut root_link, false).await? {
            Handshake::Go => {
                outcome?;
                links[0] = Some(root_link);
                Ok(links)
            }
            Handshake::Abort { reason } => Err(reason),
            other => Err(unexpected(&other)),
        }
    }

    // ── Edges ────────────────────────────────────────────────────────

    async fn greet_member(&self, stream: BoxedStream) -> Result<(Connection, Hello), AbortReason> {
        let mut conn = self.open(stream, false).await?;
        match self.read(&mut conn, false).await? {
            Handshake::Hello(hello) => Ok((conn, hello)),
            other => Err(unexpected(&other)),
        }
    }

    async fn greet_dialer(&self, stream: BoxedStream) -> Result<(Rank, Connection), AbortReason> {
        let mut conn = self.open(stream, false).await?;
        let (rank, verdict) = match self.read(&mut conn, false).await? {
            Handshake::Dial { rank, name, token } => {
                let verdict = if rank <= self.rank || rank >= self.world_size {
                    Err(AbortReason::GroupMismatch(format!(
                        "rank {rank} may not dial rank {}",
                        self.rank
                    )))
                } else {
                    self.check_membership(self.world_size, &name, &token)
                };
                (rank, verdict)
            }
            other => return Err(unexpected(&other)),
        };
        match verdict {
            Ok(()) => {
                self.write(&mut conn, &Handshake::Accepted).await?;
                Ok((rank, conn))
            }
            Err(reason) => {
                self.abort_all(std::iter::once(&mut conn), &reason).await;
                Err(reason)
            }
        }
    }

    async fn dial_member(
        &self,
        peer: Rank,
        address: &Address,
    ) -> Result<(Rank, Connection), AbortReason> {
        let mut conn = self.dial_peer(address).await?;
        let dial = Handshake::Dial {
            rank: self.rank,
            name: self.name.clone(),
            token: self.token.clone(),
        };
        self.write(&mut conn, &dial).await?;
        match self.read(&mut conn, true).await? {
            Handshake::Accepted => Ok((peer, conn)),
            Handshake::Abort { reason } => Err(reason),
            other => Err(unexpected(&other)),
        }
    }

    async fn await_ready(&self, conn: &mut Connection) -> Result<(), AbortReason> {
        match self.read(conn, false).await? {
            Handshake::Ready { outcome } => outcome,
            other => Err(unexpected(&other)),
        }
    }

    async fn dial_peer(&self, address: &Address) -> Result<Connection, AbortReason> {
        let stream = dial(address, self.deadline, &self.transport)
            .await
            .map_err(|e| match e {
                TransportError::Connect { ref source, .. }
                    if source.kind() == std::io::ErrorKind::TimedOut =>
                {
                    AbortReason::Timeout
                }
                other => AbortReason::PeerLost(other.to_string()),
            })?;
        self.open(stream, true).await
    }

    /// Wrap a raw stream in TLS when configured and frame it.
    async fn open(&self, stream: BoxedStream, dialer: bool) -> Result<Connection, AbortReason> {
        let stream = match &self.tls {
            None => stream,
            Some(tls) => {
                let handshake = async {
                    if dialer {
                        tls.connect(stream).await
                    } else {
                        tls.accept(stream).await
                    }
                };
                match timeout_at(self.deadline, handshake).await {
                    Err(_) => return Err(AbortReason::Timeout),
                    Ok(Err(e)) => {
                        tracing::warn!(dialer, "tls handshake failed: {e}");
                        return Err(AbortReason::EncryptionFailed(e.to_string()));
                    }
                    Ok(Ok(stream)) => stream,
                }
            }
        };
        Ok(Connection::new(stream, self.transport.frame_limit()))
    }

    async fn read(&self, conn: &mut Connection, first_reply: bool) -> Result<Handshake, AbortReason> {
        let frame = match timeout_at(self.deadline, conn.recv()).await {
            Err(_) => return Err(AbortReason::Timeout),
            Ok(Err(e)) => return Err(self.edge_error(e, first_reply)),
            Ok(Ok(frame)) => frame,
        };
        if frame.tag != Tag::Handshake.to_wire() {
            return Err(AbortReason::GroupMismatch(format!(
                "unexpected tag {:#x} during rendezvous",
                frame.tag
            )));
        }
        rmp_serde::from_slice(&frame.payload)
            .map_err(|e| AbortReason::GroupMismatch(format!("malformed handshake: {e}")))
    }

    async fn write(&self, conn: &mut Connection, message: &Handshake) -> Result<(), AbortReason> {
        let frame = self.frame(message)?;
        match timeout_at(self.deadline, conn.send(frame)).await {
            Err(_) => Err(AbortReason::Timeout),
            Ok(result) => result.map_err(|e| self.edge_error(e, false)),
        }
    }

    fn frame(&self, message: &Handshake) -> Result<Frame, AbortReason> {
        let payload = rmp_serde::to_vec(message)
            .map_err(|e| AbortReason::PeerLost(format!("cannot encode handshake: {e}")))?;
        Ok(Frame::new(
            Tag::Handshake.to_wire(),
            self.rank as u32,
            0,
            payload,
        ))
    }

    /// Best effort: the deadline may already have passed.
    async fn abort_all<'a>(
        &self,
        conns: impl Iterator<Item = &'a mut Connection>,
        reason: &AbortReason,
    ) {
        let Ok(frame) = self.frame(&Handshake::Abort {
            reason: reason.clone(),
        }) else {
            return;
        };
        join_all(conns.map(|conn| {
            let frame = frame.clone();
            async move {
                let _ = tokio::time::timeout(ABORT_GRACE, conn.send(frame)).await;
            }
        }))
        .await;
    }

    fn edge_error(&self, e: TransportError, first_reply: bool) -> AbortReason {
        match e {
            TransportError::Tls(reason) => AbortReason::EncryptionFailed(reason),
            // a peer that rejects our certificate after our side of the
            // handshake finished hangs up instead of replying
            e if first_reply && self.tls.is_some() => AbortReason::EncryptionFailed(format!(
                "peer closed the connection before replying: {e}"
            )),
            e => AbortReason::PeerLost(e.to_string()),
        }
    }

    // ── Validation ───────────────────────────────────────────────────

    fn check_hello(&self, hello: &Hello, links: &[Option<Connection>]) -> Result<(), AbortReason> {
        if hello.rank == 0 || hello.rank >= self.world_size {
            return Err(AbortReason::GroupMismatch(format!(
                "rank {} out of range for world size {}",
                hello.rank, self.world_size
            )));
        }
        if links[hello.rank].is_some() {
            return Err(AbortReason::GroupMismatch(format!(
                "rank {} joined twice",
                hello.rank
            )));
        }
        self.check_membership(hello.world_size, &hello.name, &hello.token)
    }

    fn check_membership(
        &self,
        world_size: usize,
        name: &str,
        token: &Token,
    ) -> Result<(), AbortReason> {
        if world_size != self.world_size {
            return Err(AbortReason::GroupMismatch(format!(
                "world size {world_size} != {}",
                self.world_size
            )));
        }
        if name != self.name {
            return Err(AbortReason::GroupMismatch(format!(
                "name {name:?} != {:?}",
                self.name
            )));
        }
        if *token != self.token {
            return Err(AbortReason::TokenMismatch);
        }
        Ok(())
    }
}

/// Accept and greet up to `expected` connections concurrently.
///
/// Failed greetings count towards `expected`. Returns whatever finished
/// plus whether the deadline cut the loop short.
async fn accept_many<T, F, Fut>(
    listener: &Listener,
    expected: usize,
    deadline: Instant,
    greet: F,
) -> (Vec<Result<T, AbortReason>>, bool)
where
    F: Fn(BoxedStream) -> Fut,
    Fut: Future<Output = Result<T, AbortReason>>,
{
    let mut finished = Vec::with_capacity(expected);
    let mut pending = FuturesUnordered::new();
    let expired = sleep_until(deadline);
    tokio::pin!(expired);

    while finished.len() < expected {
        tokio::select! {
            accepted = listener.accept(), if finished.len() + pending.len() < expected => {
                match accepted {
                    Ok(stream) => pending.push(greet(stream)),
                    Err(e) => tracing::debug!("accept failed: {e}"),
                }
            }
            Some(result) = pending.next() => finished.push(result),
            _ = &mut expired => return (finished, true),
        }
    }
    (finished, false)
}
