//! Revocation and derived communicators.
//!
//! A communicator is `active` until it is revoked or stopped. Derived
//! communicators (shrink, split, sub-communicator) never share
//! connections with their parent: the parent only carries the new root's
//! address, then every member runs a fresh rendezvous.

use std::sync::atomic::Ordering;

use cohort_transport::{Address, Listener};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};

use crate::communicator::{encode, Communicator};
use crate::config::{Addressing, CommunicatorConfig};
use crate::error::{CommunicatorError, Result};
use crate::lock;
use crate::timeout::Deadline;
use crate::types::{Rank, Tag, Token};

/// Sent by the leader of a derived group to the other members.
#[derive(Debug, Serialize, Deserialize)]
struct DeriveNotice {
    name: String,
    group: Vec<Rank>,
    attempt: u64,
    root: Address,
}

#[derive(Debug, Serialize, Deserialize)]
enum Liveness {
    Alive { round: u64 },
    View { round: u64, members: Vec<Rank> },
}

impl Liveness {
    fn is_alive(&self) -> bool {
        matches!(self, Liveness::Alive { .. })
    }

    fn round(&self) -> u64 {
        match self {
            Liveness::Alive { round } | Liveness::View { round, .. } => *round,
        }
    }
}

impl Communicator {
    /// Mark this communicator revoked and tell every peer.
    ///
    /// Peers receiving the revocation for the first time forward it once,
    /// so it reaches every reachable member even if this one exits right
    /// away. Pending and later operations fail with `Revoked`, except
    /// `shrink`, `revoke` and `stop`.
    #[tracing::instrument(skip_all, fields(rank = self.rank(), name = %self.name))]
    pub async fn revoke(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(CommunicatorError::NotRunning("communicator stopped".into()));
        }
        if !self.shared.mark_revoked() {
            tracing::debug!("already revoked");
            return Ok(());
        }
        tracing::info!("revoking communicator");
        self.shared.broadcast_revoke(None);

        let flushed = tokio::time::timeout(self.timeout(), self.shared.table.flush_all()).await;
        if flushed.is_err() {
            tracing::warn!("revocation not flushed to every peer");
        }
        Ok(())
    }

    /// Build a communicator from the surviving members in `group`.
    ///
    /// Allowed on a revoked communicator. Only the members of `group` call
    /// this; everyone else is left out and never contacted, so a crashed or
    /// silent member does not hold the others up. New ranks follow the old
    /// rank order, whatever order `group` lists them in.
    #[tracing::instrument(skip_all, fields(rank = self.rank(), name = %self.name))]
    pub async fn shrink(&self, group: &[Rank], name: impl Into<String>) -> Result<Communicator> {
        let mut survivors = group.to_vec();
        survivors.sort_unstable();
        tracing::info!(?survivors, "shrinking communicator");
        self.derive(&survivors, name.into(), self.token.clone()).await
    }

    /// Find the members that still respond, agreed with the other
    /// responders.
    ///
    /// Every caller announces itself to every peer and waits until each
    /// peer answered, was lost, or the timeout elapsed. The callers then
    /// swap what they saw and keep only members that every responder saw.
    /// A caller that the others left out gets `Timeout`. The result is
    /// meant to be passed to [`shrink`](Self::shrink). Messages left over
    /// from an earlier call are ignored.
    #[tracing::instrument(skip_all, fields(rank = self.rank(), name = %self.name))]
    pub async fn responsive_members(&self) -> Result<Vec<Rank>> {
        let round = self.liveness_round.fetch_add(1, Ordering::AcqRel) + 1;
        let deadline = self.deadline();
        self.announce(&Liveness::Alive { round }, self.others());

        let answers = join_all(self.others().map(|peer| async move {
            let alive = self.next_liveness(peer, round, deadline, Liveness::is_alive);
            (peer, alive.await)
        }))
        .await;
        let mut seen = vec![self.rank()];
        for (peer, alive) in answers {
            match alive {
                Ok(_) => seen.push(peer),
                Err(e) => tracing::debug!(peer, "no answer: {e}"),
            }
        }
        seen.sort_unstable();

        // late callers must learn they were left out, so views go to
        // every reachable peer
        let view = Liveness::View {
            round,
            members: seen.clone(),
        };
        self.announce(&view, self.others().filter(|&peer| !self.is_lost(peer)));

        let deadline = self.deadline();
        let peers = seen.iter().copied().filter(|&peer| peer != self.rank());
        let views = join_all(peers.map(|peer| async move {
            let view = self.next_liveness(peer, round, deadline, |m| !m.is_alive());
            (peer, view.await)
        }))
        .await;

        let mut agreed = seen;
        for (peer, view) in views {
            match view {
                Ok(Liveness::View { members, .. }) => {
                    agreed.retain(|rank| members.contains(rank));
                }
                Ok(Liveness::Alive { .. }) => {}
                Err(e) => {
                    tracing::debug!(peer, "no view: {e}");
                    agreed.retain(|&rank| rank != peer);
                }
            }
        }
        if !agreed.contains(&self.rank()) {
            return Err(deadline.expired("liveness check: left out by the other members"));
        }
        tracing::info!(?agreed, "responsive members");
        Ok(agreed)
    }

    fn announce(&self, message: &Liveness, peers: impl Iterator<Item = Rank>) {
        let payload = match encode(message) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("liveness message not encoded: {e}");
                return;
            }
        };
        for peer in peers {
            if let Err(e) = self.shared.post(peer, Tag::ShrinkBeacon, payload.clone(), None) {
                tracing::debug!(peer, "liveness message not sent: {e}");
            }
        }
    }

    /// Next liveness message of the wanted kind from `peer`, skipping
    /// anything from earlier rounds.
    async fn next_liveness(
        &self,
        peer: Rank,
        round: u64,
        deadline: Deadline,
        wanted: impl Fn(&Liveness) -> bool,
    ) -> Result<Liveness> {
        loop {
            let message: Liveness = self.recv_tagged(peer, Tag::ShrinkBeacon, deadline).await?;
            if message.round() >= round && wanted(&message) {
                return Ok(message);
            }
            tracing::trace!(peer, stale = message.round(), round, "skipping liveness message");
        }
    }

    /// Partition members by label.
    ///
    /// Members passing the same label form one communicator named after
    /// it, ordered by their rank here. Members passing `None` get `None`.
    #[tracing::instrument(skip_all, fields(rank = self.rank(), name = %self.name))]
    pub async fn split(&self, label: Option<&str>) -> Result<Option<Communicator>> {
        let labels: Vec<Option<String>> = self
            .exchange_all(Tag::Split, label.map(str::to_owned))
            .await?;
        let Some(label) = label else {
            return Ok(None);
        };
        let group: Vec<Rank> = labels
            .iter()
            .enumerate()
            .filter(|(_, l)| l.as_deref() == Some(label))
            .map(|(rank, _)| rank)
            .collect();
        let communicator = self
            .derive(&group, label.to_string(), self.token.clone())
            .await?;
        Ok(Some(communicator))
    }

    /// Create a communicator over `group`, ranked in `group` order.
    ///
    /// Only the members of `group` call this, all with the same group and
    /// name. A member passing a different token fails the whole new group
    /// with `TokenMismatch`.
    #[tracing::instrument(skip_all, fields(rank = self.rank(), name = %self.name))]
    pub async fn sub_communicator(
        &self,
        group: &[Rank],
        name: impl Into<String>,
        token: impl Into<Token>,
    ) -> Result<Communicator> {
        if self.is_revoked() {
            return Err(CommunicatorError::Revoked);
        }
        self.derive(group, name.into(), token.into()).await
    }

    /// Shared core of every derived communicator.
    ///
    /// `group[0]` binds a listener next to its own address and sends that
    /// address to the rest of `group`; everyone then runs a rendezvous at
    /// their position in `group`.
    pub(crate) async fn derive(
        &self,
        group: &[Rank],
        name: String,
        token: Token,
    ) -> Result<Communicator> {
        if self.is_stopped() {
            return Err(CommunicatorError::NotRunning("communicator stopped".into()));
        }
        let position = self.check_group(group)?;
        let leader = group[0];
        let deadline = self.deadline();

        let attempt = self.next_attempt(&name, group);
        let listener = Listener::bind(&self.local_address.ephemeral_sibling()).await?;
        let root = if self.rank() == leader {
            let notice = DeriveNotice {
                name: name.clone(),
                group: group.to_vec(),
                attempt,
                root: listener.local_address()?,
            };
            let payload = encode(&notice)?;
            for &member in &group[1..] {
                self.shared.post(member, Tag::Derive, payload.clone(), None)?;
            }
            notice.root
        } else {
            self.await_notice(leader, &name, group, attempt, deadline)
                .await?
        };
        tracing::debug!(%root, position, size = group.len(), "deriving communicator");

        let config = CommunicatorConfig::new(
            group.len(),
            position,
            Addressing::Dynamic { root, listen: None },
        )
        .name(name)
        .token(token)
        .timeout(self.timeout())
        .transport(self.transport.clone())
        .listener(listener);
        Communicator::connect(config).await
    }

    /// Attempt number for deriving `group` under `name`, starting at 1.
    ///
    /// Members retrying a failed derivation count the same attempts, which
    /// lets them tell a fresh notice from one left by an earlier try.
    fn next_attempt(&self, name: &str, group: &[Rank]) -> u64 {
        let mut attempts = lock(&self.derive_attempts);
        let attempt = attempts
            .entry((name.to_string(), group.to_vec()))
            .or_insert(0);
        *attempt += 1;
        *attempt
    }

    /// Wait for the leader's notice for this derivation.
    ///
    /// Notices for other groups or earlier attempts are dropped. A notice
    /// from a later attempt means the leader retried more often than this
    /// member; it is taken and the local count catches up.
    async fn await_notice(
        &self,
        leader: Rank,
        name: &str,
        group: &[Rank],
        attempt: u64,
        deadline: Deadline,
    ) -> Result<Address> {
        loop {
            let notice: DeriveNotice = self.recv_tagged(leader, Tag::Derive, deadline).await?;
            if notice.name != name || notice.group != group || notice.attempt < attempt {
                tracing::debug!(
                    leader,
                    name = %notice.name,
                    attempt = notice.attempt,
                    "dropping stale derive notice"
                );
                continue;
            }
            if notice.attempt > attempt {
                lock(&self.derive_attempts)
                    .insert((name.to_string(), group.to_vec()), notice.attempt);
            }
            return Ok(notice.root);
        }
    }

    /// Position of this member in `group`, which must be non-empty,
    /// distinct and in range.
    fn check_group(&self, group: &[Rank]) -> Result<Rank> {
        let mut seen = vec![false; self.world_size()];
        for &rank in group {
            if rank >= self.world_size() || std::mem::replace(&mut seen[rank], true) {
                return Err(CommunicatorError::InvalidArgument(format!(
                    "group {group:?} must list distinct ranks below {}",
                    self.world_size()
                )));
            }
        }
        group
            .iter()
            .position(|&rank| rank == self.rank())
            .ok_or_else(|| {
                CommunicatorError::InvalidArgument(format!(
                    "rank {} is not a member of group {group:?}",
                    self.rank()
                ))
            })
    }
}
