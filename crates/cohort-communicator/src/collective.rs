//! Collective operations built from point-to-point messages.
//!
//! Every member must call the same collectives in the same order. Each
//! collective has its own internal tag, so collectives never consume user
//! messages and per-sender FIFO keeps consecutive calls aligned.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::communicator::{encode, Communicator};
use crate::error::{CommunicatorError, Result};
use crate::types::{Rank, Tag};

impl Communicator {
    /// Ranks other than this one, in rank order.
    pub(crate) fn others(&self) -> impl Iterator<Item = Rank> {
        let rank = self.rank();
        (0..self.world_size()).filter(move |&r| r != rank)
    }

    /// Block until every member has entered the barrier.
    pub async fn barrier(&self) -> Result<()> {
        let deadline = self.deadline();
        for peer in self.others() {
            self.send_tagged(peer, Tag::Barrier, &())?;
        }
        for peer in self.others() {
            self.recv_tagged::<()>(peer, Tag::Barrier, deadline).await?;
        }
        Ok(())
    }

    /// Every member returns `src`'s value. Only `src` supplies one.
    pub async fn broadcast<T>(&self, src: Rank, value: Option<T>) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        self.shared.check_rank(src)?;
        if self.rank() != src {
            return self.recv_tagged(src, Tag::Broadcast, self.deadline()).await;
        }
        let value = value.ok_or_else(|| {
            CommunicatorError::InvalidArgument("broadcast source must supply a value".into())
        })?;
        let payload = encode(&value)?;
        for peer in self.others() {
            self.shared.post(peer, Tag::Broadcast, payload.clone(), None)?;
        }
        Ok(value)
    }

    /// Rank `i` receives `values[i]` from `src`. Only `src` supplies
    /// `values`, exactly one per member.
    pub async fn scatter<T>(&self, src: Rank, values: Option<Vec<T>>) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        self.shared.check_rank(src)?;
        if self.rank() != src {
            return self.recv_tagged(src, Tag::Scatter, self.deadline()).await;
        }
        let values = values.ok_or_else(|| {
            CommunicatorError::InvalidArgument("scatter source must supply values".into())
        })?;
        if values.len() != self.world_size() {
            return Err(CommunicatorError::InvalidArgument(format!(
                "scatter needs {} values, got {}",
                self.world_size(),
                values.len()
            )));
        }

        let mut own = None;
        for (rank, value) in values.into_iter().enumerate() {
            if rank == self.rank() {
                own = Some(value);
            } else {
                self.send_tagged(rank, Tag::Scatter, &value)?;
            }
        }
        own.ok_or_else(|| CommunicatorError::InvalidArgument("no value for the source".into()))
    }

    /// `src` sends `values[i]` to `destinations[i]`; listed members get
    /// `Some`, everyone else `None`.
    pub async fn scatterv<T>(
        &self,
        src: Rank,
        values: Option<Vec<T>>,
        destinations: &[Rank],
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        self.shared.check_rank(src)?;
        self.check_members(destinations, "scatterv destinations")?;
        if self.rank() != src {
            if !destinations.contains(&self.rank()) {
                return Ok(None);
            }
            let value = self.recv_tagged(src, Tag::ScatterV, self.deadline()).await?;
            return Ok(Some(value));
        }

        let values = values.ok_or_else(|| {
            CommunicatorError::InvalidArgument("scatterv source must supply values".into())
        })?;
        if values.len() != destinations.len() {
            return Err(CommunicatorError::InvalidArgument(format!(
                "scatterv has {} destinations but {} values",
                destinations.len(),
                values.len()
            )));
        }

        let mut own = None;
        for (&rank, value) in destinations.iter().zip(values) {
            if rank == self.rank() {
                own = Some(value);
            } else {
                self.send_tagged(rank, Tag::ScatterV, &value)?;
            }
        }
        Ok(own)
    }

    /// `dst` receives every member's value in rank order; others get
    /// `None`.
    pub async fn gather<T>(&self, dst: Rank, value: T) -> Result<Option<Vec<T>>>
    where
        T: Serialize + DeserializeOwned,
    {
        self.shared.check_rank(dst)?;
        if self.rank() != dst {
            self.send_tagged(dst, Tag::Gather, &value)?;
            return Ok(None);
        }

        let deadline = self.deadline();
        let mut own = Some(value);
        let mut gathered = Vec::with_capacity(self.world_size());
        for rank in 0..self.world_size() {
            if rank == self.rank() {
                if let Some(value) = own.take() {
                    gathered.push(value);
                }
            } else {
                gathered.push(self.recv_tagged(rank, Tag::Gather, deadline).await?);
            }
        }
        Ok(Some(gathered))
    }

    /// Only `sources` contribute. `dst` receives their values in the
    /// order of `sources`; everyone else gets `None`.
    pub async fn gatherv<T>(
        &self,
        dst: Rank,
        value: Option<T>,
        sources: &[Rank],
    ) -> Result<Option<Vec<T>>>
    where
        T: Serialize + DeserializeOwned,
    {
        self.shared.check_rank(dst)?;
        self.check_members(sources, "gatherv sources")?;
        let contributes = sources.contains(&self.rank());
        let mut own = match (contributes, value) {
            (true, None) => {
                return Err(CommunicatorError::InvalidArgument(
                    "gatherv sources must supply a value".into(),
                ))
            }
            (true, value) => value,
            (false, _) => None,
        };

        if self.rank() != dst {
            if let Some(value) = own {
                self.send_tagged(dst, Tag::GatherV, &value)?;
            }
            return Ok(None);
        }

        let deadline = self.deadline();
        let mut gathered = Vec::with_capacity(sources.len());
        for &rank in sources {
            if rank == self.rank() {
                if let Some(value) = own.take() {
                    gathered.push(value);
                }
            } else {
                gathered.push(self.recv_tagged(rank, Tag::GatherV, deadline).await?);
            }
        }
        Ok(Some(gathered))
    }

    /// Every member receives every member's value in rank order.
    pub async fn allgather<T>(&self, value: T) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        self.exchange_all(Tag::Allgather, value).await
    }

    /// Allgather under an arbitrary internal tag.
    pub(crate) async fn exchange_all<T>(&self, tag: Tag, value: T) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let payload = encode(&value)?;
        for peer in self.others() {
            self.shared.post(peer, tag, payload.clone(), None)?;
        }

        let deadline = self.deadline();
        let mut own = Some(value);
        let mut gathered = Vec::with_capacity(self.world_size());
        for rank in 0..self.world_size() {
            if rank == self.rank() {
                if let Some(value) = own.take() {
                    gathered.push(value);
                }
            } else {
                gathered.push(self.recv_tagged(rank, tag, deadline).await?);
            }
        }
        Ok(gathered)
    }

    /// Ranks must be in range and distinct.
    fn check_members(&self, ranks: &[Rank], what: &str) -> Result<()> {
        let mut seen = vec![false; self.world_size()];
        for &rank in ranks {
            if rank >= self.world_size() {
                return Err(CommunicatorError::InvalidArgument(format!(
                    "{what}: rank {rank} out of range for world size {}",
                    self.world_size()
                )));
            }
            if std::mem::replace(&mut seen[rank], true) {
                return Err(CommunicatorError::InvalidArgument(format!(
                    "{what}: rank {rank} listed twice"
                )));
            }
        }
        Ok(())
    }
}
