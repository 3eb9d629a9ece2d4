//! Per-communicator connection table.
//!
//! Every remote peer has one outbound queue drained by a dedicated writer
//! task. Sequence numbers are assigned and frames enqueued under the same
//! per-link lock, so frames leave in sequence order.

use bytes::Bytes;
use cohort_transport::{Connection, Frame, FrameReader, FrameWriter, TransportError};
use futures_util::SinkExt;
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{CommunicatorError, Result};
use crate::lock;
use crate::types::{Rank, Tag};

/// Work for a writer task.
pub(crate) enum Outbound {
    Frame(Frame),
    /// Resolved once everything queued before it has been written.
    Flush(oneshot::Sender<()>),
}

enum Link {
    Loopback,
    Remote {
        next_sequence: Mutex<u64>,
        outbound: mpsc::UnboundedSender<Outbound>,
    },
}

/// Where an enqueued message went.
pub(crate) enum Route {
    /// Addressed to the local rank; the caller delivers it.
    Loopback,
    /// Queued for the writer with this sequence number.
    Queued(u64),
}

pub(crate) struct ConnectionTable {
    rank: Rank,
    links: Vec<Link>,
    /// Cancelled when the connection to a peer fails or closes.
    lost: Vec<CancellationToken>,
    max_frame_size: usize,
}

impl ConnectionTable {
    /// Split every connection, spawn its writer on `tasks`, and hand back
    /// the read halves for the dispatch loop.
    pub fn build(
        rank: Rank,
        connections: Vec<Option<Connection>>,
        max_frame_size: usize,
        shutdown: &CancellationToken,
        tasks: &mut JoinSet<()>,
    ) -> (Self, Vec<(Rank, FrameReader)>) {
        let mut links = Vec::with_capacity(connections.len());
        let mut lost = Vec::with_capacity(connections.len());
        let mut readers = Vec::new();

        for (peer, connection) in connections.into_iter().enumerate() {
            let token = CancellationToken::new();
            match connection {
                Some(connection) if peer != rank => {
                    let (reader, writer) = connection.split();
                    let (tx, rx) = mpsc::unbounded_channel();
                    tasks.spawn(write_loop(peer, writer, rx, token.clone(), shutdown.clone()));
                    readers.push((peer, reader));
                    links.push(Link::Remote {
                        next_sequence: Mutex::new(0),
                        outbound: tx,
                    });
                }
                _ => {
                    if peer != rank {
                        // rendezvous never produced this edge
                        token.cancel();
                    }
                    links.push(Link::Loopback);
                }
            }
            lost.push(token);
        }

        let table = Self {
            rank,
            links,
            lost,
            max_frame_size,
        };
        (table, readers)
    }

    pub fn world_size(&self) -> usize {
        self.links.len()
    }

    pub fn lost(&self, peer: Rank) -> &CancellationToken {
        &self.lost[peer]
    }

    pub fn is_lost(&self, peer: Rank) -> bool {
        peer != self.rank && self.lost[peer].is_cancelled()
    }

    /// Queue one message for `dst`.
    ///
    /// `on_sequence` runs with the assigned sequence number before the
    /// frame is queued, so anything keyed by it is registered before a
    /// reply can arrive.
    pub fn enqueue(
        &self,
        dst: Rank,
        tag: Tag,
        payload: Bytes,
        flags: u8,
        on_sequence: impl FnOnce(u64),
    ) -> Result<Route> {
        if payload.len() > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: payload.len(),
                max: self.max_frame_size,
            }
            .into());
        }
        match &self.links[dst] {
            Link::Loopback => Ok(Route::Loopback),
            Link::Remote {
                next_sequence,
                outbound,
            } => {
                if self.lost[dst].is_cancelled() {
                    return Err(unreachable(dst));
                }
                let mut next = lock(next_sequence);
                let sequence = *next;
                on_sequence(sequence);
                let frame = Frame::new(tag.to_wire(), self.rank as u32, sequence, payload)
                    .with_flags(flags);
                outbound
                    .send(Outbound::Frame(frame))
                    .map_err(|_| unreachable(dst))?;
                *next += 1;
                Ok(Route::Queued(sequence))
            }
        }
    }

    /// Resolves once everything queued for `dst` so far has been written.
    /// `None` for the local rank and for peers whose writer has exited.
    pub fn flush(&self, dst: Rank) -> Option<oneshot::Receiver<()>> {
        match &self.links[dst] {
            Link::Loopback => None,
            Link::Remote { outbound, .. } => {
                let (tx, rx) = oneshot::channel();
                outbound.send(Outbound::Flush(tx)).ok().map(|_| rx)
            }
        }
    }

    /// Wait until every writer has written what was queued before the call.
    pub async fn flush_all(&self) {
        let pending: Vec<_> = (0..self.links.len())
            .filter_map(|peer| self.flush(peer))
            .collect();
        for done in pending {
            // a dropped sender means the writer is gone
            let _ = done.await;
        }
    }
}

pub(crate) fn unreachable(peer: Rank) -> CommunicatorError {
    CommunicatorError::NotRunning(format!("rank {peer} is unreachable"))
}

/// Drain the outbound queue into the socket, flushing whenever the queue
/// runs empty.
async fn write_loop(
    peer: Rank,
    mut writer: FrameWriter,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    lost: CancellationToken,
    shutdown: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            biased;
            next = outbound.recv() => match next {
                Some(item) => item,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };

        let mut flushed = Vec::new();
        let mut item = Some(first);
        while let Some(next) = item {
            match next {
                Outbound::Frame(frame) => {
                    if let Err(e) = writer.feed(frame).await {
                        tracing::debug!(peer, "write failed: {e}");
                        lost.cancel();
                        return;
                    }
                }
                Outbound::Flush(done) => flushed.push(done),
            }
            item = outbound.try_recv().ok();
        }
        if let Err(e) = writer.flush().await {
            tracing::debug!(peer, "flush failed: {e}");
            lost.cancel();
            return;
        }
        for done in flushed {
            let _ = done.send(());
        }
    }

    // closing our half tells the peer we are gone
    if let Err(e) = writer.close().await {
        tracing::trace!(peer, "close failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn pair() -> (Connection, Connection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Connection::new(Box::new(a), 1024),
            Connection::new(Box::new(b), 1024),
        )
    }

    #[tokio::test]
    async fn test_sequences_are_consecutive_per_link() {
        let (local, remote) = pair();
        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let (table, _readers) =
            ConnectionTable::build(0, vec![None, Some(local)], 1024, &shutdown, &mut tasks);

        for i in 0..5u8 {
            let route = table
                .enqueue(1, Tag::User(1), Bytes::from(vec![i]), 0, |_| {})
                .unwrap();
            assert!(matches!(route, Route::Queued(seq) if seq == i as u64));
        }
        table.flush_all().await;

        let (mut reader, _writer) = remote.split();
        for i in 0..5u64 {
            let frame = reader.next().await.unwrap().unwrap();
            assert_eq!(frame.sequence, i);
            assert_eq!(frame.sender, 0);
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_self_is_loopback_and_missing_edges_are_lost() {
        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let (table, readers) =
            ConnectionTable::build(1, vec![None, None], 1024, &shutdown, &mut tasks);
        assert!(readers.is_empty());
        assert!(matches!(
            table.enqueue(1, Tag::User(0), Bytes::new(), 0, |_| {}),
            Ok(Route::Loopback)
        ));
        assert!(table.is_lost(0));
        assert!(!table.is_lost(1));
    }

    #[tokio::test]
    async fn test_oversized_payload_is_rejected_before_queueing() {
        let (local, _remote) = pair();
        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let (table, _readers) =
            ConnectionTable::build(0, vec![None, Some(local)], 16, &shutdown, &mut tasks);
        let err = table
            .enqueue(1, Tag::User(0), Bytes::from(vec![0u8; 17]), 0, |_| {})
            .err()
            .unwrap();
        assert!(matches!(
            err,
            CommunicatorError::Transport(TransportError::FrameTooLarge { size: 17, max: 16 })
        ));
        shutdown.cancel();
    }
}
