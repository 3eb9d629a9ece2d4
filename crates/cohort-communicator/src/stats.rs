use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::types::Rank;

/// Traffic exchanged with one peer.
///
/// Counts every message that goes through the mailbox plus revocations;
/// acknowledgements are not counted. Bytes are payload bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PeerStats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
}

/// Snapshot of a communicator's per-peer counters, indexed by rank.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommunicatorStats {
    pub peers: Vec<PeerStats>,
}

impl CommunicatorStats {
    pub fn peer(&self, rank: Rank) -> PeerStats {
        self.peers.get(rank).copied().unwrap_or_default()
    }

    pub fn total(&self) -> PeerStats {
        self.peers.iter().fold(PeerStats::default(), |acc, p| PeerStats {
            messages_sent: acc.messages_sent + p.messages_sent,
            bytes_sent: acc.bytes_sent + p.bytes_sent,
            messages_received: acc.messages_received + p.messages_received,
            bytes_received: acc.bytes_received + p.bytes_received,
        })
    }
}

#[derive(Default)]
struct Counters {
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
}

/// Lock-free counters updated by senders and reader tasks.
pub(crate) struct Stats {
    peers: Vec<Counters>,
}

impl Stats {
    pub fn new(world_size: usize) -> Self {
        Self {
            peers: (0..world_size).map(|_| Counters::default()).collect(),
        }
    }

    pub fn record_sent(&self, peer: Rank, bytes: usize) {
        let c = &self.peers[peer];
        c.messages_sent.fetch_add(1, Ordering::Relaxed);
        c.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, peer: Rank, bytes: usize) {
        let c = &self.peers[peer];
        c.messages_received.fetch_add(1, Ordering::Relaxed);
        c.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CommunicatorStats {
        CommunicatorStats {
            peers: self
                .peers
                .iter()
                .map(|c| PeerStats {
                    messages_sent: c.messages_sent.load(Ordering::Relaxed),
                    bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
                    messages_received: c.messages_received.load(Ordering::Relaxed),
                    bytes_received: c.bytes_received.load(Ordering::Relaxed),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_totals() {
        let stats = Stats::new(3);
        stats.record_sent(1, 10);
        stats.record_sent(1, 5);
        stats.record_received(2, 7);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.peer(1).messages_sent, 2);
        assert_eq!(snapshot.peer(1).bytes_sent, 15);
        assert_eq!(snapshot.peer(2).messages_received, 1);
        assert_eq!(snapshot.peer(9), PeerStats::default());

        let total = snapshot.total();
        assert_eq!(total.messages_sent, 2);
        assert_eq!(total.bytes_received, 7);
    }
}
