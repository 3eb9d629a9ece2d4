//! Inbound side: one reader task per peer feeding per-(tag, sender) queues.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes};
use cohort_transport::FrameReader;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::communicator::Shared;
use crate::lock;
use crate::types::{Rank, Tag};

/// One FIFO per (tag, sender). The receiver half sits behind an async
/// mutex so concurrent receives on the same key are served in order.
pub(crate) struct Queue {
    tx: mpsc::UnboundedSender<Bytes>,
    pub rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

#[derive(Default)]
pub(crate) struct Mailbox {
    queues: Mutex<HashMap<(Tag, Rank), Arc<Queue>>>,
}

impl Mailbox {
    pub fn queue(&self, tag: Tag, sender: Rank) -> Arc<Queue> {
        lock(&self.queues)
            .entry((tag, sender))
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                Arc::new(Queue {
                    tx,
                    rx: tokio::sync::Mutex::new(rx),
                })
            })
            .clone()
    }

    pub fn deliver(&self, tag: Tag, sender: Rank, payload: Bytes) {
        // the queue owns both halves, so this cannot fail
        let _ = self.queue(tag, sender).tx.send(payload);
    }

    /// Hand back a queue taken with [`queue`](Self::queue). The map entry
    /// goes away once it is empty and nobody else holds it; the next
    /// message under that key starts a fresh queue.
    pub fn release(&self, tag: Tag, sender: Rank, queue: Arc<Queue>) {
        drop(queue);
        let mut queues = lock(&self.queues);
        let idle = queues.get(&(tag, sender)).is_some_and(|queue| {
            Arc::strong_count(queue) == 1
                && queue.rx.try_lock().is_ok_and(|rx| rx.is_empty())
        });
        if idle {
            queues.remove(&(tag, sender));
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        lock(&self.queues).len()
    }
}

/// Read frames from `peer` until the connection ends or the communicator
/// shuts down, then mark the peer lost.
///
/// A frame with the wrong sender or an out-of-order sequence number ends
/// the connection.
pub(crate) async fn read_loop(shared: Arc<Shared>, peer: Rank, mut reader: FrameReader) {
    let mut expected = 0u64;
    loop {
        let next = tokio::select! {
            next = reader.next() => next,
            _ = shared.shutdown.cancelled() => return,
        };
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::debug!(peer, "connection failed: {e}");
                break;
            }
            None => {
                tracing::debug!(peer, "peer closed connection");
                break;
            }
        };

        if frame.sender as usize != peer || frame.sequence != expected {
            tracing::warn!(
                peer,
                sender = frame.sender,
                sequence = frame.sequence,
                expected,
                "protocol violation, dropping connection"
            );
            break;
        }
        expected += 1;

        let Some(tag) = Tag::from_wire(frame.tag) else {
            tracing::warn!(peer, tag = frame.tag, "unknown tag, dropping connection");
            break;
        };
        match tag {
            Tag::Ack => {
                let mut payload = frame.payload;
                if payload.len() != 8 {
                    tracing::warn!(peer, "malformed acknowledgement");
                    break;
                }
                shared.resolve_ack(peer, payload.get_u64());
            }
            Tag::Revoke => {
                shared.stats.record_received(peer, frame.payload.len());
                shared.on_revoke(peer);
            }
            tag => {
                shared.stats.record_received(peer, frame.payload.len());
                let ack = frame.ack_requested();
                shared.mailbox.deliver(tag, peer, frame.payload);
                if ack {
                    shared.acknowledge(peer, frame.sequence);
                }
            }
        }
    }
    shared.peer_lost(peer);
}
