use crate::common::{elapsed_ms, elapsed_s, generate_payload, launch, Launch};
use crate::events::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;

const VOLUME_TAG: u32 = 1;

#[derive(Debug, Clone)]
pub struct VolumeConfig {
    pub messages: u32,
    pub payload_size: usize,
}

#[derive(Serialize, Deserialize)]
struct VolumeMessage {
    seq: u32,
    data: String,
}

/// Every player sends `messages` payloads to every other player, then
/// receives the same number from each and checks they arrived in order.
pub async fn run(launch_mode: Launch, config: VolumeConfig, start: Instant) -> anyhow::Result<u32> {
    let player_config = config.clone();
    let outcomes = launch(&launch_mode, start, move |comm| {
        let config = player_config.clone();
        async move {
            let phase_start = Instant::now();
            let peers: Vec<usize> = (0..comm.world_size())
                .filter(|&peer| peer != comm.rank())
                .collect();

            for seq in 0..config.messages {
                let message = VolumeMessage {
                    seq,
                    data: generate_payload(config.payload_size, seq),
                };
                for &peer in &peers {
                    comm.send(peer, VOLUME_TAG, &message).await?;
                }
            }

            let mut received = 0u64;
            let mut out_of_order = 0u64;
            for &peer in &peers {
                for expected in 0..config.messages {
                    let message: VolumeMessage = comm.recv(peer, VOLUME_TAG).await?;
                    if message.seq != expected {
                        out_of_order += 1;
                    }
                    received += 1;
                }
            }
            comm.barrier().await?;

            let elapsed = elapsed_ms(phase_start);
            let total = comm.stats().total();
            let result = EventVolumeResult {
                event: "volume_result",
                rank: comm.rank(),
                peers: peers.len(),
                messages_per_peer: config.messages,
                messages_received: received,
                out_of_order,
                bytes_sent: total.bytes_sent,
                bytes_received: total.bytes_received,
                elapsed_ms: elapsed,
                messages_per_sec: if elapsed > 0.0 {
                    received as f64 / (elapsed / 1000.0)
                } else {
                    0.0
                },
            };
            emit(&result);

            let expected = peers.len() as u64 * u64::from(config.messages);
            anyhow::ensure!(
                received == expected && out_of_order == 0,
                "rank {} received {received}/{expected} messages, {out_of_order} out of order",
                comm.rank()
            );
            anyhow::Ok(())
        }
    })
    .await?;

    let failed = outcomes.iter().filter(|(_, o)| !o.is_completed()).count() as u32;
    emit(&EventSummary {
        event: "summary",
        mode: "volume".into(),
        runs: outcomes.len() as u32,
        completed: outcomes.len() as u32 - failed,
        failed,
        elapsed_s: elapsed_s(start),
    });
    Ok(failed)
}
