use crate::common::{elapsed_ms, elapsed_s, launch, Launch};
use crate::events::*;
use cohort_communicator::Communicator;
use std::time::Instant;

pub struct CollectivesConfig {
    pub rounds: u32,
}

/// Time every collective for `rounds` rounds, checking each result.
/// Rank 0 reports the per-round timings.
pub async fn run(
    launch_mode: Launch,
    config: CollectivesConfig,
    start: Instant,
) -> anyhow::Result<u32> {
    let rounds = config.rounds;
    let outcomes = launch(&launch_mode, start, move |comm| async move {
        for round in 1..=rounds {
            let timings = one_round(&comm, round).await?;
            if comm.rank() == 0 {
                emit(&timings);
            }
        }
        anyhow::Ok(())
    })
    .await?;

    let failed = outcomes.iter().filter(|(_, o)| !o.is_completed()).count() as u32;
    emit(&EventSummary {
        event: "summary",
        mode: "collectives".into(),
        runs: outcomes.len() as u32,
        completed: outcomes.len() as u32 - failed,
        failed,
        elapsed_s: elapsed_s(start),
    });
    Ok(failed)
}

async fn one_round(comm: &Communicator, round: u32) -> anyhow::Result<EventCollectiveRound> {
    let rank = comm.rank();
    let size = comm.world_size();
    let root = round as usize % size;
    let is_root = rank == root;

    let t = Instant::now();
    comm.barrier().await?;
    let barrier_ms = elapsed_ms(t);

    let t = Instant::now();
    let value: u32 = comm.broadcast(root, is_root.then_some(round)).await?;
    anyhow::ensure!(value == round, "broadcast returned {value}, expected {round}");
    let broadcast_ms = elapsed_ms(t);

    let t = Instant::now();
    let values = is_root.then(|| (0..size).map(|r| (round, r)).collect());
    let mine: (u32, usize) = comm.scatter(root, values).await?;
    anyhow::ensure!(mine == (round, rank), "scatter delivered {mine:?}");
    let scatter_ms = elapsed_ms(t);

    // odd ranks only
    let odd: Vec<usize> = (1..size).step_by(2).collect();
    let t = Instant::now();
    let values = is_root.then(|| odd.iter().map(|&r| r as u64 * 3).collect());
    let part: Option<u64> = comm.scatterv(root, values, &odd).await?;
    anyhow::ensure!(
        part == odd.contains(&rank).then_some(rank as u64 * 3),
        "scatterv delivered {part:?}"
    );
    let scatterv_ms = elapsed_ms(t);

    let t = Instant::now();
    let gathered = comm.gather(root, rank).await?;
    if is_root {
        anyhow::ensure!(
            gathered == Some((0..size).collect::<Vec<_>>()),
            "gather returned {gathered:?}"
        );
    }
    let gather_ms = elapsed_ms(t);

    let t = Instant::now();
    let sources: Vec<usize> = odd.iter().rev().copied().collect();
    let contribution = sources.contains(&rank).then_some(rank);
    let gathered = comm.gatherv(root, contribution, &sources).await?;
    if is_root {
        anyhow::ensure!(gathered == Some(sources.clone()), "gatherv returned {gathered:?}");
    }
    let gatherv_ms = elapsed_ms(t);

    let t = Instant::now();
    let all = comm.allgather(rank * 2).await?;
    anyhow::ensure!(
        all == (0..size).map(|r| r * 2).collect::<Vec<_>>(),
        "allgather returned {all:?}"
    );
    let allgather_ms = elapsed_ms(t);

    Ok(EventCollectiveRound {
        event: "collective_round",
        round,
        barrier_ms,
        broadcast_ms,
        scatter_ms,
        scatterv_ms,
        gather_ms,
        gatherv_ms,
        allgather_ms,
    })
}
