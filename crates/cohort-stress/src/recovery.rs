use crate::common::{elapsed_ms, elapsed_s, launch, Launch};
use crate::events::*;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Rank that leaves right after the group forms; the last rank by
    /// default.
    pub silent: Option<usize>,
    /// Timeout of the failing operation and of the shrink.
    pub detect_timeout: Duration,
}

/// One player goes silent. The others notice on their next collective,
/// revoke, shrink to the survivors and check the new group works.
pub async fn run(
    launch_mode: Launch,
    config: RecoveryConfig,
    start: Instant,
) -> anyhow::Result<u32> {
    let silent_rank = config.silent;
    let detect_timeout = config.detect_timeout;
    let outcomes = launch(&launch_mode, start, move |comm| async move {
        let silent = silent_rank.unwrap_or(comm.world_size() - 1);
        anyhow::ensure!(silent < comm.world_size(), "silent rank {silent} out of range");
        if comm.rank() == silent {
            return anyhow::Ok(false);
        }
        comm.set_timeout(detect_timeout);

        let detect_start = Instant::now();
        let failure = match comm.allgather(comm.rank()).await {
            Ok(_) => anyhow::bail!("allgather succeeded without rank {silent}"),
            Err(e) => e,
        };
        tracing::warn!(rank = comm.rank(), "group failure detected: {failure}");
        comm.revoke().await?;
        let detect_ms = elapsed_ms(detect_start);

        let shrink_start = Instant::now();
        let survivors = comm.responsive_members().await?;
        let survivors_comm = comm.shrink(&survivors, "recovered").await?;
        let ranks = survivors_comm.allgather(comm.rank()).await?;
        let shrink_ms = elapsed_ms(shrink_start);
        survivors_comm.stop().await;

        anyhow::ensure!(!survivors.contains(&silent), "silent rank survived shrink");
        anyhow::ensure!(ranks == survivors, "shrunk group disagrees: {ranks:?}");
        emit(&EventRecovery {
            event: "recovery",
            rank: comm.rank(),
            failure: failure.to_string(),
            survivors,
            new_rank: survivors_comm.rank(),
            detect_ms,
            shrink_ms,
        });
        anyhow::Ok(true)
    })
    .await?;

    let failed = outcomes.iter().filter(|(_, o)| !o.is_completed()).count() as u32;
    emit(&EventSummary {
        event: "summary",
        mode: "recovery".into(),
        runs: outcomes.len() as u32,
        completed: outcomes.len() as u32 - failed,
        failed,
        elapsed_s: elapsed_s(start),
    });
    Ok(failed)
}
