use crate::events::{emit, EventPlayerFailed};
use cohort_communicator::{
    run, Communicator, CommunicatorConfig, PlayerOutcome, Rank, RunConfig,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

/// Where the players of a scenario come from.
#[derive(Debug, Clone)]
pub enum Launch {
    /// Every player as a task in this process.
    Local(RunConfig),
    /// This process is one player, configured by `COHORT_*` variables.
    FromEnv,
}

impl Launch {
    pub fn label(&self) -> &'static str {
        match self {
            Launch::Local(_) => "local",
            Launch::FromEnv => "env",
        }
    }
}

/// Run `player` on every player this process hosts and return the
/// outcome per rank. Failures are reported as events.
pub async fn launch<T, F, Fut>(
    launch: &Launch,
    start: Instant,
    player: F,
) -> anyhow::Result<Vec<(Rank, PlayerOutcome<T>)>>
where
    T: Send + 'static,
    F: Fn(Arc<Communicator>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let outcomes: Vec<(Rank, PlayerOutcome<T>)> = match launch {
        Launch::Local(config) => run(config.clone(), player)
            .await?
            .into_iter()
            .enumerate()
            .collect(),
        Launch::FromEnv => {
            let config = CommunicatorConfig::from_env()?;
            let rank = config.rank();
            let outcome = match Communicator::connect(config).await {
                Err(e) => PlayerOutcome::Failed(e.into()),
                Ok(comm) => {
                    let comm = Arc::new(comm);
                    let result = player(comm.clone()).await;
                    comm.stop().await;
                    match result {
                        Ok(value) => PlayerOutcome::Completed(value),
                        Err(e) => PlayerOutcome::Failed(e),
                    }
                }
            };
            vec![(rank, outcome)]
        }
    };

    for (rank, outcome) in &outcomes {
        let error = match outcome {
            PlayerOutcome::Completed(_) => continue,
            PlayerOutcome::Failed(e) => format!("{e:#}"),
            PlayerOutcome::Panicked(message) => format!("panicked: {message}"),
        };
        tracing::warn!(rank, "player failed: {error}");
        emit(&EventPlayerFailed {
            event: "player_failed",
            rank: *rank,
            error,
            elapsed_s: elapsed_s(start),
        });
    }
    Ok(outcomes)
}

pub fn elapsed_s(start: Instant) -> f64 {
    start.elapsed().as_secs_f64()
}

pub fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

/// A text payload of `size` bytes whose first bytes spell out `seq`.
pub fn generate_payload(size: usize, seq: u32) -> String {
    let mut payload = format!("{seq}:");
    if payload.len() < size {
        payload.push_str(&"X".repeat(size - payload.len()));
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_payload_size() {
        assert_eq!(generate_payload(64, 7).len(), 64);
        assert!(generate_payload(64, 7).starts_with("7:"));
        assert_eq!(generate_payload(0, 12), "12:");
    }
}
