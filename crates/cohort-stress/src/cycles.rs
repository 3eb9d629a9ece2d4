use crate::common::{elapsed_ms, elapsed_s, launch, Launch};
use crate::events::*;
use std::time::Instant;

pub struct CyclesConfig {
    pub count: u32,
}

/// Form a group, synchronize once, stop it; `count` times over.
///
/// Catches leaked listeners, sockets and tasks: a leak shows up as a
/// later cycle failing to form.
pub async fn run(launch_mode: Launch, config: CyclesConfig, start: Instant) -> anyhow::Result<u32> {
    let mut failed = 0u32;
    for cycle in 1..=config.count {
        let cycle_start = Instant::now();
        let outcomes = launch(&launch_mode, start, |comm| async move {
            comm.barrier().await?;
            anyhow::Ok(())
        })
        .await?;

        let ok = outcomes.iter().all(|(_, outcome)| outcome.is_completed());
        if !ok {
            failed += 1;
        }
        emit(&EventCycle {
            event: "cycle",
            cycle,
            ok,
            elapsed_ms: elapsed_ms(cycle_start),
        });
        if cycle % 10 == 0 {
            eprintln!("  {cycle}/{} cycles, {failed} failed", config.count);
        }
    }

    emit(&EventSummary {
        event: "summary",
        mode: "cycles".into(),
        runs: config.count,
        completed: config.count - failed,
        failed,
        elapsed_s: elapsed_s(start),
    });
    Ok(failed)
}
