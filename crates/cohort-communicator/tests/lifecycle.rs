//! Integration tests: revoke, shrink, split and sub-communicators.

use std::time::Duration;

use cohort_communicator::{run, CommunicatorError, PlayerOutcome, RunConfig, Token};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();
}

fn completed<T>(outcomes: Vec<PlayerOutcome<T>>) -> Vec<T> {
    outcomes
        .into_iter()
        .map(|outcome| outcome.into_result().unwrap())
        .collect()
}

// ── Revoke ──────────────────────────────────────────────────────────

/// Rank 1 revokes; everyone waiting on the group sees `Revoked`.
#[tokio::test(flavor = "multi_thread")]
async fn revoke_interrupts_every_member() {
    init_tracing();
    let outcomes = run(RunConfig::new(3), |comm| async move {
        if comm.rank() == 1 {
            comm.revoke().await?;
            let after = comm.barrier().await;
            assert!(matches!(after, Err(CommunicatorError::Revoked)));
            return anyhow::Ok(true);
        }
        let waiting = comm.recv::<u8>(1, 0).await;
        assert!(
            matches!(waiting, Err(CommunicatorError::Revoked)),
            "expected Revoked, got {waiting:?}"
        );
        anyhow::Ok(comm.is_revoked())
    })
    .await
    .unwrap();
    assert_eq!(completed(outcomes), [true, true, true]);
}

#[tokio::test(flavor = "multi_thread")]
async fn revoke_is_counted_as_traffic() {
    init_tracing();
    let outcomes = run(RunConfig::new(2), |comm| async move {
        if comm.rank() == 0 {
            comm.revoke().await?;
            // repeated revocations send nothing new
            comm.revoke().await?;
            return anyhow::Ok(comm.stats().peer(1).messages_sent);
        }
        while !comm.is_revoked() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        anyhow::Ok(comm.stats().peer(0).messages_received)
    })
    .await
    .unwrap();
    assert_eq!(completed(outcomes), [1, 1]);
}

// ── Shrink ──────────────────────────────────────────────────────────

/// Members outside the group are never contacted; new ranks follow the
/// old rank order even when the group is listed out of order.
#[tokio::test(flavor = "multi_thread")]
async fn shrink_builds_group_in_old_rank_order() {
    init_tracing();
    let config = RunConfig::new(4).timeout(Duration::from_secs(2));
    let outcomes = run(config, |comm| async move {
        if comm.rank() == 2 {
            // stays connected but never joins the shrink
            tokio::time::sleep(Duration::from_secs(1)).await;
            return anyhow::Ok(None);
        }
        let smaller = comm.shrink(&[3, 0, 1], "survivors").await?;
        let ranks = smaller.allgather(comm.rank()).await?;
        let summary = (smaller.rank(), smaller.world_size(), ranks);
        assert_eq!(smaller.name(), "survivors");
        smaller.stop().await;
        anyhow::Ok(Some(summary))
    })
    .await
    .unwrap();
    let results = completed(outcomes);

    assert_eq!(results[0], Some((0, 3, vec![0, 1, 3])));
    assert_eq!(results[1], Some((1, 3, vec![0, 1, 3])));
    assert_eq!(results[2], None);
    assert_eq!(results[3], Some((2, 3, vec![0, 1, 3])));
}

/// Survivors reaching the shrink at different times still end up in
/// one group.
#[tokio::test(flavor = "multi_thread")]
async fn shrink_tolerates_staggered_callers() {
    init_tracing();
    let config = RunConfig::new(3).timeout(Duration::from_secs(2));
    let outcomes = run(config, |comm| async move {
        tokio::time::sleep(Duration::from_millis(400) * comm.rank() as u32).await;
        let smaller = comm.shrink(&[0, 1, 2], "staggered").await?;
        let size = smaller.world_size();
        smaller.barrier().await?;
        smaller.stop().await;
        anyhow::Ok((smaller.rank(), size))
    })
    .await
    .unwrap();
    assert_eq!(completed(outcomes), [(0, 3), (1, 3), (2, 3)]);
}

/// Departed members are lost connections; they drop out of the
/// liveness check right away.
#[tokio::test(flavor = "multi_thread")]
async fn shrink_after_revoke_recovers() {
    init_tracing();
    let config = RunConfig::new(4).timeout(Duration::from_secs(2));
    let outcomes = run(config, |comm| async move {
        if comm.rank() == 3 {
            anyhow::bail!("player 3 gives up");
        }
        if comm.rank() == 0 {
            comm.revoke().await?;
        }
        while !comm.is_revoked() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let survivors = comm.responsive_members().await?;
        let smaller = comm.shrink(&survivors, "recovered").await?;
        assert!(!smaller.is_revoked());
        let sum: u32 = smaller
            .allgather(comm.rank() as u32)
            .await?
            .into_iter()
            .sum();
        smaller.stop().await;
        anyhow::Ok((survivors, sum))
    })
    .await
    .unwrap();

    assert!(outcomes[3].communicator_error().is_none());
    assert!(!outcomes[3].is_completed());
    for outcome in outcomes.into_iter().take(3) {
        assert_eq!(outcome.into_result().unwrap(), (vec![0, 1, 2], 3));
    }
}

/// A member that stays connected but stops answering: the others time
/// out, revoke, agree on who is left and shrink to exactly those ranks.
#[tokio::test(flavor = "multi_thread")]
async fn unresponsive_member_is_detected_and_excluded() {
    init_tracing();
    let config = RunConfig::new(4).timeout(Duration::from_millis(500));
    let outcomes = run(config, |comm| async move {
        if comm.rank() == 1 {
            tokio::time::sleep(Duration::from_secs(4)).await;
            return anyhow::Ok(None);
        }
        let failure = comm.allgather(comm.rank()).await.unwrap_err();
        assert!(failure.is_failure_signal(), "unexpected {failure:?}");
        comm.revoke().await?;

        let survivors = comm.responsive_members().await?;
        let smaller = comm.shrink(&survivors, "recovered").await?;
        let ranks = smaller.allgather(comm.rank()).await?;
        let summary = (survivors, smaller.rank(), ranks);
        smaller.stop().await;
        anyhow::Ok(Some(summary))
    })
    .await
    .unwrap();
    let results = completed(outcomes);

    assert_eq!(results[0], Some((vec![0, 2, 3], 0, vec![0, 2, 3])));
    assert_eq!(results[1], None);
    assert_eq!(results[2], Some((vec![0, 2, 3], 1, vec![0, 2, 3])));
    assert_eq!(results[3], Some((vec![0, 2, 3], 2, vec![0, 2, 3])));
}

/// Liveness answers from an earlier round do not count in the next one.
#[tokio::test(flavor = "multi_thread")]
async fn liveness_check_ignores_earlier_rounds() {
    init_tracing();
    let config = RunConfig::new(3).timeout(Duration::from_millis(400));
    let outcomes = run(config, |comm| async move {
        match comm.rank() {
            // answers only the first round, after the others gave up on it
            2 => {
                tokio::time::sleep(Duration::from_millis(1000)).await;
                let late = comm.responsive_members().await;
                assert!(
                    matches!(late, Err(CommunicatorError::Timeout { .. })),
                    "expected to be left out, got {late:?}"
                );
                anyhow::Ok(None)
            }
            _ => {
                let first = comm.responsive_members().await?;
                tokio::time::sleep(Duration::from_millis(1500)).await;
                let second = comm.responsive_members().await?;
                assert_eq!(first, second);
                anyhow::Ok(Some(second))
            }
        }
    })
    .await
    .unwrap();
    let results = completed(outcomes);
    assert_eq!(results[0], Some(vec![0, 1]));
    assert_eq!(results[1], Some(vec![0, 1]));
    assert_eq!(results[2], None);
}

#[tokio::test(flavor = "multi_thread")]
async fn shrink_rejects_groups_without_the_caller() {
    init_tracing();
    let outcomes = run(RunConfig::new(3), |comm| async move {
        let others: Vec<usize> = (0..3).filter(|&r| r != comm.rank()).collect();
        let result = comm.shrink(&others, "elsewhere").await;
        anyhow::Ok(matches!(result, Err(CommunicatorError::InvalidArgument(_))))
    })
    .await
    .unwrap();
    assert_eq!(completed(outcomes), [true, true, true]);
}

// ── Split ───────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn split_partitions_by_label() {
    init_tracing();
    let outcomes = run(RunConfig::new(5), |comm| async move {
        let label = match comm.rank() {
            0 | 2 | 4 => Some("even"),
            1 => Some("odd"),
            _ => None,
        };
        let Some(part) = comm.split(label).await? else {
            return anyhow::Ok(None);
        };
        let members = part.allgather(comm.rank()).await?;
        let summary = (part.name().to_string(), part.rank(), members);
        part.stop().await;
        anyhow::Ok(Some(summary))
    })
    .await
    .unwrap();
    let results = completed(outcomes);

    let even = |rank: usize| Some(("even".to_string(), rank, vec![0, 2, 4]));
    assert_eq!(results[0], even(0));
    assert_eq!(results[2], even(1));
    assert_eq!(results[4], even(2));
    assert_eq!(results[1], Some(("odd".to_string(), 0, vec![1])));
    assert_eq!(results[3], None);
}

/// The parent keeps working after a split.
#[tokio::test(flavor = "multi_thread")]
async fn split_leaves_parent_usable() {
    init_tracing();
    let outcomes = run(RunConfig::new(2), |comm| async move {
        let part = comm.split(Some("all")).await?.expect("labelled member");
        part.barrier().await?;
        part.stop().await;
        anyhow::Ok(comm.allgather(comm.rank() * 2).await?)
    })
    .await
    .unwrap();
    assert_eq!(completed(outcomes), [vec![0, 2], vec![0, 2]]);
}

// ── Sub-communicators ───────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn sub_communicator_ranks_follow_group_order() {
    init_tracing();
    let outcomes = run(RunConfig::new(3), |comm| async move {
        if comm.rank() == 1 {
            return anyhow::Ok(None);
        }
        let pair = comm.sub_communicator(&[2, 0], "pair", 7).await?;
        assert_eq!(pair.token(), &Token::Int(7));
        let from_leader: usize = pair
            .broadcast(0, (pair.rank() == 0).then(|| comm.rank()))
            .await?;
        let summary = (pair.rank(), pair.world_size(), from_leader);
        pair.stop().await;
        anyhow::Ok(Some(summary))
    })
    .await
    .unwrap();
    assert_eq!(
        completed(outcomes),
        [Some((1, 2, 2)), None, Some((0, 2, 2))]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn sub_communicator_token_mismatch_fails_everyone() {
    init_tracing();
    let outcomes = run(RunConfig::new(2), |comm| async move {
        let token = if comm.rank() == 0 { "left" } else { "right" };
        let result = comm.sub_communicator(&[0, 1], "pair", token).await;
        anyhow::Ok(matches!(result, Err(CommunicatorError::TokenMismatch)))
    })
    .await
    .unwrap();
    assert_eq!(completed(outcomes), [true, true]);
}

#[tokio::test(flavor = "multi_thread")]
async fn sub_communicator_requires_membership_and_active_parent() {
    init_tracing();
    let outcomes = run(RunConfig::new(2), |comm| async move {
        let outsider = comm.sub_communicator(&[1 - comm.rank()], "solo", 0).await;
        assert!(matches!(outsider, Err(CommunicatorError::InvalidArgument(_))));
        comm.barrier().await?;
        if comm.rank() == 0 {
            comm.revoke().await?;
        }
        while !comm.is_revoked() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let revoked = comm.sub_communicator(&[0, 1], "pair", 0).await;
        anyhow::Ok(matches!(revoked, Err(CommunicatorError::Revoked)))
    })
    .await
    .unwrap();
    assert_eq!(completed(outcomes), [true, true]);
}

/// The leader's notice from a failed try is still queued at the follower
/// when both retry; the follower must wait for the fresh one.
#[tokio::test(flavor = "multi_thread")]
async fn retried_derivation_skips_stale_notice() {
    init_tracing();
    let config = RunConfig::new(2).timeout(Duration::from_secs(1));
    let outcomes = run(config, |comm| async move {
        let first = if comm.rank() == 0 {
            // arrives after the follower gave up
            tokio::time::sleep(Duration::from_millis(1500)).await;
            comm.sub_communicator(&[0, 1], "pair", 0).await
        } else {
            let first = comm.sub_communicator(&[0, 1], "pair", 0).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
            first
        };
        assert!(
            matches!(first, Err(CommunicatorError::Timeout { .. })),
            "first try: {first:?}"
        );

        let pair = comm.sub_communicator(&[0, 1], "pair", 0).await?;
        let ranks = pair.allgather(comm.rank()).await?;
        pair.stop().await;
        anyhow::Ok(ranks)
    })
    .await
    .unwrap();
    assert_eq!(completed(outcomes), [vec![0, 1], vec![0, 1]]);
}
