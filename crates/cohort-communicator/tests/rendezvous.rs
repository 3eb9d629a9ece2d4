//! Integration tests: group formation, its failure modes and the
//! in-process driver.

use std::time::Duration;

use cohort_communicator::{
    run, Address, Communicator, CommunicatorConfig, CommunicatorError, PlayerOutcome, RunConfig,
    TlsConfig, TlsIdentity, Token,
};
use cohort_transport::Listener;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();
}

fn error_of<T>(outcome: &PlayerOutcome<T>) -> &CommunicatorError {
    outcome
        .communicator_error()
        .expect("player should fail with a communicator error")
}

/// Start `configs.len()` players by hand, returning each connect result.
async fn connect_all(
    configs: Vec<CommunicatorConfig>,
) -> Vec<cohort_communicator::Result<Communicator>> {
    let tasks: Vec<_> = configs
        .into_iter()
        .map(|config| tokio::spawn(Communicator::connect(config)))
        .collect();
    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap());
    }
    results
}

async fn root_listener() -> (Listener, Address) {
    let listener = Listener::bind(&Address::tcp("127.0.0.1", 0)).await.unwrap();
    let address = listener.local_address().unwrap();
    (listener, address)
}

#[tokio::test(flavor = "multi_thread")]
async fn token_mismatch_fails_every_member() {
    init_tracing();
    let config = RunConfig::new(3).tokens(vec![Token::Int(1), Token::Int(1), Token::Int(2)]);
    let outcomes = run(config, |_comm| async move { anyhow::Ok(()) })
        .await
        .unwrap();
    for outcome in &outcomes {
        assert!(
            matches!(error_of(outcome), CommunicatorError::TokenMismatch),
            "unexpected outcome: {outcome:?}"
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn text_and_integer_tokens_never_match() {
    init_tracing();
    let config = RunConfig::new(2).tokens(vec![Token::Int(5), Token::from("5")]);
    let outcomes = run(config, |_comm| async move { anyhow::Ok(()) })
        .await
        .unwrap();
    assert!(outcomes
        .iter()
        .all(|o| matches!(o.communicator_error(), Some(CommunicatorError::TokenMismatch))));
}

#[tokio::test(flavor = "multi_thread")]
async fn name_mismatch_fails_every_member() {
    init_tracing();
    let (listener, root) = root_listener().await;
    let results = connect_all(vec![
        CommunicatorConfig::dynamic(2, 0, root.clone())
            .name("alpha")
            .listener(listener),
        CommunicatorConfig::dynamic(2, 1, root).name("beta"),
    ])
    .await;
    for result in results {
        assert!(matches!(result, Err(CommunicatorError::GroupMismatch(_))));
    }
}

/// A member that never shows up times the whole group out.
#[tokio::test(flavor = "multi_thread")]
async fn missing_member_times_out() {
    init_tracing();
    let (listener, root) = root_listener().await;
    let timeout = Duration::from_millis(300);
    let results = connect_all(vec![
        CommunicatorConfig::dynamic(3, 0, root.clone())
            .timeout(timeout)
            .listener(listener),
        CommunicatorConfig::dynamic(3, 1, root).timeout(timeout),
    ])
    .await;
    for result in results {
        let err = result.unwrap_err();
        assert!(err.is_timeout(), "expected Timeout, got {err}");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn dialing_absent_root_times_out() {
    init_tracing();
    let (listener, root) = root_listener().await;
    drop(listener);
    let config = CommunicatorConfig::dynamic(2, 1, root).timeout(Duration::from_millis(200));
    let err = Communicator::connect(config).await.unwrap_err();
    assert!(err.is_timeout(), "expected Timeout, got {err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_configuration_is_rejected() {
    init_tracing();
    let root = Address::tcp("127.0.0.1", 1);
    let err = Communicator::connect(CommunicatorConfig::dynamic(2, 2, root))
        .await
        .unwrap_err();
    assert!(matches!(err, CommunicatorError::Config(_)));
}

// ── TLS ─────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn tls_group_with_mutual_trust() {
    init_tracing();
    let identities: Vec<TlsIdentity> = (0..3)
        .map(|_| TlsIdentity::self_signed().unwrap())
        .collect();
    let configs = identities
        .iter()
        .map(|own| {
            identities.iter().fold(TlsConfig::new(own.clone()), |config, peer| {
                config.trust(peer.certificate().clone())
            })
        })
        .collect();

    let outcomes = run(RunConfig::new(3).tls(configs), |comm| async move {
        assert!(comm.transport().is_tls());
        anyhow::Ok(comm.allgather(comm.rank()).await?)
    })
    .await
    .unwrap();
    for outcome in outcomes {
        assert_eq!(outcome.into_result().unwrap(), vec![0, 1, 2]);
    }
}

/// Members that do not trust each other's certificates fail with
/// `EncryptionFailed` rather than a generic transport error.
#[tokio::test(flavor = "multi_thread")]
async fn tls_untrusted_peer_fails_encryption() {
    init_tracing();
    let configs = (0..2)
        .map(|_| TlsConfig::new(TlsIdentity::self_signed().unwrap()))
        .collect();
    let config = RunConfig::new(2).tls(configs).timeout(Duration::from_secs(2));
    let outcomes = run(config, |_comm| async move { anyhow::Ok(()) })
        .await
        .unwrap();
    for outcome in &outcomes {
        assert!(
            matches!(error_of(outcome), CommunicatorError::EncryptionFailed(_)),
            "unexpected outcome: {outcome:?}"
        );
    }
}

// ── Lifecycle of whole groups ───────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn repeated_create_and_stop() {
    init_tracing();
    for cycle in 0..100u32 {
        let outcomes = run(RunConfig::new(3).token(i64::from(cycle)), |comm| async move {
            comm.barrier().await?;
            anyhow::Ok(comm.world_size())
        })
        .await
        .unwrap();
        assert!(
            outcomes.iter().all(|o| o.completed() == Some(&3)),
            "cycle {cycle} failed: {outcomes:?}"
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn create_and_stop_across_world_sizes() {
    init_tracing();
    for size in [2, 4, 8, 16, 32] {
        for cycle in 0..5 {
            let outcomes = run(RunConfig::new(size), |comm| async move {
                comm.barrier().await?;
                anyhow::Ok(comm.world_size())
            })
            .await
            .unwrap();
            assert!(
                outcomes.iter().all(|o| o.completed() == Some(&size)),
                "size {size} cycle {cycle} failed: {outcomes:?}"
            );
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn world_of_128_forms_full_mesh() {
    init_tracing();
    const SIZE: usize = 128;
    let config = RunConfig::new(SIZE).timeout(Duration::from_secs(60));
    let outcomes = run(config, |comm| async move {
        comm.barrier().await?;
        let ranks = comm.allgather(comm.rank()).await?;
        anyhow::Ok(ranks == (0..SIZE).collect::<Vec<_>>())
    })
    .await
    .unwrap();
    assert_eq!(outcomes.len(), SIZE);
    assert!(
        outcomes.iter().all(|o| o.completed() == Some(&true)),
        "{:?}",
        outcomes.iter().find(|o| o.completed() != Some(&true))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn single_member_group() {
    init_tracing();
    let outcomes = run(RunConfig::new(1), |comm| async move {
        comm.barrier().await?;
        let all = comm.allgather("alone".to_string()).await?;
        anyhow::Ok((comm.rank(), all))
    })
    .await
    .unwrap();
    assert_eq!(outcomes[0].completed(), Some(&(0, vec!["alone".to_string()])));
}

#[tokio::test(flavor = "multi_thread")]
async fn driver_records_errors_and_panics() {
    init_tracing();
    let outcomes = run(RunConfig::new(3), |comm| async move {
        match comm.rank() {
            0 => anyhow::Ok(comm.rank()),
            1 => anyhow::bail!("player declined"),
            _ => panic!("player exploded"),
        }
    })
    .await
    .unwrap();

    assert_eq!(outcomes[0].completed(), Some(&0));
    match &outcomes[1] {
        PlayerOutcome::Failed(e) => assert_eq!(e.to_string(), "player declined"),
        other => panic!("expected Failed, got {other:?}"),
    }
    match &outcomes[2] {
        PlayerOutcome::Panicked(message) => assert_eq!(message, "player exploded"),
        other => panic!("expected Panicked, got {other:?}"),
    }
}
