//! Failure paths: frozen nodes, broken deploys, broken stops, cancellation.

use std::time::Duration;

use meshcheck::error::{HarnessError, Phase, EXIT_CANCELLED};
use meshcheck::{mesh, workload, Harness, Verifier};
use tokio_util::sync::CancellationToken;

use crate::harness::{fast_deployer, is_down, start_cluster, stop_cluster, test_config};

const EPSILON: Duration = Duration::from_millis(500);

/// A frozen replica never gets a clock entry on its peers.
#[tokio::test]
async fn test_frozen_node_mesh_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let deployer = fast_deployer();
    let cfg = test_config(3, 0, dir.path());
    let cluster = start_cluster(&deployer, &cfg).await;

    let frozen = &cluster.nodes()[2];
    frozen.execute("debug.freeze").await.unwrap();

    let timeout = Duration::from_secs(1);
    let err = mesh::configure(&cluster, &cfg.poll, timeout, &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        HarnessError::MeshTimeout { node, peer, waited } => {
            assert_eq!(node, "master");
            assert_eq!(peer, frozen.id());
            assert!(waited >= timeout);
            assert!(waited <= timeout + EPSILON, "waited {waited:?}");
        }
        other => panic!("expected mesh timeout, got {other}"),
    }

    let report = stop_cluster(&deployer, &cfg, cluster).await;
    assert!(report.is_clean());
}

/// A replica frozen after the schema is in place never catches up with the
/// rows written on it, and nobody catches up with it.
#[tokio::test]
async fn test_frozen_node_convergence_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let deployer = fast_deployer();
    let cfg = test_config(3, 30, dir.path());
    let cancel = CancellationToken::new();
    let cluster = start_cluster(&deployer, &cfg).await;

    mesh::configure(&cluster, &cfg.poll, cfg.timeouts.mesh(), &cancel)
        .await
        .unwrap();
    workload::prepare_schema(&cluster, &cfg.dialect, &cfg.poll, cfg.timeouts.mesh(), &cancel)
        .await
        .unwrap();

    let frozen = &cluster.nodes()[2];
    frozen.execute("debug.freeze").await.unwrap();
    let (_, expected) = workload::drive(&cluster, cfg.cluster.rows, cfg.cluster.remainder, &cancel)
        .await
        .unwrap();

    let timeout = Duration::from_secs(1);
    let report = Verifier::new(cfg.poll.clone(), timeout, cfg.verify.content)
        .verify(&cluster, &expected, &cancel)
        .await
        .unwrap();
    assert!(!report.passed());

    let frozen_verdict = &report.verdicts[2];
    assert!(!frozen_verdict.lags.is_empty());
    assert!(report.verdicts[1]
        .lags
        .iter()
        .any(|lag| lag.peer == frozen.id() && lag.reached.unwrap_or(0) < lag.target));

    let failure = report.failure().unwrap();
    assert_eq!(failure.phase, Phase::Convergence);
    match failure.error {
        HarnessError::ConvergenceTimeout { pairs, waited } => {
            assert!(pairs.iter().all(|p| p.node == frozen.name() || p.peer == frozen.id()));
            assert!(waited <= timeout + EPSILON, "waited {waited:?}");
        }
        other => panic!("expected convergence timeout, got {other}"),
    }

    stop_cluster(&deployer, &cfg, cluster).await;
}

/// A replica that cannot be deployed aborts bootstrap and leaves no master
/// state behind.
#[tokio::test]
async fn test_replica_deploy_failure_aborts_bootstrap() {
    let dir = tempfile::tempdir().unwrap();
    let deployer = fast_deployer().fail_deploy("replica-3");
    let cfg = test_config(4, 10, dir.path());

    let report = Harness::new(cfg, &deployer)
        .run(&CancellationToken::new())
        .await
        .report;
    assert!(!report.passed);
    assert_eq!(report.exit_code, Phase::Bootstrap.exit_code());

    match report.error.as_ref().map(|f| &f.error) {
        Some(HarnessError::ClusterBootstrap { node, source }) => {
            assert_eq!(node, "replica-3");
            assert!(source.to_string().contains("injected"));
        }
        other => panic!("expected bootstrap failure, got {other:?}"),
    }
    assert!(report.nodes.is_empty());
    assert!(!dir.path().join("master").exists());
}

/// Node 2 refuses to stop; nodes 1 and 3 are still stopped.
#[tokio::test]
async fn test_failing_stop_does_not_block_others() {
    let dir = tempfile::tempdir().unwrap();
    let deployer = fast_deployer().fail_stop("replica-2");
    let cfg = test_config(3, 60, dir.path());

    let report = Harness::new(cfg, &deployer)
        .run(&CancellationToken::new())
        .await
        .report;
    assert!(report.passed, "run failed: {:?}", report.failure);
    assert_eq!(report.exit_code, 0);

    let failed: Vec<_> = report.cleanup.failures.iter().map(|f| f.node.as_str()).collect();
    assert_eq!(failed, ["replica-2"]);
    assert_eq!(report.cleanup.stopped, ["replica-3", "master"]);
    assert!(report.cleanup.master_wiped);

    for node in &report.nodes {
        if node.name != "replica-2" {
            assert!(is_down(&node.listen).await, "{} still listening", node.name);
        }
    }
    let err = report.cleanup.error().unwrap();
    assert!(err.to_string().contains("replica-2"));
}

/// Cancellation interrupts a blocked wait; cleanup still runs.
#[tokio::test]
async fn test_cancel_during_mesh_wait() {
    let dir = tempfile::tempdir().unwrap();
    let deployer = fast_deployer();
    let cfg = test_config(2, 0, dir.path());
    let cluster = start_cluster(&deployer, &cfg).await;
    cluster.nodes()[1].execute("debug.freeze").await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = tokio::time::Instant::now();
    let err = mesh::configure(&cluster, &cfg.poll, Duration::from_secs(30), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::Cancelled { phase: Phase::Mesh }));
    assert!(started.elapsed() < Duration::from_secs(5));

    let nodes = cluster.infos();
    let report = stop_cluster(&deployer, &cfg, cluster).await;
    assert!(report.is_clean());
    for node in &nodes {
        assert!(is_down(&node.listen).await);
    }
}

#[tokio::test]
async fn test_cancelled_run_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let deployer = fast_deployer();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = Harness::new(test_config(3, 10, dir.path()), &deployer)
        .run(&cancel)
        .await
        .report;
    assert_eq!(report.exit_code, EXIT_CANCELLED);
    assert!(!dir.path().join("master").exists());
}
