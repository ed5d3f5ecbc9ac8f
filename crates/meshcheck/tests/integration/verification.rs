//! Cluster identity, mesh and verifier behaviour on a stable cluster.

use std::collections::HashSet;

use meshcheck::{mesh, workload, ContentCheck, Verifier};
use tokio_util::sync::CancellationToken;

use crate::harness::{fast_deployer, start_cluster, stop_cluster, test_config, test_node_count};

/// Bootstrap yields N running nodes with unique ids.
#[tokio::test]
async fn test_bootstrap_unique_ids() {
    let n = test_node_count(5);
    let dir = tempfile::tempdir().unwrap();
    let deployer = fast_deployer();
    let cfg = test_config(n, 0, dir.path());
    let cluster = start_cluster(&deployer, &cfg).await;

    assert_eq!(cluster.len(), n);
    let ids: HashSet<_> = cluster.nodes().iter().map(|node| node.id()).collect();
    assert_eq!(ids.len(), n);
    for node in cluster.nodes() {
        node.execute("ping").await.unwrap();
    }

    stop_cluster(&deployer, &cfg, cluster).await;
}

/// After mesh configuration every ordered pair has a defined clock entry.
#[tokio::test]
async fn test_mesh_defines_every_pair() {
    let dir = tempfile::tempdir().unwrap();
    let deployer = fast_deployer();
    let cfg = test_config(3, 0, dir.path());
    let cluster = start_cluster(&deployer, &cfg).await;

    let report = mesh::configure(&cluster, &cfg.poll, cfg.timeouts.mesh(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.links, 6);
    assert_eq!(report.sources.len(), 3);

    for a in cluster.nodes() {
        for b in cluster.nodes() {
            assert!(
                a.clock_entry(b.id()).await.unwrap().is_some(),
                "{} has no entry for {}",
                a.name(),
                b.id()
            );
        }
    }
    stop_cluster(&deployer, &cfg, cluster).await;
}

/// Verifying a converged, idle cluster twice gives the same answer.
#[tokio::test]
async fn test_verifier_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let deployer = fast_deployer();
    let cfg = test_config(3, 45, dir.path());
    let cancel = CancellationToken::new();
    let cluster = start_cluster(&deployer, &cfg).await;

    mesh::configure(&cluster, &cfg.poll, cfg.timeouts.mesh(), &cancel)
        .await
        .unwrap();
    workload::prepare_schema(&cluster, &cfg.dialect, &cfg.poll, cfg.timeouts.convergence(), &cancel)
        .await
        .unwrap();
    let (_, expected) = workload::drive(&cluster, cfg.cluster.rows, cfg.cluster.remainder, &cancel)
        .await
        .unwrap();

    let verifier = Verifier::new(cfg.poll.clone(), cfg.timeouts.convergence(), ContentCheck::Digest);
    let first = verifier.verify(&cluster, &expected, &cancel).await.unwrap();
    let second = verifier.verify(&cluster, &expected, &cancel).await.unwrap();

    assert!(first.passed());
    assert!(second.passed());
    assert_eq!(first.targets, second.targets);
    let digests = |r: &meshcheck::ConvergenceReport| -> Vec<Option<String>> {
        r.verdicts.iter().map(|v| v.digest.clone()).collect()
    };
    assert_eq!(digests(&first), digests(&second));

    stop_cluster(&deployer, &cfg, cluster).await;
}

/// A row missing from the expected set shows up as unexpected on every node.
#[tokio::test]
async fn test_digest_reports_unexpected_rows() {
    let dir = tempfile::tempdir().unwrap();
    let deployer = fast_deployer();
    let cfg = test_config(2, 10, dir.path());
    let cancel = CancellationToken::new();
    let cluster = start_cluster(&deployer, &cfg).await;

    mesh::configure(&cluster, &cfg.poll, cfg.timeouts.mesh(), &cancel)
        .await
        .unwrap();
    workload::prepare_schema(&cluster, &cfg.dialect, &cfg.poll, cfg.timeouts.convergence(), &cancel)
        .await
        .unwrap();
    let (_, expected) = workload::drive(&cluster, cfg.cluster.rows, cfg.cluster.remainder, &cancel)
        .await
        .unwrap();
    let master_id = cluster.master().id();
    cluster
        .master()
        .insert(meshcheck_protocol::Record { row: 999, origin: master_id })
        .await
        .unwrap();

    let report = Verifier::new(cfg.poll.clone(), cfg.timeouts.convergence(), ContentCheck::Digest)
        .verify(&cluster, &expected, &cancel)
        .await
        .unwrap();
    assert!(!report.passed());
    for v in &report.verdicts {
        assert_eq!((v.missing, v.unexpected), (0, 1), "{}", v.name);
        assert!(v.lags.is_empty());
    }
    let failure = report.failure().unwrap();
    assert_eq!(failure.phase, meshcheck::Phase::Content);

    stop_cluster(&deployer, &cfg, cluster).await;
}
