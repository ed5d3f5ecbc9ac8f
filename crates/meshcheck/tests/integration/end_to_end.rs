//! Full runs through `Harness::run`.

use meshcheck::{ContentCheck, Harness, MasterPolicy, RemainderPolicy};
use tokio_util::sync::CancellationToken;

use crate::harness::{fast_deployer, is_down, test_config, test_node_count};

/// Three nodes, sixty rows: every node reports all sixty.
#[tokio::test]
async fn test_three_nodes_sixty_rows() {
    let dir = tempfile::tempdir().unwrap();
    let deployer = fast_deployer();
    let cfg = test_config(3, 60, dir.path());

    let outcome = Harness::new(cfg, &deployer).run(&CancellationToken::new()).await;
    let report = outcome.report;
    assert!(report.passed, "run failed: {:?}", report.failure);
    assert_eq!(report.exit_code, 0);

    let names: Vec<_> = report.nodes.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, ["master", "replica-2", "replica-3"]);

    let convergence = report.convergence.as_ref().unwrap();
    assert_eq!(convergence.verdicts.len(), 3);
    for v in &convergence.verdicts {
        assert_eq!(v.size, Some(60), "{}", v.name);
        assert!(v.lags.is_empty());
    }

    let workload = report.workload.as_ref().unwrap();
    assert!(workload.per_node.iter().all(|w| w.writes == 20));

    let mesh = report.mesh.as_ref().unwrap();
    assert_eq!(mesh.links, 6);

    assert!(report.cleanup.failures.is_empty());
    assert_eq!(report.cleanup.stopped.len(), 3);
    for node in &report.nodes {
        assert!(is_down(&node.listen).await, "{} still listening", node.name);
    }
    assert!(!dir.path().join("master").exists());
}

/// N nodes (TEST_NODE_COUNT, default 4) with a remainder and the digest check.
#[tokio::test]
async fn test_digest_check_with_remainder() {
    let n = test_node_count(4);
    let dir = tempfile::tempdir().unwrap();
    let deployer = fast_deployer();
    let mut cfg = test_config(n, 4 * n as u64 + 3, dir.path());
    cfg.verify.content = ContentCheck::Digest;
    cfg.cluster.remainder = RemainderPolicy::FirstNode;

    let report = Harness::new(cfg, &deployer)
        .run(&CancellationToken::new())
        .await
        .report;
    assert!(report.passed, "run failed: {:?}", report.failure);

    let workload = report.workload.as_ref().unwrap();
    assert_eq!(workload.remainder, 3);
    assert_eq!(workload.per_node[0].writes, 7);
    assert!(workload.per_node[1..].iter().all(|w| w.writes == 4));

    let convergence = report.convergence.as_ref().unwrap();
    let expected = convergence.expected_digest.clone().unwrap();
    for v in &convergence.verdicts {
        assert_eq!(v.digest.as_deref(), Some(expected.as_str()), "{}", v.name);
        assert_eq!((v.missing, v.unexpected), (0, 0));
    }
}

#[tokio::test]
async fn test_single_node_cluster_runs() {
    let dir = tempfile::tempdir().unwrap();
    let deployer = fast_deployer();
    let report = Harness::new(test_config(1, 10, dir.path()), &deployer)
        .run(&CancellationToken::new())
        .await
        .report;
    assert!(report.passed, "run failed: {:?}", report.failure);
    assert_eq!(report.mesh.as_ref().unwrap().links, 0);
}

/// Reset leaves a fresh, empty master behind.
#[tokio::test]
async fn test_reset_policy_returns_fresh_master() {
    let dir = tempfile::tempdir().unwrap();
    let deployer = fast_deployer();
    let mut cfg = test_config(2, 10, dir.path());
    cfg.cluster.master_policy = MasterPolicy::Reset;

    let outcome = Harness::new(cfg, &deployer).run(&CancellationToken::new()).await;
    assert!(outcome.report.passed, "run failed: {:?}", outcome.report.failure);
    assert!(outcome.report.cleanup.master_redeployed);

    let mut master = outcome.master.unwrap();
    assert_eq!(master.id(), 1);
    assert!(master.dataset_size().await.is_err());
    master.stop().await.unwrap();
}

/// Without a configured workdir the fresh master's data lives in the
/// outcome's scratch dir and outlasts the run.
#[tokio::test]
async fn test_reset_without_workdir_keeps_master_data() {
    let deployer = fast_deployer();
    let mut cfg = test_config(2, 4, std::path::Path::new("unused"));
    cfg.cluster.workdir = None;
    cfg.cluster.master_policy = MasterPolicy::Reset;

    let outcome = Harness::new(cfg, &deployer).run(&CancellationToken::new()).await;
    assert!(outcome.report.passed, "run failed: {:?}", outcome.report.failure);

    let mut master = outcome.master.unwrap();
    let scratch = outcome.scratch.unwrap();
    let data_dir = master.spec().data_dir.clone();
    assert!(data_dir.starts_with(scratch.path()));
    assert!(data_dir.exists(), "{} was removed", data_dir.display());
    assert_eq!(master.own_lsn().await.unwrap(), 1);
    master.stop().await.unwrap();

    drop(scratch);
    assert!(!data_dir.exists());
}

#[tokio::test]
async fn test_report_serialises() {
    let dir = tempfile::tempdir().unwrap();
    let deployer = fast_deployer();
    let report = Harness::new(test_config(2, 4, dir.path()), &deployer)
        .run(&CancellationToken::new())
        .await
        .report;
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["passed"], true);
    assert_eq!(json["nodes"][1]["role"], "replica");
    assert_eq!(json["convergence"]["check"], "size");
    assert!(json["failure"].is_null());
    assert!(json["started_at"].is_string());
}
