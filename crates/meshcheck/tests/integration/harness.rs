//! Shared helpers for the integration tests.

use std::path::Path;
use std::time::Duration;

use meshcheck::cleanup::{Cleanup, CleanupReport, MasterPolicy};
use meshcheck::cluster::{Cluster, ClusterBuilder};
use meshcheck::config::HarnessConfig;
use meshcheck::deploy::sim::SimDeployer;
use meshcheck::deploy::Deployer;
use meshcheck::node::NodeSettings;
use meshcheck::Harness;
use tokio_util::sync::CancellationToken;

/// Read TEST_NODE_COUNT from environment, falling back to `default`.
pub fn test_node_count(default: usize) -> usize {
    std::env::var("TEST_NODE_COUNT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Simulator deployer with a short pull interval.
pub fn fast_deployer() -> SimDeployer {
    SimDeployer::new().with_pull_interval(Duration::from_millis(10))
}

/// Config for an in-process cluster under `workdir`, with short waits.
pub fn test_config(nodes: usize, rows: u64, workdir: &Path) -> HarnessConfig {
    let mut cfg = HarnessConfig::default();
    cfg.cluster.nodes = nodes;
    cfg.cluster.rows = rows;
    cfg.cluster.workdir = Some(workdir.display().to_string());
    cfg.timeouts.deploy_secs = 10;
    cfg.timeouts.mesh_secs = 10;
    cfg.timeouts.convergence_secs = 20;
    cfg.poll.initial_ms = 5;
    cfg.poll.max_ms = 100;
    cfg
}

pub fn node_settings(cfg: &HarnessConfig, deployer: &dyn Deployer) -> NodeSettings {
    Harness::new(cfg.clone(), deployer).node_settings()
}

pub async fn start_cluster(deployer: &dyn Deployer, cfg: &HarnessConfig) -> Cluster {
    let workdir = cfg.cluster.workdir.clone().unwrap_or_default();
    ClusterBuilder::new(
        deployer,
        node_settings(cfg, deployer),
        workdir.into(),
        cfg.cluster.nodes,
    )
    .build(&CancellationToken::new())
    .await
    .unwrap()
}

pub async fn stop_cluster(deployer: &dyn Deployer, cfg: &HarnessConfig, cluster: Cluster) -> CleanupReport {
    let (report, fresh) = Cleanup::new(deployer, node_settings(cfg, deployer), MasterPolicy::Stop)
        .run(cluster.into_nodes())
        .await;
    assert!(fresh.is_none());
    report
}

/// True when nothing answers on `listen` any more.
pub async fn is_down(listen: &str) -> bool {
    tokio::net::TcpStream::connect(listen).await.is_err()
}
