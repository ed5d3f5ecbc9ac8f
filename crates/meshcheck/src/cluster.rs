//! Cluster bootstrap: deploy the master, then every replica from it.

use std::collections::HashSet;
use std::path::PathBuf;

use meshcheck_protocol::Lsn;
use tokio_util::sync::CancellationToken;

use crate::deploy::{Deployer, NodeSpec, Role};
use crate::error::{HarnessError, Phase, Result};
use crate::node::{NodeHandle, NodeInfo, NodeSettings};

pub const MASTER_NAME: &str = "master";

/// The deployed nodes; index 0 is the master.
pub struct Cluster {
    nodes: Vec<NodeHandle>,
    baseline: Lsn,
}

impl Cluster {
    pub fn master(&self) -> &NodeHandle {
        &self.nodes[0]
    }

    pub fn nodes(&self) -> &[NodeHandle] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Master's own clock entry right after it came up.
    pub fn baseline(&self) -> Lsn {
        self.baseline
    }

    pub fn infos(&self) -> Vec<NodeInfo> {
        self.nodes.iter().map(|n| n.info().clone()).collect()
    }

    /// Hand the nodes to cleanup.
    pub fn into_nodes(self) -> Vec<NodeHandle> {
        self.nodes
    }
}

pub struct ClusterBuilder<'a> {
    deployer: &'a dyn Deployer,
    settings: NodeSettings,
    workdir: PathBuf,
    nodes: usize,
}

impl<'a> ClusterBuilder<'a> {
    pub fn new(deployer: &'a dyn Deployer, settings: NodeSettings, workdir: PathBuf, nodes: usize) -> Self {
        Self {
            deployer,
            settings,
            workdir,
            nodes,
        }
    }

    pub fn master_spec(&self) -> NodeSpec {
        NodeSpec {
            name: MASTER_NAME.into(),
            role: Role::Master,
            bootstrap: None,
            data_dir: self.workdir.join(MASTER_NAME),
        }
    }

    /// Deploy N nodes. On any failure everything already started is torn
    /// down and the master's data is wiped.
    pub async fn build(self, cancel: &CancellationToken) -> Result<Cluster> {
        let master_spec = self.master_spec();
        let master = match NodeHandle::deploy(self.deployer, master_spec.clone(), &self.settings, cancel).await {
            Ok(m) => m,
            Err(e) => {
                wipe_logged(self.deployer, &master_spec).await;
                return Err(bootstrap_error(MASTER_NAME, e));
            }
        };
        let mut nodes = vec![master];

        let prepared = self.prepare_master(&nodes[0]).await;
        match prepared {
            Ok(baseline) => {
                let master_id = nodes[0].id();
                for i in 1..self.nodes {
                    let name = format!("replica-{}", master_id as usize + i);
                    if cancel.is_cancelled() {
                        teardown(self.deployer, nodes).await;
                        return Err(HarnessError::Cancelled {
                            phase: Phase::Bootstrap,
                        });
                    }
                    let deployed = self.deploy_replica(&name, &nodes, cancel).await;
                    match deployed {
                        Ok(node) => nodes.push(node),
                        Err(e) => {
                            tracing::error!(node = name.as_str(), error = %e, "replica bootstrap failed");
                            teardown(self.deployer, nodes).await;
                            return Err(bootstrap_error(&name, e));
                        }
                    }
                }
                tracing::info!(nodes = nodes.len(), baseline, "cluster bootstrapped");
                Ok(Cluster { nodes, baseline })
            }
            Err(e) => {
                teardown(self.deployer, nodes).await;
                Err(bootstrap_error(MASTER_NAME, e))
            }
        }
    }

    async fn prepare_master(&self, master: &NodeHandle) -> Result<Lsn> {
        let dialect = &self.settings.dialect;
        for template in &dialect.master_setup {
            let cmd = dialect.render(template, &[]);
            master.execute(&cmd).await?;
        }
        let baseline = master.clock_entry(master.id()).await?.unwrap_or(0);
        Ok(baseline)
    }

    async fn deploy_replica(
        &self,
        name: &str,
        nodes: &[NodeHandle],
        cancel: &CancellationToken,
    ) -> Result<NodeHandle> {
        let spec = NodeSpec {
            name: name.to_string(),
            role: Role::Replica,
            bootstrap: Some(nodes[0].listen().to_string()),
            data_dir: self.workdir.join(name),
        };
        let mut node = NodeHandle::deploy(self.deployer, spec, &self.settings, cancel).await?;

        let seen: HashSet<_> = nodes.iter().map(|n| n.id()).collect();
        if seen.contains(&node.id()) {
            let id = node.id();
            if let Err(e) = node.stop().await {
                tracing::warn!(node = name, error = %e, "stop after duplicate id");
            }
            return Err(HarnessError::deployment(
                name,
                format!("instance id {id} is already taken"),
            ));
        }
        Ok(node)
    }
}

fn bootstrap_error(node: &str, source: HarnessError) -> HarnessError {
    if source.is_cancelled() {
        return source;
    }
    HarnessError::ClusterBootstrap {
        node: node.to_string(),
        source: Box::new(source),
    }
}

/// Stop the replicas, then stop and wipe the master.
async fn teardown(deployer: &dyn Deployer, mut nodes: Vec<NodeHandle>) {
    for node in nodes.iter_mut().skip(1) {
        if let Err(e) = node.stop().await {
            tracing::warn!(node = node.name(), error = %e, "teardown: stop failed");
        }
    }
    if let Some(master) = nodes.first_mut() {
        if let Err(e) = master.stop().await {
            tracing::warn!(node = master.name(), error = %e, "teardown: stop failed");
        }
        wipe_logged(deployer, master.spec()).await;
    }
}

async fn wipe_logged(deployer: &dyn Deployer, spec: &NodeSpec) {
    if let Err(e) = deployer.wipe(spec).await {
        tracing::warn!(node = spec.name.as_str(), error = %e, "wipe failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::sim::SimDeployer;
    use crate::dialect::Dialect;
    use crate::poll::PollSettings;
    use std::sync::Arc;
    use std::time::Duration;

    fn settings() -> NodeSettings {
        NodeSettings {
            dialect: Arc::new(Dialect::default()),
            poll: PollSettings::default(),
            deploy_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(5),
            bearer_token: None,
        }
    }

    #[tokio::test]
    async fn test_single_node_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let deployer = SimDeployer::new();
        let cluster = ClusterBuilder::new(&deployer, settings(), dir.path().to_path_buf(), 1)
            .build(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(cluster.len(), 1);
        assert_eq!(cluster.master().info().role, Role::Master);
        assert_eq!(cluster.baseline(), 1);
        for mut node in cluster.into_nodes() {
            node.stop().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_replicas_get_distinct_ids_and_names() {
        let dir = tempfile::tempdir().unwrap();
        let deployer = SimDeployer::new();
        let cluster = ClusterBuilder::new(&deployer, settings(), dir.path().to_path_buf(), 3)
            .build(&CancellationToken::new())
            .await
            .unwrap();
        let infos = cluster.infos();
        let ids: Vec<_> = infos.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(infos[1].name, "replica-2");
        assert_eq!(infos[2].name, "replica-3");
        assert!(infos[1..].iter().all(|i| i.role == Role::Replica));
        for mut node in cluster.into_nodes() {
            node.stop().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_failed_master_setup_wipes_master() {
        let dir = tempfile::tempdir().unwrap();
        let deployer = SimDeployer::new();
        let mut s = settings();
        s.dialect = Arc::new(Dialect {
            master_setup: vec!["no.such.command".into()],
            ..Dialect::default()
        });
        let builder = ClusterBuilder::new(&deployer, s, dir.path().to_path_buf(), 2);
        let master_dir = builder.master_spec().data_dir;
        let err = builder.build(&CancellationToken::new()).await.err().unwrap();
        assert!(matches!(err, HarnessError::ClusterBootstrap { ref node, .. } if node == MASTER_NAME));
        assert!(!master_dir.exists());
    }

    #[tokio::test]
    async fn test_duplicate_replica_id_aborts_bootstrap() {
        use crate::deploy::{BoxFuture, Deployed};

        // Replicas come up without a bootstrap source, so each claims id 1.
        struct Standalone(SimDeployer);
        impl Deployer for Standalone {
            fn deploy<'a>(&'a self, spec: &'a NodeSpec) -> BoxFuture<'a, Result<Deployed>> {
                Box::pin(async move {
                    let mut spec = spec.clone();
                    spec.bootstrap = None;
                    self.0.deploy(&spec).await
                })
            }
            fn wipe<'a>(&'a self, spec: &'a NodeSpec) -> BoxFuture<'a, Result<()>> {
                self.0.wipe(spec)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let deployer = Standalone(SimDeployer::new().fail_stop("replica-2"));
        let builder = ClusterBuilder::new(&deployer, settings(), dir.path().to_path_buf(), 3);
        let master_dir = builder.master_spec().data_dir;
        let err = builder.build(&CancellationToken::new()).await.err().unwrap();
        match err {
            HarnessError::ClusterBootstrap { node, source } => {
                assert_eq!(node, "replica-2");
                assert!(source.to_string().contains("already taken"), "{source}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!master_dir.exists());
    }
}
