//! Run `meshcheck-sim` nodes inside the harness's own runtime.
//!
//! Each node binds an ephemeral port. Deploy and stop failures can be
//! injected per node name.

use std::collections::HashSet;
use std::time::Duration;

use meshcheck_sim::{RunningNode, SimConfig};

use super::{remove_data_dir, BoxFuture, Deployed, Deployer, Lifecycle, NodeSpec};
use crate::error::HarnessError;

#[derive(Debug, Clone, Default)]
pub struct SimDeployer {
    bearer_token: Option<String>,
    pull_interval: Option<Duration>,
    fail_deploy: HashSet<String>,
    fail_stop: HashSet<String>,
}

impl SimDeployer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token;
        self
    }

    pub fn with_pull_interval(mut self, interval: Duration) -> Self {
        self.pull_interval = Some(interval);
        self
    }

    /// Deploying `name` fails before anything starts.
    pub fn fail_deploy(mut self, name: &str) -> Self {
        self.fail_deploy.insert(name.to_string());
        self
    }

    /// Stopping `name` reports an error (the node is still torn down).
    pub fn fail_stop(mut self, name: &str) -> Self {
        self.fail_stop.insert(name.to_string());
        self
    }

    async fn start(&self, spec: &NodeSpec) -> Result<Deployed, HarnessError> {
        if self.fail_deploy.contains(&spec.name) {
            return Err(HarnessError::deployment(&spec.name, "injected deploy failure"));
        }

        let mut config = SimConfig::new(&spec.name, spec.data_dir.clone());
        config.bootstrap = spec.bootstrap.clone();
        config.bearer_token = self.bearer_token.clone();
        if let Some(interval) = self.pull_interval {
            config.pull_interval = interval;
        }

        let node = meshcheck_sim::spawn(config)
            .await
            .map_err(|e| HarnessError::deployment(&spec.name, e))?;

        Ok(Deployed {
            admin_url: node.admin_url(),
            lifecycle: Box::new(SimLifecycle {
                node: Some(node),
                fail_stop: self.fail_stop.contains(&spec.name),
            }),
        })
    }
}

impl Deployer for SimDeployer {
    fn deploy<'a>(&'a self, spec: &'a NodeSpec) -> BoxFuture<'a, Result<Deployed, HarnessError>> {
        Box::pin(self.start(spec))
    }

    fn wipe<'a>(&'a self, spec: &'a NodeSpec) -> BoxFuture<'a, Result<(), HarnessError>> {
        Box::pin(remove_data_dir(spec))
    }
}

struct SimLifecycle {
    node: Option<RunningNode>,
    fail_stop: bool,
}

impl SimLifecycle {
    async fn shutdown(&mut self) -> Result<(), String> {
        let Some(node) = self.node.take() else {
            return Ok(());
        };
        if self.fail_stop {
            node.abort();
            return Err("injected stop failure".into());
        }
        node.shutdown().await;
        Ok(())
    }
}

impl Lifecycle for SimLifecycle {
    fn stop(&mut self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(self.shutdown())
    }

    fn exited(&mut self) -> Option<String> {
        match &self.node {
            Some(node) if node.is_finished() => Some("node tasks ended".into()),
            _ => None,
        }
    }
}
