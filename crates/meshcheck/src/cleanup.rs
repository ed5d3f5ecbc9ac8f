//! Teardown. Every stop is attempted even when earlier ones fail.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::deploy::Deployer;
use crate::error::{HarnessError, ShutdownFailure};
use crate::node::{NodeHandle, NodeSettings};

/// What happens to the master once the replicas are stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterPolicy {
    /// Stop and wipe.
    #[default]
    Stop,
    /// Stop, wipe, and start a fresh master in its place.
    Reset,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub stopped: Vec<String>,
    pub failures: Vec<ShutdownFailure>,
    pub master_wiped: bool,
    pub master_redeployed: bool,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn error(&self) -> Option<HarnessError> {
        if self.failures.is_empty() {
            None
        } else {
            Some(HarnessError::Shutdown {
                failures: self.failures.clone(),
            })
        }
    }

    fn record(&mut self, node: &str, result: Result<(), HarnessError>) {
        match result {
            Ok(()) => self.stopped.push(node.to_string()),
            Err(HarnessError::Shutdown { failures }) => self.failures.extend(failures),
            Err(e) => self.failures.push(ShutdownFailure {
                node: node.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

pub struct Cleanup<'a> {
    deployer: &'a dyn Deployer,
    settings: NodeSettings,
    policy: MasterPolicy,
}

impl<'a> Cleanup<'a> {
    pub fn new(deployer: &'a dyn Deployer, settings: NodeSettings, policy: MasterPolicy) -> Self {
        Self {
            deployer,
            settings,
            policy,
        }
    }

    /// Stop every replica, then apply the master policy to `nodes[0]`.
    /// Returns the fresh master under [`MasterPolicy::Reset`].
    pub async fn run(&self, mut nodes: Vec<NodeHandle>) -> (CleanupReport, Option<NodeHandle>) {
        let mut report = CleanupReport::default();
        if nodes.is_empty() {
            return (report, None);
        }

        for node in nodes.iter_mut().skip(1) {
            let result = node.stop().await;
            report.record(node.info().name.as_str(), result);
        }

        let mut master = nodes.swap_remove(0);
        let result = master.stop().await;
        report.record(master.name(), result);

        let spec = master.spec().clone();
        match self.deployer.wipe(&spec).await {
            Ok(()) => report.master_wiped = true,
            Err(e) => report.failures.push(ShutdownFailure {
                node: spec.name.clone(),
                reason: e.to_string(),
            }),
        }

        let fresh = match self.policy {
            MasterPolicy::Stop => None,
            MasterPolicy::Reset if report.master_wiped => {
                // Cleanup is not cancellable; the redeploy gets its own token.
                let cancel = CancellationToken::new();
                match NodeHandle::deploy(self.deployer, spec.clone(), &self.settings, &cancel).await {
                    Ok(node) => {
                        report.master_redeployed = true;
                        Some(node)
                    }
                    Err(e) => {
                        report.failures.push(ShutdownFailure {
                            node: spec.name.clone(),
                            reason: format!("reset: {e}"),
                        });
                        None
                    }
                }
            }
            MasterPolicy::Reset => None,
        };

        if report.is_clean() {
            tracing::info!(stopped = report.stopped.len(), "cleanup complete");
        } else {
            for f in &report.failures {
                tracing::warn!(node = f.node.as_str(), reason = f.reason.as_str(), "cleanup failure");
            }
        }
        (report, fresh)
    }
}
