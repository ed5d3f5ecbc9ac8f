//! End-to-end run: bootstrap, mesh, workload, verification, cleanup.
//!
//! Phases run strictly in order. Cleanup runs on every path out of a
//! started cluster, including failures and cancellation.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::cleanup::{Cleanup, CleanupReport};
use crate::cluster::{Cluster, ClusterBuilder};
use crate::config::HarnessConfig;
use crate::deploy::Deployer;
use crate::error::{HarnessError, Phase, RunFailure};
use crate::mesh::{self, MeshReport};
use crate::node::{NodeHandle, NodeInfo, NodeSettings};
use crate::verify::{ConvergenceReport, Verifier};
use crate::workload::{self, WorkloadSummary};

#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub phase: Phase,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub passed: bool,
    pub exit_code: i32,
    pub nodes: Vec<NodeInfo>,
    pub mesh: Option<MeshReport>,
    pub workload: Option<WorkloadSummary>,
    pub convergence: Option<ConvergenceReport>,
    pub cleanup: CleanupReport,
    pub failure: Option<FailureReport>,
    #[serde(skip)]
    pub error: Option<RunFailure>,
}

impl RunReport {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            passed: false,
            exit_code: 0,
            nodes: Vec::new(),
            mesh: None,
            workload: None,
            convergence: None,
            cleanup: CleanupReport::default(),
            failure: None,
            error: None,
        }
    }

    fn fail(&mut self, failure: RunFailure) {
        tracing::error!(phase = failure.phase.as_str(), error = %failure.error, "run failed");
        self.failure = Some(FailureReport {
            phase: failure.phase,
            message: failure.error.to_string(),
        });
        self.error = Some(failure);
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self.passed = self.error.is_none();
        self.exit_code = self.error.as_ref().map(RunFailure::exit_code).unwrap_or(0);
        self
    }

    /// `(name, converged)` per node, in cluster order.
    pub fn node_status(&self) -> Vec<(String, bool)> {
        self.nodes
            .iter()
            .map(|info| {
                let ok = self
                    .convergence
                    .as_ref()
                    .and_then(|c| c.verdicts.iter().find(|v| v.name == info.name))
                    .map(|v| v.passed())
                    .unwrap_or(false);
                (info.name.clone(), ok)
            })
            .collect()
    }
}

pub struct RunOutcome {
    pub report: RunReport,
    /// Fresh master left running by `MasterPolicy::Reset`.
    pub master: Option<NodeHandle>,
    /// Scratch directory holding the fresh master's data when no
    /// `cluster.workdir` was configured. Dropping it removes the data.
    pub scratch: Option<TempDir>,
}

impl RunOutcome {
    fn finished(report: RunReport) -> Self {
        Self {
            report: report.finish(),
            master: None,
            scratch: None,
        }
    }
}

pub struct Harness<'a> {
    config: HarnessConfig,
    deployer: &'a dyn Deployer,
}

impl<'a> Harness<'a> {
    pub fn new(config: HarnessConfig, deployer: &'a dyn Deployer) -> Self {
        Self { config, deployer }
    }

    pub fn node_settings(&self) -> NodeSettings {
        NodeSettings {
            dialect: Arc::new(self.config.dialect.clone()),
            poll: self.config.poll.clone(),
            deploy_timeout: self.config.timeouts.deploy(),
            command_timeout: self.config.timeouts.command(),
            bearer_token: self.config.cluster.bearer_token.clone(),
        }
    }

    pub async fn run(&self, cancel: &CancellationToken) -> RunOutcome {
        let mut report = RunReport::new();

        if let Err(e) = self.config.validate() {
            report.fail(RunFailure::new(Phase::Config, e));
            return RunOutcome::finished(report);
        }

        // Dropping it removes the node data dirs.
        let mut scratch = None;
        let workdir = match &self.config.cluster.workdir {
            Some(dir) => PathBuf::from(dir),
            None => match tempfile::Builder::new().prefix("meshcheck-").tempdir() {
                Ok(dir) => {
                    let path = dir.path().to_path_buf();
                    scratch = Some(dir);
                    path
                }
                Err(e) => {
                    report.fail(RunFailure::new(Phase::Config, HarnessError::Io(e)));
                    return RunOutcome::finished(report);
                }
            },
        };

        let settings = self.node_settings();
        tracing::info!(
            nodes = self.config.cluster.nodes,
            rows = self.config.cluster.rows,
            workdir = %workdir.display(),
            "starting run"
        );

        let built = ClusterBuilder::new(self.deployer, settings.clone(), workdir, self.config.cluster.nodes)
            .build(cancel)
            .await;
        let cluster = match built {
            Ok(cluster) => cluster,
            Err(e) => {
                report.fail(RunFailure::new(Phase::Bootstrap, e));
                return RunOutcome::finished(report);
            }
        };
        report.nodes = cluster.infos();

        if let Err(failure) = self.exercise(&cluster, &mut report, cancel).await {
            report.fail(failure);
        }

        let cleanup = Cleanup::new(self.deployer, settings, self.config.cluster.master_policy);
        let (cleanup_report, master) = cleanup.run(cluster.into_nodes()).await;
        if let Some(e) = cleanup_report.error() {
            tracing::warn!(error = %e, "cleanup finished with errors");
        }
        report.cleanup = cleanup_report;

        // A fresh master keeps its data dir alive past the run.
        let scratch = if master.is_some() { scratch } else { None };
        RunOutcome {
            report: report.finish(),
            master,
            scratch,
        }
    }

    async fn exercise(
        &self,
        cluster: &Cluster,
        report: &mut RunReport,
        cancel: &CancellationToken,
    ) -> Result<(), RunFailure> {
        let cfg = &self.config;
        let phase = |phase: Phase| move |e: HarnessError| RunFailure::new(phase, e);

        let mesh = mesh::configure(cluster, &cfg.poll, cfg.timeouts.mesh(), cancel)
            .await
            .map_err(phase(Phase::Mesh))?;
        report.mesh = Some(mesh);

        workload::prepare_schema(
            cluster,
            &cfg.dialect,
            &cfg.poll,
            cfg.timeouts.convergence(),
            cancel,
        )
        .await
        .map_err(phase(Phase::Workload))?;
        let (summary, expected) =
            workload::drive(cluster, cfg.cluster.rows, cfg.cluster.remainder, cancel)
                .await
                .map_err(phase(Phase::Workload))?;
        report.workload = Some(summary);

        let verifier = Verifier::new(cfg.poll.clone(), cfg.timeouts.convergence(), cfg.verify.content);
        let convergence = verifier
            .verify(cluster, &expected, cancel)
            .await
            .map_err(phase(Phase::Convergence))?;
        let failure = convergence.failure();
        report.convergence = Some(convergence);
        match failure {
            Some(f) => Err(f),
            None => Ok(()),
        }
    }
}
