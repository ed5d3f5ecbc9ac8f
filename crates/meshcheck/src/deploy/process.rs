//! Run each node as an external process.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};

use super::{remove_data_dir, BoxFuture, Deployed, Deployer, Lifecycle, NodeSpec};
use crate::error::HarnessError;

/// Config section `[process]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    #[serde(default = "default_program")]
    pub program: String,
    /// Argument templates: `{name}`, `{listen}`, `{data_dir}`.
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Appended for replicas: `{bootstrap}`.
    #[serde(default = "default_bootstrap_args")]
    pub bootstrap_args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_admin_url")]
    pub admin_url: String,
    /// Host the listen port is allocated on.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_stop_secs")]
    pub stop_secs: u64,
}

fn default_program() -> String {
    "meshcheck-sim".into()
}
fn default_args() -> Vec<String> {
    vec![
        "--name".into(),
        "{name}".into(),
        "--listen".into(),
        "{listen}".into(),
        "--data-dir".into(),
        "{data_dir}".into(),
    ]
}
fn default_bootstrap_args() -> Vec<String> {
    vec!["--bootstrap".into(), "{bootstrap}".into()]
}
fn default_admin_url() -> String {
    "http://{listen}".into()
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_stop_secs() -> u64 {
    10
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            bootstrap_args: default_bootstrap_args(),
            env: BTreeMap::new(),
            admin_url: default_admin_url(),
            host: default_host(),
            stop_secs: default_stop_secs(),
        }
    }
}

impl ProcessConfig {
    /// Full argument list for `spec` listening on `listen`.
    pub fn render_args(&self, spec: &NodeSpec, listen: &str) -> Vec<String> {
        let data_dir = spec.data_dir.display().to_string();
        let bootstrap = spec.bootstrap.clone().unwrap_or_default();
        let extra: &[String] = if spec.bootstrap.is_some() {
            &self.bootstrap_args
        } else {
            &[]
        };
        self.args
            .iter()
            .chain(extra)
            .map(|a| {
                a.replace("{name}", &spec.name)
                    .replace("{listen}", listen)
                    .replace("{data_dir}", &data_dir)
                    .replace("{bootstrap}", &bootstrap)
            })
            .collect()
    }
}

pub struct ProcessDeployer {
    config: ProcessConfig,
}

impl ProcessDeployer {
    pub fn new(config: ProcessConfig) -> Self {
        Self { config }
    }

    fn free_port(&self, node: &str) -> Result<u16, HarnessError> {
        let listener = std::net::TcpListener::bind((self.config.host.as_str(), 0))
            .map_err(|e| HarnessError::deployment(node, format!("allocate port: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| HarnessError::deployment(node, format!("allocate port: {e}")))?
            .port();
        Ok(port)
    }

    async fn start(&self, spec: &NodeSpec) -> Result<Deployed, HarnessError> {
        tokio::fs::create_dir_all(&spec.data_dir)
            .await
            .map_err(|e| HarnessError::deployment(&spec.name, format!("create data dir: {e}")))?;

        let port = self.free_port(&spec.name)?;
        let listen = format!("{}:{}", self.config.host, port);
        let args = self.config.render_args(spec, &listen);

        let child = Command::new(&self.config.program)
            .args(&args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HarnessError::deployment(&spec.name, format!("spawn {}: {e}", self.config.program))
            })?;

        tracing::info!(
            node = spec.name.as_str(),
            pid = child.id().unwrap_or(0),
            listen = listen.as_str(),
            "process started"
        );

        Ok(Deployed {
            admin_url: self.config.admin_url.replace("{listen}", &listen),
            lifecycle: Box::new(ProcessLifecycle {
                name: spec.name.clone(),
                child: Some(child),
                stop_timeout: Duration::from_secs(self.config.stop_secs),
            }),
        })
    }
}

impl Deployer for ProcessDeployer {
    fn deploy<'a>(&'a self, spec: &'a NodeSpec) -> BoxFuture<'a, Result<Deployed, HarnessError>> {
        Box::pin(self.start(spec))
    }

    fn wipe<'a>(&'a self, spec: &'a NodeSpec) -> BoxFuture<'a, Result<(), HarnessError>> {
        Box::pin(remove_data_dir(spec))
    }
}

struct ProcessLifecycle {
    name: String,
    child: Option<Child>,
    stop_timeout: Duration,
}

impl ProcessLifecycle {
    async fn kill(&mut self) -> Result<(), String> {
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };
        if let Ok(Some(status)) = child.try_wait() {
            tracing::debug!(node = self.name.as_str(), %status, "process already exited");
            self.child = None;
            return Ok(());
        }
        child.start_kill().map_err(|e| format!("kill: {e}"))?;
        match tokio::time::timeout(self.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(node = self.name.as_str(), %status, "process stopped");
                self.child = None;
                Ok(())
            }
            Ok(Err(e)) => Err(format!("wait: {e}")),
            Err(_) => Err(format!("did not exit within {:?}", self.stop_timeout)),
        }
    }
}

impl Lifecycle for ProcessLifecycle {
    fn stop(&mut self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(self.kill())
    }

    fn exited(&mut self) -> Option<String> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(format!("process exited early ({status})")),
            Ok(None) => None,
            Err(e) => Some(format!("process state unknown: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::Role;

    fn spec(dir: &std::path::Path, bootstrap: Option<&str>) -> NodeSpec {
        NodeSpec {
            name: "replica-2".into(),
            role: if bootstrap.is_some() { Role::Replica } else { Role::Master },
            bootstrap: bootstrap.map(String::from),
            data_dir: dir.join("replica-2"),
        }
    }

    #[test]
    fn test_render_args() {
        let cfg = ProcessConfig::default();
        let dir = tempfile::tempdir().unwrap();

        let master = cfg.render_args(&spec(dir.path(), None), "127.0.0.1:4000");
        assert_eq!(master[1], "replica-2");
        assert_eq!(master[3], "127.0.0.1:4000");
        assert!(!master.contains(&"--bootstrap".to_string()));

        let replica = cfg.render_args(&spec(dir.path(), Some("127.0.0.1:3301")), "127.0.0.1:4001");
        assert_eq!(&replica[replica.len() - 2..], ["--bootstrap", "127.0.0.1:3301"]);
    }

    #[tokio::test]
    async fn test_missing_program_is_deployment_error() {
        let dir = tempfile::tempdir().unwrap();
        let deployer = ProcessDeployer::new(ProcessConfig {
            program: "/nonexistent/meshcheck-node".into(),
            ..Default::default()
        });
        match deployer.deploy(&spec(dir.path(), None)).await {
            Err(HarnessError::Deployment { node, reason }) => {
                assert_eq!(node, "replica-2");
                assert!(reason.contains("spawn"));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("deploy should fail"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_early_exit_detected_and_stop_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let deployer = ProcessDeployer::new(ProcessConfig {
            program: "sh".into(),
            args: vec!["-c".into(), "exit 3".into()],
            ..Default::default()
        });
        let mut deployed = deployer.deploy(&spec(dir.path(), None)).await.unwrap();

        let mut reason = None;
        for _ in 0..100 {
            reason = deployed.lifecycle.exited();
            if reason.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(reason.unwrap().contains("exited early"));

        deployed.lifecycle.stop().await.unwrap();
        deployed.lifecycle.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_kills_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let deployer = ProcessDeployer::new(ProcessConfig {
            program: "sleep".into(),
            args: vec!["30".into()],
            ..Default::default()
        });
        let mut deployed = deployer.deploy(&spec(dir.path(), None)).await.unwrap();
        assert!(deployed.lifecycle.exited().is_none());
        deployed.lifecycle.stop().await.unwrap();
        assert!(deployed.lifecycle.exited().is_none());
    }

    #[tokio::test]
    async fn test_wipe_removes_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec(dir.path(), None);
        std::fs::create_dir_all(spec.data_dir.join("nested")).unwrap();
        let deployer = ProcessDeployer::new(ProcessConfig::default());
        deployer.wipe(&spec).await.unwrap();
        assert!(!spec.data_dir.exists());
        // Wiping twice is fine.
        deployer.wipe(&spec).await.unwrap();
    }
}
