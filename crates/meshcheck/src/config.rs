//! Configuration types for meshcheck.
//! Parsed from a TOML file; every section and field has a default.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::cleanup::MasterPolicy;
use crate::deploy::process::ProcessConfig;
use crate::dialect::Dialect;
use crate::error::HarnessError;
use crate::poll::PollSettings;
use crate::verify::ContentCheck;
use crate::workload::RemainderPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub cluster: ClusterSection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    #[serde(default)]
    pub poll: PollSettings,
    #[serde(default)]
    pub verify: VerifySection,
    #[serde(default)]
    pub dialect: Dialect,
    #[serde(default)]
    pub process: ProcessConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSection {
    /// Total node count, master included.
    #[serde(default = "default_nodes")]
    pub nodes: usize,
    /// Rows written by the workload.
    #[serde(default = "default_rows")]
    pub rows: u64,
    #[serde(default)]
    pub remainder: RemainderPolicy,
    /// Parent directory for node data dirs. A temp dir when unset.
    pub workdir: Option<String>,
    /// Bearer token sent on every admin/eval call.
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub master_policy: MasterPolicy,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            rows: default_rows(),
            remainder: RemainderPolicy::default(),
            workdir: None,
            bearer_token: None,
            master_policy: MasterPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSection {
    /// Per node: process start until the ping answers.
    #[serde(default = "default_30")]
    pub deploy_secs: u64,
    /// Per ordered pair: clock entry defined.
    #[serde(default = "default_30")]
    pub mesh_secs: u64,
    /// Per ordered pair: clock entry caught up.
    #[serde(default = "default_60")]
    pub convergence_secs: u64,
    /// Single admin/eval round trip.
    #[serde(default = "default_5")]
    pub command_secs: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            deploy_secs: 30,
            mesh_secs: 30,
            convergence_secs: 60,
            command_secs: 5,
        }
    }
}

impl TimeoutSection {
    pub fn deploy(&self) -> Duration {
        Duration::from_secs(self.deploy_secs)
    }
    pub fn mesh(&self) -> Duration {
        Duration::from_secs(self.mesh_secs)
    }
    pub fn convergence(&self) -> Duration {
        Duration::from_secs(self.convergence_secs)
    }
    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    /// Apply one timeout to every blocking wait.
    pub fn set_all(&mut self, secs: u64) {
        self.deploy_secs = secs;
        self.mesh_secs = secs;
        self.convergence_secs = secs;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifySection {
    #[serde(default)]
    pub content: ContentCheck,
}

// Default value functions
fn default_nodes() -> usize {
    3
}
fn default_rows() -> u64 {
    60
}
fn default_5() -> u64 {
    5
}
fn default_30() -> u64 {
    30
}
fn default_60() -> u64 {
    60
}

impl HarnessConfig {
    /// Load config from file, or use defaults if missing.
    pub fn load_or_default(path: &Path) -> Result<Self, HarnessError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: HarnessConfig = toml::from_str(&content)
                .map_err(|e| HarnessError::Config(format!("{}: {e}", path.display())))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.cluster.nodes == 0 {
            return Err(HarnessError::Config("cluster.nodes must be >= 1".into()));
        }
        if self.timeouts.deploy_secs == 0
            || self.timeouts.mesh_secs == 0
            || self.timeouts.convergence_secs == 0
            || self.timeouts.command_secs == 0
        {
            return Err(HarnessError::Config("timeouts must be > 0".into()));
        }
        self.poll.validate().map_err(HarnessError::Config)?;
        if self.dialect.space.trim().is_empty() {
            return Err(HarnessError::Config("dialect.space must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = HarnessConfig::default();
        assert_eq!(cfg.cluster.nodes, 3);
        assert_eq!(cfg.cluster.rows, 60);
        assert_eq!(cfg.cluster.remainder, RemainderPolicy::FirstNode);
        assert_eq!(cfg.verify.content, ContentCheck::Size);
        assert_eq!(cfg.timeouts.convergence(), Duration::from_secs(60));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
[cluster]
nodes = 5
rows = 101
remainder = "round_robin"
master_policy = "reset"

[timeouts]
mesh_secs = 10

[poll]
initial_ms = 20
max_ms = 1000

[verify]
content = "digest"

[dialect]
space = "bench"

[process]
program = "/usr/local/bin/meshcheck-sim"
"#;

        let cfg: HarnessConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.cluster.nodes, 5);
        assert_eq!(cfg.cluster.rows, 101);
        assert_eq!(cfg.cluster.remainder, RemainderPolicy::RoundRobin);
        assert_eq!(cfg.cluster.master_policy, MasterPolicy::Reset);
        assert_eq!(cfg.timeouts.mesh_secs, 10);
        assert_eq!(cfg.timeouts.deploy_secs, 30);
        assert_eq!(cfg.poll.initial_ms, 20);
        assert_eq!(cfg.poll.multiplier, 2.0);
        assert_eq!(cfg.verify.content, ContentCheck::Digest);
        assert_eq!(cfg.dialect.space, "bench");
        assert_eq!(cfg.dialect.ping, "ping");
        assert_eq!(cfg.process.program, "/usr/local/bin/meshcheck-sim");
        assert!(!cfg.process.args.is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = HarnessConfig::default();
        cfg.cluster.nodes = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = HarnessConfig::default();
        cfg.timeouts.set_all(0);
        assert!(cfg.validate().is_err());

        let mut cfg = HarnessConfig::default();
        cfg.poll.max_ms = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = HarnessConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.cluster.nodes, 3);
    }

    #[test]
    fn test_serialise_default() {
        let cfg = HarnessConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        assert!(toml_str.contains("[cluster]"));
        assert!(toml_str.contains("[dialect]"));
    }
}
