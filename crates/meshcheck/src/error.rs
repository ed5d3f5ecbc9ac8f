//! Error taxonomy. Every variant names the node(s) involved; [`RunFailure`]
//! adds the phase.

use std::fmt;
use std::time::Duration;

use meshcheck_protocol::{InstanceId, Lsn};
use serde::Serialize;

/// Orchestration phase, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Config,
    Bootstrap,
    Mesh,
    Workload,
    Convergence,
    Content,
    Cleanup,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Config => "config",
            Phase::Bootstrap => "bootstrap",
            Phase::Mesh => "mesh",
            Phase::Workload => "workload",
            Phase::Convergence => "convergence",
            Phase::Content => "content",
            Phase::Cleanup => "cleanup",
        }
    }

    /// Process exit code reported by the CLI for a failure in this phase.
    pub fn exit_code(&self) -> i32 {
        match self {
            Phase::Config => 1,
            Phase::Bootstrap => 2,
            Phase::Mesh => 3,
            Phase::Convergence => 4,
            Phase::Content => 5,
            Phase::Workload => 6,
            // Cleanup failures never replace an earlier outcome; on their own
            // they are reported but do not fail the run.
            Phase::Cleanup => 0,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exit code for a cancelled run (128 + SIGINT).
pub const EXIT_CANCELLED: i32 = 130;

/// A clock pair that never synchronised: `node`'s entry for `peer` stayed
/// below `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairLag {
    pub node: String,
    pub peer: InstanceId,
    pub target: Lsn,
    pub reached: Option<Lsn>,
}

impl fmt::Display for PairLag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reached {
            Some(lsn) => write!(
                f,
                "{} has {}/{} from instance {}",
                self.node, lsn, self.target, self.peer
            ),
            None => write!(
                f,
                "{} has nothing from instance {} (needs {})",
                self.node, self.peer, self.target
            ),
        }
    }
}

fn join_display<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("config error: {0}")]
    Config(String),

    #[error("deployment of {node} failed: {reason}")]
    Deployment { node: String, reason: String },

    #[error("command '{command}' on {node} failed: {reason}")]
    Command {
        node: String,
        command: String,
        reason: String,
    },

    #[error("cluster bootstrap failed at {node}: {source}")]
    ClusterBootstrap {
        node: String,
        #[source]
        source: Box<HarnessError>,
    },

    #[error("mesh not established: {node} has no clock entry for instance {peer} after {waited:?}")]
    MeshTimeout {
        node: String,
        peer: InstanceId,
        waited: Duration,
    },

    #[error("convergence timed out after {waited:?}: {}", join_display(.pairs))]
    ConvergenceTimeout { pairs: Vec<PairLag>, waited: Duration },

    #[error("content mismatch on {}: {detail}", .nodes.join(", "))]
    ContentMismatch { nodes: Vec<String>, detail: String },

    #[error("shutdown failed for {}", join_display(.failures))]
    Shutdown { failures: Vec<ShutdownFailure> },

    #[error("cancelled during {phase}")]
    Cancelled { phase: Phase },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    pub fn command(node: &str, command: &str, reason: impl fmt::Display) -> Self {
        HarnessError::Command {
            node: node.to_string(),
            command: command.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn deployment(node: &str, reason: impl fmt::Display) -> Self {
        HarnessError::Deployment {
            node: node.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, HarnessError::Cancelled { .. })
    }
}

/// One node that could not be stopped cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownFailure {
    pub node: String,
    pub reason: String,
}

impl fmt::Display for ShutdownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.node, self.reason)
    }
}

/// A fatal outcome of a run: what went wrong and in which phase.
#[derive(Debug)]
pub struct RunFailure {
    pub phase: Phase,
    pub error: HarnessError,
}

impl RunFailure {
    pub fn new(phase: Phase, error: HarnessError) -> Self {
        Self { phase, error }
    }

    pub fn exit_code(&self) -> i32 {
        if self.error.is_cancelled() {
            EXIT_CANCELLED
        } else {
            self.phase.exit_code()
        }
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.phase, self.error)
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
