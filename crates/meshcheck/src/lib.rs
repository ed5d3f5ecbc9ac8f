//! meshcheck -- replica-convergence test harness.
//!
//! Bootstraps a master and N-1 replicas of a replicated database, wires them
//! into a full mesh, writes a round-robin workload and checks that every
//! node converges:
//!   - vector clocks: every node has caught up with every other node
//!   - contents: every node holds the full dataset (row count or digest)
//!
//! The database is reached only through its admin/eval channels and a
//! [`deploy::Deployer`]; command texts come from a [`dialect::Dialect`].

pub mod cleanup;
pub mod client;
pub mod cluster;
pub mod config;
pub mod deploy;
pub mod dialect;
pub mod error;
pub mod mesh;
pub mod node;
pub mod poll;
pub mod runner;
pub mod verify;
pub mod workload;

pub use cleanup::{Cleanup, CleanupReport, MasterPolicy};
pub use cluster::{Cluster, ClusterBuilder};
pub use config::HarnessConfig;
pub use deploy::{process::ProcessDeployer, sim::SimDeployer, Deployer, Lifecycle, NodeSpec, Role};
pub use error::{HarnessError, Phase, RunFailure};
pub use node::{NodeHandle, NodeInfo, NodeSettings, NodeState};
pub use runner::{Harness, RunOutcome, RunReport};
pub use verify::{ContentCheck, ConvergenceReport, Verifier};
pub use workload::{ExpectedDataset, RemainderPolicy, WorkloadSummary};
