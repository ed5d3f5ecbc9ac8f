//! Lifecycle backends: how a node is started, stopped and wiped.
//!
//! The harness only sees [`Deployer`] and the [`Lifecycle`] it hands back, so
//! the same orchestration drives external processes ([`process`]) and
//! in-process simulator nodes ([`sim`]).

pub mod process;
pub mod sim;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::HarnessError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Master,
    Replica,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Replica => "replica",
        }
    }
}

/// What to start.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub name: String,
    pub role: Role,
    /// Listen address of the master; set for replicas only.
    pub bootstrap: Option<String>,
    pub data_dir: PathBuf,
}

/// A started instance, not yet known to be ready.
pub struct Deployed {
    pub admin_url: String,
    pub lifecycle: Box<dyn Lifecycle>,
}

/// Control over one running instance.
pub trait Lifecycle: Send + Sync {
    /// Stop the instance. Calling it again after success is a no-op.
    fn stop(&mut self) -> BoxFuture<'_, Result<(), String>>;

    /// `Some(reason)` once the instance has exited on its own.
    fn exited(&mut self) -> Option<String>;
}

pub trait Deployer: Send + Sync {
    fn deploy<'a>(&'a self, spec: &'a NodeSpec) -> BoxFuture<'a, Result<Deployed, HarnessError>>;

    /// Remove everything the instance persisted.
    fn wipe<'a>(&'a self, spec: &'a NodeSpec) -> BoxFuture<'a, Result<(), HarnessError>>;
}

/// Remove a data dir; a missing dir is already wiped.
pub(crate) async fn remove_data_dir(spec: &NodeSpec) -> Result<(), HarnessError> {
    match tokio::fs::remove_dir_all(&spec.data_dir).await {
        Ok(()) => {
            tracing::debug!(node = spec.name.as_str(), dir = %spec.data_dir.display(), "data dir wiped");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(HarnessError::deployment(
            &spec.name,
            format!("wipe {}: {e}", spec.data_dir.display()),
        )),
    }
}
