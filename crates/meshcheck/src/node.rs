//! Node handle: one deployed instance, its admin/eval channels and its
//! lifecycle. Every command text comes from the [`Dialect`].

use std::sync::Arc;
use std::time::Duration;

use meshcheck_protocol::{InstanceId, Lsn, Record};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::client::AdminClient;
use crate::deploy::{Deployer, Lifecycle, NodeSpec, Role};
use crate::dialect::Dialect;
use crate::error::{HarnessError, Phase, Result, ShutdownFailure};
use crate::poll::{wait_for, PollSettings, WaitError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub id: InstanceId,
    pub name: String,
    /// Replication listen address, as reported by the node.
    pub listen: String,
    pub admin_url: String,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Stopped,
    Deploying,
    Running,
    StoppedAgain,
    /// Stop was attempted and failed.
    Failed,
}

/// Shared knobs every handle needs.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub dialect: Arc<Dialect>,
    pub poll: PollSettings,
    pub deploy_timeout: Duration,
    pub command_timeout: Duration,
    pub bearer_token: Option<String>,
}

pub struct NodeHandle {
    info: NodeInfo,
    state: NodeState,
    spec: NodeSpec,
    client: AdminClient,
    dialect: Arc<Dialect>,
    lifecycle: Box<dyn Lifecycle>,
}

impl NodeHandle {
    /// Start the node and wait until it answers the ping command. A
    /// half-started node is stopped before the error is returned.
    pub async fn deploy(
        deployer: &dyn Deployer,
        spec: NodeSpec,
        settings: &NodeSettings,
        cancel: &CancellationToken,
    ) -> Result<NodeHandle> {
        let name = spec.name.clone();
        tracing::info!(node = name.as_str(), role = spec.role.as_str(), "deploying");

        let mut deployed = deployer.deploy(&spec).await?;
        let client = match AdminClient::new(
            &name,
            &deployed.admin_url,
            settings.bearer_token.clone(),
            settings.command_timeout,
        ) {
            Ok(c) => c,
            Err(e) => {
                stop_after_failure(&name, deployed.lifecycle.as_mut()).await;
                return Err(e);
            }
        };

        let ready = {
            let lifecycle = &mut deployed.lifecycle;
            let ping = settings.dialect.ping.clone();
            wait_for(&settings.poll, settings.deploy_timeout, cancel, || {
                let exited = lifecycle.exited();
                let client = client.clone();
                let ping = ping.clone();
                async move {
                    if let Some(reason) = exited {
                        return Ok(Some(Err(reason)));
                    }
                    client.execute(&ping).await.map(|_| Some(Ok(())))
                }
            })
            .await
        };

        let failure = match ready {
            Ok(Ok(())) => None,
            Ok(Err(reason)) => Some(HarnessError::deployment(&name, reason)),
            Err(WaitError::Timeout { waited, last_error }) => Some(HarnessError::deployment(
                &name,
                format!(
                    "not ready after {waited:?}: {}",
                    last_error.unwrap_or_else(|| "no answer".into())
                ),
            )),
            Err(WaitError::Cancelled) => Some(HarnessError::Cancelled {
                phase: Phase::Bootstrap,
            }),
        };
        if let Some(err) = failure {
            stop_after_failure(&name, deployed.lifecycle.as_mut()).await;
            return Err(err);
        }

        let identity = async {
            let id = read_id(&client, &name, &settings.dialect.node_id).await?;
            let listen = client.execute(&settings.dialect.listen).await?;
            let listen = listen.as_str().map(String::from).ok_or_else(|| {
                HarnessError::command(&name, &settings.dialect.listen, "expected a string")
            })?;
            Ok::<_, HarnessError>((id, listen))
        }
        .await;

        let (id, listen) = match identity {
            Ok(v) => v,
            Err(e) => {
                stop_after_failure(&name, deployed.lifecycle.as_mut()).await;
                return Err(HarnessError::deployment(&name, e));
            }
        };

        tracing::info!(
            node = name.as_str(),
            instance_id = id,
            listen = listen.as_str(),
            "node ready"
        );

        Ok(NodeHandle {
            info: NodeInfo {
                id,
                name,
                listen,
                admin_url: deployed.admin_url,
                role: spec.role,
            },
            state: NodeState::Running,
            spec,
            client,
            dialect: settings.dialect.clone(),
            lifecycle: deployed.lifecycle,
        })
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn id(&self) -> InstanceId {
        self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn listen(&self) -> &str {
        &self.info.listen
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    pub async fn execute(&self, command: &str) -> Result<Value> {
        self.client.execute(command).await
    }

    pub async fn eval(&self, expr: &str, args: Vec<Value>) -> Result<Value> {
        self.client.eval(expr, args).await
    }

    /// This node's clock entry for instance `id`; `None` while undefined.
    pub async fn clock_entry(&self, id: InstanceId) -> Result<Option<Lsn>> {
        let cmd = self.dialect.render(&self.dialect.clock_entry, &[("id", id.to_string())]);
        let value = self.execute(&cmd).await?;
        if value.is_null() {
            return Ok(None);
        }
        value
            .as_u64()
            .map(Some)
            .ok_or_else(|| HarnessError::command(self.name(), &cmd, format!("expected an lsn, got {value}")))
    }

    pub async fn own_lsn(&self) -> Result<Lsn> {
        self.read_u64(&self.dialect.own_lsn).await
    }

    pub async fn dataset_size(&self) -> Result<u64> {
        let cmd = self.dialect.render(&self.dialect.dataset_size, &[]);
        self.read_u64(&cmd).await
    }

    pub async fn dataset_records(&self) -> Result<Vec<Record>> {
        let cmd = self.dialect.render(&self.dialect.dataset_dump, &[]);
        let value = self.execute(&cmd).await?;
        let pairs: Vec<(u64, InstanceId)> = serde_json::from_value(value)
            .map_err(|e| HarnessError::command(self.name(), &cmd, format!("expected [row, origin] pairs: {e}")))?;
        Ok(pairs
            .into_iter()
            .map(|(row, origin)| Record { row, origin })
            .collect())
    }

    pub async fn insert(&self, record: Record) -> Result<()> {
        let cmd = self.dialect.render(
            &self.dialect.insert,
            &[
                ("row", record.row.to_string()),
                ("origin", record.origin.to_string()),
            ],
        );
        self.execute(&cmd).await.map(|_| ())
    }

    pub async fn set_replication_sources(&self, sources: &[String]) -> Result<()> {
        let expr = self.dialect.render(&self.dialect.set_sources, &[]);
        self.eval(&expr, vec![serde_json::json!(sources)])
            .await
            .map(|_| ())
    }

    /// Stop the node. Stopping a stopped node is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        if matches!(self.state, NodeState::Stopped | NodeState::StoppedAgain) {
            return Ok(());
        }
        match self.lifecycle.stop().await {
            Ok(()) => {
                self.state = NodeState::StoppedAgain;
                tracing::info!(node = self.name(), "node stopped");
                Ok(())
            }
            Err(reason) => {
                self.state = NodeState::Failed;
                tracing::warn!(node = self.name(), reason = reason.as_str(), "stop failed");
                Err(HarnessError::Shutdown {
                    failures: vec![ShutdownFailure {
                        node: self.info.name.clone(),
                        reason,
                    }],
                })
            }
        }
    }

    async fn read_u64(&self, cmd: &str) -> Result<u64> {
        let value = self.execute(cmd).await?;
        value
            .as_u64()
            .ok_or_else(|| HarnessError::command(self.name(), cmd, format!("expected an integer, got {value}")))
    }
}

async fn read_id(client: &AdminClient, node: &str, cmd: &str) -> Result<InstanceId> {
    let value = client.execute(cmd).await?;
    value
        .as_u64()
        .and_then(|v| InstanceId::try_from(v).ok())
        .ok_or_else(|| HarnessError::command(node, cmd, format!("expected an instance id, got {value}")))
}

async fn stop_after_failure(name: &str, lifecycle: &mut dyn Lifecycle) {
    if let Err(e) = lifecycle.stop().await {
        tracing::warn!(node = name, error = e.as_str(), "stop after failed deploy");
    }
}
