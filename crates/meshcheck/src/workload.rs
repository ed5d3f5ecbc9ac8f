//! Round-robin write workload.

use std::time::Duration;

use meshcheck_protocol::{InstanceId, Record};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cluster::Cluster;
use crate::dialect::Dialect;
use crate::error::{HarnessError, PairLag, Phase, Result};
use crate::poll::{wait_for, PollSettings, WaitError};
use crate::verify::dataset_digest;

/// Where rows go when the row count is not a multiple of the node count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RemainderPolicy {
    /// Round-robin over whole rounds; leftover rows all go to the first node.
    #[default]
    FirstNode,
    /// Plain `row mod N`.
    RoundRobin,
}

/// Target node index for every row.
pub fn plan_targets(rows: u64, nodes: usize, policy: RemainderPolicy) -> Vec<usize> {
    if nodes == 0 {
        return Vec::new();
    }
    let n = nodes as u64;
    let full = rows / n * n;
    (0..rows)
        .map(|i| match policy {
            RemainderPolicy::FirstNode if i >= full => 0,
            _ => (i % n) as usize,
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeWrites {
    pub name: String,
    pub id: InstanceId,
    pub writes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkloadSummary {
    pub per_node: Vec<NodeWrites>,
    pub total: u64,
    pub remainder: u64,
}

/// The records every node must hold once replication has caught up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedDataset {
    records: Vec<Record>,
}

impl ExpectedDataset {
    pub fn new(mut records: Vec<Record>) -> Self {
        records.sort();
        Self { records }
    }

    pub fn len(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sorted.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn digest(&self) -> String {
        dataset_digest(&self.records)
    }
}

/// Run the schema setup on the master and wait until every node has
/// replicated it.
pub async fn prepare_schema(
    cluster: &Cluster,
    dialect: &Dialect,
    poll: &PollSettings,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let master = cluster.master();
    for template in &dialect.schema_setup {
        let cmd = dialect.render(template, &[]);
        master.execute(&cmd).await?;
        tracing::info!(node = master.name(), command = cmd.as_str(), "schema setup");
    }

    let master_id = master.id();
    let target = master.own_lsn().await?;
    for node in cluster.nodes() {
        let waited = wait_for(poll, timeout, cancel, move || async move {
            let entry = node.clock_entry(master_id).await?;
            Ok::<_, HarnessError>(entry.filter(|lsn| *lsn >= target).map(|_| ()))
        })
        .await;
        match waited {
            Ok(()) => {}
            Err(WaitError::Cancelled) => {
                return Err(HarnessError::Cancelled {
                    phase: Phase::Workload,
                })
            }
            Err(WaitError::Timeout { waited, .. }) => {
                let reached = node.clock_entry(master_id).await.ok().flatten();
                return Err(HarnessError::ConvergenceTimeout {
                    pairs: vec![PairLag {
                        node: node.name().to_string(),
                        peer: master_id,
                        target,
                        reached,
                    }],
                    waited,
                });
            }
        }
    }
    tracing::debug!(target, "schema replicated to every node");
    Ok(())
}

/// Insert `rows` records, each on its planned target, one after another.
pub async fn drive(
    cluster: &Cluster,
    rows: u64,
    policy: RemainderPolicy,
    cancel: &CancellationToken,
) -> Result<(WorkloadSummary, ExpectedDataset)> {
    let nodes = cluster.nodes();
    let remainder = rows % nodes.len() as u64;
    if remainder != 0 {
        tracing::warn!(
            rows,
            nodes = nodes.len(),
            remainder,
            policy = ?policy,
            "row count is not a multiple of the node count"
        );
    }

    let plan = plan_targets(rows, nodes.len(), policy);
    let mut writes = vec![0u64; nodes.len()];
    let mut expected = Vec::with_capacity(plan.len());

    for (row, &target) in plan.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(HarnessError::Cancelled {
                phase: Phase::Workload,
            });
        }
        let node = &nodes[target];
        let record = Record {
            row: row as u64,
            origin: node.id(),
        };
        node.insert(record).await?;
        writes[target] += 1;
        expected.push(record);
    }

    let per_node: Vec<NodeWrites> = nodes
        .iter()
        .zip(&writes)
        .map(|(n, &w)| NodeWrites {
            name: n.name().to_string(),
            id: n.id(),
            writes: w,
        })
        .collect();
    for w in &per_node {
        tracing::info!(node = w.name.as_str(), writes = w.writes, "workload written");
    }

    Ok((
        WorkloadSummary {
            per_node,
            total: rows,
            remainder,
        },
        ExpectedDataset::new(expected),
    ))
}
