//! Full-mesh topology: every node replicates from every other node.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::cluster::Cluster;
use crate::error::{HarnessError, Phase, Result};
use crate::poll::{wait_for, PollSettings, WaitError};

#[derive(Debug, Clone, Default, Serialize)]
pub struct MeshReport {
    pub sources: Vec<String>,
    /// Ordered pairs that reported a defined clock entry.
    pub links: usize,
    /// Per node: clock entry for the master minus the bootstrap baseline.
    pub vclock_diff: BTreeMap<String, i64>,
}

/// Push the full source list to every node, then wait until every ordered
/// pair (A, B), A != B, has a clock entry for B on A.
pub async fn configure(
    cluster: &Cluster,
    poll: &PollSettings,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<MeshReport> {
    let sources: Vec<String> = cluster.nodes().iter().map(|n| n.listen().to_string()).collect();

    for node in cluster.nodes() {
        node.set_replication_sources(&sources).await?;
        tracing::debug!(node = node.name(), sources = sources.len(), "replication sources set");
    }

    let mut links = 0;
    for a in cluster.nodes() {
        for b in cluster.nodes() {
            if a.id() == b.id() {
                continue;
            }
            let peer = b.id();
            let waited = wait_for(poll, timeout, cancel, move || async move {
                Ok::<_, HarnessError>(a.clock_entry(peer).await?.map(|_| ()))
            })
            .await;
            match waited {
                Ok(()) => links += 1,
                Err(WaitError::Cancelled) => {
                    return Err(HarnessError::Cancelled { phase: Phase::Mesh });
                }
                Err(WaitError::Timeout { waited, last_error }) => {
                    tracing::error!(
                        node = a.name(),
                        peer,
                        last_error = last_error.as_deref().unwrap_or(""),
                        "mesh link not established"
                    );
                    return Err(HarnessError::MeshTimeout {
                        node: a.name().to_string(),
                        peer,
                        waited,
                    });
                }
            }
        }
    }

    let master_id = cluster.master().id();
    let mut vclock_diff = BTreeMap::new();
    for node in cluster.nodes() {
        let entry = node.clock_entry(master_id).await?.unwrap_or(0);
        let diff = entry as i64 - cluster.baseline() as i64;
        tracing::info!(node = node.name(), vclock_diff = diff, "mesh established");
        vclock_diff.insert(node.name().to_string(), diff);
    }

    Ok(MeshReport {
        sources,
        links,
        vclock_diff,
    })
}
