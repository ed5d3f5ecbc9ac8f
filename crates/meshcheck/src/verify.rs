//! Convergence verification: clock synchronisation on every ordered pair,
//! then a per-node content check.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use meshcheck_protocol::{InstanceId, Lsn, Record};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cluster::Cluster;
use crate::error::{HarnessError, PairLag, Phase, Result, RunFailure};
use crate::node::NodeHandle;
use crate::poll::{wait_for, PollSettings, WaitError};
use crate::workload::ExpectedDataset;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ContentCheck {
    /// Row count only.
    #[default]
    Size,
    /// SHA-256 over the sorted records.
    Digest,
}

/// Hex SHA-256 of `records` in the given order, one `row:origin` line each.
pub fn dataset_digest(records: &[Record]) -> String {
    let mut hasher = Sha256::new();
    for r in records {
        hasher.update(format!("{}:{}\n", r.row, r.origin).as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeVerdict {
    pub name: String,
    pub id: InstanceId,
    /// Pairs (this node, peer) whose clock entry never caught up.
    pub lags: Vec<PairLag>,
    pub size: Option<u64>,
    pub digest: Option<String>,
    pub missing: u64,
    pub unexpected: u64,
    /// Content did not match, or could not be read.
    pub content_error: Option<String>,
}

impl NodeVerdict {
    fn new(node: &NodeHandle) -> Self {
        Self {
            name: node.name().to_string(),
            id: node.id(),
            lags: Vec::new(),
            size: None,
            digest: None,
            missing: 0,
            unexpected: 0,
            content_error: None,
        }
    }

    pub fn passed(&self) -> bool {
        self.lags.is_empty() && self.content_error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConvergenceReport {
    pub check: ContentCheck,
    pub expected_rows: u64,
    pub expected_digest: Option<String>,
    /// Target lsn per instance, read from the instance itself.
    pub targets: BTreeMap<InstanceId, Lsn>,
    pub verdicts: Vec<NodeVerdict>,
    pub clock_wait_ms: u64,
    #[serde(skip)]
    longest_wait: Duration,
}

impl ConvergenceReport {
    pub fn passed(&self) -> bool {
        self.verdicts.iter().all(NodeVerdict::passed)
    }

    /// Clock lags take precedence over content mismatches.
    pub fn failure(&self) -> Option<RunFailure> {
        let pairs: Vec<PairLag> = self
            .verdicts
            .iter()
            .flat_map(|v| v.lags.iter().cloned())
            .collect();
        if !pairs.is_empty() {
            return Some(RunFailure::new(
                Phase::Convergence,
                HarnessError::ConvergenceTimeout {
                    pairs,
                    waited: self.longest_wait,
                },
            ));
        }

        let bad: Vec<&NodeVerdict> = self
            .verdicts
            .iter()
            .filter(|v| v.content_error.is_some())
            .collect();
        if bad.is_empty() {
            return None;
        }
        let detail = bad
            .iter()
            .map(|v| format!("{}: {}", v.name, v.content_error.as_deref().unwrap_or("")))
            .collect::<Vec<_>>()
            .join("; ");
        Some(RunFailure::new(
            Phase::Content,
            HarnessError::ContentMismatch {
                nodes: bad.iter().map(|v| v.name.clone()).collect(),
                detail,
            },
        ))
    }
}

pub struct Verifier {
    poll: PollSettings,
    timeout: Duration,
    check: ContentCheck,
}

impl Verifier {
    pub fn new(poll: PollSettings, timeout: Duration, check: ContentCheck) -> Self {
        Self {
            poll,
            timeout,
            check,
        }
    }

    /// Check every node. Only cancellation is returned as an error; every
    /// other problem lands in the node's verdict.
    pub async fn verify(
        &self,
        cluster: &Cluster,
        expected: &ExpectedDataset,
        cancel: &CancellationToken,
    ) -> Result<ConvergenceReport> {
        let nodes = cluster.nodes();
        let mut verdicts: Vec<NodeVerdict> = nodes.iter().map(NodeVerdict::new).collect();

        let mut targets = BTreeMap::new();
        for (i, b) in nodes.iter().enumerate() {
            match b.own_lsn().await {
                Ok(lsn) => {
                    targets.insert(b.id(), lsn);
                }
                Err(e) => {
                    verdicts[i].content_error = Some(format!("own lsn unreadable: {e}"));
                }
            }
        }

        let started = Instant::now();
        let mut longest_wait = Duration::ZERO;
        for (i, a) in nodes.iter().enumerate() {
            for (&peer, &target) in &targets {
                let waited = wait_for(&self.poll, self.timeout, cancel, move || async move {
                    let entry = a.clock_entry(peer).await?;
                    Ok::<_, HarnessError>(entry.filter(|lsn| *lsn >= target))
                })
                .await;
                match waited {
                    Ok(_) => {}
                    Err(WaitError::Cancelled) => {
                        return Err(HarnessError::Cancelled {
                            phase: Phase::Convergence,
                        })
                    }
                    Err(WaitError::Timeout { waited, last_error }) => {
                        longest_wait = longest_wait.max(waited);
                        let reached = a.clock_entry(peer).await.ok().flatten();
                        let lag = PairLag {
                            node: a.name().to_string(),
                            peer,
                            target,
                            reached,
                        };
                        tracing::warn!(
                            node = a.name(),
                            peer,
                            target,
                            reached = ?reached,
                            last_error = last_error.as_deref().unwrap_or(""),
                            "clock entry did not catch up"
                        );
                        verdicts[i].lags.push(lag);
                    }
                }
            }
        }
        let clock_wait = started.elapsed();

        let expected_digest = match self.check {
            ContentCheck::Size => None,
            ContentCheck::Digest => Some(expected.digest()),
        };
        for (node, verdict) in nodes.iter().zip(verdicts.iter_mut()) {
            if verdict.content_error.is_some() {
                continue;
            }
            match self.check {
                ContentCheck::Size => check_size(node, expected, verdict).await,
                ContentCheck::Digest => check_digest(node, expected, verdict).await,
            }
            if verdict.passed() {
                tracing::info!(node = node.name(), "node converged");
            }
        }

        Ok(ConvergenceReport {
            check: self.check,
            expected_rows: expected.len(),
            expected_digest,
            targets,
            verdicts,
            clock_wait_ms: clock_wait.as_millis() as u64,
            longest_wait,
        })
    }
}

async fn check_size(node: &NodeHandle, expected: &ExpectedDataset, verdict: &mut NodeVerdict) {
    match node.dataset_size().await {
        Ok(size) => {
            verdict.size = Some(size);
            if size != expected.len() {
                verdict.content_error = Some(format!("has {size} rows, expected {}", expected.len()));
            }
        }
        Err(e) => verdict.content_error = Some(e.to_string()),
    }
}

async fn check_digest(node: &NodeHandle, expected: &ExpectedDataset, verdict: &mut NodeVerdict) {
    let mut actual = match node.dataset_records().await {
        Ok(records) => records,
        Err(e) => {
            verdict.content_error = Some(e.to_string());
            return;
        }
    };
    actual.sort();
    verdict.size = Some(actual.len() as u64);
    let digest = dataset_digest(&actual);

    if digest != expected.digest() {
        let want: BTreeSet<&Record> = expected.records().iter().collect();
        let have: BTreeSet<&Record> = actual.iter().collect();
        let missing = want.difference(&have).count() as u64;
        let matched = expected.len() - missing;
        verdict.missing = missing;
        verdict.unexpected = actual.len() as u64 - matched;
        verdict.content_error = Some(format!(
            "digest {} differs: {} missing, {} unexpected",
            &digest[..12],
            verdict.missing,
            verdict.unexpected
        ));
    }
    verdict.digest = Some(digest);
}
