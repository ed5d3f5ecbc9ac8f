//! Request/response types for every route.

use serde::{Deserialize, Serialize};

use crate::{InstanceId, Lsn, ProtocolError, VClock};

// ============================================================================
// Admin / eval
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminRequest {
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalRequest {
    pub expr: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

/// Structured reply shared by the admin and eval channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    pub fn ok(result: serde_json::Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(message.into()),
        }
    }

    /// Success yields the result (`null` when absent).
    pub fn into_result(self) -> Result<serde_json::Value, ProtocolError> {
        if self.ok {
            Ok(self.result.unwrap_or(serde_json::Value::Null))
        } else {
            Err(ProtocolError::Remote(
                self.error.unwrap_or_else(|| "unspecified error".into()),
            ))
        }
    }
}

// ============================================================================
// Data
// ============================================================================

/// One workload row: key plus the instance it was written on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Record {
    pub row: u64,
    pub origin: InstanceId,
}

/// A replicated operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    /// A replica joined the cluster and received an instance id.
    Register { instance_id: InstanceId, name: String },
    CreateSpace { space: String },
    Insert { space: String, record: Record },
}

/// A write-ahead log entry, identified by (origin, lsn).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub origin: InstanceId,
    pub lsn: Lsn,
    pub op: Op,
}

// ============================================================================
// Bootstrap
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub name: String,
}

/// Full state of the bootstrap source at join time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub vclock: VClock,
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub instance_id: InstanceId,
    pub master_id: InstanceId,
    pub snapshot: Snapshot,
}

// ============================================================================
// Log shipping
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub instance_id: InstanceId,
    pub vclock: VClock,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    /// Id of the node that served the pull.
    pub instance_id: InstanceId,
    pub vclock: VClock,
    pub entries: Vec<LogEntry>,
    pub has_more: bool,
}
