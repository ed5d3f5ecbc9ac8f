//! meshcheck protocol -- wire types for the admin, eval and replication channels.
//!
//! HTTP POST with JSON bodies. Every admin/eval call answers with a [`Reply`].
//! Replication calls (join, pull) carry typed request/response pairs.

pub mod messages;
pub mod vclock;

pub use messages::*;
pub use vclock::VClock;

/// Instance identifier assigned by the replicated system (1-based).
pub type InstanceId = u32;

/// Log sequence number: per-origin write counter.
pub type Lsn = u64;

/// Admin command route.
pub const ADMIN_PATH: &str = "/api/v1/admin";

/// Remote evaluation route.
pub const EVAL_PATH: &str = "/api/v1/eval";

/// Replica bootstrap route (served by the master).
pub const JOIN_PATH: &str = "/api/v1/replication/join";

/// Log shipping route (served by every node).
pub const PULL_PATH: &str = "/api/v1/replication/pull";

/// Node diagnostics route.
pub const STATUS_PATH: &str = "/api/v1/status";

/// Maximum log entries returned by a single pull.
pub const MAX_PULL_BATCH: u32 = 512;

/// Default interval between replication pulls, in milliseconds.
pub const PULL_INTERVAL_MS: u64 = 20;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("remote error: {0}")]
    Remote(String),
    #[error("malformed reply: {0}")]
    Malformed(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
