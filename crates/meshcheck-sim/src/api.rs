//! HTTP API -- admin/eval channels plus the replication routes.
//!
//! All routes are POST with JSON bodies. When a bearer token is configured
//! every route requires it, peers included.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Router,
};
use meshcheck_protocol::{
    AdminRequest, EvalRequest, JoinRequest, JoinResponse, PullRequest, PullResponse, Reply,
    ADMIN_PATH, EVAL_PATH, JOIN_PATH, MAX_PULL_BATCH, PULL_PATH, STATUS_PATH,
};
use tokio::sync::RwLock;

use crate::command::{self, Command};
use crate::store::SqliteStore;

/// Replication counters -- shared between the replication loop and the API.
pub struct ReplicationStats {
    /// Pull rounds that returned successfully.
    pub pulls: AtomicU64,
    /// Pulls that failed (unreachable source, bad reply).
    pub pull_errors: AtomicU64,
    /// Remote entries applied.
    pub entries_applied: AtomicU64,
    /// Remote entries skipped as already applied.
    pub entries_skipped: AtomicU64,
    /// Pull requests served to peers.
    pub pulls_served: AtomicU64,
    /// Pulls after which the local clock covered the source's clock.
    pub caught_up: AtomicU64,
}

impl ReplicationStats {
    pub fn new() -> Self {
        Self {
            pulls: AtomicU64::new(0),
            pull_errors: AtomicU64::new(0),
            entries_applied: AtomicU64::new(0),
            entries_skipped: AtomicU64::new(0),
            pulls_served: AtomicU64::new(0),
            caught_up: AtomicU64::new(0),
        }
    }
}

impl Default for ReplicationStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state for all handlers and the replication loop.
pub struct AppState {
    pub store: SqliteStore,
    pub name: String,
    pub listen: String,
    pub bearer_token: Option<String>,
    /// Replication sources (listen addresses) set through `cfg.replication`.
    pub sources: RwLock<Vec<String>>,
    /// A frozen node neither pulls nor serves pulls.
    pub frozen: AtomicBool,
    pub start_time: std::time::Instant,
    pub stats: ReplicationStats,
}

impl AppState {
    pub fn new(
        store: SqliteStore,
        name: String,
        listen: String,
        bearer_token: Option<String>,
    ) -> Self {
        Self {
            store,
            name,
            listen,
            bearer_token,
            sources: RwLock::new(Vec::new()),
            frozen: AtomicBool::new(false),
            start_time: std::time::Instant::now(),
            stats: ReplicationStats::new(),
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Relaxed)
    }
}

/// Build the axum router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(ADMIN_PATH, post(admin))
        .route(EVAL_PATH, post(eval))
        .route(JOIN_PATH, post(join))
        .route(PULL_PATH, post(pull))
        .route(STATUS_PATH, post(status))
        .with_state(state)
}

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, &'static str)> {
    let Some(token) = &state.bearer_token else {
        return Ok(());
    };
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if auth != format!("Bearer {token}") {
        return Err((StatusCode::UNAUTHORIZED, "invalid bearer token"));
    }
    Ok(())
}

async fn admin(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<AdminRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let reply = match req.command.parse::<Command>() {
        Ok(cmd) => match command::execute(&state, cmd).await {
            Ok(value) => Reply::ok(value),
            Err(e) => Reply::err(e.to_string()),
        },
        Err(e) => Reply::err(e.to_string()),
    };
    if !reply.ok {
        tracing::debug!(
            node = state.name.as_str(),
            command = req.command.as_str(),
            error = reply.error.as_deref().unwrap_or(""),
            "admin: command failed"
        );
    }
    Json(reply).into_response()
}

async fn eval(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<EvalRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let reply = match command::eval(&state, &req.expr, &req.args).await {
        Ok(value) => Reply::ok(value),
        Err(e) => Reply::err(e.to_string()),
    };
    Json(reply).into_response()
}

async fn join(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<JoinRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    match state.store.register_replica(&req.name) {
        Ok((instance_id, master_id, snapshot)) => {
            tracing::info!(
                node = state.name.as_str(),
                replica = req.name.as_str(),
                instance_id,
                "join: registered replica"
            );
            Json(JoinResponse {
                instance_id,
                master_id,
                snapshot,
            })
            .into_response()
        }
        Err(e) => (StatusCode::CONFLICT, e.to_string()).into_response(),
    }
}

async fn pull(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<PullRequest>,
) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }
    if state.is_frozen() {
        return (StatusCode::SERVICE_UNAVAILABLE, "node is frozen").into_response();
    }

    let own = match state.store.instance_id() {
        Ok(Some(id)) => id,
        Ok(None) => {
            return (StatusCode::SERVICE_UNAVAILABLE, "node not bootstrapped").into_response()
        }
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    tracing::trace!(
        node = state.name.as_str(),
        peer = req.instance_id,
        "pull: serving"
    );

    let limit = req.limit.clamp(1, MAX_PULL_BATCH);
    let (entries, has_more) = match state.store.entries_since(&req.vclock, limit) {
        Ok(page) => page,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let vclock = match state.store.vclock() {
        Ok(v) => v,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    state.stats.pulls_served.fetch_add(1, Ordering::Relaxed);

    Json(PullResponse {
        instance_id: own,
        vclock,
        entries,
        has_more,
    })
    .into_response()
}

async fn status(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let vclock = state.store.vclock().unwrap_or_default();
    let instance_id = state.store.instance_id().ok().flatten();
    let sources = state.sources.read().await.clone();
    let stats = &state.stats;

    Json(serde_json::json!({
        "name": state.name,
        "instance_id": instance_id,
        "listen": state.listen,
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "frozen": state.is_frozen(),
        "vclock": vclock,
        "sources": sources,
        "replication": {
            "pulls": stats.pulls.load(Ordering::Relaxed),
            "pull_errors": stats.pull_errors.load(Ordering::Relaxed),
            "entries_applied": stats.entries_applied.load(Ordering::Relaxed),
            "entries_skipped": stats.entries_skipped.load(Ordering::Relaxed),
            "pulls_served": stats.pulls_served.load(Ordering::Relaxed),
            "caught_up": stats.caught_up.load(Ordering::Relaxed),
        },
    }))
    .into_response()
}
