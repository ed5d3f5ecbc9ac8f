//! meshcheck-sim -- a small multi-master replicated node.
//!
//! Serves the admin/eval channels the harness drives, plus the join/pull
//! routes its peers replicate through. Each node keeps its state in SQLite
//! under its data dir and pulls log entries from every configured source.

pub mod api;
pub mod command;
pub mod replication;
pub mod store;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

pub use api::{AppState, ReplicationStats};
pub use store::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Command(String),
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),
    #[error("instance has no id yet")]
    NotBootstrapped,
    #[error("lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, SimError>;

/// Startup parameters for one node.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub name: String,
    /// Bind address; port 0 picks an ephemeral port.
    pub listen: String,
    pub data_dir: PathBuf,
    /// Listen address of the node to bootstrap from. `None` starts a master.
    pub bootstrap: Option<String>,
    pub bearer_token: Option<String>,
    pub pull_interval: Duration,
}

impl SimConfig {
    pub fn new(name: &str, data_dir: PathBuf) -> Self {
        Self {
            name: name.into(),
            listen: "127.0.0.1:0".into(),
            data_dir,
            bootstrap: None,
            bearer_token: None,
            pull_interval: Duration::from_millis(meshcheck_protocol::PULL_INTERVAL_MS),
        }
    }
}

/// A node running inside the current tokio runtime.
pub struct RunningNode {
    pub name: String,
    /// Actual bound address (`host:port`).
    pub listen: String,
    pub state: Arc<AppState>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl RunningNode {
    pub fn admin_url(&self) -> String {
        format!("http://{}", self.listen)
    }

    /// Stop the API server and the replication loop.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for mut handle in self.handles {
            if tokio::time::timeout(Duration::from_secs(5), &mut handle)
                .await
                .is_err()
            {
                tracing::warn!(node = self.name.as_str(), "task did not stop in time, aborting");
                handle.abort();
            }
        }
        tracing::info!(node = self.name.as_str(), "node stopped");
    }

    /// True once the server or the replication loop has ended.
    pub fn is_finished(&self) -> bool {
        self.handles.iter().any(|h| h.is_finished())
    }

    /// Kill the node's tasks without a graceful shutdown.
    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Open storage, bootstrap if needed, then start the API server and the
/// replication loop.
pub async fn spawn(config: SimConfig) -> Result<RunningNode> {
    std::fs::create_dir_all(&config.data_dir)?;
    let store = SqliteStore::open(&config.data_dir.join("node.db"))?;

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    let listen = listener.local_addr()?.to_string();

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;

    let instance_id = match (store.instance_id()?, &config.bootstrap) {
        (Some(id), _) => {
            tracing::info!(node = config.name.as_str(), instance_id = id, "resuming");
            id
        }
        (None, None) => store.init_master(&config.name)?,
        (None, Some(source)) => {
            let joined = replication::join(
                &client,
                source,
                &config.name,
                config.bearer_token.as_deref(),
            )
            .await?;
            store.bootstrap(joined.instance_id, joined.master_id, &joined.snapshot)?;
            tracing::info!(
                node = config.name.as_str(),
                instance_id = joined.instance_id,
                source = source.as_str(),
                vclock = %joined.snapshot.vclock,
                "bootstrapped from master"
            );
            joined.instance_id
        }
    };

    let state = Arc::new(AppState::new(
        store,
        config.name.clone(),
        listen.clone(),
        config.bearer_token.clone(),
    ));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut handles = Vec::new();

    // API server
    {
        let router = api::router(state.clone());
        let mut shutdown = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.recv().await;
                })
                .await
                .ok();
        }));
    }

    // Replication loop
    {
        let state = state.clone();
        let shutdown = shutdown_tx.subscribe();
        let interval = config.pull_interval;
        handles.push(tokio::spawn(async move {
            replication::run_replication_loop(state, client, interval, shutdown).await;
        }));
    }

    tracing::info!(
        node = config.name.as_str(),
        instance_id,
        listen = listen.as_str(),
        "node started"
    );

    Ok(RunningNode {
        name: config.name,
        listen,
        state,
        shutdown_tx,
        handles,
    })
}
