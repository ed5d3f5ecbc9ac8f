//! meshcheck-sim -- run one simulated replicated node.
//!
//! Usage:
//!   meshcheck-sim --data-dir /tmp/m                       # master
//!   meshcheck-sim --data-dir /tmp/r1 --bootstrap HOST:PORT # replica

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use meshcheck_sim::{spawn, SimConfig};

#[derive(Parser)]
#[command(name = "meshcheck-sim", about = "Simulated multi-master node for meshcheck")]
struct Cli {
    /// Instance name (used in logs and registration)
    #[arg(long, default_value = "node")]
    name: String,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:3301")]
    listen: String,

    /// Directory holding the node database
    #[arg(long)]
    data_dir: PathBuf,

    /// Master to bootstrap from (host:port); omit to start a master
    #[arg(long)]
    bootstrap: Option<String>,

    /// Require this bearer token on every request
    #[arg(long)]
    token: Option<String>,

    /// Interval between replication pulls, in milliseconds
    #[arg(long, default_value_t = meshcheck_protocol::PULL_INTERVAL_MS)]
    pull_interval_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshcheck_sim=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = SimConfig {
        name: cli.name,
        listen: cli.listen,
        data_dir: cli.data_dir,
        bootstrap: cli.bootstrap,
        bearer_token: cli.token,
        pull_interval: Duration::from_millis(cli.pull_interval_ms),
    };

    let node = spawn(config).await?;
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    node.shutdown().await;
    Ok(())
}
