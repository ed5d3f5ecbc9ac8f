//! meshcheck -- run the replica-convergence check.
//!
//! Usage:
//!   meshcheck                                   # 3 in-process nodes, 60 rows
//!   meshcheck --backend process --config m.toml # external node binaries
//!   meshcheck --nodes 5 --rows 101 --content digest --report run.json

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;

use meshcheck::config::HarnessConfig;
use meshcheck::deploy::Deployer;
use meshcheck::{ContentCheck, Harness, ProcessDeployer, RemainderPolicy, SimDeployer};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    /// Spawn `[process] program` once per node
    Process,
    /// Run simulator nodes inside this process
    Sim,
}

#[derive(Parser)]
#[command(name = "meshcheck", about = "Replica-convergence test harness")]
struct Cli {
    /// Path to config file (defaults apply when it does not exist)
    #[arg(short, long, default_value = "meshcheck.toml")]
    config: PathBuf,

    /// Number of nodes, master included
    #[arg(long)]
    nodes: Option<usize>,

    /// Rows written by the workload
    #[arg(long)]
    rows: Option<u64>,

    /// Timeout for every blocking wait, in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    #[arg(long, value_enum, default_value_t = Backend::Sim)]
    backend: Backend,

    /// Content check after clock synchronisation
    #[arg(long, value_enum)]
    content: Option<ContentCheck>,

    /// Placement of rows left over after whole rounds
    #[arg(long, value_enum)]
    remainder: Option<RemainderPolicy>,

    /// Write the run report as JSON to this path
    #[arg(long)]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshcheck=info,meshcheck_sim=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = match HarnessConfig::load_or_default(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    if let Some(n) = cli.nodes {
        cfg.cluster.nodes = n;
    }
    if let Some(r) = cli.rows {
        cfg.cluster.rows = r;
    }
    if let Some(t) = cli.timeout_secs {
        cfg.timeouts.set_all(t);
    }
    if let Some(c) = cli.content {
        cfg.verify.content = c;
    }
    if let Some(r) = cli.remainder {
        cfg.cluster.remainder = r;
    }

    let deployer: Box<dyn Deployer> = match cli.backend {
        Backend::Process => Box::new(ProcessDeployer::new(cfg.process.clone())),
        Backend::Sim => Box::new(SimDeployer::new().with_token(cfg.cluster.bearer_token.clone())),
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, cleaning up");
                cancel.cancel();
            }
        });
    }

    let outcome = Harness::new(cfg, deployer.as_ref()).run(&cancel).await;
    let report = outcome.report;

    if let Some(mut master) = outcome.master {
        tracing::info!(node = master.name(), listen = master.listen(), "stopping reset master");
        if let Err(e) = master.stop().await {
            tracing::warn!(error = %e, "reset master did not stop cleanly");
        }
    }
    // process::exit skips destructors.
    drop(outcome.scratch);

    for (name, ok) in report.node_status() {
        println!("server {} is {}", name, if ok { "ok" } else { "not ok" });
    }
    if let Some(failure) = &report.failure {
        eprintln!("[{}] {}", failure.phase, failure.message);
    }
    for f in &report.cleanup.failures {
        eprintln!("cleanup: {f}");
    }

    if let Some(path) = &cli.report {
        std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
        tracing::info!(path = %path.display(), "report written");
    }

    std::process::exit(report.exit_code);
}
