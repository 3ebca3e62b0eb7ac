//! pybs — entry point.
//!
//! `pybs daemon` runs the per-node scheduler; the remaining subcommands are
//! thin JSON-RPC clients talking to a daemon on loopback. Results go to
//! stdout as JSON, one object per line; tracing logs go to stderr.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pybs::client::RpcClient;
use pybs::config::{DEFAULT_PORT, Settings};
use pybs::daemon::Daemon;
use pybs::dispatcher;
use pybs::jobstore::JobStore;
use pybs::rpc::RpcServer;
use pybs::store_memory::MemoryStore;
use pybs::store_postgres::PostgresStore;

#[derive(Debug, Parser)]
#[command(name = "pybs")]
#[command(about = "Small batch system with per-node daemons", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// RPC port of the daemon to talk to.
    #[arg(long, global = true, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the per-node daemon.
    Daemon {
        /// Path to the TOML config file.
        #[arg(long)]
        config: Option<String>,
    },

    /// Submit a script to the queue.
    Submit {
        /// Script file with a `#PBS` header.
        filename: String,
    },

    /// List jobs; running jobs by default.
    List {
        /// List waiting jobs instead.
        #[arg(long, conflicts_with = "finished")]
        waiting: bool,

        /// List finished jobs instead.
        #[arg(long)]
        finished: bool,

        /// Maximum number of finished jobs to show.
        #[arg(long, default_value = "5")]
        limit: i64,
    },

    /// Remove a job; a running job is killed.
    Remove { job_id: i64 },

    /// Start a waiting job now, ignoring capacity.
    Run { job_id: i64 },

    /// Show (used, total) CPUs on the node.
    Cpus,

    /// Show the daemon's runtime configuration.
    Config,

    /// Change a runtime parameter; accepted keys: ncpus.
    Setconfig { key: String, value: String },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    // Logs always go to stderr so stdout remains JSON-only.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Daemon { config } => run_daemon(config.as_deref()).await,

        Command::Submit { filename } => {
            let path = std::fs::canonicalize(&filename)
                .with_context(|| format!("resolve script path {filename}"))?;
            let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
            client_call(
                cli.port,
                "submit",
                json!({ "filename": path, "user": user }),
            )
            .await
        }

        Command::List {
            waiting,
            finished,
            limit,
        } => {
            if waiting {
                client_call(cli.port, "list_waiting", json!({})).await
            } else if finished {
                client_call(cli.port, "list_finished", json!({ "limit": limit })).await
            } else {
                client_call(cli.port, "list_running", json!({})).await
            }
        }

        Command::Remove { job_id } => {
            client_call(cli.port, "remove", json!({ "job_id": job_id })).await
        }

        Command::Run { job_id } => client_call(cli.port, "run", json!({ "job_id": job_id })).await,

        Command::Cpus => client_call(cli.port, "get_cpus", json!({})).await,

        Command::Config => client_call(cli.port, "config", json!({})).await,

        Command::Setconfig { key, value } => {
            // Numbers travel as numbers; anything else as a string.
            let value = value
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::from(value));
            client_call(
                cli.port,
                "setconfig",
                json!({ "key": key, "value": value }),
            )
            .await
        }
    }
}

/// Run one RPC call and print its result as a single JSON line.
async fn client_call(port: u16, method: &str, params: Value) -> Result<()> {
    let mut client = RpcClient::new(port);
    let result = client.call(method, params).await?;
    println!("{result}");
    Ok(())
}

async fn run_daemon(config: Option<&str>) -> Result<()> {
    let settings = Settings::load(config)?;

    let store: Arc<dyn JobStore> = if settings.database == "memory" {
        info!("using the in-memory job store");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(PostgresStore::connect(&settings.database).await?)
    };

    let daemon = Arc::new(Daemon::new(&settings, store, HashMap::new()));
    daemon.start().await?;

    let server = RpcServer::bind(settings.port)
        .await
        .with_context(|| format!("bind 127.0.0.1:{}", settings.port))?;
    info!(
        node = %daemon.config_view().node,
        port = settings.port,
        ncpus = settings.ncpus,
        "pybs daemon ready"
    );

    let cancel = CancellationToken::new();
    let dispatcher_task = tokio::spawn(dispatcher::run(daemon.clone(), cancel.clone()));
    let rpc_task = tokio::spawn(server.serve(daemon.clone(), cancel.clone()));

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");
    cancel.cancel();
    let _ = dispatcher_task.await;
    let _ = rpc_task.await;

    // Running jobs drain; their finish stamps and capacity release must land.
    daemon.drain().await;
    Ok(())
}
