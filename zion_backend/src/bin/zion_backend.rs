use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flume::unbounded;
use tracing_subscriber::EnvFilter;
use zion_backend::config::AgentConfig;
use zion_backend::runtime::BackendRuntime;
use zion_backend::server::serve_backend;

const DEFAULT_BIND: &str = "127.0.0.1:8787";

#[derive(Debug, Parser)]
#[command(name = "zion_backend", about = "Zion agent control loop as an HTTP service")]
struct Cli {
    /// Workspace root the agent operates in (defaults to the current directory).
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Model provider: ollama, openai or cerebras.
    #[arg(long, global = true)]
    provider: Option<String>,

    #[arg(long, global = true)]
    model: Option<String>,

    /// Run every tool call without asking.
    #[arg(long, global = true)]
    auto_approve: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the `/v1` API.
    Serve {
        /// host:port (falls back to ZION_BACKEND_BIND, then 127.0.0.1:8787).
        #[arg(long)]
        bind: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,zion_backend=debug")),
        )
        .init();

    let cli = Cli::parse();
    let bind = match cli.command {
        Some(Command::Serve { bind }) => bind,
        None => None,
    };
    let bind_addr = bind
        .or_else(|| std::env::var("ZION_BACKEND_BIND").ok())
        .unwrap_or_else(|| DEFAULT_BIND.to_string())
        .parse::<SocketAddr>()
        .context("Invalid bind address (expected host:port)")?;

    let mut config = AgentConfig::load();
    config.apply_overrides(cli.provider.as_deref(), cli.model.as_deref(), cli.auto_approve)?;
    let workspace = match cli.workspace {
        Some(path) => path,
        None => std::env::current_dir().context("failed to read current directory")?,
    };

    tracing::info!(
        "Starting Zion backend for {} (set ZION_BACKEND_TOKEN; auth mode via ZION_BACKEND_AUTH_MODE)",
        workspace.display()
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(async move {
        let (event_tx, event_rx) = unbounded();
        let runtime = BackendRuntime::bootstrap(config, workspace, event_tx)
            .context("failed to bootstrap backend runtime")?;
        serve_backend(runtime, event_rx, bind_addr).await
    })
}
