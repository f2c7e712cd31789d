mod render;
mod repl;

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use zion_backend::config::AgentConfig;
use zion_backend::runtime::BackendRuntimeBuilder;

use repl::Repl;

#[derive(Debug, Parser)]
#[command(name = "zion", about = "Terminal coding agent")]
struct Cli {
    /// Workspace root the agent operates in (defaults to the current directory).
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Model provider: ollama, openai or cerebras.
    #[arg(long)]
    provider: Option<String>,

    #[arg(long)]
    model: Option<String>,

    /// Run every tool call without asking.
    #[arg(long)]
    auto_approve: bool,

    /// Write the effective settings (file, env and flags) back to the config file.
    #[arg(long)]
    save_config: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,zion=info,zion_backend=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = AgentConfig::load();
    config.apply_overrides(cli.provider.as_deref(), cli.model.as_deref(), cli.auto_approve)?;
    if cli.save_config {
        config.save()?;
        render::info(&format!(
            "Saved settings to {}",
            AgentConfig::config_path().display()
        ));
    }
    let workspace = match cli.workspace {
        Some(path) => path,
        None => std::env::current_dir().context("failed to read current directory")?,
    };

    let rt = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    rt.block_on(run(config, workspace))?;
    // Don't wait on a pty job still parked in spawn_blocking.
    rt.shutdown_background();
    Ok(())
}

async fn run(config: AgentConfig, workspace: PathBuf) -> Result<()> {
    let (event_tx, event_rx) = flume::unbounded();
    let input_rx = spawn_stdin_reader();

    let runtime = BackendRuntimeBuilder::new(config, workspace)
        .with_events(event_tx)
        .with_operator_input(input_rx.clone())
        .build()?;
    let controller = runtime.controller;

    render::banner(
        &controller.workspace().display().to_string(),
        &controller.model_label(),
        controller.analytics_enabled(),
    );

    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            render::event(&event);
        }
    });

    let running = Arc::new(AtomicBool::new(false));
    let interrupt = controller.interrupt_handle();
    let ctrl_c_running = running.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if ctrl_c_running.load(Ordering::SeqCst) {
                tracing::debug!("interrupt requested");
                interrupt.interrupt();
            } else {
                render::info("\nBye.");
                std::process::exit(0);
            }
        }
    });

    Repl::new(controller, input_rx, running).run().await
}

/// One reader for stdin; the REPL and a running shell command both pull from the channel.
fn spawn_stdin_reader() -> flume::Receiver<String> {
    let (tx, rx) = flume::unbounded();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}
