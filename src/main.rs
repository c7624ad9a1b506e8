//! Serves the aggregated tool catalog on stdio.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use toolmux::proxy::{load_config, ProxyManager};

/// Aggregate tools from many MCP backends behind one catalog
#[derive(Parser, Debug)]
#[command(name = "toolmux")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML (or JSON) configuration file
    #[arg(short, long, env = "TOOLMUX_CONFIG")]
    config: Option<PathBuf>,

    /// Print backend status and the tool catalog as JSON, then exit
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("toolmux: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let config_path = args.config.unwrap_or_else(toolmux::default_config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("cannot load configuration from {}", config_path.display()))?;

    toolmux::init_tracing(&config.logging).context("failed to initialize logging")?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        backends = config.enabled_backends().count(),
        pid = std::process::id(),
        "=== toolmux starting ==="
    );

    let manager = Arc::new(ProxyManager::new(&config));
    let failures = manager.start_all().await;
    for failure in &failures {
        tracing::error!(backend = %failure.backend, error = %failure, "backend unavailable");
    }

    if manager.ready_count() == 0 && config.startup.require_any_ready {
        tracing::error!("no backend reached ready, exiting");
        manager.shutdown_all().await;
        return Ok(ExitCode::FAILURE);
    }

    if args.list {
        let report = serde_json::json!({
            "backends": manager.status(),
            "tools": manager.list(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        manager.shutdown_all().await;
        return Ok(ExitCode::SUCCESS);
    }

    let served = tokio::select! {
        result = toolmux::frontend::serve(Arc::clone(&manager), tokio::io::stdin(), tokio::io::stdout()) => {
            tracing::info!("front-end input closed");
            result
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received");
            Ok(())
        }
    };

    manager.shutdown_all().await;
    tracing::info!("=== toolmux stopped ===");
    served.context("front-end server failed")?;
    Ok(ExitCode::SUCCESS)
}
