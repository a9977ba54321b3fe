//! `mas-core`: the long-running server process. Boots every subsystem from
//! [`mas_core::config::CoreConfig`], serves the control-plane HTTP API, and
//! shuts the fleet down gracefully on `SIGTERM`/Ctrl-C.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use mas_core::control_plane::build_router;
use mas_core::runtime::CoreRuntime;
use mas_core::{config, logging};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(version = env!("CARGO_PKG_VERSION"), about = "Multi-Agent Orchestration Core server")]
struct Args {
    /// Path to a TOML config file; falls back to defaults plus `MAS_CORE__*`
    /// environment overrides when omitted.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = config::CoreConfig::load(args.config.as_deref()).context("loading configuration")?;
    logging::init(&config.logging);

    info!(config = %config.sanitized_snapshot(), "starting mas-core");

    let bind_addr = config.server.bind_addr.clone();
    let runtime = CoreRuntime::build(config).await.context("building runtime")?;

    let probe_loop = tokio::spawn(runtime.supervisor.clone().run());

    runtime.mark_ready();

    let listener = TcpListener::bind(bind_addr.as_str()).await.with_context(|| format!("binding {bind_addr}"))?;
    info!(%bind_addr, "control-plane API listening");

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        shutdown_signal.cancel();
    });

    let router = build_router(runtime.app_state());
    let server_shutdown = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await
        .context("serving control-plane API")?;

    runtime.shutdown().await;
    probe_loop.abort();

    info!("mas-core shut down cleanly");
    Ok(())
}
