use std::path::PathBuf;

use clap::Parser;
use clap::builder::Styles;
use clap::builder::styling::{AnsiColor, Effects};
use tracing::{error, info};

use gateway_core::config;
use mcp_gateway_registry::context::Context;
use mcp_gateway_registry::{app, telemetry};

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());

/// MCP Gateway Registry: a reverse proxy, discovery index, and admin
/// API in front of a fleet of Model Context Protocol servers.
#[derive(Debug, Parser)]
#[command(version, styles = STYLES)]
struct Args {
    /// Path to the gateway's YAML config file. Falls back to
    /// `MCP_GATEWAY_CONFIG` if omitted.
    #[arg(env = "MCP_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Emit structured logs as JSON instead of human-readable text.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    telemetry::init(args.json_logs);

    if let Err(e) = run(args).await {
        error!(error = %e, "fatal error, shutting down");
        let code = if e.downcast_ref::<gateway_core::scope::PolicyError>().is_some() {
            2
        } else {
            1
        };
        std::process::exit(code);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let gateway_config = config::load(args.config.as_deref())?;

    info!(
        "mcp-gateway-registry v{} starting on {}:{}",
        env!("CARGO_PKG_VERSION"),
        gateway_config.listen.address,
        gateway_config.listen.port,
    );

    let addr = std::net::SocketAddr::from((gateway_config.listen.address, gateway_config.listen.port));
    let ctx = Context::build(gateway_config).await?;

    let health_monitor = ctx.health.clone();
    let health_handle = tokio::spawn(health_monitor.run());

    let router = app(ctx.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    ctx.health.shutdown();
    let _ = health_handle.await;
    info!("mcp-gateway-registry shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
