//! agent-bridge: share one SSH agent across local transports.
//!
//! Listens on every configured endpoint (unix socket, Cygwin/MSYS socket
//! file, Windows named pipe) and forwards each agent query to the upstream
//! agent, one connection per query.

mod adapters;
mod config;

use agent_bridge_core::{Bridge, BridgeContext, Upstream};
use anyhow::Context;
use clap::Parser;
use config::{BridgeConfig, ConfigOverrides};
use std::path::PathBuf;
use tracing::{error, info, warn};

/// SSH agent bridge
#[derive(Parser, Debug)]
#[command(name = "agent-bridge", version, about = "Share one SSH agent across local transports")]
struct Cli {
    /// Endpoints to listen on (comma separated), or "all"
    #[arg(long, value_delimiter = ',')]
    from: Option<Vec<String>>,

    /// Endpoint of the upstream agent
    #[arg(long)]
    to: Option<String>,

    /// Unix socket path (defaults to $SSH_AUTH_SOCK)
    #[arg(long)]
    unix_socket: Option<String>,

    /// Cygwin/MSYS socket file path
    #[arg(long)]
    socket_file: Option<String>,

    /// Named pipe path
    #[arg(long)]
    pipe: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.config/agent-bridge/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Shorthand for --log-level debug
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let level = if cli.debug { "debug" } else { cli.log_level.as_str() };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting agent-bridge");

    if let Err(e) = run(cli).await {
        error!("{e:#}");
        std::process::exit(1);
    }

    info!("agent-bridge stopped");
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let overrides = ConfigOverrides {
        from: cli.from,
        to: cli.to,
        unix_socket: cli.unix_socket,
        socket_file: cli.socket_file,
        pipe: cli.pipe,
    };
    let config_path = PathBuf::from(&cli.config);
    let config = BridgeConfig::load(Some(&config_path), &overrides)
        .context("failed to load config")?;

    let listeners = config
        .from
        .iter()
        .map(|&kind| {
            info!(
                endpoint = %kind,
                path = config.endpoint_label(kind).as_deref().unwrap_or_default(),
                "configured listener"
            );
            adapters::listener(kind, &config)
        })
        .collect::<Result<Vec<_>, _>>()?;

    info!(
        endpoint = %config.to,
        path = config.endpoint_label(config.to).as_deref().unwrap_or_default(),
        "configured upstream agent"
    );
    let upstream = Upstream::Stream(adapters::dialer(config.to, &config)?);

    let ctx = BridgeContext::with_max_message_size(config.max_message_size);
    let bridge = Bridge::start(ctx, listeners, upstream).context("failed to start bridge")?;

    tokio::select! {
        _ = shutdown_signal() => info!("received shutdown signal"),
        _ = bridge.context().cancelled() => {}
    }

    bridge.request_stop();
    bridge.wait_stopped().await;
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
