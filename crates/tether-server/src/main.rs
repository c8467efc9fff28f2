//! tether-server: terminal-sharing relay.
//!
//! Maintains one live SSH/PTY session and multiplexes it to WebSocket
//! clients: a single authenticated controller that may type and resize,
//! and any number of read-only viewers.

mod auth;
mod config;
mod server;
mod session;
mod transport;

use clap::Parser;
use config::RelayConfig;
use server::RelayServer;
use tracing::{error, info};

/// tether-server — terminal-sharing relay
#[derive(Parser, Debug)]
#[command(name = "tether-server", version, about = "Terminal-sharing relay")]
struct Cli {
    /// Listen port (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides BIND_ADDRESS)
    #[arg(long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    // Load config from the environment, then apply CLI overrides.
    let mut config = match RelayConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(bind) = cli.bind {
        config.bind_address = bind;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        ssh_host = %config.ssh.host,
        "starting tether-server"
    );

    let relay = RelayServer::new(config);

    tokio::select! {
        result = relay.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("tether-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
