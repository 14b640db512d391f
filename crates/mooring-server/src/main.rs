//! mooring-server binary: socket listener + HTTP front door.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use mooring_server::center::ConnectorCenter;
use mooring_server::config::ServerConfig;
use mooring_server::http::{self, FrontDoorState};
use mooring_server::socket;

/// mooring-server — rendezvous server for mooring connectors
#[derive(Parser, Debug)]
#[command(name = "mooring-server", version, about = "Rendezvous server for mooring connectors")]
struct Cli {
    /// Socket transport port (WebSocket)
    #[arg(long)]
    socket_port: Option<u16>,

    /// HTTP front-door port (stream transport + inbound sessions)
    #[arg(long)]
    http_port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.mooring/config.toml")]
    config: String,

    /// Register each socket connection as a single session instead of
    /// multiplexing sessions over it
    #[arg(long)]
    single_session: bool,

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

    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(Some(&config_path), cli.socket_port, cli.http_port) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        socket_port = config.socket_port,
        http_port = config.http_port,
        "starting mooring-server"
    );

    let center = Arc::new(ConnectorCenter::new());

    let mode = if cli.single_session {
        socket::SessionMode::Single
    } else {
        socket::SessionMode::Shared
    };
    let socket_addr: SocketAddr = ([0, 0, 0, 0], config.socket_port).into();
    let (_bound, socket_task) =
        match socket::start_listener_with_mode(socket_addr, center.clone(), mode).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, "failed to start socket listener");
                std::process::exit(1);
            }
        };

    let http_addr: SocketAddr = ([0, 0, 0, 0], config.http_port).into();
    let http_listener = match tokio::net::TcpListener::bind(http_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr = %http_addr, "failed to bind HTTP front door");
            std::process::exit(1);
        }
    };
    info!(addr = %http_addr, "HTTP front door started");

    let app = http::router(FrontDoorState::new(center));

    tokio::select! {
        result = axum::serve(http_listener, app) => {
            if let Err(e) = result {
                error!(error = %e, "HTTP front door error");
                std::process::exit(1);
            }
        }
        _ = socket_task => {
            error!("socket listener stopped unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("mooring-server stopped");
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
