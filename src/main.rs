//! IoT Bridge - Main Entry Point
//!
//! Loads configuration, starts the HTTP API and tears the broker session
//! down again on SIGINT/SIGTERM.

use clap::{Parser, Subcommand};
use iotbridge::config::BridgeConfig;
use iotbridge::observability::{init_default_logging, init_logging, LogFormat};
use iotbridge::transport::mqtt::MqttConnector;
use iotbridge::{api, Bridge};
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn, Level};

/// HTTP-to-MQTT bridge for AWS IoT Core
#[derive(Parser)]
#[command(name = "iotbridge")]
#[command(about = "HTTP-to-MQTT bridge for AWS IoT Core")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "IOTBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API
    Serve,
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        verbose => {
            let level = if verbose == 1 { Level::DEBUG } else { Level::TRACE };
            let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_default());
            init_logging(level, format, false);
        }
    }

    info!("Starting iotbridge v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: Option<&PathBuf>,
) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(BridgeConfig::load_from_file(path)?);
    }

    for path_str in ["iotbridge.toml", "config/iotbridge.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(BridgeConfig::load_from_file(&path)?);
        }
    }

    info!("No configuration file found, using defaults and environment");
    Ok(BridgeConfig::from_env()?)
}

async fn serve(config: BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let host: IpAddr = config.server.host.parse()?;
    let addr = SocketAddr::new(host, config.server.port);

    let connector = Arc::new(MqttConnector::new(config.broker.clone()));
    let bridge = Arc::new(Bridge::new(&config, connector));

    info!(
        client_id = %config.broker.client_id,
        endpoint = %config.broker.endpoint,
        "Bridge configured"
    );

    let (bound, server) = warp::serve(api::routes(bridge.clone()))
        .try_bind_with_graceful_shutdown(addr, shutdown_signal())?;
    info!("Server running on http://{}", bound);

    server.await;

    info!("Application shutdown initiated");
    if bridge.connections().current().await.is_some() {
        if let Err(e) = bridge.disconnect().await {
            warn!("Disconnect during shutdown failed: {}", e);
        }
    }
    Ok(())
}

fn handle_config_command(
    config: &BridgeConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down gracefully..."),
        _ = terminate => info!("Received SIGTERM, shutting down gracefully..."),
    }
}
