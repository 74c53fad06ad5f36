//! Event-bus service entry point

use clap::{Parser, Subcommand};
use eventbus_service::broker::BrokerError;
use eventbus_service::config::{ConfigOverrides, ServiceConfig};
use eventbus_service::error::ServiceResult;
use eventbus_service::observability::init_default_logging;
use eventbus_service::service::ServiceLifecycle;
use eventbus_service::transport::MqttTransport;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

/// MQTT event-bus service with a periodic publisher and a history subscriber
#[derive(Parser)]
#[command(name = "eventbus-service")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "EVENTBUS_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigOverrides,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the service until SIGINT/SIGTERM or a permanent connection failure
    Run,
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = ServiceConfig::load(cli.config.as_deref())
        .and_then(|config| config.with_overrides(&cli.overrides));

    init_default_logging(config.as_ref().map(|c| c.debug).unwrap_or(false));

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_service(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!(kind = e.as_label(), "Command failed: {}", e);
        process::exit(1);
    }
}

async fn run_service(config: ServiceConfig) -> ServiceResult<()> {
    info!(
        service = %config.name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting event-bus service"
    );

    let transport = Arc::new(MqttTransport::new(&config.name, config.mqtt.clone()));
    let mut service = ServiceLifecycle::new(config, transport);

    service.start().await?;
    if let Err(e) = service.start_http().await {
        service.shutdown().await?;
        return Err(e);
    }

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    info!("Service running");

    let failure = tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
            None
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
            None
        }
        reason = service.connection_failed() => {
            error!(%reason, "Broker connection permanently lost, shutting down");
            Some(reason)
        }
    };

    let report = service.shutdown().await?;
    if !report.is_clean() {
        warn!(timed_out = ?report.timed_out, "Some workers were aborted during shutdown");
    }

    match failure {
        Some(reason) => Err(BrokerError::ConnectionFailed(reason).into()),
        None => Ok(()),
    }
}

fn handle_config_command(config: &ServiceConfig, show: bool) -> ServiceResult<()> {
    if show {
        println!("{}", config.to_toml()?);
    }

    info!(service = %config.name, "Configuration is valid");
    Ok(())
}
