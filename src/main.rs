use anyhow::Result;
use clap::Parser;
use nbu_exporter::{
    client::ApiClient,
    config::Settings,
    metrics::{CollectorOptions, MetricsCollector},
    server::start_server,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// NetBackup Exporter - Prometheus metrics exporter for NetBackup primary servers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", env = "NBU_EXPORTER_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Load configuration
    let settings = Settings::load(args.config.as_deref())?;

    // Initialize logging
    init_logging(&settings.exporter.log_level, &settings.exporter.log_format)?;

    info!("Starting NetBackup Exporter");
    info!("NetBackup endpoint: {}", settings.nbu.base_url());
    info!("Listen address: {}", settings.exporter.listen_address);
    match &settings.nbu.api_version {
        Some(version) => info!("Using configured API version {}", version),
        None => info!("API version will be negotiated on first scrape"),
    }

    // Create NetBackup client
    let options = CollectorOptions::from_config(&settings.nbu);
    let client = Arc::new(ApiClient::new(settings.nbu.clone())?);
    info!("NetBackup client initialized");

    // Create metrics collector
    let metrics = Arc::new(MetricsCollector::new(Arc::clone(&client), options)?);
    let sweeper = metrics.cache().spawn_sweeper();
    info!("Metrics collector initialized");

    // Start HTTP server
    info!("Starting HTTP server...");
    let served = start_server(
        &settings.exporter.listen_address,
        Arc::clone(&metrics),
        shutdown_signal(),
    )
    .await;

    sweeper.abort();
    if let Err(e) = client.close().await {
        warn!("NetBackup client did not close cleanly: {}", e);
    }

    if let Err(e) = served {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}

/// Initialize structured logging with tracing.
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
