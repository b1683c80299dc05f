use anyhow::{Context, Result};
use iot_backend::api::{start_api_server, AppState};
use iot_backend::config::{Config, LogFormat, ServiceConfig};
use iot_backend::feed::{self, IngestHandler};
use iot_backend::store::TelemetryStore;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service);

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting IoT backend"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let store = Arc::new(
        TelemetryStore::connect(&config.database)
            .await
            .context("Failed to open telemetry store")?,
    );

    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    // One MQTT connection, split into its publish and subscribe halves
    let (publisher, subscriber) =
        feed::connect(&config.mqtt).context("Failed to create MQTT client")?;

    let api_state = AppState {
        store: store.clone(),
        publisher: Arc::new(publisher),
    };

    // Spawn feed subscriber task
    let handler = IngestHandler::new(store.clone());
    let feed_handle = tokio::spawn(async move {
        if let Err(e) = subscriber.run(handler).await {
            error!(error = %e, "Feed subscriber error");
        }
    });

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("IoT backend started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down IoT backend");

    // In-flight requests are not drained
    feed_handle.abort();
    api_handle.abort();

    info!("IoT backend stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(service: &ServiceConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&service.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    match service.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
