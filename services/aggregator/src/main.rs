use anyhow::{Context, Result};
use shipment_aggregator::{Config, ObjectStore, S3ObjectStore, ShipmentEventProcessor};
use std::sync::Arc;
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        source_buckets = ?config.aggregation.source_buckets,
        summary_bucket = %config.publish.summary_bucket,
        "Starting shipment aggregator"
    );

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    let store: Arc<dyn ObjectStore> = Arc::new(
        S3ObjectStore::new(&config.s3)
            .await
            .context("Failed to initialize S3 object store")?,
    );

    let processor = ShipmentEventProcessor::from_config(store, &config);

    if config.service.run_once {
        processor
            .run()
            .await
            .context("Failed to process shipment updates")?;
        return Ok(());
    }

    run_on_schedule(&processor, &config).await;

    info!("Shipment aggregator stopped");

    Ok(())
}

/// Run the pipeline every schedule interval until a shutdown signal arrives.
///
/// Ticks run one after another; a tick that falls due while a run is still
/// going is skipped.
async fn run_on_schedule(processor: &ShipmentEventProcessor, config: &Config) {
    let mut ticker = tokio::time::interval(config.schedule_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        interval_secs = config.service.schedule_interval_secs,
        "Scheduled runs started"
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
        }

        tokio::select! {
            result = processor.run() => {
                if let Err(e) = result {
                    // Source files are untouched; the next tick retries them
                    error!(error = %e, "Failed to process shipment updates");
                }
            }
            _ = &mut shutdown => {
                warn!("Shutdown during run, unfinished cleanup is left to the next run");
                break;
            }
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
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
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
