//! Market Ingest Binary
//!
//! Starts the ingestion service and its health endpoint.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-ingest
//! ```
//!
//! # Environment Variables
//!
//! - `MARKET_INGEST_CONFIG`: Path to the YAML configuration (default: config.yaml)
//! - `MARKET_INGEST_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `BYBIT_API_KEY` / `BYBIT_API_SECRET`: Optional, referenced from the config file
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: market-ingest)
//! - `RUST_LOG`: Log level (default: info)

use std::net::SocketAddr;
use std::time::Duration;

use market_ingest::infrastructure::telemetry;
use market_ingest::{HealthServer, IngestConfig, IngestService, init_metrics};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Market Ingest");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = IngestConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let app = IngestService::start(&config, shutdown_token.clone()).await?;
    app.verify_credentials().await;

    // Spawn health server
    let health_addr: SocketAddr =
        format!("{}:{}", config.server.bind_address, config.server.health_port).parse()?;
    let health_server = HealthServer::new(
        health_addr,
        app.health_state(env!("CARGO_PKG_VERSION")),
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Declare the configured bootstrap interest
    let service = app.service();
    let bootstrap = config.bootstrap_symbols()?;
    if !bootstrap.is_empty() {
        let consumer = service.register_consumer();
        service.subscribe(consumer, &bootstrap)?;
        tracing::info!(symbols = bootstrap.len(), "Bootstrap symbols subscribed");

        let ready_timeout = Duration::from_secs(config.ingestion.ready_timeout_secs);
        match service.wait_until_ready(ready_timeout).await {
            Ok(()) => tracing::info!("Initial data loaded"),
            Err(e) => tracing::warn!(error = %e, "Serving before every bootstrap symbol has data"),
        }
    }

    tracing::info!("Market ingest ready");

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, app.shutdown()).await.is_err() {
        tracing::warn!("Shutdown timed out, abandoning remaining tasks");
    }

    tracing::info!("Market ingest stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &IngestConfig) {
    tracing::info!(
        exchanges = ?config.exchanges.keys().collect::<Vec<_>>(),
        workers = config.ingestion.workers,
        warming = config.warming.enabled,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        warm_backend = ?config.cache.warm.backend,
        durable_backend = ?config.cache.durable.backend,
        namespace = %config.cache.namespace,
        "Cache tiers"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
