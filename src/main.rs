//! Feedhost: HTTP transport for a feed reader.
//!
//! This is the process entry point. It loads configuration, initializes
//! tracing, opens the storage directory, installs the Prometheus recorder when
//! metrics are enabled, builds the router and hands it to the listener layer.
//! Listener failures are logged and terminate the process with a non-zero
//! status.

use std::sync::Arc;

use axum::Router;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use feedhost::config::{LogFormat, ServerConfig, DEFAULT_CONFIG_PATH, DEFAULT_LOG_FILTER, VERSION};
use feedhost::http::{self, Environment, Shutdown};
use feedhost::storage::DirStore;
use feedhost::{create_router, AppState};

/// Feedhost: HTTP front door for the feed reader
#[derive(Parser, Debug)]
#[command(name = "feedhost", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level filter (e.g., "feedhost=debug,tower_http=info")
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = ServerConfig::load(&args.config)?;

    // Initialize tracing with priority: CLI > env > default
    let log_filter = args
        .log_level
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

    let json = config.logging.format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_filter))
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();

    tracing::info!(version = VERSION, config = %args.config, "Loaded configuration");

    let store = Arc::new(DirStore::open(&config.storage.path)?);
    tracing::info!(path = %store.root().display(), "Opened storage directory");

    let metrics = if config.metrics.enabled {
        let handle = PrometheusBuilder::new().install_recorder()?;
        tracing::info!("Installed Prometheus recorder");
        Some(handle)
    } else {
        None
    };

    let config = Arc::new(config);
    let state = AppState::new(config.clone(), store.clone(), metrics);
    let app = create_router(state, Router::new());

    let shutdown = Shutdown::on_signals();
    let listeners = match http::start(app, &config, &Environment::from_process(), store, &shutdown) {
        Ok(listeners) => listeners,
        Err(e) => {
            tracing::error!(error = %e, "Unable to start listener");
            std::process::exit(1);
        }
    };

    if let Err(e) = listeners.wait().await {
        tracing::error!(error = %e, "Listener terminated");
        std::process::exit(1);
    }

    tracing::info!("Server stopped");
    Ok(())
}
