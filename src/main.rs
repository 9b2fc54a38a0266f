//! Segment clickstream materializer
//!
//! Rebuilds the sessionized relations of every configured tenant schema:
//! - `event_union`: pages and tracks with per-visitor idle gaps
//! - `sessions`: one row per visitor session
//! - `event_facts`: events joined to their session with sequence numbers

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::signal;
use tracing::{error, info};

use materializer_core::SchemaConfig;
use telemetry::init_tracing_from_env;
use warehouse::WarehouseConfig;
use worker::{BatchRunner, FailurePolicy};

/// Application configuration.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct Config {
    #[serde(default)]
    warehouse: WarehouseConfig,

    /// Tenant schemas, materialized in order
    #[serde(default)]
    schemas: Vec<SchemaConfig>,

    #[serde(default)]
    failure_policy: FailurePolicy,

    /// Repeat the batch on this interval instead of running once
    #[serde(default)]
    run_interval_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing_from_env();

    info!("Starting segment materializer v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    for schema in &config.schemas {
        schema.check().context("Invalid schema configuration")?;
    }
    if config.schemas.is_empty() {
        bail!("No schemas configured");
    }

    info!(
        backend = config.warehouse.backend.as_str(),
        host = %config.warehouse.host,
        database = %config.warehouse.database,
        schemas = config.schemas.len(),
        policy = ?config.failure_policy,
        "Loaded configuration"
    );

    let warehouse = warehouse::connect(&config.warehouse)
        .await
        .context("Failed to connect to warehouse")?;
    warehouse
        .ping()
        .await
        .context("Warehouse connectivity check failed")?;
    info!(backend = warehouse.backend(), "Warehouse connection: healthy");

    let runner = BatchRunner::new(warehouse, config.failure_policy);

    match config.run_interval_secs {
        Some(secs) => {
            info!(interval_secs = secs, "Running on interval");
            tokio::select! {
                _ = runner.run_every(&config.schemas, Duration::from_secs(secs.max(1))) => {}
                _ = shutdown_signal() => {}
            }
            info!("Shutdown complete");
            Ok(())
        }
        None => {
            let report = runner.run(&config.schemas).await;
            for (schema, e) in &report.failed {
                error!(schema = %schema, error = %e, "Materialization failed");
            }
            if !report.is_success() {
                bail!(
                    "{} schema(s) failed, {} skipped",
                    report.failed.len(),
                    report.skipped.len()
                );
            }
            Ok(())
        }
    }
}

/// Load configuration from files and environment.
fn load_config() -> Result<Config> {
    let path = std::env::var("MATERIALIZER_CONFIG").unwrap_or_else(|_| "config/default".to_string());

    let config = config::Config::builder()
        // Start with defaults
        .add_source(config::Config::try_from(&Config::default())?)
        // Load from config file if exists (toml, yaml or json by extension)
        .add_source(config::File::with_name(&path).required(false))
        // Override with environment variables
        .add_source(
            config::Environment::default()
                .separator("__")
                .prefix("MATERIALIZER")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    let mut config: Config = config
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    // Credentials usually arrive as flat env vars rather than nested keys
    if let Ok(username) = std::env::var("MATERIALIZER_WAREHOUSE_USERNAME") {
        config.warehouse.username = Some(username);
    }
    if let Ok(password) = std::env::var("MATERIALIZER_WAREHOUSE_PASSWORD") {
        config.warehouse.password = Some(password);
    }

    Ok(config)
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
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
            info!("Received terminate signal");
        }
    }
}
