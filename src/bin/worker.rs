//! streamgroup worker
//!
//! Runs a worker pool against one Redis stream and logs every entry it
//! receives. Useful for tailing a stream and as a template for services that
//! embed the library with their own [`EntryHandler`](streamgroup::EntryHandler).
//!
//! ## Configuration
//!
//! Settings come from `config/streamgroup.toml` (or `STREAMGROUP_CONFIG`).
//! Environment variables override the file:
//! - `REDIS_URL`: Redis connection string
//! - `STREAMGROUP_CONSUMER`: Consumer identity prefix (default: hostname or UUID)
//! - `STREAMGROUP_WORKERS`: Number of live consumers
//! - `RUST_LOG`: Logging level (default: "info")

use std::env;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use streamgroup::config::{ConfigError, EngineConfig};
use streamgroup::{LogHandler, RedisStore, ShutdownSignal, WorkerPool};

/// Derive a consumer identity prefix from the host.
fn get_worker_name() -> String {
    if let Ok(hostname) = hostname::get() {
        if let Some(name) = hostname.to_str() {
            return format!("worker-{}", name);
        }
    }

    // Fallback to UUID
    format!("worker-{}", uuid::Uuid::new_v4())
}

/// Load the config file and apply environment overrides.
fn load_config() -> Result<EngineConfig, ConfigError> {
    let mut config = EngineConfig::load()?;

    if let Ok(url) = env::var("REDIS_URL") {
        config.redis.url = url;
    }
    if let Ok(name) = env::var("STREAMGROUP_CONSUMER") {
        config.stream.consumer = Some(name);
    }
    if let Ok(workers) = env::var("STREAMGROUP_WORKERS") {
        config.stream.workers = workers.parse().map_err(|_| {
            ConfigError::ValidationError(format!("STREAMGROUP_WORKERS is not a number: {workers}"))
        })?;
    }
    if config.stream.consumer.is_none() {
        config.stream.consumer = Some(get_worker_name());
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Arc::new(load_config()?);

    info!(
        stream = %config.stream.name,
        group = %config.stream.group,
        consumer = config.stream.consumer.as_deref().unwrap_or_default(),
        workers = config.stream.workers,
        shape = %config.stream.shape,
        "streamgroup worker starting"
    );

    let store = RedisStore::from_config(&config.redis)?;
    let handler = Arc::new(LogHandler::new());
    let pool = WorkerPool::new(Arc::new(store), config.clone(), handler);

    let shutdown = ShutdownSignal::new();
    let worker_shutdown = shutdown.clone();
    let mut running = tokio::spawn(async move { pool.run_configured(worker_shutdown).await });

    tokio::select! {
        _ = shutdown.wait() => {
            info!("Shutdown signal received, waiting for in-flight reads...");
        }
        finished = &mut running => {
            // The pool only returns on its own when setup failed
            return match finished {
                Ok(Ok(report)) => {
                    info!(acknowledged = report.acknowledged(), "Worker pool stopped");
                    Ok(())
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Worker pool setup failed");
                    Err(e.into())
                }
                Err(e) => Err(e.into()),
            };
        }
    }

    match tokio::time::timeout(shutdown.timeout(), running).await {
        Ok(Ok(Ok(report))) => {
            info!(
                acknowledged = report.acknowledged(),
                consumers = report.consumers.len(),
                "Worker shutdown complete"
            );
        }
        Ok(Ok(Err(e))) => {
            warn!(error = %e, "Worker pool stopped during setup");
        }
        Ok(Err(e)) => {
            error!(error = %e, "Worker pool task failed");
            return Err(e.into());
        }
        Err(_) => {
            warn!(
                timeout_secs = shutdown.timeout().as_secs(),
                "Timed out waiting for workers to stop"
            );
        }
    }

    Ok(())
}
