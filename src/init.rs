// Initialization utilities
//
// Storage backend and logging/tracing setup

use archiver_config::{LogFormat, RuntimeConfig, StorageBackend};
use anyhow::{Context, Result};
use opendal::Operator;
use tracing::info;

use crate::writer::{build_operator, ensure_bucket};

/// Build the storage operator and verify the archive location exists.
///
/// A missing bucket is fatal: nothing is consumed before this succeeds.
pub async fn init_storage(config: &RuntimeConfig) -> Result<Operator> {
    info!(
        "Initializing writer with storage backend: {}",
        config.storage.backend
    );

    match config.storage.backend {
        StorageBackend::Fs => {
            if let Some(fs) = config.storage.fs.as_ref() {
                info!("Using filesystem storage at: {}", fs.path);
            }
        }
        StorageBackend::S3 => {
            if let Some(s3) = config.storage.s3.as_ref() {
                info!(
                    "Using S3 storage: bucket={}, region={}, endpoint={}",
                    s3.bucket,
                    s3.region,
                    s3.endpoint.as_deref().unwrap_or("default")
                );
            }
        }
    }

    let op = build_operator(&config.storage).context("Failed to initialize storage")?;
    ensure_bucket(&op)
        .await
        .context("Archive storage check failed")?;

    Ok(op)
}

/// Initialize tracing/logging from RuntimeConfig
pub fn init_tracing(config: &RuntimeConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let (log_level, log_format) = config
        .server
        .as_ref()
        .map(|s| (s.log_level.as_str(), s.log_format))
        .unwrap_or(("info", LogFormat::Text));

    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    // Try to set the global subscriber; ignore error if already set (idempotent)
    let _ = match log_format {
        LogFormat::Json => {
            tracing::subscriber::set_global_default(registry.with(fmt::layer().json()))
        }
        LogFormat::Text => tracing::subscriber::set_global_default(registry.with(fmt::layer())),
    };
}
