//! Storage operator construction and the startup bucket check.

use archiver_config::{StorageBackend, StorageConfig};
use opendal::Operator;

use super::error::{Result, WriterError};

/// Build an operator for the configured backend.
pub fn build_operator(config: &StorageConfig) -> Result<Operator> {
    let operator = match config.backend {
        StorageBackend::Fs => {
            let fs = config.fs.as_ref().ok_or_else(|| {
                WriterError::invalid_config("fs config required for filesystem backend".to_string())
            })?;

            std::fs::create_dir_all(&fs.path).map_err(|e| {
                WriterError::storage_unavailable(format!(
                    "Failed to create archive directory '{}': {}",
                    fs.path, e
                ))
            })?;

            let fs_builder = opendal::services::Fs::default().root(&fs.path);
            Operator::new(fs_builder)
                .map_err(|e| {
                    WriterError::invalid_config(format!(
                        "Failed to create filesystem operator: {}",
                        e
                    ))
                })?
                .finish()
        }
        StorageBackend::S3 => {
            let s3 = config.s3.as_ref().ok_or_else(|| {
                WriterError::invalid_config("s3 config required for S3 backend".to_string())
            })?;

            let mut s3_builder = opendal::services::S3::default()
                .bucket(&s3.bucket)
                .region(&s3.region);

            if let Some(endpoint) = &s3.endpoint {
                s3_builder = s3_builder.endpoint(endpoint);
            }

            if let (Some(access_key), Some(secret_key)) = (&s3.access_key_id, &s3.secret_access_key)
            {
                s3_builder = s3_builder
                    .access_key_id(access_key)
                    .secret_access_key(secret_key);
            }

            Operator::new(s3_builder)
                .map_err(|e| {
                    WriterError::invalid_config(format!("Failed to create S3 operator: {}", e))
                })?
                .finish()
        }
    };

    tracing::debug!(backend = %config.backend, "Storage operator initialized");
    Ok(operator)
}

/// Key prefix prepended to every object path, if any.
pub fn storage_prefix(config: &StorageConfig) -> Option<String> {
    match config.backend {
        StorageBackend::S3 => config.s3.as_ref().and_then(|s3| s3.prefix.clone()),
        StorageBackend::Fs => None,
    }
}

/// Verify the archive location is reachable before consuming anything.
pub async fn ensure_bucket(op: &Operator) -> Result<()> {
    op.check().await.map_err(|e| {
        WriterError::storage_unavailable(format!(
            "Archive location '{}' is not reachable: {}",
            op.info().name(),
            e
        ))
    })
}
