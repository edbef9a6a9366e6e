// Configuration validation
//
// Validates that required fields are present and values are sensible

use super::*;
use anyhow::{bail, Result};
use tracing::warn;

pub fn validate_config(config: &RuntimeConfig) -> Result<()> {
    validate_archive_config(&config.archive)?;
    validate_broker_config(&config.broker)?;
    validate_request_config(&config.request)?;
    validate_storage_config(&config.storage)?;

    if let Some(ref server) = config.server {
        validate_server_config(server)?;
    }

    Ok(())
}

fn validate_archive_config(config: &ArchiveConfig) -> Result<()> {
    if config.max_buffer == 0 {
        bail!("archive.max_buffer must be greater than 0");
    }

    if config.flush_every_ms == 0 {
        bail!("archive.flush_every_ms must be greater than 0");
    }

    if config.flush_check_interval_ms == 0 {
        bail!("archive.flush_check_interval_ms must be greater than 0");
    }

    if config.shutdown_timeout_ms == 0 {
        bail!("archive.shutdown_timeout_ms must be greater than 0");
    }

    if config.max_buffer > 1_000_000 {
        warn!(
            max_buffer = config.max_buffer,
            "archive.max_buffer is very large; may cause memory issues"
        );
    }

    if config.flush_check_interval_ms > config.flush_every_ms {
        warn!(
            flush_check_interval_ms = config.flush_check_interval_ms,
            flush_every_ms = config.flush_every_ms,
            "archive.flush_check_interval_ms exceeds flush_every_ms; time-based flushes will lag"
        );
    }

    Ok(())
}

fn validate_broker_config(config: &BrokerConfig) -> Result<()> {
    if config.topic.is_empty() {
        bail!(
            "Broker topic is required\n\n\
            How to fix:\n\
              • Environment: export {}BROKER_TOPIC=events_raw\n\
              • TOML: [broker]\n              topic = \"events_raw\"\n",
            ENV_PREFIX
        );
    }

    if config.group_id.is_empty() {
        bail!(
            "Broker consumer group is required\n\n\
            How to fix:\n\
              • Environment: export {}BROKER_GROUP_ID=archiver\n\
              • TOML: [broker]\n              group_id = \"archiver\"\n",
            ENV_PREFIX
        );
    }

    if config.partitions == 0 {
        bail!("broker.partitions must be greater than 0");
    }

    Ok(())
}

fn validate_request_config(config: &RequestConfig) -> Result<()> {
    if config.max_payload_bytes == 0 {
        bail!("request.max_payload_bytes must be greater than 0");
    }

    if config.max_payload_bytes > 100 * 1024 * 1024 {
        // 100 MB
        warn!(
            max_payload_bytes = config.max_payload_bytes,
            "request.max_payload_bytes is very large; may cause issues"
        );
    }

    Ok(())
}

fn validate_storage_config(config: &StorageConfig) -> Result<()> {
    match config.backend {
        StorageBackend::Fs => {
            let fs = config
                .fs
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("fs storage backend requires 'fs' configuration"))?;

            if fs.path.is_empty() {
                bail!(
                    "Filesystem path is required\n\n\
                    How to fix:\n\
                      • Environment: export {}STORAGE_PATH=/data/archive\n\
                      • TOML: [storage.fs]\n              path = \"/data/archive\"\n",
                    ENV_PREFIX
                );
            }
        }
        StorageBackend::S3 => {
            let s3 = config
                .s3
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("s3 storage backend requires 's3' configuration"))?;

            if s3.bucket.is_empty() {
                bail!(
                    "S3 bucket name is required\n\n\
                    How to fix:\n\
                      • Environment: export {}S3_BUCKET=analytics-archive\n\
                      • TOML: [storage.s3]\n              bucket = \"analytics-archive\"\n",
                    ENV_PREFIX
                );
            }

            if s3.region.is_empty() {
                bail!(
                    "S3 region is required\n\n\
                    How to fix:\n\
                      • Environment: export {}S3_REGION=us-east-1\n\
                      • TOML: [storage.s3]\n              region = \"us-east-1\"\n",
                    ENV_PREFIX
                );
            }

            if s3.access_key_id.is_some() != s3.secret_access_key.is_some() {
                bail!("S3 access key and secret key must be configured together");
            }
        }
    }

    Ok(())
}

fn validate_server_config(config: &ServerConfig) -> Result<()> {
    if config.listen_addr.is_empty() {
        bail!("server.listen_addr must not be empty");
    }

    // Basic validation that it looks like an address
    if !config.listen_addr.contains(':') {
        bail!("server.listen_addr must be in format 'host:port'");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_archive_config() {
        let valid = ArchiveConfig::default();
        assert!(validate_archive_config(&valid).is_ok());

        let zero_buffer = ArchiveConfig {
            max_buffer: 0,
            ..ArchiveConfig::default()
        };
        assert!(validate_archive_config(&zero_buffer).is_err());

        let zero_interval = ArchiveConfig {
            flush_every_ms: 0,
            ..ArchiveConfig::default()
        };
        assert!(validate_archive_config(&zero_interval).is_err());
    }

    #[test]
    fn test_validate_broker_config() {
        assert!(validate_broker_config(&BrokerConfig::default()).is_ok());

        let no_topic = BrokerConfig {
            topic: String::new(),
            ..BrokerConfig::default()
        };
        let err = validate_broker_config(&no_topic).unwrap_err();
        assert!(err.to_string().contains("ARCHIVER_BROKER_TOPIC"));
    }

    #[test]
    fn test_validate_storage_config() {
        let s3_config = StorageConfig::default();
        assert!(validate_storage_config(&s3_config).is_ok());

        let missing_bucket = StorageConfig {
            backend: StorageBackend::S3,
            fs: None,
            s3: Some(S3Config {
                bucket: String::new(),
                ..S3Config::default()
            }),
        };
        assert!(validate_storage_config(&missing_bucket).is_err());

        let half_credentials = StorageConfig {
            backend: StorageBackend::S3,
            fs: None,
            s3: Some(S3Config {
                secret_access_key: None,
                ..S3Config::default()
            }),
        };
        assert!(validate_storage_config(&half_credentials).is_err());

        let fs_without_section = StorageConfig {
            backend: StorageBackend::Fs,
            fs: None,
            s3: None,
        };
        assert!(validate_storage_config(&fs_without_section).is_err());
    }

    #[test]
    fn test_validate_server_config() {
        assert!(validate_server_config(&ServerConfig::default()).is_ok());

        let no_port = ServerConfig {
            listen_addr: "localhost".to_string(),
            ..ServerConfig::default()
        };
        assert!(validate_server_config(&no_port).is_err());
    }
}
