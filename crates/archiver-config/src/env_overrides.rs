use super::{FsConfig, LogFormat, RuntimeConfig, S3Config, ServerConfig, StorageBackend};
use anyhow::{anyhow, Context, Result};
use std::str::FromStr;

pub const ENV_PREFIX: &str = "ARCHIVER_";

/// Abstraction over environment-variable lookups so tests (and embedders)
/// can supply their own source of overrides.
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;

    /// Get an environment variable WITHOUT the ARCHIVER_ prefix.
    /// Used for the legacy deployment names (FLUSH_EVERY_MS, S3_BUCKET, ...)
    /// and AWS standard variables.
    fn get_raw(&self, key: &str) -> Option<String>;
}

/// Where an override value came from; only used for error messages.
struct EnvValue {
    name: String,
    value: String,
}

/// Apply environment-variable overrides (highest priority) to the runtime config.
pub fn apply_env_overrides<E: EnvSource>(config: &mut RuntimeConfig, env: &E) -> Result<()> {
    // Flush triggers
    if let Some(val) = get_env_parsed::<u64, E>(env, "FLUSH_EVERY_MS", Some("FLUSH_EVERY_MS"))? {
        config.archive.flush_every_ms = val;
    }
    if let Some(val) = get_env_parsed::<usize, E>(env, "MAX_BUFFER", Some("MAX_BUFFER"))? {
        config.archive.max_buffer = val;
    }
    if let Some(val) = get_env_parsed::<u64, E>(env, "FLUSH_CHECK_INTERVAL_MS", None)? {
        config.archive.flush_check_interval_ms = val;
    }
    if let Some(val) = get_env_parsed::<u64, E>(env, "SHUTDOWN_TIMEOUT_MS", None)? {
        config.archive.shutdown_timeout_ms = val;
    }
    if let Some(mode) = get_env_string(env, "PARTITION_MODE", None) {
        config.archive.partition_mode = mode
            .value
            .parse()
            .with_context(|| format!("Invalid {} value", mode.name))?;
    }

    // Broker subscription
    if let Some(topic) = get_env_string(env, "BROKER_TOPIC", None) {
        config.broker.topic = topic.value;
    }
    if let Some(group) = get_env_string(env, "BROKER_GROUP_ID", None) {
        config.broker.group_id = group.value;
    }
    if let Some(val) = get_env_parsed::<u32, E>(env, "BROKER_PARTITIONS", None)? {
        config.broker.partitions = val;
    }

    // Server configuration (listen addr, log level/format)
    if let Some(addr) = get_env_string(env, "LISTEN_ADDR", None) {
        ensure_server(config).listen_addr = addr.value;
    }
    if let Some(level) = get_env_string(env, "LOG_LEVEL", None) {
        ensure_server(config).log_level = level.value;
    }
    if let Some(format) = get_env_string(env, "LOG_FORMAT", None) {
        let parsed = match format.value.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };
        ensure_server(config).log_format = parsed;
    }

    // Request configuration
    if let Some(val) = get_env_parsed::<usize, E>(env, "MAX_PAYLOAD_BYTES", None)? {
        config.request.max_payload_bytes = val;
    }

    // Storage backend
    if let Some(backend) = get_env_string(env, "STORAGE_BACKEND", None) {
        config.storage.backend = backend
            .value
            .parse::<StorageBackend>()
            .with_context(|| format!("Invalid {} value", backend.name))?;
    }

    // Filesystem storage
    if let Some(path) = get_env_string(env, "STORAGE_PATH", None) {
        config.storage.fs.get_or_insert_with(FsConfig::default).path = path.value;
    }

    // S3-compatible storage
    if let Some(bucket) = get_env_string(env, "S3_BUCKET", Some("S3_BUCKET")) {
        ensure_s3(config).bucket = bucket.value;
    }
    if let Some(region) = get_env_string(env, "S3_REGION", None) {
        ensure_s3(config).region = region.value;
    }
    if let Some(endpoint) = get_env_string(env, "S3_ENDPOINT", Some("S3_ENDPOINT")) {
        ensure_s3(config).endpoint = Some(endpoint.value);
    }
    if let Some(key) = get_env_string(env, "S3_ACCESS_KEY", Some("S3_ACCESS_KEY"))
        .or_else(|| get_env_string(env, "S3_ACCESS_KEY_ID", Some("AWS_ACCESS_KEY_ID")))
    {
        ensure_s3(config).access_key_id = Some(key.value);
    }
    if let Some(secret) = get_env_string(env, "S3_SECRET_KEY", Some("S3_SECRET_KEY")).or_else(
        || get_env_string(env, "S3_SECRET_ACCESS_KEY", Some("AWS_SECRET_ACCESS_KEY")),
    ) {
        ensure_s3(config).secret_access_key = Some(secret.value);
    }
    if let Some(prefix) = get_env_string(env, "S3_PREFIX", None) {
        ensure_s3(config).prefix = normalize_prefix(prefix.value);
    }

    Ok(())
}

fn ensure_s3(config: &mut RuntimeConfig) -> &mut S3Config {
    config.storage.s3.get_or_insert_with(|| S3Config {
        bucket: String::new(),
        region: String::new(),
        endpoint: None,
        access_key_id: None,
        secret_access_key: None,
        prefix: None,
    })
}

fn ensure_server(config: &mut RuntimeConfig) -> &mut ServerConfig {
    config.server.get_or_insert_with(ServerConfig::default)
}

/// Look up `ARCHIVER_<key>` first, then the raw alias if one is given.
fn get_env_string<E: EnvSource>(env: &E, key: &str, raw_alias: Option<&str>) -> Option<EnvValue> {
    if let Some(value) = env.get(key) {
        return Some(EnvValue {
            name: format!("{}{}", ENV_PREFIX, key),
            value,
        });
    }

    raw_alias.and_then(|alias| {
        env.get_raw(alias).map(|value| EnvValue {
            name: alias.to_string(),
            value,
        })
    })
}

fn get_env_parsed<T, E>(env: &E, key: &str, raw_alias: Option<&str>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    E: EnvSource,
{
    match get_env_string(env, key, raw_alias) {
        Some(found) => {
            let parsed = found
                .value
                .trim()
                .parse::<T>()
                .map_err(|e| anyhow!("Failed to parse {}: {}", found.name, e))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn normalize_prefix(prefix: String) -> Option<String> {
    if prefix.is_empty() {
        None
    } else if prefix.ends_with('/') {
        Some(prefix)
    } else {
        Some(format!("{}/", prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct TestEnv {
        prefixed: HashMap<String, String>,
        raw: HashMap<String, String>,
    }

    impl TestEnv {
        fn with(mut self, key: &str, value: &str) -> Self {
            self.prefixed.insert(key.to_string(), value.to_string());
            self
        }

        fn with_raw(mut self, key: &str, value: &str) -> Self {
            self.raw.insert(key.to_string(), value.to_string());
            self
        }
    }

    impl EnvSource for TestEnv {
        fn get(&self, key: &str) -> Option<String> {
            self.prefixed.get(key).cloned()
        }

        fn get_raw(&self, key: &str) -> Option<String> {
            self.raw.get(key).cloned()
        }
    }

    #[test]
    fn legacy_raw_names_are_honoured() {
        let env = TestEnv::default()
            .with_raw("FLUSH_EVERY_MS", "2500")
            .with_raw("MAX_BUFFER", "10")
            .with_raw("S3_BUCKET", "other-bucket")
            .with_raw("S3_ENDPOINT", "http://minio:9000")
            .with_raw("S3_ACCESS_KEY", "key")
            .with_raw("S3_SECRET_KEY", "secret");

        let mut config = RuntimeConfig::from_defaults();
        apply_env_overrides(&mut config, &env).unwrap();

        assert_eq!(config.archive.flush_every_ms, 2_500);
        assert_eq!(config.archive.max_buffer, 10);
        let s3 = config.storage.s3.unwrap();
        assert_eq!(s3.bucket, "other-bucket");
        assert_eq!(s3.endpoint.as_deref(), Some("http://minio:9000"));
        assert_eq!(s3.access_key_id.as_deref(), Some("key"));
        assert_eq!(s3.secret_access_key.as_deref(), Some("secret"));
    }

    #[test]
    fn aws_credentials_fill_in_when_s3_keys_absent() {
        let env = TestEnv::default()
            .with_raw("AWS_ACCESS_KEY_ID", "aws-key")
            .with_raw("AWS_SECRET_ACCESS_KEY", "aws-secret");

        let mut config = RuntimeConfig::from_defaults();
        apply_env_overrides(&mut config, &env).unwrap();

        let s3 = config.storage.s3.unwrap();
        assert_eq!(s3.access_key_id.as_deref(), Some("aws-key"));
        assert_eq!(s3.secret_access_key.as_deref(), Some("aws-secret"));
    }

    #[test]
    fn storage_and_broker_overrides() {
        let env = TestEnv::default()
            .with("STORAGE_BACKEND", "fs")
            .with("STORAGE_PATH", "/var/archive")
            .with("BROKER_TOPIC", "events_v2")
            .with("BROKER_GROUP_ID", "archiver-b")
            .with("PARTITION_MODE", "split")
            .with("S3_PREFIX", "cold")
            .with("LOG_FORMAT", "JSON");

        let mut config = RuntimeConfig::from_defaults();
        apply_env_overrides(&mut config, &env).unwrap();

        assert_eq!(config.storage.backend, StorageBackend::Fs);
        assert_eq!(config.storage.fs.unwrap().path, "/var/archive");
        assert_eq!(config.broker.topic, "events_v2");
        assert_eq!(config.broker.group_id, "archiver-b");
        assert_eq!(config.archive.partition_mode, crate::PartitionMode::Split);
        assert_eq!(config.storage.s3.unwrap().prefix.as_deref(), Some("cold/"));
        assert_eq!(config.server.unwrap().log_format, LogFormat::Json);
    }

    #[test]
    fn parse_error_names_the_variable() {
        let env = TestEnv::default().with_raw("FLUSH_EVERY_MS", "soon");
        let mut config = RuntimeConfig::from_defaults();
        let err = apply_env_overrides(&mut config, &env).unwrap_err();
        assert!(err.to_string().contains("FLUSH_EVERY_MS"));
        assert!(!err.to_string().contains(ENV_PREFIX));
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix(String::new()), None);
        assert_eq!(normalize_prefix("a".to_string()).as_deref(), Some("a/"));
        assert_eq!(normalize_prefix("a/".to_string()).as_deref(), Some("a/"));
    }
}
