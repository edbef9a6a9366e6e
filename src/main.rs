use anyhow::{Context, Result};
use clap::Parser;
use event_archiver::RuntimeConfig;
use std::path::PathBuf;

/// Archive per-tenant broker events into partitioned object storage
#[derive(Parser)]
#[command(name = "event-archiver")]
#[command(version)]
#[command(about = "Archive per-tenant broker events into partitioned object storage", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// HTTP listen port (overrides config file)
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Output directory for archived batches (switches to the filesystem backend)
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short = 'v', long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let mut config = if let Some(config_path) = &cli.config {
        RuntimeConfig::load_from_path(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        RuntimeConfig::load_or_default().context("Failed to load configuration")?
    };

    apply_cli_overrides(&mut config, &cli);

    // run_with_config initializes tracing again; that call is a no-op
    event_archiver::init_tracing(&config);

    display_startup_info(&config);

    event_archiver::run_with_config(config).await
}

fn apply_cli_overrides(config: &mut RuntimeConfig, cli: &Cli) {
    use archiver_config::{ServerConfig, StorageBackend};

    if let Some(port) = cli.port {
        let server = config.server.get_or_insert_with(ServerConfig::default);
        server.listen_addr = format!("0.0.0.0:{}", port);
    }

    if let Some(output) = &cli.output {
        config.storage.backend = StorageBackend::Fs;
        let fs_config = config.storage.fs.get_or_insert_with(Default::default);
        fs_config.path = output.to_string_lossy().to_string();
    }

    if let Some(level) = &cli.log_level {
        let server = config.server.get_or_insert_with(ServerConfig::default);
        server.log_level = level.clone();
    }
}

fn display_startup_info(config: &RuntimeConfig) {
    use archiver_config::StorageBackend;
    use tracing::info;

    info!("╭─────────────────────────────────────────────────");
    info!("│ event-archiver v{}", env!("CARGO_PKG_VERSION"));
    info!("├─────────────────────────────────────────────────");
    if let Some(server) = &config.server {
        info!("│ Listen address: http://{}", server.listen_addr);
        info!("│ Log level: {}", server.log_level);
    }
    info!("│ Storage backend: {}", config.storage.backend);

    match config.storage.backend {
        StorageBackend::Fs => {
            if let Some(fs) = &config.storage.fs {
                info!("│ Output directory: {}", fs.path);
            }
        }
        StorageBackend::S3 => {
            if let Some(s3) = &config.storage.s3 {
                info!("│ S3 bucket: {}", s3.bucket);
                info!("│ S3 region: {}", s3.region);
                if let Some(prefix) = &s3.prefix {
                    info!("│ Key prefix: {}", prefix);
                }
            }
        }
    }

    info!(
        "│ Broker: topic={} group={}",
        config.broker.topic, config.broker.group_id
    );
    info!("│ Flush every: {}ms", config.archive.flush_every_ms);
    info!("│ Max buffer: {} records", config.archive.max_buffer);
    info!("│ Partition mode: {}", config.archive.partition_mode);
    info!("╰─────────────────────────────────────────────────");
}
