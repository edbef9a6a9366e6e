// event-archiver - archive per-tenant event streams into partitioned object storage
//
// Consumes events from a broker topic, buffers them per instance and writes
// newline-delimited batch objects under tenant/date/hour keys whenever the
// time or size trigger fires. Offsets are committed after each successful
// write, so a crash means redelivery rather than loss.

pub mod batch;
pub mod broker;
pub mod engine;
mod handlers;
pub mod ingest;
mod init;
pub mod shutdown;
pub mod writer;

pub use archiver_config::RuntimeConfig;
pub use engine::{ArchiveEngine, EngineError, EngineSettings, FlushOutcome, FlushReport};
pub use handlers::TENANT_HEADER;
pub use init::{init_storage, init_tracing};
pub use shutdown::{ShutdownCoordinator, ShutdownError};

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use broker::MemoryBroker;
use serde_json::json;
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use writer::OpendalObjectWriter;

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub broker: MemoryBroker,
    pub topic: Arc<str>,
    pub engine: Arc<ArchiveEngine>,
    pub max_payload_bytes: usize,
}

/// Error type that implements IntoResponse
pub(crate) struct AppError {
    status: StatusCode,
    error: anyhow::Error,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("Request error: {:?}", self.error);
        (
            self.status,
            Json(json!({
                "ok": false,
                "error": self.error.to_string(),
            })),
        )
            .into_response()
    }
}

impl AppError {
    pub fn with_status(status: StatusCode, error: anyhow::Error) -> Self {
        Self { status, error }
    }

    pub fn bad_request<E>(error: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: error.into(),
        }
    }

    pub fn internal<E>(error: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: error.into(),
        }
    }
}

/// Routes of the publish endpoint.
pub fn router(state: AppState) -> Router {
    let body_limit = state.max_payload_bytes;

    Router::new()
        .route("/v1/events", post(handlers::publish_events))
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::ready_check))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wait for SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}

/// Entry point (loads config automatically)
pub async fn run() -> Result<()> {
    let config = RuntimeConfig::load().context("Failed to load configuration")?;
    run_with_config(config).await
}

/// Entry point with pre-loaded configuration (for CLI usage)
pub async fn run_with_config(config: RuntimeConfig) -> Result<()> {
    init_tracing(&config);
    config.validate().context("Invalid configuration")?;

    let addr = config
        .server
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("server config required"))?
        .listen_addr
        .clone();

    // Storage first: without a bucket nothing may be consumed.
    let op = init_storage(&config).await?;

    let broker = MemoryBroker::new();
    broker
        .create_topic(&config.broker.topic, config.broker.partitions)
        .context("Failed to create broker topic")?;
    let consumer = Arc::new(
        broker
            .subscribe(&config.broker.topic, &config.broker.group_id)
            .context("Failed to subscribe to broker topic")?,
    );
    info!(
        topic = %config.broker.topic,
        group = %config.broker.group_id,
        partitions = config.broker.partitions,
        "Subscribed to broker topic"
    );

    let engine = Arc::new(
        ArchiveEngine::new(
            Arc::new(OpendalObjectWriter::new(op)),
            EngineSettings::from_config(&config),
        )
        .with_committer(consumer.clone()),
    );
    info!(
        "Archiving enabled (max_buffer={} flush_every={}ms partition_mode={})",
        config.archive.max_buffer, config.archive.flush_every_ms, config.archive.partition_mode
    );

    let coordinator = ShutdownCoordinator::start(
        Arc::clone(&engine),
        consumer,
        config.archive.flush_check_interval(),
        config.archive.shutdown_timeout(),
    );

    let state = AppState {
        broker,
        topic: Arc::from(config.broker.topic.as_str()),
        engine,
        max_payload_bytes: config.request.max_payload_bytes,
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context(format!("Failed to bind to {}", addr))?;

    info!("Event HTTP endpoint listening on http://{}", addr);
    info!("Routes:");
    info!("  POST http://{}/v1/events - Publish events", addr);
    info!("  GET  http://{}/health    - Health check", addr);
    info!("  GET  http://{}/ready     - Readiness check", addr);
    info!("Press Ctrl+C or send SIGTERM to stop");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    coordinator
        .shutdown()
        .await
        .context("Failed to drain buffered records during shutdown")?;

    info!("Archiver shutdown complete");

    Ok(())
}
