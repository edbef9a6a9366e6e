// Graceful shutdown
//
// Stops the receive loop and the flush timer, refuses further appends, runs a
// final bounded flush and releases the broker connection. Offsets are only
// committed by a successful final flush; anything else stays at the broker for
// the next consumer of the group.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::MessageSource;
use crate::engine::{run_flush_timer, ArchiveEngine, EngineError, FlushOutcome};
use crate::ingest::IngestLoop;

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("shutdown did not finish within {0:?}")]
    Timeout(Duration),

    #[error("final flush failed: {0}")]
    Flush(#[from] EngineError),
}

/// Owns the background tasks of one archiver instance.
pub struct ShutdownCoordinator {
    engine: Arc<ArchiveEngine>,
    source: Arc<dyn MessageSource>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Spawn the ingest loop and the flush timer.
    pub fn start(
        engine: Arc<ArchiveEngine>,
        source: Arc<dyn MessageSource>,
        check_interval: Duration,
        timeout: Duration,
    ) -> Self {
        let token = CancellationToken::new();

        let ingest = IngestLoop::new(Arc::clone(&source), Arc::clone(&engine));
        let ingest_handle = tokio::spawn(ingest.run(token.child_token()));

        let timer_handle = tokio::spawn(run_flush_timer(
            Arc::clone(&engine),
            check_interval,
            token.child_token(),
        ));

        Self {
            engine,
            source,
            token,
            tasks: vec![ingest_handle, timer_handle],
            timeout,
        }
    }

    pub fn engine(&self) -> &Arc<ArchiveEngine> {
        &self.engine
    }

    /// Drain and stop. Consumes the coordinator; call it once.
    ///
    /// One deadline of `timeout` covers waiting for the background tasks
    /// (including a flush they already started) and the final flush. When it
    /// expires the remaining work is cancelled, unwritten records go back to
    /// the buffer, nothing further is committed, and the consumer is still
    /// released.
    pub async fn shutdown(self) -> Result<FlushOutcome, ShutdownError> {
        info!(
            buffered = self.engine.buffered(),
            "Stopping ingest loop and flush timer"
        );
        let deadline = Instant::now() + self.timeout;
        self.token.cancel();

        let mut tasks = self.tasks;
        let joined = tokio::time::timeout_at(deadline, async {
            while let Some(handle) = tasks.first_mut() {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Background task ended abnormally");
                }
                tasks.remove(0);
            }
        })
        .await;

        self.engine.close();

        let result = match joined {
            Err(_) => {
                for handle in &tasks {
                    handle.abort();
                }
                for handle in tasks {
                    let _ = handle.await;
                }
                error!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    buffered = self.engine.buffered(),
                    "Background tasks did not stop in time; offsets left uncommitted"
                );
                Err(ShutdownError::Timeout(self.timeout))
            }
            Ok(()) => match tokio::time::timeout_at(deadline, self.engine.flush()).await {
                Ok(Ok(outcome)) => {
                    info!(records = outcome.records(), "Final flush complete");
                    Ok(outcome)
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Final flush failed; offsets left uncommitted");
                    Err(ShutdownError::Flush(e))
                }
                Err(_) => {
                    error!(
                        timeout_ms = self.timeout.as_millis() as u64,
                        buffered = self.engine.buffered(),
                        "Final flush timed out; offsets left uncommitted"
                    );
                    Err(ShutdownError::Timeout(self.timeout))
                }
            },
        };

        if let Err(e) = self.source.close().await {
            warn!(error = %e, "Failed to release broker connection");
        } else {
            debug!("Broker connection released");
        }

        result
    }
}
