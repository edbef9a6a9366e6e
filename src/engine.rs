// Buffering and flush engine
//
// Owns the buffer, the last-successful-flush instant and the flush epoch of
// one archiver instance. Both triggers (periodic timer, buffer size) funnel
// into `flush()`, which is serialized by an async in-flight guard so a timer
// tick arriving mid-write waits instead of draining a second batch.

use archiver_config::{PartitionMode, RuntimeConfig};
use metrics::{counter, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::{BufferStore, BufferedRecord};
use crate::broker::{highest_per_partition, MessageOffset, OffsetCommitter};
use crate::writer::{
    encode_ndjson, storage_prefix, ObjectWriter, PartitionKey, WriterError, CONTENT_TYPE_NDJSON,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("archive engine is closed; record refused")]
    Closed,

    #[error(transparent)]
    Write(#[from] WriterError),

    #[error("{failed} of {total} partition objects failed to write: {source}")]
    PartialWrite {
        failed: usize,
        total: usize,
        written: Vec<String>,
        #[source]
        source: WriterError,
    },
}

/// Flush thresholds and key layout.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub flush_every: Duration,
    pub max_buffer: usize,
    pub partition_mode: PartitionMode,
    pub prefix: Option<String>,
}

impl EngineSettings {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            flush_every: config.archive.flush_every(),
            max_buffer: config.archive.max_buffer,
            partition_mode: config.archive.partition_mode,
            prefix: storage_prefix(&config.storage),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

/// Result of one `flush()` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was buffered; no write happened.
    Empty,
    Written(FlushReport),
}

impl FlushOutcome {
    pub fn records(&self) -> usize {
        match self {
            FlushOutcome::Empty => 0,
            FlushOutcome::Written(report) => report.records,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub records: usize,
    pub epoch_millis: u64,
    pub objects: Vec<String>,
    /// Offsets handed to the committer (highest per partition).
    pub committed: Vec<MessageOffset>,
}

#[derive(Debug, Default)]
struct FlushState {
    last_epoch_millis: u64,
}

impl FlushState {
    /// Wall-clock millis, bumped so that two flushes never share an epoch.
    fn next_epoch(&mut self) -> u64 {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let epoch = now.max(self.last_epoch_millis + 1);
        self.last_epoch_millis = epoch;
        epoch
    }
}

pub struct ArchiveEngine {
    buffer: BufferStore,
    flush_gate: tokio::sync::Mutex<FlushState>,
    last_flush: parking_lot::Mutex<Instant>,
    writer: Arc<dyn ObjectWriter>,
    committer: Option<Arc<dyn OffsetCommitter>>,
    settings: EngineSettings,
    closed: AtomicBool,
}

impl std::fmt::Debug for ArchiveEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveEngine")
            .field("buffered", &self.buffer.len())
            .field("settings", &self.settings)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl ArchiveEngine {
    pub fn new(writer: Arc<dyn ObjectWriter>, settings: EngineSettings) -> Self {
        Self {
            buffer: BufferStore::new(),
            flush_gate: tokio::sync::Mutex::new(FlushState::default()),
            last_flush: parking_lot::Mutex::new(Instant::now()),
            writer,
            committer: None,
            settings,
            closed: AtomicBool::new(false),
        }
    }

    /// Commit broker offsets through `committer` after every successful flush.
    pub fn with_committer(mut self, committer: Arc<dyn OffsetCommitter>) -> Self {
        self.committer = Some(committer);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Refuse further appends. Already buffered records stay for the final flush.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(buffered = self.buffer.len(), "Archive engine closed to new records");
        }
    }

    /// Append without evaluating the size trigger. Returns the buffer length.
    pub fn append(&self, record: BufferedRecord) -> Result<usize, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }

        let len = self.buffer.append(record);
        counter!("archiver.records.appended", 1);
        Ok(len)
    }

    /// Append and flush immediately once the buffer reaches `max_buffer`.
    pub async fn append_and_check(
        &self,
        record: BufferedRecord,
    ) -> Result<Option<FlushOutcome>, EngineError> {
        let len = self.append(record)?;
        if len < self.settings.max_buffer {
            return Ok(None);
        }

        debug!(len, max_buffer = self.settings.max_buffer, "Size trigger fired");
        self.flush().await.map(Some)
    }

    /// Whether the time trigger is due.
    pub fn flush_due(&self) -> bool {
        self.last_flush.lock().elapsed() >= self.settings.flush_every
    }

    /// Time-trigger entry point: flush only when `flush_every` has elapsed.
    pub async fn flush_if_due(&self) -> Result<FlushOutcome, EngineError> {
        if !self.flush_due() {
            return Ok(FlushOutcome::Empty);
        }

        debug!("Time trigger fired");
        self.flush().await
    }

    /// Drain the buffer and write it out.
    ///
    /// An empty buffer returns [`FlushOutcome::Empty`] without touching storage
    /// or the last-flush instant. On failure, or if this future is dropped
    /// mid-write, unwritten records are put back ahead of anything appended
    /// meanwhile.
    pub async fn flush(&self) -> Result<FlushOutcome, EngineError> {
        let mut state = self.flush_gate.lock().await;

        let drained = self.buffer.drain();
        if drained.is_empty() {
            return Ok(FlushOutcome::Empty);
        }

        let epoch_millis = state.next_epoch();
        let records = drained.len();
        let mut batch = InFlightBatch::new(&self.buffer, drained);

        let paths = match self.settings.partition_mode {
            PartitionMode::FirstRecord => self.write_single(&mut batch, epoch_millis).await?,
            PartitionMode::Split => self.write_split(&mut batch, epoch_millis).await?,
        };
        let offsets: Vec<MessageOffset> = batch.records.iter().filter_map(|r| r.offset).collect();
        drop(batch);

        *self.last_flush.lock() = Instant::now();
        counter!("archiver.flush.objects", paths.len() as u64);
        histogram!("archiver.flush.records", records as f64);

        let committed = self.commit(&offsets).await;

        info!(
            records,
            objects = paths.len(),
            epoch_millis,
            "Flushed batch"
        );

        Ok(FlushOutcome::Written(FlushReport {
            records,
            epoch_millis,
            objects: paths,
            committed,
        }))
    }

    async fn write_single(
        &self,
        batch: &mut InFlightBatch<'_>,
        epoch_millis: u64,
    ) -> Result<Vec<String>, EngineError> {
        let key = PartitionKey::derive(&batch.records[0], epoch_millis);
        let path = key.object_path(self.settings.prefix.as_deref());
        let payload = encode_ndjson(&batch.records);

        if let Err(e) = self
            .writer
            .write(&path, payload, CONTENT_TYPE_NDJSON)
            .await
        {
            warn!(
                error = %e,
                path = %path,
                records = batch.records.len(),
                "Flush failed; records returned to buffer"
            );
            counter!("archiver.flush.failures", 1);
            return Err(e.into());
        }

        batch.mark_written(0..batch.records.len());
        Ok(vec![path])
    }

    async fn write_split(
        &self,
        batch: &mut InFlightBatch<'_>,
        epoch_millis: u64,
    ) -> Result<Vec<String>, EngineError> {
        // Groups in first-seen order, holding indices into the batch.
        let mut groups: Vec<(PartitionKey, Vec<usize>)> = Vec::new();
        for (idx, record) in batch.records.iter().enumerate() {
            let key = PartitionKey::derive(record, epoch_millis);
            match groups.iter_mut().find(|(k, _)| k.same_partition(&key)) {
                Some((_, members)) => members.push(idx),
                None => groups.push((key, vec![idx])),
            }
        }

        let total = groups.len();
        let mut paths = Vec::with_capacity(total);
        let mut first_error = None;
        let mut failed_groups = 0;

        for (key, members) in groups {
            let path = key.object_path(self.settings.prefix.as_deref());
            let group: Vec<BufferedRecord> =
                members.iter().map(|&i| batch.records[i].clone()).collect();

            match self
                .writer
                .write(&path, encode_ndjson(&group), CONTENT_TYPE_NDJSON)
                .await
            {
                Ok(()) => {
                    batch.mark_written(members);
                    paths.push(path);
                }
                Err(e) => {
                    warn!(error = %e, path = %path, records = members.len(), "Partition write failed");
                    counter!("archiver.flush.failures", 1);
                    failed_groups += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        let Some(source) = first_error else {
            return Ok(paths);
        };

        warn!(
            failed_groups,
            written = paths.len(),
            "Partial flush; failed partitions returned to buffer"
        );

        if paths.is_empty() {
            return Err(EngineError::Write(source));
        }

        Err(EngineError::PartialWrite {
            failed: failed_groups,
            total,
            written: paths,
            source,
        })
    }

    async fn commit(&self, offsets: &[MessageOffset]) -> Vec<MessageOffset> {
        let Some(committer) = &self.committer else {
            return Vec::new();
        };

        let highest = highest_per_partition(offsets.iter().copied());
        if highest.is_empty() {
            return highest;
        }

        // A failed commit is not retried; the next successful flush covers it.
        if let Err(e) = committer.commit(&highest).await {
            warn!(error = %e, "Offset commit failed after successful flush");
            return Vec::new();
        }

        highest
    }
}

/// Records drained for one flush.
///
/// Whatever is not marked written when this drops goes back to the front of
/// the buffer. That covers write errors and a flush future cancelled mid-write.
struct InFlightBatch<'a> {
    buffer: &'a BufferStore,
    records: Vec<BufferedRecord>,
    written: Vec<bool>,
}

impl<'a> InFlightBatch<'a> {
    fn new(buffer: &'a BufferStore, records: Vec<BufferedRecord>) -> Self {
        let written = vec![false; records.len()];
        Self {
            buffer,
            records,
            written,
        }
    }

    fn mark_written(&mut self, indices: impl IntoIterator<Item = usize>) {
        for idx in indices {
            self.written[idx] = true;
        }
    }
}

impl Drop for InFlightBatch<'_> {
    fn drop(&mut self) {
        let records = std::mem::take(&mut self.records);
        let written = std::mem::take(&mut self.written);
        let unwritten: Vec<BufferedRecord> = records
            .into_iter()
            .zip(written)
            .filter_map(|(record, written)| (!written).then_some(record))
            .collect();

        if !unwritten.is_empty() {
            debug!(records = unwritten.len(), "Unwritten records returned to buffer");
            self.buffer.restore(unwritten);
        }
    }
}

/// Periodic time trigger.
///
/// Checks every `interval` and flushes when the engine's `flush_every` has
/// elapsed. Cancellation is only observed between ticks, so a flush that has
/// started always runs to completion.
pub async fn run_flush_timer(
    engine: Arc<ArchiveEngine>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    debug!(interval_ms = interval.as_millis() as u64, "Flush timer started");

    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = engine.flush_if_due().await {
            warn!(error = %e, "Timed flush failed; will retry on next tick");
        }
    }

    debug!("Flush timer stopped");
}
