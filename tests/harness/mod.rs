//! Shared fixtures for the integration tests.
//!
//! `TestWriter` stands in for object storage: it records every successful
//! write, can be switched into a failing mode, and can hold each write open
//! for a while to widen race windows.

#![allow(dead_code)]

use archiver_config::PartitionMode;
use async_trait::async_trait;
use bytes::Bytes;
use event_archiver::batch::BufferedRecord;
use event_archiver::writer::{ObjectWriter, WriterError};
use event_archiver::EngineSettings;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
pub struct TestWriter {
    objects: Mutex<Vec<(String, Bytes)>>,
    failing: AtomicBool,
    delay_ms: AtomicU64,
    attempts: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl TestWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        let writer = Self::default();
        writer
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
        Arc::new(writer)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn objects(&self) -> Vec<(String, Bytes)> {
        self.objects.lock().clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    /// Body of each written object, as lines.
    pub fn bodies(&self) -> Vec<Vec<String>> {
        self.objects
            .lock()
            .iter()
            .map(|(_, body)| {
                String::from_utf8_lossy(body)
                    .lines()
                    .map(str::to_string)
                    .collect()
            })
            .collect()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectWriter for TestWriter {
    async fn write(&self, key: &str, payload: Bytes, _content_type: &str) -> Result<(), WriterError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.load(Ordering::SeqCst) {
            return Err(WriterError::write_failure(format!(
                "injected failure for {}",
                key
            )));
        }

        self.objects.lock().push((key.to_string(), payload));
        Ok(())
    }
}

pub fn settings(max_buffer: usize, flush_every: Duration) -> EngineSettings {
    EngineSettings {
        flush_every,
        max_buffer,
        partition_mode: PartitionMode::FirstRecord,
        prefix: None,
    }
}

pub fn record(tenant: &str, time: &str, value: &str) -> BufferedRecord {
    BufferedRecord::new(tenant, value.to_string(), time)
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 2s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
