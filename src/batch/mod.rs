// Buffered record accumulation
//
// Holds the not-yet-flushed records of one archiver instance. The buffer is a
// plain Vec behind a synchronous mutex: every operation is O(1) or a pointer
// swap, and the lock is never held across an await point.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::broker::MessageOffset;

/// One archived event as received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedRecord {
    pub tenant_id: Arc<str>,
    /// Payload bytes exactly as delivered; never re-encoded.
    pub raw_value: Bytes,
    /// ISO-8601 timestamp used for partitioning.
    pub event_time: String,
    /// Broker position, committed once the record is durably written.
    pub offset: Option<MessageOffset>,
}

impl BufferedRecord {
    pub fn new(
        tenant_id: impl Into<Arc<str>>,
        raw_value: impl Into<Bytes>,
        event_time: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            raw_value: raw_value.into(),
            event_time: event_time.into(),
            offset: None,
        }
    }

    pub fn with_offset(mut self, offset: MessageOffset) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Append-only buffer drained atomically by the flush path.
#[derive(Debug, Default)]
pub struct BufferStore {
    records: Mutex<Vec<BufferedRecord>>,
}

impl BufferStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record and return the buffer length including it.
    ///
    /// Returning the length from the same critical section lets the size
    /// trigger act on a consistent count.
    pub fn append(&self, record: BufferedRecord) -> usize {
        let mut guard = self.records.lock();
        guard.push(record);
        guard.len()
    }

    /// Take every buffered record, leaving the buffer empty.
    pub fn drain(&self) -> Vec<BufferedRecord> {
        std::mem::take(&mut *self.records.lock())
    }

    /// Put a drained batch back ahead of anything appended since the drain.
    pub fn restore(&self, mut drained: Vec<BufferedRecord>) {
        if drained.is_empty() {
            return;
        }

        let mut guard = self.records.lock();
        drained.append(&mut guard);
        *guard = drained;
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}
