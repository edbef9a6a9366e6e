//! Core write operations for NDJSON batch objects.
//!
//! Serializes buffered records and hands the payload to an [`ObjectWriter`].
//! One call is one create-or-overwrite request; retries are left to the
//! caller's next flush.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use opendal::Operator;

use super::error::{Result, WriterError};
use crate::batch::BufferedRecord;

pub const CONTENT_TYPE_NDJSON: &str = "application/x-ndjson";

/// Durable create/overwrite of a single object.
#[async_trait]
pub trait ObjectWriter: Send + Sync {
    async fn write(&self, key: &str, payload: Bytes, content_type: &str) -> Result<()>;
}

/// [`ObjectWriter`] backed by an OpenDAL operator (S3, MinIO, local fs, memory).
#[derive(Debug, Clone)]
pub struct OpendalObjectWriter {
    op: Operator,
}

impl OpendalObjectWriter {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }
}

#[async_trait]
impl ObjectWriter for OpendalObjectWriter {
    async fn write(&self, key: &str, payload: Bytes, content_type: &str) -> Result<()> {
        let bytes_written = payload.len();

        let result = if self.op.info().full_capability().write_with_content_type {
            self.op
                .write_with(key, payload)
                .content_type(content_type)
                .await
        } else {
            self.op.write(key, payload).await
        };

        result.map_err(|e| {
            WriterError::write_failure(format!("Failed to write object '{}': {}", key, e))
        })?;

        tracing::debug!(key, bytes = bytes_written, "Object written");
        Ok(())
    }
}

/// Join raw record values with `\n`, terminated by a trailing newline.
pub fn encode_ndjson(records: &[BufferedRecord]) -> Bytes {
    let capacity = records.iter().map(|r| r.raw_value.len() + 1).sum();
    let mut body = BytesMut::with_capacity(capacity);
    for record in records {
        body.put_slice(&record.raw_value);
        body.put_u8(b'\n');
    }
    body.freeze()
}
