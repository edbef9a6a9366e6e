//! Batch object writer.
//!
//! Key derivation, NDJSON encoding and the storage seam used by the flush path.

mod error;
mod partition;
mod storage;
mod write;

pub use error::{ErrorCode, Result, WriterError};
pub use partition::PartitionKey;
pub use storage::{build_operator, ensure_bucket, storage_prefix};
pub use write::{encode_ndjson, ObjectWriter, OpendalObjectWriter, CONTENT_TYPE_NDJSON};
