// Broker receive loop
//
// Turns broker messages into buffered records and evaluates the size trigger
// after every append. Per-message problems are logged and counted, never
// fatal; the loop only stops when cancelled or when the source closes.

use bytes::Bytes;
use metrics::counter;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::batch::BufferedRecord;
use crate::broker::{BrokerMessage, MessageSource};
use crate::engine::{ArchiveEngine, EngineError};

/// Tenant used when a message carries no routing key.
pub const UNKNOWN_TENANT: &str = "unknown";

/// Shortest event time that still holds a date and an hour (`YYYY-MM-DDTHH`).
const MIN_EVENT_TIME_LEN: usize = 13;

/// Why a payload's event time could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnparseablePayload {
    #[error("payload is not valid JSON")]
    NotJson,
    #[error("payload is not a JSON object")]
    NotObject,
    #[error("payload has no string 'time' field")]
    MissingTime,
    #[error("'time' value '{0}' is too short to hold a date and hour")]
    TimeTooShort(String),
}

/// Extract the `time` field from a JSON object payload.
pub fn parse_event_time(raw: &[u8]) -> Result<String, UnparseablePayload> {
    let value: serde_json::Value =
        serde_json::from_slice(raw).map_err(|_| UnparseablePayload::NotJson)?;
    let object = value.as_object().ok_or(UnparseablePayload::NotObject)?;
    let time = object
        .get("time")
        .and_then(|t| t.as_str())
        .ok_or(UnparseablePayload::MissingTime)?;

    if time.len() < MIN_EVENT_TIME_LEN || !time.is_char_boundary(MIN_EVENT_TIME_LEN) {
        return Err(UnparseablePayload::TimeTooShort(time.to_string()));
    }

    Ok(time.to_string())
}

/// Current UTC time in the millisecond ISO-8601 form used for fallbacks.
pub fn wall_clock_event_time() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}

/// Build a buffered record from a broker message.
///
/// Returns `None` for a missing or empty value. The payload is kept verbatim
/// even when its event time cannot be read.
pub fn record_from_message(message: &BrokerMessage) -> Option<BufferedRecord> {
    let value = message.value.as_ref().filter(|v| !v.is_empty())?;

    let tenant_id: Arc<str> = match &message.key {
        Some(key) if !key.is_empty() => Arc::from(String::from_utf8_lossy(key).as_ref()),
        _ => Arc::from(UNKNOWN_TENANT),
    };

    let event_time = parse_event_time(value).unwrap_or_else(|reason| {
        debug!(
            partition = message.offset.partition,
            offset = message.offset.offset,
            %reason,
            "Using wall-clock event time"
        );
        wall_clock_event_time()
    });

    Some(
        BufferedRecord::new(tenant_id, Bytes::clone(value), event_time)
            .with_offset(message.offset),
    )
}

/// Receive loop: pull, append, size-check.
pub struct IngestLoop<S: MessageSource + ?Sized> {
    source: Arc<S>,
    engine: Arc<ArchiveEngine>,
}

impl<S: MessageSource + ?Sized> IngestLoop<S> {
    pub fn new(source: Arc<S>, engine: Arc<ArchiveEngine>) -> Self {
        Self { source, engine }
    }

    /// Run until `shutdown` is cancelled or the source closes.
    ///
    /// Cancellation is only raced against `recv`; a size-triggered flush that
    /// has started completes before the loop observes it.
    pub async fn run(self, shutdown: CancellationToken) {
        debug!("Ingest loop started");

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.source.recv() => received,
            };

            let message = match received {
                Ok(Some(message)) => message,
                Ok(None) => {
                    debug!("Message source closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to receive message");
                    counter!("archiver.ingest.rejected", 1);
                    continue;
                }
            };

            let Some(record) = record_from_message(&message) else {
                counter!("archiver.records.skipped", 1);
                continue;
            };

            match self.engine.append_and_check(record).await {
                Ok(_) => {}
                Err(EngineError::Closed) => {
                    warn!(
                        partition = message.offset.partition,
                        offset = message.offset.offset,
                        "Engine closed; message left uncommitted"
                    );
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Size-triggered flush failed; records kept in buffer");
                }
            }
        }

        debug!("Ingest loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MessageOffset;

    fn message(key: Option<&str>, value: Option<&str>) -> BrokerMessage {
        BrokerMessage {
            key: key.map(|k| Bytes::copy_from_slice(k.as_bytes())),
            value: value.map(|v| Bytes::copy_from_slice(v.as_bytes())),
            offset: MessageOffset {
                partition: 0,
                offset: 7,
            },
        }
    }

    #[test]
    fn parses_time_from_json_object() {
        let time = parse_event_time(br#"{"time":"2025-12-20T12:34:56.789Z","x":1}"#).unwrap();
        assert_eq!(time, "2025-12-20T12:34:56.789Z");
    }

    #[test]
    fn rejects_unusable_payloads() {
        assert_eq!(parse_event_time(b"not json"), Err(UnparseablePayload::NotJson));
        assert_eq!(parse_event_time(b"[1,2]"), Err(UnparseablePayload::NotObject));
        assert_eq!(
            parse_event_time(br#"{"time":17}"#),
            Err(UnparseablePayload::MissingTime)
        );
        assert!(matches!(
            parse_event_time(br#"{"time":"2025-12"}"#),
            Err(UnparseablePayload::TimeTooShort(_))
        ));
    }

    #[test]
    fn wall_clock_time_is_partitionable() {
        let now = wall_clock_event_time();
        assert_eq!(now.len(), 24);
        assert!(now.ends_with('Z'));
        assert_eq!(&now[10..11], "T");
    }

    #[test]
    fn empty_or_missing_values_are_skipped() {
        assert!(record_from_message(&message(Some("t1"), None)).is_none());
        assert!(record_from_message(&message(Some("t1"), Some(""))).is_none());
    }

    #[test]
    fn missing_key_means_unknown_tenant() {
        let record =
            record_from_message(&message(None, Some(r#"{"time":"2025-12-20T12:00:00Z"}"#)))
                .unwrap();
        assert_eq!(&*record.tenant_id, UNKNOWN_TENANT);
        assert_eq!(record.event_time, "2025-12-20T12:00:00Z");
        assert_eq!(
            record.offset,
            Some(MessageOffset {
                partition: 0,
                offset: 7
            })
        );
    }

    #[test]
    fn malformed_payload_is_kept_verbatim() {
        let record = record_from_message(&message(Some("t9"), Some("{broken"))).unwrap();
        assert_eq!(&*record.tenant_id, "t9");
        assert_eq!(record.raw_value, Bytes::from_static(b"{broken"));
        assert_eq!(record.event_time.len(), 24);
    }
}
