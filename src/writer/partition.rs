//! Object key derivation.
//!
//! Keys follow the Hive-style layout consumed by the query side:
//! `tenant_id=<tenant>/date=<YYYY-MM-DD>/hour=<HH>/batch_<epochMillis>.jsonl`.
//! Date and hour are sliced straight out of the record's ISO-8601 event time;
//! no timezone conversion happens here.

use chrono::{TimeZone, Utc};
use std::borrow::Cow;
use std::fmt;

use crate::batch::BufferedRecord;

/// Partition coordinates of one flushed object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub tenant_id: String,
    pub date: String,
    pub hour: String,
    pub flush_epoch_millis: u64,
}

impl PartitionKey {
    /// Derive the key for a batch represented by `record`.
    pub fn derive(record: &BufferedRecord, flush_epoch_millis: u64) -> Self {
        let (date, hour) = match (record.event_time.get(0..10), record.event_time.get(11..13)) {
            (Some(date), Some(hour)) => (date.to_string(), hour.to_string()),
            // Records built through the ingest path always carry a usable time;
            // anything else is filed under the flush epoch.
            _ => epoch_partition(flush_epoch_millis),
        };

        Self {
            tenant_id: sanitize_tenant_id(&record.tenant_id).into_owned(),
            date,
            hour,
            flush_epoch_millis,
        }
    }

    /// Whether two keys name the same tenant/date/hour directory.
    pub fn same_partition(&self, other: &PartitionKey) -> bool {
        self.tenant_id == other.tenant_id && self.date == other.date && self.hour == other.hour
    }

    /// Full object path under an optional storage prefix. A prefix without a
    /// trailing '/' is treated as a directory and gets one.
    pub fn object_path(&self, prefix: Option<&str>) -> String {
        match prefix {
            Some(prefix) if !prefix.is_empty() && !prefix.ends_with('/') => {
                format!("{}/{}", prefix, self)
            }
            Some(prefix) => format!("{}{}", prefix, self),
            None => self.to_string(),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tenant_id={}/date={}/hour={}/batch_{}.jsonl",
            self.tenant_id, self.date, self.hour, self.flush_epoch_millis
        )
    }
}

fn epoch_partition(flush_epoch_millis: u64) -> (String, String) {
    let at = i64::try_from(flush_epoch_millis)
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);
    (at.format("%Y-%m-%d").to_string(), at.format("%H").to_string())
}

/// Replace path separators so a tenant id can never leave its directory.
fn sanitize_tenant_id(tenant_id: &str) -> Cow<'_, str> {
    const SEPARATORS: [char; 2] = ['/', '\\'];

    if tenant_id.contains(SEPARATORS) {
        Cow::Owned(tenant_id.replace(SEPARATORS, "_"))
    } else {
        Cow::Borrowed(tenant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tenant: &str, time: &str) -> BufferedRecord {
        BufferedRecord::new(tenant, "{}", time)
    }

    #[test]
    fn derives_hive_style_key() {
        let key = PartitionKey::derive(&record("t1", "2025-12-20T12:34:56.789Z"), 1_700_000_000_000);
        assert_eq!(
            key.object_path(None),
            "tenant_id=t1/date=2025-12-20/hour=12/batch_1700000000000.jsonl"
        );
    }

    #[test]
    fn prefix_is_prepended() {
        let key = PartitionKey::derive(&record("t1", "2025-12-20T12:34:56.789Z"), 42);
        assert_eq!(
            key.object_path(Some("archive/")),
            "archive/tenant_id=t1/date=2025-12-20/hour=12/batch_42.jsonl"
        );
        assert_eq!(
            key.object_path(Some("")),
            "tenant_id=t1/date=2025-12-20/hour=12/batch_42.jsonl"
        );
    }

    #[test]
    fn prefix_without_slash_gets_one() {
        let key = PartitionKey::derive(&record("t1", "2025-12-20T12:34:56.789Z"), 42);
        assert_eq!(
            key.object_path(Some("archive")),
            "archive/tenant_id=t1/date=2025-12-20/hour=12/batch_42.jsonl"
        );
        assert_eq!(
            key.object_path(Some("cold/archive")),
            "cold/archive/tenant_id=t1/date=2025-12-20/hour=12/batch_42.jsonl"
        );
    }

    #[test]
    fn slicing_ignores_timezone_offset() {
        let key = PartitionKey::derive(&record("t1", "2025-12-20T23:59:00+05:00"), 1);
        assert_eq!(key.date, "2025-12-20");
        assert_eq!(key.hour, "23");
    }

    #[test]
    fn tenant_separators_are_replaced() {
        let key = PartitionKey::derive(&record("../evil/x\\y", "2025-12-20T12:00:00Z"), 1);
        assert_eq!(key.tenant_id, ".._evil_x_y");
        assert!(key.object_path(None).starts_with("tenant_id=.._evil_x_y/date="));
    }

    #[test]
    fn short_event_time_falls_back_to_epoch() {
        let key = PartitionKey::derive(&record("t1", "2025"), 1_700_000_000_000);
        assert_eq!(key.date, "2023-11-14");
        assert_eq!(key.hour, "22");
    }

    #[test]
    fn same_partition_ignores_epoch() {
        let a = PartitionKey::derive(&record("t1", "2025-12-20T12:00:00Z"), 1);
        let b = PartitionKey::derive(&record("t1", "2025-12-20T12:59:59Z"), 2);
        let c = PartitionKey::derive(&record("t2", "2025-12-20T12:00:00Z"), 1);
        assert!(a.same_partition(&b));
        assert!(!a.same_partition(&c));
    }
}
