//! Broker seam.
//!
//! The archiver only needs three things from a broker: the next message,
//! a way to commit what has been durably archived, and a way to let go of the
//! connection. [`MessageSource`] captures exactly that so the engine can be
//! driven by the in-process [`memory::MemoryBroker`] or any external client.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use thiserror::Error;

pub mod memory;

pub use memory::{MemoryBroker, MemoryConsumer};

/// Position of a message within a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageOffset {
    pub partition: u32,
    pub offset: u64,
}

/// A message as delivered to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Routing key; the archiver reads the tenant id from it.
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub offset: MessageOffset,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("topic '{0}' does not exist")]
    UnknownTopic(String),

    #[error("topic '{0}' already exists")]
    TopicExists(String),

    #[error("topic '{topic}' has no partition {partition}")]
    UnknownPartition { topic: String, partition: u32 },

    #[error("topic '{0}' must have at least one partition")]
    NoPartitions(String),
}

/// Commits consumer progress once records are durably archived.
#[async_trait]
pub trait OffsetCommitter: Send + Sync {
    /// Mark every message up to and including each given offset as processed.
    ///
    /// Offsets lower than the currently committed position are ignored.
    async fn commit(&self, offsets: &[MessageOffset]) -> Result<(), BrokerError>;
}

/// A subscribed consumer.
#[async_trait]
pub trait MessageSource: OffsetCommitter {
    /// Wait for the next message. `Ok(None)` means the source was closed.
    async fn recv(&self) -> Result<Option<BrokerMessage>, BrokerError>;

    /// Release the connection. Pending `recv` calls return `Ok(None)`.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Collapse a set of offsets to the highest one per partition.
pub fn highest_per_partition<I>(offsets: I) -> Vec<MessageOffset>
where
    I: IntoIterator<Item = MessageOffset>,
{
    let mut highest: BTreeMap<u32, u64> = BTreeMap::new();
    for offset in offsets {
        highest
            .entry(offset.partition)
            .and_modify(|current| *current = (*current).max(offset.offset))
            .or_insert(offset.offset);
    }

    highest
        .into_iter()
        .map(|(partition, offset)| MessageOffset { partition, offset })
        .collect()
}
