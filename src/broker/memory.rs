// In-process broker
//
// A small partitioned log with consumer-group offsets. New groups start at the
// end of each partition; a group's position only moves on commit, so a
// consumer that goes away without committing leaves its messages to be
// redelivered to the next consumer of the same group. Messages every group has
// committed past are dropped; offsets stay absolute.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

use super::{BrokerError, BrokerMessage, MessageOffset, MessageSource, OffsetCommitter};

#[derive(Debug)]
struct StoredMessage {
    key: Option<Bytes>,
    value: Option<Bytes>,
}

/// Retained tail of one partition. `base` is the offset of the first message.
#[derive(Debug, Default)]
struct PartitionLog {
    base: u64,
    messages: VecDeque<StoredMessage>,
}

impl PartitionLog {
    /// Offset the next published message will get.
    fn end(&self) -> u64 {
        self.base + self.messages.len() as u64
    }

    fn get(&self, offset: u64) -> Option<&StoredMessage> {
        let index = offset.checked_sub(self.base)?;
        self.messages.get(usize::try_from(index).ok()?)
    }

    /// Drop everything below `offset`, never past the end of the log.
    fn truncate_before(&mut self, offset: u64) -> usize {
        let target = offset.min(self.end());
        let count = target.saturating_sub(self.base) as usize;
        self.messages.drain(..count);
        self.base += count as u64;
        count
    }
}

#[derive(Debug, Default)]
struct Topic {
    partitions: Vec<PartitionLog>,
    /// Next offset to consume, per group and partition.
    committed: HashMap<String, Vec<u64>>,
    round_robin: u32,
}

impl Topic {
    /// Release messages that every group has committed past.
    fn trim(&mut self) -> usize {
        let mut trimmed = 0;
        for (partition, log) in self.partitions.iter_mut().enumerate() {
            let low_water = self
                .committed
                .values()
                .filter_map(|positions| positions.get(partition).copied())
                .min();
            if let Some(low_water) = low_water {
                trimmed += log.truncate_before(low_water);
            }
        }
        trimmed
    }
}

#[derive(Debug, Default)]
struct BrokerInner {
    topics: Mutex<HashMap<String, Topic>>,
    notify: Notify,
}

/// Cloneable handle to an in-process broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_topic(&self, name: &str, partitions: u32) -> Result<(), BrokerError> {
        if partitions == 0 {
            return Err(BrokerError::NoPartitions(name.to_string()));
        }

        let mut topics = self.inner.topics.lock();
        if topics.contains_key(name) {
            return Err(BrokerError::TopicExists(name.to_string()));
        }

        let topic = Topic {
            partitions: (0..partitions).map(|_| PartitionLog::default()).collect(),
            ..Topic::default()
        };
        topics.insert(name.to_string(), topic);
        Ok(())
    }

    /// Append a message. Keyed messages always land on the same partition.
    pub fn publish(
        &self,
        topic: &str,
        key: Option<Bytes>,
        value: Option<Bytes>,
    ) -> Result<MessageOffset, BrokerError> {
        let offset = {
            let mut topics = self.inner.topics.lock();
            let topic_state = topics
                .get_mut(topic)
                .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;

            let partition_count = topic_state.partitions.len() as u32;
            let partition = match &key {
                Some(key) => {
                    let mut hasher = DefaultHasher::new();
                    key.hash(&mut hasher);
                    (hasher.finish() % u64::from(partition_count)) as u32
                }
                None => {
                    let next = topic_state.round_robin % partition_count;
                    topic_state.round_robin = topic_state.round_robin.wrapping_add(1);
                    next
                }
            };

            let log = &mut topic_state.partitions[partition as usize];
            let offset = log.end();
            log.messages.push_back(StoredMessage { key, value });
            MessageOffset { partition, offset }
        };

        self.inner.notify.notify_waiters();
        Ok(offset)
    }

    /// Join `group` on `topic`.
    ///
    /// A group seen for the first time starts at the current end of every
    /// partition (only new messages); otherwise consumption resumes from the
    /// group's committed position.
    pub fn subscribe(&self, topic: &str, group: &str) -> Result<MemoryConsumer, BrokerError> {
        let positions = {
            let mut topics = self.inner.topics.lock();
            let topic_state = topics
                .get_mut(topic)
                .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;

            let ends: Vec<u64> = topic_state
                .partitions
                .iter()
                .map(PartitionLog::end)
                .collect();

            topic_state
                .committed
                .entry(group.to_string())
                .or_insert(ends)
                .clone()
        };

        debug!(topic, group, ?positions, "Consumer subscribed");

        Ok(MemoryConsumer {
            inner: Arc::clone(&self.inner),
            topic: topic.to_string(),
            group: group.to_string(),
            positions: Mutex::new(positions),
            next_partition: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Committed position (next offset to consume) of `group`, per partition.
    pub fn committed(&self, topic: &str, group: &str) -> Option<Vec<u64>> {
        self.inner
            .topics
            .lock()
            .get(topic)
            .and_then(|t| t.committed.get(group).cloned())
    }

    /// Number of messages ever published to `topic`.
    pub fn message_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map(|t| t.partitions.iter().map(|log| log.end() as usize).sum())
            .unwrap_or(0)
    }

    /// Number of messages still held for `topic`, i.e. not yet committed by
    /// every group.
    pub fn retained(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map(|t| t.partitions.iter().map(|log| log.messages.len()).sum())
            .unwrap_or(0)
    }
}

/// Consumer handle returned by [`MemoryBroker::subscribe`].
#[derive(Debug)]
pub struct MemoryConsumer {
    inner: Arc<BrokerInner>,
    topic: String,
    group: String,
    /// Next offset to deliver, per partition.
    positions: Mutex<Vec<u64>>,
    next_partition: AtomicU32,
    closed: AtomicBool,
}

impl MemoryConsumer {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    fn try_next(&self) -> Result<Option<BrokerMessage>, BrokerError> {
        let topics = self.inner.topics.lock();
        let topic = topics
            .get(&self.topic)
            .ok_or_else(|| BrokerError::UnknownTopic(self.topic.clone()))?;
        let mut positions = self.positions.lock();

        let partition_count = topic.partitions.len() as u32;
        let start = self.next_partition.load(Ordering::Relaxed);
        for step in 0..partition_count {
            let partition = (start + step) % partition_count;
            let log = &topic.partitions[partition as usize];
            // Another consumer of the group may have committed past this one.
            let position = positions[partition as usize].max(log.base);
            if let Some(stored) = log.get(position) {
                positions[partition as usize] = position + 1;
                self.next_partition
                    .store((partition + 1) % partition_count, Ordering::Relaxed);
                return Ok(Some(BrokerMessage {
                    key: stored.key.clone(),
                    value: stored.value.clone(),
                    offset: MessageOffset {
                        partition,
                        offset: position,
                    },
                }));
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl OffsetCommitter for MemoryConsumer {
    async fn commit(&self, offsets: &[MessageOffset]) -> Result<(), BrokerError> {
        let mut topics = self.inner.topics.lock();
        let topic = topics
            .get_mut(&self.topic)
            .ok_or_else(|| BrokerError::UnknownTopic(self.topic.clone()))?;
        let partition_count = topic.partitions.len();
        let committed = topic
            .committed
            .entry(self.group.clone())
            .or_insert_with(|| vec![0; partition_count]);

        for offset in offsets {
            let slot = committed.get_mut(offset.partition as usize).ok_or_else(|| {
                BrokerError::UnknownPartition {
                    topic: self.topic.clone(),
                    partition: offset.partition,
                }
            })?;
            *slot = (*slot).max(offset.offset + 1);
        }

        let trimmed = topic.trim();
        debug!(topic = %self.topic, group = %self.group, ?offsets, trimmed, "Committed offsets");
        Ok(())
    }
}

#[async_trait]
impl MessageSource for MemoryConsumer {
    async fn recv(&self) -> Result<Option<BrokerMessage>, BrokerError> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking so a publish in between is not missed.
            notified.as_mut().enable();

            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }

            if let Some(message) = self.try_next()? {
                return Ok(Some(message));
            }

            notified.await;
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        debug!(topic = %self.topic, group = %self.group, "Consumer closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn value(s: &str) -> Option<Bytes> {
        Some(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[tokio::test]
    async fn new_group_only_sees_new_messages() {
        let broker = MemoryBroker::new();
        broker.create_topic("events_raw", 1).unwrap();
        broker.publish("events_raw", None, value("old")).unwrap();

        let consumer = broker.subscribe("events_raw", "archiver").unwrap();
        broker.publish("events_raw", None, value("new")).unwrap();

        let message = consumer.recv().await.unwrap().unwrap();
        assert_eq!(message.value, value("new"));
        assert_eq!(message.offset, MessageOffset { partition: 0, offset: 1 });
    }

    #[tokio::test]
    async fn uncommitted_messages_are_redelivered_to_group() {
        let broker = MemoryBroker::new();
        broker.create_topic("events_raw", 1).unwrap();
        let first = broker.subscribe("events_raw", "archiver").unwrap();

        broker.publish("events_raw", None, value("a")).unwrap();
        broker.publish("events_raw", None, value("b")).unwrap();

        let a = first.recv().await.unwrap().unwrap();
        first.commit(&[a.offset]).await.unwrap();
        let _b = first.recv().await.unwrap().unwrap();
        first.close().await.unwrap();

        let second = broker.subscribe("events_raw", "archiver").unwrap();
        let redelivered = second.recv().await.unwrap().unwrap();
        assert_eq!(redelivered.value, value("b"));
        assert_eq!(broker.committed("events_raw", "archiver"), Some(vec![1]));
    }

    #[tokio::test]
    async fn keyed_messages_stick_to_a_partition() {
        let broker = MemoryBroker::new();
        broker.create_topic("events_raw", 4).unwrap();
        let key = Some(Bytes::from_static(b"tenant-a"));

        let first = broker.publish("events_raw", key.clone(), value("1")).unwrap();
        let second = broker.publish("events_raw", key, value("2")).unwrap();
        assert_eq!(first.partition, second.partition);
        assert_eq!(second.offset, first.offset + 1);
    }

    #[tokio::test]
    async fn close_wakes_pending_recv() {
        let broker = MemoryBroker::new();
        broker.create_topic("events_raw", 1).unwrap();
        let consumer = Arc::new(broker.subscribe("events_raw", "archiver").unwrap());

        let waiter = {
            let consumer = Arc::clone(&consumer);
            tokio::spawn(async move { consumer.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        consumer.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn commit_never_moves_backwards() {
        let broker = MemoryBroker::new();
        broker.create_topic("events_raw", 1).unwrap();
        let consumer = broker.subscribe("events_raw", "archiver").unwrap();

        let offset = |o| MessageOffset { partition: 0, offset: o };
        consumer.commit(&[offset(5)]).await.unwrap();
        consumer.commit(&[offset(2)]).await.unwrap();
        assert_eq!(broker.committed("events_raw", "archiver"), Some(vec![6]));

        let err = consumer
            .commit(&[MessageOffset { partition: 3, offset: 0 }])
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::UnknownPartition { partition: 3, .. }));
    }

    #[tokio::test]
    async fn committed_messages_are_released() {
        let broker = MemoryBroker::new();
        broker.create_topic("events_raw", 2).unwrap();
        let consumer = broker.subscribe("events_raw", "archiver").unwrap();

        for n in 0..10_000 {
            broker
                .publish("events_raw", None, value(&n.to_string()))
                .unwrap();
        }
        assert_eq!(broker.retained("events_raw"), 10_000);

        let mut received = Vec::new();
        for _ in 0..10_000 {
            received.push(consumer.recv().await.unwrap().unwrap().offset);
        }
        consumer
            .commit(&crate::broker::highest_per_partition(received.clone()))
            .await
            .unwrap();

        assert_eq!(broker.retained("events_raw"), 0);
        assert_eq!(broker.message_count("events_raw"), 10_000);
        assert_eq!(
            broker.committed("events_raw", "archiver"),
            Some(vec![5_000, 5_000])
        );

        // Offsets keep counting from where the trimmed log left off.
        let next = broker.publish("events_raw", None, value("after")).unwrap();
        assert_eq!(next.offset, 5_000);
        let message = consumer.recv().await.unwrap().unwrap();
        assert_eq!(message.value, value("after"));
        assert_eq!(message.offset, next);
    }

    #[tokio::test]
    async fn slowest_group_holds_messages() {
        let broker = MemoryBroker::new();
        broker.create_topic("events_raw", 1).unwrap();
        let fast = broker.subscribe("events_raw", "fast").unwrap();
        let slow = broker.subscribe("events_raw", "slow").unwrap();

        for n in 0..3 {
            broker.publish("events_raw", None, value(&n.to_string())).unwrap();
        }
        let offset = |o| MessageOffset { partition: 0, offset: o };
        fast.commit(&[offset(2)]).await.unwrap();
        assert_eq!(broker.retained("events_raw"), 3);

        slow.commit(&[offset(0)]).await.unwrap();
        assert_eq!(broker.retained("events_raw"), 2);

        let redelivered = broker.subscribe("events_raw", "slow").unwrap();
        let message = redelivered.recv().await.unwrap().unwrap();
        assert_eq!(message.offset, offset(1));
        assert_eq!(message.value, value("1"));
    }

    #[test]
    fn publish_to_unknown_topic_fails() {
        let broker = MemoryBroker::new();
        let err = broker.publish("missing", None, value("x")).unwrap_err();
        assert!(matches!(err, BrokerError::UnknownTopic(_)));
        assert!(broker.create_topic("zero", 0).is_err());
    }
}
