use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{MessageStream, StreamMessage};

/// An in-process double for one stream (scheduler stream or a single
/// node's dispatch stream). Delivery ids are just incrementing
/// counters; there is no redelivery-on-crash semantics since nothing
/// here survives process restart — fine for a test double, not for
/// production use.
#[derive(Default)]
pub struct InMemoryMessageStream {
    groups: Mutex<Vec<String>>,
    queue: Mutex<VecDeque<StreamMessage>>,
    pending: Mutex<HashMap<String, StreamMessage>>,
    next_delivery_id: Mutex<u64>,
}

impl InMemoryMessageStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages that have been popped but not yet acked.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[async_trait]
impl MessageStream for InMemoryMessageStream {
    async fn ensure_consumer_group(&self, group: &str) -> Result<()> {
        let mut groups = self.groups.lock();
        if !groups.iter().any(|g| g == group) {
            groups.push(group.to_owned());
        }
        Ok(())
    }

    async fn blocking_pop(
        &self,
        _group: &str,
        _consumer: &str,
        batch_size: usize,
        block_timeout: Duration,
    ) -> Result<Vec<(String, StreamMessage)>> {
        let mut popped = Vec::new();
        {
            let mut queue = self.queue.lock();
            let mut pending = self.pending.lock();
            let mut next_id = self.next_delivery_id.lock();
            while popped.len() < batch_size {
                let Some(message) = queue.pop_front() else {
                    break;
                };
                *next_id += 1;
                let delivery_id = next_id.to_string();
                pending.insert(delivery_id.clone(), message.clone());
                popped.push((delivery_id, message));
            }
        }
        if popped.is_empty() && !block_timeout.is_zero() {
            tokio::time::sleep(block_timeout.min(Duration::from_millis(20))).await;
        }
        Ok(popped)
    }

    async fn ack(&self, _group: &str, delivery_id: &str) -> Result<()> {
        self.pending.lock().remove(delivery_id);
        Ok(())
    }

    async fn publish(&self, message: StreamMessage) -> Result<()> {
        self.queue.lock().push_back(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::Id;

    fn sample_message() -> StreamMessage {
        StreamMessage {
            message_id: Id::new().to_string(),
            run_id: Id::new(),
            task_id: Some(Id::new()),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_then_pop_then_ack_drains_pending() {
        let stream = InMemoryMessageStream::new();
        stream.ensure_consumer_group("g1").await.unwrap();
        stream.publish(sample_message()).await.unwrap();

        let popped = stream
            .blocking_pop("g1", "c1", 10, Duration::from_millis(0))
            .await
            .unwrap();
        assert_eq!(popped.len(), 1);
        assert_eq!(stream.pending_count(), 1);

        stream.ack("g1", &popped[0].0).await.unwrap();
        assert_eq!(stream.pending_count(), 0);
    }

    #[tokio::test]
    async fn blocking_pop_respects_batch_size() {
        let stream = InMemoryMessageStream::new();
        for _ in 0..5 {
            stream.publish(sample_message()).await.unwrap();
        }
        let popped = stream
            .blocking_pop("g1", "c1", 3, Duration::from_millis(0))
            .await
            .unwrap();
        assert_eq!(popped.len(), 3);
        assert_eq!(stream.len(), 2);
    }

    #[tokio::test]
    async fn ensure_consumer_group_is_idempotent() {
        let stream = InMemoryMessageStream::new();
        stream.ensure_consumer_group("g1").await.unwrap();
        stream.ensure_consumer_group("g1").await.unwrap();
        assert_eq!(stream.groups.lock().len(), 1);
    }
}
