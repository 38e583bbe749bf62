use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use common::Id;
use parking_lot::Mutex;

use crate::{HeartbeatCache, HeartbeatRecord};

/// An in-process double for the heartbeat cache. Supports an
/// injectable "sick" flag so tests can exercise the cache-error
/// fallback path (SPEC_FULL.md §4.2, scenario E).
#[derive(Default)]
pub struct InMemoryHeartbeatCache {
    records: Mutex<HashMap<Id, HeartbeatRecord>>,
    sick: std::sync::atomic::AtomicBool,
}

impl InMemoryHeartbeatCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sick(&self, sick: bool) {
        self.sick.store(sick, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_sick(&self) -> Result<()> {
        if self.sick.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("heartbeat cache unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl HeartbeatCache for InMemoryHeartbeatCache {
    async fn list_online_nodes(&self) -> Result<Vec<Id>> {
        self.check_sick()?;
        Ok(self.records.lock().keys().copied().collect())
    }

    async fn get_node_heartbeat(&self, node_id: Id) -> Result<Option<HeartbeatRecord>> {
        self.check_sick()?;
        Ok(self.records.lock().get(&node_id).cloned())
    }

    async fn delete_node_heartbeat(&self, node_id: Id) -> Result<()> {
        self.check_sick()?;
        self.records.lock().remove(&node_id);
        Ok(())
    }

    async fn update_node_heartbeat(
        &self,
        node_id: Id,
        status: &str,
        capacity: HashMap<String, i64>,
    ) -> Result<()> {
        self.check_sick()?;
        self.records.lock().insert(
            node_id,
            HeartbeatRecord {
                status: status.to_owned(),
                capacity,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sick_flag_fails_every_call() {
        let cache = InMemoryHeartbeatCache::new();
        cache.set_sick(true);
        assert!(cache.list_online_nodes().await.is_err());
        assert!(cache.get_node_heartbeat(Id::new()).await.is_err());
    }

    #[tokio::test]
    async fn update_then_get_round_trips() {
        let cache = InMemoryHeartbeatCache::new();
        let node_id = Id::new();
        cache
            .update_node_heartbeat(node_id, "online", HashMap::from([("max_concurrent".to_owned(), 4)]))
            .await
            .unwrap();

        let record = cache.get_node_heartbeat(node_id).await.unwrap().unwrap();
        assert_eq!(record.status, "online");
        assert_eq!(record.capacity.get("max_concurrent"), Some(&4));
    }
}
