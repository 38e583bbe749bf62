use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use common::Id;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::{HeartbeatCache, HeartbeatRecord};

const KEY_PREFIX: &str = "fleet:heartbeat:";

/// Redis-backed heartbeat cache sharing the `redis` dependency and
/// connection manager with [`crate::RedisMessageStream`]. Each node's
/// heartbeat is one hash key with a TTL, so a dead node's heartbeat
/// naturally expires out of `list_online_nodes` without an explicit
/// sweep.
pub struct RedisHeartbeatCache {
    conn: ConnectionManager,
    ttl_secs: u64,
}

impl RedisHeartbeatCache {
    pub async fn connect(addr: &str, ttl_secs: u64) -> Result<Self> {
        let client = redis::Client::open(addr).context("building redis client")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("connecting to redis")?;
        Ok(Self { conn, ttl_secs })
    }

    fn key(node_id: Id) -> String {
        format!("{KEY_PREFIX}{node_id}")
    }
}

#[async_trait]
impl HeartbeatCache for RedisHeartbeatCache {
    async fn list_online_nodes(&self) -> Result<Vec<Id>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(format!("{KEY_PREFIX}*")).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(KEY_PREFIX).and_then(|s| s.parse().ok()))
            .collect())
    }

    async fn get_node_heartbeat(&self, node_id: Id) -> Result<Option<HeartbeatRecord>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(Self::key(node_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let status = fields.get("status").cloned().unwrap_or_default();
        let updated_at: DateTime<Utc> = fields
            .get("updated_at")
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);
        let capacity: HashMap<String, i64> = fields
            .get("capacity")
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default();

        Ok(Some(HeartbeatRecord {
            status,
            capacity,
            updated_at,
        }))
    }

    async fn delete_node_heartbeat(&self, node_id: Id) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(Self::key(node_id)).await?;
        Ok(())
    }

    async fn update_node_heartbeat(
        &self,
        node_id: Id,
        status: &str,
        capacity: HashMap<String, i64>,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = Self::key(node_id);
        let capacity_json = serde_json::to_string(&capacity)?;
        let _: () = conn
            .hset_multiple(
                &key,
                &[
                    ("status", status.to_owned()),
                    ("capacity", capacity_json),
                    ("updated_at", Utc::now().timestamp_millis().to_string()),
                ],
            )
            .await?;
        let _: bool = conn.expire(&key, self.ttl_secs as i64).await?;
        Ok(())
    }
}
