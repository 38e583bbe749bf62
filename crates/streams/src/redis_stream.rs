use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use common::Id;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};

use crate::{MessageStream, StreamMessage};

/// Redis Streams implementation, one instance per stream key. Used for
/// both the scheduler stream (shared, consumer-group reads) and each
/// node's dispatch stream (published to, one consumer group per
/// worker), using the `redis` crate's `tokio-comp` + `connection-manager`
/// features for XREADGROUP/XACK/XADD access.
pub struct RedisMessageStream {
    stream_key: String,
    conn: ConnectionManager,
}

impl RedisMessageStream {
    pub async fn connect(addr: &str, stream_key: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(addr).context("building redis client")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("connecting to redis")?;
        Ok(Self {
            stream_key: stream_key.into(),
            conn,
        })
    }

    /// Builds a stream handle from an already-established connection
    /// manager. `ConnectionManager` is a cheap `Clone` over a shared
    /// multiplexed connection, so per-node stream handles can be minted
    /// synchronously once the scheduler holds one manager for the
    /// process (SPEC_FULL.md §6 node-stream-factory contract).
    pub fn with_connection(conn: ConnectionManager, stream_key: impl Into<String>) -> Self {
        Self {
            stream_key: stream_key.into(),
            conn,
        }
    }

    /// Exposes the underlying connection manager so callers can mint
    /// more `RedisMessageStream` handles (e.g. one per node) without
    /// reconnecting.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl MessageStream for RedisMessageStream {
    async fn ensure_consumer_group(&self, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let result: Result<(), RedisError> = conn
            .xgroup_create_mkstream(&self.stream_key, group, "$")
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn blocking_pop(
        &self,
        group: &str,
        consumer: &str,
        batch_size: usize,
        block_timeout: Duration,
    ) -> Result<Vec<(String, StreamMessage)>> {
        let mut conn = self.conn.clone();
        let opts = redis::streams::StreamReadOptions::default()
            .group(group, consumer)
            .count(batch_size)
            .block(block_timeout.as_millis() as usize);

        let reply: redis::streams::StreamReadReply = conn
            .xread_options(&[&self.stream_key], &[">"], &opts)
            .await?;

        let mut out = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                if let Some(message) = decode_fields(&entry.map) {
                    out.push((entry.id, message));
                } else {
                    tracing::warn!(delivery_id = %entry.id, "dropping malformed stream entry");
                }
            }
        }
        Ok(out)
    }

    async fn ack(&self, group: &str, delivery_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(&self.stream_key, group, &[delivery_id]).await?;
        Ok(())
    }

    async fn publish(&self, message: StreamMessage) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = conn
            .xadd(
                &self.stream_key,
                "*",
                &[
                    ("message_id", message.message_id.as_str()),
                    ("run_id", message.run_id.to_string().as_str()),
                    (
                        "task_id",
                        message.task_id.map(|t| t.to_string()).unwrap_or_default().as_str(),
                    ),
                    ("created_at", message.created_at.timestamp_millis().to_string().as_str()),
                ],
            )
            .await?;
        Ok(())
    }
}

fn decode_fields(
    fields: &std::collections::HashMap<String, redis::Value>,
) -> Option<StreamMessage> {
    let message_id = field_str(fields, "message_id")?;
    let run_id: Id = field_str(fields, "run_id")?.parse().ok()?;
    let task_id = field_str(fields, "task_id").and_then(|s| if s.is_empty() { None } else { s.parse().ok() });
    let created_at_ms: i64 = field_str(fields, "created_at")?.parse().ok()?;
    let created_at = Utc.timestamp_millis_opt(created_at_ms).single()?;

    Some(StreamMessage {
        message_id,
        run_id,
        task_id,
        created_at,
    })
}

fn field_str(fields: &std::collections::HashMap<String, redis::Value>, key: &str) -> Option<String> {
    match fields.get(key)? {
        redis::Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
        redis::Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}
