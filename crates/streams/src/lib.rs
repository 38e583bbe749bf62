//! The stream and heartbeat-cache contracts the scheduling core
//! consumes (SPEC_FULL.md §6). Both remain external collaborators in
//! principle; this crate supplies a Redis-backed implementation plus
//! in-memory doubles for tests.

mod memory_cache;
mod memory_stream;
mod redis_cache;
mod redis_stream;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::Id;

pub use memory_cache::InMemoryHeartbeatCache;
pub use memory_stream::InMemoryMessageStream;
pub use redis_cache::RedisHeartbeatCache;
pub use redis_stream::RedisMessageStream;

/// One entry on either the scheduler stream or a node's dispatch
/// stream. On the scheduler stream `created_at` is when the Run was
/// enqueued for scheduling; on a node stream it is when the Run was
/// assigned to that node (SPEC_FULL.md §6). The field is named
/// uniformly since both streams carry the same shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub message_id: String,
    pub run_id: Id,
    pub task_id: Option<Id>,
    pub created_at: DateTime<Utc>,
}

/// A durable, consumer-group-capable message log. One instance is the
/// scheduler stream (shared across scheduler instances); one instance
/// per node id is a node stream (SPEC_FULL.md §6).
#[async_trait]
pub trait MessageStream: Send + Sync {
    /// Idempotent: "already exists" is success (SPEC_FULL.md §9).
    async fn ensure_consumer_group(&self, group: &str) -> Result<()>;

    /// Blocking read of up to `batch_size` undelivered messages for
    /// `consumer` in `group`, waiting at most `block_timeout`. Returns
    /// `(delivery_id, message)` pairs; `delivery_id` is the opaque
    /// handle `ack` needs.
    async fn blocking_pop(
        &self,
        group: &str,
        consumer: &str,
        batch_size: usize,
        block_timeout: Duration,
    ) -> Result<Vec<(String, StreamMessage)>>;

    async fn ack(&self, group: &str, delivery_id: &str) -> Result<()>;

    async fn publish(&self, message: StreamMessage) -> Result<()>;
}

/// A node's last reported heartbeat, as held in the cache (SPEC_FULL.md
/// §6). `capacity` mirrors the wire shape of the heartbeat payload
/// (integer-valued), distinct from `models::Node::capacity` which is
/// string-valued; the node manager converts when merging the two.
#[derive(Debug, Clone)]
pub struct HeartbeatRecord {
    pub status: String,
    pub capacity: HashMap<String, i64>,
    pub updated_at: DateTime<Utc>,
}

/// Best-effort cache of recent heartbeats (SPEC_FULL.md §6). Any call
/// may fail; the core treats a failed call as "cache sick" and falls
/// back to the store's time-window view.
#[async_trait]
pub trait HeartbeatCache: Send + Sync {
    async fn list_online_nodes(&self) -> Result<Vec<Id>>;

    async fn get_node_heartbeat(&self, node_id: Id) -> Result<Option<HeartbeatRecord>>;

    async fn delete_node_heartbeat(&self, node_id: Id) -> Result<()>;

    async fn update_node_heartbeat(
        &self,
        node_id: Id,
        status: &str,
        capacity: HashMap<String, i64>,
    ) -> Result<()>;
}
