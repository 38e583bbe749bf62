use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use common::Id;
use models::{Node, NodeStatus, Run, RunStatus, Task};
use tokio_postgres::Client;

use crate::{Account, Instance, Store};

/// Thin adapter over `tokio-postgres` for the subset of the store
/// contract that is plain single-table CRUD. Deliberately not a full
/// ORM/transaction layer — the reliability of the store itself is out
/// of scope (SPEC_FULL.md §1 Non-goals), so this issues hand-written
/// queries against a schema the store operator owns, and trusts the
/// connection handed to it.
pub struct PgStore {
    client: Client,
}

impl PgStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn list_all_nodes(&self) -> Result<Vec<Node>> {
        let rows = self
            .client
            .query(
                "SELECT id, status, labels, capacity, last_heartbeat FROM nodes ORDER BY id",
                &[],
            )
            .await?;
        rows.iter().map(row_to_node).collect()
    }

    async fn list_online_nodes(&self, freshness_window: Duration) -> Result<Vec<Node>> {
        let rows = self
            .client
            .query(
                "SELECT id, status, labels, capacity, last_heartbeat FROM nodes \
                 WHERE status IN ('online', 'offline') \
                 AND last_heartbeat IS NOT NULL \
                 AND last_heartbeat >= now() - $1::interval \
                 ORDER BY id",
                &[&pg_interval(freshness_window)],
            )
            .await?;
        rows.iter()
            .map(row_to_node)
            .collect::<Result<Vec<_>>>()
            .map(|nodes| nodes.into_iter().filter(|n| !n.status.is_administrative()).collect())
    }

    async fn list_runs_by_node(&self, node_id: Id) -> Result<Vec<Run>> {
        let rows = self
            .client
            .query(
                "SELECT id, task_id, status, node_id, started_at, created_at, snapshot \
                 FROM runs WHERE node_id = $1",
                &[&uuid::Uuid::from(node_id)],
            )
            .await?;
        rows.iter().map(row_to_run).collect()
    }

    async fn list_running_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let rows = self
            .client
            .query(
                "SELECT id, task_id, status, node_id, started_at, created_at, snapshot \
                 FROM runs WHERE status = 'running' LIMIT $1",
                &[&(limit as i64)],
            )
            .await?;
        rows.iter().map(row_to_run).collect()
    }

    async fn list_stale_queued_runs(&self, threshold: Duration) -> Result<Vec<Run>> {
        let rows = self
            .client
            .query(
                "SELECT id, task_id, status, node_id, started_at, created_at, snapshot \
                 FROM runs WHERE status = 'queued' \
                 AND created_at <= now() - $1::interval \
                 ORDER BY created_at ASC",
                &[&pg_interval(threshold)],
            )
            .await?;
        rows.iter().map(row_to_run).collect()
    }

    async fn get_run(&self, id: Id) -> Result<Option<Run>> {
        let row = self
            .client
            .query_opt(
                "SELECT id, task_id, status, node_id, started_at, created_at, snapshot \
                 FROM runs WHERE id = $1",
                &[&uuid::Uuid::from(id)],
            )
            .await?;
        row.as_ref().map(row_to_run).transpose()
    }

    async fn update_run_status(
        &self,
        id: Id,
        expected_status: RunStatus,
        new_status: RunStatus,
        node_id: Option<Id>,
    ) -> Result<bool> {
        let rows = self
            .client
            .execute(
                "UPDATE runs SET status = $1, node_id = COALESCE($2, node_id), \
                 started_at = CASE WHEN $1 = 'running' AND started_at IS NULL THEN now() ELSE started_at END \
                 WHERE id = $3 AND status = $4",
                &[
                    &new_status.to_string(),
                    &node_id.map(uuid::Uuid::from),
                    &uuid::Uuid::from(id),
                    &expected_status.to_string(),
                ],
            )
            .await?;
        Ok(rows == 1)
    }

    async fn reset_run_to_queued(&self, id: Id) -> Result<()> {
        self.client
            .execute(
                "UPDATE runs SET status = 'queued' WHERE id = $1",
                &[&uuid::Uuid::from(id)],
            )
            .await?;
        Ok(())
    }

    async fn count_events_by_run(&self, run_id: Id) -> Result<u64> {
        let row = self
            .client
            .query_one(
                "SELECT count(*) FROM events WHERE run_id = $1",
                &[&uuid::Uuid::from(run_id)],
            )
            .await?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    async fn get_task(&self, id: Id) -> Result<Option<Task>> {
        let row = self
            .client
            .query_opt(
                "SELECT id, labels, agent_id FROM tasks WHERE id = $1",
                &[&uuid::Uuid::from(id)],
            )
            .await?;
        row.map(|r| -> Result<Task> {
            Ok(Task {
                id: Id::from(r.get::<_, uuid::Uuid>(0)),
                labels: decode_labels(r.get(1))?,
                agent_id: r.get(2),
            })
        })
        .transpose()
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<Instance>> {
        let row = self
            .client
            .query_opt(
                "SELECT node_id FROM instances WHERE instance_id = $1",
                &[&instance_id],
            )
            .await?;
        Ok(row.map(|r| Instance {
            node_id: r.get::<_, Option<uuid::Uuid>>(0).map(Id::from),
        }))
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
        let row = self
            .client
            .query_opt(
                "SELECT node_id FROM accounts WHERE account_id = $1",
                &[&account_id],
            )
            .await?;
        Ok(row.map(|r| Account {
            node_id: r.get::<_, Option<uuid::Uuid>>(0).map(Id::from),
        }))
    }
}

fn pg_interval(d: Duration) -> String {
    format!("{} milliseconds", d.as_millis())
}

fn decode_labels(value: serde_json::Value) -> Result<std::collections::HashMap<String, String>> {
    Ok(serde_json::from_value(value).unwrap_or_default())
}

fn row_to_node(row: &tokio_postgres::Row) -> Result<Node> {
    let status: String = row.get(1);
    Ok(Node {
        id: Id::from(row.get::<_, uuid::Uuid>(0)),
        status: status.parse::<NodeStatus>().map_err(|_| anyhow::anyhow!("unknown node status {status}"))?,
        labels: decode_labels(row.get(2))?,
        capacity: decode_labels(row.get(3))?,
        last_heartbeat: row.get(4),
    })
}

fn row_to_run(row: &tokio_postgres::Row) -> Result<Run> {
    let status: String = row.get(2);
    Ok(Run {
        id: Id::from(row.get::<_, uuid::Uuid>(0)),
        task_id: row.get::<_, Option<uuid::Uuid>>(1).map(Id::from),
        status: status.parse::<RunStatus>().map_err(|_| anyhow::anyhow!("unknown run status {status}"))?,
        node_id: row.get::<_, Option<uuid::Uuid>>(3).map(Id::from),
        started_at: row.get(4),
        created_at: row.get(5),
        snapshot: row.get(6),
    })
}
