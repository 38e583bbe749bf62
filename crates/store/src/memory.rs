use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use common::Id;
use models::{Node, Run, RunStatus, Task};
use parking_lot::Mutex;

use crate::{Account, Instance, Store};

/// An in-memory `Store` double. Used by the integration test suite and
/// by the `--memory` CLI mode: one `anyhow::Result` per round-trip,
/// backed by a plain mutex-guarded map rather than any SQL machinery.
#[derive(Default)]
pub struct MemoryStore {
    nodes: Mutex<HashMap<Id, Node>>,
    runs: Mutex<HashMap<Id, Run>>,
    tasks: Mutex<HashMap<Id, Task>>,
    events: Mutex<HashMap<Id, u64>>,
    instances: Mutex<HashMap<String, Instance>>,
    accounts: Mutex<HashMap<String, Account>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_node(&self, node: Node) {
        self.nodes.lock().insert(node.id, node);
    }

    pub fn put_run(&self, run: Run) {
        self.runs.lock().insert(run.id, run);
    }

    pub fn put_task(&self, task: Task) {
        self.tasks.lock().insert(task.id, task);
    }

    pub fn put_instance(&self, instance_id: impl Into<String>, instance: Instance) {
        self.instances.lock().insert(instance_id.into(), instance);
    }

    pub fn put_account(&self, account_id: impl Into<String>, account: Account) {
        self.accounts.lock().insert(account_id.into(), account);
    }

    pub fn set_event_count(&self, run_id: Id, count: u64) {
        self.events.lock().insert(run_id, count);
    }

    pub fn run(&self, id: Id) -> Option<Run> {
        self.runs.lock().get(&id).cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_all_nodes(&self) -> Result<Vec<Node>> {
        let mut nodes: Vec<Node> = self.nodes.lock().values().cloned().collect();
        nodes.sort_by_key(|n| n.id);
        Ok(nodes)
    }

    async fn list_online_nodes(&self, freshness_window: Duration) -> Result<Vec<Node>> {
        let now = Utc::now();
        let mut nodes: Vec<Node> = self
            .nodes
            .lock()
            .values()
            .filter(|n| !n.status.is_administrative())
            .filter(|n| {
                n.last_heartbeat
                    .map(|hb| now.signed_duration_since(hb).to_std().unwrap_or(Duration::MAX) <= freshness_window)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        // Deterministic order so strategies that index positionally
        // into the candidate set (round_robin) rotate meaningfully
        // rather than off `HashMap` iteration order.
        nodes.sort_by_key(|n| n.id);
        Ok(nodes)
    }

    async fn list_runs_by_node(&self, node_id: Id) -> Result<Vec<Run>> {
        Ok(self
            .runs
            .lock()
            .values()
            .filter(|r| r.node_id == Some(node_id))
            .cloned()
            .collect())
    }

    async fn list_running_runs(&self, limit: usize) -> Result<Vec<Run>> {
        Ok(self
            .runs
            .lock()
            .values()
            .filter(|r| r.status == RunStatus::Running)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_stale_queued_runs(&self, threshold: Duration) -> Result<Vec<Run>> {
        let now = Utc::now();
        let mut stale: Vec<Run> = self
            .runs
            .lock()
            .values()
            .filter(|r| r.status == RunStatus::Queued)
            .filter(|r| {
                now.signed_duration_since(r.created_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    >= threshold
            })
            .cloned()
            .collect();
        stale.sort_by_key(|r| r.created_at);
        Ok(stale)
    }

    async fn get_run(&self, id: Id) -> Result<Option<Run>> {
        Ok(self.runs.lock().get(&id).cloned())
    }

    async fn update_run_status(
        &self,
        id: Id,
        expected_status: RunStatus,
        new_status: RunStatus,
        node_id: Option<Id>,
    ) -> Result<bool> {
        let mut runs = self.runs.lock();
        let Some(run) = runs.get_mut(&id) else {
            return Ok(false);
        };
        if run.status != expected_status {
            return Ok(false);
        }
        run.status = new_status;
        if node_id.is_some() {
            run.node_id = node_id;
        }
        if new_status == RunStatus::Running && run.started_at.is_none() {
            run.started_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn reset_run_to_queued(&self, id: Id) -> Result<()> {
        if let Some(run) = self.runs.lock().get_mut(&id) {
            run.status = RunStatus::Queued;
        }
        Ok(())
    }

    async fn count_events_by_run(&self, run_id: Id) -> Result<u64> {
        Ok(self.events.lock().get(&run_id).copied().unwrap_or(0))
    }

    async fn get_task(&self, id: Id) -> Result<Option<Task>> {
        Ok(self.tasks.lock().get(&id).cloned())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<Instance>> {
        Ok(self.instances.lock().get(instance_id).cloned())
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
        Ok(self.accounts.lock().get(account_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use models::NodeStatus;

    fn sample_node(id: Id, status: NodeStatus, last_heartbeat_secs_ago: i64) -> Node {
        Node {
            id,
            status,
            labels: HashMap::new(),
            capacity: HashMap::new(),
            last_heartbeat: Some(Utc::now() - ChronoDuration::seconds(last_heartbeat_secs_ago)),
        }
    }

    #[tokio::test]
    async fn list_online_nodes_excludes_administrative_and_stale() {
        let store = MemoryStore::new();
        let fresh = sample_node(Id::new(), NodeStatus::Online, 10);
        let stale = sample_node(Id::new(), NodeStatus::Online, 90);
        let draining = sample_node(Id::new(), NodeStatus::Draining, 1);
        store.put_node(fresh.clone());
        store.put_node(stale);
        store.put_node(draining);

        let online = store.list_online_nodes(Duration::from_secs(45)).await.unwrap();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].id, fresh.id);
    }

    #[tokio::test]
    async fn update_run_status_is_conditional() {
        let store = MemoryStore::new();
        let run_id = Id::new();
        store.put_run(Run {
            id: run_id,
            task_id: None,
            status: RunStatus::Queued,
            node_id: None,
            started_at: None,
            created_at: Utc::now(),
            snapshot: serde_json::json!({}),
        });

        let node_id = Id::new();
        let applied = store
            .update_run_status(run_id, RunStatus::Queued, RunStatus::Assigned, Some(node_id))
            .await
            .unwrap();
        assert!(applied);

        // Second call observes the now-`assigned` run and expects `queued`: no-op.
        let applied_again = store
            .update_run_status(run_id, RunStatus::Queued, RunStatus::Assigned, Some(node_id))
            .await
            .unwrap();
        assert!(!applied_again);

        let run = store.run(run_id).unwrap();
        assert_eq!(run.status, RunStatus::Assigned);
        assert_eq!(run.node_id, Some(node_id));
    }

    #[tokio::test]
    async fn reset_run_to_queued_is_idempotent() {
        let store = MemoryStore::new();
        let run_id = Id::new();
        store.put_run(Run {
            id: run_id,
            task_id: None,
            status: RunStatus::Running,
            node_id: None,
            started_at: None,
            created_at: Utc::now(),
            snapshot: serde_json::json!({}),
        });

        store.reset_run_to_queued(run_id).await.unwrap();
        store.reset_run_to_queued(run_id).await.unwrap();
        assert_eq!(store.run(run_id).unwrap().status, RunStatus::Queued);
    }
}
