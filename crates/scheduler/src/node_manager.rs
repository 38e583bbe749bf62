use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use common::Id;
use models::{Node, NodeStatus, Run, RunStatus};
use parking_lot::RwLock;
use streams::HeartbeatCache;

/// Bound on how many `running` Runs the requeue pass scans per call.
/// Keeps the pass O(1) round-trips regardless of fleet size; a fleet
/// large enough to exceed this needs the pass to run more often, not a
/// larger limit.
const DEFAULT_REQUEUE_SCAN_LIMIT: usize = 1000;

/// A consistent, in-memory view of the fleet, derived from the store
/// and (optionally) a heartbeat cache, plus Run-level bookkeeping
/// (SPEC_FULL.md §4.2).
pub struct NodeManager {
    store: Arc<dyn store::Store>,
    heartbeat_cache: Option<Arc<dyn HeartbeatCache>>,
    freshness_window: Duration,
    requeue_scan_limit: usize,
    running: RwLock<HashMap<Id, i64>>,
}

impl NodeManager {
    pub fn new(
        store: Arc<dyn store::Store>,
        heartbeat_cache: Option<Arc<dyn HeartbeatCache>>,
        freshness_window: Duration,
    ) -> Self {
        Self {
            store,
            heartbeat_cache,
            freshness_window,
            requeue_scan_limit: DEFAULT_REQUEUE_SCAN_LIMIT,
            running: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_requeue_scan_limit(mut self, limit: usize) -> Self {
        self.requeue_scan_limit = limit;
        self
    }

    /// Returns the current candidate set: nodes eligible to receive
    /// work right now. Reproduces the heartbeat-freshness decision
    /// table in SPEC_FULL.md §4.2.
    pub async fn list_online_nodes(&self) -> Vec<Node> {
        let Some(cache) = &self.heartbeat_cache else {
            return self.list_online_by_time_window().await;
        };

        let all_nodes = match self.store.list_all_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::warn!(error = %e, "store list_all_nodes failed, falling back to time window");
                return self.list_online_by_time_window().await;
            }
        };

        let live_ids: HashSet<Id> = match cache.list_online_nodes().await {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                tracing::warn!(error = %e, "heartbeat cache sick, falling back to time window");
                return self.list_online_by_time_window().await;
            }
        };

        let mut online = Vec::new();
        for node in all_nodes {
            if node.status.is_administrative() || !live_ids.contains(&node.id) {
                continue;
            }
            let mut node = node;
            node.status = NodeStatus::Online;
            if let Ok(Some(heartbeat)) = cache.get_node_heartbeat(node.id).await {
                node.capacity = heartbeat
                    .capacity
                    .into_iter()
                    .map(|(k, v)| (k, v.to_string()))
                    .collect();
                node.last_heartbeat = Some(heartbeat.updated_at);
            }
            online.push(node);
        }
        online
    }

    async fn list_online_by_time_window(&self) -> Vec<Node> {
        match self.store.list_online_nodes(self.freshness_window).await {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::warn!(error = %e, "store list_online_nodes failed");
                Vec::new()
            }
        }
    }

    /// Refreshes the in-memory running-count map wholesale from the
    /// store. Per-node errors are logged and that node is omitted
    /// (treated as 0 downstream).
    pub async fn refresh_running_count(&self, nodes: &[Node]) {
        let mut counts = HashMap::new();
        for node in nodes {
            match self.store.list_runs_by_node(node.id).await {
                Ok(runs) => {
                    let active = runs
                        .iter()
                        .filter(|r| {
                            matches!(r.status, RunStatus::Assigned | RunStatus::Running | RunStatus::Paused)
                        })
                        .count() as i64;
                    counts.insert(node.id, active);
                }
                Err(e) => {
                    tracing::warn!(node_id = %node.id, error = %e, "failed to refresh running count");
                }
            }
        }
        *self.running.write() = counts;
    }

    /// A defensive copy; mutating the result has no effect on
    /// subsequent calls (SPEC_FULL.md §8 invariant 5).
    pub fn get_node_running(&self) -> HashMap<Id, i64> {
        self.running.read().clone()
    }

    pub fn increment_running(&self, node_id: Id) {
        *self.running.write().entry(node_id).or_insert(0) += 1;
    }

    /// Affinity resolution (SPEC_FULL.md §4.2 steps 1-5).
    pub async fn resolve_preferred_node_id(&self, run: &Run) -> Option<Id> {
        let mut instance_id = run.agent_instance_id().filter(|s| !s.is_empty());
        let account_id = run.agent_account_id().filter(|s| !s.is_empty());

        if instance_id.is_none() {
            if let Some(task_id) = run.task_id {
                match self.store.get_task(task_id).await {
                    Ok(Some(task)) => {
                        instance_id = task.agent_id.filter(|s| !s.is_empty());
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, "failed to load task for affinity resolution"),
                }
            }
        }

        if let Some(instance_id) = instance_id {
            match self.store.get_instance(&instance_id).await {
                Ok(Some(instance)) => {
                    if let Some(node_id) = instance.node_id {
                        return Some(node_id);
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "failed to look up instance for affinity resolution"),
            }
        }

        if let Some(account_id) = account_id {
            match self.store.get_account(&account_id).await {
                Ok(Some(account)) => {
                    if let Some(node_id) = account.node_id {
                        return Some(node_id);
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "failed to look up account for affinity resolution"),
            }
        }

        None
    }

    /// Reclaims Runs stranded on a node that is no longer online and
    /// has never reported progress (SPEC_FULL.md §4.2, §8 invariant 2).
    /// Returns the number of Runs reclaimed.
    pub async fn requeue_runs_assigned_to_offline_nodes(
        &self,
        online_ids: &HashSet<Id>,
        offline_threshold: Duration,
    ) -> Result<usize> {
        let running_runs = self.store.list_running_runs(self.requeue_scan_limit).await?;
        let now = Utc::now();
        let mut reclaimed = 0;

        for run in running_runs {
            let Some(node_id) = run.node_id else { continue };
            if online_ids.contains(&node_id) {
                continue;
            }
            let Some(started_at) = run.started_at else { continue };
            let age = now
                .signed_duration_since(started_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age < offline_threshold {
                continue;
            }

            match self.store.count_events_by_run(run.id).await {
                Ok(0) => {}
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(run_id = %run.id, error = %e, "failed to count events during requeue scan");
                    continue;
                }
            }

            if let Err(e) = self.store.reset_run_to_queued(run.id).await {
                tracing::warn!(run_id = %run.id, error = %e, "failed to requeue stranded run");
                continue;
            }
            tracing::info!(run_id = %run.id, node_id = %node_id, "reclaimed run stranded on offline node");
            reclaimed += 1;
        }

        Ok(reclaimed)
    }

    /// Upserts a heartbeat into the cache. Called by the (external,
    /// out-of-scope) HTTP ingest path after decoding a worker's
    /// heartbeat payload; never overwrites an administrative status
    /// because it only ever touches the cache, never `Node.status`
    /// itself. Persisting `last_heartbeat` on the Node record is the
    /// ingest path's responsibility via a store write outside this
    /// crate's enumerated `Store` contract.
    pub async fn record_heartbeat(
        &self,
        node_id: Id,
        status: &str,
        capacity: HashMap<String, i64>,
    ) -> Result<()> {
        if let Some(cache) = &self.heartbeat_cache {
            cache.update_node_heartbeat(node_id, status, capacity).await?;
        }
        Ok(())
    }
}
