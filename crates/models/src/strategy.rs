use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::Id;
use serde::{Deserialize, Serialize};

use crate::node::Node;
use crate::run::Run;
use crate::task::Task;

/// Everything a selection strategy needs to pick a node for one run.
/// Built fresh by the node manager for every scheduling attempt
/// (SPEC_FULL.md §4.2, §4.3); strategies never reach back into the
/// store themselves.
#[derive(Debug, Clone)]
pub struct StrategyRequest {
    pub run: Run,
    pub task: Option<Task>,

    /// Nodes currently eligible to receive work: online, with spare
    /// capacity, in no particular order.
    pub candidate_nodes: Vec<Node>,

    /// Running-run counts keyed by node id, covering every node in
    /// `candidate_nodes` (zero if absent rather than missing).
    pub running_counts: HashMap<Id, i64>,

    /// A node id resolved ahead of the strategy chain from a direct
    /// pin or affinity hint on the run's snapshot. Strategies that
    /// honor pins (`direct`, `affinity`) consult this; strategies that
    /// balance load ignore it.
    pub preferred_node_id: Option<Id>,
}

impl StrategyRequest {
    pub fn running_count(&self, node_id: Id) -> i64 {
        self.running_counts.get(&node_id).copied().unwrap_or(0)
    }
}

/// A point-in-time view of a node's health, as derived by the node
/// manager from heartbeat cache and store state (SPEC_FULL.md §4.4).
/// Distinct from `Node.status`: this reflects the *current* freshness
/// decision, whereas `Node.status` is the last value persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeNodeStatus {
    pub online: bool,
    pub status: String,

    #[serde(default)]
    pub capacity: HashMap<String, String>,

    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
}
