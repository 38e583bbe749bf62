use std::str::FromStr;

use common::Id;
use models::{Node, StrategyRequest};
use parking_lot::Mutex;
use rand::seq::SliceRandom;

/// A single node-selection strategy: a `name`-style identifier plus one
/// behavior method (SPEC_FULL.md §4.3).
pub trait SelectionStrategy: Send + Sync {
    /// Short identifier used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Returns the selected node, if any, and a reason tag. The tag is
    /// returned regardless of outcome so an operator can distinguish
    /// "nothing matched" from "matched but no capacity".
    fn select_node(&self, request: &StrategyRequest) -> (Option<Node>, &'static str);
}

fn has_capacity(node: &Node, request: &StrategyRequest) -> bool {
    node.remaining_capacity(request.running_count(node.id)) > 0
}

fn find_candidate(request: &StrategyRequest, id: Id) -> Option<&Node> {
    request.candidate_nodes.iter().find(|n| n.id == id)
}

/// Honors a direct node pin on the Run's snapshot (`node_id` /
/// `target_node`).
pub struct DirectStrategy;

impl SelectionStrategy for DirectStrategy {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn select_node(&self, request: &StrategyRequest) -> (Option<Node>, &'static str) {
        let Some(pinned) = request.run.direct_node_id() else {
            return (None, "");
        };
        let Ok(pinned_id) = Id::from_str(&pinned) else {
            return (None, "direct_node_unavailable");
        };
        let Some(node) = find_candidate(request, pinned_id) else {
            return (None, "direct_node_unavailable");
        };
        if !has_capacity(node, request) {
            return (None, "direct_no_capacity");
        }
        (Some(node.clone()), "direct")
    }
}

/// Honors the affinity hint resolved by the node manager
/// (`request.preferred_node_id`).
pub struct AffinityStrategy;

impl SelectionStrategy for AffinityStrategy {
    fn name(&self) -> &'static str {
        "affinity"
    }

    fn select_node(&self, request: &StrategyRequest) -> (Option<Node>, &'static str) {
        let Some(preferred) = request.preferred_node_id else {
            return (None, "");
        };
        let Some(node) = find_candidate(request, preferred) else {
            return (None, "");
        };
        if !has_capacity(node, request) {
            return (None, "affinity_no_capacity");
        }
        (Some(node.clone()), "affinity")
    }
}

/// Matches nodes whose labels are a superset of the Task's labels.
pub struct LabelMatchStrategy {
    pub load_balance: bool,
}

impl SelectionStrategy for LabelMatchStrategy {
    fn name(&self) -> &'static str {
        "label_match"
    }

    fn select_node(&self, request: &StrategyRequest) -> (Option<Node>, &'static str) {
        let task_labels = request.task.as_ref().map(|t| &t.labels);

        // "Matching" is the label-subset test alone; capacity is
        // checked only once the branch below has picked a candidate,
        // since the branch (exactly-one / load-balance / first-seen)
        // is keyed off how many nodes match on labels, not how many
        // currently have room.
        let matching: Vec<&Node> = request
            .candidate_nodes
            .iter()
            .filter(|node| {
                task_labels
                    .map(|labels| labels.iter().all(|(k, v)| node.labels.get(k) == Some(v)))
                    .unwrap_or(true)
            })
            .collect();

        if matching.is_empty() {
            return (None, "");
        }

        if matching.len() == 1 {
            let node = matching[0];
            return if has_capacity(node, request) {
                (Some(node.clone()), "label_match")
            } else {
                (None, "")
            };
        }

        if self.load_balance {
            let best = matching
                .into_iter()
                .max_by_key(|node| node.remaining_capacity(request.running_count(node.id)))
                .expect("non-empty checked above");
            return if has_capacity(best, request) {
                (Some(best.clone()), "label_match_lb")
            } else {
                (None, "")
            };
        }

        match matching.into_iter().find(|node| has_capacity(node, request)) {
            Some(node) => (Some(node.clone()), "label_match"),
            None => (None, ""),
        }
    }
}

/// Picks the candidate with the largest remaining capacity, ignoring
/// labels entirely.
pub struct LoadBalanceStrategy;

impl SelectionStrategy for LoadBalanceStrategy {
    fn name(&self) -> &'static str {
        "load_balance"
    }

    fn select_node(&self, request: &StrategyRequest) -> (Option<Node>, &'static str) {
        // Ties go to the first candidate seen (SPEC_FULL.md §4.3), so
        // fold with a strict `>` rather than `max_by_key`, which would
        // keep the *last* maximal element on a tie.
        let mut best: Option<(&Node, i64)> = None;
        for node in request.candidate_nodes.iter().filter(|node| has_capacity(node, request)) {
            let remaining = node.remaining_capacity(request.running_count(node.id));
            if best.map(|(_, best_remaining)| remaining > best_remaining).unwrap_or(true) {
                best = Some((node, remaining));
            }
        }

        match best {
            Some((node, _)) => (Some(node.clone()), "load_balance"),
            None => (None, ""),
        }
    }
}

/// Maintains a monotonic index into the candidate list; starting from
/// it, returns the first candidate with capacity and advances the
/// index past the chosen slot (SPEC_FULL.md §4.3, §5 "round_robin
/// index: mutex-guarded").
pub struct RoundRobinStrategy {
    index: Mutex<usize>,
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self { index: Mutex::new(0) }
    }
}

impl SelectionStrategy for RoundRobinStrategy {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select_node(&self, request: &StrategyRequest) -> (Option<Node>, &'static str) {
        let candidates = &request.candidate_nodes;
        if candidates.is_empty() {
            return (None, "");
        }

        let mut index = self.index.lock();
        let n = candidates.len();
        for offset in 0..n {
            let i = (*index + offset) % n;
            let node = &candidates[i];
            if has_capacity(node, request) {
                *index = (i + 1) % n;
                return (Some(node.clone()), "round_robin");
            }
        }
        (None, "")
    }
}

/// Picks uniformly at random among candidates with capacity.
pub struct RandomStrategy;

impl SelectionStrategy for RandomStrategy {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select_node(&self, request: &StrategyRequest) -> (Option<Node>, &'static str) {
        let eligible: Vec<&Node> = request
            .candidate_nodes
            .iter()
            .filter(|node| has_capacity(node, request))
            .collect();

        match eligible.choose(&mut rand::thread_rng()) {
            Some(node) => (Some((*node).clone()), "random"),
            None => (None, ""),
        }
    }
}

/// An ordered sequence of strategies, evaluated first-non-empty-wins.
pub struct StrategyChain {
    strategies: Vec<Box<dyn SelectionStrategy>>,
}

impl StrategyChain {
    pub fn new(strategies: Vec<Box<dyn SelectionStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn select_node(&self, request: &StrategyRequest) -> (Option<Node>, &'static str) {
        for strategy in &self.strategies {
            let (node, reason) = strategy.select_node(request);
            if node.is_some() {
                return (node, reason);
            }
        }
        (None, "no_strategy_matched")
    }

    /// Builds a chain from configured strategy names. Unknown names are
    /// silently skipped (SPEC_FULL.md §6 config error policy); if the
    /// resulting chain is empty, falls back to a single `label_match`
    /// with load-balance on.
    pub fn from_names(names: &[String], label_match_load_balance: bool) -> Self {
        let mut strategies: Vec<Box<dyn SelectionStrategy>> = Vec::new();
        for name in names {
            match name.as_str() {
                "direct" => strategies.push(Box::new(DirectStrategy)),
                "affinity" => strategies.push(Box::new(AffinityStrategy)),
                "label_match" => strategies.push(Box::new(LabelMatchStrategy {
                    load_balance: label_match_load_balance,
                })),
                "load_balance" => strategies.push(Box::new(LoadBalanceStrategy)),
                "round_robin" => strategies.push(Box::new(RoundRobinStrategy::new())),
                "random" => strategies.push(Box::new(RandomStrategy)),
                other => tracing::warn!(strategy = other, "unknown strategy name, skipping"),
            }
        }
        if strategies.is_empty() {
            strategies.push(Box::new(LabelMatchStrategy { load_balance: true }));
        }
        Self::new(strategies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use models::{NodeStatus, Run, RunStatus, Task};
    use std::collections::HashMap;

    fn node(id: Id, max_concurrent: &str, labels: &[(&str, &str)]) -> Node {
        let mut capacity = HashMap::new();
        capacity.insert("max_concurrent".to_owned(), max_concurrent.to_owned());
        Node {
            id,
            status: NodeStatus::Online,
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            capacity,
            last_heartbeat: Some(Utc::now()),
        }
    }

    fn run_with_snapshot(snapshot: serde_json::Value) -> Run {
        Run {
            id: Id::new(),
            task_id: None,
            status: RunStatus::Queued,
            node_id: None,
            started_at: None,
            created_at: Utc::now(),
            snapshot,
        }
    }

    fn request(
        run: Run,
        task: Option<Task>,
        candidate_nodes: Vec<Node>,
        running_counts: HashMap<Id, i64>,
        preferred_node_id: Option<Id>,
    ) -> StrategyRequest {
        StrategyRequest {
            run,
            task,
            candidate_nodes,
            running_counts,
            preferred_node_id,
        }
    }

    #[test]
    fn direct_selects_pinned_node_with_capacity() {
        let n1 = node(Id::new(), "2", &[]);
        let n2 = node(Id::new(), "2", &[]);
        let run = run_with_snapshot(serde_json::json!({"node_id": n2.id.to_string()}));
        let req = request(run, None, vec![n1, n2.clone()], HashMap::new(), None);

        let (selected, reason) = DirectStrategy.select_node(&req);
        assert_eq!(selected.unwrap().id, n2.id);
        assert_eq!(reason, "direct");
    }

    #[test]
    fn direct_reports_no_capacity_without_selecting() {
        let n1 = node(Id::new(), "1", &[]);
        let run = run_with_snapshot(serde_json::json!({"node_id": n1.id.to_string()}));
        let mut running = HashMap::new();
        running.insert(n1.id, 1);
        let req = request(run, None, vec![n1], running, None);

        let (selected, reason) = DirectStrategy.select_node(&req);
        assert!(selected.is_none());
        assert_eq!(reason, "direct_no_capacity");
    }

    #[test]
    fn direct_is_silent_when_unset() {
        let run = run_with_snapshot(serde_json::json!({}));
        let req = request(run, None, vec![], HashMap::new(), None);
        let (selected, reason) = DirectStrategy.select_node(&req);
        assert!(selected.is_none());
        assert_eq!(reason, "");
    }

    #[test]
    fn label_match_requires_subset_and_picks_unique_match() {
        let mut n1 = node(Id::new(), "2", &[("env", "prod")]);
        n1.labels.insert("region".to_owned(), "us".to_owned());
        let n2 = node(Id::new(), "2", &[("env", "staging")]);
        let mut task = Task {
            id: Id::new(),
            labels: HashMap::new(),
            agent_id: None,
        };
        task.labels.insert("env".to_owned(), "prod".to_owned());

        let run = run_with_snapshot(serde_json::json!({}));
        let req = request(run, Some(task), vec![n1.clone(), n2], HashMap::new(), None);

        let strategy = LabelMatchStrategy { load_balance: false };
        let (selected, reason) = strategy.select_node(&req);
        assert_eq!(selected.unwrap().id, n1.id);
        assert_eq!(reason, "label_match");
    }

    #[test]
    fn label_match_load_balance_picks_most_remaining_capacity() {
        let n1 = node(Id::new(), "1", &[("env", "prod")]);
        let n2 = node(Id::new(), "2", &[("env", "prod")]);
        let mut task = Task {
            id: Id::new(),
            labels: HashMap::new(),
            agent_id: None,
        };
        task.labels.insert("env".to_owned(), "prod".to_owned());

        let run = run_with_snapshot(serde_json::json!({}));
        let mut running = HashMap::new();
        running.insert(n1.id, 1);
        let req = request(run, Some(task), vec![n1, n2.clone()], running, None);

        let strategy = LabelMatchStrategy { load_balance: true };
        let (selected, reason) = strategy.select_node(&req);
        assert_eq!(selected.unwrap().id, n2.id);
        assert_eq!(reason, "label_match_lb");
    }

    #[test]
    fn load_balance_ties_prefer_first_seen() {
        let n1 = node(Id::new(), "2", &[]);
        let n2 = node(Id::new(), "2", &[]);
        let run = run_with_snapshot(serde_json::json!({}));
        let req = request(run, None, vec![n1.clone(), n2], HashMap::new(), None);

        let (selected, reason) = LoadBalanceStrategy.select_node(&req);
        assert_eq!(selected.unwrap().id, n1.id);
        assert_eq!(reason, "load_balance");
    }

    #[test]
    fn round_robin_advances_past_chosen_slot() {
        let n1 = node(Id::new(), "1", &[]);
        let n2 = node(Id::new(), "1", &[]);
        let n3 = node(Id::new(), "1", &[]);
        let candidates = vec![n1.clone(), n2.clone(), n3.clone()];

        let strategy = RoundRobinStrategy::new();
        let mut chosen = Vec::new();
        for _ in 0..4 {
            let run = run_with_snapshot(serde_json::json!({}));
            let req = request(run, None, candidates.clone(), HashMap::new(), None);
            let (selected, reason) = strategy.select_node(&req);
            assert_eq!(reason, "round_robin");
            chosen.push(selected.unwrap().id);
        }
        assert_eq!(chosen, vec![n1.id, n2.id, n3.id, n1.id]);
    }

    #[test]
    fn chain_falls_through_and_reports_no_match() {
        let chain = StrategyChain::new(vec![Box::new(DirectStrategy), Box::new(AffinityStrategy)]);
        let run = run_with_snapshot(serde_json::json!({}));
        let req = request(run, None, vec![], HashMap::new(), None);
        let (selected, reason) = chain.select_node(&req);
        assert!(selected.is_none());
        assert_eq!(reason, "no_strategy_matched");
    }

    #[test]
    fn from_names_skips_unknown_and_falls_back_when_all_unknown() {
        let chain = StrategyChain::from_names(&["bogus".to_owned()], true);
        // Can't introspect strategy names directly; verify behavior
        // matches label_match_lb by construction: a run with no task
        // and one candidate with capacity should still match (empty
        // labels = all nodes match).
        let n1 = node(Id::new(), "1", &[]);
        let run = run_with_snapshot(serde_json::json!({}));
        let req = request(run, None, vec![n1.clone()], HashMap::new(), None);
        let (selected, _) = chain.select_node(&req);
        assert_eq!(selected.unwrap().id, n1.id);
    }
}
