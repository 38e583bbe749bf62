use chrono::{DateTime, Utc};
use common::Id;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumString};

/// One attempt to execute a Task. See SPEC_FULL.md §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Id,

    /// May be empty for orphan-recovery paths.
    #[serde(default)]
    pub task_id: Option<Id>,

    pub status: RunStatus,

    #[serde(default)]
    pub node_id: Option<Id>,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    /// Free-form structured record of the task spec at creation time.
    /// The scheduler only ever reads two shapes out of this: a direct
    /// node pin (`node_id` / `target_node`) and an affinity hint
    /// (`agent.instance_id` / `agent.account_id`). Everything else in
    /// here is opaque to the core.
    #[serde(default)]
    pub snapshot: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Assigned,
    Running,
    Paused,
    Done,
    Failed,
    Cancelled,
    Timeout,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Failed | RunStatus::Cancelled | RunStatus::Timeout)
    }
}

impl Run {
    /// Reads a direct node pin off the snapshot: `node_id` or
    /// `target_node`, whichever is present. Tolerates any JSON shape
    /// and never panics (SPEC_FULL.md design note on snapshot parsing).
    pub fn direct_node_id(&self) -> Option<String> {
        string_field(&self.snapshot, "node_id").or_else(|| string_field(&self.snapshot, "target_node"))
    }

    /// Reads the affinity hint's instance id: `agent.instance_id`.
    pub fn agent_instance_id(&self) -> Option<String> {
        nested_string_field(&self.snapshot, "agent", "instance_id")
    }

    /// Reads the affinity hint's account id: `agent.account_id`.
    pub fn agent_account_id(&self) -> Option<String> {
        nested_string_field(&self.snapshot, "agent", "account_id")
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .as_object()?
        .get(key)?
        .as_str()
        .map(str::to_owned)
        .filter(|s| !s.is_empty())
}

fn nested_string_field(value: &Value, outer: &str, inner: &str) -> Option<String> {
    value.as_object()?.get(outer).and_then(|v| string_field(v, inner))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run_with_snapshot(snapshot: Value) -> Run {
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

    #[test]
    fn direct_node_id_prefers_node_id_over_target_node() {
        let run = run_with_snapshot(json!({"node_id": "n1", "target_node": "n2"}));
        assert_eq!(run.direct_node_id().as_deref(), Some("n1"));
    }

    #[test]
    fn direct_node_id_falls_back_to_target_node() {
        let run = run_with_snapshot(json!({"target_node": "n2"}));
        assert_eq!(run.direct_node_id().as_deref(), Some("n2"));
    }

    #[test]
    fn direct_node_id_is_none_for_arbitrary_shapes() {
        assert_eq!(run_with_snapshot(Value::Null).direct_node_id(), None);
        assert_eq!(run_with_snapshot(json!([1, 2, 3])).direct_node_id(), None);
        assert_eq!(run_with_snapshot(json!({"node_id": ""})).direct_node_id(), None);
        assert_eq!(run_with_snapshot(json!({"node_id": 5})).direct_node_id(), None);
    }

    #[test]
    fn affinity_hints_read_nested_agent_object() {
        let run = run_with_snapshot(json!({"agent": {"instance_id": "i-1", "account_id": "a-1"}}));
        assert_eq!(run.agent_instance_id().as_deref(), Some("i-1"));
        assert_eq!(run.agent_account_id().as_deref(), Some("a-1"));
    }

    #[test]
    fn affinity_hints_missing_agent_object_is_none() {
        let run = run_with_snapshot(json!({}));
        assert_eq!(run.agent_instance_id(), None);
        assert_eq!(run.agent_account_id(), None);
    }
}
