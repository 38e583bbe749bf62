use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::Id;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// A worker candidate. See SPEC_FULL.md §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Id,

    pub status: NodeStatus,

    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// Recognized key: `max_concurrent` (integer, default 1 if missing
    /// or unparsable). Stored as strings since this is a free-form
    /// capacity map in the source contract, not a typed struct.
    #[serde(default)]
    pub capacity: HashMap<String, String>,

    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Node administrative/operational status.
///
/// Only `Online` and `Offline` are heartbeat-derived; every other
/// variant is administrative and must never be overridden by
/// heartbeat logic (SPEC_FULL.md §3 invariant, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeStatus {
    Starting,
    Online,
    Unhealthy,
    Draining,
    Maintenance,
    Offline,
    Terminated,
    Unknown,
}

impl NodeStatus {
    /// True for every status an operator sets by hand, which heartbeat
    /// processing must preserve rather than overwrite.
    pub fn is_administrative(self) -> bool {
        !matches!(self, NodeStatus::Online | NodeStatus::Offline)
    }
}

impl Node {
    /// `max_concurrent` parsed from the capacity map, defaulting to 1
    /// when the key is missing, empty, or fails to parse as an integer
    /// (SPEC_FULL.md §4.3 capacity check, §8 boundary behavior). A
    /// parsable `0` (or negative value) is a real capacity, not a
    /// missing one — it still yields no room for more work, but it must
    /// not be silently promoted to the default.
    pub fn max_concurrent(&self) -> i64 {
        self.capacity
            .get("max_concurrent")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(1)
    }

    /// Remaining capacity given a running-count snapshot. May be
    /// negative if the node is over-subscribed; callers treat `<= 0`
    /// as "no capacity".
    pub fn remaining_capacity(&self, running: i64) -> i64 {
        self.max_concurrent() - running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_concurrent_defaults_to_one_when_missing_or_unparsable() {
        let mut node = sample_node();
        node.capacity.clear();
        assert_eq!(node.max_concurrent(), 1);

        node.capacity
            .insert("max_concurrent".to_owned(), "not a number".to_owned());
        assert_eq!(node.max_concurrent(), 1);
    }

    #[test]
    fn max_concurrent_zero_is_a_real_zero_not_a_default() {
        let mut node = sample_node();
        node.capacity
            .insert("max_concurrent".to_owned(), "0".to_owned());
        assert_eq!(node.max_concurrent(), 0);
        assert_eq!(node.remaining_capacity(0), 0);
    }

    #[test]
    fn max_concurrent_parses_positive_integers() {
        let mut node = sample_node();
        node.capacity
            .insert("max_concurrent".to_owned(), "4".to_owned());
        assert_eq!(node.max_concurrent(), 4);
    }

    #[test]
    fn administrative_statuses_exclude_online_and_offline() {
        assert!(!NodeStatus::Online.is_administrative());
        assert!(!NodeStatus::Offline.is_administrative());
        assert!(NodeStatus::Draining.is_administrative());
        assert!(NodeStatus::Maintenance.is_administrative());
        assert!(NodeStatus::Starting.is_administrative());
    }

    fn sample_node() -> Node {
        Node {
            id: Id::new(),
            status: NodeStatus::Online,
            labels: HashMap::new(),
            capacity: HashMap::new(),
            last_heartbeat: None,
        }
    }
}
