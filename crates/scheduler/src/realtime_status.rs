use std::time::Duration;

use chrono::Utc;
use models::{Node, RealtimeNodeStatus};
use streams::HeartbeatRecord;

/// Outcome of consulting the heartbeat cache for one node, threaded
/// through as a tri-state rather than `Result<Option<_>>` so the
/// decision table in SPEC_FULL.md §4.2 reads directly off the match
/// arms below.
pub enum CacheLookup {
    NotConfigured,
    Errored,
    Hit(HeartbeatRecord),
    Miss,
}

/// A pure function reproducing the §4.2 heartbeat-freshness decision
/// table. Consumed by the (out-of-scope) HTTP layer to report per-node
/// status; kept here so it can never diverge from the node manager's
/// own candidate-selection policy (SPEC_FULL.md §4.4).
pub fn derive_realtime_status(node: &Node, cache: CacheLookup, freshness_window: Duration) -> RealtimeNodeStatus {
    if node.status.is_administrative() {
        return RealtimeNodeStatus {
            online: false,
            status: node.status.to_string(),
            capacity: node.capacity.clone(),
            last_heartbeat: node.last_heartbeat,
        };
    }

    match cache {
        CacheLookup::Hit(heartbeat) => RealtimeNodeStatus {
            online: true,
            status: "online".to_owned(),
            capacity: heartbeat
                .capacity
                .into_iter()
                .map(|(k, v)| (k, v.to_string()))
                .collect(),
            last_heartbeat: Some(heartbeat.updated_at),
        },
        CacheLookup::Miss => RealtimeNodeStatus {
            online: false,
            status: "offline".to_owned(),
            capacity: node.capacity.clone(),
            last_heartbeat: node.last_heartbeat,
        },
        CacheLookup::NotConfigured | CacheLookup::Errored => {
            let fresh = node
                .last_heartbeat
                .map(|hb| {
                    Utc::now()
                        .signed_duration_since(hb)
                        .to_std()
                        .unwrap_or(Duration::MAX)
                        <= freshness_window
                })
                .unwrap_or(false);
            RealtimeNodeStatus {
                online: fresh,
                status: if fresh { "online".to_owned() } else { "offline".to_owned() },
                capacity: node.capacity.clone(),
                last_heartbeat: node.last_heartbeat,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::NodeStatus;
    use std::collections::HashMap;

    fn node(status: NodeStatus, last_heartbeat_secs_ago: Option<i64>) -> Node {
        Node {
            id: common::Id::new(),
            status,
            labels: HashMap::new(),
            capacity: HashMap::new(),
            last_heartbeat: last_heartbeat_secs_ago.map(|s| Utc::now() - chrono::Duration::seconds(s)),
        }
    }

    #[test]
    fn administrative_status_is_never_online() {
        let n = node(NodeStatus::Draining, Some(1));
        let status = derive_realtime_status(&n, CacheLookup::Hit(HeartbeatRecord {
            status: "online".into(),
            capacity: HashMap::new(),
            updated_at: Utc::now(),
        }), Duration::from_secs(45));
        assert!(!status.online);
        assert_eq!(status.status, "draining");
    }

    #[test]
    fn cache_hit_is_online_regardless_of_heartbeat_age() {
        let n = node(NodeStatus::Online, Some(300));
        let status = derive_realtime_status(
            &n,
            CacheLookup::Hit(HeartbeatRecord {
                status: "online".into(),
                capacity: HashMap::new(),
                updated_at: Utc::now(),
            }),
            Duration::from_secs(45),
        );
        assert!(status.online);
    }

    #[test]
    fn cache_miss_is_offline() {
        let n = node(NodeStatus::Online, Some(1));
        let status = derive_realtime_status(&n, CacheLookup::Miss, Duration::from_secs(45));
        assert!(!status.online);
    }

    #[test]
    fn no_cache_falls_back_to_time_window() {
        let fresh = node(NodeStatus::Online, Some(10));
        let stale = node(NodeStatus::Online, Some(90));
        assert!(derive_realtime_status(&fresh, CacheLookup::NotConfigured, Duration::from_secs(45)).online);
        assert!(!derive_realtime_status(&stale, CacheLookup::NotConfigured, Duration::from_secs(45)).online);
    }

    #[test]
    fn cache_errored_behaves_like_no_cache() {
        let fresh = node(NodeStatus::Online, Some(10));
        assert!(derive_realtime_status(&fresh, CacheLookup::Errored, Duration::from_secs(45)).online);
    }
}
