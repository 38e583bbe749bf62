//! The persistence façade the scheduling core consumes. See
//! SPEC_FULL.md §6. This crate owns none of the store's reliability —
//! that is explicitly out of scope — it only defines the contract and
//! two adapters: an in-memory double for tests, and a thin Postgres
//! adapter for the subset of the contract that is plain single-table
//! CRUD.

mod memory;
mod pg;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use common::Id;
use models::{Node, Run, RunStatus, Task};

pub use memory::MemoryStore;
pub use pg::PgStore;

/// An external account binding, as looked up during affinity
/// resolution (SPEC_FULL.md §4.2 step 4). Account/credential
/// management is out of scope; this is the one field the core reads.
#[derive(Debug, Clone, Copy)]
pub struct Account {
    pub node_id: Option<Id>,
}

/// An external agent-instance binding, as looked up during affinity
/// resolution (SPEC_FULL.md §4.2 step 3).
#[derive(Debug, Clone, Copy)]
pub struct Instance {
    pub node_id: Option<Id>,
}

/// Persistence façade the scheduling core consumes. Method list matches
/// SPEC_FULL.md §6 exactly; no method beyond this list is recognized by
/// the core.
#[async_trait]
pub trait Store: Send + Sync {
    async fn list_all_nodes(&self) -> Result<Vec<Node>>;

    /// All nodes with a non-administrative status and a heartbeat
    /// within the freshness window. This is the store-level time-window
    /// fallback; the node manager's own `list_online_nodes` layers a
    /// heartbeat cache on top of this when one is configured.
    async fn list_online_nodes(&self, freshness_window: Duration) -> Result<Vec<Node>>;

    async fn list_runs_by_node(&self, node_id: Id) -> Result<Vec<Run>>;

    async fn list_running_runs(&self, limit: usize) -> Result<Vec<Run>>;

    async fn list_stale_queued_runs(&self, threshold: Duration) -> Result<Vec<Run>>;

    async fn get_run(&self, id: Id) -> Result<Option<Run>>;

    /// Conditional write: applies only if the Run's current status
    /// equals `expected_status`. Returns whether the write applied.
    /// This is the scheduler's sole commit point (SPEC_FULL.md §4.1
    /// step 10, §5 ordering guarantees).
    async fn update_run_status(
        &self,
        id: Id,
        expected_status: RunStatus,
        new_status: RunStatus,
        node_id: Option<Id>,
    ) -> Result<bool>;

    /// Idempotent: setting an already-`queued` Run back to `queued` is
    /// a no-op success.
    async fn reset_run_to_queued(&self, id: Id) -> Result<()>;

    async fn count_events_by_run(&self, run_id: Id) -> Result<u64>;

    async fn get_task(&self, id: Id) -> Result<Option<Task>>;

    async fn get_instance(&self, instance_id: &str) -> Result<Option<Instance>>;

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>>;
}
