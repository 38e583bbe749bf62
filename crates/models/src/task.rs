use std::collections::HashMap;

use common::Id;
use serde::{Deserialize, Serialize};

/// Cached for affinity fallback. See SPEC_FULL.md §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Id,

    #[serde(default)]
    pub labels: HashMap<String, String>,

    #[serde(default)]
    pub agent_id: Option<String>,
}
