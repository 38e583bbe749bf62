//! Copyright (c) 2023 University of New Hampshire
//! SPDX-License-Identifier: MIT

//! Grab-bag of re-exports and small cross-crate utilities, in the same
//! spirit as the old `common` crate's prelude: every downstream crate
//! pulls its third-party dependencies through here so a version bump
//! happens in one place.

pub mod prelude {
    pub use anyhow;
    pub use async_trait;
    pub use chrono;
    pub use config;
    pub use dashmap;
    pub use futures;
    pub use itertools;
    pub use once_cell;
    pub use parking_lot;
    pub use rand;
    pub use thiserror;
    pub use tokio;
    pub use tokio_util;
    pub use tracing;
    pub use uuid;

    pub use serde::{Deserialize, Serialize};
    pub use serde_json;
}

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the process-wide `tracing` subscriber. Honors `RUST_LOG`
/// when set, otherwise falls back to the level in `max_level`.
pub fn init_logging(max_level: config::LoggingLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_filter_str(max_level)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

fn level_filter_str(level: config::LoggingLevel) -> &'static str {
    match level {
        config::LoggingLevel::Error => "error",
        config::LoggingLevel::Warn => "warn",
        config::LoggingLevel::Info => "info",
        config::LoggingLevel::Debug => "debug",
        config::LoggingLevel::Trace => "trace",
        config::LoggingLevel::Off => "off",
    }
}

/// Opaque identifier type shared by every entity the scheduler reads
/// or writes (nodes, runs, tasks, events). Thin wrapper around
/// [`uuid::Uuid`] so ids are `Display`/`FromStr`-able for logging and
/// CLI arguments, mirroring the old `dal::ID` type without dragging in
/// the rest of that crate's SQL machinery.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct Id(uuid::Uuid);

impl Id {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn nil() -> Self {
        Self(uuid::Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for Id {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<uuid::Uuid> for Id {
    fn from(u: uuid::Uuid) -> Self {
        Self(u)
    }
}

impl From<Id> for uuid::Uuid {
    fn from(id: Id) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_roundtrips_through_display_and_fromstr() {
        let id = Id::new();
        let parsed: Id = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn nil_id_is_nil() {
        assert!(Id::nil().is_nil());
        assert!(!Id::new().is_nil());
    }
}
