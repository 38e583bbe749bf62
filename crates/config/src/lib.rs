//! Recognized configuration keys for the fleet scheduler.
//!
//! Mirrors the shape of the old LibLaaS config crate: a single
//! `once_cell`-backed singleton parsed once from a YAML file, with
//! custom [`serde::Deserialize`] impls for the compound string-encoded
//! fields (durations, host:port pairs) so the file stays readable.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::LevelFilter;

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// This scheduler instance's consumer identity. Default: "scheduler-default".
    #[serde(default = "default_node_id")]
    pub node_id: String,

    #[serde(default)]
    pub strategy: StrategyConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub fallback: FallbackConfig,

    #[serde(default)]
    pub requeue: RequeueConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_node_id() -> String {
    "scheduler-default".to_owned()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StrategyConfig {
    /// Informational only; does not affect chain resolution.
    #[serde(default)]
    pub default: Option<String>,

    /// Ordered list of strategy names. Unknown names are silently
    /// skipped at chain-build time. Empty/all-unknown resolves to a
    /// single `label_match` strategy with load-balance enabled.
    #[serde(default = "default_chain")]
    pub chain: Vec<String>,

    #[serde(default)]
    pub label_match: LabelMatchConfig,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            default: None,
            chain: default_chain(),
            label_match: LabelMatchConfig::default(),
        }
    }
}

fn default_chain() -> Vec<String> {
    vec![
        "direct".to_owned(),
        "affinity".to_owned(),
        "label_match".to_owned(),
    ]
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LabelMatchConfig {
    #[serde(default)]
    pub load_balance: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_addr")]
    pub addr: String,

    #[serde(default = "default_read_timeout", with = "humantime_duration")]
    pub read_timeout: Duration,

    #[serde(default = "default_read_count")]
    pub read_count: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            addr: default_redis_addr(),
            read_timeout: default_read_timeout(),
            read_count: default_read_count(),
        }
    }
}

fn default_redis_addr() -> String {
    "redis://127.0.0.1:6379".to_owned()
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_read_count() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct FallbackConfig {
    #[serde(default = "default_fallback_interval", with = "humantime_duration")]
    pub interval: Duration,

    #[serde(
        default = "default_fallback_stale_threshold",
        with = "humantime_duration"
    )]
    pub stale_threshold: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            interval: default_fallback_interval(),
            stale_threshold: default_fallback_stale_threshold(),
        }
    }
}

fn default_fallback_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_fallback_stale_threshold() -> Duration {
    Duration::from_secs(5 * 60)
}

#[derive(Debug, Deserialize, Clone)]
pub struct RequeueConfig {
    #[serde(
        default = "default_offline_threshold",
        with = "humantime_duration"
    )]
    pub offline_threshold: Duration,
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            offline_threshold: default_offline_threshold(),
        }
    }
}

fn default_offline_threshold() -> Duration {
    Duration::from_secs(30)
}

/// Heartbeat freshness window used by the node manager's store-fallback
/// path. Not currently exposed as a config key by the original system;
/// carried here as a named constant per the §4.2 decision table rather
/// than sprinkled as a magic number through the scheduler crate.
pub const HEARTBEAT_FRESHNESS_WINDOW: Duration = Duration::from_secs(45);

#[derive(Debug, Clone, Copy, Default)]
pub enum LoggingLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
    Off,
}

impl<'de> Deserialize<'de> for LoggingLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let v = String::deserialize(deserializer)?;

        Ok(match v.to_uppercase().as_str() {
            "ERROR" => Self::Error,
            "WARN" => Self::Warn,
            "INFO" => Self::Info,
            "DEBUG" => Self::Debug,
            "TRACE" => Self::Trace,
            "OFF" => Self::Off,
            other => Err(serde::de::Error::custom(format!(
                "unrecognized log level {other}"
            )))?,
        })
    }
}

impl From<LoggingLevel> for LevelFilter {
    fn from(value: LoggingLevel) -> Self {
        match value {
            LoggingLevel::Error => LevelFilter::ERROR,
            LoggingLevel::Warn => LevelFilter::WARN,
            LoggingLevel::Info => LevelFilter::INFO,
            LoggingLevel::Debug => LevelFilter::DEBUG,
            LoggingLevel::Trace => LevelFilter::TRACE,
            LoggingLevel::Off => LevelFilter::OFF,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub max_level: LoggingLevel,

    #[serde(default)]
    pub log_file: Option<String>,
}

/// `serde(with = ...)` module for parsing settings like `"5m"` / `"30s"`
/// into a [`Duration`] rather than forcing config files to spell out
/// `{ secs = 300, nanos = 0 }`.
mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    /// Accepts `"500ms"`, `"30s"`, `"5m"`, `"1h"`, or a bare integer of seconds.
    pub fn parse(raw: &str) -> Result<Duration, String> {
        let raw = raw.trim();

        if let Ok(secs) = raw.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        let (digits, suffix) = raw
            .find(|c: char| !c.is_ascii_digit())
            .map(|i| raw.split_at(i))
            .ok_or_else(|| format!("could not parse duration {raw}"))?;

        let amount: u64 = digits
            .parse()
            .map_err(|_| format!("could not parse duration {raw}"))?;

        match suffix {
            "ms" => Ok(Duration::from_millis(amount)),
            "s" => Ok(Duration::from_secs(amount)),
            "m" => Ok(Duration::from_secs(amount * 60)),
            "h" => Ok(Duration::from_secs(amount * 60 * 60)),
            other => Err(format!("unrecognized duration suffix {other} in {raw}")),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            strategy: StrategyConfig::default(),
            redis: RedisConfig::default(),
            fallback: FallbackConfig::default(),
            requeue: RequeueConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

static CONFIG: once_cell::sync::OnceCell<SchedulerConfig> = once_cell::sync::OnceCell::new();

/// Loads settings from `path`, layering defaults for anything absent, and
/// installs the result as the process-wide singleton. Must be called at
/// most once; subsequent calls are a no-op that returns the first result.
pub fn load(path: &str) -> Result<&'static SchedulerConfig, anyhow::Error> {
    let loaded = config::Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .add_source(config::Environment::with_prefix("SCHEDULER").separator("__"))
        .build()?;

    let parsed: SchedulerConfig = match loaded.try_deserialize() {
        Ok(c) => c,
        Err(config::ConfigError::NotFound(_)) => SchedulerConfig::default(),
        Err(e) => return Err(e.into()),
    };

    Ok(CONFIG.get_or_init(|| parsed))
}

/// Returns the process-wide settings, initializing with defaults (no
/// config file, no environment overrides) if [`load`] was never called.
pub fn settings() -> &'static SchedulerConfig {
    CONFIG.get_or_init(SchedulerConfig::default)
}

#[derive(Debug, Clone, Serialize, strum_macros::Display)]
pub enum ClockSource {
    /// Wall-clock time from the OS. The fallback loop's staleness
    /// check assumes this never jumps backward during a process's
    /// lifetime; an NTP step backward can cause the fallback loop to
    /// under- or over-count a Run's age for one tick. Not guarded
    /// against: see SPEC_FULL.md open question on clock source.
    SystemTime,
}

impl Default for ClockSource {
    fn default() -> Self {
        Self::SystemTime
    }
}
