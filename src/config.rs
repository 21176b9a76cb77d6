//! Runtime configuration.
//!
//! Everything tunable lives here as serde structs with defaults, loadable
//! from a TOML file by the binaries. Retry budgets and cadences are
//! configuration, not constants baked into the subsystems.

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchonConfig {
    pub anchor: AnchorConfig,
    pub pipeline: PipelineConfig,
    pub reroute: RerouteConfig,
    pub witness: WitnessConfig,
    pub api: ApiConfig,
}

impl ArchonConfig {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

/// Checkpoint cadence: anchor when either threshold is crossed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    /// Anchor once this many unanchored events have accumulated.
    pub every_events: u64,
    /// Anchor when the oldest unanchored event is older than this.
    pub max_age_secs: u64,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            every_events: 100,
            max_age_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Retry budget per stage before a vote is dead-lettered.
    pub stage_retry_budget: u32,
    /// Per-stage timeout.
    pub stage_timeout_secs: u64,
    /// Deliberator results required before adjudication runs.
    pub deliberation_quorum: u32,
    /// Base for exponential backoff between stage retries.
    pub retry_backoff_base_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_retry_budget: 3,
            stage_timeout_secs: 30,
            deliberation_quorum: 1,
            retry_backoff_base_ms: 50,
        }
    }
}

/// Tool selection strategy for the refusal loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    Random,
    Priority,
}

impl SelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::Priority => "priority",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerouteConfig {
    pub max_attempts: u32,
    pub escalate_on_exhaustion: bool,
    /// Hours until a fresh activation's response deadline.
    pub response_hours: i64,
    pub strategy: SelectionStrategy,
}

impl Default for RerouteConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            escalate_on_exhaustion: true,
            response_hours: 8,
            strategy: SelectionStrategy::RoundRobin,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WitnessConfig {
    /// Co-sign attempts before `WitnessUnavailable` surfaces to the caller.
    pub retry_attempts: u32,
    /// Base for exponential backoff between co-sign attempts.
    pub backoff_base_ms: u64,
}

impl Default for WitnessConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            backoff_base_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
    /// Hard ceiling on page sizes, applied to every caller identically.
    pub page_limit_max: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".into(),
            page_limit_max: 1000,
        }
    }
}
