//! Tool registry: who can be activated for what.
//!
//! The registry is read-mostly; updates publish a whole new immutable
//! snapshot behind the handle, so candidate filtering never takes a lock
//! on the hot path.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode,
)]
pub enum ToolClass {
    #[serde(rename = "HUMAN_CLUSTER")]
    #[n(0)]
    HumanCluster,
    #[serde(rename = "DIGITAL_TOOL")]
    #[n(1)]
    DigitalTool,
}

impl ToolClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HumanCluster => "HUMAN_CLUSTER",
            Self::DigitalTool => "DIGITAL_TOOL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolStatus {
    #[serde(rename = "AVAILABLE")]
    Available,
    #[serde(rename = "BUSY")]
    Busy,
    #[serde(rename = "OFFLINE")]
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub tool_id: String,
    pub tool_class: ToolClass,
    pub status: ToolStatus,
    pub capabilities: Vec<String>,
}

/// Immutable registry snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolRegistry {
    pub tools: Vec<Tool>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Tool>) -> Self {
        Self { tools }
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Candidate filter: matching class, AVAILABLE, capability superset,
    /// and not excluded. Sorted by `tool_id` ascending for deterministic
    /// (round-robin stable) ordering.
    pub fn eligible(
        &self,
        tool_class: ToolClass,
        required_capabilities: &[String],
        excluded: &HashSet<String>,
    ) -> Vec<&Tool> {
        let mut candidates: Vec<&Tool> = self
            .tools
            .iter()
            .filter(|t| !excluded.contains(&t.tool_id))
            .filter(|t| t.tool_class == tool_class)
            .filter(|t| t.status == ToolStatus::Available)
            .filter(|t| {
                required_capabilities
                    .iter()
                    .all(|c| t.capabilities.contains(c))
            })
            .collect();
        candidates.sort_by(|a, b| a.tool_id.cmp(&b.tool_id));
        candidates
    }
}

/// Publishes registry snapshots; readers clone an `Arc` and never block
/// writers.
#[derive(Debug, Default)]
pub struct RegistryHandle {
    inner: RwLock<Arc<ToolRegistry>>,
}

impl RegistryHandle {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            inner: RwLock::new(Arc::new(registry)),
        }
    }

    pub fn snapshot(&self) -> Arc<ToolRegistry> {
        self.inner.read().clone()
    }

    pub fn publish(&self, registry: ToolRegistry) {
        *self.inner.write() = Arc::new(registry);
    }
}
