//! Task state records.
//!
//! A task lives until terminal (COMPLETED, BLOCKED or QUARANTINED). Each
//! record carries its full attempt history and exclusion set, which the
//! refusal loop unions to guarantee a tool is never re-selected.

use serde_json::Value;

use crate::canonical::canonical_string;
use crate::router::registry::ToolClass;
use crate::utils;

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum TaskState {
    #[n(0)]
    Created,
    #[n(1)]
    ActivationSent,
    #[n(2)]
    Accepted,
    #[n(3)]
    InProgress,
    #[n(4)]
    Reported,
    #[n(5)]
    Completed,
    #[n(6)]
    NeedsReroute,
    #[n(7)]
    Blocked,
    #[n(8)]
    Quarantined,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::ActivationSent => "ACTIVATION_SENT",
            Self::Accepted => "ACCEPTED",
            Self::InProgress => "IN_PROGRESS",
            Self::Reported => "REPORTED",
            Self::Completed => "COMPLETED",
            Self::NeedsReroute => "NEEDS_REROUTE",
            Self::Blocked => "BLOCKED",
            Self::Quarantined => "QUARANTINED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Blocked | Self::Quarantined)
    }
}

/// One activation attempt.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct AttemptRecord {
    #[n(0)]
    pub tar_id: String,
    #[n(1)]
    pub tool_id: String,
    #[n(2)]
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ReroutePolicy {
    #[n(0)]
    pub max_attempts: u32,
    #[n(1)]
    pub escalate_on_exhaustion: bool,
}

impl Default for ReroutePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            escalate_on_exhaustion: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct Escalation {
    #[n(0)]
    pub to: String,
    #[n(1)]
    pub reason: String,
    #[n(2)]
    pub ts: String,
}

/// Immutable result submitted by a tool for a completed task.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct TaskResultRecord {
    #[n(0)]
    pub task_id: String,
    #[n(1)]
    pub tool_id: String,
    /// Canonical JSON of the structured output.
    #[n(2)]
    pub output: String,
    #[n(3)]
    pub submitted_at: String,
}

impl TaskResultRecord {
    pub fn new(task_id: &str, tool_id: &str, output: &Value) -> Self {
        Self {
            task_id: task_id.to_string(),
            tool_id: tool_id.to_string(),
            output: canonical_string(output),
            submitted_at: utils::utc_now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct TaskRecord {
    #[n(0)]
    pub task_id: String,
    #[n(1)]
    pub title: String,
    #[n(2)]
    pub summary: String,
    #[n(3)]
    pub state: TaskState,
    #[n(4)]
    pub tool_class: ToolClass,
    #[n(5)]
    pub required_capabilities: Vec<String>,
    #[n(6)]
    pub attempt_history: Vec<AttemptRecord>,
    #[n(7)]
    pub excluded_tools: Vec<String>,
    #[n(8)]
    pub attempt_count: u32,
    #[n(9)]
    pub reroute_policy: ReroutePolicy,
    #[n(10)]
    pub escalations: Vec<Escalation>,
    /// Current activation, if one is outstanding.
    #[n(11)]
    pub tar_id: Option<String>,
    /// Tool the current activation targets.
    #[n(12)]
    pub assigned_tool: Option<String>,
    #[n(13)]
    pub deliverables: Vec<String>,
    #[n(14)]
    pub result: Option<TaskResultRecord>,
    #[n(15)]
    pub created_at: String,
    #[n(16)]
    pub last_updated_at: String,
}

impl TaskRecord {
    pub fn new(
        title: &str,
        summary: &str,
        tool_class: ToolClass,
        required_capabilities: Vec<String>,
        deliverables: Vec<String>,
        policy: ReroutePolicy,
    ) -> anyhow::Result<Self> {
        let now = utils::utc_now();
        Ok(Self {
            task_id: utils::new_uuid_to_bech32("task_")?,
            title: title.to_string(),
            summary: summary.to_string(),
            state: TaskState::Created,
            tool_class,
            required_capabilities,
            attempt_history: Vec::new(),
            excluded_tools: Vec::new(),
            attempt_count: 0,
            reroute_policy: policy,
            escalations: Vec::new(),
            tar_id: None,
            assigned_tool: None,
            deliverables,
            result: None,
            created_at: now.clone(),
            last_updated_at: now,
        })
    }

    /// Exclusion set for candidate filtering: explicit exclusions unioned
    /// with every tool in the attempt history.
    pub fn exclusion_set(&self) -> std::collections::HashSet<String> {
        let mut excluded: std::collections::HashSet<String> =
            self.excluded_tools.iter().cloned().collect();
        for attempt in &self.attempt_history {
            excluded.insert(attempt.tool_id.clone());
        }
        excluded
    }

    /// Record a fresh activation against `tool_id`.
    pub fn record_activation(&mut self, tar_id: &str, tool_id: &str) {
        let now = utils::utc_now();
        self.state = TaskState::ActivationSent;
        self.tar_id = Some(tar_id.to_string());
        self.assigned_tool = Some(tool_id.to_string());
        self.attempt_count += 1;
        self.attempt_history.push(AttemptRecord {
            tar_id: tar_id.to_string(),
            tool_id: tool_id.to_string(),
            created_at: now.clone(),
        });
        if !self.excluded_tools.iter().any(|t| t == tool_id) {
            self.excluded_tools.push(tool_id.to_string());
        }
        self.last_updated_at = now;
    }

    /// Move to BLOCKED with an escalation entry.
    pub fn record_exhaustion(&mut self, to: &str, reason: &str) {
        let now = utils::utc_now();
        self.state = TaskState::Blocked;
        self.escalations.push(Escalation {
            to: to.to_string(),
            reason: reason.to_string(),
            ts: now.clone(),
        });
        self.last_updated_at = now;
    }

    pub fn touch(&mut self, state: TaskState) {
        self.state = state;
        self.last_updated_at = utils::utc_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> TaskRecord {
        TaskRecord::new(
            "Draft the charter",
            "Draft the founding charter document",
            ToolClass::HumanCluster,
            vec!["doc_drafting".into()],
            vec!["Charter draft delivered".into()],
            ReroutePolicy::default(),
        )
        .unwrap()
    }

    #[test]
    fn exclusion_set_unions_history_and_explicit() {
        let mut t = task();
        t.excluded_tools.push("tool-x".into());
        t.record_activation("tar-1", "tool-a");
        let excluded = t.exclusion_set();
        assert!(excluded.contains("tool-x"));
        assert!(excluded.contains("tool-a"));
    }

    #[test]
    fn activation_updates_history_and_count() {
        let mut t = task();
        t.record_activation("tar-1", "tool-a");
        assert_eq!(t.state, TaskState::ActivationSent);
        assert_eq!(t.attempt_count, 1);
        assert_eq!(t.attempt_history.len(), 1);
        assert_eq!(t.assigned_tool.as_deref(), Some("tool-a"));
        // The selected tool is excluded from its own next reroute.
        assert!(t.excluded_tools.contains(&"tool-a".to_string()));
    }

    #[test]
    fn exhaustion_blocks_and_escalates() {
        let mut t = task();
        t.record_exhaustion("supervisor_1", "NO_ELIGIBLE_TOOLS");
        assert_eq!(t.state, TaskState::Blocked);
        assert!(t.state.is_terminal());
        assert_eq!(t.escalations.len(), 1);
        assert_eq!(t.escalations[0].reason, "NO_ELIGIBLE_TOOLS");
    }

    #[test]
    fn cbor_round_trip() {
        let mut t = task();
        t.record_activation("tar-1", "tool-a");
        let bytes = minicbor::to_vec(&t).unwrap();
        let decoded: TaskRecord = minicbor::decode(&bytes).unwrap();
        assert_eq!(t, decoded);
    }
}
