//! Per-vote lifecycle state.
//!
//! One `VoteState` exists per `vote_id`. The stage advances by consuming
//! the topic of the current stage and producing into the next; the record
//! also carries the idempotency set, per-stage retry counters and the
//! per-deliberator results that feed adjudication.

use std::collections::BTreeMap;

use serde_json::json;

use crate::utils;

/// Pipeline stage of a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum VoteStage {
    #[n(0)]
    Cast,
    #[n(1)]
    ValidationStarted,
    #[n(2)]
    Pending,
    #[n(3)]
    Deliberating,
    #[n(4)]
    Adjudicating,
    #[n(5)]
    Witnessing,
    #[n(6)]
    Validated,
    #[n(7)]
    DeadLettered,
}

impl VoteStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cast => "CAST",
            Self::ValidationStarted => "VALIDATION_STARTED",
            Self::Pending => "PENDING",
            Self::Deliberating => "DELIBERATING",
            Self::Adjudicating => "ADJUDICATING",
            Self::Witnessing => "WITNESSING",
            Self::Validated => "VALIDATED",
            Self::DeadLettered => "DEAD_LETTERED",
        }
    }
}

/// Terminal classification of a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum FinalState {
    #[n(0)]
    Pending,
    #[n(1)]
    Validated,
    #[n(2)]
    Overridden,
    #[n(3)]
    DeadLettered,
}

impl FinalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Validated => "VALIDATED",
            Self::Overridden => "OVERRIDDEN",
            Self::DeadLettered => "DEAD_LETTERED",
        }
    }
}

/// One deliberator's recorded output for a vote.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct DeliberationRecord {
    #[n(0)]
    pub deliberator_id: String,
    #[n(1)]
    pub verdict: String,
    #[n(2)]
    pub rationale: Option<String>,
    #[n(3)]
    pub recorded_at: String,
}

/// Adjudicated outcome over the collected deliberations.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct AdjudicationOutcome {
    /// AFFIRMED or REJECTED, by deliberator majority.
    #[n(0)]
    pub outcome: String,
    #[n(1)]
    pub affirm_count: u32,
    #[n(2)]
    pub reject_count: u32,
    #[n(3)]
    pub adjudicated_at: String,
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct VoteState {
    #[n(0)]
    pub vote_id: String,
    #[n(1)]
    pub stage: VoteStage,
    #[n(2)]
    pub final_state: FinalState,
    /// Stage name -> timestamp of first entry.
    #[n(3)]
    pub stage_timestamps: BTreeMap<String, String>,
    #[n(4)]
    pub deliberations: BTreeMap<String, DeliberationRecord>,
    #[n(5)]
    pub adjudication: Option<AdjudicationOutcome>,
    /// Stage name -> delivery attempts so far.
    #[n(6)]
    pub retries: BTreeMap<String, u32>,
    /// Idempotency set: processed `(vote_id, stage)` markers.
    #[n(7)]
    pub processed: Vec<String>,
    #[n(8)]
    pub dead_letter_reason: Option<String>,
    /// Corrected outcome applied at reconciliation, if any.
    #[n(9)]
    pub override_outcome: Option<String>,
}

impl VoteState {
    pub fn new(vote_id: impl Into<String>) -> Self {
        let mut state = Self {
            vote_id: vote_id.into(),
            stage: VoteStage::Cast,
            final_state: FinalState::Pending,
            stage_timestamps: BTreeMap::new(),
            deliberations: BTreeMap::new(),
            adjudication: None,
            retries: BTreeMap::new(),
            processed: Vec::new(),
            dead_letter_reason: None,
            override_outcome: None,
        };
        state.enter_stage(VoteStage::Cast);
        state
    }

    /// Advance to `stage`, stamping first entry.
    pub fn enter_stage(&mut self, stage: VoteStage) {
        self.stage = stage;
        self.stage_timestamps
            .entry(stage.as_str().to_string())
            .or_insert_with(utils::utc_now);
    }

    /// Check-and-set on the idempotency marker. Returns false when the
    /// marker was already present (duplicate delivery, to be elided).
    pub fn mark_processed(&mut self, marker: &str) -> bool {
        if self.processed.iter().any(|m| m == marker) {
            return false;
        }
        self.processed.push(marker.to_string());
        true
    }

    pub fn is_processed(&self, marker: &str) -> bool {
        self.processed.iter().any(|m| m == marker)
    }

    /// Bump the retry counter for a stage key; returns the new attempt
    /// count.
    pub fn record_retry(&mut self, stage: &str) -> u32 {
        let count = self.retries.entry(stage.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.final_state,
            FinalState::Validated | FinalState::Overridden | FinalState::DeadLettered
        )
    }

    /// Majority adjudication over the recorded deliberations.
    pub fn adjudicate(&mut self) -> AdjudicationOutcome {
        let affirm_count = self
            .deliberations
            .values()
            .filter(|d| d.verdict == "AFFIRM")
            .count() as u32;
        let reject_count = self
            .deliberations
            .values()
            .filter(|d| d.verdict == "REJECT")
            .count() as u32;
        let outcome = AdjudicationOutcome {
            outcome: if affirm_count >= reject_count {
                "AFFIRMED".to_string()
            } else {
                "REJECTED".to_string()
            },
            affirm_count,
            reject_count,
            adjudicated_at: utils::utc_now(),
        };
        self.adjudication = Some(outcome.clone());
        outcome
    }

    /// Summary document for the compacted `votes.validated` topic.
    pub fn summary(&self) -> serde_json::Value {
        json!({
            "vote_id": self.vote_id,
            "stage": self.stage.as_str(),
            "final_state": self.final_state.as_str(),
            "adjudication": self.adjudication.as_ref().map(|a| json!({
                "outcome": a.outcome,
                "affirm_count": a.affirm_count,
                "reject_count": a.reject_count,
            })),
            "override_outcome": self.override_outcome,
            "dead_letter_reason": self.dead_letter_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_marker_elides_duplicates() {
        let mut state = VoteState::new("vote-1");
        assert!(state.mark_processed("validation_started"));
        assert!(!state.mark_processed("validation_started"));
        assert!(state.is_processed("validation_started"));
    }

    #[test]
    fn stage_entry_timestamps_are_stamped_once() {
        let mut state = VoteState::new("vote-1");
        state.enter_stage(VoteStage::Pending);
        let first = state.stage_timestamps.get("PENDING").cloned();
        state.enter_stage(VoteStage::Pending);
        assert_eq!(state.stage_timestamps.get("PENDING").cloned(), first);
    }

    #[test]
    fn majority_adjudication() {
        let mut state = VoteState::new("vote-1");
        for (id, verdict) in [("d1", "AFFIRM"), ("d2", "AFFIRM"), ("d3", "REJECT")] {
            state.deliberations.insert(
                id.to_string(),
                DeliberationRecord {
                    deliberator_id: id.to_string(),
                    verdict: verdict.to_string(),
                    rationale: None,
                    recorded_at: utils::utc_now(),
                },
            );
        }
        let outcome = state.adjudicate();
        assert_eq!(outcome.outcome, "AFFIRMED");
        assert_eq!(outcome.affirm_count, 2);
        assert_eq!(outcome.reject_count, 1);
    }

    #[test]
    fn cbor_round_trip() {
        let mut state = VoteState::new("vote-1");
        state.record_retry("votes.validation-requests");
        state.mark_processed("cast");
        let bytes = minicbor::to_vec(&state).unwrap();
        let decoded: VoteState = minicbor::decode(&bytes).unwrap();
        assert_eq!(state, decoded);
    }
}
