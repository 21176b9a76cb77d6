//! The vote validation pipeline: stage-per-topic processing from cast to
//! consensus-validated, with dead-lettering and reconciliation overrides.

pub mod deliberator;
pub mod orchestrator;
pub mod topics;
pub mod vote;

pub use deliberator::{DeliberationOutcome, Deliberator, LocalDeliberator, Verdict};
pub use orchestrator::{CONSUMER_GROUP, Orchestrator, OrchestratorError};
pub use vote::{AdjudicationOutcome, DeliberationRecord, FinalState, VoteStage, VoteState};
