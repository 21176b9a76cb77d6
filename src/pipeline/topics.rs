//! The stage-per-topic table for vote validation.
//!
//! Partition counts are fixed: 6 for vote-scoped topics, 3 for
//! witness-scoped topics, 1 for the dead-letter and session topics.
//! Compaction is used only on `votes.validated` and `sessions.transcripts`.

use crate::bus::{CleanupPolicy, Retention, TopicConfig};

pub const VOTES_CAST: &str = "votes.cast";
pub const VOTES_VALIDATION_STARTED: &str = "votes.validation-started";
pub const VOTES_PENDING_VALIDATION: &str = "votes.pending-validation";
pub const VOTES_VALIDATION_REQUESTS: &str = "votes.validation-requests";
pub const VOTES_DELIBERATION_RESULTS: &str = "votes.deliberation-results";
pub const VOTES_VALIDATION_RESULTS: &str = "votes.validation-results";
pub const VOTES_WITNESS_REQUESTS: &str = "votes.witness-requests";
pub const VOTES_WITNESS_EVENTS: &str = "votes.witness.events";
pub const VOTES_ADJUDICATION_RESULTS: &str = "votes.adjudication-results";
pub const VOTES_VALIDATED: &str = "votes.validated";
pub const VOTES_OVERRIDES: &str = "votes.overrides";
pub const VOTES_DEAD_LETTER: &str = "votes.dead-letter";
pub const SESSIONS_CHECKPOINTS: &str = "sessions.checkpoints";
pub const SESSIONS_TRANSCRIPTS: &str = "sessions.transcripts";

fn topic(
    name: &str,
    partitions: u32,
    retention: Retention,
    cleanup: CleanupPolicy,
) -> TopicConfig {
    TopicConfig {
        name: name.to_string(),
        partitions,
        retention,
        cleanup,
        replication_factor: 1,
    }
}

/// The full topic table, in pipeline stage order.
pub fn standard_topics() -> Vec<TopicConfig> {
    use CleanupPolicy::{Compact, Delete};
    vec![
        topic(VOTES_CAST, 6, Retention::days(7), Delete),
        topic(VOTES_VALIDATION_STARTED, 6, Retention::days(7), Delete),
        topic(VOTES_PENDING_VALIDATION, 6, Retention::days(7), Delete),
        topic(VOTES_VALIDATION_REQUESTS, 6, Retention::days(7), Delete),
        topic(VOTES_DELIBERATION_RESULTS, 6, Retention::days(30), Delete),
        topic(VOTES_VALIDATION_RESULTS, 6, Retention::days(30), Delete),
        topic(VOTES_WITNESS_REQUESTS, 3, Retention::days(7), Delete),
        topic(VOTES_WITNESS_EVENTS, 3, Retention::Infinite, Delete),
        topic(VOTES_ADJUDICATION_RESULTS, 3, Retention::days(30), Delete),
        topic(VOTES_VALIDATED, 6, Retention::days(90), Compact),
        topic(VOTES_OVERRIDES, 3, Retention::Infinite, Delete),
        topic(VOTES_DEAD_LETTER, 1, Retention::Infinite, Delete),
        topic(SESSIONS_CHECKPOINTS, 1, Retention::Infinite, Delete),
        topic(SESSIONS_TRANSCRIPTS, 1, Retention::Infinite, Compact),
    ]
}
