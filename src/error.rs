//! Error families for the ledger, pipeline and router.
//!
//! Integrity errors are never suppressed and never auto-repaired: they
//! propagate to the subsystem boundary and halt it. Transient errors carry
//! enough context for bounded retry. Terminal business errors convert to
//! problem-details documents for the API surface.

use serde::Serialize;

/// Chain integrity violations found during verification. Fatal to the
/// verification operation; the using subsystem halts rather than proceed
/// on corrupt data.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("sequence 1 prev_hash is not the genesis anchor (found {found})")]
    GenesisMismatch { found: String },
    #[error("chain break at sequence {sequence}: prev_hash {found} != {expected}")]
    ChainBreak {
        sequence: u64,
        expected: String,
        found: String,
    },
    #[error("content hash mismatch at sequence {sequence}: stored {stored}, recomputed {recomputed}")]
    HashMismatch {
        sequence: u64,
        stored: String,
        recomputed: String,
    },
    #[error("agent signature invalid at sequence {sequence} (signer {signer_id}): {detail}")]
    SignatureInvalid {
        sequence: u64,
        signer_id: String,
        detail: String,
    },
    #[error("witness signature invalid at sequence {sequence} (witness {witness_id}): {detail}")]
    WitnessSignatureInvalid {
        sequence: u64,
        witness_id: String,
        detail: String,
    },
}

impl IntegrityError {
    /// Machine-readable failure kind, as reported by `verify_range`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GenesisMismatch { .. } => "genesis_mismatch",
            Self::ChainBreak { .. } => "chain_break",
            Self::HashMismatch { .. } => "hash_mismatch",
            Self::SignatureInvalid { .. } => "signature_invalid",
            Self::WitnessSignatureInvalid { .. } => "witness_signature_invalid",
        }
    }

    /// Sequence the violation was detected at (1 for genesis mismatch).
    pub fn sequence(&self) -> u64 {
        match self {
            Self::GenesisMismatch { .. } => 1,
            Self::ChainBreak { sequence, .. }
            | Self::HashMismatch { sequence, .. }
            | Self::SignatureInvalid { sequence, .. }
            | Self::WitnessSignatureInvalid { sequence, .. } => *sequence,
        }
    }
}

/// Witness co-signing failures.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum WitnessError {
    /// Transient: retried with backoff up to the configured budget.
    #[error("witness unavailable after {attempts} attempt(s)")]
    Unavailable { attempts: u32 },
    /// Terminal for the proposed event; the event is rejected.
    #[error("witness {witness_id} refused to attest: {reason}")]
    Refused { witness_id: String, reason: String },
}

impl WitnessError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Storage backend failures. Surfaced as-is; an append that hits one leaves
/// the chain unchanged.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(#[from] sled::Error),
    #[error("record encoding failed: {0}")]
    Encode(String),
    #[error("record decoding failed: {0}")]
    Decode(String),
}

/// Event store operation failures.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Witness(#[from] WitnessError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("event not found: {0}")]
    NotFound(String),
    #[error("invalid sequence range {from}..={to}")]
    InvalidRange { from: u64, to: u64 },
}

/// Pipeline stage failures.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Retried with exponential backoff, then dead-lettered.
    #[error("stage {stage} timed out for vote {vote_id}")]
    StageTimeout { vote_id: String, stage: String },
    /// Idempotently elided; reported for observability only.
    #[error("duplicate delivery for vote {vote_id} at stage {stage}")]
    DuplicateMessage { vote_id: String, stage: String },
    /// Structural error in a stage payload; the vote is dead-lettered.
    #[error("schema violation for vote {vote_id}: {detail}")]
    SchemaViolation { vote_id: String, detail: String },
    /// Transient transport failure, retried.
    #[error("partition {partition} of topic {topic} unavailable")]
    PartitionUnavailable { topic: String, partition: u32 },
}

/// Task routing failures.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("no eligible tools remain for task {task_id} (tried {tried})")]
    NoEligibleTools { task_id: String, tried: usize },
    #[error("task {task_id} reached max reroute attempts ({max_attempts})")]
    MaxAttemptsReached { task_id: String, max_attempts: u32 },
    /// Refuses the operation without any state change.
    #[error("task {task_id} is in state {state}, expected NEEDS_REROUTE")]
    PreconditionNotInRerouteState { task_id: String, state: String },
}

/// Identity verification failures. The first two are permanent denials; the
/// third is transient and carries a retry-after hint.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("signer identity {signer_id} not found in identity store")]
    NotFound { signer_id: String },
    #[error("signer identity {signer_id} is suspended")]
    Suspended {
        signer_id: String,
        reason: Option<String>,
    },
    #[error("identity verification service is temporarily unavailable")]
    ServiceUnavailable { retry_after_secs: u64 },
}

/// Lifecycle guards. All refuse operations without mutating state.
/// Cessation is irreversible; there is deliberately no "cancel" error.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("cessation already triggered at {triggered_at} (trigger {trigger_id})")]
    CessationAlreadyTriggered {
        trigger_id: String,
        triggered_at: String,
    },
    #[error("motion blocked: system cessation in progress since {triggered_at}")]
    MotionBlockedByCessation {
        trigger_id: String,
        triggered_at: String,
    },
    #[error("execution blocked: system cessation in progress since {triggered_at}")]
    ExecutionBlockedByCessation {
        trigger_id: String,
        triggered_at: String,
    },
}

/// RFC 7807 style problem report returned for terminal business errors.
#[derive(Debug, Clone, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_uri: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub instance: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl IdentityError {
    pub fn to_problem(&self, instance: &str) -> ProblemDetails {
        match self {
            Self::NotFound { .. } => ProblemDetails {
                type_uri: "urn:archon:identity:not-found".into(),
                title: "Identity Not Found".into(),
                status: 403,
                detail: self.to_string(),
                instance: instance.into(),
                error_code: "IDENTITY_NOT_FOUND".into(),
                reference: Some("NFR-5.2".into()),
                retry_after: None,
            },
            Self::Suspended { .. } => ProblemDetails {
                type_uri: "urn:archon:identity:suspended".into(),
                title: "Identity Suspended".into(),
                status: 403,
                detail: self.to_string(),
                instance: instance.into(),
                error_code: "IDENTITY_SUSPENDED".into(),
                reference: Some("NFR-5.2".into()),
                retry_after: None,
            },
            Self::ServiceUnavailable { retry_after_secs } => ProblemDetails {
                type_uri: "urn:archon:identity:service-unavailable".into(),
                title: "Identity Service Unavailable".into(),
                status: 503,
                detail: self.to_string(),
                instance: instance.into(),
                error_code: "IDENTITY_SERVICE_UNAVAILABLE".into(),
                reference: Some("NFR-5.2".into()),
                retry_after: Some(*retry_after_secs),
            },
        }
    }
}

impl LifecycleError {
    pub fn to_problem(&self, instance: &str) -> ProblemDetails {
        let (type_uri, title, code) = match self {
            Self::CessationAlreadyTriggered { .. } => (
                "urn:archon:lifecycle:cessation-already-triggered",
                "Cessation Already Triggered",
                "CESSATION_ALREADY_TRIGGERED",
            ),
            Self::MotionBlockedByCessation { .. } => (
                "urn:archon:lifecycle:motion-blocked",
                "Motion Blocked By Cessation",
                "MOTION_BLOCKED_BY_CESSATION",
            ),
            Self::ExecutionBlockedByCessation { .. } => (
                "urn:archon:lifecycle:execution-blocked",
                "Execution Blocked By Cessation",
                "EXECUTION_BLOCKED_BY_CESSATION",
            ),
        };
        ProblemDetails {
            type_uri: type_uri.into(),
            title: title.into(),
            status: 409,
            detail: self.to_string(),
            instance: instance.into(),
            error_code: code.into(),
            reference: Some("CT-11".into()),
            retry_after: None,
        }
    }
}

impl RoutingError {
    pub fn to_problem(&self, instance: &str) -> ProblemDetails {
        let (type_uri, title, code) = match self {
            Self::NoEligibleTools { .. } => (
                "urn:archon:routing:no-eligible-tools",
                "No Eligible Tools",
                "NO_ELIGIBLE_TOOLS",
            ),
            Self::MaxAttemptsReached { .. } => (
                "urn:archon:routing:max-attempts",
                "Max Reroute Attempts Reached",
                "MAX_ATTEMPTS_REACHED",
            ),
            Self::PreconditionNotInRerouteState { .. } => (
                "urn:archon:routing:not-reroutable",
                "Task Not In Reroute State",
                "PRECONDITION_NOT_IN_REROUTE_STATE",
            ),
        };
        ProblemDetails {
            type_uri: type_uri.into(),
            title: title.into(),
            status: 409,
            detail: self.to_string(),
            instance: instance.into(),
            error_code: code.into(),
            reference: None,
            retry_after: None,
        }
    }
}

pub(crate) fn encode_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Encode(e.to_string())
}

pub(crate) fn decode_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Decode(e.to_string())
}
