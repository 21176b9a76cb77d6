//! Deliberators: black-box producers of signed outcomes.
//!
//! The pipeline never looks inside a deliberator's judgement; it fans a
//! vote out to each registered deliberator and collects whatever signed
//! verdicts come back.

use serde_json::{Value, json};

use crate::crypto::{self, SignerHandle};
use crate::error::PipelineError;
use crate::utils;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Affirm,
    Reject,
    Abstain,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Affirm => "AFFIRM",
            Self::Reject => "REJECT",
            Self::Abstain => "ABSTAIN",
        }
    }
}

/// A signed verdict from one deliberator.
#[derive(Debug, Clone)]
pub struct DeliberationOutcome {
    pub deliberator_id: String,
    pub vote_id: String,
    pub verdict: Verdict,
    pub rationale: Option<String>,
    /// Signature over the canonical outcome document, raw bytes.
    pub signature: Vec<u8>,
}

impl DeliberationOutcome {
    /// The document the signature covers.
    pub fn signed_document(&self) -> Value {
        json!({
            "deliberator_id": self.deliberator_id,
            "verdict": self.verdict.as_str(),
            "vote_id": self.vote_id,
        })
    }

    /// Wire form carried on `votes.deliberation-results`.
    pub fn to_payload(&self) -> Value {
        json!({
            "vote_id": self.vote_id,
            "deliberator_id": self.deliberator_id,
            "verdict": self.verdict.as_str(),
            "rationale": self.rationale,
            "signature": crypto::signature_to_base64(&self.signature),
            "recorded_at": utils::utc_now(),
        })
    }
}

pub trait Deliberator: Send + Sync {
    fn deliberator_id(&self) -> &str;

    /// Judge a ballot. Implementations may take time or fail transiently;
    /// a timeout surfaces as [`PipelineError::StageTimeout`].
    fn deliberate(&self, vote_id: &str, ballot: &Value)
    -> Result<DeliberationOutcome, PipelineError>;
}

/// In-process deliberator with a fixed verdict, signing its outcomes with
/// a local key. The unit of most pipeline tests.
pub struct LocalDeliberator {
    handle: SignerHandle,
    verdict: Verdict,
}

impl LocalDeliberator {
    /// A deliberator that affirms everything.
    pub fn affirming(handle: SignerHandle) -> Self {
        Self {
            handle,
            verdict: Verdict::Affirm,
        }
    }

    pub fn with_verdict(handle: SignerHandle, verdict: Verdict) -> Self {
        Self { handle, verdict }
    }
}

impl Deliberator for LocalDeliberator {
    fn deliberator_id(&self) -> &str {
        self.handle.signer_id()
    }

    fn deliberate(
        &self,
        vote_id: &str,
        _ballot: &Value,
    ) -> Result<DeliberationOutcome, PipelineError> {
        let mut outcome = DeliberationOutcome {
            deliberator_id: self.handle.signer_id().to_string(),
            vote_id: vote_id.to_string(),
            verdict: self.verdict,
            rationale: None,
            signature: Vec::new(),
        };
        let doc = crate::canonical::canonical_bytes(&outcome.signed_document());
        outcome.signature = self.handle.sign(&doc).to_vec();
        Ok(outcome)
    }
}
