//! Identity verification seam.
//!
//! Writers verify the submitting identity before any state change. Unknown
//! and suspended identities are permanent denials; an unreachable identity
//! service is transient and carries a retry-after hint. Identities are
//! never auto-created.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::IdentityError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum IdentityStatus {
    Active,
    Suspended { reason: Option<String> },
}

pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, signer_id: &str) -> Result<(), IdentityError>;
}

/// In-process identity directory.
#[derive(Debug, Default)]
pub struct IdentityDirectory {
    entries: RwLock<HashMap<String, IdentityStatus>>,
}

impl IdentityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, signer_id: impl Into<String>) {
        self.entries
            .write()
            .insert(signer_id.into(), IdentityStatus::Active);
    }

    pub fn suspend(&self, signer_id: &str, reason: Option<String>) {
        self.entries
            .write()
            .insert(signer_id.to_string(), IdentityStatus::Suspended { reason });
    }
}

impl IdentityVerifier for IdentityDirectory {
    fn verify(&self, signer_id: &str) -> Result<(), IdentityError> {
        match self.entries.read().get(signer_id) {
            Some(IdentityStatus::Active) => Ok(()),
            Some(IdentityStatus::Suspended { reason }) => Err(IdentityError::Suspended {
                signer_id: signer_id.to_string(),
                reason: reason.clone(),
            }),
            None => Err(IdentityError::NotFound {
                signer_id: signer_id.to_string(),
            }),
        }
    }
}
