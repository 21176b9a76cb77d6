//! Cessation guards.
//!
//! Once cessation is triggered it cannot be triggered again and cannot be
//! cancelled. New motions and executions are refused while in-progress work
//! runs to completion. Guards refuse operations without mutating anything.

use parking_lot::RwLock;

use crate::error::LifecycleError;
use crate::utils;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CessationRecord {
    pub trigger_id: String,
    pub triggered_at: String,
    pub operator_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct CessationGuard {
    record: RwLock<Option<CessationRecord>>,
}

impl CessationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger cessation. Fails if already triggered; there is no undo.
    pub fn trigger(&self, operator_id: Option<String>) -> Result<CessationRecord, LifecycleError> {
        let mut guard = self.record.write();
        if let Some(existing) = guard.as_ref() {
            return Err(LifecycleError::CessationAlreadyTriggered {
                trigger_id: existing.trigger_id.clone(),
                triggered_at: existing.triggered_at.clone(),
            });
        }
        let record = CessationRecord {
            trigger_id: utils::new_uuid(),
            triggered_at: utils::utc_now(),
            operator_id,
        };
        *guard = Some(record.clone());
        Ok(record)
    }

    pub fn is_triggered(&self) -> bool {
        self.record.read().is_some()
    }

    /// Refuse new motions while ceasing.
    pub fn check_motion(&self) -> Result<(), LifecycleError> {
        match self.record.read().as_ref() {
            Some(r) => Err(LifecycleError::MotionBlockedByCessation {
                trigger_id: r.trigger_id.clone(),
                triggered_at: r.triggered_at.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Refuse new executions while ceasing.
    pub fn check_execution(&self) -> Result<(), LifecycleError> {
        match self.record.read().as_ref() {
            Some(r) => Err(LifecycleError::ExecutionBlockedByCessation {
                trigger_id: r.trigger_id.clone(),
                triggered_at: r.triggered_at.clone(),
            }),
            None => Ok(()),
        }
    }
}
