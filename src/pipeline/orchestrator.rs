//! Vote validation orchestrator.
//!
//! Drives the per-vote state machine by consuming the topic of the current
//! stage and producing into the next. Every transition appends a witnessed
//! event to the chain *before* the bus offset is committed, so chain order
//! within a vote follows stage order. Stage handlers are idempotent keyed
//! on `(vote_id, stage)`; duplicate deliveries are elided.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::bus::{Bus, BusError, Message};
use crate::config::PipelineConfig;
use crate::crypto::SignerHandle;
use crate::error::{
    IdentityError, LifecycleError, PipelineError, StorageError, StoreError, WitnessError,
    decode_err, encode_err,
};
use crate::event::actors;
use crate::identity::IdentityVerifier;
use crate::lifecycle::CessationGuard;
use crate::pipeline::deliberator::Deliberator;
use crate::pipeline::topics::*;
use crate::pipeline::vote::{DeliberationRecord, FinalState, VoteStage, VoteState};
use crate::store::{EventStore, WitnessService};
use crate::utils;

const VOTES_TREE: &str = "pipeline_votes";

/// Consumer group the orchestrator commits offsets under.
pub const CONSUMER_GROUP: &str = "orchestrator";

/// Topics the orchestrator consumes, in stage order.
const CONSUMED_TOPICS: &[&str] = &[
    VOTES_CAST,
    VOTES_PENDING_VALIDATION,
    VOTES_VALIDATION_REQUESTS,
    VOTES_DELIBERATION_RESULTS,
    VOTES_ADJUDICATION_RESULTS,
    VOTES_WITNESS_REQUESTS,
    VOTES_WITNESS_EVENTS,
    VOTES_OVERRIDES,
];

#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl OrchestratorError {
    /// Transient failures are retried against the stage budget; everything
    /// else either dead-letters (schema violations) or halts the pump.
    fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Pipeline(PipelineError::StageTimeout { .. })
                | Self::Pipeline(PipelineError::PartitionUnavailable { .. })
                | Self::Store(StoreError::Witness(WitnessError::Unavailable { .. }))
        )
    }
}

pub struct Orchestrator {
    bus: Arc<Bus>,
    store: Arc<EventStore>,
    votes: sled::Tree,
    deliberators: RwLock<Vec<Arc<dyn Deliberator>>>,
    signer: SignerHandle,
    witness: Arc<dyn WitnessService>,
    identity: Option<Arc<dyn IdentityVerifier>>,
    cessation: Option<Arc<CessationGuard>>,
    cfg: PipelineConfig,
}

impl Orchestrator {
    /// `signer` is the orchestrator's `SYSTEM:ORCHESTRATOR` key.
    pub fn new(
        db: &sled::Db,
        bus: Arc<Bus>,
        store: Arc<EventStore>,
        signer: SignerHandle,
        witness: Arc<dyn WitnessService>,
        cfg: PipelineConfig,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            bus,
            store,
            votes: db.open_tree(VOTES_TREE)?,
            deliberators: RwLock::new(Vec::new()),
            signer,
            witness,
            identity: None,
            cessation: None,
            cfg,
        })
    }

    pub fn register_deliberator(&self, deliberator: Arc<dyn Deliberator>) {
        self.deliberators.write().push(deliberator);
    }

    pub fn with_identity(&mut self, identity: Arc<dyn IdentityVerifier>) {
        self.identity = Some(identity);
    }

    pub fn with_cessation(&mut self, cessation: Arc<CessationGuard>) {
        self.cessation = Some(cessation);
    }

    // ------------------------------------------------------------------
    // Vote state persistence
    // ------------------------------------------------------------------

    pub fn vote_state(&self, vote_id: &str) -> Result<Option<VoteState>, StorageError> {
        match self.votes.get(vote_id.as_bytes())? {
            Some(raw) => Ok(Some(minicbor::decode(&raw).map_err(decode_err)?)),
            None => Ok(None),
        }
    }

    fn load_or_new(&self, vote_id: &str) -> Result<VoteState, StorageError> {
        Ok(self
            .vote_state(vote_id)?
            .unwrap_or_else(|| VoteState::new(vote_id)))
    }

    fn save(&self, state: &VoteState) -> Result<(), StorageError> {
        let raw = minicbor::to_vec(state).map_err(encode_err)?;
        self.votes.insert(state.vote_id.as_bytes(), raw)?;
        Ok(())
    }

    /// Latest compacted summary for a vote, if it reached `votes.validated`.
    pub fn latest_validated(&self, vote_id: &str) -> Result<Option<Value>, OrchestratorError> {
        match self.bus.latest_by_key(VOTES_VALIDATED, vote_id)? {
            Some(message) => Ok(Some(message.payload_value()?)),
            None => Ok(None),
        }
    }

    fn emit(&self, event_type: &str, payload: Value) -> Result<(), StoreError> {
        self.store.append(
            event_type,
            payload,
            actors::ORCHESTRATOR,
            &self.signer,
            self.witness.as_ref(),
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Entry point: optimistic capture
    // ------------------------------------------------------------------

    /// Capture a new vote into the pipeline. Identity-verified and
    /// cessation-guarded; resubmission of a known vote is elided.
    pub fn submit_vote(
        &self,
        vote_id: &str,
        ballot: Value,
        cast_by: &str,
    ) -> Result<(), OrchestratorError> {
        if let Some(cessation) = &self.cessation {
            cessation.check_motion()?;
        }
        if let Some(identity) = &self.identity {
            identity.verify(cast_by)?;
        }
        if self.vote_state(vote_id)?.is_some() {
            debug!(vote_id, "duplicate cast elided");
            return Ok(());
        }

        let payload = json!({
            "vote_id": vote_id,
            "ballot": ballot,
            "cast_by": cast_by,
        });
        self.bus.produce(VOTES_CAST, vote_id, &payload)?;
        self.emit("vote.cast", payload)?;
        self.save(&VoteState::new(vote_id))?;
        info!(vote_id, cast_by, "vote cast");
        Ok(())
    }

    /// Emit a reconciliation override for a vote. Applied when the
    /// overrides topic is consumed; appends, never rewrites.
    pub fn reconcile_override(
        &self,
        vote_id: &str,
        corrected_outcome: &str,
        reconciler_id: &str,
    ) -> Result<(), OrchestratorError> {
        if let Some(identity) = &self.identity {
            identity.verify(reconciler_id)?;
        }
        if self.vote_state(vote_id)?.is_none() {
            return Err(PipelineError::SchemaViolation {
                vote_id: vote_id.to_string(),
                detail: "override for unknown vote".into(),
            }
            .into());
        }
        self.bus.produce(
            VOTES_OVERRIDES,
            vote_id,
            &json!({
                "vote_id": vote_id,
                "corrected_outcome": corrected_outcome,
                "reconciler_id": reconciler_id,
                "ts": utils::utc_now(),
            }),
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pump
    // ------------------------------------------------------------------

    /// One pass over every consumed topic and partition. Returns the
    /// number of messages fully processed. Within a partition processing
    /// stops at the first transient failure so ordering is preserved.
    pub fn poll_once(&self) -> Result<u32, OrchestratorError> {
        let mut processed = 0;
        for &topic in CONSUMED_TOPICS {
            let Some(config) = self.bus.topic(topic)? else {
                continue;
            };
            for partition in 0..config.partitions {
                let messages = self.bus.consume(CONSUMER_GROUP, topic, partition, 16)?;
                for message in messages {
                    match self.dispatch(topic, &message) {
                        Ok(()) => {
                            self.bus
                                .commit(CONSUMER_GROUP, topic, partition, message.offset + 1)?;
                            processed += 1;
                        }
                        Err(OrchestratorError::Pipeline(PipelineError::SchemaViolation {
                            detail,
                            ..
                        })) => {
                            let mut state = self.load_or_new(&message.key)?;
                            self.dead_letter(&mut state, &format!("schema violation: {detail}"))?;
                            self.bus
                                .commit(CONSUMER_GROUP, topic, partition, message.offset + 1)?;
                            processed += 1;
                        }
                        Err(e) if e.is_transient() => {
                            let mut state = self.load_or_new(&message.key)?;
                            let attempts = state.record_retry(topic);
                            self.save(&state)?;
                            if attempts >= self.cfg.stage_retry_budget {
                                warn!(
                                    vote_id = %message.key,
                                    topic,
                                    attempts,
                                    "retry budget exhausted, dead-lettering"
                                );
                                self.dead_letter(
                                    &mut state,
                                    &format!("retry budget exhausted at {topic}"),
                                )?;
                                self.bus.commit(
                                    CONSUMER_GROUP,
                                    topic,
                                    partition,
                                    message.offset + 1,
                                )?;
                            } else {
                                let backoff =
                                    self.cfg.retry_backoff_base_ms << attempts.min(10);
                                debug!(vote_id = %message.key, topic, attempts, backoff, "transient failure, will retry");
                                std::thread::sleep(Duration::from_millis(backoff));
                                break;
                            }
                        }
                        Err(e) => {
                            // Halt over degrade: unexpected failures stop
                            // the pump rather than skip records.
                            error!(topic, vote_id = %message.key, %e, "pipeline halted");
                            return Err(e);
                        }
                    }
                }
            }
        }
        Ok(processed)
    }

    /// Drain until a full pass makes no progress.
    pub fn run_to_idle(&self) -> Result<u32, OrchestratorError> {
        let mut total = 0;
        loop {
            let n = self.poll_once()?;
            if n == 0 {
                return Ok(total);
            }
            total += n;
        }
    }

    /// Run the pump on a background thread until `shutdown` is set.
    pub fn spawn_pump(
        self: Arc<Self>,
        shutdown: Arc<AtomicBool>,
        interval: Duration,
    ) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                match self.poll_once() {
                    Ok(0) => std::thread::sleep(interval),
                    Ok(_) => {}
                    Err(e) => {
                        error!(%e, "orchestrator pump halted");
                        return;
                    }
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Stage handlers
    // ------------------------------------------------------------------

    fn dispatch(&self, topic: &str, message: &Message) -> Result<(), OrchestratorError> {
        match topic {
            VOTES_CAST => self.handle_cast(message),
            VOTES_PENDING_VALIDATION => self.handle_pending(message),
            VOTES_VALIDATION_REQUESTS => self.handle_validation_request(message),
            VOTES_DELIBERATION_RESULTS => self.handle_deliberation_result(message),
            VOTES_ADJUDICATION_RESULTS => self.handle_adjudication_result(message),
            VOTES_WITNESS_REQUESTS => self.handle_witness_request(message),
            VOTES_WITNESS_EVENTS => self.handle_witness_event(message),
            VOTES_OVERRIDES => self.handle_override(message),
            _ => Ok(()),
        }
    }

    fn field<'a>(&self, message: &Message, payload: &'a Value, key: &str) -> Result<&'a str, PipelineError> {
        payload
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError::SchemaViolation {
                vote_id: message.key.clone(),
                detail: format!("missing field '{key}'"),
            })
    }

    fn handle_cast(&self, message: &Message) -> Result<(), OrchestratorError> {
        let payload = message.payload_value()?;
        let vote_id = message.key.as_str();
        let mut state = self.load_or_new(vote_id)?;
        if state.is_terminal() || !state.mark_processed("validation_started") {
            debug!(vote_id, "duplicate cast delivery elided");
            return Ok(());
        }

        self.bus.produce(
            VOTES_VALIDATION_STARTED,
            vote_id,
            &json!({"vote_id": vote_id, "started_at": utils::utc_now()}),
        )?;
        self.bus.produce(VOTES_PENDING_VALIDATION, vote_id, &payload)?;
        self.emit("vote.validation_started", json!({"vote_id": vote_id}))?;

        state.enter_stage(VoteStage::ValidationStarted);
        state.enter_stage(VoteStage::Pending);
        self.save(&state)?;
        Ok(())
    }

    fn handle_pending(&self, message: &Message) -> Result<(), OrchestratorError> {
        let payload = message.payload_value()?;
        let vote_id = message.key.as_str();
        let mut state = self.load_or_new(vote_id)?;
        if state.is_terminal() || !state.mark_processed("fan_out") {
            return Ok(());
        }

        let ballot = payload.get("ballot").cloned().unwrap_or(Value::Null);
        for deliberator in self.deliberators.read().iter() {
            self.bus.produce(
                VOTES_VALIDATION_REQUESTS,
                vote_id,
                &json!({
                    "vote_id": vote_id,
                    "ballot": ballot,
                    "deliberator_id": deliberator.deliberator_id(),
                }),
            )?;
        }
        state.enter_stage(VoteStage::Deliberating);
        self.save(&state)?;
        Ok(())
    }

    fn handle_validation_request(&self, message: &Message) -> Result<(), OrchestratorError> {
        let payload = message.payload_value()?;
        let vote_id = message.key.clone();
        let deliberator_id = self.field(message, &payload, "deliberator_id")?.to_string();

        let mut state = self.load_or_new(&vote_id)?;
        if state.is_terminal() || !state.mark_processed(&format!("request:{deliberator_id}")) {
            return Ok(());
        }

        let deliberators = self.deliberators.read();
        let deliberator = deliberators
            .iter()
            .find(|d| d.deliberator_id() == deliberator_id)
            .ok_or_else(|| PipelineError::SchemaViolation {
                vote_id: vote_id.clone(),
                detail: format!("unknown deliberator '{deliberator_id}'"),
            })?;

        let ballot = payload.get("ballot").cloned().unwrap_or(Value::Null);
        let outcome = deliberator.deliberate(&vote_id, &ballot)?;
        let result_payload = outcome.to_payload();

        self.bus
            .produce(VOTES_DELIBERATION_RESULTS, &vote_id, &result_payload)?;
        // Per-validator audit copy.
        self.bus
            .produce(VOTES_VALIDATION_RESULTS, &vote_id, &result_payload)?;
        self.save(&state)?;
        Ok(())
    }

    fn handle_deliberation_result(&self, message: &Message) -> Result<(), OrchestratorError> {
        let payload = message.payload_value()?;
        let vote_id = message.key.clone();
        let deliberator_id = self.field(message, &payload, "deliberator_id")?.to_string();
        let verdict = self.field(message, &payload, "verdict")?.to_string();

        let mut state = self.load_or_new(&vote_id)?;
        if state.is_terminal() || !state.mark_processed(&format!("deliberation:{deliberator_id}")) {
            return Ok(());
        }

        state.deliberations.insert(
            deliberator_id.clone(),
            DeliberationRecord {
                deliberator_id,
                verdict,
                rationale: payload
                    .get("rationale")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                recorded_at: utils::utc_now(),
            },
        );
        self.emit("vote.deliberation_result", payload)?;

        if state.deliberations.len() as u32 >= self.cfg.deliberation_quorum
            && state.adjudication.is_none()
        {
            let outcome = state.adjudicate();
            self.bus.produce(
                VOTES_ADJUDICATION_RESULTS,
                &vote_id,
                &json!({
                    "vote_id": vote_id,
                    "outcome": outcome.outcome,
                    "affirm_count": outcome.affirm_count,
                    "reject_count": outcome.reject_count,
                    "adjudicated_at": outcome.adjudicated_at,
                }),
            )?;
            state.enter_stage(VoteStage::Adjudicating);
        }
        self.save(&state)?;
        Ok(())
    }

    fn handle_adjudication_result(&self, message: &Message) -> Result<(), OrchestratorError> {
        let payload = message.payload_value()?;
        let vote_id = message.key.clone();
        let outcome = self.field(message, &payload, "outcome")?.to_string();

        let mut state = self.load_or_new(&vote_id)?;
        if state.is_terminal() || !state.mark_processed("adjudicated") {
            return Ok(());
        }

        self.emit("vote.adjudication_result", payload)?;
        self.bus.produce(
            VOTES_WITNESS_REQUESTS,
            &vote_id,
            &json!({"vote_id": vote_id, "outcome": outcome}),
        )?;
        state.enter_stage(VoteStage::Witnessing);
        self.save(&state)?;
        Ok(())
    }

    fn handle_witness_request(&self, message: &Message) -> Result<(), OrchestratorError> {
        let payload = message.payload_value()?;
        let vote_id = message.key.clone();
        let outcome = self.field(message, &payload, "outcome")?.to_string();

        let mut state = self.load_or_new(&vote_id)?;
        if state.is_terminal() || !state.mark_processed("witnessed") {
            return Ok(());
        }

        // The attestation is the chain event itself: the witness co-signs
        // the signable tuple during append. Refusal is terminal for the
        // vote, not for the pipeline.
        match self.emit(
            "vote.witness_attestation",
            json!({"vote_id": vote_id, "outcome": outcome}),
        ) {
            Ok(()) => {}
            Err(StoreError::Witness(WitnessError::Refused { reason, .. })) => {
                self.dead_letter(&mut state, &format!("witness refused: {reason}"))?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        self.bus.produce(
            VOTES_WITNESS_EVENTS,
            &vote_id,
            &json!({
                "vote_id": vote_id,
                "outcome": outcome,
                "witnessed_at": utils::utc_now(),
            }),
        )?;
        self.save(&state)?;
        Ok(())
    }

    fn handle_witness_event(&self, message: &Message) -> Result<(), OrchestratorError> {
        let vote_id = message.key.clone();
        let mut state = self.load_or_new(&vote_id)?;
        if state.is_terminal() || !state.mark_processed("validated") {
            return Ok(());
        }

        state.enter_stage(VoteStage::Validated);
        state.final_state = FinalState::Validated;
        self.emit("vote.validated", state.summary())?;
        self.bus.produce(VOTES_VALIDATED, &vote_id, &state.summary())?;
        self.save(&state)?;
        info!(%vote_id, "vote validated");
        Ok(())
    }

    fn handle_override(&self, message: &Message) -> Result<(), OrchestratorError> {
        let payload = message.payload_value()?;
        let vote_id = message.key.clone();
        let corrected = self.field(message, &payload, "corrected_outcome")?.to_string();

        let mut state = self.load_or_new(&vote_id)?;
        // Overrides are idempotent per delivery, last-write-wins under
        // compaction; a dead-lettered vote may be overridden too.
        if !state.mark_processed(&format!("override:{}:{}", message.partition, message.offset)) {
            return Ok(());
        }

        state.final_state = FinalState::Overridden;
        state.override_outcome = Some(corrected);
        self.emit("vote.overridden", payload)?;
        self.bus.produce(VOTES_VALIDATED, &vote_id, &state.summary())?;
        self.save(&state)?;
        info!(%vote_id, "override applied");
        Ok(())
    }

    fn dead_letter(&self, state: &mut VoteState, reason: &str) -> Result<(), OrchestratorError> {
        state.enter_stage(VoteStage::DeadLettered);
        state.final_state = FinalState::DeadLettered;
        state.dead_letter_reason = Some(reason.to_string());

        let payload = json!({
            "vote_id": state.vote_id,
            "reason": reason,
            "ts": utils::utc_now(),
        });
        self.bus.produce(VOTES_DEAD_LETTER, &state.vote_id, &payload)?;
        self.emit("vote.dead_lettered", payload)?;
        self.save(state)?;
        warn!(vote_id = %state.vote_id, reason, "vote dead-lettered");
        Ok(())
    }
}
