//! Task router: activation, responses and the refusal loop.
//!
//! Per-task updates are serialized under a per-task lock; the loop works
//! on a fresh copy of state and persists atomically. Every branch of the
//! flow emits a distinct chained event.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde_json::json;
use tracing::{info, warn};

use crate::config::{RerouteConfig, SelectionStrategy};
use crate::crypto::SignerHandle;
use crate::error::{
    LifecycleError, RoutingError, StorageError, StoreError, decode_err, encode_err,
};
use crate::event::actors;
use crate::lifecycle::CessationGuard;
use crate::router::registry::{RegistryHandle, Tool, ToolClass};
use crate::router::tar::{ProgramRefs, Tar, build_tar};
use crate::router::task::{ReroutePolicy, TaskRecord, TaskResultRecord, TaskState};
use crate::store::{EventStore, WitnessService};
use crate::utils;

const TASKS_TREE: &str = "router_tasks";

#[derive(thiserror::Error, Debug)]
pub enum RouterError {
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },
    #[error("result for task {task_id} came from {got}, expected {expected}")]
    WrongTool {
        task_id: String,
        expected: String,
        got: String,
    },
    #[error("result for task {task_id} rejected: {detail}")]
    InvalidResult { task_id: String, detail: String },
}

/// Tool response to an activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolResponse {
    Accept,
    Decline,
    Clarify,
}

impl ToolResponse {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "ACCEPT",
            Self::Decline => "DECLINE",
            Self::Clarify => "CLARIFY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionReason {
    MaxAttemptsReached,
    NoEligibleTools,
}

impl ExhaustionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxAttemptsReached => "MAX_ATTEMPTS_REACHED",
            Self::NoEligibleTools => "NO_ELIGIBLE_TOOLS",
        }
    }
}

/// Result of running the refusal loop once.
#[derive(Debug, Clone)]
pub enum RerouteOutcome {
    Activated(Box<Tar>),
    Blocked { reason: ExhaustionReason },
}

pub struct TaskRouter {
    tasks: sled::Tree,
    registry: Arc<RegistryHandle>,
    store: Arc<EventStore>,
    signer: SignerHandle,
    witness: Arc<dyn WitnessService>,
    cfg: RerouteConfig,
    program: ProgramRefs,
    cessation: Option<Arc<CessationGuard>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TaskRouter {
    /// `signer` is the router's `SYSTEM:ROUTER` key.
    pub fn new(
        db: &sled::Db,
        registry: Arc<RegistryHandle>,
        store: Arc<EventStore>,
        signer: SignerHandle,
        witness: Arc<dyn WitnessService>,
        cfg: RerouteConfig,
        program: ProgramRefs,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            tasks: db.open_tree(TASKS_TREE)?,
            registry,
            store,
            signer,
            witness,
            cfg,
            program,
            cessation: None,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_cessation(&mut self, cessation: Arc<CessationGuard>) {
        self.cessation = Some(cessation);
    }

    fn task_lock(&self, task_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn task(&self, task_id: &str) -> Result<TaskRecord, RouterError> {
        let raw = self
            .tasks
            .get(task_id.as_bytes())
            .map_err(StorageError::Backend)?
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))?;
        Ok(minicbor::decode(&raw).map_err(decode_err).map_err(RouterError::Storage)?)
    }

    fn save(&self, task: &TaskRecord) -> Result<(), RouterError> {
        let raw = minicbor::to_vec(task).map_err(encode_err).map_err(RouterError::Storage)?;
        self.tasks
            .insert(task.task_id.as_bytes(), raw)
            .map_err(StorageError::Backend)?;
        Ok(())
    }

    fn emit(&self, event_type: &str, payload: serde_json::Value) -> Result<(), RouterError> {
        self.store
            .append(event_type, payload, actors::ROUTER, &self.signer, self.witness.as_ref())
            .map_err(RouterError::Store)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn create_task(
        &self,
        title: &str,
        summary: &str,
        tool_class: ToolClass,
        required_capabilities: Vec<String>,
        deliverables: Vec<String>,
        policy: Option<ReroutePolicy>,
    ) -> Result<TaskRecord, RouterError> {
        if let Some(cessation) = &self.cessation {
            cessation.check_execution()?;
        }
        let policy = policy.unwrap_or(ReroutePolicy {
            max_attempts: self.cfg.max_attempts,
            escalate_on_exhaustion: self.cfg.escalate_on_exhaustion,
        });
        let task = TaskRecord::new(
            title,
            summary,
            tool_class,
            required_capabilities,
            deliverables,
            policy,
        )
        .map_err(|e| RouterError::Storage(StorageError::Encode(e.to_string())))?;

        self.save(&task)?;
        self.emit(
            "admin.task.created",
            json!({
                "task_id": task.task_id,
                "title": title,
                "tool_class": tool_class.as_str(),
                "ts": task.created_at,
            }),
        )?;
        info!(task_id = %task.task_id, title, "task created");
        Ok(task)
    }

    /// Initial activation. Same selection logic as the refusal loop, but
    /// precondition CREATED and no reroute markers on the emitted event.
    pub fn activate(&self, task_id: &str) -> Result<RerouteOutcome, RouterError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock();

        let mut task = self.task(task_id)?;
        if task.state != TaskState::Created {
            return Err(RouterError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.state.as_str().to_string(),
                to: TaskState::ActivationSent.as_str().to_string(),
            });
        }
        self.select_and_activate(&mut task, false)
    }

    /// Record a tool's response to the outstanding activation.
    pub fn record_response(
        &self,
        task_id: &str,
        tool_id: &str,
        response: ToolResponse,
    ) -> Result<TaskRecord, RouterError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock();

        let mut task = self.task(task_id)?;
        if task.state != TaskState::ActivationSent {
            return Err(RouterError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.state.as_str().to_string(),
                to: "response".to_string(),
            });
        }
        if task.assigned_tool.as_deref() != Some(tool_id) {
            return Err(RouterError::WrongTool {
                task_id: task_id.to_string(),
                expected: task.assigned_tool.clone().unwrap_or_default(),
                got: tool_id.to_string(),
            });
        }

        match response {
            ToolResponse::Accept => {
                task.touch(TaskState::Accepted);
                self.emit(
                    "admin.task.accepted",
                    json!({"task_id": task_id, "tool_id": tool_id, "ts": task.last_updated_at}),
                )?;
            }
            ToolResponse::Decline => {
                task.touch(TaskState::NeedsReroute);
                self.emit(
                    "admin.task.declined",
                    json!({"task_id": task_id, "tool_id": tool_id, "ts": task.last_updated_at}),
                )?;
            }
            ToolResponse::Clarify => {
                // Clarification keeps the activation outstanding.
                self.emit(
                    "admin.task.clarify_requested",
                    json!({"task_id": task_id, "tool_id": tool_id, "ts": utils::utc_now()}),
                )?;
            }
        }
        self.save(&task)?;
        Ok(task)
    }

    /// Mark a missed response deadline: ACTIVATION_SENT -> NEEDS_REROUTE.
    pub fn record_timeout(&self, task_id: &str) -> Result<TaskRecord, RouterError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock();

        let mut task = self.task(task_id)?;
        if task.state != TaskState::ActivationSent {
            return Err(RouterError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.state.as_str().to_string(),
                to: TaskState::NeedsReroute.as_str().to_string(),
            });
        }
        let tool_id = task.assigned_tool.clone().unwrap_or_default();
        task.touch(TaskState::NeedsReroute);
        self.save(&task)?;
        self.emit(
            "admin.task.timeout",
            json!({"task_id": task_id, "tool_id": tool_id, "ts": task.last_updated_at}),
        )?;
        Ok(task)
    }

    pub fn start_progress(&self, task_id: &str) -> Result<TaskRecord, RouterError> {
        self.transition(task_id, TaskState::Accepted, TaskState::InProgress, "admin.task.started")
    }

    /// Record the structured result a tool submits for its task.
    pub fn report_result(
        &self,
        task_id: &str,
        tool_id: &str,
        output: &serde_json::Value,
    ) -> Result<TaskRecord, RouterError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock();

        let mut task = self.task(task_id)?;
        if task.state != TaskState::InProgress {
            return Err(RouterError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.state.as_str().to_string(),
                to: TaskState::Reported.as_str().to_string(),
            });
        }
        if task.assigned_tool.as_deref() != Some(tool_id) {
            return Err(RouterError::WrongTool {
                task_id: task_id.to_string(),
                expected: task.assigned_tool.clone().unwrap_or_default(),
                got: tool_id.to_string(),
            });
        }
        // Results must be structured output, not free text.
        if !output.is_object() || output.as_object().is_some_and(|o| o.is_empty()) {
            return Err(RouterError::InvalidResult {
                task_id: task_id.to_string(),
                detail: "structured output object required".into(),
            });
        }
        task.result = Some(TaskResultRecord::new(task_id, tool_id, output));
        task.touch(TaskState::Reported);
        self.save(&task)?;
        self.emit(
            "admin.task.reported",
            json!({"task_id": task_id, "tool_id": tool_id, "ts": task.last_updated_at}),
        )?;
        Ok(task)
    }

    pub fn complete(&self, task_id: &str) -> Result<TaskRecord, RouterError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock();

        let mut task = self.task(task_id)?;
        if task.state != TaskState::Reported || task.result.is_none() {
            return Err(RouterError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.state.as_str().to_string(),
                to: TaskState::Completed.as_str().to_string(),
            });
        }
        task.touch(TaskState::Completed);
        self.save(&task)?;
        self.emit(
            "admin.task.completed",
            json!({"task_id": task_id, "ts": task.last_updated_at}),
        )?;
        Ok(task)
    }

    fn transition(
        &self,
        task_id: &str,
        from: TaskState,
        to: TaskState,
        event_type: &str,
    ) -> Result<TaskRecord, RouterError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock();

        let mut task = self.task(task_id)?;
        if task.state != from {
            return Err(RouterError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.state.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        task.touch(to);
        self.save(&task)?;
        self.emit(event_type, json!({"task_id": task_id, "ts": task.last_updated_at}))?;
        Ok(task)
    }

    // ------------------------------------------------------------------
    // The refusal loop
    // ------------------------------------------------------------------

    /// Reroute a NEEDS_REROUTE task to the next eligible tool.
    ///
    /// Completes the refusal loop: decline -> reroute -> (maybe) decline
    /// again -> escalation.
    pub fn reroute(&self, task_id: &str) -> Result<RerouteOutcome, RouterError> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock();

        let mut task = self.task(task_id)?;

        // Step 1: precondition. Refuse without state change.
        if task.state != TaskState::NeedsReroute {
            return Err(RoutingError::PreconditionNotInRerouteState {
                task_id: task_id.to_string(),
                state: task.state.as_str().to_string(),
            }
            .into());
        }

        self.emit(
            "admin.reroute.started",
            json!({
                "task_id": task_id,
                "attempt_count": task.attempt_count,
                "ts": utils::utc_now(),
            }),
        )?;

        // Step 6: max-attempts guard runs before selection.
        if task.attempt_count >= task.reroute_policy.max_attempts {
            return self.exhaust(&mut task, ExhaustionReason::MaxAttemptsReached);
        }

        self.select_and_activate(&mut task, true)
    }

    fn select_and_activate(
        &self,
        task: &mut TaskRecord,
        is_reroute: bool,
    ) -> Result<RerouteOutcome, RouterError> {
        // Steps 2-4: exclusion set, candidate filter, deterministic order.
        let excluded = task.exclusion_set();
        let registry = self.registry.snapshot();
        let candidates =
            registry.eligible(task.tool_class, &task.required_capabilities, &excluded);

        // Step 7: nothing left to try.
        if candidates.is_empty() {
            return self.exhaust(task, ExhaustionReason::NoEligibleTools);
        }

        // Step 5: selection strategy. Priority and unknown strategies fall
        // back to the first candidate.
        let selected: &Tool = match self.cfg.strategy {
            SelectionStrategy::RoundRobin => candidates[0],
            SelectionStrategy::Random => {
                candidates.choose(&mut rand::thread_rng()).copied().unwrap()
            }
            SelectionStrategy::Priority => candidates[0],
        };

        self.emit(
            "admin.reroute.tool_selected",
            json!({
                "task_id": task.task_id,
                "selected_tool_id": selected.tool_id,
                "strategy": self.cfg.strategy.as_str(),
                "candidates_count": candidates.len(),
                "ts": utils::utc_now(),
            }),
        )?;

        // Step 8: fresh TAR, atomic state update.
        let tar = build_tar(task, &self.program, selected, self.cfg.response_hours);
        task.record_activation(&tar.tar_id, &selected.tool_id);
        self.save(task)?;

        self.emit(
            "admin.task.activation_sent",
            json!({
                "tar_id": tar.tar_id,
                "task_id": task.task_id,
                "tool_id": selected.tool_id,
                "tool_class": selected.tool_class.as_str(),
                "is_reroute": is_reroute,
                "attempt_number": task.attempt_count,
                "ts": utils::utc_now(),
            }),
        )?;
        info!(
            task_id = %task.task_id,
            tool_id = %selected.tool_id,
            attempt = task.attempt_count,
            "activation sent"
        );
        Ok(RerouteOutcome::Activated(Box::new(tar)))
    }

    fn exhaust(
        &self,
        task: &mut TaskRecord,
        reason: ExhaustionReason,
    ) -> Result<RerouteOutcome, RouterError> {
        warn!(task_id = %task.task_id, reason = reason.as_str(), "reroute exhausted");
        self.emit(
            "admin.reroute.exhausted",
            json!({
                "task_id": task.task_id,
                "reason": reason.as_str(),
                "max_attempts": task.reroute_policy.max_attempts,
                "tried_tools_count": task.exclusion_set().len(),
                "ts": utils::utc_now(),
            }),
        )?;

        task.record_exhaustion(&self.program.supervisor_id, reason.as_str());
        self.save(task)?;

        if task.reroute_policy.escalate_on_exhaustion {
            self.emit(
                "admin.escalation.sent",
                json!({
                    "task_id": task.task_id,
                    "escalation_to": self.program.supervisor_id,
                    "escalation_reason": reason.as_str(),
                    "ts": utils::utc_now(),
                }),
            )?;
        }
        Ok(RerouteOutcome::Blocked { reason })
    }
}
