//! End-to-end vote validation pipeline scenarios.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde_json::json;
use tempfile::tempdir;

use archon::config::ArchonConfig;
use archon::context::ArchonContext;
use archon::crypto::SignerHandle;
use archon::pipeline::topics;
use archon::pipeline::{FinalState, LocalDeliberator, Orchestrator, Verdict, VoteStage};
use archon::router::{ProgramRefs, ToolRegistry};
use archon::store::{CoSignError, LocalWitness, WitnessService};

fn program() -> ProgramRefs {
    ProgramRefs {
        program_id: "prog-1".into(),
        award_id: "award-1".into(),
        mandate_id: "mandate-1".into(),
        supervisor_id: "supervisor_1".into(),
        owner_id: "owner_1".into(),
    }
}

fn open_context(dir: &tempfile::TempDir) -> anyhow::Result<ArchonContext> {
    let context = ArchonContext::open(
        dir.path().join("archon.db"),
        ArchonConfig::default(),
        ToolRegistry::default(),
        program(),
    )?;
    context.identity.register("agent_caster");
    context
        .orchestrator
        .register_deliberator(Arc::new(LocalDeliberator::affirming(
            SignerHandle::generate("deliberator_a"),
        )));
    Ok(context)
}

/// Sequence of the first chained event of `event_type` for `vote_id`.
fn event_seq(context: &ArchonContext, event_type: &str, vote_id: &str) -> Option<u64> {
    let head = context.store.head();
    context
        .store
        .range_by_type(event_type, 1, head)
        .unwrap()
        .into_iter()
        .find(|e| {
            e.payload_value()
                .map(|p| p["vote_id"] == vote_id)
                .unwrap_or(false)
        })
        .map(|e| e.sequence)
}

#[test]
fn witnessed_pipeline_happy_path() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let context = open_context(&dir)?;

    context
        .orchestrator
        .submit_vote("v1", json!({"motion": "m-1", "choice": "aye"}), "agent_caster")?;
    context.orchestrator.run_to_idle()?;

    // The six chained events, in stage order.
    let expected = [
        "vote.cast",
        "vote.validation_started",
        "vote.deliberation_result",
        "vote.adjudication_result",
        "vote.witness_attestation",
        "vote.validated",
    ];
    let mut last_seq = 0;
    for event_type in expected {
        let seq = event_seq(&context, event_type, "v1")
            .unwrap_or_else(|| panic!("missing chained event {event_type}"));
        assert!(seq > last_seq, "{event_type} out of order");
        last_seq = seq;
    }

    let state = context.orchestrator.vote_state("v1")?.expect("vote exists");
    assert_eq!(state.stage, VoteStage::Validated);
    assert_eq!(state.final_state, FinalState::Validated);
    assert_eq!(state.deliberations.len(), 1);
    assert_eq!(state.adjudication.as_ref().unwrap().outcome, "AFFIRMED");

    // Compacted lookup serves the latest state.
    let latest = context.orchestrator.latest_validated("v1")?.expect("summary");
    assert_eq!(latest["final_state"], "VALIDATED");

    // The chain itself verifies end to end.
    let report = context.store.verify_range(1, context.store.head(), &context.keys)?;
    assert!(report.valid, "{report:?}");
    Ok(())
}

#[test]
fn validated_votes_carry_witness_attestation() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let context = open_context(&dir)?;

    for vote in ["v1", "v2", "v3"] {
        context
            .orchestrator
            .submit_vote(vote, json!({"choice": "aye"}), "agent_caster")?;
    }
    context.orchestrator.run_to_idle()?;

    for vote in ["v1", "v2", "v3"] {
        let state = context.orchestrator.vote_state(vote)?.unwrap();
        assert_eq!(state.final_state, FinalState::Validated);
        // No VALIDATED without a chained witness attestation.
        assert!(
            event_seq(&context, "vote.witness_attestation", vote).is_some(),
            "{vote} validated without witness attestation"
        );
    }
    Ok(())
}

#[test]
fn duplicate_casts_are_elided() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let context = open_context(&dir)?;

    context
        .orchestrator
        .submit_vote("v1", json!({"choice": "aye"}), "agent_caster")?;
    context
        .orchestrator
        .submit_vote("v1", json!({"choice": "aye"}), "agent_caster")?;
    context.orchestrator.run_to_idle()?;

    let head = context.store.head();
    let casts = context
        .store
        .range_by_type("vote.cast", 1, head)?
        .into_iter()
        .filter(|e| e.payload_value().unwrap()["vote_id"] == "v1")
        .count();
    assert_eq!(casts, 1, "resubmission must not duplicate the cast event");

    let validated = context
        .store
        .range_by_type("vote.validated", 1, head)?
        .len();
    assert_eq!(validated, 1);
    Ok(())
}

#[test]
fn unknown_caster_is_refused() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let context = open_context(&dir)?;

    let err = context
        .orchestrator
        .submit_vote("v9", json!({}), "agent_ghost")
        .unwrap_err();
    assert!(err.to_string().contains("not found"));
    // Nothing recorded: no state, no chain event.
    assert!(context.orchestrator.vote_state("v9")?.is_none());
    assert_eq!(context.store.head(), 0);
    Ok(())
}

#[test]
fn cessation_blocks_new_votes() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let context = open_context(&dir)?;

    context.cessation.trigger(Some("operator_1".into())).unwrap();
    let err = context
        .orchestrator
        .submit_vote("v1", json!({}), "agent_caster")
        .unwrap_err();
    assert!(err.to_string().contains("cessation"));
    assert_eq!(context.store.head(), 0);
    Ok(())
}

#[test]
fn override_appends_a_corrected_state() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let context = open_context(&dir)?;
    context.identity.register("agent_reconciler");

    context
        .orchestrator
        .submit_vote("v1", json!({"choice": "aye"}), "agent_caster")?;
    context.orchestrator.run_to_idle()?;
    assert_eq!(
        context.orchestrator.vote_state("v1")?.unwrap().final_state,
        FinalState::Validated
    );

    context
        .orchestrator
        .reconcile_override("v1", "REJECTED", "agent_reconciler")?;
    context.orchestrator.run_to_idle()?;

    let state = context.orchestrator.vote_state("v1")?.unwrap();
    assert_eq!(state.final_state, FinalState::Overridden);
    assert_eq!(state.override_outcome.as_deref(), Some("REJECTED"));

    // History is append-only: the original validated event is still there,
    // joined by the override.
    assert!(event_seq(&context, "vote.validated", "v1").is_some());
    assert!(event_seq(&context, "vote.overridden", "v1").is_some());

    // Compaction resolves to the latest state.
    context.bus.compact(topics::VOTES_VALIDATED)?;
    let latest = context.orchestrator.latest_validated("v1")?.unwrap();
    assert_eq!(latest["final_state"], "OVERRIDDEN");
    Ok(())
}

/// Witness that refuses exactly one co-sign call (1-indexed), delegating
/// everything else to a local witness.
struct RefuseNth {
    inner: LocalWitness,
    calls: AtomicU32,
    refuse_at: u32,
}

impl WitnessService for RefuseNth {
    fn witness_id(&self) -> &str {
        self.inner.witness_id()
    }
    fn co_sign(&self, signable: &[u8]) -> Result<[u8; 64], CoSignError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.refuse_at {
            return Err(CoSignError::Refused {
                reason: "not in session".into(),
            });
        }
        self.inner.co_sign(signable)
    }
}

#[test]
fn witness_refusal_dead_letters_the_vote() -> anyhow::Result<()> {
    use archon::bus::Bus;
    use archon::config::{PipelineConfig, WitnessConfig};
    use archon::store::EventStore;

    let dir = tempdir()?;
    let db = sled::open(dir.path().join("refusal.db"))?;

    let witness_handle = SignerHandle::generate("witness_test");
    // Call 5 is the witness attestation for a single-deliberator flow:
    // cast, validation_started, deliberation_result, adjudication_result,
    // then the attestation itself.
    let witness = Arc::new(RefuseNth {
        inner: LocalWitness::new(witness_handle),
        calls: AtomicU32::new(0),
        refuse_at: 5,
    });

    let store = Arc::new(EventStore::open(&db, WitnessConfig::default())?);
    let bus = Arc::new(Bus::open(&db)?);
    bus.ensure_topics(&topics::standard_topics())?;

    let orchestrator = Orchestrator::new(
        &db,
        bus.clone(),
        store.clone(),
        SignerHandle::generate("SYSTEM:ORCHESTRATOR"),
        witness,
        PipelineConfig::default(),
    )?;
    orchestrator.register_deliberator(Arc::new(LocalDeliberator::with_verdict(
        SignerHandle::generate("deliberator_a"),
        Verdict::Affirm,
    )));

    orchestrator.submit_vote("v1", json!({"choice": "aye"}), "agent_caster")?;
    orchestrator.run_to_idle()?;

    let state = orchestrator.vote_state("v1")?.unwrap();
    assert_eq!(state.stage, VoteStage::DeadLettered);
    assert_eq!(state.final_state, FinalState::DeadLettered);
    assert!(
        state
            .dead_letter_reason
            .as_deref()
            .unwrap()
            .contains("witness refused")
    );

    // The dead-letter topic retains the record, and the chain carries the
    // dead-letter marker instead of a validated event.
    let head = store.head();
    assert_eq!(store.range_by_type("vote.dead_lettered", 1, head)?.len(), 1);
    assert!(store.range_by_type("vote.validated", 1, head)?.is_empty());
    assert!(store.range_by_type("vote.witness_attestation", 1, head)?.is_empty());
    Ok(())
}

#[test]
fn dead_lettered_vote_may_be_overridden() -> anyhow::Result<()> {
    use archon::bus::Bus;
    use archon::config::{PipelineConfig, WitnessConfig};
    use archon::store::EventStore;

    let dir = tempdir()?;
    let db = sled::open(dir.path().join("dl-override.db"))?;
    let witness = Arc::new(RefuseNth {
        inner: LocalWitness::new(SignerHandle::generate("witness_test")),
        calls: AtomicU32::new(0),
        refuse_at: 5,
    });

    let store = Arc::new(EventStore::open(&db, WitnessConfig::default())?);
    let bus = Arc::new(Bus::open(&db)?);
    bus.ensure_topics(&topics::standard_topics())?;
    let orchestrator = Orchestrator::new(
        &db,
        bus,
        store,
        SignerHandle::generate("SYSTEM:ORCHESTRATOR"),
        witness,
        PipelineConfig::default(),
    )?;
    orchestrator.register_deliberator(Arc::new(LocalDeliberator::affirming(
        SignerHandle::generate("deliberator_a"),
    )));

    orchestrator.submit_vote("v1", json!({"choice": "aye"}), "agent_caster")?;
    orchestrator.run_to_idle()?;
    assert_eq!(
        orchestrator.vote_state("v1")?.unwrap().final_state,
        FinalState::DeadLettered
    );

    // Reconciliation may re-admit as an appended correction; the
    // dead-letter record itself is never removed.
    orchestrator.reconcile_override("v1", "AFFIRMED", "agent_reconciler")?;
    orchestrator.run_to_idle()?;

    let state = orchestrator.vote_state("v1")?.unwrap();
    assert_eq!(state.final_state, FinalState::Overridden);
    assert_eq!(state.override_outcome.as_deref(), Some("AFFIRMED"));
    assert!(state.dead_letter_reason.is_some());
    Ok(())
}
