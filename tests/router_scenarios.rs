//! Task routing and refusal-loop scenarios.

use serde_json::json;
use tempfile::tempdir;

use archon::config::ArchonConfig;
use archon::context::ArchonContext;
use archon::error::RoutingError;
use archon::router::{
    ExhaustionReason, RerouteOutcome, RouterError, Tool, ToolClass, ToolRegistry, ToolResponse,
    ToolStatus,
};
use archon::router::tar::ProgramRefs;
use archon::router::task::TaskState;

fn tool(id: &str, caps: &[&str]) -> Tool {
    Tool {
        tool_id: id.to_string(),
        tool_class: ToolClass::HumanCluster,
        status: ToolStatus::Available,
        capabilities: caps.iter().map(|c| c.to_string()).collect(),
    }
}

fn program() -> ProgramRefs {
    ProgramRefs {
        program_id: "prog-1".into(),
        award_id: "award-1".into(),
        mandate_id: "mandate-1".into(),
        supervisor_id: "supervisor_1".into(),
        owner_id: "owner_1".into(),
    }
}

fn open_context(dir: &tempfile::TempDir, tools: Vec<Tool>) -> anyhow::Result<ArchonContext> {
    Ok(ArchonContext::open(
        dir.path().join("archon.db"),
        ArchonConfig::default(),
        ToolRegistry::new(tools),
        program(),
    )?)
}

fn create_doc_task(context: &ArchonContext) -> anyhow::Result<String> {
    let task = context.router.create_task(
        "Draft the charter",
        "Draft the founding charter document",
        ToolClass::HumanCluster,
        vec!["doc_drafting".into()],
        vec!["Charter draft delivered".into()],
        None,
    )?;
    Ok(task.task_id)
}

/// Chained router events of one type for one task.
fn router_events(context: &ArchonContext, event_type: &str, task_id: &str) -> Vec<u64> {
    let head = context.store.head();
    context
        .store
        .range_by_type(event_type, 1, head)
        .unwrap()
        .into_iter()
        .filter(|e| {
            e.payload_value()
                .map(|p| p["task_id"] == task_id)
                .unwrap_or(false)
        })
        .map(|e| e.sequence)
        .collect()
}

#[test]
fn happy_path_activation_to_completion() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let context = open_context(&dir, vec![tool("tool-a", &["doc_drafting"])])?;
    let task_id = create_doc_task(&context)?;

    let RerouteOutcome::Activated(tar) = context.router.activate(&task_id)? else {
        panic!("activation must succeed with an available tool");
    };
    assert_eq!(tar.targeting.eligible_tools, vec!["tool-a"]);
    assert_eq!(tar.schema_version, "1.0");

    context.router.record_response(&task_id, "tool-a", ToolResponse::Accept)?;
    context.router.start_progress(&task_id)?;
    context
        .router
        .report_result(&task_id, "tool-a", &json!({"document": "charter-v1"}))?;
    let task = context.router.complete(&task_id)?;

    assert_eq!(task.state, TaskState::Completed);
    assert!(task.state.is_terminal());
    assert!(task.result.is_some());

    // Each transition left a chained event.
    for event_type in [
        "admin.task.created",
        "admin.task.activation_sent",
        "admin.task.accepted",
        "admin.task.started",
        "admin.task.reported",
        "admin.task.completed",
    ] {
        assert_eq!(
            router_events(&context, event_type, &task_id).len(),
            1,
            "expected exactly one {event_type}"
        );
    }
    Ok(())
}

#[test]
fn decline_reroutes_to_next_eligible_tool() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let context = open_context(
        &dir,
        vec![
            tool("tool-a", &["doc_drafting"]),
            tool("tool-b", &["doc_drafting"]),
            tool("tool-c", &["doc_drafting"]),
        ],
    )?;
    let task_id = create_doc_task(&context)?;

    // Round-robin picks tool-a first (tool_id ascending).
    let RerouteOutcome::Activated(tar1) = context.router.activate(&task_id)? else {
        panic!("initial activation");
    };
    assert_eq!(tar1.targeting.eligible_tools, vec!["tool-a"]);

    context.router.record_response(&task_id, "tool-a", ToolResponse::Decline)?;
    assert_eq!(context.router.task(&task_id)?.state, TaskState::NeedsReroute);

    // The refusal loop must not re-select anything already tried.
    let RerouteOutcome::Activated(tar2) = context.router.reroute(&task_id)? else {
        panic!("reroute should find tool-b");
    };
    assert_eq!(tar2.targeting.eligible_tools, vec!["tool-b"]);
    assert_ne!(tar1.tar_id, tar2.tar_id);

    let task = context.router.task(&task_id)?;
    assert_eq!(task.state, TaskState::ActivationSent);
    assert_eq!(task.attempt_count, 2);
    assert_eq!(task.attempt_history.len(), 2);
    // The exclusion set now covers both tried tools.
    assert!(task.exclusion_set().contains("tool-a"));
    assert!(task.exclusion_set().contains("tool-b"));

    assert_eq!(router_events(&context, "admin.reroute.started", &task_id).len(), 1);
    assert_eq!(
        router_events(&context, "admin.reroute.tool_selected", &task_id).len(),
        2
    );
    Ok(())
}

#[test]
fn exhaustion_with_no_eligible_tools_blocks_and_escalates() -> anyhow::Result<()> {
    let dir = tempdir()?;
    // Registry offers only A and B, and the task has already tried both.
    let context = open_context(
        &dir,
        vec![tool("A", &["doc_drafting"]), tool("B", &["doc_drafting"])],
    )?;
    let task_id = create_doc_task(&context)?;

    let RerouteOutcome::Activated(_) = context.router.activate(&task_id)? else {
        panic!("initial activation");
    };
    context.router.record_response(&task_id, "A", ToolResponse::Decline)?;
    let RerouteOutcome::Activated(_) = context.router.reroute(&task_id)? else {
        panic!("second activation");
    };
    context.router.record_response(&task_id, "B", ToolResponse::Decline)?;

    let outcome = context.router.reroute(&task_id)?;
    let RerouteOutcome::Blocked { reason } = outcome else {
        panic!("no tools remain, reroute must block");
    };
    assert_eq!(reason, ExhaustionReason::NoEligibleTools);

    let task = context.router.task(&task_id)?;
    assert_eq!(task.state, TaskState::Blocked);
    assert_eq!(task.escalations.len(), 1);
    assert_eq!(task.escalations[0].to, "supervisor_1");

    // Exhaustion and escalation are both on the chain.
    let exhausted = router_events(&context, "admin.reroute.exhausted", &task_id);
    assert_eq!(exhausted.len(), 1);
    let escalated = router_events(&context, "admin.escalation.sent", &task_id);
    assert_eq!(escalated.len(), 1);

    let head = context.store.head();
    let payload = context
        .store
        .range_by_type("admin.reroute.exhausted", 1, head)?
        .remove(0)
        .payload_value()?;
    assert_eq!(payload["reason"], "NO_ELIGIBLE_TOOLS");
    Ok(())
}

#[test]
fn max_attempts_guard_blocks_before_selection() -> anyhow::Result<()> {
    let dir = tempdir()?;
    // Plenty of tools, but the policy allows only one attempt.
    let context = open_context(
        &dir,
        vec![
            tool("tool-a", &["doc_drafting"]),
            tool("tool-b", &["doc_drafting"]),
            tool("tool-c", &["doc_drafting"]),
        ],
    )?;
    let task = context.router.create_task(
        "Draft the charter",
        "Draft the founding charter document",
        ToolClass::HumanCluster,
        vec!["doc_drafting".into()],
        vec![],
        Some(archon::router::ReroutePolicy {
            max_attempts: 1,
            escalate_on_exhaustion: true,
        }),
    )?;

    let RerouteOutcome::Activated(_) = context.router.activate(&task.task_id)? else {
        panic!("initial activation");
    };
    context
        .router
        .record_response(&task.task_id, "tool-a", ToolResponse::Decline)?;

    let RerouteOutcome::Blocked { reason } = context.router.reroute(&task.task_id)? else {
        panic!("budget spent, reroute must block");
    };
    assert_eq!(reason, ExhaustionReason::MaxAttemptsReached);

    let head = context.store.head();
    let payload = context
        .store
        .range_by_type("admin.reroute.exhausted", 1, head)?
        .remove(0)
        .payload_value()?;
    assert_eq!(payload["reason"], "MAX_ATTEMPTS_REACHED");
    Ok(())
}

#[test]
fn reroute_precondition_refuses_without_state_change() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let context = open_context(&dir, vec![tool("tool-a", &["doc_drafting"])])?;
    let task_id = create_doc_task(&context)?;

    let before = context.router.task(&task_id)?;
    let err = context.router.reroute(&task_id).unwrap_err();
    assert!(matches!(
        err,
        RouterError::Routing(RoutingError::PreconditionNotInRerouteState { .. })
    ));

    // Refused, and nothing moved.
    let after = context.router.task(&task_id)?;
    assert_eq!(before, after);
    assert!(router_events(&context, "admin.reroute.started", &task_id).is_empty());
    Ok(())
}

#[test]
fn timeout_sends_task_back_through_the_loop() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let context = open_context(
        &dir,
        vec![tool("tool-a", &["doc_drafting"]), tool("tool-b", &["doc_drafting"])],
    )?;
    let task_id = create_doc_task(&context)?;

    let RerouteOutcome::Activated(_) = context.router.activate(&task_id)? else {
        panic!("initial activation");
    };
    context.router.record_timeout(&task_id)?;
    assert_eq!(context.router.task(&task_id)?.state, TaskState::NeedsReroute);
    assert_eq!(router_events(&context, "admin.task.timeout", &task_id).len(), 1);

    let RerouteOutcome::Activated(tar) = context.router.reroute(&task_id)? else {
        panic!("reroute after timeout");
    };
    assert_eq!(tar.targeting.eligible_tools, vec!["tool-b"]);
    Ok(())
}

#[test]
fn result_from_wrong_tool_is_rejected() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let context = open_context(&dir, vec![tool("tool-a", &["doc_drafting"])])?;
    let task_id = create_doc_task(&context)?;

    let RerouteOutcome::Activated(_) = context.router.activate(&task_id)? else {
        panic!("initial activation");
    };
    context.router.record_response(&task_id, "tool-a", ToolResponse::Accept)?;
    context.router.start_progress(&task_id)?;

    let err = context
        .router
        .report_result(&task_id, "tool-z", &json!({}))
        .unwrap_err();
    assert!(matches!(err, RouterError::WrongTool { .. }));
    assert_eq!(context.router.task(&task_id)?.state, TaskState::InProgress);
    Ok(())
}
