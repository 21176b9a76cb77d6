//! Task Activation Request (TAR) wire format.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::router::registry::{Tool, ToolClass};
use crate::router::task::TaskRecord;
use crate::utils;

pub const TAR_SCHEMA_VERSION: &str = "1.0";

/// Program-level references carried on every TAR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramRefs {
    pub program_id: String,
    pub award_id: String,
    pub mandate_id: String,
    /// Escalation target when the refusal loop exhausts.
    pub supervisor_id: String,
    pub owner_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TarReferences {
    pub program_id: String,
    pub task_id: String,
    pub award_id: String,
    pub mandate_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TarRequester {
    pub supervisor_id: String,
    pub owner_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TarInput {
    pub name: String,
    #[serde(rename = "type")]
    pub input_type: String,
    #[serde(rename = "ref")]
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TarDeliverable {
    pub id: String,
    pub title: String,
    pub acceptance_criteria: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timebox {
    pub hours: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TarTask {
    pub title: String,
    pub summary: String,
    pub constraints: Vec<String>,
    pub inputs: Vec<TarInput>,
    pub deliverables: Vec<TarDeliverable>,
    pub success_definition: String,
    pub timebox: Timebox,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TarTargeting {
    pub tool_class: ToolClass,
    pub eligible_tools: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRequirements {
    pub must_respond: bool,
    pub response_deadline_iso: String,
    pub allowed_responses: Vec<String>,
}

/// The activation document sent to a tool. Carries an absolute response
/// deadline; exceeding it is a TIMEOUT and sends the task back through the
/// refusal loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tar {
    pub schema_version: String,
    pub tar_id: String,
    pub created_at: String,
    pub references: TarReferences,
    pub requester: TarRequester,
    pub task: TarTask,
    pub targeting: TarTargeting,
    pub response_requirements: ResponseRequirements,
}

impl Tar {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("TAR serializes")
    }
}

/// Build a fresh TAR targeting `tool` for `task`.
pub fn build_tar(
    task: &TaskRecord,
    program: &ProgramRefs,
    tool: &Tool,
    response_hours: i64,
) -> Tar {
    let deliverables: Vec<TarDeliverable> = if task.deliverables.is_empty() {
        vec![TarDeliverable {
            id: "deliv-1".to_string(),
            title: task.title.clone(),
            acceptance_criteria: vec!["Meet requirements".to_string()],
        }]
    } else {
        task.deliverables
            .iter()
            .enumerate()
            .map(|(i, criterion)| TarDeliverable {
                id: format!("deliv-{}", i + 1),
                title: criterion.clone(),
                acceptance_criteria: vec![criterion.clone()],
            })
            .collect()
    };

    Tar {
        schema_version: TAR_SCHEMA_VERSION.to_string(),
        tar_id: format!("tar-{}", utils::new_uuid()),
        created_at: utils::utc_now(),
        references: TarReferences {
            program_id: program.program_id.clone(),
            task_id: task.task_id.clone(),
            award_id: program.award_id.clone(),
            mandate_id: program.mandate_id.clone(),
        },
        requester: TarRequester {
            supervisor_id: program.supervisor_id.clone(),
            owner_id: program.owner_id.clone(),
        },
        task: TarTask {
            title: task.title.clone(),
            summary: task.summary.clone(),
            constraints: Vec::new(),
            inputs: vec![TarInput {
                name: "handoff".to_string(),
                input_type: "json".to_string(),
                reference: format!("artifact:handoff-{}", program.award_id),
            }],
            deliverables,
            success_definition: format!("Task '{}' completed successfully.", task.title),
            timebox: Timebox {
                hours: response_hours,
            },
        },
        targeting: TarTargeting {
            tool_class: tool.tool_class,
            eligible_tools: vec![tool.tool_id.clone()],
        },
        response_requirements: ResponseRequirements {
            must_respond: true,
            response_deadline_iso: utils::utc_deadline(response_hours),
            allowed_responses: vec![
                "ACCEPT".to_string(),
                "DECLINE".to_string(),
                "CLARIFY".to_string(),
            ],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::registry::ToolStatus;
    use crate::router::task::ReroutePolicy;

    fn fixtures() -> (TaskRecord, ProgramRefs, Tool) {
        let task = TaskRecord::new(
            "Draft the charter",
            "Draft the founding charter document",
            ToolClass::HumanCluster,
            vec!["doc_drafting".into()],
            vec!["Charter delivered".into()],
            ReroutePolicy::default(),
        )
        .unwrap();
        let program = ProgramRefs {
            program_id: "prog-1".into(),
            award_id: "award-1".into(),
            mandate_id: "mandate-1".into(),
            supervisor_id: "supervisor_1".into(),
            owner_id: "owner_1".into(),
        };
        let tool = Tool {
            tool_id: "tool-a".into(),
            tool_class: ToolClass::HumanCluster,
            status: ToolStatus::Available,
            capabilities: vec!["doc_drafting".into()],
        };
        (task, program, tool)
    }

    #[test]
    fn tar_carries_the_wire_shape() {
        let (task, program, tool) = fixtures();
        let tar = build_tar(&task, &program, &tool, 8);
        assert_eq!(tar.schema_version, "1.0");
        assert!(tar.tar_id.starts_with("tar-"));
        assert_eq!(tar.targeting.eligible_tools, vec!["tool-a"]);
        assert_eq!(
            tar.response_requirements.allowed_responses,
            vec!["ACCEPT", "DECLINE", "CLARIFY"]
        );
        assert!(tar.response_requirements.must_respond);

        let value = tar.to_value();
        assert_eq!(value["targeting"]["tool_class"], "HUMAN_CLUSTER");
        assert_eq!(value["references"]["task_id"], task.task_id);
        assert_eq!(value["task"]["inputs"][0]["ref"], "artifact:handoff-award-1");
    }

    #[test]
    fn json_round_trip() {
        let (task, program, tool) = fixtures();
        let tar = build_tar(&task, &program, &tool, 8);
        let text = serde_json::to_string(&tar).unwrap();
        let back: Tar = serde_json::from_str(&text).unwrap();
        assert_eq!(tar, back);
    }
}
