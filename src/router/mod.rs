//! Task routing: tool eligibility, activation, refusal handling and
//! escalation.

pub mod registry;
pub mod router;
pub mod tar;
pub mod task;

pub use registry::{RegistryHandle, Tool, ToolClass, ToolRegistry, ToolStatus};
pub use router::{ExhaustionReason, RerouteOutcome, RouterError, TaskRouter, ToolResponse};
pub use tar::{ProgramRefs, Tar, build_tar};
pub use task::{AttemptRecord, ReroutePolicy, TaskRecord, TaskResultRecord, TaskState};
