//! 冲刺层：Goal / GroundingNotes、计划与结论、推理服务、状态机与过程事件

pub mod events;
pub mod goal;
pub mod machine;
pub mod plan;
pub mod reasoning;

pub use events::{EventBus, EventTopic, SprintEvent};
pub use goal::{Goal, GroundingNote, GroundingNotes};
pub use machine::{Halt, RunOutcome, RunReport, SprintLimits, SprintMachine};
pub use plan::{
    parse_plan, parse_verdict, ArchivedSprint, ExecutedAction, PlannerStatus, SprintPlan, Verdict,
};
pub use reasoning::{LlmReasoner, ReasoningService};
