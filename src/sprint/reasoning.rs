//! 推理服务：plan(goal, notes, snapshot) 与 verify(goal, condition, snapshot)
//!
//! LlmReasoner 把 Goal、GroundingNotes 与快照文本拼成提示词，要求模型只输出 JSON。
//! LLM 调用失败（重试已在客户端内完成）或输出不可解析都映射为 PlanningFailure。

use std::sync::Arc;

use async_trait::async_trait;

use super::goal::{Goal, GroundingNotes};
use super::plan::{parse_plan, parse_verdict, SprintPlan, Verdict};
use crate::core::AgentError;
use crate::llm::{LlmClient, Message};
use crate::perception::PerceptionSnapshot;

#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn plan(
        &self,
        goal: &Goal,
        notes: &GroundingNotes,
        snapshot: &PerceptionSnapshot,
    ) -> Result<SprintPlan, AgentError>;

    async fn verify(
        &self,
        goal: &Goal,
        condition: &str,
        snapshot: &PerceptionSnapshot,
    ) -> Result<Verdict, AgentError>;
}

const PLANNER_PROMPT: &str = r#"You operate a desktop computer for the user by planning short sprints of actions.

Each turn you receive the goal, the grounding notes learned so far, and the visible screen as a list of elements
formatted as `id:label<type>`. Reference elements by numeric id or exact label.

Reply with a single JSON object and nothing else:
{
  "thought": "one or two sentences",
  "milestone": "short name of what this sprint achieves",
  "actions": [ ... ],
  "success_condition": "observable condition that proves the milestone",
  "final_milestone": true,
  "status": "continue",
  "notes": ["new durable facts about this environment"]
}

Actions:
  {"action": "click", "target": 12}
  {"action": "type", "text": "hello", "target": "Search"}   (target optional)
  {"action": "scroll", "direction": "down", "amount": 3}
  {"action": "launch", "app": "calculator"}
  {"action": "shell_command", "cmd": "dir"}
  {"action": "write_file", "path": "notes.txt", "content": "..."}
  {"action": "read_file", "path": "notes.txt"}   (contents come back as a note)
  {"action": "hotkey", "keys": ["ctrl", "s"]}
  {"action": "wait", "seconds": 2}
  {"action": "close_window"}
  {"action": "focus_window", "title": "Notepad"}

Set "final_milestone" to false when the success condition is an intermediate step.
Set "status" to "failed" only when the goal is impossible."#;

const VERIFIER_PROMPT: &str = r#"You check whether a condition holds on the current screen.
The screen is given as a list of elements formatted as `id:label<type>`.
Reply with a single JSON object and nothing else:
{"satisfied": true or false, "rationale": "what on screen supports the answer"}"#;

fn screen_section(snapshot: &PerceptionSnapshot) -> String {
    let window = snapshot
        .active_window
        .as_ref()
        .map(|w| w.title.as_str())
        .unwrap_or("(none)");
    format!(
        "## Screen\nActive window: {}\nElements: {}\n",
        window,
        snapshot.to_prompt_text()
    )
}

pub struct LlmReasoner {
    llm: Arc<dyn LlmClient>,
}

impl LlmReasoner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    async fn ask(&self, system: &str, user: String) -> Result<String, AgentError> {
        let messages = [Message::system(system), Message::user(user)];
        self.llm
            .complete(&messages)
            .await
            .map_err(AgentError::PlanningFailure)
    }
}

#[async_trait]
impl ReasoningService for LlmReasoner {
    async fn plan(
        &self,
        goal: &Goal,
        notes: &GroundingNotes,
        snapshot: &PerceptionSnapshot,
    ) -> Result<SprintPlan, AgentError> {
        let prompt = format!(
            "{}{}{}",
            goal.to_prompt_section(),
            notes.to_prompt_section(),
            screen_section(snapshot)
        );
        let output = self.ask(PLANNER_PROMPT, prompt).await?;
        let plan = parse_plan(&output, notes.len())
            .map_err(|e| AgentError::PlanningFailure(e.to_string()))?;
        tracing::debug!(plan_id = %plan.id, actions = plan.actions.len(), "plan parsed");
        Ok(plan)
    }

    async fn verify(
        &self,
        goal: &Goal,
        condition: &str,
        snapshot: &PerceptionSnapshot,
    ) -> Result<Verdict, AgentError> {
        let prompt = format!(
            "{}## Condition\n{}\n\n{}",
            goal.to_prompt_section(),
            condition,
            screen_section(snapshot)
        );
        let output = self.ask(VERIFIER_PROMPT, prompt).await?;
        parse_verdict(&output).map_err(|e| AgentError::PlanningFailure(e.to_string()))
    }
}
