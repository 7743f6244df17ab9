//! 冲刺状态机
//!
//! Idle → Planning → Executing → Verifying → (Idle | Planning)，终态 Done / Aborted。
//!
//! - Planning：总是先取新快照，再请推理服务给出计划；新计划整体替换旧计划，规划器给出的笔记追加到 GroundingNotes。
//!   空计划、无法解析或状态为 failed 都记一条「planner produced no actionable plan」并计为无进展。
//! - 感知请求超时同样按恢复策略重发一次，再超时才交给调用方。
//! - Executing：严格按顺序执行。Timeout 立即重试一次；ElementNotFound 重新感知后重试一次；其余失败或重试再失败
//!   则放弃本冲刺进入 Verifying。每个动作之后快照标记为过期，下一个带目标的动作先刷新快照。ChannelFault 直接终止运行。
//! - Verifying：新快照 + 推理服务给出结论。满足且为最终里程碑 → Done；满足但非最终 → 清零无进展计数回到 Idle；
//!   不满足 → 追加恰好一条笔记（差异 + 放弃原因）并回到 Planning。验证快照超时视为不满足。
//!
//! 取消：运行 token 被取消后，正在执行的动作允许完成但结果被丢弃；结果带 plan_id，只记入当前计划。

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::events::{EventBus, SprintEvent};
use super::goal::{Goal, GroundingNotes};
use super::plan::{ArchivedSprint, ExecutedAction, SprintPlan, Verdict};
use super::reasoning::ReasoningService;
use crate::channel::PerceiveRequest;
use crate::config::SprintSection;
use crate::core::{AgentError, AgentStatus, ErrorKind, RecoveryAction, RecoveryEngine, SprintPhase};
use crate::dispatch::{Action, ActionResult};
use crate::host::ExecutionHost;
use crate::perception::PerceptionSnapshot;

const NO_ACTIONABLE_PLAN: &str = "planner produced no actionable plan";
/// read_file 结果写入笔记的最大字符数
const READ_NOTE_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy)]
pub struct SprintLimits {
    pub max_no_progress: u32,
    pub max_sprints: u32,
}

impl Default for SprintLimits {
    fn default() -> Self {
        Self::from(&SprintSection::default())
    }
}

impl From<&SprintSection> for SprintLimits {
    fn from(s: &SprintSection) -> Self {
        Self {
            max_no_progress: s.max_no_progress.max(1),
            max_sprints: s.max_sprints.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Done,
    Aborted { reason: String },
    Cancelled,
    /// 通道故障等致命错误
    Fault { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub goal: Goal,
    pub outcome: RunOutcome,
    pub notes: GroundingNotes,
    pub history: Vec<ArchivedSprint>,
    pub sprints: u32,
}

/// 让状态机停下来的原因（不是状态转换）
#[derive(Debug)]
pub enum Halt {
    Cancelled,
    Fault(AgentError),
}

enum ActionOutcome {
    Completed,
    Abandoned(String),
}

pub struct SprintMachine {
    host: Arc<dyn ExecutionHost>,
    reasoner: Arc<dyn ReasoningService>,
    recovery: RecoveryEngine,
    limits: SprintLimits,
    events: EventBus,
    status: Option<Arc<watch::Sender<AgentStatus>>>,
    perceive_request: PerceiveRequest,

    goal: Goal,
    notes: GroundingNotes,
    phase: SprintPhase,
    sprint: u32,
    no_progress: u32,
    abort_reason: Option<String>,
    plan: Option<SprintPlan>,
    snapshot: Option<PerceptionSnapshot>,
    stale: bool,
    executed: Vec<ExecutedAction>,
    abandoned: Option<String>,
    history: Vec<ArchivedSprint>,
}

impl SprintMachine {
    pub fn new(goal: Goal, host: Arc<dyn ExecutionHost>, reasoner: Arc<dyn ReasoningService>) -> Self {
        Self {
            host,
            reasoner,
            recovery: RecoveryEngine::new(),
            limits: SprintLimits::default(),
            events: EventBus::default(),
            status: None,
            perceive_request: PerceiveRequest::default(),
            goal,
            notes: GroundingNotes::new(),
            phase: SprintPhase::Idle,
            sprint: 0,
            no_progress: 0,
            abort_reason: None,
            plan: None,
            snapshot: None,
            stale: true,
            executed: Vec::new(),
            abandoned: None,
            history: Vec::new(),
        }
    }

    pub fn with_limits(mut self, limits: SprintLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_status(mut self, status: Arc<watch::Sender<AgentStatus>>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryEngine) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_perceive_request(mut self, request: PerceiveRequest) -> Self {
        self.perceive_request = request;
        self
    }

    pub fn phase(&self) -> SprintPhase {
        self.phase
    }

    pub fn notes(&self) -> &GroundingNotes {
        &self.notes
    }

    pub fn no_progress(&self) -> u32 {
        self.no_progress
    }

    pub fn sprint(&self) -> u32 {
        self.sprint
    }

    pub fn current_plan(&self) -> Option<&SprintPlan> {
        self.plan.as_ref()
    }

    pub fn history(&self) -> &[ArchivedSprint] {
        &self.history
    }

    /// 跑到终态、取消或致命错误为止
    pub async fn run(mut self, cancel: CancellationToken) -> RunReport {
        tracing::info!(goal = %self.goal.objective, "run started");
        self.publish_status(None);

        let outcome = loop {
            if cancel.is_cancelled() {
                break RunOutcome::Cancelled;
            }
            if let Err(halt) = self.step(&cancel).await {
                break match halt {
                    Halt::Cancelled => RunOutcome::Cancelled,
                    Halt::Fault(e) => RunOutcome::Fault {
                        message: e.to_string(),
                    },
                };
            }
            match self.phase {
                SprintPhase::Done => break RunOutcome::Done,
                SprintPhase::Aborted => {
                    break RunOutcome::Aborted {
                        reason: self.abort_reason.clone().unwrap_or_default(),
                    }
                }
                _ => {}
            }
        };

        match &outcome {
            RunOutcome::Done => tracing::info!(sprints = self.sprint, "goal reached"),
            RunOutcome::Cancelled => tracing::info!("run cancelled"),
            RunOutcome::Aborted { reason } => tracing::warn!(%reason, "run aborted"),
            RunOutcome::Fault { message } => tracing::error!(%message, "run failed"),
        }
        let error = match &outcome {
            RunOutcome::Fault { message } => Some(message.clone()),
            RunOutcome::Aborted { reason } => Some(reason.clone()),
            _ => None,
        };
        // 取消时由发起方更新状态，避免覆盖接替它的运行
        if outcome != RunOutcome::Cancelled {
            if let Some(tx) = &self.status {
                tx.send_replace(self.status_view(false, error));
            }
        }
        self.events.publish(SprintEvent::Finished {
            outcome: outcome.clone(),
        });

        RunReport {
            goal: self.goal,
            outcome,
            notes: self.notes,
            history: self.history,
            sprints: self.sprint,
        }
    }

    /// 执行一次状态转换
    pub async fn step(&mut self, cancel: &CancellationToken) -> Result<(), Halt> {
        match self.phase {
            SprintPhase::Idle => {
                self.set_phase(SprintPhase::Planning);
                Ok(())
            }
            SprintPhase::Planning => self.plan_sprint(cancel).await,
            SprintPhase::Executing => self.execute_plan(cancel).await,
            SprintPhase::Verifying => self.verify_sprint(cancel).await,
            SprintPhase::Done | SprintPhase::Aborted => Ok(()),
        }
    }

    async fn plan_sprint(&mut self, cancel: &CancellationToken) -> Result<(), Halt> {
        if self.sprint >= self.limits.max_sprints {
            self.abort(format!("sprint limit of {} reached", self.limits.max_sprints));
            return Ok(());
        }
        self.sprint += 1;
        self.plan = None;
        self.executed.clear();
        self.abandoned = None;
        self.publish_status(None);

        let snapshot = match self.perceive(cancel).await? {
            Ok(s) => s,
            Err(e) => {
                self.append_note(format!("could not observe the screen before planning: {}", e));
                self.count_no_progress();
                return Ok(());
            }
        };

        let planned = self.reasoner.plan(&self.goal, &self.notes, &snapshot).await;
        if cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        let plan = match planned {
            Ok(p) => p,
            Err(e) if e.is_fatal() => return Err(Halt::Fault(e)),
            Err(e) => {
                tracing::warn!(error = %e, "planning failed");
                self.no_actionable_plan(&e.to_string());
                return Ok(());
            }
        };

        for note in &plan.new_notes {
            self.append_note(note.clone());
        }
        if let Some(defect) = plan.defect() {
            self.no_actionable_plan(&defect);
            return Ok(());
        }

        tracing::info!(
            plan_id = %plan.id,
            sprint = self.sprint,
            milestone = %plan.milestone,
            actions = plan.actions.len(),
            "plan accepted"
        );
        self.events.publish(SprintEvent::PlanAccepted {
            plan_id: plan.id,
            sprint: self.sprint,
            milestone: plan.milestone.clone(),
            thought: plan.thought.clone(),
            success_condition: plan.success_condition.clone(),
            actions: plan.actions.iter().map(Action::describe).collect(),
        });
        self.plan = Some(plan);
        self.set_phase(SprintPhase::Executing);
        Ok(())
    }

    async fn execute_plan(&mut self, cancel: &CancellationToken) -> Result<(), Halt> {
        let Some(plan) = self.plan.clone() else {
            self.set_phase(SprintPhase::Planning);
            return Ok(());
        };

        for (index, action) in plan.actions.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Halt::Cancelled);
            }
            if let ActionOutcome::Abandoned(reason) =
                self.run_action(&plan, index, action, cancel).await?
            {
                tracing::warn!(sprint = self.sprint, %reason, "sprint abandoned");
                self.abandoned = Some(reason);
                break;
            }
        }

        self.set_phase(SprintPhase::Verifying);
        Ok(())
    }

    async fn run_action(
        &mut self,
        plan: &SprintPlan,
        index: usize,
        action: &Action,
        cancel: &CancellationToken,
    ) -> Result<ActionOutcome, Halt> {
        if action.target().is_some() && self.stale {
            if let Err(e) = self.perceive(cancel).await? {
                return Ok(ActionOutcome::Abandoned(format!(
                    "could not refresh the screen before {}: {}",
                    action.describe(),
                    e
                )));
            }
        }

        self.events.publish(SprintEvent::ActionStarted {
            plan_id: plan.id,
            index,
            action: action.describe(),
        });

        let mut failures = 0u32;
        loop {
            let Some(snapshot) = self.snapshot.clone() else {
                return Ok(ActionOutcome::Abandoned("no snapshot to act on".to_string()));
            };
            let outcome = self.host.execute(action, &snapshot).await;
            self.stale = true;
            if cancel.is_cancelled() {
                tracing::info!(plan_id = %plan.id, index, "discarding result of cancelled action");
                return Err(Halt::Cancelled);
            }

            let result = match outcome {
                Ok(r) => r,
                Err(e) if e.is_fatal() => return Err(Halt::Fault(e)),
                Err(e) => ActionResult::channel_failure(e.kind(), e.to_string()),
            };
            self.record(ExecutedAction {
                plan_id: plan.id,
                index,
                action: action.clone(),
                attempts: failures + 1,
                result: result.clone(),
            });
            if result.success {
                if let Action::ReadFile { path } = action {
                    let excerpt: String = result.message.chars().take(READ_NOTE_CHARS).collect();
                    self.append_note(format!("contents of {}: {}", path, excerpt));
                }
                return Ok(ActionOutcome::Completed);
            }

            failures += 1;
            let kind = result.error_kind.unwrap_or(ErrorKind::OsOperationFailed);
            match self.recovery.handle(kind, failures) {
                RecoveryAction::RetrySame => {
                    tracing::info!(action = %action.describe(), %kind, "retrying action");
                }
                RecoveryAction::Reperceive => {
                    tracing::info!(action = %action.describe(), "target stale, re-perceiving");
                    if let Err(e) = self.perceive(cancel).await? {
                        return Ok(ActionOutcome::Abandoned(format!(
                            "{} failed with {} and the screen could not be refreshed: {}",
                            action.describe(),
                            kind,
                            e
                        )));
                    }
                }
                RecoveryAction::Escalate => {
                    return Err(Halt::Fault(AgentError::from_kind(kind, result.message)));
                }
                RecoveryAction::AbandonSprint | RecoveryAction::Replan => {
                    let retried = if failures > 1 { " after retry" } else { "" };
                    return Ok(ActionOutcome::Abandoned(format!(
                        "{} failed{} with {}: {}",
                        action.describe(),
                        retried,
                        kind,
                        result.message
                    )));
                }
            }
        }
    }

    async fn verify_sprint(&mut self, cancel: &CancellationToken) -> Result<(), Halt> {
        let Some(plan) = self.plan.take() else {
            self.set_phase(SprintPhase::Planning);
            return Ok(());
        };

        let verdict = match self.perceive(cancel).await? {
            Ok(snapshot) => {
                let judged = self
                    .reasoner
                    .verify(&self.goal, &plan.success_condition, &snapshot)
                    .await;
                if cancel.is_cancelled() {
                    return Err(Halt::Cancelled);
                }
                match judged {
                    Ok(v) => v,
                    Err(e) if e.is_fatal() => return Err(Halt::Fault(e)),
                    Err(e) => Verdict::unsatisfied(format!("verifier unavailable: {}", e)),
                }
            }
            Err(e) => Verdict::unsatisfied(format!("verification snapshot unavailable: {}", e)),
        };

        tracing::info!(
            sprint = self.sprint,
            satisfied = verdict.satisfied,
            rationale = %verdict.rationale,
            "verified"
        );
        self.events.publish(SprintEvent::Verdict {
            sprint: self.sprint,
            satisfied: verdict.satisfied,
            rationale: verdict.rationale.clone(),
        });

        let abandoned = self.abandoned.take();
        let final_milestone = plan.final_milestone;
        let milestone = if plan.milestone.is_empty() {
            plan.success_condition.clone()
        } else {
            plan.milestone.clone()
        };
        let condition = plan.success_condition.clone();
        self.history.push(ArchivedSprint {
            number: self.sprint,
            plan,
            executed: std::mem::take(&mut self.executed),
            abandoned: abandoned.clone(),
            verdict: verdict.clone(),
        });

        if verdict.satisfied {
            if final_milestone {
                self.set_phase(SprintPhase::Done);
            } else {
                self.no_progress = 0;
                self.set_phase(SprintPhase::Idle);
            }
            return Ok(());
        }

        let mut note = format!(
            "sprint {} ({}): condition {:?} not met: {}",
            self.sprint, milestone, condition, verdict.rationale
        );
        if let Some(reason) = abandoned {
            note.push_str(&format!("; sprint abandoned: {}", reason));
        }
        self.append_note(note);
        self.count_no_progress();
        Ok(())
    }

    /// 请求新快照；超时按恢复策略重发，其余非致命错误交给调用方处理
    async fn perceive(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Result<PerceptionSnapshot, AgentError>, Halt> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self.host.perceive(self.perceive_request.clone()).await;
            if cancel.is_cancelled() {
                return Err(Halt::Cancelled);
            }
            match result {
                Ok(snapshot) => {
                    self.events.publish(SprintEvent::screen(&snapshot));
                    self.snapshot = Some(snapshot.clone());
                    self.stale = false;
                    return Ok(Ok(snapshot));
                }
                Err(e) if e.is_fatal() => return Err(Halt::Fault(e)),
                Err(e)
                    if e.kind() == ErrorKind::Timeout
                        && self.recovery.handle(ErrorKind::Timeout, attempt)
                            == RecoveryAction::RetrySame =>
                {
                    tracing::info!(attempt, error = %e, "perception timed out, retrying");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "perception failed");
                    return Ok(Err(e));
                }
            }
        }
    }

    /// 只记录属于当前计划的结果
    fn record(&mut self, executed: ExecutedAction) {
        if self.plan.as_ref().map(|p| p.id) != Some(executed.plan_id) {
            tracing::debug!(plan_id = %executed.plan_id, "dropping result of superseded plan");
            return;
        }
        self.events.publish(SprintEvent::ActionFinished {
            plan_id: executed.plan_id,
            index: executed.index,
            attempt: executed.attempts,
            result: executed.result.clone(),
        });
        self.executed.push(executed);
    }

    fn no_actionable_plan(&mut self, detail: &str) {
        self.append_note(format!("{}: {}", NO_ACTIONABLE_PLAN, detail));
        self.count_no_progress();
    }

    fn count_no_progress(&mut self) {
        self.no_progress += 1;
        tracing::info!(
            no_progress = self.no_progress,
            max = self.limits.max_no_progress,
            "no progress this sprint"
        );
        if self.no_progress >= self.limits.max_no_progress {
            self.abort(format!(
                "no progress in {} consecutive sprints",
                self.no_progress
            ));
        } else {
            self.set_phase(SprintPhase::Planning);
        }
    }

    fn abort(&mut self, reason: String) {
        self.abort_reason = Some(reason);
        self.set_phase(SprintPhase::Aborted);
    }

    fn append_note(&mut self, text: String) {
        if self.notes.append(self.sprint, text.clone()) {
            self.events.publish(SprintEvent::NoteAppended {
                sprint: self.sprint,
                text,
            });
        }
    }

    fn set_phase(&mut self, phase: SprintPhase) {
        if self.phase == phase {
            return;
        }
        tracing::debug!(from = %self.phase, to = %phase, sprint = self.sprint, "phase");
        self.phase = phase;
        self.events.publish(SprintEvent::PhaseChanged {
            phase,
            sprint: self.sprint,
        });
        self.publish_status(None);
    }

    fn publish_status(&self, error_message: Option<String>) {
        if let Some(tx) = &self.status {
            tx.send_replace(self.status_view(!self.phase.is_terminal(), error_message));
        }
    }

    fn status_view(&self, busy: bool, error_message: Option<String>) -> AgentStatus {
        AgentStatus {
            phase: self.phase,
            goal: Some(self.goal.objective.clone()),
            sprint: self.sprint,
            no_progress: self.no_progress,
            notes: self.notes.len(),
            busy,
            error_message,
        }
    }
}
