//! 状态定义：SprintPhase 与对外投影的 AgentStatus
//!
//! 冲刺状态机内部维护完整状态；外部（CLI、仪表盘）只通过 watch 通道看到轻量的 AgentStatus。

use serde::{Deserialize, Serialize};

/// 冲刺状态机的阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SprintPhase {
    Idle,
    Planning,
    Executing,
    Verifying,
    /// 终态：目标条件成立
    Done,
    /// 终态：连续无进展或冲刺数耗尽
    Aborted,
}

impl SprintPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SprintPhase::Done | SprintPhase::Aborted)
    }
}

impl std::fmt::Display for SprintPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SprintPhase::Idle => "idle",
            SprintPhase::Planning => "planning",
            SprintPhase::Executing => "executing",
            SprintPhase::Verifying => "verifying",
            SprintPhase::Done => "done",
            SprintPhase::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// 外部看到的「投影」状态
#[derive(Clone, Debug, Serialize)]
pub struct AgentStatus {
    pub phase: SprintPhase,
    pub goal: Option<String>,
    /// 当前第几个冲刺（从 1 开始）
    pub sprint: u32,
    pub no_progress: u32,
    pub notes: usize,
    pub busy: bool,
    pub error_message: Option<String>,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self {
            phase: SprintPhase::Idle,
            goal: None,
            sprint: 0,
            no_progress: 0,
            notes: 0,
            busy: false,
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_phases() {
        assert!(SprintPhase::Done.is_terminal());
        assert!(SprintPhase::Aborted.is_terminal());
        assert!(!SprintPhase::Verifying.is_terminal());
        assert_eq!(
            serde_json::to_string(&SprintPhase::Planning).unwrap(),
            "\"planning\""
        );
    }
}
