//! SprintPlan、Verdict 与推理输出解析
//!
//! 推理服务返回 JSON（可能包在 ```json 代码块里，或夹杂说明文字）。解析前先清理常见的非法写法：
//! `//` 注释、`"a" + "b"` 字符串拼接、尾随逗号。

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::AgentError;
use crate::dispatch::{Action, ActionResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerStatus {
    #[default]
    Continue,
    Completed,
    Failed,
}

fn default_final() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    thought: String,
    #[serde(default)]
    milestone: String,
    #[serde(default, alias = "condition")]
    success_condition: String,
    #[serde(default = "default_final")]
    final_milestone: bool,
    #[serde(default)]
    status: PlannerStatus,
    #[serde(default, alias = "plan")]
    actions: Vec<Action>,
    #[serde(default)]
    notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SprintPlan {
    pub id: Uuid,
    pub thought: String,
    pub milestone: String,
    pub actions: Vec<Action>,
    pub success_condition: String,
    /// 成功条件是否就是 Goal 的最终条件
    pub final_milestone: bool,
    pub status: PlannerStatus,
    /// 创建时 GroundingNotes 的条数
    pub notes_at_creation: usize,
    /// 规划器本轮提供的新事实（由状态机追加到 GroundingNotes）
    pub new_notes: Vec<String>,
}

impl SprintPlan {
    /// 有动作且状态不是 Failed 才能执行；Completed 不代表可以跳过执行
    pub fn is_actionable(&self) -> bool {
        !self.actions.is_empty() && self.status != PlannerStatus::Failed
    }

    /// 不可执行时的原因
    pub fn defect(&self) -> Option<String> {
        if self.status == PlannerStatus::Failed {
            Some(if self.thought.is_empty() {
                "planner reported failure".to_string()
            } else {
                format!("planner reported failure: {}", self.thought)
            })
        } else if self.actions.is_empty() {
            Some("empty action list".to_string())
        } else {
            None
        }
    }
}

/// 验证结论
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub satisfied: bool,
    #[serde(default, alias = "reason")]
    pub rationale: String,
}

impl Verdict {
    pub fn unsatisfied(rationale: impl Into<String>) -> Self {
        Self {
            satisfied: false,
            rationale: rationale.into(),
        }
    }
}

/// 执行过的一个动作；plan_id 用于丢弃不属于当前计划的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutedAction {
    pub plan_id: Uuid,
    pub index: usize,
    pub action: Action,
    pub attempts: u32,
    pub result: ActionResult,
}

/// 已结束的冲刺（只读存档）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedSprint {
    pub number: u32,
    pub plan: SprintPlan,
    pub executed: Vec<ExecutedAction>,
    pub abandoned: Option<String>,
    pub verdict: Verdict,
}

/// 从 LLM 输出中截取 JSON 部分：```json 代码块、普通代码块，或最外层的 {}
pub fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        if let Some(end) = rest.find("```") {
            let block = rest[..end].trim();
            if block.starts_with('{') {
                return Some(block);
            }
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// 去掉字符串外的 `//` 注释，并把 `"a" + "b"` 合并为 `"ab"`
fn strip_comments_and_concat(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut in_str = false;
    let mut escaped = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if in_str {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_str = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_str = true;
                out.push(c);
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '+' if out.trim_end().ends_with('"') => {
                let mut j = i + 1;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if chars.get(j) == Some(&'"') {
                    // 去掉左串的收尾引号，跳过右串的起始引号，继续在串内
                    let keep = out.trim_end().len() - 1;
                    out.truncate(keep);
                    in_str = true;
                    i = j + 1;
                    continue;
                }
                out.push(c);
            }
            _ => out.push(c),
        }
        i += 1;
    }
    out
}

/// 去掉字符串外、紧跟 `}` 或 `]` 的逗号
fn strip_trailing_commas(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut in_str = false;
    let mut escaped = false;
    for (i, &c) in chars.iter().enumerate() {
        if in_str {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_str = false;
            }
        } else if c == '"' {
            in_str = true;
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// 清理 LLM 常见的非法 JSON 写法
pub fn clean_json(raw: &str) -> String {
    strip_trailing_commas(&strip_comments_and_concat(raw))
}

pub fn parse_plan(output: &str, notes_at_creation: usize) -> Result<SprintPlan, AgentError> {
    let json = extract_json(output)
        .ok_or_else(|| AgentError::JsonParseError(format!("no JSON object in planner output: {}", output.trim())))?;
    let cleaned = clean_json(json);
    let raw: RawPlan = serde_json::from_str(&cleaned)
        .map_err(|e| AgentError::JsonParseError(format!("{}: {}", e, cleaned)))?;
    Ok(SprintPlan {
        id: Uuid::new_v4(),
        thought: raw.thought,
        milestone: raw.milestone,
        actions: raw.actions,
        success_condition: raw.success_condition,
        final_milestone: raw.final_milestone,
        status: raw.status,
        notes_at_creation,
        new_notes: raw.notes,
    })
}

pub fn parse_verdict(output: &str) -> Result<Verdict, AgentError> {
    let json = extract_json(output)
        .ok_or_else(|| AgentError::JsonParseError(format!("no JSON object in verifier output: {}", output.trim())))?;
    let cleaned = clean_json(json);
    serde_json::from_str(&cleaned).map_err(|e| AgentError::JsonParseError(format!("{}: {}", e, cleaned)))
}
