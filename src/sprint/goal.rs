//! Goal 与 GroundingNotes
//!
//! GroundingNotes 是整次运行的只追加日志：规划端写入规划器给出的事实和验证失败的差异，从不回滚。

use serde::{Deserialize, Serialize};

/// 用户目标；运行期间不可变
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    pub objective: String,
    #[serde(default)]
    pub constraints: Vec<String>,
}

impl Goal {
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            objective: objective.into(),
            constraints: Vec::new(),
        }
    }

    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }

    pub fn to_prompt_section(&self) -> String {
        let mut s = format!("## Goal\n{}\n\n", self.objective);
        if !self.constraints.is_empty() {
            s.push_str("## Constraints\n");
            for c in &self.constraints {
                s.push_str(&format!("- {}\n", c));
            }
            s.push('\n');
        }
        s
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundingNote {
    /// 写入时的冲刺序号
    pub sprint: u32,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroundingNotes {
    entries: Vec<GroundingNote>,
}

impl GroundingNotes {
    pub fn new() -> Self {
        Self::default()
    }

    /// 唯一的修改入口；空白文本忽略，返回是否写入
    pub fn append(&mut self, sprint: u32, text: impl Into<String>) -> bool {
        let text = text.into();
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        self.entries.push(GroundingNote {
            sprint,
            text: text.to_string(),
        });
        true
    }

    pub fn entries(&self) -> &[GroundingNote] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 第 n 条之后追加的记录
    pub fn since(&self, n: usize) -> &[GroundingNote] {
        self.entries.get(n..).unwrap_or(&[])
    }

    pub fn to_prompt_section(&self) -> String {
        if self.entries.is_empty() {
            return String::new();
        }
        let mut s = String::from("## Grounding notes (facts learned so far)\n");
        for n in &self.entries {
            s.push_str(&format!("- [sprint {}] {}\n", n.sprint, n.text));
        }
        s.push('\n');
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_only_in_order() {
        let mut notes = GroundingNotes::new();
        assert!(notes.append(1, "calculator opens maximized"));
        assert!(!notes.append(1, "   "));
        notes.append(2, "the = key has id 14");
        assert_eq!(notes.len(), 2);
        assert_eq!(notes.entries()[1].sprint, 2);
        assert_eq!(notes.since(1).len(), 1);
        assert!(notes.since(5).is_empty());
    }

    #[test]
    fn test_prompt_section() {
        let mut notes = GroundingNotes::new();
        assert_eq!(notes.to_prompt_section(), "");
        notes.append(3, "dialog blocks input");
        assert!(notes.to_prompt_section().contains("- [sprint 3] dialog blocks input"));
        let goal = Goal::new("compute 2+2").with_constraint("no shell");
        let s = goal.to_prompt_section();
        assert!(s.contains("compute 2+2") && s.contains("- no shell"));
    }
}
