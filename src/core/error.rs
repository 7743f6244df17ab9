//! 错误类型与恢复动作
//!
//! ErrorKind 是线上（通道帧、ActionResult）使用的错误分类；AgentError 是进程内的 Result 错误。
//! 与 RecoveryEngine 配合：根据 ErrorKind 决定 Reperceive / RetrySame / AbandonSprint / Replan / Escalate。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 错误分类（可序列化，随 ActionResult 跨进程传递）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// 目标元素在快照中已不存在（过期引用）
    ElementNotFound,
    /// 底层输入 / 启动 / Shell 调用被拒绝
    #[serde(rename = "OSOperationFailed")]
    OsOperationFailed,
    /// 通道请求超过截止时间
    Timeout,
    /// 对端进程不可达或崩溃
    ChannelFault,
    /// 推理服务重试耗尽或输出不可用
    PlanningFailure,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::ElementNotFound => "ElementNotFound",
            ErrorKind::OsOperationFailed => "OSOperationFailed",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::ChannelFault => "ChannelFault",
            ErrorKind::PlanningFailure => "PlanningFailure",
        };
        f.write_str(s)
    }
}

/// 运行过程中可能出现的错误
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("OS operation failed: {0}")]
    OsOperationFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Channel fault: {0}")]
    ChannelFault(String),

    #[error("Planning failure: {0}")]
    PlanningFailure(String),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Cancelled")]
    Cancelled,
}

impl AgentError {
    /// 映射到线上错误分类；解析 / LLM 错误都归为 PlanningFailure
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::ElementNotFound(_) => ErrorKind::ElementNotFound,
            AgentError::OsOperationFailed(_) | AgentError::ConfigError(_) => {
                ErrorKind::OsOperationFailed
            }
            AgentError::Timeout(_) => ErrorKind::Timeout,
            AgentError::ChannelFault(_) | AgentError::Cancelled => ErrorKind::ChannelFault,
            AgentError::PlanningFailure(_)
            | AgentError::JsonParseError(_)
            | AgentError::LlmError(_) => ErrorKind::PlanningFailure,
        }
    }

    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::ElementNotFound => AgentError::ElementNotFound(message),
            ErrorKind::OsOperationFailed => AgentError::OsOperationFailed(message),
            ErrorKind::Timeout => AgentError::Timeout(message),
            ErrorKind::ChannelFault => AgentError::ChannelFault(message),
            ErrorKind::PlanningFailure => AgentError::PlanningFailure(message),
        }
    }

    /// 是否对整次运行致命
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::ChannelFault(_))
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 重新感知后再试同一动作
    Reperceive,
    /// 立即重试同一请求
    RetrySame,
    /// 放弃当前冲刺，进入验证
    AbandonSprint,
    /// 记入 GroundingNotes 后重新规划
    Replan,
    /// 致命，交给用户
    Escalate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            ErrorKind::ElementNotFound,
            ErrorKind::OsOperationFailed,
            ErrorKind::Timeout,
            ErrorKind::ChannelFault,
            ErrorKind::PlanningFailure,
        ] {
            assert_eq!(AgentError::from_kind(kind, "x").kind(), kind);
        }
    }

    #[test]
    fn test_wire_name() {
        let s = serde_json::to_string(&ErrorKind::OsOperationFailed).unwrap();
        assert_eq!(s, "\"OSOperationFailed\"");
        assert_eq!(ErrorKind::OsOperationFailed.to_string(), "OSOperationFailed");
    }

    #[test]
    fn test_parse_errors_are_planning_failures() {
        assert_eq!(
            AgentError::JsonParseError("bad".into()).kind(),
            ErrorKind::PlanningFailure
        );
        assert!(AgentError::ChannelFault("eof".into()).is_fatal());
        assert!(!AgentError::Timeout("perceive".into()).is_fatal());
    }
}
