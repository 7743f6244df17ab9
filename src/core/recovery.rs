//! 错误恢复引擎
//!
//! 根据 ErrorKind 与当前动作已尝试次数返回 RecoveryAction，供执行阶段决定是重新感知、重试、放弃冲刺还是上报。

use crate::core::{ErrorKind, RecoveryAction};

/// 语义化错误恢复：本地恢复优先，仅 ChannelFault 上报
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    /// 同一动作允许的快速重试次数
    max_fast_retries: u32,
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryEngine {
    pub fn new() -> Self {
        Self { max_fast_retries: 1 }
    }

    pub fn with_max_fast_retries(mut self, n: u32) -> Self {
        self.max_fast_retries = n;
        self
    }

    /// attempt 为该动作已经失败的次数（首次失败为 1）
    pub fn handle(&self, kind: ErrorKind, attempt: u32) -> RecoveryAction {
        let can_retry = attempt <= self.max_fast_retries;
        match kind {
            ErrorKind::ChannelFault => RecoveryAction::Escalate,
            ErrorKind::ElementNotFound if can_retry => RecoveryAction::Reperceive,
            ErrorKind::Timeout if can_retry => RecoveryAction::RetrySame,
            ErrorKind::ElementNotFound | ErrorKind::Timeout => RecoveryAction::AbandonSprint,
            ErrorKind::OsOperationFailed => RecoveryAction::AbandonSprint,
            ErrorKind::PlanningFailure => RecoveryAction::Replan,
        }
    }
}
