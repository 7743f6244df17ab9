//! 会话监管：运行生命周期与中断
//!
//! 每个 Goal 对应一次运行，持有独立的 CancellationToken；开始新 Goal 时自动取消上一次运行。
//! 所有运行 token 都是会话根 token 的子 token，整体关闭时一并取消。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

/// 一次运行的句柄
#[derive(Debug, Clone)]
pub struct RunTicket {
    /// 单调递增的运行序号
    pub run_id: u64,
    pub token: CancellationToken,
}

/// 会话级生命周期管理
#[derive(Debug)]
pub struct SessionSupervisor {
    root: CancellationToken,
    current: Mutex<Option<RunTicket>>,
    next_run: AtomicU64,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::with_root(CancellationToken::new())
    }

    /// 挂在外部 token（如 ShutdownManager）之下
    pub fn with_root(root: CancellationToken) -> Self {
        Self {
            root,
            current: Mutex::new(None),
            next_run: AtomicU64::new(1),
        }
    }

    /// 开始新运行：取消上一次运行并返回新 token
    pub fn begin_run(&self) -> RunTicket {
        let ticket = RunTicket {
            run_id: self.next_run.fetch_add(1, Ordering::SeqCst),
            token: self.root.child_token(),
        };
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(prev) = current.replace(ticket.clone()) {
            tracing::info!(run_id = prev.run_id, "superseding previous run");
            prev.token.cancel();
        }
        ticket
    }

    /// 用户中止当前运行
    pub fn cancel_current(&self) {
        let current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(t) = current.as_ref() {
            t.token.cancel();
        }
    }

    /// 运行自然结束后清理（只有仍是当前运行时才清空）
    pub fn finish_run(&self, run_id: u64) {
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        if current.as_ref().map(|t| t.run_id) == Some(run_id) {
            *current = None;
        }
    }

    pub fn current_run(&self) -> Option<u64> {
        let current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        current.as_ref().map(|t| t.run_id)
    }

    /// 取消整个会话
    pub fn cancel_all(&self) {
        self.root.cancel();
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_run_cancels_previous() {
        let sup = SessionSupervisor::new();
        let first = sup.begin_run();
        let second = sup.begin_run();
        assert!(first.token.is_cancelled());
        assert!(!second.token.is_cancelled());
        assert_eq!(sup.current_run(), Some(second.run_id));
    }

    #[test]
    fn test_finish_only_clears_current() {
        let sup = SessionSupervisor::new();
        let first = sup.begin_run();
        let second = sup.begin_run();
        sup.finish_run(first.run_id);
        assert_eq!(sup.current_run(), Some(second.run_id));
        sup.finish_run(second.run_id);
        assert_eq!(sup.current_run(), None);
    }

    #[test]
    fn test_root_cancel_propagates() {
        let root = CancellationToken::new();
        let sup = SessionSupervisor::with_root(root.clone());
        let run = sup.begin_run();
        root.cancel();
        assert!(run.token.is_cancelled());
    }
}
