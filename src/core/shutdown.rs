//! 进程级关闭
//!
//! 两个进程各持有一个 ShutdownManager：信号处理器、致命的通道故障都通过 `trigger` 关闭同一个根 token，
//! 服务循环、遥测任务与编排器都是它的子任务。只记录第一次的原因。

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupted,
    /// SIGTERM
    Terminated,
    /// 对端不可用或运行以致命错误结束
    Fault(String),
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Interrupted => f.write_str("interrupted"),
            ShutdownReason::Terminated => f.write_str("terminated"),
            ShutdownReason::Fault(msg) => write!(f, "fault: {}", msg),
        }
    }
}

#[derive(Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger(&self, reason: ShutdownReason) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|p| p.into_inner());
            if slot.is_some() {
                return;
            }
            tracing::info!(%reason, "shutting down");
            *slot = Some(reason);
        }
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// Ctrl+C 与（unix 上的）SIGTERM
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.trigger(ShutdownReason::Interrupted);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut term) = signal(SignalKind::terminate()) {
                    if term.recv().await.is_some() {
                        manager.trigger(ShutdownReason::Terminated);
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_cancels_children() {
        let manager = ShutdownManager::new();
        let run = manager.token().child_token();
        assert!(!manager.is_triggered());
        manager.trigger(ShutdownReason::Interrupted);
        assert!(run.is_cancelled());
        assert_eq!(manager.reason(), Some(ShutdownReason::Interrupted));
    }

    #[tokio::test]
    async fn test_first_reason_kept() {
        let manager = ShutdownManager::new();
        manager.trigger(ShutdownReason::Fault("host gone".into()));
        manager.trigger(ShutdownReason::Terminated);
        manager.wait().await;
        assert_eq!(
            manager.reason().map(|r| r.to_string()),
            Some("fault: host gone".to_string())
        );
    }
}
