//! 推理调用的指数退避重试

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::message::Message;
use super::traits::{LlmClient, TokenUsage};
use crate::config::LlmRetrySection;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&LlmRetrySection::default())
    }
}

impl From<&LlmRetrySection> for RetryPolicy {
    fn from(s: &LlmRetrySection) -> Self {
        Self {
            max_attempts: s.max_attempts.max(1),
            base_delay: Duration::from_millis(s.base_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// 第 attempt 次失败后的等待：base * 2^(attempt-1)，封顶 max_delay
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// 包装任意 LlmClient，失败时按策略重试；全部失败后返回最后一次的错误
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    policy: RetryPolicy,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let mut last_err = String::new();
        for attempt in 1..=self.policy.max_attempts {
            match self.inner.complete(messages).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    tracing::warn!(attempt, max = self.policy.max_attempts, error = %e, "llm call failed");
                    last_err = e;
                    if attempt < self.policy.max_attempts {
                        tokio::time::sleep(self.policy.delay_after(attempt)).await;
                    }
                }
            }
        }
        Err(format!(
            "gave up after {} attempts: {}",
            self.policy.max_attempts, last_err
        ))
    }

    fn usage(&self) -> TokenUsage {
        self.inner.usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_after(1), Duration::from_millis(500));
        assert_eq!(p.delay_after(2), Duration::from_millis(1000));
        assert_eq!(p.delay_after(10), Duration::from_millis(8000));
        assert_eq!(p.delay_after(64), Duration::from_millis(8000));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_error() {
        let inner = Arc::new(ScriptedLlmClient::default());
        inner.push_error("503");
        inner.push_reply("ok");
        let llm = RetryingLlmClient::new(inner.clone(), fast());
        assert_eq!(llm.complete(&[]).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_exhausted() {
        let inner = Arc::new(ScriptedLlmClient::default());
        let llm = RetryingLlmClient::new(inner.clone(), fast());
        let err = llm.complete(&[]).await.unwrap_err();
        assert!(err.contains("3 attempts"));
        assert_eq!(inner.calls().len(), 3);
    }
}
