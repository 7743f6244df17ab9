//! LLM 层：客户端抽象与实现（OpenAI 兼容 / 脚本化 Mock）以及重试包装

pub mod message;
pub mod mock;
pub mod openai;
pub mod retry;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use message::{Message, Role};
pub use mock::ScriptedLlmClient;
pub use openai::OpenAiClient;
pub use retry::{RetryPolicy, RetryingLlmClient};
pub use traits::{LlmClient, TokenUsage};

use crate::config::LlmSection;

/// 按配置创建带重试的客户端；provider 为 mock 时使用空脚本（每次调用都失败）
pub fn create_client(config: &LlmSection) -> Arc<dyn LlmClient> {
    let inner: Arc<dyn LlmClient> = match config.provider.as_str() {
        "mock" => Arc::new(ScriptedLlmClient::default()),
        _ => Arc::new(OpenAiClient::new(
            config.base_url.as_deref(),
            &config.model,
            None,
            Duration::from_secs(config.timeouts.request),
        )),
    };
    Arc::new(RetryingLlmClient::new(inner, RetryPolicy::from(&config.retry)))
}
