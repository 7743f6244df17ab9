//! LLM 客户端抽象
//!
//! 推理服务只依赖这个 trait；重试、脚本化回放都是它的实现或包装。

use async_trait::async_trait;
use serde::Serialize;

use super::message::Message;

/// 累计 token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt + self.completion
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 单轮补全，返回助手文本
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;

    /// 没有计费信息的后端返回零
    fn usage(&self) -> TokenUsage {
        TokenUsage::default()
    }
}
