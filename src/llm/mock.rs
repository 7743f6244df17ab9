//! 脚本化 LLM 客户端（测试与离线演示用，无需 API）
//!
//! 按顺序弹出预设回复；队列为空时返回错误，用来模拟推理服务不可用。每次调用的消息都会被记录下来。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::message::Message;
use super::traits::LlmClient;

#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<Result<String, String>>>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.lock_replies().push_back(Ok(reply.into()));
    }

    pub fn push_error(&self, error: impl Into<String>) {
        self.lock_replies().push_back(Err(error.into()));
    }

    pub fn remaining(&self) -> usize {
        self.lock_replies().len()
    }

    /// 所有调用收到的消息（按调用顺序）
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn lock_replies(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, String>>> {
        self.replies.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(messages.to_vec());
        self.lock_replies()
            .pop_front()
            .unwrap_or_else(|| Err("script exhausted".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replies_in_order_then_error() {
        let llm = ScriptedLlmClient::new(["a", "b"]);
        assert_eq!(llm.complete(&[Message::user("x")]).await.unwrap(), "a");
        assert_eq!(llm.complete(&[]).await.unwrap(), "b");
        assert!(llm.complete(&[]).await.is_err());
        assert_eq!(llm.calls().len(), 3);
        assert_eq!(llm.calls()[0][0].content, "x");
    }
}
