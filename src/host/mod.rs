//! 执行端：感知 + 动作分发的组合服务
//!
//! 认知端只通过 ExecutionHost 访问执行端。ChannelClient 走 TCP 通道，LocalHost 在同一进程内直接调用 HostService。

pub mod local;
pub mod mock;
pub mod service;

use async_trait::async_trait;

use crate::channel::PerceiveRequest;
use crate::core::AgentError;
use crate::dispatch::{Action, ActionResult};
use crate::perception::PerceptionSnapshot;

pub use local::LocalHost;
pub use mock::{InputEvent, MockDesktop, MockScene};
pub use service::{HostProviders, HostService};

/// 认知端看到的执行端
///
/// execute 只在通道故障时返回 Err；动作本身的失败（包括请求超时）放在 ActionResult 里。
#[async_trait]
pub trait ExecutionHost: Send + Sync {
    async fn perceive(&self, request: PerceiveRequest) -> Result<PerceptionSnapshot, AgentError>;

    async fn execute(
        &self,
        action: &Action,
        snapshot: &PerceptionSnapshot,
    ) -> Result<ActionResult, AgentError>;
}
