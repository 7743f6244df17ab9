//! 进程内执行端：不经过通道，直接调用 HostService（单机演示与测试）

use std::sync::Arc;

use async_trait::async_trait;

use super::service::HostService;
use super::ExecutionHost;
use crate::channel::PerceiveRequest;
use crate::core::AgentError;
use crate::dispatch::{Action, ActionResult};
use crate::perception::PerceptionSnapshot;

#[derive(Clone)]
pub struct LocalHost {
    service: Arc<HostService>,
}

impl LocalHost {
    pub fn new(service: Arc<HostService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<HostService> {
        &self.service
    }
}

#[async_trait]
impl ExecutionHost for LocalHost {
    async fn perceive(&self, request: PerceiveRequest) -> Result<PerceptionSnapshot, AgentError> {
        self.service.perceive(&request).await
    }

    async fn execute(
        &self,
        action: &Action,
        snapshot: &PerceptionSnapshot,
    ) -> Result<ActionResult, AgentError> {
        Ok(self.service.execute(action, snapshot).await)
    }
}
