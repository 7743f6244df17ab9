//! 通道上的业务消息负载

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dispatch::{Action, ActionResult};
use crate::perception::{PerceptionSnapshot, Point, WindowInfo};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerceiveRequest {
    /// 是否在快照中附带裁剪图（JPEG base64）
    #[serde(default)]
    pub include_image: bool,
    /// 强制走 OCR，忽略结构化节点数量判断
    #[serde(default)]
    pub force_ocr: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerceiveResponse {
    pub snapshot: PerceptionSnapshot,
}

/// 执行请求携带发起时的快照，执行端据此解析元素引用，不保存会话状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub action: Action,
    pub snapshot: PerceptionSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub result: ActionResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowListResponse {
    pub windows: Vec<WindowInfo>,
}

/// 执行端定期推送的遥测
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub timestamp: DateTime<Utc>,
    pub pointer: Option<Point>,
    pub active_window: Option<WindowInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShutdownNotice {
    #[serde(default)]
    pub reason: String,
}
