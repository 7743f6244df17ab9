//! 操作系统感知能力接口：截图、结构化 UI 树、OCR、窗口枚举
//!
//! 真正的平台实现（UIAutomation / AX / AT-SPI / OCR 引擎）在进程外注入；这里只定义窄接口与不可用时的占位实现。

use async_trait::async_trait;
use image::RgbaImage;
use serde::{Deserialize, Serialize};

use super::capture::Capture;
use super::element::WindowInfo;
use super::geometry::{Point, Rect};

/// 平台调用结果；错误为可读消息
pub type PlatformResult<T> = Result<T, String>;

/// 结构化 UI 树节点（坐标为全局桌面坐标）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralNode {
    #[serde(default)]
    pub name: String,
    pub control_type: String,
    pub rect: Rect,
    #[serde(default)]
    pub automation_id: String,
    #[serde(default)]
    pub children: Vec<StructuralNode>,
}

impl StructuralNode {
    pub fn new(name: impl Into<String>, control_type: impl Into<String>, rect: Rect) -> Self {
        Self {
            name: name.into(),
            control_type: control_type.into(),
            rect,
            automation_id: String::new(),
            children: Vec::new(),
        }
    }

    pub fn with_automation_id(mut self, id: impl Into<String>) -> Self {
        self.automation_id = id.into();
        self
    }

    pub fn with_children(mut self, children: Vec<StructuralNode>) -> Self {
        self.children = children;
        self
    }

    /// 深度优先展开（含自身）
    pub fn flatten(&self) -> Vec<&StructuralNode> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            out.push(node);
            for child in node.children.iter().rev() {
                stack.push(child);
            }
        }
        out
    }
}

/// OCR 识别出的文本框（坐标相对于传入图像）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrBox {
    pub text: String,
    pub rect: Rect,
    #[serde(default)]
    pub confidence: f32,
}

impl OcrBox {
    pub fn new(text: impl Into<String>, rect: Rect) -> Self {
        Self {
            text: text.into(),
            rect,
            confidence: 1.0,
        }
    }
}

#[async_trait]
pub trait ScreenSource: Send + Sync {
    /// 全部显示器的并集（全局坐标）
    async fn desktop_bounds(&self) -> PlatformResult<Rect>;
    async fn capture(&self) -> PlatformResult<Capture>;
    async fn pointer(&self) -> PlatformResult<Point>;
}

#[async_trait]
pub trait StructuralProvider: Send + Sync {
    /// 指定顶层窗口的 UI 树；不可用时返回 None
    async fn tree(&self, window: u64) -> PlatformResult<Option<StructuralNode>>;
}

#[async_trait]
pub trait OcrProvider: Send + Sync {
    async fn recognize(&self, image: &RgbaImage) -> PlatformResult<Vec<OcrBox>>;
}

#[async_trait]
pub trait WindowProvider: Send + Sync {
    async fn active_window(&self) -> PlatformResult<Option<WindowInfo>>;
    async fn list_windows(&self) -> PlatformResult<Vec<WindowInfo>>;
    async fn focus(&self, handle: u64) -> PlatformResult<()>;
    async fn close(&self, handle: u64) -> PlatformResult<()>;
}

/// 当前平台没有接入后端时的占位实现
#[derive(Debug, Default, Clone, Copy)]
pub struct Unavailable;

const UNAVAILABLE: &str = "not supported on this platform";

#[async_trait]
impl ScreenSource for Unavailable {
    async fn desktop_bounds(&self) -> PlatformResult<Rect> {
        Err(format!("screen capture {}", UNAVAILABLE))
    }

    async fn capture(&self) -> PlatformResult<Capture> {
        Err(format!("screen capture {}", UNAVAILABLE))
    }

    async fn pointer(&self) -> PlatformResult<Point> {
        Err(format!("pointer query {}", UNAVAILABLE))
    }
}

#[async_trait]
impl StructuralProvider for Unavailable {
    async fn tree(&self, _window: u64) -> PlatformResult<Option<StructuralNode>> {
        Ok(None)
    }
}

#[async_trait]
impl OcrProvider for Unavailable {
    async fn recognize(&self, _image: &RgbaImage) -> PlatformResult<Vec<OcrBox>> {
        Err(format!("ocr {}", UNAVAILABLE))
    }
}

#[async_trait]
impl WindowProvider for Unavailable {
    async fn active_window(&self) -> PlatformResult<Option<WindowInfo>> {
        Ok(None)
    }

    async fn list_windows(&self) -> PlatformResult<Vec<WindowInfo>> {
        Ok(Vec::new())
    }

    async fn focus(&self, _handle: u64) -> PlatformResult<()> {
        Err(format!("window focus {}", UNAVAILABLE))
    }

    async fn close(&self, _handle: u64) -> PlatformResult<()> {
        Err(format!("window close {}", UNAVAILABLE))
    }
}
