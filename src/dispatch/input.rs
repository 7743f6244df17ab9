//! 输入注入与结构化控件操作接口
//!
//! InputProvider 负责鼠标 / 键盘原语；StructuralActuator 通过元素句柄精确操作控件（focus_element / invoke / set_text）。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::perception::{ElementHandle, PlatformResult, Point};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

#[async_trait]
pub trait InputProvider: Send + Sync {
    async fn move_mouse(&self, to: Point) -> PlatformResult<()>;
    async fn click(&self, at: Point, button: MouseButton) -> PlatformResult<()>;
    async fn type_text(&self, text: &str) -> PlatformResult<()>;
    /// 单键或组合键，如 ["pagedown"]、["ctrl", "s"]
    async fn key_combo(&self, keys: &[String]) -> PlatformResult<()>;
}

#[async_trait]
pub trait StructuralActuator: Send + Sync {
    /// 把键盘焦点移到控件上
    async fn focus_element(&self, handle: &ElementHandle) -> PlatformResult<()>;
    /// 调用控件默认动作（按钮点击、列表项选择等）
    async fn invoke(&self, handle: &ElementHandle) -> PlatformResult<()>;
    /// 直接设置文本（编辑框）
    async fn set_text(&self, handle: &ElementHandle, text: &str) -> PlatformResult<()>;
    async fn window_exists(&self, window: u64) -> PlatformResult<bool>;
}

/// 无平台后端时的占位实现
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableInput;

#[async_trait]
impl InputProvider for UnavailableInput {
    async fn move_mouse(&self, _to: Point) -> PlatformResult<()> {
        Err("input not supported".into())
    }

    async fn click(&self, _at: Point, _button: MouseButton) -> PlatformResult<()> {
        Err("input not supported".into())
    }

    async fn type_text(&self, _text: &str) -> PlatformResult<()> {
        Err("input not supported".into())
    }

    async fn key_combo(&self, _keys: &[String]) -> PlatformResult<()> {
        Err("input not supported".into())
    }
}

#[async_trait]
impl StructuralActuator for UnavailableInput {
    async fn focus_element(&self, _handle: &ElementHandle) -> PlatformResult<()> {
        Err("structural interaction not supported".into())
    }

    async fn invoke(&self, _handle: &ElementHandle) -> PlatformResult<()> {
        Err("structural interaction not supported".into())
    }

    async fn set_text(&self, _handle: &ElementHandle, _text: &str) -> PlatformResult<()> {
        Err("structural interaction not supported".into())
    }

    async fn window_exists(&self, _window: u64) -> PlatformResult<bool> {
        Ok(false)
    }
}
