//! 动作与执行结果
//!
//! Action 是封闭的标签枚举；Dispatcher 对其穷尽匹配，新增动作必须显式加变体。

use serde::{Deserialize, Serialize};

use crate::core::ErrorKind;
use crate::perception::ElementRef;

/// wait 动作的秒数范围
pub const WAIT_MIN_SECS: u64 = 1;
pub const WAIT_MAX_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
}

fn default_scroll_amount() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Click {
        target: ElementRef,
    },
    /// 有 target 时先聚焦控件再输入
    Type {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ElementRef>,
    },
    Scroll {
        direction: ScrollDirection,
        #[serde(default = "default_scroll_amount")]
        amount: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ElementRef>,
    },
    Launch {
        app: String,
    },
    ShellCommand {
        cmd: String,
    },
    WriteFile {
        path: String,
        content: String,
    },
    /// 文件内容放在 ActionResult.message 中返回
    ReadFile {
        path: String,
    },
    /// 组合键，如 ["ctrl", "s"]
    Hotkey {
        keys: Vec<String>,
    },
    Wait {
        seconds: u64,
    },
    CloseWindow,
    FocusWindow {
        title: String,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Click { .. } => "click",
            Action::Type { .. } => "type",
            Action::Scroll { .. } => "scroll",
            Action::Launch { .. } => "launch",
            Action::ShellCommand { .. } => "shell_command",
            Action::WriteFile { .. } => "write_file",
            Action::ReadFile { .. } => "read_file",
            Action::Hotkey { .. } => "hotkey",
            Action::Wait { .. } => "wait",
            Action::CloseWindow => "close_window",
            Action::FocusWindow { .. } => "focus_window",
        }
    }

    /// 需要在快照中解析的目标元素
    pub fn target(&self) -> Option<&ElementRef> {
        match self {
            Action::Click { target } => Some(target),
            Action::Type { target, .. } | Action::Scroll { target, .. } => target.as_ref(),
            _ => None,
        }
    }

    /// 一行可读描述（日志、GroundingNotes）
    pub fn describe(&self) -> String {
        match self {
            Action::Click { target } => format!("click {}", target),
            Action::Type { text, target } => match target {
                Some(t) => format!("type {:?} into {}", text, t),
                None => format!("type {:?}", text),
            },
            Action::Scroll {
                direction, amount, ..
            } => format!("scroll {:?} x{}", direction, amount),
            Action::Launch { app } => format!("launch {}", app),
            Action::ShellCommand { cmd } => format!("shell `{}`", cmd),
            Action::WriteFile { path, content } => {
                format!("write {} ({} bytes)", path, content.len())
            }
            Action::ReadFile { path } => format!("read {}", path),
            Action::Hotkey { keys } => format!("hotkey {}", keys.join("+")),
            Action::Wait { seconds } => format!("wait {}s", seconds),
            Action::CloseWindow => "close active window".to_string(),
            Action::FocusWindow { title } => format!("focus window {:?}", title),
        }
    }
}

/// 执行后的窗口 / 目标状态
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleState {
    pub active_window: Option<u64>,
    /// 目标元素所在窗口是否仍存在；无目标的动作为 None
    pub target_alive: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub resulting_handle_state: HandleState,
}

impl ActionResult {
    pub fn ok(message: impl Into<String>, state: HandleState) -> Self {
        Self {
            success: true,
            error_kind: None,
            message: message.into(),
            resulting_handle_state: state,
        }
    }

    pub fn failed(kind: ErrorKind, message: impl Into<String>, state: HandleState) -> Self {
        Self {
            success: false,
            error_kind: Some(kind),
            message: message.into(),
            resulting_handle_state: state,
        }
    }

    /// 通道层失败（超时 / 断开）没有窗口状态
    pub fn channel_failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::failed(kind, message, HandleState::default())
    }
}
