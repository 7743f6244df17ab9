//! 弹窗自动聚焦：比较前后两次窗口列表，新出现的窗口压入焦点栈；焦点窗口消失时回退到栈中仍存活的窗口。

use std::collections::HashSet;

use super::element::WindowInfo;

/// 系统 / 输入法等不应被当作「新窗口」的标题
const IGNORED_TITLES: &[&str] = &[
    "Default IME",
    "MSCTFIME UI",
    "Program Manager",
    "Windows Input Experience",
    "Task Switching",
];

/// 宽或高不大于此值的窗口忽略
const MIN_WINDOW_SIDE: i32 = 50;

/// 一次观察后焦点的变化
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FocusChange {
    Unchanged,
    /// 新窗口出现并成为焦点
    NewWindow(WindowInfo),
    /// 焦点窗口关闭，回退到较早的窗口
    FellBack(WindowInfo),
    /// 栈已空
    Lost,
}

#[derive(Debug, Default)]
pub struct FocusTracker {
    known: HashSet<u64>,
    stack: Vec<WindowInfo>,
    primed: bool,
}

impl FocusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_relevant(window: &WindowInfo) -> bool {
        let title = window.title.trim();
        !title.is_empty()
            && !IGNORED_TITLES.iter().any(|t| title.eq_ignore_ascii_case(t))
            && window.rect.width > MIN_WINDOW_SIDE
            && window.rect.height > MIN_WINDOW_SIDE
    }

    pub fn focused(&self) -> Option<&WindowInfo> {
        self.stack.last()
    }

    /// 手动指定焦点（launch / focus_window 之后）
    pub fn push(&mut self, window: WindowInfo) {
        self.known.insert(window.handle);
        self.stack.retain(|w| w.handle != window.handle);
        self.stack.push(window);
    }

    /// 输入当前窗口列表；第一次调用只建立基线
    pub fn observe(&mut self, windows: &[WindowInfo]) -> FocusChange {
        let relevant: Vec<&WindowInfo> = windows.iter().filter(|w| Self::is_relevant(w)).collect();
        let alive: HashSet<u64> = relevant.iter().map(|w| w.handle).collect();

        if !self.primed {
            self.primed = true;
            self.known = alive;
            return FocusChange::Unchanged;
        }

        let fresh: Vec<WindowInfo> = relevant
            .iter()
            .filter(|w| !self.known.contains(&w.handle))
            .map(|w| (*w).clone())
            .collect();
        self.known.extend(fresh.iter().map(|w| w.handle));

        let focused_alive = self
            .stack
            .last()
            .map(|w| alive.contains(&w.handle))
            .unwrap_or(true);
        self.stack.retain(|w| alive.contains(&w.handle));
        self.known.retain(|h| alive.contains(h));

        if let Some(newest) = fresh.into_iter().last() {
            tracing::info!(handle = newest.handle, title = %newest.title, "new window focused");
            self.stack.push(newest.clone());
            return FocusChange::NewWindow(newest);
        }
        if !focused_alive {
            return match self.stack.last() {
                Some(w) => FocusChange::FellBack(w.clone()),
                None => FocusChange::Lost,
            };
        }
        FocusChange::Unchanged
    }
}
