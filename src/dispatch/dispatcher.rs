//! 动作分发器
//!
//! execute(action, snapshot) 把符号动作翻译为输入原语并执行：有句柄的结构化元素走 StructuralActuator 精确操作，
//! 否则在包围盒中心点击。引用在快照中解析不到时返回 ElementNotFound；launch / shell / 文件读写等失败映射为
//! OSOperationFailed。分发器从不重试，每次调用输出一条 JSON 审计日志。

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::DispatchSection;
use crate::core::AgentError;
use crate::dispatch::action::{Action, ActionResult, HandleState, ScrollDirection, WAIT_MAX_SECS, WAIT_MIN_SECS};
use crate::dispatch::input::{InputProvider, MouseButton, StructuralActuator};
use crate::dispatch::launcher::{resolve_app, suggestions, AppLauncher};
use crate::dispatch::shell::run_shell;
use crate::perception::{ElementRef, ObservationElement, PerceptionSnapshot, SourceKind, WindowInfo, WindowProvider};

/// launch 后新窗口的最小宽高
const MIN_LAUNCHED_SIDE: i32 = 50;
/// read_file 返回内容的上限，超出部分截断
const MAX_READ_BYTES: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub shell_timeout: Duration,
    pub launch_wait: Duration,
    pub launch_poll: Duration,
}

impl From<&DispatchSection> for DispatcherConfig {
    fn from(s: &DispatchSection) -> Self {
        Self {
            shell_timeout: Duration::from_secs(s.shell_timeout_secs),
            launch_wait: Duration::from_secs(s.launch_wait_secs),
            launch_poll: Duration::from_millis(s.launch_poll_ms.max(10)),
        }
    }
}

/// 单次动作的内部结果
struct Outcome {
    message: String,
    /// 目标所在窗口（用于 target_alive）
    target_window: Option<u64>,
}

impl Outcome {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            target_window: None,
        }
    }

    fn on_window(mut self, window: Option<u64>) -> Self {
        self.target_window = window;
        self
    }
}

pub struct ActionDispatcher {
    input: Arc<dyn InputProvider>,
    actuator: Arc<dyn StructuralActuator>,
    windows: Arc<dyn WindowProvider>,
    launcher: Arc<dyn AppLauncher>,
    config: DispatcherConfig,
}

impl ActionDispatcher {
    pub fn new(
        input: Arc<dyn InputProvider>,
        actuator: Arc<dyn StructuralActuator>,
        windows: Arc<dyn WindowProvider>,
        launcher: Arc<dyn AppLauncher>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            input,
            actuator,
            windows,
            launcher,
            config,
        }
    }

    pub async fn execute(&self, action: &Action, snapshot: &PerceptionSnapshot) -> ActionResult {
        let start = Instant::now();
        let outcome = self.run(action, snapshot).await;

        let result = match outcome {
            Ok(o) => {
                let state = self.handle_state(o.target_window).await;
                ActionResult::ok(o.message, state)
            }
            Err(e) => {
                let window = action
                    .target()
                    .and_then(|t| snapshot.resolve(t))
                    .and_then(|el| target_window(el, snapshot));
                let state = self.handle_state(window).await;
                ActionResult::failed(e.kind(), e.to_string(), state)
            }
        };

        let audit = serde_json::json!({
            "event": "action_audit",
            "action": action.name(),
            "detail": action.describe(),
            "snapshot": snapshot.id.to_string(),
            "ok": result.success,
            "error_kind": result.error_kind,
            "duration_ms": start.elapsed().as_millis() as u64,
        });
        tracing::info!(audit = %audit, "action");
        result
    }

    async fn run(&self, action: &Action, snapshot: &PerceptionSnapshot) -> Result<Outcome, AgentError> {
        match action {
            Action::Click { target } => {
                let el = resolve(snapshot, target)?;
                let how = self.click_element(el).await?;
                Ok(Outcome::new(format!("clicked {} ({})", describe_element(el), how))
                    .on_window(target_window(el, snapshot)))
            }
            Action::Type { text, target } => match target {
                Some(t) => {
                    let el = resolve(snapshot, t)?;
                    self.type_into(el, text).await?;
                    Ok(Outcome::new(format!("typed into {}", describe_element(el)))
                        .on_window(target_window(el, snapshot)))
                }
                None => {
                    self.input.type_text(text).await.map_err(os_err)?;
                    Ok(Outcome::new(format!("typed {} chars", text.chars().count())))
                }
            },
            Action::Scroll {
                direction,
                amount,
                target,
            } => {
                let window = match target {
                    Some(t) => {
                        let el = resolve(snapshot, t)?;
                        self.focus_target(el).await?;
                        target_window(el, snapshot)
                    }
                    None => None,
                };
                let key = match direction {
                    ScrollDirection::Up => "pageup",
                    ScrollDirection::Down => "pagedown",
                };
                for _ in 0..(*amount).max(1) {
                    self.input
                        .key_combo(&[key.to_string()])
                        .await
                        .map_err(os_err)?;
                }
                Ok(Outcome::new(format!("scrolled {} x{}", key, amount)).on_window(window))
            }
            Action::Launch { app } => self.launch(app).await,
            Action::ShellCommand { cmd } => run_shell(cmd, self.config.shell_timeout)
                .await
                .map(Outcome::new)
                .map_err(AgentError::OsOperationFailed),
            Action::WriteFile { path, content } => {
                write_file(Path::new(path), content).await?;
                Ok(Outcome::new(format!("wrote {} bytes to {}", content.len(), path)))
            }
            Action::ReadFile { path } => read_file(Path::new(path)).await.map(Outcome::new),
            Action::Hotkey { keys } => {
                if keys.is_empty() {
                    return Err(AgentError::OsOperationFailed("empty hotkey".into()));
                }
                self.input.key_combo(keys).await.map_err(os_err)?;
                Ok(Outcome::new(format!("pressed {}", keys.join("+"))))
            }
            Action::Wait { seconds } => {
                let secs = (*seconds).clamp(WAIT_MIN_SECS, WAIT_MAX_SECS);
                tokio::time::sleep(Duration::from_secs(secs)).await;
                Ok(Outcome::new(format!("waited {}s", secs)))
            }
            Action::CloseWindow => {
                let active = self
                    .windows
                    .active_window()
                    .await
                    .map_err(os_err)?
                    .ok_or_else(|| AgentError::OsOperationFailed("no active window to close".into()))?;
                self.windows.close(active.handle).await.map_err(os_err)?;
                Ok(Outcome::new(format!("closed {:?}", active.title)))
            }
            Action::FocusWindow { title } => {
                let wanted = title.trim().to_lowercase();
                let windows = self.windows.list_windows().await.map_err(os_err)?;
                let w = windows
                    .iter()
                    .find(|w| w.title.to_lowercase().contains(&wanted))
                    .ok_or_else(|| {
                        AgentError::OsOperationFailed(format!("no window matching {:?}", title))
                    })?;
                self.windows.focus(w.handle).await.map_err(os_err)?;
                Ok(Outcome::new(format!("focused {:?}", w.title)).on_window(Some(w.handle)))
            }
        }
    }

    /// 结构化句柄优先；句柄操作失败时退回中心点击
    async fn click_element(&self, el: &ObservationElement) -> Result<&'static str, AgentError> {
        if let (SourceKind::Structural, Some(handle)) = (el.source, el.handle.as_ref()) {
            match self.actuator.invoke(handle).await {
                Ok(()) => return Ok("invoke"),
                Err(e) => tracing::warn!(id = el.id, error = %e, "invoke failed, clicking center"),
            }
        }
        self.click_center(el).await?;
        Ok("center-click")
    }

    /// 结构化控件先 focus_element 再 set_text；任一步失败退回点击后键入
    async fn type_into(&self, el: &ObservationElement, text: &str) -> Result<(), AgentError> {
        if let (SourceKind::Structural, Some(handle)) = (el.source, el.handle.as_ref()) {
            let direct = match self.actuator.focus_element(handle).await {
                Ok(()) => self.actuator.set_text(handle, text).await,
                Err(e) => Err(e),
            };
            match direct {
                Ok(()) => return Ok(()),
                Err(e) => tracing::warn!(id = el.id, error = %e, "set_text failed, typing"),
            }
        }
        self.click_center(el).await?;
        self.input.type_text(text).await.map_err(os_err)
    }

    /// 让目标获得焦点：结构化控件走 focus_element，否则点击中心
    async fn focus_target(&self, el: &ObservationElement) -> Result<(), AgentError> {
        if let (SourceKind::Structural, Some(handle)) = (el.source, el.handle.as_ref()) {
            match self.actuator.focus_element(handle).await {
                Ok(()) => return Ok(()),
                Err(e) => tracing::warn!(id = el.id, error = %e, "focus failed, clicking center"),
            }
        }
        self.click_center(el).await
    }

    async fn click_center(&self, el: &ObservationElement) -> Result<(), AgentError> {
        let center = el.bbox.center();
        self.input.move_mouse(center).await.map_err(os_err)?;
        self.input
            .click(center, MouseButton::Left)
            .await
            .map_err(os_err)
    }

    async fn launch(&self, app: &str) -> Result<Outcome, AgentError> {
        let index = self.launcher.index().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "app index unavailable");
            Default::default()
        });
        let resolved = resolve_app(app, &index).ok_or_else(|| {
            AgentError::OsOperationFailed(format!(
                "unknown application {:?}; closest: {}",
                app,
                suggestions(app, &index, 5).join(", ")
            ))
        })?;

        let before: HashSet<u64> = self
            .windows
            .list_windows()
            .await
            .map(|ws| ws.into_iter().map(|w| w.handle).collect())
            .unwrap_or_default();

        self.launcher.spawn(&resolved.command).await.map_err(os_err)?;
        tracing::info!(app = %resolved.name, command = %resolved.command, "launched");

        match self.wait_for_new_window(&before).await {
            Some(w) => {
                if let Err(e) = self.windows.focus(w.handle).await {
                    tracing::warn!(handle = w.handle, error = %e, "focus new window failed");
                }
                Ok(Outcome::new(format!("launched {} -> window {:?}", resolved.name, w.title))
                    .on_window(Some(w.handle)))
            }
            None => Ok(Outcome::new(format!(
                "launched {}; no new window within {}s",
                resolved.name,
                self.config.launch_wait.as_secs()
            ))),
        }
    }

    async fn wait_for_new_window(&self, before: &HashSet<u64>) -> Option<WindowInfo> {
        let deadline = Instant::now() + self.config.launch_wait;
        loop {
            if let Ok(windows) = self.windows.list_windows().await {
                let fresh = windows.into_iter().find(|w| {
                    !before.contains(&w.handle)
                        && w.rect.width > MIN_LAUNCHED_SIDE
                        && w.rect.height > MIN_LAUNCHED_SIDE
                });
                if fresh.is_some() {
                    return fresh;
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(self.config.launch_poll).await;
        }
    }

    async fn handle_state(&self, target_window: Option<u64>) -> HandleState {
        let active_window = match self.windows.active_window().await {
            Ok(w) => w.map(|w| w.handle),
            Err(_) => None,
        };
        let target_alive = match target_window {
            Some(h) => self.actuator.window_exists(h).await.ok(),
            None => None,
        };
        HandleState {
            active_window,
            target_alive,
        }
    }
}

fn resolve<'a>(snapshot: &'a PerceptionSnapshot, target: &ElementRef) -> Result<&'a ObservationElement, AgentError> {
    snapshot.resolve(target).ok_or_else(|| {
        AgentError::ElementNotFound(format!("{} not in snapshot {}", target, snapshot.id))
    })
}

fn target_window(el: &ObservationElement, snapshot: &PerceptionSnapshot) -> Option<u64> {
    el.handle
        .as_ref()
        .map(|h| h.window)
        .filter(|w| *w != 0)
        .or_else(|| snapshot.active_window_handle())
}

fn describe_element(el: &ObservationElement) -> String {
    format!("#{} {:?}", el.id, el.label)
}

fn os_err(e: String) -> AgentError {
    AgentError::OsOperationFailed(e)
}

async fn write_file(path: &Path, content: &str) -> Result<(), AgentError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AgentError::OsOperationFailed(format!("create {}: {}", parent.display(), e)))?;
    }
    tokio::fs::write(path, content)
        .await
        .map_err(|e| AgentError::OsOperationFailed(format!("write {}: {}", path.display(), e)))
}

async fn read_file(path: &Path) -> Result<String, AgentError> {
    let mut bytes = tokio::fs::read(path)
        .await
        .map_err(|e| AgentError::OsOperationFailed(format!("read {}: {}", path.display(), e)))?;
    let truncated = bytes.len() > MAX_READ_BYTES;
    bytes.truncate(MAX_READ_BYTES);
    let mut content = String::from_utf8_lossy(&bytes).into_owned();
    if truncated {
        content.push_str("\n[truncated]");
    }
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use crate::host::mock::{InputEvent, MockDesktop};
    use crate::perception::{ElementHandle, Rect};
    use chrono::Utc;
    use uuid::Uuid;

    fn dispatcher(desktop: &Arc<MockDesktop>) -> ActionDispatcher {
        ActionDispatcher::new(
            desktop.clone(),
            desktop.clone(),
            desktop.clone(),
            desktop.clone(),
            DispatcherConfig {
                shell_timeout: Duration::from_secs(5),
                launch_wait: Duration::from_millis(200),
                launch_poll: Duration::from_millis(10),
            },
        )
    }

    fn snapshot() -> PerceptionSnapshot {
        PerceptionSnapshot {
            id: Uuid::new_v4(),
            capture_timestamp: Utc::now(),
            active_window: None,
            cropped_region: Rect::new(0, 0, 800, 600),
            desktop: Rect::new(0, 0, 800, 600),
            elements: vec![
                ObservationElement {
                    id: 0,
                    source: SourceKind::Structural,
                    label: "OK".into(),
                    control_type: "Button".into(),
                    bbox: Rect::new(100, 100, 40, 20),
                    handle: Some(ElementHandle {
                        window: 7,
                        automation_id: "okBtn".into(),
                        name: "OK".into(),
                    }),
                },
                ObservationElement {
                    id: 9000,
                    source: SourceKind::OcrText,
                    label: "Total".into(),
                    control_type: "Text".into(),
                    bbox: Rect::new(300, 200, 60, 20),
                    handle: None,
                },
            ],
            ocr_forced: false,
            image: None,
        }
    }

    #[tokio::test]
    async fn test_click_structural_uses_handle() {
        let desktop = Arc::new(MockDesktop::new());
        let res = dispatcher(&desktop)
            .execute(&Action::Click { target: "OK".into() }, &snapshot())
            .await;
        assert!(res.success, "{}", res.message);
        assert!(matches!(desktop.events().last(), Some(InputEvent::Invoke(h)) if h.automation_id == "okBtn"));
    }

    #[tokio::test]
    async fn test_click_ocr_uses_center() {
        let desktop = Arc::new(MockDesktop::new());
        let res = dispatcher(&desktop)
            .execute(&Action::Click { target: ElementRef::Id(9000) }, &snapshot())
            .await;
        assert!(res.success);
        assert_eq!(
            desktop.events().last(),
            Some(&InputEvent::Click(crate::perception::Point::new(330, 210)))
        );
    }

    #[tokio::test]
    async fn test_stale_reference() {
        let desktop = Arc::new(MockDesktop::new());
        let res = dispatcher(&desktop)
            .execute(&Action::Click { target: "Cancel".into() }, &snapshot())
            .await;
        assert!(!res.success);
        assert_eq!(res.error_kind, Some(ErrorKind::ElementNotFound));
        assert!(desktop.events().is_empty());
    }

    #[tokio::test]
    async fn test_type_without_target() {
        let desktop = Arc::new(MockDesktop::new());
        let res = dispatcher(&desktop)
            .execute(&Action::Type { text: "hello".into(), target: None }, &snapshot())
            .await;
        assert!(res.success);
        assert_eq!(desktop.events(), vec![InputEvent::Type("hello".into())]);
    }

    #[tokio::test]
    async fn test_scroll_pages() {
        let desktop = Arc::new(MockDesktop::new());
        let res = dispatcher(&desktop)
            .execute(
                &Action::Scroll {
                    direction: ScrollDirection::Down,
                    amount: 2,
                    target: None,
                },
                &snapshot(),
            )
            .await;
        assert!(res.success);
        assert_eq!(
            desktop.events(),
            vec![
                InputEvent::Keys(vec!["pagedown".into()]),
                InputEvent::Keys(vec!["pagedown".into()])
            ]
        );
    }

    #[tokio::test]
    async fn test_type_into_structural_focuses_first() {
        let desktop = Arc::new(MockDesktop::new());
        let res = dispatcher(&desktop)
            .execute(
                &Action::Type {
                    text: "42".into(),
                    target: Some("OK".into()),
                },
                &snapshot(),
            )
            .await;
        assert!(res.success, "{}", res.message);
        let events = desktop.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], InputEvent::FocusElement(h) if h.automation_id == "okBtn"));
        assert!(matches!(&events[1], InputEvent::SetText(h, t) if h.automation_id == "okBtn" && t == "42"));
    }

    #[tokio::test]
    async fn test_scroll_target_gets_focus_before_paging() {
        let desktop = Arc::new(MockDesktop::new());
        let center = crate::perception::Point::new(330, 210);
        let res = dispatcher(&desktop)
            .execute(
                &Action::Scroll {
                    direction: ScrollDirection::Up,
                    amount: 1,
                    target: Some(ElementRef::Id(9000)),
                },
                &snapshot(),
            )
            .await;
        assert!(res.success, "{}", res.message);
        assert_eq!(
            desktop.events(),
            vec![
                InputEvent::Move(center),
                InputEvent::Click(center),
                InputEvent::Keys(vec!["pageup".into()])
            ]
        );

        let desktop = Arc::new(MockDesktop::new());
        dispatcher(&desktop)
            .execute(
                &Action::Scroll {
                    direction: ScrollDirection::Down,
                    amount: 1,
                    target: Some("OK".into()),
                },
                &snapshot(),
            )
            .await;
        let events = desktop.events();
        assert!(matches!(&events[0], InputEvent::FocusElement(h) if h.automation_id == "okBtn"));
        assert_eq!(events[1], InputEvent::Keys(vec!["pagedown".into()]));
    }

    #[tokio::test]
    async fn test_launch_detects_new_window() {
        let desktop = Arc::new(MockDesktop::new());
        desktop.on_launch("calc.exe", "Calculator", Rect::new(50, 50, 320, 480));
        let res = dispatcher(&desktop)
            .execute(&Action::Launch { app: "Calculator".into() }, &snapshot())
            .await;
        assert!(res.success, "{}", res.message);
        let active = res.resulting_handle_state.active_window;
        assert!(active.is_some());
        assert_eq!(desktop.active_title().as_deref(), Some("Calculator"));
    }

    #[tokio::test]
    async fn test_launch_unknown_app_fails() {
        let desktop = Arc::new(MockDesktop::new());
        let res = dispatcher(&desktop)
            .execute(&Action::Launch { app: "qqqzzz".into() }, &snapshot())
            .await;
        assert_eq!(res.error_kind, Some(ErrorKind::OsOperationFailed));
    }

    #[tokio::test]
    async fn test_write_file_creates_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.txt");
        let desktop = Arc::new(MockDesktop::new());
        let res = dispatcher(&desktop)
            .execute(
                &Action::WriteFile {
                    path: path.to_string_lossy().to_string(),
                    content: "hi".into(),
                },
                &snapshot(),
            )
            .await;
        assert!(res.success);
        assert_eq!(std::fs::read_to_string(path).unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_read_file_returns_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "line one\nline two").unwrap();
        let desktop = Arc::new(MockDesktop::new());
        let res = dispatcher(&desktop)
            .execute(
                &Action::ReadFile {
                    path: path.to_string_lossy().to_string(),
                },
                &snapshot(),
            )
            .await;
        assert!(res.success, "{}", res.message);
        assert_eq!(res.message, "line one\nline two");
    }

    #[tokio::test]
    async fn test_read_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let desktop = Arc::new(MockDesktop::new());
        let res = dispatcher(&desktop)
            .execute(
                &Action::ReadFile {
                    path: dir.path().join("absent.txt").to_string_lossy().to_string(),
                },
                &snapshot(),
            )
            .await;
        assert!(!res.success);
        assert_eq!(res.error_kind, Some(ErrorKind::OsOperationFailed));
        assert!(res.message.contains("absent.txt"));
    }

    #[tokio::test]
    async fn test_close_without_window_fails() {
        let desktop = Arc::new(MockDesktop::new());
        let res = dispatcher(&desktop)
            .execute(&Action::CloseWindow, &snapshot())
            .await;
        assert_eq!(res.error_kind, Some(ErrorKind::OsOperationFailed));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_failure_maps_to_os_error() {
        let desktop = Arc::new(MockDesktop::new());
        let res = dispatcher(&desktop)
            .execute(&Action::ShellCommand { cmd: "exit 2".into() }, &snapshot())
            .await;
        assert_eq!(res.error_kind, Some(ErrorKind::OsOperationFailed));
    }
}
