//! HostService：把平台接口、视口选择、感知引擎、分发器与焦点跟踪组装成一次完整的 perceive / execute
//!
//! perceive 与 execute 共用一把请求锁，同一时刻只有一个在操作桌面；遥测采样不经过这把锁。

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::channel::{PerceiveRequest, TelemetryEvent};
use crate::config::AppConfig;
use crate::core::AgentError;
use crate::dispatch::{
    Action, ActionDispatcher, ActionResult, AppLauncher, DispatcherConfig, InputProvider,
    ProcessLauncher, StructuralActuator, UnavailableInput,
};
use crate::host::mock::MockDesktop;
use crate::perception::{
    FocusChange, FocusTracker, OcrProvider, PerceptionEngine, PerceptionInput, PerceptionSnapshot,
    ScreenSource, StructuralProvider, Unavailable, ViewportSelector, WindowInfo, WindowProvider,
};

/// 执行端依赖的全部平台接口
#[derive(Clone)]
pub struct HostProviders {
    pub screen: Arc<dyn ScreenSource>,
    pub structure: Arc<dyn StructuralProvider>,
    pub ocr: Arc<dyn OcrProvider>,
    pub windows: Arc<dyn WindowProvider>,
    pub input: Arc<dyn InputProvider>,
    pub actuator: Arc<dyn StructuralActuator>,
    pub launcher: Arc<dyn AppLauncher>,
}

impl HostProviders {
    /// 所有接口都由同一个模拟桌面提供
    pub fn mock(desk: Arc<MockDesktop>) -> Self {
        Self {
            screen: desk.clone(),
            structure: desk.clone(),
            ocr: desk.clone(),
            windows: desk.clone(),
            input: desk.clone(),
            actuator: desk.clone(),
            launcher: desk,
        }
    }

    /// 没有平台后端时：感知与输入全部报错，只保留真实的进程启动
    pub fn unavailable() -> Self {
        let input = Arc::new(UnavailableInput);
        Self {
            screen: Arc::new(Unavailable),
            structure: Arc::new(Unavailable),
            ocr: Arc::new(Unavailable),
            windows: Arc::new(Unavailable),
            input: input.clone(),
            actuator: input,
            launcher: Arc::new(ProcessLauncher),
        }
    }
}

pub struct HostService {
    providers: HostProviders,
    viewport: ViewportSelector,
    engine: PerceptionEngine,
    dispatcher: ActionDispatcher,
    focus: Mutex<FocusTracker>,
    request_gate: Mutex<()>,
}

impl HostService {
    pub fn new(providers: HostProviders, config: &AppConfig) -> Self {
        let p = &config.perception;
        let viewport = ViewportSelector::new(p.viewport_margin, p.upscale);
        let engine = PerceptionEngine::new(providers.ocr.clone(), p.clone());
        let dispatcher = ActionDispatcher::new(
            providers.input.clone(),
            providers.actuator.clone(),
            providers.windows.clone(),
            providers.launcher.clone(),
            DispatcherConfig::from(&config.dispatch),
        );
        Self {
            providers,
            viewport,
            engine,
            dispatcher,
            focus: Mutex::new(FocusTracker::new()),
            request_gate: Mutex::new(()),
        }
    }

    /// 感知流水线：焦点跟踪 → 截图 → 视口 → 结构化树 → 混合感知 → 去重
    pub async fn perceive(&self, request: &PerceiveRequest) -> Result<PerceptionSnapshot, AgentError> {
        let _turn = self.request_gate.lock().await;
        let active = self.focused_window().await?;

        let screen = &self.providers.screen;
        let desktop = screen.desktop_bounds().await.map_err(AgentError::OsOperationFailed)?;
        let capture = screen.capture().await.map_err(AgentError::OsOperationFailed)?;

        let region = self.viewport.select_viewport(active.as_ref(), desktop);
        let focused = self.viewport.focus(&capture, region);

        let tree = match &active {
            Some(w) => match self.providers.structure.tree(w.handle).await {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(error = %e, handle = w.handle, "structural tree unavailable");
                    None
                }
            },
            None => None,
        };

        let non_cooperative = request.force_ocr
            || active
                .as_ref()
                .map(|w| self.engine.is_non_cooperative(&w.title))
                .unwrap_or(false);

        let snapshot = self
            .engine
            .perceive(PerceptionInput {
                focused: &focused,
                tree: tree.as_ref(),
                active_window: active,
                desktop,
                non_cooperative,
            })
            .await;
        let snapshot = self.engine.resolve_duplicates(snapshot);
        Ok(self.engine.attach_image(snapshot, &focused, request.include_image))
    }

    /// 新弹出的窗口自动成为焦点；焦点窗口关闭时回退
    async fn focused_window(&self) -> Result<Option<WindowInfo>, AgentError> {
        let windows = &self.providers.windows;
        let list = windows.list_windows().await.map_err(AgentError::OsOperationFailed)?;
        let change = self.focus.lock().await.observe(&list);

        let target = match change {
            FocusChange::NewWindow(w) | FocusChange::FellBack(w) => Some(w),
            FocusChange::Unchanged | FocusChange::Lost => None,
        };
        if let Some(w) = target {
            if let Err(e) = windows.focus(w.handle).await {
                tracing::warn!(error = %e, handle = w.handle, "focus switch failed");
            }
        }
        windows.active_window().await.map_err(AgentError::OsOperationFailed)
    }

    pub async fn execute(&self, action: &Action, snapshot: &PerceptionSnapshot) -> ActionResult {
        let _turn = self.request_gate.lock().await;
        let result = self.dispatcher.execute(action, snapshot).await;
        // launch / focus_window 后手动压栈，避免下一次 observe 把它当作弹窗
        if result.success && matches!(action, Action::Launch { .. } | Action::FocusWindow { .. }) {
            if let Ok(Some(w)) = self.providers.windows.active_window().await {
                self.focus.lock().await.push(w);
            }
        }
        result
    }

    pub async fn list_windows(&self) -> Result<Vec<WindowInfo>, AgentError> {
        self.providers
            .windows
            .list_windows()
            .await
            .map_err(AgentError::OsOperationFailed)
    }

    /// 采样一次遥测；取不到的字段为 None
    pub async fn telemetry_sample(&self) -> TelemetryEvent {
        TelemetryEvent {
            timestamp: Utc::now(),
            pointer: self.providers.screen.pointer().await.ok(),
            active_window: self.providers.windows.active_window().await.ok().flatten(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use crate::perception::{OcrBox, Rect, SourceKind, StructuralNode};

    fn service(desk: &Arc<MockDesktop>) -> HostService {
        HostService::new(HostProviders::mock(desk.clone()), &AppConfig::default())
    }

    #[tokio::test]
    async fn test_perceive_structural_window() {
        let desk = Arc::new(MockDesktop::new());
        let h = desk.add_window("Calculator", Rect::new(100, 100, 300, 400));
        let buttons: Vec<StructuralNode> = ["1", "2", "+", "=", "Clear"]
            .iter()
            .enumerate()
            .map(|(i, n)| {
                StructuralNode::new(*n, "Button", Rect::new(110 + i as i32 * 50, 300, 40, 40))
            })
            .collect();
        desk.set_tree(
            h,
            StructuralNode::new("Calculator", "Window", Rect::new(100, 100, 300, 400))
                .with_children(buttons),
        );
        let svc = service(&desk);
        let snap = svc.perceive(&PerceiveRequest::default()).await.unwrap();
        assert_eq!(snap.active_window_handle(), Some(h));
        assert!(snap.elements.iter().all(|e| e.source == SourceKind::Structural));
        assert!(snap.has_label("="));
        assert!(snap.cropped_region.contains_rect(&Rect::new(100, 100, 300, 400)));
    }

    #[tokio::test]
    async fn test_force_ocr_maps_to_global() {
        let desk = Arc::new(MockDesktop::new());
        desk.add_window("Terminal", Rect::new(200, 100, 400, 300));
        desk.set_ocr(vec![OcrBox::new("$ ls", Rect::new(10, 10, 40, 20))]);
        let svc = service(&desk);
        let snap = svc
            .perceive(&PerceiveRequest {
                include_image: false,
                force_ocr: true,
            })
            .await
            .unwrap();
        assert!(snap.ocr_forced);
        let el = snap.find_by_label("$ ls").unwrap();
        assert_eq!(el.source, SourceKind::OcrText);
        assert!(snap.cropped_region.contains_point(el.bbox.center()));
    }

    #[tokio::test]
    async fn test_new_popup_takes_focus() {
        let desk = Arc::new(MockDesktop::new());
        let main = desk.add_window("Editor", Rect::new(0, 0, 800, 600));
        let svc = service(&desk);
        svc.perceive(&PerceiveRequest::default()).await.unwrap();

        let popup = desk.add_window("Save As", Rect::new(200, 200, 300, 200));
        desk.focus(main).await.unwrap();
        let snap = svc.perceive(&PerceiveRequest::default()).await.unwrap();
        assert_eq!(snap.active_window_handle(), Some(popup));
    }

    #[tokio::test]
    async fn test_telemetry_sample() {
        let desk = Arc::new(MockDesktop::new());
        desk.add_window("Editor", Rect::new(0, 0, 800, 600));
        let ev = service(&desk).telemetry_sample().await;
        assert!(ev.pointer.is_some());
        assert_eq!(ev.active_window.map(|w| w.title), Some("Editor".to_string()));
    }

    #[tokio::test]
    async fn test_perceive_waits_for_in_flight_execute() {
        let desk = Arc::new(MockDesktop::new());
        desk.add_window("Editor", Rect::new(0, 0, 800, 600));
        let svc = Arc::new(service(&desk));
        let snap = svc.perceive(&PerceiveRequest::default()).await.unwrap();

        desk.set_input_delay(Duration::from_millis(400));
        let started = Instant::now();
        let running = {
            let svc = svc.clone();
            tokio::spawn(async move {
                let keys = Action::Hotkey { keys: vec!["ctrl".into(), "s".into()] };
                svc.execute(&keys, &snap).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // 遥测不排队
        svc.telemetry_sample().await;
        assert!(started.elapsed() < Duration::from_millis(300));

        svc.perceive(&PerceiveRequest::default()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(380));
        assert!(running.is_finished());
        assert!(running.await.unwrap().success);
    }
}
