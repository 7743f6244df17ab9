//! 内存中的模拟桌面：同时实现截图、结构化树、OCR、窗口、输入、句柄操作与应用启动接口
//!
//! 用于测试与 `deskpilot-host --mock` 演示。OCR 文本框以「裁剪图局部坐标」保存，与真实 OCR 引擎的输出一致。
//! 通过 hook 可以让输入事件改变场景（例如点击「=」后显示结果）。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use image::RgbaImage;

use crate::dispatch::{AppLauncher, InputProvider, MouseButton, StructuralActuator};
use crate::perception::{
    Capture, ElementHandle, OcrBox, OcrProvider, PlatformResult, Point, Rect, ScreenSource,
    StructuralNode, StructuralProvider, WindowInfo, WindowProvider,
};

/// 记录下来的输入事件
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    Move(Point),
    Click(Point),
    Type(String),
    Keys(Vec<String>),
    Invoke(ElementHandle),
    FocusElement(ElementHandle),
    SetText(ElementHandle, String),
    Launch(String),
    Focus(u64),
    Close(u64),
}

/// hook 可修改的场景
#[derive(Debug, Default)]
pub struct MockScene {
    pub windows: Vec<WindowInfo>,
    pub active: Option<u64>,
    pub trees: HashMap<u64, StructuralNode>,
    /// 裁剪图局部坐标
    pub ocr: Vec<OcrBox>,
    pub app_index: BTreeMap<String, String>,
    next_handle: u64,
}

impl MockScene {
    pub fn add_window(&mut self, title: &str, rect: Rect) -> u64 {
        self.next_handle += 1;
        let handle = 0x1000 + self.next_handle;
        self.windows.push(WindowInfo {
            handle,
            title: title.to_string(),
            rect,
        });
        self.active = Some(handle);
        handle
    }

    pub fn remove_window(&mut self, handle: u64) {
        self.windows.retain(|w| w.handle != handle);
        self.trees.remove(&handle);
        if self.active == Some(handle) {
            self.active = self.windows.last().map(|w| w.handle);
        }
    }
}

type Hook = Arc<dyn Fn(&InputEvent, &mut MockScene) + Send + Sync>;

struct MockState {
    desktop: Rect,
    pointer: Point,
    scene: MockScene,
    launches: HashMap<String, (String, Rect)>,
    events: Vec<InputEvent>,
    hooks: Vec<Hook>,
    input_delay: Duration,
}

pub struct MockDesktop {
    state: Mutex<MockState>,
}

impl Default for MockDesktop {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDesktop {
    pub fn new() -> Self {
        Self::with_desktop(Rect::new(0, 0, 1280, 800))
    }

    pub fn with_desktop(desktop: Rect) -> Self {
        Self {
            state: Mutex::new(MockState {
                desktop,
                pointer: desktop.center(),
                scene: MockScene::default(),
                launches: HashMap::new(),
                events: Vec::new(),
                hooks: Vec::new(),
                input_delay: Duration::ZERO,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_window(&self, title: &str, rect: Rect) -> u64 {
        self.lock().scene.add_window(title, rect)
    }

    pub fn set_tree(&self, window: u64, tree: StructuralNode) {
        self.lock().scene.trees.insert(window, tree);
    }

    pub fn set_ocr(&self, boxes: Vec<OcrBox>) {
        self.lock().scene.ocr = boxes;
    }

    pub fn set_app_index(&self, index: BTreeMap<String, String>) {
        self.lock().scene.app_index = index;
    }

    /// 启动 command 时出现标题为 title 的新窗口
    pub fn on_launch(&self, command: &str, title: &str, rect: Rect) {
        self.lock()
            .launches
            .insert(command.to_string(), (title.to_string(), rect));
    }

    pub fn add_hook<F>(&self, hook: F)
    where
        F: Fn(&InputEvent, &mut MockScene) + Send + Sync + 'static,
    {
        self.lock().hooks.push(Arc::new(hook));
    }

    /// 每个输入原语额外耗时（模拟慢操作）
    pub fn set_input_delay(&self, delay: Duration) {
        self.lock().input_delay = delay;
    }

    pub fn events(&self) -> Vec<InputEvent> {
        self.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.lock().events.clear();
    }

    pub fn active_title(&self) -> Option<String> {
        let st = self.lock();
        let active = st.scene.active?;
        st.scene
            .windows
            .iter()
            .find(|w| w.handle == active)
            .map(|w| w.title.clone())
    }

    /// 记录事件并依次执行 hook，返回需要等待的延时
    fn record(&self, event: InputEvent) -> Duration {
        let mut guard = self.lock();
        let st = &mut *guard;
        for hook in &st.hooks {
            hook(&event, &mut st.scene);
        }
        st.events.push(event);
        st.input_delay
    }

    async fn record_input(&self, event: InputEvent) {
        let delay = self.record(event);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// 演示计算器窗口位置
pub const CALCULATOR_RECT: Rect = Rect::new(100, 100, 320, 420);

impl MockDesktop {
    /// 演示场景：启动 calc.exe 后出现计算器窗口，按键经 hook 更新显示屏文本（只能由 OCR 读到）
    pub fn calculator_demo() -> Self {
        let desk = Self::new();
        desk.on_launch("calc.exe", "Calculator", CALCULATOR_RECT);
        let expr = Mutex::new(String::new());
        desk.add_hook(move |event, scene| match event {
            InputEvent::Launch(cmd) if cmd == "calc.exe" => {
                let Some(win) = scene.windows.iter().rev().find(|w| w.title == "Calculator") else {
                    return;
                };
                let handle = win.handle;
                scene.trees.insert(handle, calculator_tree());
                scene.ocr = vec![display_box("0")];
            }
            InputEvent::Invoke(h) => {
                let mut expr = expr.lock().unwrap_or_else(|p| p.into_inner());
                let shown = match h.name.as_str() {
                    "=" => {
                        let total: i64 = expr
                            .split('+')
                            .filter_map(|t| t.trim().parse::<i64>().ok())
                            .sum();
                        expr.clear();
                        total.to_string()
                    }
                    "C" => {
                        expr.clear();
                        "0".to_string()
                    }
                    key => {
                        expr.push_str(key);
                        expr.clone()
                    }
                };
                scene.ocr = vec![display_box(&shown)];
            }
            _ => {}
        });
        desk
    }
}

/// 按键控件；显示屏不在结构化树里
fn calculator_tree() -> StructuralNode {
    let r = CALCULATOR_RECT;
    let keys = ["2", "+", "=", "C"];
    let children = keys
        .iter()
        .enumerate()
        .map(|(i, k)| {
            StructuralNode::new(*k, "Button", Rect::new(r.x + 20 + i as i32 * 70, r.y + 300, 60, 60))
                .with_automation_id(format!("key_{}", i))
        })
        .collect();
    StructuralNode::new("Calculator", "Window", r).with_children(children)
}

/// 显示屏文本框（裁剪图局部坐标）
fn display_box(text: &str) -> OcrBox {
    OcrBox::new(text, Rect::new(60, 60, 240, 50))
}

#[async_trait]
impl ScreenSource for MockDesktop {
    async fn desktop_bounds(&self) -> PlatformResult<Rect> {
        Ok(self.lock().desktop)
    }

    async fn capture(&self) -> PlatformResult<Capture> {
        let desktop = self.lock().desktop;
        Ok(Capture::blank(desktop))
    }

    async fn pointer(&self) -> PlatformResult<Point> {
        Ok(self.lock().pointer)
    }
}

#[async_trait]
impl StructuralProvider for MockDesktop {
    async fn tree(&self, window: u64) -> PlatformResult<Option<StructuralNode>> {
        Ok(self.lock().scene.trees.get(&window).cloned())
    }
}

#[async_trait]
impl OcrProvider for MockDesktop {
    async fn recognize(&self, _image: &RgbaImage) -> PlatformResult<Vec<OcrBox>> {
        Ok(self.lock().scene.ocr.clone())
    }
}

#[async_trait]
impl WindowProvider for MockDesktop {
    async fn active_window(&self) -> PlatformResult<Option<WindowInfo>> {
        let st = self.lock();
        Ok(st
            .scene
            .active
            .and_then(|h| st.scene.windows.iter().find(|w| w.handle == h).cloned()))
    }

    async fn list_windows(&self) -> PlatformResult<Vec<WindowInfo>> {
        Ok(self.lock().scene.windows.clone())
    }

    async fn focus(&self, handle: u64) -> PlatformResult<()> {
        {
            let mut st = self.lock();
            if !st.scene.windows.iter().any(|w| w.handle == handle) {
                return Err(format!("no window {:#x}", handle));
            }
            st.scene.active = Some(handle);
        }
        self.record_input(InputEvent::Focus(handle)).await;
        Ok(())
    }

    async fn close(&self, handle: u64) -> PlatformResult<()> {
        self.lock().scene.remove_window(handle);
        self.record_input(InputEvent::Close(handle)).await;
        Ok(())
    }
}

#[async_trait]
impl InputProvider for MockDesktop {
    async fn move_mouse(&self, to: Point) -> PlatformResult<()> {
        self.lock().pointer = to;
        self.record_input(InputEvent::Move(to)).await;
        Ok(())
    }

    async fn click(&self, at: Point, _button: MouseButton) -> PlatformResult<()> {
        self.lock().pointer = at;
        self.record_input(InputEvent::Click(at)).await;
        Ok(())
    }

    async fn type_text(&self, text: &str) -> PlatformResult<()> {
        self.record_input(InputEvent::Type(text.to_string())).await;
        Ok(())
    }

    async fn key_combo(&self, keys: &[String]) -> PlatformResult<()> {
        self.record_input(InputEvent::Keys(keys.to_vec())).await;
        Ok(())
    }
}

#[async_trait]
impl StructuralActuator for MockDesktop {
    async fn focus_element(&self, handle: &ElementHandle) -> PlatformResult<()> {
        self.record_input(InputEvent::FocusElement(handle.clone())).await;
        Ok(())
    }

    async fn invoke(&self, handle: &ElementHandle) -> PlatformResult<()> {
        self.record_input(InputEvent::Invoke(handle.clone())).await;
        Ok(())
    }

    async fn set_text(&self, handle: &ElementHandle, text: &str) -> PlatformResult<()> {
        self.record_input(InputEvent::SetText(handle.clone(), text.to_string()))
            .await;
        Ok(())
    }

    async fn window_exists(&self, window: u64) -> PlatformResult<bool> {
        Ok(self.lock().scene.windows.iter().any(|w| w.handle == window))
    }
}

#[async_trait]
impl AppLauncher for MockDesktop {
    async fn index(&self) -> PlatformResult<BTreeMap<String, String>> {
        Ok(self.lock().scene.app_index.clone())
    }

    async fn spawn(&self, command: &str) -> PlatformResult<()> {
        {
            let mut st = self.lock();
            if let Some((title, rect)) = st.launches.get(command).cloned() {
                st.scene.add_window(&title, rect);
            }
        }
        self.record_input(InputEvent::Launch(command.to_string())).await;
        Ok(())
    }
}
