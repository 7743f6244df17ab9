//! 感知快照数据模型：ObservationElement / PerceptionSnapshot / ElementRef
//!
//! 结构化元素与 OCR 文本元素共用一种类型，用 source 区分；下游（Dispatcher、状态机）无需关心来源。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::geometry::Rect;

/// 给模型的元素列表最大字符数
pub const MAX_PROMPT_CHARS: usize = 30_000;

/// 元素来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Structural,
    OcrText,
}

/// 结构化元素的精确定位句柄（顶层窗口 + automation id + 名称）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementHandle {
    pub window: u64,
    #[serde(default)]
    pub automation_id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationElement {
    pub id: u32,
    pub source: SourceKind,
    pub label: String,
    /// 控件类型（Button / Edit / Text ...）；OCR 元素固定为 "Text"
    pub control_type: String,
    /// 全局桌面坐标
    pub bbox: Rect,
    /// 仅结构化元素有
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<ElementHandle>,
}

/// 顶层窗口信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowInfo {
    pub handle: u64,
    pub title: String,
    pub rect: Rect,
}

/// 一次感知请求的结果；生成后不可变，只会被新快照取代
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerceptionSnapshot {
    pub id: Uuid,
    pub capture_timestamp: DateTime<Utc>,
    pub active_window: Option<WindowInfo>,
    /// 裁剪区域（全局坐标）
    pub cropped_region: Rect,
    pub desktop: Rect,
    pub elements: Vec<ObservationElement>,
    /// 是否强制跑了 OCR（应用被判定为不配合）
    #[serde(default)]
    pub ocr_forced: bool,
    /// 裁剪区域截图（base64 JPEG）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl PerceptionSnapshot {
    pub fn active_window_handle(&self) -> Option<u64> {
        self.active_window.as_ref().map(|w| w.handle)
    }

    pub fn find_by_id(&self, id: u32) -> Option<&ObservationElement> {
        self.elements.iter().find(|e| e.id == id)
    }

    /// 按标签查找（忽略大小写与首尾空白），同名时结构化元素优先
    pub fn find_by_label(&self, label: &str) -> Option<&ObservationElement> {
        let wanted = label.trim().to_lowercase();
        let mut matches = self
            .elements
            .iter()
            .filter(|e| e.label.trim().to_lowercase() == wanted);
        let first = matches.next()?;
        if first.source == SourceKind::Structural {
            return Some(first);
        }
        matches
            .find(|e| e.source == SourceKind::Structural)
            .or(Some(first))
    }

    pub fn resolve(&self, target: &ElementRef) -> Option<&ObservationElement> {
        match target {
            ElementRef::Id(id) => self.find_by_id(*id),
            ElementRef::Label(label) => self.find_by_label(label).or_else(|| {
                // "#12" / "12" 这类写法在没有同名标签时按 id 解析
                label
                    .trim()
                    .trim_start_matches('#')
                    .parse::<u32>()
                    .ok()
                    .and_then(|id| self.find_by_id(id))
            }),
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.find_by_label(label).is_some()
    }

    /// 模型可读的元素列表：`{id}:{label}<{type}>`，以 "; " 分隔并截断
    pub fn to_prompt_text(&self) -> String {
        let mut out = String::new();
        for e in &self.elements {
            let label: String = e.label.chars().filter(|c| !c.is_control()).collect();
            let item = format!("{}:{}<{}>", e.id, label.trim(), e.control_type);
            if !out.is_empty() {
                out.push_str("; ");
            }
            out.push_str(&item);
            if out.len() >= MAX_PROMPT_CHARS {
                let cut = (0..=MAX_PROMPT_CHARS)
                    .rev()
                    .find(|i| out.is_char_boundary(*i))
                    .unwrap_or(0);
                out.truncate(cut);
                out.push_str("...");
                break;
            }
        }
        out
    }
}

/// 动作对元素的引用：数字 id 或标签文本
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ElementRef {
    Id(u32),
    Label(String),
}

impl std::fmt::Display for ElementRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElementRef::Id(id) => write!(f, "#{}", id),
            ElementRef::Label(l) => write!(f, "\"{}\"", l),
        }
    }
}

impl From<u32> for ElementRef {
    fn from(id: u32) -> Self {
        ElementRef::Id(id)
    }
}

impl From<&str> for ElementRef {
    fn from(label: &str) -> Self {
        ElementRef::Label(label.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn el(id: u32, source: SourceKind, label: &str) -> ObservationElement {
        ObservationElement {
            id,
            source,
            label: label.to_string(),
            control_type: "Button".into(),
            bbox: Rect::new(0, 0, 10, 10),
            handle: None,
        }
    }

    fn snapshot(elements: Vec<ObservationElement>) -> PerceptionSnapshot {
        PerceptionSnapshot {
            id: Uuid::new_v4(),
            capture_timestamp: Utc::now(),
            active_window: None,
            cropped_region: Rect::new(0, 0, 100, 100),
            desktop: Rect::new(0, 0, 100, 100),
            elements,
            ocr_forced: false,
            image: None,
        }
    }

    #[test]
    fn test_label_prefers_structural() {
        let snap = snapshot(vec![
            el(9000, SourceKind::OcrText, "OK"),
            el(3, SourceKind::Structural, "ok"),
        ]);
        assert_eq!(snap.resolve(&"OK".into()).unwrap().id, 3);
    }

    #[test]
    fn test_numeric_label_falls_back_to_id() {
        let snap = snapshot(vec![el(12, SourceKind::Structural, "Save")]);
        assert_eq!(snap.resolve(&"#12".into()).unwrap().label, "Save");
        assert!(snap.resolve(&ElementRef::Id(13)).is_none());
    }

    #[test]
    fn test_label_beats_numeric_id() {
        let snap = snapshot(vec![
            el(2, SourceKind::Structural, "Close"),
            el(7, SourceKind::Structural, "2"),
        ]);
        assert_eq!(snap.resolve(&"2".into()).unwrap().id, 7);
    }

    #[test]
    fn test_element_ref_serde() {
        let id: ElementRef = serde_json::from_str("12").unwrap();
        assert_eq!(id, ElementRef::Id(12));
        let label: ElementRef = serde_json::from_str("\"=\"").unwrap();
        assert_eq!(label, ElementRef::Label("=".into()));
    }

    #[test]
    fn test_prompt_text() {
        let snap = snapshot(vec![
            el(0, SourceKind::Structural, "Save"),
            el(9000, SourceKind::OcrText, "File\n"),
        ]);
        assert_eq!(snap.to_prompt_text(), "0:Save<Button>; 9000:File<Button>");
    }

    #[test]
    fn test_prompt_text_truncates() {
        let long = "x".repeat(200);
        let elements = (0..400)
            .map(|i| el(i, SourceKind::Structural, &long))
            .collect();
        let text = snapshot(elements).to_prompt_text();
        assert!(text.len() <= MAX_PROMPT_CHARS + 3);
        assert!(text.ends_with("..."));
    }
}
