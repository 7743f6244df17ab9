//! 混合感知引擎：结构化 UI 树 + OCR 合并到同一全局坐标系
//!
//! 结构化路径给出精确坐标与句柄，优先使用；树为空、有意义节点太少或应用被判定为不配合时再跑 OCR。
//! 两路结果按「结构化在前、OCR 在后」拼接，引擎本身不去重，去重由 resolve_duplicates 作为独立步骤处理。

use std::sync::Arc;

use chrono::Utc;
use regex::Regex;
use uuid::Uuid;

use super::capture::{annotate_elements, encode_jpeg_base64};
use super::element::{ElementHandle, ObservationElement, PerceptionSnapshot, SourceKind, WindowInfo};
use super::geometry::{Point, Rect};
use super::providers::{OcrProvider, StructuralNode};
use super::viewport::FocusedCapture;
use crate::config::{DedupPolicy, PerceptionSection};

/// OCR 元素 id 的最小起点
pub const OCR_ID_BASE: u32 = 9000;

/// 不计入「有意义」的容器类型
const CONTAINER_TYPES: &[&str] = &["Window", "Pane"];

/// 中心落在这些结构化控件内的 OCR 文本视为重复
const BLOCKER_TYPES: &[&str] = &[
    "Button", "Edit", "CheckBox", "RadioButton", "ComboBox", "List", "ListItem", "MenuItem",
    "TabItem", "Hyperlink", "TreeItem", "DataItem", "HeaderItem", "Document", "Text", "TitleBar",
];

/// 嵌套过滤的边缘容差（像素）
const NESTED_TOLERANCE: i32 = 5;
/// 小元素覆盖大元素面积超过此比例时，大元素视为冗余
const NESTED_COVERAGE: f64 = 0.80;

/// 一次感知所需的输入
pub struct PerceptionInput<'a> {
    pub focused: &'a FocusedCapture,
    pub tree: Option<&'a StructuralNode>,
    pub active_window: Option<WindowInfo>,
    pub desktop: Rect,
    pub non_cooperative: bool,
}

pub struct PerceptionEngine {
    ocr: Arc<dyn OcrProvider>,
    config: PerceptionSection,
}

impl PerceptionEngine {
    pub fn new(ocr: Arc<dyn OcrProvider>, config: PerceptionSection) -> Self {
        Self { ocr, config }
    }

    pub fn config(&self) -> &PerceptionSection {
        &self.config
    }

    /// 生成快照；任何一路没有产出都不是错误，两路都为空时返回空元素列表
    pub async fn perceive(&self, input: PerceptionInput<'_>) -> PerceptionSnapshot {
        let region = input.focused.region();
        let window_handle = input.active_window.as_ref().map(|w| w.handle).unwrap_or(0);

        let nodes = input
            .tree
            .map(|t| structural_candidates(t, &region))
            .unwrap_or_default();
        let meaningful = nodes
            .iter()
            .filter(|n| !CONTAINER_TYPES.contains(&n.control_type.as_str()))
            .count();

        let mut elements: Vec<ObservationElement> = filter_nested(nodes)
            .into_iter()
            .filter_map(|n| {
                let bbox = n.rect.clamp_to(&input.desktop);
                (!bbox.is_empty()).then(|| (n, bbox))
            })
            .enumerate()
            .map(|(i, (n, bbox))| ObservationElement {
                id: i as u32,
                source: SourceKind::Structural,
                label: n.name.trim().to_string(),
                control_type: n.control_type.clone(),
                bbox,
                handle: Some(ElementHandle {
                    window: window_handle,
                    automation_id: n.automation_id.clone(),
                    name: n.name.clone(),
                }),
            })
            .collect();

        let run_ocr = input.non_cooperative || meaningful < self.config.min_meaningful_elements;
        if run_ocr {
            tracing::debug!(
                meaningful,
                non_cooperative = input.non_cooperative,
                "running ocr pass"
            );
            let start_id = next_ocr_id(elements.last().map(|e| e.id));
            match self.ocr.recognize(&input.focused.ocr_image).await {
                Ok(boxes) => {
                    let origin = region.origin();
                    let scale = input.focused.scale;
                    let ocr_elements = boxes
                        .into_iter()
                        .filter(|b| !b.text.trim().is_empty())
                        .filter_map(|b| {
                            let bbox = to_global(b.rect, scale, origin).clamp_to(&input.desktop);
                            (!bbox.is_empty()).then(|| (b.text.trim().to_string(), bbox))
                        })
                        .enumerate()
                        .map(|(i, (label, bbox))| ObservationElement {
                            id: start_id + i as u32,
                            source: SourceKind::OcrText,
                            label,
                            control_type: "Text".to_string(),
                            bbox,
                            handle: None,
                        });
                    elements.extend(ocr_elements);
                }
                Err(e) => tracing::warn!(error = %e, "ocr pass failed"),
            }
        }

        tracing::info!(
            structural = elements.iter().filter(|e| e.source == SourceKind::Structural).count(),
            ocr = elements.iter().filter(|e| e.source == SourceKind::OcrText).count(),
            region = ?region,
            "perceived"
        );

        PerceptionSnapshot {
            id: Uuid::new_v4(),
            capture_timestamp: Utc::now(),
            active_window: input.active_window,
            cropped_region: region,
            desktop: input.desktop,
            elements,
            ocr_forced: input.non_cooperative,
            image: None,
        }
    }

    /// 去重之后附上裁剪图（JPEG base64），按配置叠加元素框与 id
    pub fn attach_image(
        &self,
        mut snapshot: PerceptionSnapshot,
        focused: &FocusedCapture,
        requested: bool,
    ) -> PerceptionSnapshot {
        if !(requested || self.config.include_image) {
            return snapshot;
        }
        let capture = &focused.capture;
        let marked;
        let image = if self.config.annotate_image {
            marked = annotate_elements(&capture.image, capture.origin, &snapshot.elements);
            &marked
        } else {
            &capture.image
        };
        match encode_jpeg_base64(image, self.config.max_image_width, self.config.jpeg_quality) {
            Ok(b64) => snapshot.image = Some(b64),
            Err(e) => tracing::warn!(error = %e, "snapshot image encode failed"),
        }
        snapshot
    }

    /// 标题命中关键词（整词、忽略大小写）时视为不配合的应用
    pub fn is_non_cooperative(&self, title: &str) -> bool {
        is_non_cooperative(title, &self.config.non_cooperative_keywords)
    }

    pub fn resolve_duplicates(&self, snapshot: PerceptionSnapshot) -> PerceptionSnapshot {
        resolve_duplicates(
            snapshot,
            self.config.dedup,
            self.config.dedup_iou_threshold,
        )
    }
}

/// OCR id 起点：max(9000, 最后一个结构化 id + 100)
pub fn next_ocr_id(last_structural: Option<u32>) -> u32 {
    last_structural
        .map(|id| id.saturating_add(100))
        .unwrap_or(0)
        .max(OCR_ID_BASE)
}

/// 图像局部坐标 -> 全局坐标：先撤销放大，再加裁剪原点
pub fn to_global(local: Rect, scale: f32, origin: Point) -> Rect {
    let unscaled = if scale > 1.0 {
        local.scale(1.0 / scale)
    } else {
        local
    };
    unscaled.translate(origin)
}

pub fn is_non_cooperative(title: &str, keywords: &[String]) -> bool {
    keywords.iter().filter(|k| !k.trim().is_empty()).any(|k| {
        Regex::new(&format!(r"(?i)\b{}\b", regex::escape(k.trim())))
            .map(|re| re.is_match(title))
            .unwrap_or(false)
    })
}

/// 展开结构化树，只保留有面积且中心在视口内的节点
fn structural_candidates<'a>(tree: &'a StructuralNode, region: &Rect) -> Vec<&'a StructuralNode> {
    tree.flatten()
        .into_iter()
        .filter(|n| !n.rect.is_empty() && region.contains_point(n.rect.center()))
        .collect()
}

/// 嵌套冗余过滤：从小到大检查，若已保留的小元素落在当前元素内且覆盖率 > 80%，当前（更大的）元素丢弃。
/// 输出保持输入顺序。
pub fn filter_nested(nodes: Vec<&StructuralNode>) -> Vec<&StructuralNode> {
    let mut order: Vec<usize> = (0..nodes.len()).collect();
    order.sort_by_key(|&i| nodes[i].rect.area());

    let mut kept: Vec<usize> = Vec::new();
    for i in order {
        let current = nodes[i].rect;
        let area = current.area();
        if area <= 0 {
            continue;
        }
        let tolerant = current.expand(NESTED_TOLERANCE);
        let redundant = kept.iter().any(|&k| {
            let inner = nodes[k].rect;
            tolerant.contains_rect(&inner) && (inner.area() as f64 / area as f64) > NESTED_COVERAGE
        });
        if !redundant {
            kept.push(i);
        }
    }
    kept.sort_unstable();
    kept.into_iter().map(|i| nodes[i]).collect()
}

/// 去重：按策略丢弃与结构化元素重复的 OCR 元素，返回新快照
pub fn resolve_duplicates(
    mut snapshot: PerceptionSnapshot,
    policy: DedupPolicy,
    iou_threshold: f32,
) -> PerceptionSnapshot {
    if policy == DedupPolicy::KeepAll {
        return snapshot;
    }
    let structural: Vec<(Rect, bool)> = snapshot
        .elements
        .iter()
        .filter(|e| e.source == SourceKind::Structural)
        .map(|e| (e.bbox, BLOCKER_TYPES.contains(&e.control_type.as_str())))
        .collect();
    if structural.is_empty() {
        return snapshot;
    }
    let use_blockers = !snapshot.ocr_forced;
    let before = snapshot.elements.len();
    snapshot.elements.retain(|e| {
        if e.source != SourceKind::OcrText {
            return true;
        }
        let center = e.bbox.center();
        !structural.iter().any(|(rect, blocker)| {
            (use_blockers && *blocker && rect.contains_point(center))
                || rect.iou(&e.bbox) >= iou_threshold
        })
    });
    let dropped = before - snapshot.elements.len();
    if dropped > 0 {
        tracing::debug!(dropped, "ocr duplicates removed");
    }
    snapshot
}
