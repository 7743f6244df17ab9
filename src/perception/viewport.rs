//! 视口聚焦：选出活动窗口区域并生成裁剪、放大后的截图
//!
//! 只感知活动窗口会看不到窗口外的元素，换来更高的有效分辨率与更少的无关上下文。

use image::RgbaImage;

use super::capture::Capture;
use super::element::WindowInfo;
use super::geometry::Rect;

/// 窗口裁剪后宽高都必须大于此值，否则退回整个桌面
pub const MIN_VIEWPORT_SIDE: i32 = 20;

/// 裁剪并（可选）放大后的截图
#[derive(Debug, Clone)]
pub struct FocusedCapture {
    /// 原始分辨率的裁剪图，origin 即裁剪区域的全局原点
    pub capture: Capture,
    /// 交给 OCR 的图像（可能已放大）
    pub ocr_image: RgbaImage,
    /// ocr_image 相对 capture 的放大倍数
    pub scale: f32,
}

impl FocusedCapture {
    pub fn region(&self) -> Rect {
        self.capture.bounds()
    }
}

#[derive(Debug, Clone)]
pub struct ViewportSelector {
    margin: i32,
    upscale: f32,
}

impl ViewportSelector {
    pub fn new(margin: i32, upscale: f32) -> Self {
        Self {
            margin: margin.max(0),
            upscale: if upscale.is_finite() && upscale >= 1.0 {
                upscale
            } else {
                1.0
            },
        }
    }

    /// 活动窗口外扩 margin 并裁到桌面内；无活动窗口或窗口过小时返回整个桌面
    pub fn select_viewport(&self, active: Option<&WindowInfo>, desktop: Rect) -> Rect {
        let Some(window) = active else {
            return desktop;
        };
        let region = window.rect.expand(self.margin).clamp_to(&desktop);
        if region.width <= MIN_VIEWPORT_SIDE || region.height <= MIN_VIEWPORT_SIDE {
            tracing::debug!(handle = window.handle, "viewport too small, using desktop");
            return desktop;
        }
        region
    }

    /// 裁剪到 region 并按配置放大
    pub fn focus(&self, capture: &Capture, region: Rect) -> FocusedCapture {
        let cropped = capture.crop(&region).unwrap_or_else(|| capture.clone());
        let ocr_image = cropped.upscaled(self.upscale);
        let scale = if self.upscale > 1.0 { self.upscale } else { 1.0 };
        FocusedCapture {
            capture: cropped,
            ocr_image,
            scale,
        }
    }
}
