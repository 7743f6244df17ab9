//! 屏幕截图：带全局原点的 RGBA 图像，支持裁剪、放大与编码为 JPEG
//!
//! 截图像素 (0,0) 对应全局坐标 origin；裁剪后的子图保留自己的全局原点，OCR 结果据此平移回全局坐标。
//! 给模型的缩略图可叠加元素框与 id 标签（结构化红框、OCR 品红框），模型据此把看到的控件对应到 id。

use std::io::Cursor;

use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgba, RgbaImage};

use super::element::{ObservationElement, SourceKind};
use super::geometry::{Point, Rect};
use crate::core::AgentError;

const STRUCTURAL_MARK: Rgba<u8> = Rgba([0xFF, 0x22, 0x22, 0xFF]);
const OCR_MARK: Rgba<u8> = Rgba([0xFF, 0x00, 0xFF, 0xFF]);
const LABEL_TEXT: Rgba<u8> = Rgba([0xFF, 0xFF, 0xFF, 0xFF]);
const MARK_STROKE: i32 = 2;
/// 3x5 点阵数字放大倍数
const GLYPH_SCALE: i32 = 2;

/// 3x5 点阵数字，每行低 3 位从左到右
const DIGITS: [[u8; 5]; 10] = [
    [0b111, 0b101, 0b101, 0b101, 0b111],
    [0b010, 0b110, 0b010, 0b010, 0b111],
    [0b111, 0b001, 0b111, 0b100, 0b111],
    [0b111, 0b001, 0b111, 0b001, 0b111],
    [0b101, 0b101, 0b111, 0b001, 0b001],
    [0b111, 0b100, 0b111, 0b001, 0b111],
    [0b111, 0b100, 0b111, 0b101, 0b111],
    [0b111, 0b001, 0b010, 0b010, 0b010],
    [0b111, 0b101, 0b111, 0b101, 0b111],
    [0b111, 0b101, 0b111, 0b001, 0b111],
];

#[derive(Debug, Clone)]
pub struct Capture {
    pub image: RgbaImage,
    /// 图像左上角在全局桌面坐标中的位置
    pub origin: Point,
}

impl Capture {
    pub fn new(image: RgbaImage, origin: Point) -> Self {
        Self { image, origin }
    }

    /// 纯色空白截图（测试与无截图后端时使用）
    pub fn blank(bounds: Rect) -> Self {
        let w = bounds.width.max(1) as u32;
        let h = bounds.height.max(1) as u32;
        Self::new(
            RgbaImage::from_pixel(w, h, image::Rgba([0, 0, 0, 255])),
            bounds.origin(),
        )
    }

    /// 截图覆盖的全局区域
    pub fn bounds(&self) -> Rect {
        Rect::new(
            self.origin.x,
            self.origin.y,
            self.image.width() as i32,
            self.image.height() as i32,
        )
    }

    /// 按全局区域裁剪；与截图无交集时返回 None
    pub fn crop(&self, region: &Rect) -> Option<Capture> {
        let r = region.intersection(&self.bounds())?;
        let local_x = (r.x - self.origin.x) as u32;
        let local_y = (r.y - self.origin.y) as u32;
        let sub = image::imageops::crop_imm(
            &self.image,
            local_x,
            local_y,
            r.width as u32,
            r.height as u32,
        )
        .to_image();
        Some(Capture::new(sub, r.origin()))
    }

    /// Lanczos3 放大；factor <= 1.0 时原样返回
    pub fn upscaled(&self, factor: f32) -> RgbaImage {
        if factor <= 1.0 {
            return self.image.clone();
        }
        let w = (self.image.width() as f32 * factor).round() as u32;
        let h = (self.image.height() as f32 * factor).round() as u32;
        image::imageops::resize(&self.image, w.max(1), h.max(1), FilterType::Lanczos3)
    }
}

/// 在截图副本上画出每个元素的边框和 id；origin 为截图左上角的全局坐标，与截图无交集的元素跳过
pub fn annotate_elements(image: &RgbaImage, origin: Point, elements: &[ObservationElement]) -> RgbaImage {
    let mut out = image.clone();
    let bounds = Rect::new(0, 0, out.width() as i32, out.height() as i32);
    for el in elements {
        let local = Rect::new(
            el.bbox.x - origin.x,
            el.bbox.y - origin.y,
            el.bbox.width,
            el.bbox.height,
        );
        let Some(visible) = local.intersection(&bounds) else {
            continue;
        };
        let color = match el.source {
            SourceKind::OcrText => OCR_MARK,
            SourceKind::Structural => STRUCTURAL_MARK,
        };
        draw_outline(&mut out, &visible, color);
        draw_label(&mut out, visible.origin(), el.id, color);
    }
    out
}

fn put(image: &mut RgbaImage, x: i32, y: i32, color: Rgba<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        image.put_pixel(x as u32, y as u32, color);
    }
}

fn draw_outline(image: &mut RgbaImage, r: &Rect, color: Rgba<u8>) {
    for t in 0..MARK_STROKE {
        for x in r.left()..r.right() {
            put(image, x, r.top() + t, color);
            put(image, x, r.bottom() - 1 - t, color);
        }
        for y in r.top()..r.bottom() {
            put(image, r.left() + t, y, color);
            put(image, r.right() - 1 - t, y, color);
        }
    }
}

/// 框左上角的实心底色 + 白色数字
fn draw_label(image: &mut RgbaImage, at: Point, id: u32, background: Rgba<u8>) {
    let text = id.to_string();
    let advance = 4 * GLYPH_SCALE;
    let width = text.len() as i32 * advance + GLYPH_SCALE;
    let height = 7 * GLYPH_SCALE;
    for y in at.y..at.y + height {
        for x in at.x..at.x + width {
            put(image, x, y, background);
        }
    }
    for (i, digit) in text.bytes().enumerate() {
        let glyph = DIGITS[(digit - b'0') as usize];
        let left = at.x + GLYPH_SCALE + i as i32 * advance;
        let top = at.y + GLYPH_SCALE;
        for (row, bits) in glyph.iter().enumerate() {
            for col in 0..3 {
                if bits >> (2 - col) & 1 == 0 {
                    continue;
                }
                for dy in 0..GLYPH_SCALE {
                    for dx in 0..GLYPH_SCALE {
                        put(
                            image,
                            left + col * GLYPH_SCALE + dx,
                            top + row as i32 * GLYPH_SCALE + dy,
                            LABEL_TEXT,
                        );
                    }
                }
            }
        }
    }
}

/// 宽度超过 max_width 时等比缩小，再编码为 base64 JPEG
pub fn encode_jpeg_base64(
    image: &RgbaImage,
    max_width: u32,
    quality: u8,
) -> Result<String, AgentError> {
    let mut dynamic = DynamicImage::ImageRgba8(image.clone());
    if max_width > 0 && dynamic.width() > max_width {
        let ratio = max_width as f32 / dynamic.width() as f32;
        let h = ((dynamic.height() as f32 * ratio).round() as u32).max(1);
        dynamic = dynamic.resize_exact(max_width, h, FilterType::Lanczos3);
    }
    let rgb = dynamic.to_rgb8();
    let mut buf = Cursor::new(Vec::new());
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    encoder
        .encode_image(&rgb)
        .map_err(|e| AgentError::OsOperationFailed(format!("jpeg encode: {}", e)))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(buf.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    #[test]
    fn test_crop_keeps_global_origin() {
        let cap = Capture::blank(Rect::new(-100, 0, 400, 300));
        let sub = cap.crop(&Rect::new(-50, 20, 100, 50)).unwrap();
        assert_eq!(sub.bounds(), Rect::new(-50, 20, 100, 50));
        assert!(cap.crop(&Rect::new(1000, 1000, 5, 5)).is_none());
    }

    #[test]
    fn test_crop_clamps_to_capture() {
        let cap = Capture::blank(Rect::new(0, 0, 200, 100));
        let sub = cap.crop(&Rect::new(150, 50, 100, 100)).unwrap();
        assert_eq!(sub.bounds(), Rect::new(150, 50, 50, 50));
    }

    #[test]
    fn test_upscale() {
        let cap = Capture::blank(Rect::new(0, 0, 40, 20));
        let big = cap.upscaled(2.0);
        assert_eq!((big.width(), big.height()), (80, 40));
        assert_eq!(cap.upscaled(1.0).width(), 40);
    }

    #[test]
    fn test_encode_downscales() {
        let cap = Capture::blank(Rect::new(0, 0, 64, 32));
        let b64 = encode_jpeg_base64(&cap.image, 32, 70).unwrap();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(b64)
            .unwrap();
        let img = image::load_from_memory(&bytes).unwrap();
        assert_eq!(img.width(), 32);
        assert_eq!(img.height(), 16);
    }

    fn element(id: u32, source: SourceKind, bbox: Rect) -> ObservationElement {
        ObservationElement {
            id,
            source,
            label: "x".into(),
            control_type: "Button".into(),
            bbox,
            handle: None,
        }
    }

    #[test]
    fn test_annotate_draws_boxes_and_ids() {
        let cap = Capture::blank(Rect::new(100, 100, 200, 100));
        let marked = annotate_elements(
            &cap.image,
            cap.origin,
            &[
                element(3, SourceKind::Structural, Rect::new(120, 130, 60, 40)),
                element(9000, SourceKind::OcrText, Rect::new(200, 120, 80, 30)),
                element(4, SourceKind::Structural, Rect::new(900, 900, 10, 10)),
            ],
        );
        // 全局 (120,130) 的框落在局部 (20,30)；右下边框
        assert_eq!(*marked.get_pixel(79, 69), STRUCTURAL_MARK);
        assert_eq!(*marked.get_pixel(50, 55), Rgba([0, 0, 0, 255]));
        assert_eq!(*marked.get_pixel(179, 49), OCR_MARK);
        // 标签：底色 + 白色数字笔画
        assert_eq!(*marked.get_pixel(21, 31), STRUCTURAL_MARK);
        assert!(marked.pixels().any(|p| *p == LABEL_TEXT));
        // 原图不变
        assert!(cap.image.pixels().all(|p| *p == Rgba([0, 0, 0, 255])));
    }

    #[test]
    fn test_annotate_clips_partial_boxes() {
        let cap = Capture::blank(Rect::new(0, 0, 50, 50));
        let marked = annotate_elements(
            &cap.image,
            cap.origin,
            &[element(7, SourceKind::OcrText, Rect::new(-20, 30, 40, 40))],
        );
        assert_eq!(*marked.get_pixel(19, 49), OCR_MARK);
        assert_eq!((marked.width(), marked.height()), (50, 50));
    }
}
