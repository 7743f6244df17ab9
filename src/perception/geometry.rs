//! 全局桌面坐标系下的点与矩形
//!
//! 所有快照元素都以全局桌面坐标（像素，原点为主显示器左上角）表达；整数运算保证平移可逆、无舍入误差。

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn offset(self, dx: i32, dy: i32) -> Self {
        Self::new(self.x + dx, self.y + dy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// 由左上 / 右下角构造，宽高为负时取 0
    pub fn from_ltrb(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self::new(left, top, (right - left).max(0), (bottom - top).max(0))
    }

    pub fn left(&self) -> i32 {
        self.x
    }

    pub fn top(&self) -> i32 {
        self.y
    }

    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    pub fn origin(&self) -> Point {
        Point::new(self.x, self.y)
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2, self.y + self.height / 2)
    }

    pub fn area(&self) -> i64 {
        i64::from(self.width.max(0)) * i64::from(self.height.max(0))
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// 平移（局部坐标 -> 全局坐标时传入裁剪原点）
    pub fn translate(&self, by: Point) -> Self {
        Self::new(self.x + by.x, self.y + by.y, self.width, self.height)
    }

    pub fn contains_point(&self, p: Point) -> bool {
        p.x >= self.left() && p.x < self.right() && p.y >= self.top() && p.y < self.bottom()
    }

    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.left() >= self.left()
            && other.top() >= self.top()
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// 四边各外扩 margin（可为负）
    pub fn expand(&self, margin: i32) -> Self {
        Self::from_ltrb(
            self.left() - margin,
            self.top() - margin,
            self.right() + margin,
            self.bottom() + margin,
        )
    }

    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let r = Rect::from_ltrb(
            self.left().max(other.left()),
            self.top().max(other.top()),
            self.right().min(other.right()),
            self.bottom().min(other.bottom()),
        );
        (!r.is_empty()).then_some(r)
    }

    /// 裁剪到 bounds 内；完全在外时返回 bounds 左上角的零面积矩形
    pub fn clamp_to(&self, bounds: &Rect) -> Rect {
        self.intersection(bounds)
            .unwrap_or_else(|| Rect::new(bounds.x, bounds.y, 0, 0))
    }

    pub fn iou(&self, other: &Rect) -> f32 {
        let inter = match self.intersection(other) {
            Some(r) => r.area(),
            None => return 0.0,
        };
        let union = self.area() + other.area() - inter;
        if union <= 0 {
            0.0
        } else {
            inter as f32 / union as f32
        }
    }

    /// 按比例缩放（用于撤销放大）
    pub fn scale(&self, factor: f32) -> Rect {
        let f = |v: i32| (v as f32 * factor).round() as i32;
        Rect::new(f(self.x), f(self.y), f(self.width), f(self.height))
    }
}
