//! 感知层：几何、截图、平台接口、视口聚焦、混合感知引擎、弹窗焦点跟踪

pub mod capture;
pub mod element;
pub mod engine;
pub mod focus;
pub mod geometry;
pub mod providers;
pub mod viewport;

pub use capture::{encode_jpeg_base64, Capture};
pub use element::{
    ElementHandle, ElementRef, ObservationElement, PerceptionSnapshot, SourceKind, WindowInfo,
};
pub use engine::{resolve_duplicates, PerceptionEngine, PerceptionInput};
pub use focus::{FocusChange, FocusTracker};
pub use geometry::{Point, Rect};
pub use providers::{
    OcrBox, OcrProvider, PlatformResult, ScreenSource, StructuralNode, StructuralProvider,
    Unavailable, WindowProvider,
};
pub use viewport::{FocusedCapture, ViewportSelector};
