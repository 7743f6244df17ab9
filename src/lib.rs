//! deskpilot - 桌面操作智能体
//!
//! 两个进程通过认证的双工通道通信：
//! - **认知端**（`deskpilot`）：冲刺状态机，规划 → 执行 → 验证
//! - **执行端**（`deskpilot-host`）：混合感知与动作分发
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、状态投影、会话监管、关闭管理、编排循环
//! - **perception**: 几何、截图、视口聚焦、结构化 + OCR 混合感知、弹窗焦点跟踪
//! - **dispatch**: 动作模型与分发（输入、启动应用、Shell、写文件）
//! - **channel**: 长度前缀 JSON 帧、HMAC 握手、请求关联与遥测
//! - **host**: 执行端服务、进程内执行端与模拟桌面
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / 脚本化 Mock）
//! - **sprint**: Goal、GroundingNotes、推理服务与冲刺状态机

pub mod channel;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod host;
pub mod llm;
pub mod observability;
pub mod perception;
pub mod sprint;
