//! 认知端与执行端之间的双工通道：长度前缀 JSON 帧、HMAC 握手、请求关联与遥测推送

pub mod auth;
pub mod client;
pub mod frame;
pub mod message;
pub mod server;

pub use auth::{client_handshake, server_handshake};
pub use client::ChannelClient;
pub use frame::{read_frame, write_frame, ChannelError, ErrorPayload, Frame, FrameKind, MAX_FRAME_LEN};
pub use message::{
    ExecuteRequest, ExecuteResponse, PerceiveRequest, PerceiveResponse, ShutdownNotice,
    TelemetryEvent, WindowListResponse,
};
pub use server::HostServer;
