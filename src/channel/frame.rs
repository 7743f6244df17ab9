//! 通道帧编解码
//!
//! 线格式：4 字节大端长度 + JSON 帧体 `{kind, correlation_id, payload}`。长度为 0 或超过 16 MiB 的帧直接拒绝。
//! correlation_id 为 0 表示不需要响应（遥测等单向消息）。

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::{AgentError, ErrorKind};

/// 单帧最大字节数
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    // 握手
    Challenge,
    ChallengeResponse,
    AuthResult,
    // 请求 / 响应
    PerceiveRequest,
    PerceiveResponse,
    ExecuteRequest,
    ExecuteResponse,
    WindowListRequest,
    WindowListResponse,
    Ping,
    Pong,
    /// 请求失败时代替正常响应
    Error,
    // 单向
    TelemetryEvent,
    Shutdown,
}

impl FrameKind {
    /// 请求对应的响应类型；单向消息与响应本身返回 None
    pub fn response_kind(self) -> Option<FrameKind> {
        match self {
            FrameKind::PerceiveRequest => Some(FrameKind::PerceiveResponse),
            FrameKind::ExecuteRequest => Some(FrameKind::ExecuteResponse),
            FrameKind::WindowListRequest => Some(FrameKind::WindowListResponse),
            FrameKind::Ping => Some(FrameKind::Pong),
            _ => None,
        }
    }

    pub fn is_response(self) -> bool {
        matches!(
            self,
            FrameKind::PerceiveResponse
                | FrameKind::ExecuteResponse
                | FrameKind::WindowListResponse
                | FrameKind::Pong
                | FrameKind::Error
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub kind: FrameKind,
    #[serde(default)]
    pub correlation_id: u64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Frame {
    pub fn new<T: Serialize>(kind: FrameKind, correlation_id: u64, payload: &T) -> Result<Self, ChannelError> {
        let payload = serde_json::to_value(payload).map_err(|e| ChannelError::Codec(e.to_string()))?;
        Ok(Self {
            kind,
            correlation_id,
            payload,
        })
    }

    pub fn empty(kind: FrameKind, correlation_id: u64) -> Self {
        Self {
            kind,
            correlation_id,
            payload: serde_json::Value::Null,
        }
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ChannelError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| ChannelError::Codec(format!("{:?} payload: {}", self.kind, e)))
    }
}

/// Error 帧的负载
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("empty frame")]
    EmptyFrame,

    #[error("codec: {0}")]
    Codec(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("channel closed")]
    Closed,

    #[error("request {0} timed out")]
    Timeout(u64),

    #[error("remote {kind}: {message}")]
    Remote { kind: ErrorKind, message: String },
}

impl From<ChannelError> for AgentError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Timeout(_) => AgentError::Timeout(e.to_string()),
            ChannelError::Remote { kind, message } => AgentError::from_kind(kind, message),
            other => AgentError::ChannelFault(other.to_string()),
        }
    }
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(frame).map_err(|e| ChannelError::Codec(e.to_string()))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ChannelError::FrameTooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, ChannelError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(n) => n as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(ChannelError::Closed),
        Err(e) => return Err(ChannelError::Io(e)),
    };
    if len == 0 {
        return Err(ChannelError::EmptyFrame);
    }
    if len > MAX_FRAME_LEN {
        return Err(ChannelError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ChannelError::Closed
        } else {
            ChannelError::Io(e)
        }
    })?;
    serde_json::from_slice(&body).map_err(|e| ChannelError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_in_order() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        for id in 1..=3u64 {
            let f = Frame::new(FrameKind::Ping, id, &serde_json::json!({"n": id})).unwrap();
            write_frame(&mut a, &f).await.unwrap();
        }
        for id in 1..=3u64 {
            let f = read_frame(&mut b).await.unwrap();
            assert_eq!(f.correlation_id, id);
            assert_eq!(f.payload["n"], id);
        }
    }

    #[tokio::test]
    async fn test_length_prefix_is_big_endian() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &Frame::empty(FrameKind::Shutdown, 0)).await.unwrap();
        let mut prefix = [0u8; 4];
        b.read_exact(&mut prefix).await.unwrap();
        let len = u32::from_be_bytes(prefix) as usize;
        let mut body = vec![0u8; len];
        b.read_exact(&mut body).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["kind"], "shutdown");
    }

    #[tokio::test]
    async fn test_reject_bad_lengths() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&0u32.to_be_bytes()).await.unwrap();
        assert!(matches!(read_frame(&mut b).await, Err(ChannelError::EmptyFrame)));
        a.write_all(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes()).await.unwrap();
        assert!(matches!(read_frame(&mut b).await, Err(ChannelError::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn test_eof_is_closed() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(read_frame(&mut b).await, Err(ChannelError::Closed)));
    }

    #[test]
    fn test_error_mapping() {
        let e: AgentError = ChannelError::Timeout(7).into();
        assert_eq!(e.kind(), ErrorKind::Timeout);
        let e: AgentError = ChannelError::Closed.into();
        assert_eq!(e.kind(), ErrorKind::ChannelFault);
        let e: AgentError = ChannelError::Remote {
            kind: ErrorKind::OsOperationFailed,
            message: "capture".into(),
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::OsOperationFailed);
    }

    #[test]
    fn test_response_kinds() {
        assert_eq!(
            FrameKind::ExecuteRequest.response_kind(),
            Some(FrameKind::ExecuteResponse)
        );
        assert_eq!(FrameKind::TelemetryEvent.response_kind(), None);
        assert!(FrameKind::Error.is_response());
    }
}
