//! 认知端通道客户端
//!
//! 一条 TCP 连接上同时承载多路请求：写任务从 mpsc 取帧写出，读任务按 correlation_id 把响应交给等待者，
//! 遥测帧转发到 broadcast。每个请求有截止时间，超时后等待者被移除，迟到的响应直接丢弃。
//! 连接断开时所有未完成请求立即以 ChannelFault 失败。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::auth::client_handshake;
use super::frame::{read_frame, write_frame, ChannelError, ErrorPayload, Frame, FrameKind};
use super::message::{
    ExecuteRequest, ExecuteResponse, PerceiveRequest, PerceiveResponse, ShutdownNotice,
    TelemetryEvent, WindowListResponse,
};
use crate::config::IpcSection;
use crate::core::{AgentError, ErrorKind};
use crate::dispatch::{Action, ActionResult};
use crate::host::ExecutionHost;
use crate::perception::{PerceptionSnapshot, WindowInfo};

const OUTBOUND_CAPACITY: usize = 64;
const TELEMETRY_CAPACITY: usize = 64;

#[derive(Default)]
struct Pending {
    waiters: HashMap<u64, oneshot::Sender<Frame>>,
    closed: bool,
}

type SharedPending = Arc<Mutex<Pending>>;

fn lock(p: &SharedPending) -> MutexGuard<'_, Pending> {
    p.lock().unwrap_or_else(|e| e.into_inner())
}

/// 标记关闭并丢弃所有等待者（接收端随即得到 RecvError）
fn fail_all(p: &SharedPending) {
    let mut guard = lock(p);
    guard.closed = true;
    guard.waiters.clear();
}

pub struct ChannelClient {
    outbound: mpsc::Sender<Frame>,
    pending: SharedPending,
    next_id: AtomicU64,
    telemetry: broadcast::Sender<TelemetryEvent>,
    request_timeout: Duration,
    cancel: CancellationToken,
}

impl ChannelClient {
    /// 连接并完成握手
    pub async fn connect(ipc: &IpcSection) -> Result<Self, ChannelError> {
        let addr = ipc.addr();
        let connect_timeout = Duration::from_millis(ipc.connect_timeout_ms);
        let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ChannelError::Timeout(0))??;
        stream.set_nodelay(true)?;
        tokio::time::timeout(
            connect_timeout,
            client_handshake(&mut stream, ipc.authkey.as_bytes()),
        )
        .await
        .map_err(|_| ChannelError::Auth("handshake timed out".into()))??;
        tracing::info!(addr = %addr, "channel connected");
        Ok(Self::from_stream(
            stream,
            Duration::from_millis(ipc.request_timeout_ms),
        ))
    }

    /// 在已认证的流上启动读写任务
    pub fn from_stream<S>(stream: S, request_timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (outbound, mut rx) = mpsc::channel::<Frame>(OUTBOUND_CAPACITY);
        let (telemetry, _) = broadcast::channel(TELEMETRY_CAPACITY);
        let pending: SharedPending = Arc::new(Mutex::new(Pending::default()));
        let cancel = CancellationToken::new();

        let writer_pending = pending.clone();
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    frame = rx.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = write_frame(&mut writer, &frame).await {
                            tracing::warn!(error = %e, "channel write failed");
                            break;
                        }
                    }
                }
            }
            fail_all(&writer_pending);
            writer_cancel.cancel();
        });

        let reader_pending = pending.clone();
        let reader_cancel = cancel.clone();
        let reader_telemetry = telemetry.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    f = read_frame(&mut reader) => f,
                };
                let frame = match frame {
                    Ok(f) => f,
                    Err(ChannelError::Closed) => {
                        tracing::info!("channel closed by host");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "channel read failed");
                        break;
                    }
                };
                match frame.kind {
                    FrameKind::TelemetryEvent => match frame.payload_as::<TelemetryEvent>() {
                        Ok(ev) => {
                            let _ = reader_telemetry.send(ev);
                        }
                        Err(e) => tracing::debug!(error = %e, "bad telemetry frame"),
                    },
                    FrameKind::Shutdown => {
                        tracing::info!("host announced shutdown");
                        break;
                    }
                    kind if kind.is_response() => {
                        let waiter = lock(&reader_pending).waiters.remove(&frame.correlation_id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(frame);
                            }
                            None => tracing::debug!(
                                id = frame.correlation_id,
                                "discarding late response"
                            ),
                        }
                    }
                    other => tracing::debug!(kind = ?other, "unexpected frame from host"),
                }
            }
            fail_all(&reader_pending);
            reader_cancel.cancel();
        });

        Self {
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            telemetry,
            request_timeout,
            cancel,
        }
    }

    pub fn subscribe_telemetry(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.telemetry.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn request<Req, Resp>(&self, kind: FrameKind, body: &Req) -> Result<Resp, ChannelError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.request_with_timeout(kind, body, self.request_timeout)
            .await
    }

    pub async fn request_with_timeout<Req, Resp>(
        &self,
        kind: FrameKind,
        body: &Req,
        deadline: Duration,
    ) -> Result<Resp, ChannelError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::new(kind, id, body)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut p = lock(&self.pending);
            if p.closed {
                return Err(ChannelError::Closed);
            }
            p.waiters.insert(id, tx);
        }

        if self.outbound.send(frame).await.is_err() {
            lock(&self.pending).waiters.remove(&id);
            return Err(ChannelError::Closed);
        }

        let reply = match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(ChannelError::Closed),
            Err(_) => {
                lock(&self.pending).waiters.remove(&id);
                tracing::warn!(id, kind = ?kind, "request deadline exceeded");
                return Err(ChannelError::Timeout(id));
            }
        };

        if reply.kind == FrameKind::Error {
            let err: ErrorPayload = reply.payload_as()?;
            return Err(ChannelError::Remote {
                kind: err.kind,
                message: err.message,
            });
        }
        match kind.response_kind() {
            Some(expected) if expected != reply.kind => Err(ChannelError::Codec(format!(
                "expected {:?}, got {:?}",
                expected, reply.kind
            ))),
            _ => reply.payload_as(),
        }
    }

    pub async fn list_windows(&self) -> Result<Vec<WindowInfo>, ChannelError> {
        let resp: WindowListResponse = self
            .request(FrameKind::WindowListRequest, &serde_json::Value::Null)
            .await?;
        Ok(resp.windows)
    }

    pub async fn ping(&self) -> Result<(), ChannelError> {
        let _: serde_json::Value = self.request(FrameKind::Ping, &serde_json::Value::Null).await?;
        Ok(())
    }

    /// 通知执行端结束并关闭本地读写任务
    pub async fn close(&self, reason: &str) {
        let notice = ShutdownNotice {
            reason: reason.to_string(),
        };
        if let Ok(frame) = Frame::new(FrameKind::Shutdown, 0, &notice) {
            let _ = self.outbound.send(frame).await;
        }
        // 给写任务一次机会把 Shutdown 帧刷出去
        tokio::task::yield_now().await;
        self.cancel.cancel();
    }
}

impl Drop for ChannelClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl ExecutionHost for ChannelClient {
    async fn perceive(&self, request: PerceiveRequest) -> Result<PerceptionSnapshot, AgentError> {
        let resp: PerceiveResponse = self.request(FrameKind::PerceiveRequest, &request).await?;
        Ok(resp.snapshot)
    }

    async fn execute(
        &self,
        action: &Action,
        snapshot: &PerceptionSnapshot,
    ) -> Result<ActionResult, AgentError> {
        let body = ExecuteRequest {
            action: action.clone(),
            snapshot: snapshot.clone(),
        };
        match self
            .request::<_, ExecuteResponse>(FrameKind::ExecuteRequest, &body)
            .await
        {
            Ok(resp) => Ok(resp.result),
            Err(ChannelError::Timeout(id)) => Ok(ActionResult::channel_failure(
                ErrorKind::Timeout,
                format!("execute request {} timed out", id),
            )),
            Err(ChannelError::Remote { kind, message }) if kind != ErrorKind::ChannelFault => {
                Ok(ActionResult::channel_failure(kind, message))
            }
            Err(e) => Err(e.into()),
        }
    }
}
