//! 执行端通道服务
//!
//! 每个连接先完成握手，再开三个任务：写任务（mpsc 汇聚所有出站帧）、遥测定时任务、以及串行处理请求的读循环。
//! 关闭令牌取消后停止接受新连接，并向已连接的客户端发送 Shutdown。

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::auth::server_handshake;
use super::frame::{read_frame, write_frame, ChannelError, ErrorPayload, Frame, FrameKind};
use super::message::{
    ExecuteRequest, ExecuteResponse, PerceiveRequest, PerceiveResponse, ShutdownNotice,
    WindowListResponse,
};
use crate::core::ErrorKind;
use crate::host::HostService;

const OUTBOUND_CAPACITY: usize = 64;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct HostServer {
    service: Arc<HostService>,
    secret: Arc<Vec<u8>>,
    telemetry_interval: Duration,
    shutdown: CancellationToken,
}

impl HostServer {
    pub fn new(
        service: Arc<HostService>,
        secret: impl Into<Vec<u8>>,
        telemetry_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            service,
            secret: Arc::new(secret.into()),
            telemetry_interval,
            shutdown,
        }
    }

    /// 接受连接直到关闭令牌被取消
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ChannelError> {
        tracing::info!(addr = ?listener.local_addr().ok(), "host listening");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("host server stopping");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    tracing::info!(peer = %peer, "connection accepted");
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_tcp(stream).await {
                            tracing::warn!(peer = %peer, error = %e, "connection ended with error");
                        }
                    });
                }
            }
        }
    }

    async fn handle_tcp(&self, stream: TcpStream) -> Result<(), ChannelError> {
        stream.set_nodelay(true)?;
        self.handle_connection(stream).await
    }

    /// 处理一条连接（握手 + 请求循环）；泛型便于在内存管道上测试
    pub async fn handle_connection<S>(&self, mut stream: S) -> Result<(), ChannelError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        tokio::time::timeout(HANDSHAKE_TIMEOUT, server_handshake(&mut stream, &self.secret))
            .await
            .map_err(|_| ChannelError::Auth("handshake timed out".into()))??;
        tracing::info!("client authenticated");

        let (mut reader, mut writer) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::channel::<Frame>(OUTBOUND_CAPACITY);
        let conn = self.shutdown.child_token();

        let writer_conn = conn.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    tracing::warn!(error = %e, "host write failed");
                    break;
                }
            }
            writer_conn.cancel();
        });

        let telemetry_task = {
            let service = self.service.clone();
            let tx = tx.clone();
            let conn = conn.clone();
            let every = self.telemetry_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = conn.cancelled() => break,
                        _ = ticker.tick() => {
                            let sample = service.telemetry_sample().await;
                            let Ok(frame) = Frame::new(FrameKind::TelemetryEvent, 0, &sample) else {
                                continue;
                            };
                            if tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            })
        };

        let result = loop {
            let frame = tokio::select! {
                _ = conn.cancelled() => {
                    if self.shutdown.is_cancelled() {
                        let notice = ShutdownNotice { reason: "host shutting down".into() };
                        if let Ok(f) = Frame::new(FrameKind::Shutdown, 0, &notice) {
                            let _ = tx.send(f).await;
                        }
                    }
                    break Ok(());
                }
                f = read_frame(&mut reader) => f,
            };
            match frame {
                Ok(f) if f.kind == FrameKind::Shutdown => {
                    tracing::info!("client requested shutdown");
                    break Ok(());
                }
                Ok(f) => {
                    if let Some(reply) = self.dispatch(f).await {
                        if tx.send(reply).await.is_err() {
                            break Ok(());
                        }
                    }
                }
                Err(ChannelError::Closed) => {
                    tracing::info!("client disconnected");
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        };

        conn.cancel();
        drop(tx);
        let _ = telemetry_task.await;
        let _ = writer_task.await;
        result
    }

    /// 处理单个请求帧，返回响应帧；单向帧返回 None
    async fn dispatch(&self, frame: Frame) -> Option<Frame> {
        let id = frame.correlation_id;
        let reply = match frame.kind {
            FrameKind::PerceiveRequest => match frame.payload_as::<PerceiveRequest>() {
                Ok(req) => match self.service.perceive(&req).await {
                    Ok(snapshot) => {
                        Frame::new(FrameKind::PerceiveResponse, id, &PerceiveResponse { snapshot })
                    }
                    Err(e) => error_frame(id, e.kind(), e.to_string()),
                },
                Err(e) => error_frame(id, ErrorKind::ChannelFault, e.to_string()),
            },
            FrameKind::ExecuteRequest => match frame.payload_as::<ExecuteRequest>() {
                Ok(req) => {
                    let result = self.service.execute(&req.action, &req.snapshot).await;
                    Frame::new(FrameKind::ExecuteResponse, id, &ExecuteResponse { result })
                }
                Err(e) => error_frame(id, ErrorKind::ChannelFault, e.to_string()),
            },
            FrameKind::WindowListRequest => match self.service.list_windows().await {
                Ok(windows) => Frame::new(
                    FrameKind::WindowListResponse,
                    id,
                    &WindowListResponse { windows },
                ),
                Err(e) => error_frame(id, e.kind(), e.to_string()),
            },
            FrameKind::Ping => Ok(Frame::empty(FrameKind::Pong, id)),
            other if id == 0 => {
                tracing::debug!(kind = ?other, "ignoring one-way frame");
                return None;
            }
            other => error_frame(
                id,
                ErrorKind::ChannelFault,
                format!("unsupported request {:?}", other),
            ),
        };
        match reply {
            Ok(f) => Some(f),
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode reply");
                error_frame(id, ErrorKind::ChannelFault, e.to_string()).ok()
            }
        }
    }
}

fn error_frame(id: u64, kind: ErrorKind, message: String) -> Result<Frame, ChannelError> {
    Frame::new(FrameKind::Error, id, &ErrorPayload { kind, message })
}
