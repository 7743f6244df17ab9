//! 连接握手：基于共享密钥的 HMAC-SHA256 双向挑战应答
//!
//! 1. 服务端发送 32 字节随机 nonce（Challenge）
//! 2. 客户端回 HMAC(key, "client" || nonce_s) 与自己的 nonce（ChallengeResponse）
//! 3. 服务端校验后回 HMAC(key, "server" || nonce_c)（AuthResult），客户端再校验
//!
//! 摘要比较均为常数时间。

use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite};

use super::frame::{read_frame, write_frame, ChannelError, Frame, FrameKind};

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 32;
const CLIENT_LABEL: &[u8] = b"deskpilot-client";
const SERVER_LABEL: &[u8] = b"deskpilot-server";

#[derive(Debug, Serialize, Deserialize)]
struct ChallengePayload {
    nonce: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChallengeResponsePayload {
    digest: String,
    nonce: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AuthResultPayload {
    ok: bool,
    #[serde(default)]
    digest: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn new_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn unb64(s: &str) -> Result<Vec<u8>, ChannelError> {
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| ChannelError::Auth(format!("invalid base64: {}", e)))
}

fn digest(key: &[u8], label: &[u8], nonce: &[u8]) -> Result<Vec<u8>, ChannelError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| ChannelError::Auth(format!("bad key: {}", e)))?;
    mac.update(label);
    mac.update(nonce);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn verify(key: &[u8], label: &[u8], nonce: &[u8], presented: &[u8]) -> Result<bool, ChannelError> {
    let expected = digest(key, label, nonce)?;
    Ok(expected.len() == presented.len() && bool::from(expected.ct_eq(presented)))
}

fn expect_kind(frame: &Frame, kind: FrameKind) -> Result<(), ChannelError> {
    if frame.kind != kind {
        return Err(ChannelError::Auth(format!(
            "expected {:?}, got {:?}",
            kind, frame.kind
        )));
    }
    Ok(())
}

/// 服务端握手；失败时已向对端发送拒绝结果
pub async fn server_handshake<S>(stream: &mut S, key: &[u8]) -> Result<(), ChannelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_nonce = new_nonce();
    let challenge = ChallengePayload {
        nonce: b64(&server_nonce),
    };
    write_frame(stream, &Frame::new(FrameKind::Challenge, 0, &challenge)?).await?;

    let reply = read_frame(stream).await?;
    expect_kind(&reply, FrameKind::ChallengeResponse)?;
    let reply: ChallengeResponsePayload = reply.payload_as()?;

    let presented = unb64(&reply.digest)?;
    if !verify(key, CLIENT_LABEL, &server_nonce, &presented)? {
        let result = AuthResultPayload {
            ok: false,
            digest: None,
            message: Some("digest mismatch".into()),
        };
        let _ = write_frame(stream, &Frame::new(FrameKind::AuthResult, 0, &result)?).await;
        return Err(ChannelError::Auth("client digest mismatch".into()));
    }

    let client_nonce = unb64(&reply.nonce)?;
    if client_nonce.len() != NONCE_LEN {
        return Err(ChannelError::Auth("client nonce length".into()));
    }
    let result = AuthResultPayload {
        ok: true,
        digest: Some(b64(&digest(key, SERVER_LABEL, &client_nonce)?)),
        message: None,
    };
    write_frame(stream, &Frame::new(FrameKind::AuthResult, 0, &result)?).await?;
    Ok(())
}

/// 客户端握手；同时校验服务端持有同一密钥
pub async fn client_handshake<S>(stream: &mut S, key: &[u8]) -> Result<(), ChannelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let challenge = read_frame(stream).await?;
    expect_kind(&challenge, FrameKind::Challenge)?;
    let challenge: ChallengePayload = challenge.payload_as()?;
    let server_nonce = unb64(&challenge.nonce)?;
    if server_nonce.len() != NONCE_LEN {
        return Err(ChannelError::Auth("server nonce length".into()));
    }

    let client_nonce = new_nonce();
    let reply = ChallengeResponsePayload {
        digest: b64(&digest(key, CLIENT_LABEL, &server_nonce)?),
        nonce: b64(&client_nonce),
    };
    write_frame(stream, &Frame::new(FrameKind::ChallengeResponse, 0, &reply)?).await?;

    let result = read_frame(stream).await?;
    expect_kind(&result, FrameKind::AuthResult)?;
    let result: AuthResultPayload = result.payload_as()?;
    if !result.ok {
        return Err(ChannelError::Auth(
            result.message.unwrap_or_else(|| "rejected".into()),
        ));
    }
    let presented = unb64(result.digest.as_deref().unwrap_or_default())?;
    if !verify(key, SERVER_LABEL, &client_nonce, &presented)? {
        return Err(ChannelError::Auth("server digest mismatch".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handshake_ok() {
        let (mut c, mut s) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move { server_handshake(&mut s, b"secret").await });
        client_handshake(&mut c, b"secret").await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handshake_wrong_key() {
        let (mut c, mut s) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move { server_handshake(&mut s, b"secret").await });
        let client = client_handshake(&mut c, b"guess").await;
        assert!(matches!(client, Err(ChannelError::Auth(_))));
        assert!(matches!(server.await.unwrap(), Err(ChannelError::Auth(_))));
    }

    #[test]
    fn test_verify_constant_time_lengths() {
        let d = digest(b"k", CLIENT_LABEL, b"n").unwrap();
        assert!(verify(b"k", CLIENT_LABEL, b"n", &d).unwrap());
        assert!(!verify(b"k", CLIENT_LABEL, b"n", &d[..10]).unwrap());
        assert!(!verify(b"k", SERVER_LABEL, b"n", &d).unwrap());
    }
}
