//! Control-channel protocol types.
//!
//! The first `session` channel of every connection carries control requests
//! (`Phase`, `Upgrade`) and their replies in both directions.
//!
//! Wire format: `[type: u8] [length: u32 BE] [payload: length bytes]`,
//! payload is JSON.

use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame payload size: 64 KiB.
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// Frame type: control request (either direction).
pub const FRAME_REQUEST: u8 = 0x01;
/// Frame type: reply to a request carrying the same id.
pub const FRAME_REPLY: u8 = 0x02;

/// Request kind literal for the role exchange.
pub const PHASE_REQUEST: &str = "Phase";
/// Request kind literal for the attestation-to-kubernetes upgrade.
pub const UPGRADE_REQUEST: &str = "Upgrade";

/// Known control request kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Phase,
    Upgrade,
    Other(String),
}

impl RequestKind {
    pub fn as_str(&self) -> &str {
        match self {
            RequestKind::Phase => PHASE_REQUEST,
            RequestKind::Upgrade => UPGRADE_REQUEST,
            RequestKind::Other(kind) => kind,
        }
    }
}

impl From<&str> for RequestKind {
    fn from(kind: &str) -> Self {
        match kind {
            PHASE_REQUEST => RequestKind::Phase,
            UPGRADE_REQUEST => RequestKind::Upgrade,
            other => RequestKind::Other(other.to_string()),
        }
    }
}

/// A control request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub id: u32,
    pub kind: String,
    pub want_reply: bool,
    #[serde(default)]
    pub payload: Vec<u8>,
}

/// Reply to a [`ControlRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlReply {
    pub id: u32,
    pub ok: bool,
    #[serde(default)]
    pub payload: Vec<u8>,
}

/// A parsed control frame.
#[derive(Debug)]
pub enum ControlFrame {
    Request(ControlRequest),
    Reply(ControlReply),
}

/// Write a frame to a stream: [type: u8] [length: u32 BE] [payload].
pub async fn write_frame<W>(w: &mut W, frame_type: u8, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "control frame too large: {} bytes (max {})",
                payload.len(),
                MAX_FRAME_PAYLOAD
            ),
        ));
    }
    let len = payload.len() as u32;
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.push(frame_type);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    w.write_all(&buf).await?;
    w.flush().await
}

/// Read a raw frame from a stream. Returns (frame_type, payload).
///
/// Returns `Ok(None)` on EOF.
pub async fn read_frame<R>(r: &mut R) -> io::Result<Option<(u8, Vec<u8>)>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 5];
    match r.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let frame_type = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;

    if len > MAX_FRAME_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "control frame too large: {} bytes (max {})",
                len, MAX_FRAME_PAYLOAD
            ),
        ));
    }

    let mut payload = vec![0u8; len];
    if len > 0 {
        r.read_exact(&mut payload).await?;
    }

    Ok(Some((frame_type, payload)))
}

/// Write a typed control frame.
pub async fn write_control<W>(w: &mut W, frame: &ControlFrame) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let (frame_type, payload) = match frame {
        ControlFrame::Request(req) => (FRAME_REQUEST, serde_json::to_vec(req)),
        ControlFrame::Reply(reply) => (FRAME_REPLY, serde_json::to_vec(reply)),
    };
    let payload = payload.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_frame(w, frame_type, &payload).await
}

/// Read a typed control frame. Returns `Ok(None)` on EOF.
pub async fn read_control<R>(r: &mut R) -> io::Result<Option<ControlFrame>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let Some((frame_type, payload)) = read_frame(r).await? else {
        return Ok(None);
    };
    let invalid = |e: serde_json::Error| io::Error::new(io::ErrorKind::InvalidData, e);
    match frame_type {
        FRAME_REQUEST => Ok(Some(ControlFrame::Request(
            serde_json::from_slice(&payload).map_err(invalid)?,
        ))),
        FRAME_REPLY => Ok(Some(ControlFrame::Reply(
            serde_json::from_slice(&payload).map_err(invalid)?,
        ))),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown control frame type 0x{:02x}", other),
        )),
    }
}
