//! Frame protocol spoken on upgraded exec streaming connections.
//!
//! Wire format: `[channel: u8] [length: u32 BE] [payload: length bytes]`

use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame payload size: 64 KiB.
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// Channel: client input. An empty payload closes stdin.
pub const CHANNEL_STDIN: u8 = 0;
/// Channel: process stdout (or the terminal in TTY mode).
pub const CHANNEL_STDOUT: u8 = 1;
/// Channel: process stderr.
pub const CHANNEL_STDERR: u8 = 2;
/// Channel: final status, sent once by the server.
pub const CHANNEL_STATUS: u8 = 3;
/// Channel: terminal resize from the client.
pub const CHANNEL_RESIZE: u8 = 4;

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub width: u16,
    pub height: u16,
}

/// Outcome of an exec session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A parsed protocol frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Stdin(Vec<u8>),
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Status(ExecStatus),
    Resize(TerminalSize),
}

/// Write one frame.
pub async fn write_frame<W>(w: &mut W, channel: u8, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = payload.len() as u32;
    w.write_all(&[channel]).await?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(payload).await?;
    w.flush().await
}

/// Read one raw frame as `(channel, payload)`.
///
/// Returns `Ok(None)` on EOF at a frame boundary.
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

    let channel = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes (max {})", len, MAX_FRAME_PAYLOAD),
        ));
    }

    let mut payload = vec![0u8; len];
    if len > 0 {
        r.read_exact(&mut payload).await?;
    }
    Ok(Some((channel, payload)))
}

fn invalid(what: &str, err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("invalid {}: {}", what, err))
}

/// Parse a raw frame into a typed [`Frame`].
pub fn parse_frame(channel: u8, payload: Vec<u8>) -> io::Result<Frame> {
    match channel {
        CHANNEL_STDIN => Ok(Frame::Stdin(payload)),
        CHANNEL_STDOUT => Ok(Frame::Stdout(payload)),
        CHANNEL_STDERR => Ok(Frame::Stderr(payload)),
        CHANNEL_STATUS => serde_json::from_slice(&payload)
            .map(Frame::Status)
            .map_err(|e| invalid("status", e)),
        CHANNEL_RESIZE => serde_json::from_slice(&payload)
            .map(Frame::Resize)
            .map_err(|e| invalid("resize", e)),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown stream channel: 0x{:02x}", channel),
        )),
    }
}

/// Write the final status frame.
pub async fn write_status<W>(w: &mut W, status: &ExecStatus) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let payload = serde_json::to_vec(status).map_err(|e| invalid("status", e))?;
    write_frame(w, CHANNEL_STATUS, &payload).await
}

/// Write a resize frame.
pub async fn write_resize<W>(w: &mut W, size: TerminalSize) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let payload = serde_json::to_vec(&size).map_err(|e| invalid("resize", e))?;
    write_frame(w, CHANNEL_RESIZE, &payload).await
}
