//! CRI streaming server for exec.
//!
//! Kubernetes CRI uses a two-phase protocol for interactive operations:
//! 1. gRPC call returns a streaming URL
//! 2. Kubelet connects to the URL over HTTP for bidirectional I/O
//!
//! After `101 Switching Protocols` both sides speak the frame protocol from
//! [`rktlet_core::stream`]. The server ends every session with a status frame.

use std::collections::HashMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use rktlet_core::stream::{
    parse_frame, read_frame, write_frame, write_status, ExecStatus, Frame, MAX_FRAME_PAYLOAD,
    CHANNEL_STDERR, CHANNEL_STDOUT,
};

use crate::exec::{ExecShim, ExecStreams};

/// Largest request head accepted before the upgrade.
const MAX_REQUEST_HEAD: usize = 8192;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type Sessions = Arc<RwLock<HashMap<String, ExecSession>>>;

/// A pending exec session registered by the Exec RPC.
#[derive(Debug, Clone)]
pub struct ExecSession {
    pub container_id: String,
    pub cmd: Vec<String>,
    pub tty: bool,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

/// CRI streaming server that handles HTTP connections from kubelet.
pub struct StreamingServer {
    listener: TcpListener,
    addr: SocketAddr,
    /// Pending sessions keyed by token.
    sessions: Sessions,
    exec: Arc<ExecShim>,
}

impl StreamingServer {
    /// Bind the streaming listener.
    pub async fn bind(addr: SocketAddr, exec: Arc<ExecShim>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        Ok(Self {
            listener,
            addr,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            exec,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get a handle for registering sessions.
    pub fn handle(&self) -> StreamingHandle {
        StreamingHandle {
            addr: self.addr,
            sessions: self.sessions.clone(),
        }
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self) -> Result<(), BoxError> {
        tracing::info!(addr = %self.addr, "CRI streaming server listening");

        loop {
            let (stream, peer) = self.listener.accept().await?;
            let sessions = self.sessions.clone();
            let exec = self.exec.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, sessions, exec).await {
                    tracing::warn!(peer = %peer, error = %e, "Streaming connection failed");
                }
            });
        }
    }
}

/// Handle for registering streaming sessions from the CRI gRPC service.
#[derive(Clone)]
pub struct StreamingHandle {
    addr: SocketAddr,
    sessions: Sessions,
}

impl StreamingHandle {
    /// Register a session and return the URL for kubelet to connect to.
    pub async fn register(&self, session: ExecSession) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        self.sessions.write().await.insert(token.clone(), session);
        format!("http://{}/exec/{}", self.addr, token)
    }
}

/// Handle an incoming HTTP connection from kubelet.
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    sessions: Sessions,
    exec: Arc<ExecShim>,
) -> Result<(), BoxError> {
    let Some((head, leftover)) = read_request_head(&mut stream).await? else {
        send_response(&mut stream, 400, "Bad Request").await?;
        return Ok(());
    };

    // Request line: GET /exec/<token> HTTP/1.1
    let first_line = head.lines().next().unwrap_or("");
    let parts: Vec<&str> = first_line.split_whitespace().collect();
    if parts.len() < 2 {
        send_response(&mut stream, 400, "Bad Request").await?;
        return Ok(());
    }

    let segments: Vec<&str> = parts[1].trim_start_matches('/').split('/').collect();
    let token = match segments.as_slice() {
        ["exec", token] => *token,
        _ => {
            send_response(&mut stream, 404, "Not Found").await?;
            return Ok(());
        }
    };

    // Look up and consume the session
    let session = sessions.write().await.remove(token);
    let Some(session) = session else {
        send_response(&mut stream, 404, "Session not found or expired").await?;
        return Ok(());
    };

    tracing::info!(
        peer = %peer,
        container_id = %session.container_id,
        tty = session.tty,
        "Streaming session started"
    );

    let upgrade = "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: rktlet-stream\r\n\r\n";
    stream.write_all(upgrade.as_bytes()).await?;

    run_exec_session(stream, leftover, session, exec).await
}

/// Read up to the blank line ending the request head.
///
/// Returns the head and any bytes already read past it.
async fn read_request_head(stream: &mut TcpStream) -> std::io::Result<Option<(String, Vec<u8>)>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let leftover = buf.split_off(end + 4);
            return Ok(Some((String::from_utf8_lossy(&buf).into_owned(), leftover)));
        }
        if buf.len() > MAX_REQUEST_HEAD {
            return Ok(None);
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Bridge frames on `stream` to an exec of the session's command.
async fn run_exec_session(
    stream: TcpStream,
    leftover: Vec<u8>,
    session: ExecSession,
    exec: Arc<ExecShim>,
) -> Result<(), BoxError> {
    let (read_half, mut write_half) = stream.into_split();
    let reader = Cursor::new(leftover).chain(read_half);

    let (frame_tx, mut frame_rx) = mpsc::channel::<(u8, Vec<u8>)>(16);
    let writer = tokio::spawn(async move {
        while let Some((channel, payload)) = frame_rx.recv().await {
            write_frame(&mut write_half, channel, &payload).await?;
        }
        Ok::<OwnedWriteHalf, std::io::Error>(write_half)
    });

    let mut streams = ExecStreams::default();
    let mut forwarders = Vec::new();

    let stdin_writer = if session.stdin {
        let (writer, reader) = tokio::io::duplex(MAX_FRAME_PAYLOAD);
        streams.stdin = Some(Box::new(reader));
        Some(writer)
    } else {
        None
    };
    if session.stdout || session.tty {
        let (writer, reader) = tokio::io::duplex(MAX_FRAME_PAYLOAD);
        streams.stdout = Some(Box::new(writer));
        forwarders.push(forward_output(reader, CHANNEL_STDOUT, frame_tx.clone()));
    }
    if session.stderr && !session.tty {
        let (writer, reader) = tokio::io::duplex(MAX_FRAME_PAYLOAD);
        streams.stderr = Some(Box::new(writer));
        forwarders.push(forward_output(reader, CHANNEL_STDERR, frame_tx.clone()));
    }
    let resize_tx = if session.tty {
        let (tx, rx) = mpsc::channel(4);
        streams.resize = Some(rx);
        Some(tx)
    } else {
        None
    };

    let input = tokio::spawn(read_client_frames(reader, stdin_writer, resize_tx));

    let result = exec
        .exec(&session.container_id, &session.cmd, session.tty, streams)
        .await;
    for task in forwarders {
        if result.is_ok() {
            let _ = task.await;
        } else {
            task.abort();
        }
    }
    input.abort();
    drop(frame_tx);

    let status = match result {
        Ok(code) => {
            tracing::info!(container_id = %session.container_id, exit_code = code, "Streaming session ended");
            ExecStatus {
                exit_code: Some(code),
                error: None,
            }
        }
        Err(e) => {
            tracing::warn!(container_id = %session.container_id, error = %e, "Streaming exec failed");
            ExecStatus {
                exit_code: None,
                error: Some(e.to_string()),
            }
        }
    };

    let mut write_half = writer.await??;
    write_status(&mut write_half, &status).await?;
    write_half.shutdown().await?;
    Ok(())
}

/// Forward one output pipe of the exec as frames on `channel`.
fn forward_output(
    mut reader: DuplexStream,
    channel: u8,
    frames: mpsc::Sender<(u8, Vec<u8>)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_FRAME_PAYLOAD];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if frames.send((channel, buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Apply client frames: stdin data, stdin close and terminal resizes.
async fn read_client_frames<R>(
    mut reader: R,
    mut stdin: Option<DuplexStream>,
    resize: Option<mpsc::Sender<rktlet_core::stream::TerminalSize>>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let (channel, payload) = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Stream read failed");
                break;
            }
        };
        match parse_frame(channel, payload) {
            Ok(Frame::Stdin(data)) if data.is_empty() => stdin = None,
            Ok(Frame::Stdin(data)) => {
                if let Some(w) = stdin.as_mut() {
                    if w.write_all(&data).await.is_err() {
                        stdin = None;
                    }
                }
            }
            Ok(Frame::Resize(size)) => {
                if let Some(tx) = &resize {
                    let _ = tx.send(size).await;
                }
            }
            Ok(other) => tracing::debug!(frame = ?other, "Ignoring client frame"),
            Err(e) => tracing::debug!(error = %e, "Ignoring malformed client frame"),
        }
    }
}

/// Send a simple HTTP response.
async fn send_response(stream: &mut TcpStream, status: u16, body: &str) -> std::io::Result<()> {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Error",
    };
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status, status_text, body.len(), body,
    );
    stream.write_all(response.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::HostCli;
    use rktlet_core::stream::{CHANNEL_STATUS, CHANNEL_STDIN};

    async fn server() -> StreamingHandle {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let exec = Arc::new(ExecShim::new(Arc::new(HostCli)));
        let server = StreamingServer::bind(addr, exec).await.unwrap();
        let handle = server.handle();
        tokio::spawn(server.serve());
        handle
    }

    fn session(script: &str) -> ExecSession {
        ExecSession {
            container_id: "4a1f:0-web".to_string(),
            cmd: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            tty: false,
            stdin: true,
            stdout: true,
            stderr: true,
        }
    }

    fn path_of(url: &str) -> &str {
        let rest = url.trim_start_matches("http://");
        &rest[rest.find('/').unwrap()..]
    }

    async fn read_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    #[tokio::test]
    async fn test_register_returns_exec_url() {
        let handle = server().await;
        let url = handle.register(session("true")).await;
        assert!(url.starts_with("http://127.0.0.1:"));
        assert!(url.contains("/exec/"));
        assert_eq!(handle.sessions.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_session_consumed_on_use() {
        let handle = server().await;
        let mut quiet = session("true");
        quiet.stdin = false;
        let url = handle.register(quiet).await;
        let request = format!("GET {} HTTP/1.1\r\nHost: x\r\n\r\n", path_of(&url));

        let mut first = TcpStream::connect(handle.addr).await.unwrap();
        first.write_all(request.as_bytes()).await.unwrap();
        assert!(read_head(&mut first).await.starts_with("HTTP/1.1 101"));
        loop {
            let (channel, _) = read_frame(&mut first).await.unwrap().unwrap();
            if channel == CHANNEL_STATUS {
                break;
            }
        }

        let mut second = TcpStream::connect(handle.addr).await.unwrap();
        second.write_all(request.as_bytes()).await.unwrap();
        assert!(read_head(&mut second).await.starts_with("HTTP/1.1 404"));
        assert!(handle.sessions.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_token_is_not_found() {
        let handle = server().await;
        let mut stream = TcpStream::connect(handle.addr).await.unwrap();
        stream
            .write_all(b"GET /exec/nope HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let head = read_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn test_exec_session_round_trip() {
        let handle = server().await;
        let url = handle
            .register(session("cat; echo oops >&2; exit 7"))
            .await;

        let mut stream = TcpStream::connect(handle.addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: x\r\n\r\n", path_of(&url));
        stream.write_all(request.as_bytes()).await.unwrap();
        write_frame(&mut stream, CHANNEL_STDIN, b"ping").await.unwrap();
        write_frame(&mut stream, CHANNEL_STDIN, b"").await.unwrap();

        let head = read_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 101"));

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let status = loop {
            let (channel, payload) = read_frame(&mut stream).await.unwrap().unwrap();
            match channel {
                CHANNEL_STDOUT => stdout.extend(payload),
                CHANNEL_STDERR => stderr.extend(payload),
                CHANNEL_STATUS => match parse_frame(channel, payload).unwrap() {
                    Frame::Status(status) => break status,
                    other => panic!("unexpected frame {other:?}"),
                },
                other => panic!("unexpected channel {other}"),
            }
        };

        assert_eq!(stdout, b"ping");
        assert_eq!(stderr, b"oops\n");
        assert_eq!(status.exit_code, Some(7));
        assert!(status.error.is_none());
    }

    #[tokio::test]
    async fn test_exec_session_reports_launch_error() {
        let handle = server().await;
        let mut failing = session("true");
        failing.cmd = vec!["/nonexistent/binary".to_string()];
        let url = handle.register(failing).await;

        let mut stream = TcpStream::connect(handle.addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\n\r\n", path_of(&url));
        stream.write_all(request.as_bytes()).await.unwrap();
        read_head(&mut stream).await;

        let (channel, payload) = read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(channel, CHANNEL_STATUS);
        match parse_frame(channel, payload).unwrap() {
            Frame::Status(status) => {
                assert!(status.exit_code.is_none());
                assert!(status.error.is_some());
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
