//! Exec into running containers through `rkt app exec`.
//!
//! Synchronous execs capture output. Streaming execs run a fixed set of
//! tasks (stdin copy, stdout copy, stderr copy, process wait) that report
//! into one first-error-wins channel and one completion signal. Dropping
//! the returned future stops waiting, but the exec child is not killed.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use rktlet_core::cli::EXPERIMENT_APP_ENV;
use rktlet_core::stream::TerminalSize;
use rktlet_core::{Cli, Result, RktletError};

use crate::metadata::parse_container_id;

pub type InputStream = Box<dyn AsyncRead + Send + Unpin>;
pub type OutputStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Client side of a streaming exec. Absent streams are not connected.
#[derive(Default)]
pub struct ExecStreams {
    pub stdin: Option<InputStream>,
    pub stdout: Option<OutputStream>,
    pub stderr: Option<OutputStream>,
    /// Terminal resize events; only used with a TTY.
    pub resize: Option<mpsc::Receiver<TerminalSize>>,
}

/// Captured result of a synchronous exec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

/// Runs commands inside container apps.
pub struct ExecShim {
    cli: Arc<dyn Cli>,
}

impl ExecShim {
    pub fn new(cli: Arc<dyn Cli>) -> Self {
        Self { cli }
    }

    /// Full argv of `rkt app exec --app=<name> <uuid> <cmd...>`.
    pub fn exec_command(&self, container_id: &str, cmd: &[String]) -> Result<Vec<String>> {
        if cmd.is_empty() {
            return Err(RktletError::InvalidArgument(
                "exec command required".to_string(),
            ));
        }
        let (sandbox_id, app_name) = parse_container_id(container_id)?;
        let mut args = vec![
            "exec".to_string(),
            format!("--app={}", app_name),
            sandbox_id,
        ];
        args.extend(cmd.iter().cloned());
        Ok(self.cli.command("app", &args))
    }

    /// Run `cmd` to completion and capture stdout and stderr separately.
    pub async fn exec_sync(&self, container_id: &str, cmd: &[String]) -> Result<ExecOutput> {
        let argv = self.exec_command(container_id, cmd)?;
        let output = build_command(&argv)?
            .stdin(Stdio::null())
            .output()
            .await?;

        Ok(ExecOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: exit_code(output.status),
        })
    }

    /// Run `cmd` with its I/O connected to `streams`, returning the exit code.
    pub async fn exec(
        &self,
        container_id: &str,
        cmd: &[String],
        tty: bool,
        streams: ExecStreams,
    ) -> Result<i32> {
        let argv = self.exec_command(container_id, cmd)?;
        tracing::debug!(container_id = %container_id, tty, command = ?argv, "Starting exec");
        if tty {
            exec_terminal(&argv, streams).await
        } else {
            exec_piped(&argv, streams).await
        }
    }
}

fn build_command(argv: &[String]) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| RktletError::InvalidArgument("empty exec command line".to_string()))?;
    let mut command = Command::new(program);
    command.args(args).env(EXPERIMENT_APP_ENV, "true");
    Ok(command)
}

/// Exit code of a finished process; signals map to `128 + signal`.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 0,
    }
}

fn piped_if(connected: bool) -> Stdio {
    if connected {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

async fn exec_piped(argv: &[String], streams: ExecStreams) -> Result<i32> {
    let mut command = build_command(argv)?;
    command
        .stdin(piped_if(streams.stdin.is_some()))
        .stdout(piped_if(streams.stdout.is_some()))
        .stderr(piped_if(streams.stderr.is_some()));
    let mut child = command.spawn()?;

    let (err_tx, err_rx) = mpsc::channel(4);

    let stdin_task = match (streams.stdin, child.stdin.take()) {
        (Some(mut input), Some(mut child_in)) => {
            let errors = err_tx.clone();
            Some(tokio::spawn(async move {
                let result = async {
                    tokio::io::copy(&mut input, &mut child_in).await?;
                    child_in.shutdown().await
                }
                .await;
                match result {
                    Err(e) if e.kind() != io::ErrorKind::BrokenPipe => {
                        let _ = errors.send(e.into()).await;
                    }
                    _ => {}
                }
            }))
        }
        _ => None,
    };

    let outputs = [
        spawn_copy(child.stdout.take(), streams.stdout, err_tx.clone()),
        spawn_copy(child.stderr.take(), streams.stderr, err_tx.clone()),
    ]
    .into_iter()
    .flatten()
    .collect();

    let background: Vec<JoinHandle<()>> = stdin_task.into_iter().collect();
    supervise(child, outputs, background, err_tx, err_rx).await
}

fn spawn_copy<R>(
    source: Option<R>,
    sink: Option<OutputStream>,
    errors: mpsc::Sender<RktletError>,
) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let (mut source, mut sink) = (source?, sink?);
    Some(tokio::spawn(async move {
        let result = async {
            tokio::io::copy(&mut source, &mut sink).await?;
            sink.shutdown().await
        }
        .await;
        if let Err(e) = result {
            let _ = errors.send(e.into()).await;
        }
    }))
}

/// Wait for `child` and its output copies, or for the first reported error.
///
/// `background` tasks are aborted once the session ends either way.
async fn supervise(
    mut child: Child,
    outputs: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
    err_tx: mpsc::Sender<RktletError>,
    mut err_rx: mpsc::Receiver<RktletError>,
) -> Result<i32> {
    let (done_tx, done_rx) = oneshot::channel();

    let errors = err_tx.clone();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => {
                for task in outputs {
                    let _ = task.await;
                }
                let _ = done_tx.send(exit_code(status));
            }
            Err(e) => {
                let _ = errors.send(e.into()).await;
            }
        }
    });
    drop(err_tx);

    let result = tokio::select! {
        Some(err) = err_rx.recv() => Err(err),
        done = done_rx => done.map_err(|_| {
            RktletError::IoError(io::Error::new(
                io::ErrorKind::Other,
                "exec process task ended without a status",
            ))
        }),
    };

    for task in background {
        task.abort();
    }
    result
}

// ── Terminal ───────────────────────────────────────────────────────

async fn exec_terminal(argv: &[String], streams: ExecStreams) -> Result<i32> {
    let pty = nix::pty::openpty(None, None).map_err(io::Error::from)?;
    let slave: OwnedFd = pty.slave;
    let master = std::fs::File::from(pty.master);

    let mut command = build_command(argv)?;
    command
        .stdin(Stdio::from(slave.try_clone()?))
        .stdout(Stdio::from(slave.try_clone()?))
        .stderr(Stdio::from(slave));
    // SAFETY: only async-signal-safe calls run between fork and exec.
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            if libc::ioctl(0, libc::TIOCSCTTY, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let child = command.spawn()?;
    // The command still holds the slave side; close it so reads see EIO on exit.
    drop(command);

    let (err_tx, err_rx) = mpsc::channel(4);
    let mut background = Vec::new();

    if let Some(mut resize) = streams.resize {
        let terminal = master.try_clone()?;
        background.push(tokio::spawn(async move {
            while let Some(size) = resize.recv().await {
                if let Err(e) = set_window_size(&terminal, size) {
                    tracing::debug!(error = %e, "Terminal resize failed");
                }
            }
        }));
    }

    if let Some(mut input) = streams.stdin {
        let mut terminal = tokio::fs::File::from_std(master.try_clone()?);
        let errors = err_tx.clone();
        background.push(tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let result: io::Result<()> = async {
                loop {
                    let n = input.read(&mut buf).await?;
                    if n == 0 {
                        return Ok(());
                    }
                    terminal.write_all(&buf[..n]).await?;
                    terminal.flush().await?;
                }
            }
            .await;
            if let Err(e) = result {
                let _ = errors.send(RktletError::from(e)).await;
            }
        }));
    }

    let mut outputs = Vec::new();
    if let Some(mut sink) = streams.stdout {
        let mut terminal = tokio::fs::File::from_std(master);
        let errors = err_tx.clone();
        outputs.push(tokio::spawn(async move {
            if let Err(e) = copy_terminal_output(&mut terminal, &mut sink).await {
                let _ = errors.send(e.into()).await;
            }
        }));
    }

    supervise(child, outputs, background, err_tx, err_rx).await
}

/// Copy terminal output until the slave side closes. EIO marks that close.
async fn copy_terminal_output(
    terminal: &mut tokio::fs::File,
    sink: &mut OutputStream,
) -> io::Result<()> {
    let mut buf = vec![0u8; 4096];
    loop {
        let n = match terminal.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
            Err(e) => return Err(e),
        };
        sink.write_all(&buf[..n]).await?;
    }
    sink.shutdown().await
}

/// Apply a window size to a terminal.
pub fn set_window_size(terminal: &std::fs::File, size: TerminalSize) -> io::Result<()> {
    let ws = libc::winsize {
        ws_row: size.height,
        ws_col: size.width,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: the fd is open for the lifetime of `terminal` and `ws` outlives the call.
    let rc = unsafe { libc::ioctl(terminal.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
