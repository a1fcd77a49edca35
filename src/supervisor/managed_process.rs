//! Managed Process - server process spawning with stdio capture
//!
//! - stdout/stderr are drained by independent tasks so a chatty server never blocks
//! - recent output lives in a bounded ring buffer and is broadcast in real time
//! - the exit status is published on a `watch` channel

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{broadcast, watch, Mutex};

use super::error::SupervisorError;
use super::LaunchCommand;
use crate::progress::ProgressSink;
use crate::utils::current_timestamp;

/// Maximum number of log lines kept in the ring buffer.
pub const DEFAULT_LOG_BUFFER: usize = 10_000;

// ─── Log Types ───────────────────────────────────────────────

/// A single line of console output from the managed process
#[derive(Debug, Clone)]
pub struct LogLine {
    /// Sequential per process
    pub id: u64,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    pub source: LogSource,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Lines written by the supervisor itself (start, exit)
    System,
}

/// How the child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// `None` when the process was killed by a signal
    pub code: Option<i32>,
    pub success: bool,
    pub description: String,
}

// ─── Log Buffer ──────────────────────────────────────────────

/// Ring buffer that stores recent log lines with sequential IDs.
struct LogBuffer {
    lines: VecDeque<LogLine>,
    next_id: u64,
    max_size: usize,
}

impl LogBuffer {
    fn new() -> Self {
        Self::with_capacity(DEFAULT_LOG_BUFFER)
    }

    fn with_capacity(max_size: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_size.min(1024)),
            next_id: 0,
            max_size,
        }
    }

    fn push(&mut self, source: LogSource, content: String) -> LogLine {
        let line = LogLine {
            id: self.next_id,
            timestamp: current_timestamp(),
            source,
            content,
        };
        self.next_id += 1;

        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line.clone());
        line
    }

    fn get_recent(&self, count: usize) -> Vec<LogLine> {
        self.lines.iter().rev().take(count).rev().cloned().collect()
    }
}

/// Shared by the reader tasks and the waiter.
#[derive(Clone)]
struct LogPipe {
    buffer: Arc<Mutex<LogBuffer>>,
    broadcast: broadcast::Sender<LogLine>,
    sink: Arc<dyn ProgressSink>,
}

impl LogPipe {
    async fn push(&self, source: LogSource, content: String) {
        self.sink.log(&content);
        let line = self.buffer.lock().await.push(source, content);
        // 구독자가 없으면 에러지만 무시
        let _ = self.broadcast.send(line);
    }

    fn drain<S>(&self, stream: S, source: LogSource)
    where
        S: AsyncRead + Unpin + Send + 'static,
    {
        let pipe = self.clone();
        tokio::spawn(async move {
            // 잘못된 UTF-8이 있어도 EOF까지 계속 읽는다. 읽기를 멈추면 자식이 SIGPIPE로 죽는다
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = buf.strip_suffix(b"\n").unwrap_or(&buf[..]);
                        let line = line.strip_suffix(b"\r").unwrap_or(line);
                        pipe.push(source, String::from_utf8_lossy(line).into_owned())
                            .await;
                    }
                    Err(e) => {
                        tracing::warn!("{:?} reader stopped: {}", source, e);
                        break;
                    }
                }
            }
        });
    }
}

// ─── Managed Process ─────────────────────────────────────────

/// A server process spawned and owned by the supervisor.
pub struct ManagedProcess {
    pipe: LogPipe,
    pub pid: u32,
    exit_rx: watch::Receiver<Option<ExitReport>>,
}

impl ManagedProcess {
    pub async fn spawn(
        launch: &LaunchCommand,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self, SupervisorError> {
        let program = launch.program.to_string_lossy().into_owned();

        let mut cmd = TokioCommand::new(&launch.program);
        cmd.args(&launch.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        if let Some(cwd) = &launch.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &launch.env {
            cmd.env(key, value);
        }

        // Windows: hide console window
        crate::utils::apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| SupervisorError::Spawn {
            program: program.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "process exited before its pid was read"),
        })?;

        let (log_tx, _) = broadcast::channel::<LogLine>(2048);
        let (exit_tx, exit_rx) = watch::channel(None);
        let pipe = LogPipe {
            buffer: Arc::new(Mutex::new(LogBuffer::new())),
            broadcast: log_tx,
            sink,
        };

        pipe.push(LogSource::System, format!("Process started with PID {}", pid))
            .await;

        if let Some(stdout) = child.stdout.take() {
            pipe.drain(stdout, LogSource::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            pipe.drain(stderr, LogSource::Stderr);
        }

        // ── process waiter ───────────────────────────────────
        {
            let pipe = pipe.clone();
            tokio::spawn(async move {
                let report = match child.wait().await {
                    Ok(status) => ExitReport {
                        code: status.code(),
                        success: status.success(),
                        description: format!("Process exited with {}", status),
                    },
                    Err(e) => ExitReport {
                        code: None,
                        success: false,
                        description: format!("Failed to wait for process: {}", e),
                    },
                };
                tracing::info!("{} (pid {})", report.description, pid);
                pipe.push(LogSource::System, report.description.clone()).await;
                let _ = exit_tx.send(Some(report));
            });
        }

        Ok(Self { pipe, pid, exit_rx })
    }

    /// Get the most recent `count` log lines.
    pub async fn get_recent_console(&self, count: usize) -> Vec<LogLine> {
        self.pipe.buffer.lock().await.get_recent(count)
    }

    /// Subscribe to real-time log events.
    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.pipe.broadcast.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    pub fn exit_report(&self) -> Option<ExitReport> {
        self.exit_rx.borrow().clone()
    }

    pub fn exit_receiver(&self) -> watch::Receiver<Option<ExitReport>> {
        self.exit_rx.clone()
    }

    /// Wait until the process exits. Returns immediately if it already has.
    pub async fn wait_for_exit(&self) -> Option<ExitReport> {
        wait_for_report(self.exit_rx.clone()).await
    }

    /// Polite termination request (SIGTERM / taskkill without /F).
    pub fn terminate(&self) -> Result<(), SupervisorError> {
        if !self.is_running() {
            return Ok(());
        }
        terminate_pid(self.pid)
    }

    pub fn force_kill(&self) -> Result<(), SupervisorError> {
        if !self.is_running() {
            return Ok(());
        }
        force_kill_pid(self.pid)
    }
}

pub(crate) async fn wait_for_report(
    mut rx: watch::Receiver<Option<ExitReport>>,
) -> Option<ExitReport> {
    loop {
        if let Some(report) = rx.borrow_and_update().clone() {
            return Some(report);
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone();
        }
    }
}

// ─── Signals ─────────────────────────────────────────────────

pub fn terminate_pid(pid: u32) -> Result<(), SupervisorError> {
    tracing::info!("Sending TERM signal to pid {}", pid);
    send_signal(pid, false)
}

/// Force-kill a process by PID. Cross-platform helper.
pub fn force_kill_pid(pid: u32) -> Result<(), SupervisorError> {
    tracing::warn!("Sending KILL signal to pid {}", pid);
    send_signal(pid, true)
}

#[cfg(target_os = "windows")]
fn send_signal(pid: u32, force: bool) -> Result<(), SupervisorError> {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;

    let pid_arg = pid.to_string();
    let mut args = vec!["/PID", pid_arg.as_str(), "/T"];
    if force {
        args.insert(0, "/F");
    }
    let output = std::process::Command::new("taskkill")
        .args(&args)
        .creation_flags(CREATE_NO_WINDOW)
        .output()
        .map_err(|e| SupervisorError::Signal {
            pid,
            reason: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(SupervisorError::Signal {
            pid,
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

#[cfg(not(target_os = "windows"))]
fn send_signal(pid: u32, force: bool) -> Result<(), SupervisorError> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    match signal::kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) => Ok(()),
        // 이미 종료된 프로세스
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(SupervisorError::Signal {
            pid,
            reason: format!("Failed to send {:?}: {}", sig, e),
        }),
    }
}

// ─── Tests ───────────────────────────────────────────────────
