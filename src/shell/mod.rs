//! Interactive shell session - one long-lived shell behind a pseudo-terminal
//!
//! Commands are written to the terminal and their exit status is recovered with
//! the sentinel protocol (see [`sentinel`]). Only one command is in flight at a
//! time: `execute()` holds the session lock until the marker line arrives, so
//! concurrent callers queue in submission order.
//!
//! The PTY is opened lazily on first use. Reading happens on a plain OS thread
//! (portable-pty readers are blocking) and complete lines are handed to tokio
//! through an unbounded channel.

pub mod sentinel;

use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{broadcast, mpsc, Mutex};

use sentinel::{compose_line, new_marker, parse_marker_line, LineAssembler};

/// Delay between detaching a session and killing its shell.
/// Killing in the same tick as the last read races the reader into a broken pipe.
const DEFAULT_KILL_DELAY: Duration = Duration::from_millis(100);

/// Wide enough that composed command lines never soft-wrap in the echo.
const PTY_COLS: u16 = 4096;
const PTY_ROWS: u16 = 50;

/// Callback for live output lines that are not the marker.
pub type LineObserver = dyn Fn(&str) + Send + Sync;

#[derive(thiserror::Error, Debug)]
pub enum ShellError {
    #[error("failed to open terminal session: {0}")]
    Open(String),

    #[error("failed to write to terminal: {0}")]
    Write(#[from] std::io::Error),

    #[error("environment session lost")]
    SessionLost,
}

impl ShellError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Open(_) => "SHELL_OPEN_FAILED",
            Self::Write(_) => "SHELL_WRITE_FAILED",
            Self::SessionLost => "SESSION_LOST",
        }
    }
}

/// Result of one command. Created per invocation and handed to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommandResult {
    /// Numeric status, or one of the sentinel values in [`sentinel`]
    pub exit_code: i32,
    /// Output lines seen before the marker (the terminal merges stdout and stderr)
    pub output: Vec<String>,
}

impl ShellCommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Something that can run a command line and report its exit code.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        command: &str,
        observer: Option<&LineObserver>,
    ) -> Result<ShellCommandResult, ShellError>;

    /// Release the underlying session. The next `run` starts a fresh one.
    async fn shutdown(&self) {}
}

#[derive(Debug, Clone)]
pub struct ShellSessionConfig {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub kill_delay: Duration,
}

impl ShellSessionConfig {
    /// PowerShell on Windows, bash everywhere else.
    pub fn for_host(cwd: impl Into<PathBuf>, env: Vec<(String, String)>) -> Self {
        let (program, args) = if cfg!(target_os = "windows") {
            ("powershell.exe", vec!["-NoLogo".to_string()])
        } else {
            ("bash", Vec::new())
        };
        Self {
            program: program.to_string(),
            args,
            cwd: cwd.into(),
            env,
            kill_delay: DEFAULT_KILL_DELAY,
        }
    }
}

struct PtyShell {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    lines: mpsc::UnboundedReceiver<String>,
}

pub struct InteractiveShellSession {
    config: ShellSessionConfig,
    inner: Mutex<Option<PtyShell>>,
    output: broadcast::Sender<String>,
}

impl InteractiveShellSession {
    /// Does not spawn anything; the shell starts on the first command.
    pub fn new(config: ShellSessionConfig) -> Self {
        let (output, _) = broadcast::channel(1024);
        Self {
            config,
            inner: Mutex::new(None),
            output,
        }
    }

    /// Live stream of every non-marker line, across commands.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.output.subscribe()
    }

    /// Whether a shell process is currently attached.
    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// Run one command line and wait for its marker.
    pub async fn execute(
        &self,
        command: &str,
        observer: Option<&LineObserver>,
    ) -> Result<ShellCommandResult, ShellError> {
        let mut guard = self.inner.lock().await;
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        let Some(shell) = guard.as_mut() else {
            return Err(ShellError::SessionLost);
        };

        // Leftovers from the previous command (prompt redraws etc.)
        while let Ok(line) = shell.lines.try_recv() {
            let _ = self.output.send(line);
        }

        let marker = new_marker();
        let input = compose_line(command, &marker);
        tracing::debug!("pty <- {}", input);
        shell.writer.write_all(format!("{}\r\n", input).as_bytes())?;
        shell.writer.flush()?;

        let mut output = Vec::new();
        loop {
            let Some(line) = shell.lines.recv().await else {
                tracing::error!("Shell exited before reporting status of: {}", command);
                *guard = None;
                return Err(ShellError::SessionLost);
            };

            if let Some(exit_code) = parse_marker_line(&line, &marker) {
                tracing::debug!("Command finished with exit code {}: {}", exit_code, command);
                return Ok(ShellCommandResult { exit_code, output });
            }

            if let Some(observer) = observer {
                observer(&line);
            }
            let _ = self.output.send(line.clone());
            output.push(line);
        }
    }

    /// Detach the shell and kill it after the configured delay.
    pub async fn close(&self) {
        let Some(shell) = self.inner.lock().await.take() else {
            return;
        };
        let PtyShell {
            master,
            writer,
            mut child,
            lines,
        } = shell;
        drop(writer);

        let delay = self.config.kill_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = child.kill() {
                tracing::debug!("Shell already gone: {}", e);
            }
            let _ = tokio::task::spawn_blocking(move || child.wait()).await;
            drop(lines);
            drop(master);
        });
    }

    fn open(&self) -> Result<PtyShell, ShellError> {
        tracing::info!(
            "Opening {} session in {}",
            self.config.program,
            self.config.cwd.display()
        );

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: PTY_ROWS,
                cols: PTY_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ShellError::Open(format!("openpty: {}", e)))?;

        let mut cmd = CommandBuilder::new(&self.config.program);
        cmd.args(&self.config.args);
        cmd.cwd(&self.config.cwd);
        cmd.env("TERM", "xterm");
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| ShellError::Open(format!("spawn {}: {}", self.config.program, e)))?;
        // The reader only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ShellError::Open(format!("clone reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ShellError::Open(format!("take writer: {}", e)))?;

        let (tx, lines) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("runbox-pty-reader".to_string())
            .spawn(move || {
                let mut buf = [0u8; 4096];
                let mut assembler = LineAssembler::new();
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            for line in assembler.push(&buf[..n]) {
                                if tx.send(line).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::debug!("pty read ended: {}", e);
                            break;
                        }
                    }
                }
                if let Some(rest) = assembler.finish() {
                    let _ = tx.send(rest);
                }
            })
            .map_err(|e| ShellError::Open(format!("reader thread: {}", e)))?;

        Ok(PtyShell {
            master: pair.master,
            writer,
            child,
            lines,
        })
    }
}

#[async_trait]
impl CommandRunner for InteractiveShellSession {
    async fn run(
        &self,
        command: &str,
        observer: Option<&LineObserver>,
    ) -> Result<ShellCommandResult, ShellError> {
        self.execute(command, observer).await
    }

    async fn shutdown(&self) {
        self.close().await
    }
}
