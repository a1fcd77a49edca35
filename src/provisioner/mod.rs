//! Python 가상환경 프로비저너 — uv 기반 격리 런타임 구성
//!
//! 번들된 앱은 엔드유저 시스템의 Python에 의존하지 않습니다. 환경 루트 아래에
//! 고정 버전 인터프리터와 venv를 만들고, 의존성을 단계적 폴백으로 설치합니다.
//!
//! ## 프로비저닝 흐름
//! 1. 완료 마커 존재? → 즉시 성공 (명령 실행 없음)
//! 2. 루트/캐시 디렉토리 생성
//! 3. `uv venv --python <version>` — 실패 시 치명적 (대체 경로 없음)
//! 4. `python -m ensurepip --upgrade` — 실패 시 치명적
//! 5. [`DependencySpec`] 순서대로 설치, 첫 성공에서 중단
//! 6. 완료 마커 기록
//!
//! ## 환경 루트 레이아웃
//! ```text
//! <root>/
//!   .venv/             ← 격리 venv (uv 기본값)
//!     bin/python        (Linux/macOS)
//!     Scripts/python.exe (Windows)
//!   uv-cache/          ← uv 캐시/툴/인터프리터 설치 위치
//!   .provisioned       ← 완료 마커 (존재 여부만 의미 있음)
//! ```
//!
//! 모든 캐시가 루트 아래에 있으므로 루트를 지우면 상태가 완전히 초기화됩니다.

pub mod strategy;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::progress::ProgressSink;
use crate::shell::{CommandRunner, InteractiveShellSession, LineObserver, ShellError, ShellSessionConfig};
use crate::utils::current_timestamp;

pub use strategy::{shell_command, DependencySpec, InstallStrategy, PackageStep, ResourcePaths};

pub const DEFAULT_PYTHON_VERSION: &str = "3.12.7";

const VENV_DIR_NAME: &str = ".venv";
const CACHE_DIR_NAME: &str = "uv-cache";
const MARKER_FILE_NAME: &str = ".provisioned";

/// uv can legitimately run for a long time on a cold cache.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60 * 60);

// ─── Descriptor ──────────────────────────────────────────────

/// One provisioned runtime and every path derived from its root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentDescriptor {
    pub root: PathBuf,
    pub python_version: String,
    pub venv_path: PathBuf,
    pub cache_dir: PathBuf,
    pub interpreter: PathBuf,
    pub marker: PathBuf,
}

impl EnvironmentDescriptor {
    pub fn new(root: impl Into<PathBuf>, python_version: &str) -> Self {
        let root = root.into();
        let venv_path = root.join(VENV_DIR_NAME);
        Self {
            interpreter: venv_python_exe(&venv_path),
            cache_dir: root.join(CACHE_DIR_NAME),
            marker: root.join(MARKER_FILE_NAME),
            python_version: python_version.to_string(),
            venv_path,
            root,
        }
    }

    /// The marker is the only authority for "already provisioned".
    pub fn is_provisioned(&self) -> bool {
        self.marker.exists()
    }

    /// Variables that keep uv's caches, tools and interpreters under the root.
    pub fn session_env(&self) -> Vec<(String, String)> {
        let cache = self.cache_dir.to_string_lossy().into_owned();
        vec![
            ("UV_CACHE_DIR".to_string(), cache.clone()),
            ("UV_TOOL_DIR".to_string(), cache.clone()),
            ("UV_TOOL_BIN_DIR".to_string(), cache.clone()),
            ("UV_PYTHON_INSTALL_DIR".to_string(), cache),
            (
                "VIRTUAL_ENV".to_string(),
                self.venv_path.to_string_lossy().into_owned(),
            ),
        ]
    }

    /// Shell line that activates the venv in an interactive terminal.
    /// Reported by `status()` so a user can enter the environment by hand.
    pub fn activate_command(&self) -> String {
        if cfg!(target_os = "windows") {
            format!("& \"{}\"", self.venv_path.join("Scripts").join("Activate.ps1").display())
        } else {
            format!("source \"{}\"", self.venv_path.join("bin").join("activate").display())
        }
    }
}

/// venv 내 Python 실행 파일 경로
fn venv_python_exe(venv_dir: &Path) -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        venv_dir.join("Scripts").join("python.exe")
    }
    #[cfg(not(target_os = "windows"))]
    {
        venv_dir.join("bin").join("python")
    }
}

/// Bundled tool locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub uv: PathBuf,
}

impl ToolPaths {
    /// `uv` shipped under `<resources>/uv/<platform>/`.
    pub fn bundled(resources: &ResourcePaths) -> Self {
        let uv_dir = resources.root.join("uv");
        let uv = if cfg!(target_os = "windows") {
            uv_dir.join("win").join("uv.exe")
        } else if cfg!(target_os = "macos") {
            uv_dir.join("macos").join("uv")
        } else {
            uv_dir.join("linux").join("uv")
        };
        Self { uv }
    }
}

// ─── Errors & outcomes ───────────────────────────────────────

/// One dependency strategy that did not succeed. `exit_code: None` means it was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyAttempt {
    pub strategy: String,
    pub exit_code: Option<i32>,
}

#[derive(thiserror::Error, Debug)]
pub enum ProvisionError {
    #[error("environment session lost while running: {command}")]
    SessionLost { command: String },

    #[error("failed to create virtual environment: exit code {exit_code}")]
    EnvironmentCreation { exit_code: i32 },

    #[error("failed to upgrade pip: exit code {exit_code}")]
    InterpreterUpgrade { exit_code: i32 },

    #[error("all dependency strategies failed: {attempts:?}")]
    DependenciesExhausted { attempts: Vec<StrategyAttempt> },

    #[error("terminal session error: {0}")]
    Shell(#[from] ShellError),

    #[error("filesystem error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ProvisionError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::SessionLost { .. } => "SESSION_LOST",
            Self::EnvironmentCreation { .. } => "ENVIRONMENT_CREATION_FAILED",
            Self::InterpreterUpgrade { .. } => "INTERPRETER_UPGRADE_FAILED",
            Self::DependenciesExhausted { .. } => "DEPENDENCIES_EXHAUSTED",
            Self::Shell(e) => e.error_code(),
            Self::Io { .. } => "IO_ERROR",
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// Marker found; nothing was run
    AlreadyProvisioned,
    /// Fresh provisioning finished with the named dependency strategy
    Provisioned { strategy: String },
}

#[derive(Debug, Clone)]
pub struct ProvisionOptions {
    /// Upper bound for a single shell command. Elapsing is treated as a lost session.
    pub command_timeout: Duration,
}

impl Default for ProvisionOptions {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

// ─── Provisioner ─────────────────────────────────────────────

/// Owns one command runner (normally a PTY shell) for one environment root.
pub struct EnvironmentProvisioner<R: CommandRunner = InteractiveShellSession> {
    descriptor: EnvironmentDescriptor,
    tools: ToolPaths,
    runner: R,
    sink: Arc<dyn ProgressSink>,
    options: ProvisionOptions,
}

impl EnvironmentProvisioner<InteractiveShellSession> {
    /// Provisioner backed by a lazily opened shell rooted at the environment root.
    pub fn with_pty(
        descriptor: EnvironmentDescriptor,
        tools: ToolPaths,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        let config = ShellSessionConfig::for_host(&descriptor.root, descriptor.session_env());
        let session = InteractiveShellSession::new(config);
        Self::new(descriptor, tools, session, sink)
    }
}

impl<R: CommandRunner> EnvironmentProvisioner<R> {
    pub fn new(
        descriptor: EnvironmentDescriptor,
        tools: ToolPaths,
        runner: R,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            descriptor,
            tools,
            runner,
            sink,
            options: ProvisionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ProvisionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn descriptor(&self) -> &EnvironmentDescriptor {
        &self.descriptor
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn is_provisioned(&self) -> bool {
        self.descriptor.is_provisioned()
    }

    /// Provision the environment unless the marker says it already is.
    ///
    /// The shell session is released when this returns, whatever the outcome.
    pub async fn ensure_provisioned(
        &self,
        spec: &DependencySpec,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        if self.descriptor.is_provisioned() {
            tracing::info!(
                "Environment already provisioned at {}",
                self.descriptor.root.display()
            );
            return Ok(ProvisionOutcome::AlreadyProvisioned);
        }

        let result = self.provision(spec).await;
        self.runner.shutdown().await;

        match &result {
            Ok(outcome) => tracing::info!("Provisioning finished: {:?}", outcome),
            Err(e) => tracing::error!("Provisioning failed [{}]: {}", e.error_code(), e),
        }
        result
    }

    async fn provision(&self, spec: &DependencySpec) -> Result<ProvisionOutcome, ProvisionError> {
        let d = &self.descriptor;
        std::fs::create_dir_all(&d.root).map_err(|e| ProvisionError::io(&d.root, e))?;
        std::fs::create_dir_all(&d.cache_dir).map_err(|e| ProvisionError::io(&d.cache_dir, e))?;

        tracing::info!(
            "Creating virtual environment at {} with python {}",
            d.venv_path.display(),
            d.python_version
        );
        self.sink.status("Creating Python environment");
        let exit_code = self
            .run_step(&self.uv(&["venv", "--python", &d.python_version]))
            .await?;
        if exit_code != 0 {
            return Err(ProvisionError::EnvironmentCreation { exit_code });
        }

        self.sink.status("Upgrading pip");
        let upgrade = shell_command(
            &d.interpreter.to_string_lossy(),
            &["-m".into(), "ensurepip".into(), "--upgrade".into()],
        );
        let exit_code = self.run_step(&upgrade).await?;
        if exit_code != 0 {
            return Err(ProvisionError::InterpreterUpgrade { exit_code });
        }

        let strategy = self.install_dependencies(spec).await?;
        self.write_marker(&strategy)?;
        self.sink.status("Python environment ready");
        Ok(ProvisionOutcome::Provisioned { strategy })
    }

    /// Try each strategy in order; the first one whose commands all exit zero wins.
    pub async fn install_dependencies(&self, spec: &DependencySpec) -> Result<String, ProvisionError> {
        let mut attempts = Vec::new();

        for strategy in spec.strategies() {
            let name = strategy.name();
            if !strategy.is_available() {
                tracing::info!("Skipping {} install: nothing bundled", name);
                attempts.push(StrategyAttempt {
                    strategy: name.to_string(),
                    exit_code: None,
                });
                continue;
            }

            tracing::info!("Installing dependencies using {}", name);
            self.sink.status(&format!("Installing dependencies ({})", name));

            let mut exit_code = 0;
            for command in strategy.commands(&self.tools.uv) {
                exit_code = self.run_step(&command).await?;
                if exit_code != 0 {
                    break;
                }
            }

            if exit_code == 0 {
                return Ok(name.to_string());
            }
            tracing::warn!(
                "{} install failed with exit code {}, falling back",
                name,
                exit_code
            );
            attempts.push(StrategyAttempt {
                strategy: name.to_string(),
                exit_code: Some(exit_code),
            });
        }

        Err(ProvisionError::DependenciesExhausted { attempts })
    }

    /// Remove the whole environment root, marker included.
    pub async fn reset(&self) -> Result<(), ProvisionError> {
        self.runner.shutdown().await;
        let root = &self.descriptor.root;
        if root.exists() {
            tracing::warn!("Removing environment at {}", root.display());
            std::fs::remove_dir_all(root).map_err(|e| ProvisionError::io(root, e))?;
        }
        Ok(())
    }

    /// 진단 정보를 JSON으로 반환합니다.
    pub fn status(&self) -> serde_json::Value {
        let d = &self.descriptor;
        let marker = std::fs::read_to_string(&d.marker)
            .ok()
            .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok());
        serde_json::json!({
            "provisioned": d.is_provisioned(),
            "root": d.root.to_string_lossy(),
            "venv_path": d.venv_path.to_string_lossy(),
            "interpreter": d.interpreter.to_string_lossy(),
            "interpreter_present": d.interpreter.exists(),
            "python_version": d.python_version,
            "uv_path": self.tools.uv.to_string_lossy(),
            "activate_command": d.activate_command(),
            "marker": marker,
        })
    }

    fn uv(&self, args: &[&str]) -> String {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        shell_command(&self.tools.uv.to_string_lossy(), &args)
    }

    async fn run_step(&self, command: &str) -> Result<i32, ProvisionError> {
        tracing::info!("Running: {}", command);
        let sink = self.sink.clone();
        let observer: &LineObserver = &move |line: &str| sink.log(line);

        match tokio::time::timeout(self.options.command_timeout, self.runner.run(command, Some(observer))).await {
            Ok(Ok(result)) => Ok(result.exit_code),
            Ok(Err(ShellError::SessionLost)) => Err(ProvisionError::SessionLost {
                command: command.to_string(),
            }),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                tracing::error!(
                    "No status after {:?}, giving up on the session",
                    self.options.command_timeout
                );
                self.runner.shutdown().await;
                Err(ProvisionError::SessionLost {
                    command: command.to_string(),
                })
            }
        }
    }

    fn write_marker(&self, strategy: &str) -> Result<(), ProvisionError> {
        let body = serde_json::json!({
            "python_version": self.descriptor.python_version,
            "strategy": strategy,
            "completed_at": current_timestamp(),
        });
        std::fs::write(&self.descriptor.marker, body.to_string())
            .map_err(|e| ProvisionError::io(&self.descriptor.marker, e))
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════
