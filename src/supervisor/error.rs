//! Supervisor 전용 에러 타입 — 준비 타임아웃과 프로세스 크래시를 구분합니다.

use std::time::Duration;

use super::state_machine::TransitionError;

/// Supervisor 작업 중 발생할 수 있는 에러 유형
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("Server on {host}:{port} is already running")]
    AlreadyRunning { host: String, port: u16 },

    #[error("No server is running")]
    NotRunning,

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server exited during startup (code: {code:?})")]
    ExitedDuringStartup { code: Option<i32> },

    #[error("Server failed to start within {waited:?}")]
    ReadinessTimeout { waited: Duration },

    #[error("Server did not exit within {grace:?}")]
    ShutdownTimeout { grace: Duration },

    #[error("Failed to signal process {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl SupervisorError {
    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyRunning { .. } => "ALREADY_RUNNING",
            Self::NotRunning => "NOT_RUNNING",
            Self::Spawn { .. } => "SPAWN_FAILED",
            Self::ExitedDuringStartup { .. } => "EXITED_DURING_STARTUP",
            Self::ReadinessTimeout { .. } => "READINESS_TIMEOUT",
            Self::ShutdownTimeout { .. } => "SHUTDOWN_TIMEOUT",
            Self::Signal { .. } => "SIGNAL_FAILED",
            Self::Transition(_) => "INVALID_TRANSITION",
        }
    }
}
