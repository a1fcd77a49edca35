use std::process::ExitCode;
use std::sync::Arc;

use runbox_core::config::RunboxConfig;
use runbox_core::launcher::Launcher;
use runbox_core::progress::{ChannelSink, ProgressEvent, ProgressSink, TracingSink};
use runbox_core::supervisor::SupervisorError;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    tracing::info!("runbox-core v{} starting", env!("CARGO_PKG_VERSION"));

    let config = match RunboxConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("Failed to load config: {:#}", e);
            return ExitCode::from(2);
        }
    };

    // 이벤트는 tracing으로 흘려보내고, 비정상 종료만 따로 알린다
    let (sink, mut events) = ChannelSink::new();
    let (crash_tx, mut crash_rx) = tokio::sync::mpsc::unbounded_channel::<Option<i32>>();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let ProgressEvent::AbnormalExit { code } = &event {
                let _ = crash_tx.send(*code);
            }
            TracingSink.emit(event);
        }
    });

    let launcher = Launcher::new(config, Arc::new(sink));
    let mut server = match launcher.run().await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("Startup failed [{}]: {}", e.error_code(), e);
            return ExitCode::FAILURE;
        }
    };
    tracing::info!("Server ready at {}", server.url());

    let Some(mut supervisor) = server.supervisor.take() else {
        // external server: nothing of ours to stop
        let _ = tokio::signal::ctrl_c().await;
        return ExitCode::SUCCESS;
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, stopping server...");
        }
        Some(code) = crash_rx.recv() => {
            tracing::error!("Server exited unexpectedly (code: {:?})", code);
            return ExitCode::FAILURE;
        }
    }

    match supervisor.stop().await {
        Ok(()) => {
            tracing::info!("Server stopped");
            ExitCode::SUCCESS
        }
        Err(SupervisorError::ShutdownTimeout { grace }) => {
            tracing::warn!("Server ignored shutdown for {:?}, killing it", grace);
            match supervisor.force_kill().await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!("Force kill failed [{}]: {}", e.error_code(), e);
                    ExitCode::FAILURE
                }
            }
        }
        Err(e) => {
            tracing::error!("Stop failed [{}]: {}", e.error_code(), e);
            ExitCode::FAILURE
        }
    }
}
