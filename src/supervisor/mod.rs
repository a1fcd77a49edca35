//! Server process supervisor
//!
//! 서버 프로세스 하나의 수명 주기를 관리한다:
//! 이미 응답하는 인스턴스가 있으면 채택하고, 없으면 직접 띄운 뒤
//! 준비 probe가 성공할 때까지 (상한 시간 내에서) 폴링한다.
//! 실행 중 비정상 종료는 watcher 태스크가 감지해 보고한다.

pub mod error;
pub mod managed_process;
pub mod probe;
pub mod state_machine;

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub use error::SupervisorError;
pub use managed_process::{ExitReport, LogLine, LogSource, ManagedProcess};
pub use probe::{HttpProbe, ReadinessProbe, TcpProbe};
pub use state_machine::{ServerState, StateMachine, TransitionError};

use crate::progress::{ProgressEvent, ProgressSink};

/// How long `force_kill` waits for the kernel to reap the child.
const FORCE_KILL_WAIT: Duration = Duration::from_secs(5);

/// Program, arguments, working directory and extra environment for the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Delay between readiness probes
    pub poll_interval: Duration,
    /// Ceiling on the whole readiness wait
    pub ready_timeout: Duration,
    /// How long `stop` waits after the termination request
    pub stop_grace: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            ready_timeout: Duration::from_secs(60),
            stop_grace: Duration::from_secs(10),
        }
    }
}

/// The supervised server: where it listens, what state it is in, and the
/// process behind it (absent when an existing instance was adopted).
pub struct ManagedProcessHandle {
    host: String,
    port: u16,
    process: Option<ManagedProcess>,
    state: Arc<StdMutex<StateMachine>>,
}

impl ManagedProcessHandle {
    fn new(host: &str, port: u16, process: Option<ManagedProcess>, machine: StateMachine) -> Self {
        Self {
            host: host.to_string(),
            port,
            process,
            state: Arc::new(StdMutex::new(machine)),
        }
    }

    /// `None` for adopted instances: we never learned (or own) their pid.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn is_adopted(&self) -> bool {
        self.process.is_none()
    }

    pub fn process(&self) -> Option<&ManagedProcess> {
        self.process.as_ref()
    }

    pub fn state(&self) -> ServerState {
        lock_state(&self.state).state
    }

    fn transition(&self, sink: &dyn ProgressSink, to: ServerState) -> Result<(), TransitionError> {
        lock_state(&self.state).transition(to)?;
        sink.emit(ProgressEvent::Lifecycle(to));
        Ok(())
    }
}

fn lock_state(state: &StdMutex<StateMachine>) -> MutexGuard<'_, StateMachine> {
    // 상태 전이는 패닉하지 않으므로 poison은 무시해도 안전
    state.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct ServerProcessSupervisor<P: ReadinessProbe = HttpProbe> {
    probe: P,
    sink: Arc<dyn ProgressSink>,
    options: SupervisorOptions,
    handle: Option<ManagedProcessHandle>,
    watcher: Option<JoinHandle<()>>,
}

impl<P: ReadinessProbe> ServerProcessSupervisor<P> {
    pub fn new(probe: P, sink: Arc<dyn ProgressSink>, options: SupervisorOptions) -> Self {
        Self {
            probe,
            sink,
            options,
            handle: None,
            watcher: None,
        }
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    pub fn handle(&self) -> Option<&ManagedProcessHandle> {
        self.handle.as_ref()
    }

    pub fn state(&self) -> Option<ServerState> {
        self.handle.as_ref().map(|h| h.state())
    }

    /// Live server output. `None` when nothing was spawned.
    pub fn subscribe_logs(&self) -> Option<broadcast::Receiver<LogLine>> {
        self.handle
            .as_ref()
            .and_then(|h| h.process.as_ref())
            .map(|p| p.subscribe())
    }

    /// Adopt an instance already answering on `host:port`, or spawn `launch`
    /// and wait until it answers.
    pub async fn start(
        &mut self,
        host: &str,
        port: u16,
        launch: LaunchCommand,
    ) -> Result<&ManagedProcessHandle, SupervisorError> {
        if let Some(existing) = &self.handle {
            if !existing.state().is_terminal() {
                return Err(SupervisorError::AlreadyRunning {
                    host: existing.host.clone(),
                    port: existing.port,
                });
            }
        }
        self.abort_watcher();

        if self.probe.is_ready(host, port).await {
            tracing::info!("Server already answering on {}:{}, adopting it", host, port);
            self.sink
                .status(&format!("Using running server at http://{}:{}", host, port));
            let handle = self
                .handle
                .insert(ManagedProcessHandle::new(host, port, None, StateMachine::adopted()));
            self.sink.emit(ProgressEvent::Lifecycle(ServerState::Ready));
            handle.transition(&*self.sink, ServerState::Running)?;
            return Ok(handle);
        }

        tracing::info!(
            "Starting server: {} {}",
            launch.program.display(),
            launch.args.join(" ")
        );
        self.sink.status("Starting server");
        let process = ManagedProcess::spawn(&launch, self.sink.clone()).await?;
        let handle = self
            .handle
            .insert(ManagedProcessHandle::new(host, port, Some(process), StateMachine::new()));
        self.sink.emit(ProgressEvent::Lifecycle(ServerState::Starting));

        let Some(process) = handle.process.as_ref() else {
            return Err(SupervisorError::NotRunning);
        };
        match wait_until_ready(&self.probe, process, host, port, &self.options).await {
            Ok(elapsed) => {
                tracing::info!("Server on {}:{} ready after {:?}", host, port, elapsed);
                handle.transition(&*self.sink, ServerState::Ready)?;
                handle.transition(&*self.sink, ServerState::Running)?;
                self.watcher = Some(spawn_exit_watcher(
                    handle.state.clone(),
                    process.exit_receiver(),
                    self.sink.clone(),
                ));
                self.sink
                    .status(&format!("Server ready at http://{}:{}", host, port));
                Ok(handle)
            }
            Err(e) => {
                tracing::error!("Server on {}:{} failed to start: {}", host, port, e);
                if matches!(e, SupervisorError::ReadinessTimeout { .. }) {
                    // 응답 없는 프로세스를 남겨두지 않는다
                    if let Err(kill_err) = process.terminate() {
                        tracing::warn!("Could not terminate hung server: {}", kill_err);
                    }
                }
                if let Err(te) = handle.transition(&*self.sink, ServerState::Failed) {
                    tracing::warn!("{}", te);
                }
                Err(e)
            }
        }
    }

    /// Ask the server to exit and wait up to the grace period.
    ///
    /// On `ShutdownTimeout` the process is left alive and in `Stopping`;
    /// escalating with [`force_kill`](Self::force_kill) is the caller's call.
    pub async fn stop(&mut self) -> Result<(), SupervisorError> {
        let handle = self.handle.as_ref().ok_or(SupervisorError::NotRunning)?;

        let entered = {
            let mut sm = lock_state(&handle.state);
            match sm.state {
                ServerState::Running => {
                    sm.transition(ServerState::Stopping)?;
                    true
                }
                // a previous stop timed out
                ServerState::Stopping => false,
                _ => return Err(SupervisorError::NotRunning),
            }
        };
        if entered {
            self.sink.emit(ProgressEvent::Lifecycle(ServerState::Stopping));
        }

        let Some(process) = handle.process.as_ref() else {
            tracing::info!(
                "Leaving adopted server on {}:{} running",
                handle.host,
                handle.port
            );
            handle.transition(&*self.sink, ServerState::Stopped)?;
            return Ok(());
        };

        self.sink.status("Stopping server");
        process.terminate()?;
        let grace = self.options.stop_grace;
        match tokio::time::timeout(grace, process.wait_for_exit()).await {
            Ok(report) => {
                if let Some(report) = report {
                    tracing::info!("Server stopped: {}", report.description);
                }
                handle.transition(&*self.sink, ServerState::Stopped)?;
                self.abort_watcher();
                Ok(())
            }
            Err(_) => {
                tracing::warn!("Server (pid {}) still alive after {:?}", process.pid, grace);
                Err(SupervisorError::ShutdownTimeout { grace })
            }
        }
    }

    /// Kill the spawned server outright. Adopted instances are only released.
    pub async fn force_kill(&mut self) -> Result<(), SupervisorError> {
        let handle = self.handle.as_ref().ok_or(SupervisorError::NotRunning)?;
        if handle.is_adopted() {
            return self.stop().await;
        }

        let entered = {
            let mut sm = lock_state(&handle.state);
            if sm.state == ServerState::Running {
                sm.transition(ServerState::Stopping)?;
                true
            } else {
                false
            }
        };
        if entered {
            self.sink.emit(ProgressEvent::Lifecycle(ServerState::Stopping));
        }

        if let Some(process) = handle.process.as_ref() {
            process.force_kill()?;
            if tokio::time::timeout(FORCE_KILL_WAIT, process.wait_for_exit())
                .await
                .is_err()
            {
                tracing::warn!("pid {} not reaped after KILL", process.pid);
            }
        }

        if handle.state() == ServerState::Stopping {
            handle.transition(&*self.sink, ServerState::Stopped)?;
        }
        self.abort_watcher();
        Ok(())
    }

    fn abort_watcher(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

/// Poll the probe until it succeeds, the child exits, or the ceiling passes.
async fn wait_until_ready<P: ReadinessProbe>(
    probe: &P,
    process: &ManagedProcess,
    host: &str,
    port: u16,
    options: &SupervisorOptions,
) -> Result<Duration, SupervisorError> {
    let started = Instant::now();
    loop {
        if let Some(report) = process.exit_report() {
            return Err(SupervisorError::ExitedDuringStartup { code: report.code });
        }
        let waited = started.elapsed();
        if waited >= options.ready_timeout {
            return Err(SupervisorError::ReadinessTimeout { waited });
        }

        // 단일 probe가 상한을 넘기지 않도록 남은 시간으로 자른다
        let remaining = options.ready_timeout - waited;
        if let Ok(true) = tokio::time::timeout(remaining, probe.is_ready(host, port)).await {
            return Ok(started.elapsed());
        }

        let remaining = options.ready_timeout.saturating_sub(started.elapsed());
        let nap = options.poll_interval.min(remaining);
        tokio::select! {
            _ = tokio::time::sleep(nap) => {}
            report = process.wait_for_exit() => {
                if report.is_none() {
                    tokio::time::sleep(nap).await;
                }
            }
        }
    }
}

/// Report an exit that nobody asked for. Exits during `Stopping` are expected.
fn spawn_exit_watcher(
    state: Arc<StdMutex<StateMachine>>,
    exit_rx: watch::Receiver<Option<ExitReport>>,
    sink: Arc<dyn ProgressSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let report = managed_process::wait_for_report(exit_rx).await;
        let code = report.as_ref().and_then(|r| r.code);

        let failed = {
            let mut sm = lock_state(&state);
            sm.state == ServerState::Running && sm.transition(ServerState::Failed).is_ok()
        };
        if failed {
            tracing::error!(
                "Server exited unexpectedly: {}",
                report.map(|r| r.description).unwrap_or_default()
            );
            sink.emit(ProgressEvent::AbnormalExit { code });
            sink.emit(ProgressEvent::Lifecycle(ServerState::Failed));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ChannelSink;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Ready from the `ready_from`-th call on (1-based). The adoption check is call 1.
    struct CountingProbe {
        calls: AtomicUsize,
        ready_from: usize,
    }

    impl CountingProbe {
        fn ready_from(n: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                ready_from: n,
            }
        }

        fn never() -> Self {
            Self::ready_from(usize::MAX)
        }
    }

    #[async_trait]
    impl ReadinessProbe for CountingProbe {
        async fn is_ready(&self, _host: &str, _port: u16) -> bool {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            n >= self.ready_from
        }
    }

    fn fast() -> SupervisorOptions {
        SupervisorOptions {
            poll_interval: Duration::from_millis(50),
            ready_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(5),
        }
    }

    fn supervisor(
        probe: CountingProbe,
        options: SupervisorOptions,
    ) -> (ServerProcessSupervisor<CountingProbe>, UnboundedReceiver<ProgressEvent>) {
        let (sink, rx) = ChannelSink::new();
        (ServerProcessSupervisor::new(probe, Arc::new(sink), options), rx)
    }

    fn lifecycle(rx: &mut UnboundedReceiver<ProgressEvent>) -> Vec<ServerState> {
        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ProgressEvent::Lifecycle(s) = event {
                states.push(s);
            }
        }
        states
    }

    #[tokio::test]
    async fn test_adopts_running_instance() {
        let (mut sup, mut rx) = supervisor(CountingProbe::ready_from(1), fast());
        // the program does not exist: adoption must not spawn anything
        let handle = sup
            .start("127.0.0.1", 8188, LaunchCommand::new("/definitely/not/a/program"))
            .await
            .unwrap();
        assert!(handle.is_adopted());
        assert_eq!(handle.pid(), None);
        assert_eq!(handle.state(), ServerState::Running);
        assert!(sup.subscribe_logs().is_none());

        sup.stop().await.unwrap();
        assert_eq!(sup.state(), Some(ServerState::Stopped));
        assert_eq!(
            lifecycle(&mut rx),
            vec![ServerState::Ready, ServerState::Running, ServerState::Stopping, ServerState::Stopped]
        );
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (mut sup, _rx) = supervisor(CountingProbe::ready_from(1), fast());
        sup.start("127.0.0.1", 8188, LaunchCommand::new("x")).await.unwrap();
        let err = sup.start("127.0.0.1", 8188, LaunchCommand::new("x")).await.err().unwrap();
        assert_eq!(err.error_code(), "ALREADY_RUNNING");
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let (mut sup, _rx) = supervisor(CountingProbe::never(), fast());
        assert!(matches!(sup.stop().await, Err(SupervisorError::NotRunning)));
        assert!(sup.state().is_none());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let (mut sup, _rx) = supervisor(CountingProbe::never(), fast());
        let err = sup
            .start("127.0.0.1", 8188, LaunchCommand::new("/definitely/not/a/program"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.error_code(), "SPAWN_FAILED");
        assert!(sup.handle().is_none());
    }

    #[cfg(unix)]
    mod unix {
        use super::*;

        fn sh(script: &str) -> LaunchCommand {
            LaunchCommand::new("/bin/sh").args(["-c", script])
        }

        async fn next_abnormal(rx: &mut UnboundedReceiver<ProgressEvent>) -> Option<i32> {
            loop {
                match rx.recv().await {
                    Some(ProgressEvent::AbnormalExit { code }) => return code,
                    Some(_) => continue,
                    None => panic!("sink closed before abnormal exit"),
                }
            }
        }

        #[tokio::test]
        async fn test_ready_then_clean_stop() {
            let (mut sup, mut rx) = supervisor(CountingProbe::ready_from(3), fast());
            let handle = sup.start("127.0.0.1", 8188, sh("sleep 30")).await.unwrap();
            assert!(handle.pid().is_some());
            assert!(!handle.is_adopted());
            assert!(sup.subscribe_logs().is_some());

            sup.stop().await.unwrap();
            assert_eq!(sup.state(), Some(ServerState::Stopped));

            let states = lifecycle(&mut rx);
            assert_eq!(
                states,
                vec![
                    ServerState::Starting,
                    ServerState::Ready,
                    ServerState::Running,
                    ServerState::Stopping,
                    ServerState::Stopped
                ]
            );
            assert_eq!(states.iter().filter(|s| **s == ServerState::Ready).count(), 1);
        }

        #[tokio::test]
        async fn test_readiness_timeout_is_bounded() {
            let options = SupervisorOptions {
                ready_timeout: Duration::from_millis(400),
                ..fast()
            };
            let (mut sup, _rx) = supervisor(CountingProbe::never(), options);

            let started = std::time::Instant::now();
            let err = sup.start("127.0.0.1", 8188, sh("sleep 30")).await.err().unwrap();
            assert!(started.elapsed() < Duration::from_secs(2));
            match err {
                SupervisorError::ReadinessTimeout { waited } => {
                    assert!(waited >= Duration::from_millis(400))
                }
                other => panic!("unexpected error: {:?}", other),
            }
            assert_eq!(sup.state(), Some(ServerState::Failed));

            // the hung child was told to go away
            let process = sup.handle().unwrap().process().unwrap();
            let report = tokio::time::timeout(Duration::from_secs(5), process.wait_for_exit())
                .await
                .unwrap();
            assert!(report.is_some());
        }

        #[tokio::test]
        async fn test_exit_during_startup_is_not_a_timeout() {
            let (mut sup, _rx) = supervisor(CountingProbe::never(), fast());
            let started = std::time::Instant::now();
            let err = sup.start("127.0.0.1", 8188, sh("exit 2")).await.err().unwrap();
            assert!(matches!(err, SupervisorError::ExitedDuringStartup { code: Some(2) }));
            assert!(started.elapsed() < Duration::from_secs(5));
            assert_eq!(sup.state(), Some(ServerState::Failed));

            // a failed handle does not block the next attempt on the same supervisor
            let err = sup.start("127.0.0.1", 8188, sh("exit 3")).await.err().unwrap();
            assert!(matches!(err, SupervisorError::ExitedDuringStartup { code: Some(3) }));
            assert_eq!(sup.state(), Some(ServerState::Failed));
        }

        #[tokio::test]
        async fn test_restart_after_failed_start() {
            let (mut sup, _rx) = supervisor(CountingProbe::never(), fast());
            sup.start("127.0.0.1", 8188, sh("exit 1")).await.err().unwrap();
            assert_eq!(sup.state(), Some(ServerState::Failed));

            // next start: adoption check misses, first poll answers
            sup.probe.ready_from = sup.probe.calls.load(Ordering::SeqCst) + 2;
            let handle = sup.start("127.0.0.1", 8188, sh("sleep 30")).await.unwrap();
            assert!(!handle.is_adopted());
            assert!(handle.pid().is_some());
            assert_eq!(sup.state(), Some(ServerState::Running));

            sup.stop().await.unwrap();
            assert_eq!(sup.state(), Some(ServerState::Stopped));
        }

        #[tokio::test]
        async fn test_stop_returns_when_child_exits_within_grace() {
            let options = SupervisorOptions {
                stop_grace: Duration::from_secs(10),
                ..fast()
            };
            let (mut sup, mut rx) = supervisor(CountingProbe::ready_from(2), options);
            // TERM을 받고 2초 뒤에 스스로 종료
            sup.start(
                "127.0.0.1",
                8188,
                sh("trap 'kill $! 2>/dev/null; sleep 2; exit 0' TERM; sleep 30 & wait"),
            )
            .await
            .unwrap();
            // trap이 설치될 시간
            tokio::time::sleep(Duration::from_millis(300)).await;

            let started = std::time::Instant::now();
            sup.stop().await.unwrap();
            let took = started.elapsed();
            assert!(took >= Duration::from_millis(1500), "stopped after {:?}", took);
            assert!(took < Duration::from_secs(8), "stopped after {:?}", took);
            assert_eq!(sup.state(), Some(ServerState::Stopped));

            let mut events = Vec::new();
            while let Ok(event) = rx.try_recv() {
                events.push(event);
            }
            assert!(!events
                .iter()
                .any(|e| matches!(e, ProgressEvent::AbnormalExit { .. })));
        }

        #[tokio::test(start_paused = true)]
        async fn test_readiness_ceiling_with_default_timing() {
            let (mut sup, _rx) = supervisor(CountingProbe::never(), SupervisorOptions::default());

            let started = Instant::now();
            let err = sup.start("127.0.0.1", 8188, sh("sleep 3600")).await.err().unwrap();
            let took = started.elapsed();
            match err {
                SupervisorError::ReadinessTimeout { waited } => {
                    assert!(waited >= Duration::from_secs(60), "waited {:?}", waited);
                    assert!(waited <= Duration::from_secs(61), "waited {:?}", waited);
                }
                other => panic!("unexpected error: {:?}", other),
            }
            assert!(took <= Duration::from_secs(61), "took {:?}", took);
            assert_eq!(sup.state(), Some(ServerState::Failed));
            // one probe per poll interval, plus the adoption check
            let calls = sup.probe.calls.load(Ordering::SeqCst);
            assert!((55..=63).contains(&calls), "{} readiness checks", calls);

            if let Some(process) = sup.handle().and_then(|h| h.process()) {
                let _ = process.force_kill();
            }
        }

        #[tokio::test]
        async fn test_abnormal_exit_reported() {
            let (mut sup, mut rx) = supervisor(CountingProbe::ready_from(2), fast());
            sup.start("127.0.0.1", 8188, sh("sleep 0.5; exit 7")).await.unwrap();
            assert_eq!(sup.state(), Some(ServerState::Running));

            let code = tokio::time::timeout(Duration::from_secs(5), next_abnormal(&mut rx))
                .await
                .unwrap();
            assert_eq!(code, Some(7));
            assert_eq!(sup.state(), Some(ServerState::Failed));
            assert!(matches!(sup.stop().await, Err(SupervisorError::NotRunning)));
        }

        #[tokio::test]
        async fn test_shutdown_timeout_then_force_kill() {
            let options = SupervisorOptions {
                stop_grace: Duration::from_millis(300),
                ..fast()
            };
            let (mut sup, mut rx) = supervisor(CountingProbe::ready_from(2), options);
            sup.start("127.0.0.1", 8188, sh("trap '' TERM; sleep 30")).await.unwrap();

            let err = sup.stop().await.err().unwrap();
            assert!(matches!(err, SupervisorError::ShutdownTimeout { .. }));
            assert_eq!(sup.state(), Some(ServerState::Stopping));

            sup.force_kill().await.unwrap();
            assert_eq!(sup.state(), Some(ServerState::Stopped));

            let mut events = Vec::new();
            while let Ok(event) = rx.try_recv() {
                events.push(event);
            }
            assert!(!events
                .iter()
                .any(|e| matches!(e, ProgressEvent::AbnormalExit { .. })));
        }
    }
}
