//! End-to-end startup: provision → pick a port → start (or adopt) the server.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::RunboxConfig;
use crate::port::{find_available_port_async, PortError};
use crate::progress::ProgressSink;
use crate::provisioner::{
    DependencySpec, EnvironmentDescriptor, EnvironmentProvisioner, ProvisionError, ProvisionOutcome,
    ResourcePaths, ToolPaths,
};
use crate::shell::CommandRunner;
use crate::supervisor::{HttpProbe, LaunchCommand, ServerProcessSupervisor, SupervisorError};

/// How far above the configured port the scan may go.
pub const PORT_SCAN_WIDTH: u16 = 1000;

#[derive(thiserror::Error, Debug)]
pub enum LaunchError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

impl LaunchError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Provision(e) => e.error_code(),
            Self::Port(e) => e.error_code(),
            Self::Supervisor(e) => e.error_code(),
        }
    }
}

/// Command line of the bundled server's `main.py`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerArgs {
    pub host: String,
    pub port: u16,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub user_dir: PathBuf,
    pub cpu: bool,
    /// `(name, value)`; an empty value is passed as a bare flag
    pub extra: Vec<(String, String)>,
}

impl ServerArgs {
    /// Input/output/user directories live under `data_dir`.
    pub fn new(host: &str, port: u16, data_dir: &Path) -> Self {
        Self {
            host: host.to_string(),
            port,
            input_dir: data_dir.join("input"),
            output_dir: data_dir.join("output"),
            user_dir: data_dir.join("user"),
            cpu: false,
            extra: Vec::new(),
        }
    }

    pub fn cpu(mut self, cpu: bool) -> Self {
        self.cpu = cpu;
        self
    }

    /// `listen` and `port` are owned by the launcher and dropped here.
    pub fn extra<'a, I>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        self.extra.extend(
            extra
                .into_iter()
                .filter(|(k, _)| !matches!(k.as_str(), "listen" | "port"))
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        self
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--listen".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
            "--input-directory".to_string(),
            self.input_dir.to_string_lossy().into_owned(),
            "--output-directory".to_string(),
            self.output_dir.to_string_lossy().into_owned(),
            "--user-directory".to_string(),
            self.user_dir.to_string_lossy().into_owned(),
        ];
        if self.cpu {
            args.push("--cpu".to_string());
        }
        for (key, value) in &self.extra {
            args.push(format!("--{}", key.trim_start_matches('-')));
            if !value.is_empty() {
                args.push(value.clone());
            }
        }
        args
    }

    /// `<interpreter> <app>/main.py <args…>`, run from the app directory.
    pub fn launch_command(&self, descriptor: &EnvironmentDescriptor, app_dir: &Path) -> LaunchCommand {
        let mut launch = LaunchCommand::new(&descriptor.interpreter)
            .args([app_dir.join("main.py").to_string_lossy().into_owned()])
            .args(self.to_args())
            .cwd(app_dir);
        launch.env.extend(descriptor.session_env());
        launch
    }
}

/// Result of a successful launch.
pub struct LaunchedServer {
    pub host: String,
    pub port: u16,
    pub provisioning: ProvisionOutcome,
    /// `None` in external-server mode: nothing was started, nothing to stop.
    pub supervisor: Option<ServerProcessSupervisor<HttpProbe>>,
}

impl LaunchedServer {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

pub struct Launcher {
    config: RunboxConfig,
    sink: Arc<dyn ProgressSink>,
}

impl Launcher {
    pub fn new(config: RunboxConfig, sink: Arc<dyn ProgressSink>) -> Self {
        Self { config, sink }
    }

    pub fn config(&self) -> &RunboxConfig {
        &self.config
    }

    pub fn resources(&self) -> ResourcePaths {
        ResourcePaths::new(&self.config.resources_dir)
    }

    pub fn descriptor(&self) -> EnvironmentDescriptor {
        EnvironmentDescriptor::new(&self.config.data_dir, &self.config.python_version)
    }

    pub fn tools(&self) -> ToolPaths {
        match &self.config.uv_path {
            Some(uv) => ToolPaths { uv: uv.clone() },
            None => ToolPaths::bundled(&self.resources()),
        }
    }

    /// Provision through a PTY shell, then start.
    pub async fn run(&self) -> Result<LaunchedServer, LaunchError> {
        let provisioner = EnvironmentProvisioner::with_pty(self.descriptor(), self.tools(), self.sink.clone())
            .with_options(self.config.provision_options());
        self.run_with(&provisioner).await
    }

    pub async fn run_with<R: CommandRunner>(
        &self,
        provisioner: &EnvironmentProvisioner<R>,
    ) -> Result<LaunchedServer, LaunchError> {
        let resources = self.resources();
        let provisioning = provisioner
            .ensure_provisioned(&DependencySpec::for_host(&resources))
            .await?;

        let host = self.config.host.clone();
        if self.config.use_external_server {
            let port = self.config.port;
            tracing::info!("Using external server at http://{}:{}", host, port);
            self.sink
                .status(&format!("Using external server at http://{}:{}", host, port));
            return Ok(LaunchedServer {
                host,
                port,
                provisioning,
                supervisor: None,
            });
        }

        let start = self.config.port;
        let port = find_available_port_async(&host, start, start.saturating_add(PORT_SCAN_WIDTH)).await?;
        if port != start {
            tracing::info!("Port {} is busy, using {}", start, port);
        }

        let args = ServerArgs::new(&host, port, &self.config.data_dir)
            .cpu(self.config.cpu)
            .extra(&self.config.server_args);
        let launch = args.launch_command(provisioner.descriptor(), &resources.app_dir());

        let mut supervisor = ServerProcessSupervisor::new(
            HttpProbe::default(),
            self.sink.clone(),
            self.config.supervisor_options(),
        );
        supervisor.start(&host, port, launch).await?;

        Ok(LaunchedServer {
            host,
            port,
            provisioning,
            supervisor: Some(supervisor),
        })
    }
}
