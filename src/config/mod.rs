use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::provisioner::{ProvisionOptions, DEFAULT_PYTHON_VERSION};
use crate::supervisor::SupervisorOptions;

pub const DEFAULT_CONFIG_PATH: &str = "config/runbox.toml";

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RunboxConfig {
    /// 환경 루트 (venv, 캐시, 마커) + 서버 입출력 디렉토리의 부모
    pub data_dir: PathBuf,
    /// 번들 리소스 (uv, requirements, wheels, app)
    pub resources_dir: PathBuf,
    pub python_version: String,
    pub host: String,
    pub port: u16,
    /// 외부에서 관리되는 서버를 그대로 사용 (프로세스를 띄우지 않음)
    pub use_external_server: bool,
    pub cpu: bool,
    /// 번들된 uv 대신 사용할 경로
    pub uv_path: Option<PathBuf>,
    /// `--key value` 로 전달되는 추가 서버 인자. 빈 값은 플래그만 전달
    pub server_args: BTreeMap<String, String>,
    pub command_timeout_secs: u64,
    pub supervisor: SupervisorConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    pub poll_interval_ms: u64,
    pub ready_timeout_secs: u64,
    pub stop_grace_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            ready_timeout_secs: 60,
            stop_grace_secs: 10,
        }
    }
}

impl Default for RunboxConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            resources_dir: PathBuf::from("resources"),
            python_version: DEFAULT_PYTHON_VERSION.to_string(),
            host: "127.0.0.1".to_string(),
            port: 8188,
            use_external_server: false,
            cpu: false,
            uv_path: None,
            server_args: BTreeMap::new(),
            command_timeout_secs: 60 * 60,
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl RunboxConfig {
    /// `RUNBOX_CONFIG` (or `config/runbox.toml`), then environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("RUNBOX_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = Self::load_from(Path::new(&path))?;
        cfg.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    /// A missing file yields defaults; a malformed one is an error.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&s).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("RUNBOX_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(host) = lookup("RUNBOX_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("RUNBOX_PORT") {
            self.port = port
                .trim()
                .parse()
                .with_context(|| format!("RUNBOX_PORT is not a port number: '{}'", port))?;
        }
        if let Some(flag) = lookup("RUNBOX_USE_EXTERNAL_SERVER") {
            self.use_external_server = flag.trim().eq_ignore_ascii_case("true") || flag.trim() == "1";
        }
        if let Some(uv) = lookup("RUNBOX_UV_PATH") {
            self.uv_path = Some(PathBuf::from(uv));
        }
        Ok(())
    }

    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            poll_interval: Duration::from_millis(self.supervisor.poll_interval_ms),
            ready_timeout: Duration::from_secs(self.supervisor.ready_timeout_secs),
            stop_grace: Duration::from_secs(self.supervisor.stop_grace_secs),
        }
    }

    pub fn provision_options(&self) -> ProvisionOptions {
        ProvisionOptions {
            command_timeout: Duration::from_secs(self.command_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let cfg = RunboxConfig::default();
        assert_eq!(cfg.port, 8188);
        assert_eq!(cfg.python_version, "3.12.7");
        assert!(!cfg.use_external_server);
        let opts = cfg.supervisor_options();
        assert_eq!(opts.ready_timeout, Duration::from_secs(60));
        assert_eq!(opts.poll_interval, Duration::from_secs(1));
        assert_eq!(opts.stop_grace, Duration::from_secs(10));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let cfg = RunboxConfig::parse(
            r#"
            data_dir = "/srv/runbox"
            port = 9000
            cpu = true

            [server_args]
            preview-method = "auto"
            disable-metadata = ""

            [supervisor]
            ready_timeout_secs = 120
            "#,
        )
        .unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/srv/runbox"));
        assert_eq!(cfg.port, 9000);
        assert!(cfg.cpu);
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.server_args.len(), 2);
        assert_eq!(cfg.supervisor.ready_timeout_secs, 120);
        assert_eq!(cfg.supervisor.stop_grace_secs, 10);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RunboxConfig::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg, RunboxConfig::default());
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runbox.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();
        assert!(RunboxConfig::load_from(&path).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("RUNBOX_DATA_DIR", "/tmp/rb"),
            ("RUNBOX_HOST", "0.0.0.0"),
            ("RUNBOX_PORT", "8200"),
            ("RUNBOX_USE_EXTERNAL_SERVER", "true"),
            ("RUNBOX_UV_PATH", "/usr/bin/uv"),
        ]
        .into_iter()
        .collect();

        let mut cfg = RunboxConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/rb"));
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 8200);
        assert!(cfg.use_external_server);
        assert_eq!(cfg.uv_path, Some(PathBuf::from("/usr/bin/uv")));
    }

    #[test]
    fn test_bad_port_override() {
        let mut cfg = RunboxConfig::default();
        let res = cfg.apply_overrides(|k| (k == "RUNBOX_PORT").then(|| "eighty".to_string()));
        assert!(res.is_err());
        assert_eq!(cfg.port, 8188);
    }
}
