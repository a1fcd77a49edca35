//! Readiness probes.
//!
//! A probe answers one question: is something on `host:port` serving requests
//! right now. It never errors; anything short of a clean answer is "not ready".

use std::time::Duration;

use async_trait::async_trait;

pub const DEFAULT_PROBE_PATH: &str = "/queue";
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn is_ready(&self, host: &str, port: u16) -> bool;
}

/// `GET http://host:port/<path>`; any 2xx counts as ready.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    path: String,
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_PATH, DEFAULT_PROBE_TIMEOUT)
    }
}

impl HttpProbe {
    pub fn new(path: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("HTTP client builder failed ({}), using defaults", e);
                reqwest::Client::new()
            });
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        Self { client, path }
    }

    pub fn url(&self, host: &str, port: u16) -> String {
        // IPv6 리터럴은 대괄호로 감싼다
        if host.contains(':') && !host.starts_with('[') {
            format!("http://[{}]:{}{}", host, port, self.path)
        } else {
            format!("http://{}:{}{}", host, port, self.path)
        }
    }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    async fn is_ready(&self, host: &str, port: u16) -> bool {
        let url = self.url(host, port);
        match self.client.get(&url).send().await {
            Ok(resp) => {
                tracing::trace!("Probe {} -> {}", url, resp.status());
                resp.status().is_success()
            }
            Err(e) => {
                tracing::trace!("Probe {} failed: {}", url, e);
                false
            }
        }
    }
}

/// Plain TCP connect. Cheaper than HTTP, but a bound socket is not a ready app.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    async fn is_ready(&self, host: &str, port: u16) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect((host, port))).await,
            Ok(Ok(_))
        )
    }
}
