//! Free port scanning for the managed server.
//!
//! A port is probed by binding a listener on it and closing it straight away.
//! This only lowers the odds of a collision: another process may grab the port
//! before the server binds it, and the server's own bind is what counts.

use std::net::{SocketAddr, ToSocketAddrs};

use socket2::{Domain, Socket, Type};

#[derive(thiserror::Error, Debug)]
pub enum PortError {
    #[error("no available port on {host} in range {start}..{end}")]
    NoAvailablePort { host: String, start: u16, end: u16 },

    #[error("invalid port range {start}..{end}")]
    InvalidRange { start: u16, end: u16 },

    #[error("cannot resolve host '{host}': {reason}")]
    Resolve { host: String, reason: String },

    #[error("port scan did not complete: {0}")]
    ScanAborted(String),
}

impl PortError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NoAvailablePort { .. } => "NO_AVAILABLE_PORT",
            Self::InvalidRange { .. } => "INVALID_PORT_RANGE",
            Self::Resolve { .. } => "HOST_RESOLVE_FAILED",
            Self::ScanAborted(_) => "PORT_SCAN_ABORTED",
        }
    }
}

/// Scan input; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRange {
    pub host: String,
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(host: &str, start: u16, end: u16) -> Self {
        Self {
            host: host.to_string(),
            start,
            end,
        }
    }

    pub fn find_available(&self) -> Result<u16, PortError> {
        find_available_port(&self.host, self.start, self.end)
    }
}

/// First port in `[start, end)` that can be bound on `host`.
pub fn find_available_port(host: &str, start: u16, end: u16) -> Result<u16, PortError> {
    if start == 0 || start >= end {
        return Err(PortError::InvalidRange { start, end });
    }

    let ips: Vec<_> = (host, 0u16)
        .to_socket_addrs()
        .map_err(|e| PortError::Resolve {
            host: host.to_string(),
            reason: e.to_string(),
        })?
        .map(|addr| addr.ip())
        .collect();
    if ips.is_empty() {
        return Err(PortError::Resolve {
            host: host.to_string(),
            reason: "no addresses".to_string(),
        });
    }

    for port in start..end {
        if ips.iter().all(|ip| can_bind(SocketAddr::new(*ip, port))) {
            tracing::debug!("Port {} is free on {}", port, host);
            return Ok(port);
        }
        tracing::trace!("Port {} is in use on {}", port, host);
    }

    tracing::warn!("No free port on {} in {}..{}", host, start, end);
    Err(PortError::NoAvailablePort {
        host: host.to_string(),
        start,
        end,
    })
}

/// 블로킹 바인드 시도를 전용 스레드풀에서 실행합니다.
pub async fn find_available_port_async(host: &str, start: u16, end: u16) -> Result<u16, PortError> {
    let host = host.to_string();
    join_scan(tokio::task::spawn_blocking(move || find_available_port(&host, start, end)).await)
}

/// A panicked or cancelled scan is not the same as a full range.
fn join_scan(
    joined: Result<Result<u16, PortError>, tokio::task::JoinError>,
) -> Result<u16, PortError> {
    joined.unwrap_or_else(|e| {
        tracing::error!("Port scan task failed: {}", e);
        Err(PortError::ScanAborted(e.to_string()))
    })
}

/// Bind without SO_REUSEADDR so a port someone is listening on never looks free.
fn can_bind(addr: SocketAddr) -> bool {
    let socket = match Socket::new(Domain::for_address(addr), Type::STREAM, None) {
        Ok(s) => s,
        Err(_) => return false,
    };
    if socket.bind(&addr.into()).is_err() {
        return false;
    }
    socket.listen(1).is_ok()
}
