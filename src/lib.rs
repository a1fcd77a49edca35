//! Local runtime provisioning and server supervision.
//!
//! - [`shell`]: one long-lived PTY shell with sentinel-based exit codes
//! - [`provisioner`]: isolated Python environment with layered dependency fallbacks
//! - [`port`]: free port scanning
//! - [`supervisor`]: spawn/adopt, readiness polling, bounded shutdown
//! - [`launcher`]: the whole flow, driven by [`config`]

pub mod config;
pub mod launcher;
pub mod port;
pub mod progress;
pub mod provisioner;
pub mod shell;
pub mod supervisor;
pub mod utils;
