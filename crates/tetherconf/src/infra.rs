//! Infrastructure configuration - things that cannot change at runtime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem locations for the control socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding the server's control socket.
    /// Default: $XDG_RUNTIME_DIR, falling back to /tmp
    #[serde(default = "PathsConfig::default_socket_dir")]
    pub socket_dir: PathBuf,

    /// File name of the control socket inside `socket_dir`.
    /// Default: tether-0
    #[serde(default = "PathsConfig::default_socket_name")]
    pub socket_name: String,
}

impl PathsConfig {
    fn default_socket_dir() -> PathBuf {
        directories::BaseDirs::new()
            .and_then(|dirs| dirs.runtime_dir().map(|d| d.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("/tmp"))
    }

    fn default_socket_name() -> String {
        "tether-0".to_string()
    }

    /// Full path of the control socket.
    pub fn socket_path(&self) -> PathBuf {
        self.socket_dir.join(&self.socket_name)
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            socket_dir: Self::default_socket_dir(),
            socket_name: Self::default_socket_name(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter directive (trace, debug, info, warn, error, or an EnvFilter string).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}
