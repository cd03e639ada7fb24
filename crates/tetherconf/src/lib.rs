//! Configuration loading for tether.
//!
//! Every tether crate imports this one, so it stays small: serde, toml and
//! directories, nothing async.
//!
//! # Usage
//!
//! ```rust,no_run
//! use tetherconf::TetherConfig;
//!
//! let config = TetherConfig::load().expect("Failed to load config");
//! println!("socket: {}", config.paths.socket_path().display());
//! println!("done timeout: {:?}", config.session.done_timeout());
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/tether/config.toml` (system)
//! 2. `~/.config/tether/config.toml` (user)
//! 3. `./tether.toml` (local override, replaced by `--config` when given)
//! 4. Environment variables (`TETHER_*`, `RUST_LOG`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! socket_dir = "/run/user/1000"
//! socket_name = "tether-0"
//!
//! [session]
//! done_timeout_ms = 5000
//! port_shrink_policy = "force_remove"
//! seq_base = 1
//!
//! [transport]
//! allow_renegotiation = true
//! wait_timeout_ms = 2000
//! ring_capacity = 64
//!
//! [telemetry]
//! log_level = "info,tether=debug"
//! ```

pub mod infra;
pub mod loader;
pub mod session;

pub use infra::{PathsConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};
pub use session::{PortShrinkPolicy, SessionConfig, TransportConfig};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Complete tether configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TetherConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl TetherConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with `config_path` replacing the local override.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::load_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let mut config = loader::from_table(merged, Path::new("<merged>"))?;
        loader::apply_env_overrides(&mut config, &mut sources);
        config.validate()?;

        Ok((config, sources))
    }

    /// Reject combinations the runtime cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.transport.ring_capacity.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "transport.ring_capacity must be a power of two, got {}",
                self.transport.ring_capacity
            )));
        }
        if self.session.max_fds == 0 {
            return Err(ConfigError::Invalid(
                "session.max_fds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::new();

        output.push_str("# tether configuration\n\n");

        output.push_str("[paths]\n");
        output.push_str(&format!(
            "socket_dir = \"{}\"\n",
            self.paths.socket_dir.display()
        ));
        output.push_str(&format!("socket_name = \"{}\"\n", self.paths.socket_name));

        output.push_str("\n[session]\n");
        output.push_str(&format!(
            "done_timeout_ms = {}\n",
            self.session.done_timeout_ms
        ));
        output.push_str(&format!(
            "port_shrink_policy = \"{}\"\n",
            self.session.port_shrink_policy
        ));
        output.push_str(&format!("seq_base = {}\n", self.session.seq_base));
        output.push_str(&format!(
            "max_frame_bytes = {}\n",
            self.session.max_frame_bytes
        ));
        output.push_str(&format!("max_fds = {}\n", self.session.max_fds));

        output.push_str("\n[transport]\n");
        output.push_str(&format!(
            "allow_renegotiation = {}\n",
            self.transport.allow_renegotiation
        ));
        output.push_str(&format!(
            "wait_timeout_ms = {}\n",
            self.transport.wait_timeout_ms
        ));
        output.push_str(&format!(
            "ring_capacity = {}\n",
            self.transport.ring_capacity
        ));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!(
            "log_level = \"{}\"\n",
            self.telemetry.log_level
        ));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TetherConfig::default();
        assert_eq!(config.session.done_timeout_ms, 5_000);
        assert_eq!(config.session.port_shrink_policy, PortShrinkPolicy::Reject);
        assert!(config.transport.allow_renegotiation);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_to_toml_reparses() {
        let mut config = TetherConfig::default();
        config.session.port_shrink_policy = PortShrinkPolicy::ForceRemove;
        config.transport.ring_capacity = 128;

        let rendered = config.to_toml();
        assert!(rendered.contains("[session]"));
        assert!(rendered.contains("port_shrink_policy = \"force_remove\""));

        let reparsed: TetherConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn test_validate_rejects_odd_ring() {
        let mut config = TetherConfig::default();
        config.transport.ring_capacity = 48;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
