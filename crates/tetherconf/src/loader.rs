//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, TetherConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/tether/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("tether/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("tether.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a config file as a raw TOML table.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    contents
        .parse()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Load config from a single TOML file.
pub fn load_from_file(path: &Path) -> Result<TetherConfig, ConfigError> {
    let table = load_table(path)?;
    from_table(table, path)
}

/// Deserialize a (possibly merged) table, filling gaps with defaults.
pub fn from_table(table: toml::Table, origin: &Path) -> Result<TetherConfig, ConfigError> {
    let mut config: TetherConfig =
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: origin.to_path_buf(),
                message: e.to_string(),
            })?;

    config.paths.socket_dir = expand_path(&config.paths.socket_dir.to_string_lossy());
    Ok(config)
}

/// Merge `overlay` into `base`; nested tables merge key by key, anything else is replaced.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut TetherConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("TETHER_SOCKET_DIR") {
        config.paths.socket_dir = expand_path(&v);
        sources.env_overrides.push("TETHER_SOCKET_DIR".to_string());
    }
    if let Ok(v) = env::var("TETHER_SOCKET_NAME") {
        config.paths.socket_name = v;
        sources.env_overrides.push("TETHER_SOCKET_NAME".to_string());
    }

    if let Ok(v) = env::var("TETHER_DONE_TIMEOUT_MS") {
        if let Ok(ms) = v.parse() {
            config.session.done_timeout_ms = ms;
            sources.env_overrides.push("TETHER_DONE_TIMEOUT_MS".to_string());
        }
    }
    if let Ok(v) = env::var("TETHER_PORT_SHRINK_POLICY") {
        if let Ok(policy) = v.parse() {
            config.session.port_shrink_policy = policy;
            sources
                .env_overrides
                .push("TETHER_PORT_SHRINK_POLICY".to_string());
        }
    }
    if let Ok(v) = env::var("TETHER_SEQ_BASE") {
        if let Ok(base) = v.parse() {
            config.session.seq_base = base;
            sources.env_overrides.push("TETHER_SEQ_BASE".to_string());
        }
    }

    if let Ok(v) = env::var("TETHER_TRANSPORT_RENEGOTIATION") {
        if let Ok(allow) = v.parse() {
            config.transport.allow_renegotiation = allow;
            sources
                .env_overrides
                .push("TETHER_TRANSPORT_RENEGOTIATION".to_string());
        }
    }
    if let Ok(v) = env::var("TETHER_TRANSPORT_WAIT_TIMEOUT_MS") {
        if let Ok(ms) = v.parse() {
            config.transport.wait_timeout_ms = ms;
            sources
                .env_overrides
                .push("TETHER_TRANSPORT_WAIT_TIMEOUT_MS".to_string());
        }
    }

    if let Ok(v) = env::var("TETHER_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("TETHER_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Ok(v) = env::var("RUST_LOG") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            home.join(stripped)
        } else {
            PathBuf::from(path)
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // Handle $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                PathBuf::from(var_value).join(&stripped[slash_pos + 1..])
            } else {
                PathBuf::from(path)
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}
