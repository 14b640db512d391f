//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;
use mooring_core::error::{MooringError, MooringResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_socket_port")]
    pub socket_port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            socket_port: default_socket_port(),
            http_port: default_http_port(),
        }
    }
}

fn default_socket_port() -> u16 {
    7440
}
fn default_http_port() -> u16 {
    7441
}

/// Resolved server configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub socket_port: u16,
    pub http_port: u16,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_socket_port: Option<u16>,
        cli_http_port: Option<u16>,
    ) -> MooringResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| MooringError::Other(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        Ok(Self {
            socket_port: cli_socket_port.unwrap_or(file_config.server.socket_port),
            http_port: cli_http_port.unwrap_or(file_config.server.http_port),
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s.as_ref())
}
