//! Configuration loading and storage.
//!
//! Settings live in a TOML file under the platform config directory and can
//! be overridden per-invocation by CLI flags. Every field has a default so a
//! missing file just means "run with defaults".

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the coordinator server listens on.
    pub bind_addr: String,
    /// Server URL clients connect to.
    pub server_url: String,
    /// Shared secret for minting/verifying connect tokens.
    pub shared_secret: String,
    /// External transcription/insight service endpoint. None disables the
    /// pipeline entirely.
    pub inference_url: Option<String>,
    /// Timeout for one inference request, in seconds.
    pub inference_timeout_secs: u64,
    /// Ceiling on a single signaling payload, in bytes. Oversized messages
    /// are rejected without closing the connection.
    pub max_signal_payload: usize,
    /// Flush a speaker's audio buffer once it reaches this many bytes.
    pub pipeline_flush_bytes: usize,
    /// ...or once the oldest byte in it is this old, in seconds.
    pub pipeline_flush_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9090".to_string(),
            server_url: "ws://127.0.0.1:9090".to_string(),
            shared_secret: "dev-secret".to_string(),
            inference_url: None,
            inference_timeout_secs: 10,
            max_signal_payload: 256 * 1024,
            pipeline_flush_bytes: 64 * 1024,
            pipeline_flush_secs: 3,
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("io", "huddle", "huddle")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;

        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).context("Failed to write config file")?;

        // The file holds the shared secret.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }
}
