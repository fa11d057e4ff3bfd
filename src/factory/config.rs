//! Runtime configuration for the build orchestrator server: database
//! path, bind address, sandbox/object-store settings, and the named
//! concurrency/flush constants from spec §5.
//!
//! Grounded in `crate::config::Config`'s layering style (typed struct,
//! env-var overrides with sensible defaults, a `with_cli_args`-equivalent
//! constructor) and `forge_config::ForgeConfig`'s TOML-plus-env precedence,
//! simplified to what an HTTP-server-only binary needs.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Maximum agents running a build's Parallel Executor wave concurrently.
pub const MAX_PARALLEL_AGENTS: usize = 3;
pub const PERSISTENCE_FLUSH_INTERVAL_MS: u64 = 500;
pub const PERSISTENCE_FLUSH_SIZE: usize = 10;
pub const SSE_HEARTBEAT_SECS: u64 = 15;
pub const SSE_POLL_INTERVAL_SECS: u64 = 2;
pub const EVENT_BUS_RING_CAPACITY: usize = 2000;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub bind_addr: String,
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    pub sandbox_image: String,
    pub sandbox_timeout_secs: u64,
    pub object_store_bucket: Option<String>,
    pub cors_permissive: bool,
}

/// `.forge/orchestrator.toml` layout, all fields optional — every value
/// falls back to an environment variable, then a default.
#[derive(Debug, Deserialize, Default)]
struct OrchestratorToml {
    bind_addr: Option<String>,
    db_path: Option<String>,
    data_dir: Option<String>,
    sandbox_image: Option<String>,
    sandbox_timeout_secs: Option<u64>,
    object_store_bucket: Option<String>,
    cors_permissive: Option<bool>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            db_path: PathBuf::from(".forge/orchestrator.sqlite3"),
            data_dir: PathBuf::from(".forge/data"),
            sandbox_image: "forge-build:latest".to_string(),
            sandbox_timeout_secs: 1800,
            object_store_bucket: None,
            cors_permissive: false,
        }
    }
}

impl OrchestratorConfig {
    /// Load `config_path` if it exists (TOML), then apply environment
    /// variable overrides, then defaults for anything still unset.
    pub fn load(config_path: &std::path::Path) -> Result<Self> {
        let toml = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .with_context(|| format!("failed to read {}", config_path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("failed to parse {}", config_path.display()))?
        } else {
            OrchestratorToml::default()
        };

        let default = Self::default();

        Ok(Self {
            bind_addr: env_or("ORCHESTRATOR_BIND_ADDR")
                .or(toml.bind_addr)
                .unwrap_or(default.bind_addr),
            db_path: env_or("ORCHESTRATOR_DB_PATH")
                .or(toml.db_path)
                .map(PathBuf::from)
                .unwrap_or(default.db_path),
            data_dir: env_or("ORCHESTRATOR_DATA_DIR")
                .or(toml.data_dir)
                .map(PathBuf::from)
                .unwrap_or(default.data_dir),
            sandbox_image: env_or("SANDBOX_IMAGE")
                .or(toml.sandbox_image)
                .unwrap_or(default.sandbox_image),
            sandbox_timeout_secs: env_or("SANDBOX_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .or(toml.sandbox_timeout_secs)
                .unwrap_or(default.sandbox_timeout_secs),
            object_store_bucket: env_or("OBJECT_STORE_BUCKET").or(toml.object_store_bucket),
            cors_permissive: env_or("ORCHESTRATOR_CORS_PERMISSIVE")
                .map(|v| v == "true")
                .or(toml.cors_permissive)
                .unwrap_or(default.cors_permissive),
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create database directory")?;
        }
        std::fs::create_dir_all(&self.data_dir).context("failed to create data directory")?;
        Ok(())
    }
}

fn env_or(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig::load(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.sandbox_timeout_secs, 1800);
    }

    #[test]
    fn load_toml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("orchestrator.toml");
        std::fs::write(
            &config_path,
            "bind_addr = \"127.0.0.1:9000\"\nsandbox_timeout_secs = 600\n",
        )
        .unwrap();

        let config = OrchestratorConfig::load(&config_path).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.sandbox_timeout_secs, 600);
    }

    #[test]
    fn ensure_directories_creates_db_and_data_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OrchestratorConfig::default();
        config.db_path = dir.path().join("nested/db.sqlite3");
        config.data_dir = dir.path().join("data");
        config.ensure_directories().unwrap();
        assert!(config.db_path.parent().unwrap().exists());
        assert!(config.data_dir.exists());
    }
}
