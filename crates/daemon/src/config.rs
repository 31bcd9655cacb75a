//! File + environment configuration source
//!
//! The file named by `GATEWAY_CONFIG` (TOML, JSON or YAML by extension) is
//! layered under `GATEWAY__SECTION__KEY` environment overrides, e.g.
//! `GATEWAY__INFERENCE__BASE_URL=https://ai.example`. Every load re-reads
//! both, so the supervisor sees edits on its next refresh.

use async_trait::async_trait;
use config::{Config, Environment, File};
use gateway_core::domain::GatewayConfig;
use gateway_core::error::{AppError, Result};
use gateway_core::port::ConfigProvider;
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_ENV: &str = "GATEWAY_CONFIG";
pub const ENV_PREFIX: &str = "GATEWAY";

pub struct FileConfigProvider {
    path: Option<PathBuf>,
    env_prefix: String,
}

impl FileConfigProvider {
    pub fn new(path: Option<PathBuf>, env_prefix: impl Into<String>) -> Self {
        Self {
            path,
            env_prefix: env_prefix.into(),
        }
    }

    /// Config file from `GATEWAY_CONFIG` (optional), overrides from `GATEWAY__*`
    pub fn from_env() -> Self {
        let path = std::env::var(CONFIG_PATH_ENV)
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(|p| PathBuf::from(expand(&p)));
        Self::new(path, ENV_PREFIX)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn read(&self) -> std::result::Result<GatewayConfig, config::ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = &self.path {
            builder = builder.add_source(File::from(path.as_path()).required(true));
        }
        builder
            .add_source(
                Environment::with_prefix(&self.env_prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

fn expand(path: &str) -> String {
    shellexpand::tilde(path).into_owned()
}

/// Resolve `~` in every path-valued setting
fn expand_paths(mut config: GatewayConfig) -> GatewayConfig {
    config.storage.queue_db_path = expand(&config.storage.queue_db_path);
    config.storage.results_root =
        PathBuf::from(expand(&config.storage.results_root.to_string_lossy()));
    config
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    async fn load(&self) -> Result<GatewayConfig> {
        let config = self.read().map_err(|e| {
            AppError::Config(match &self.path {
                Some(path) => format!("{}: {}", path.display(), e),
                None => e.to_string(),
            })
        })?;
        Ok(expand_paths(config))
    }
}
