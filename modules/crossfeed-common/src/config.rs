use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::IndexerError;

/// TOML-backed configuration loaded from disk.
/// Secrets (database URL) stay as env vars.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub soft_delete: SoftDeleteConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexerConfig {
    pub poll_period_secs: u64,
    pub max_concurrent_sources: usize,
    pub request_timeout_secs: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            poll_period_secs: 5,
            max_concurrent_sources: 4,
            request_timeout_secs: 15,
        }
    }
}

impl IndexerConfig {
    pub fn poll_period(&self) -> Duration {
        Duration::from_secs(self.poll_period_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Soft deletion expressed as data: a Write whose identity-bearing field
/// equals `sentinel` is indexed as a tombstone.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SoftDeleteConfig {
    pub sentinel: String,
    /// Top-level payload fields compared against the sentinel.
    pub fields: Vec<String>,
}

impl Default for SoftDeleteConfig {
    fn default() -> Self {
        Self {
            sentinel: "[DELETED]".to_string(),
            fields: vec!["content".to_string(), "title".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub id: String,
    pub address: String,
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
    #[serde(default)]
    pub users: Vec<String>,
}

fn default_path_prefix() -> String {
    "/pub/".to_string()
}

impl FileConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: FileConfig = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), IndexerError> {
        if self.indexer.poll_period_secs == 0 {
            return Err(IndexerError::Config(
                "indexer.poll_period_secs must be positive".to_string(),
            ));
        }
        if self.indexer.max_concurrent_sources == 0 {
            return Err(IndexerError::Config(
                "indexer.max_concurrent_sources must be positive".to_string(),
            ));
        }
        if self.soft_delete.sentinel.is_empty() {
            return Err(IndexerError::Config(
                "soft_delete.sentinel is empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() {
                return Err(IndexerError::Config("source id is empty".to_string()));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(IndexerError::Config(format!(
                    "duplicate source id: {}",
                    source.id
                )));
            }
            if !source.address.starts_with("http://") && !source.address.starts_with("https://")
            {
                return Err(IndexerError::Config(format!(
                    "source {}: address must be http(s), got {}",
                    source.id, source.address
                )));
            }
            if !source.path_prefix.starts_with('/') || !source.path_prefix.ends_with('/') {
                return Err(IndexerError::Config(format!(
                    "source {}: path_prefix must start and end with '/', got {}",
                    source.id, source.path_prefix
                )));
            }
        }
        Ok(())
    }
}

/// Load and parse a TOML config file.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    FileConfig::from_toml_str(&content)
        .with_context(|| format!("Invalid config file: {}", path.display()))
}

/// Environment-specific values. Without `DATABASE_URL` the indexer keeps
/// cursors and records in memory.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.is_empty()),
        };
        config.log_keys();
        config
    }

    fn log_keys(&self) {
        let db = match &self.database_url {
            Some(url) => format!(
                "{}...({} chars)",
                url.chars().take(11).collect::<String>(),
                url.len()
            ),
            None => "<not set, using in-memory stores>".to_string(),
        };
        tracing::info!("Config loaded:");
        tracing::info!("  DATABASE_URL: {db}");
    }
}
