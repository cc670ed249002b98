use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Config {
    /// A throwaway configuration for tests: in-memory-style paths and a
    /// loopback upstream nothing listens on.
    pub fn minimal() -> Self {
        Config {
            db: DbConfig {
                path: PathBuf::from("./data/cjenik.sqlite"),
            },
            upstream: UpstreamConfig {
                base_url: "http://127.0.0.1:1".to_string(),
                timeout_secs: default_timeout_secs(),
            },
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.upstream.base_url.trim().is_empty() {
        anyhow::bail!("upstream.base_url must not be empty");
    }
    if config.upstream.timeout_secs == 0 {
        anyhow::bail!("upstream.timeout_secs must be > 0");
    }

    // Archive URLs are derived by joining paths onto the base.
    config.upstream.base_url = config.upstream.base_url.trim_end_matches('/').to_string();

    Ok(config)
}
