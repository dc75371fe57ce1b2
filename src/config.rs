// ⚙️ Configuration - YAML file with environment overrides

use crate::dispatch::DEFAULT_CHUNK_SIZE;
use crate::record::DEFAULT_ORIGIN_KEY;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub repo: RepoConfig,
    #[serde(default)]
    pub connector: ConnectorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Upstream repository URL
    #[serde(default = "default_repo_url")]
    pub url: String,

    #[serde(default = "default_branch")]
    pub branch: String,

    /// Where the working copy lives
    #[serde(default = "default_local_path")]
    pub local_path: PathBuf,

    /// Record subtree, relative to the repository root
    #[serde(default = "default_subtree")]
    pub subtree: PathBuf,

    /// Record file extension
    #[serde(default = "default_extension")]
    pub extension: String,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            url: default_repo_url(),
            branch: default_branch(),
            local_path: default_local_path(),
            subtree: default_subtree(),
            extension: default_extension(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    #[serde(default = "default_name")]
    pub name: String,

    /// Seconds between runs
    #[serde(default = "default_run_interval")]
    pub run_interval: u64,

    /// Indicator confidence score (0-100)
    #[serde(default = "default_score")]
    pub default_score: u8,

    /// Max objects per bundle
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_origin_key")]
    pub origin_key: String,

    /// SQLite file for state, work tracking and spooled bundles
    #[serde(default = "default_state_db")]
    pub state_db: PathBuf,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            run_interval: default_run_interval(),
            default_score: default_score(),
            chunk_size: default_chunk_size(),
            origin_key: default_origin_key(),
            state_db: default_state_db(),
        }
    }
}

fn default_repo_url() -> String { "https://github.com/ossf/malicious-packages.git".to_string() }
fn default_branch() -> String { "main".to_string() }
fn default_local_path() -> PathBuf { PathBuf::from("./data/malicious-packages") }
fn default_subtree() -> PathBuf { PathBuf::from("osv/malicious") }
fn default_extension() -> String { "json".to_string() }
fn default_name() -> String { "OSSF Malicious Packages".to_string() }
fn default_run_interval() -> u64 { 3600 }
fn default_score() -> u8 { 80 }
fn default_chunk_size() -> usize { DEFAULT_CHUNK_SIZE }
fn default_origin_key() -> String { DEFAULT_ORIGIN_KEY.to_string() }
fn default_state_db() -> PathBuf { PathBuf::from("./data/connector.db") }

impl Config {
    /// Read the YAML file if it exists, otherwise start from defaults
    pub fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("Config file {} not found, using defaults", path.display());
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// File, then process environment, then validation
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::load_file(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `OSSF_*` overrides from `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("OSSF_GITHUB_REPO_URL") {
            self.repo.url = url;
        }
        if let Some(branch) = lookup("OSSF_GITHUB_BRANCH") {
            self.repo.branch = branch;
        }
        if let Some(path) = lookup("OSSF_LOCAL_REPO_PATH") {
            self.repo.local_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("OSSF_STATE_DB") {
            self.connector.state_db = PathBuf::from(path);
        }
        if let Some(raw) = lookup("OSSF_RUN_INTERVAL") {
            self.connector.run_interval = parse_env("OSSF_RUN_INTERVAL", &raw)?;
        }
        if let Some(raw) = lookup("OSSF_DEFAULT_SCORE") {
            self.connector.default_score = parse_env("OSSF_DEFAULT_SCORE", &raw)?;
        }
        if let Some(raw) = lookup("OSSF_CHUNK_SIZE") {
            self.connector.chunk_size = parse_env("OSSF_CHUNK_SIZE", &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.repo.url.trim().is_empty() {
            anyhow::bail!("repo.url must not be empty");
        }
        if self.repo.subtree.is_absolute()
            || self
                .repo
                .subtree
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            anyhow::bail!(
                "repo.subtree must be relative to the repository root, got {}",
                self.repo.subtree.display()
            );
        }
        if self.connector.chunk_size == 0 {
            anyhow::bail!("connector.chunk_size must be at least 1");
        }
        if self.connector.run_interval == 0 {
            anyhow::bail!("connector.run_interval must be at least 1 second");
        }
        if self.connector.default_score > 100 {
            anyhow::bail!(
                "connector.default_score must be within 0..=100, got {}",
                self.connector.default_score
            );
        }
        Ok(())
    }

    pub fn run_interval(&self) -> Duration {
        Duration::from_secs(self.connector.run_interval)
    }
}

fn parse_env<T>(key: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("{} has an invalid value: '{}'", key, raw))
}
