//! TOML configuration parsing and validation.
//!
//! Every section is optional; missing values fall back to defaults that
//! match a stock macOS Messages setup with a local Elasticsearch node.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    #[serde(default = "default_archive_path")]
    pub path: PathBuf,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            path: default_archive_path(),
        }
    }
}

fn default_archive_path() -> PathBuf {
    home_relative("Library/Messages/chat.db")
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
        }
    }
}

fn default_state_path() -> PathBuf {
    home_relative(".imessage-mcp/image_state.json")
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_url")]
    pub url: String,
    #[serde(default = "default_index_name")]
    pub name: String,
    #[serde(default = "default_vector_field")]
    pub vector_field: String,
    /// Name of an environment variable holding an Elasticsearch API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            url: default_index_url(),
            name: default_index_name(),
            vector_field: default_vector_field(),
            api_key_env: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_index_url() -> String {
    "http://localhost:9200".to_string()
}
fn default_index_name() -> String {
    "imessage_chunks".to_string()
}
fn default_vector_field() -> String {
    "image_embedding".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_embedding_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "local".to_string()
}
fn default_embedding_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Model name with the provider's default filled in.
    pub fn model_name(&self) -> String {
        if let Some(model) = &self.model {
            return model.clone();
        }
        match self.provider.as_str() {
            "openai" => "text-embedding-3-small".to_string(),
            "disabled" => "disabled".to_string(),
            _ => "clip-vit-b-32".to_string(),
        }
    }

    /// Vector dimensionality with the provider's default filled in.
    pub fn dims(&self) -> usize {
        self.dims.unwrap_or(match self.provider.as_str() {
            "openai" => 1536,
            "disabled" => 0,
            _ => 512,
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_pipeline_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_pipeline_batch_size(),
            limit: None,
        }
    }
}

fn default_pipeline_batch_size() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_search_limit")]
    pub limit: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Participant label the archive uses for the local user.
    #[serde(default = "default_self_name")]
    pub self_name: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            limit: default_search_limit(),
            page_size: default_page_size(),
            self_name: default_self_name(),
        }
    }
}

fn default_search_limit() -> usize {
    10
}
fn default_page_size() -> usize {
    25
}
fn default_self_name() -> String {
    "Me".to_string()
}

fn home_relative(rel: &str) -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(rel))
        .unwrap_or_else(|| PathBuf::from(rel))
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Read and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.archive.path = expand_home(&config.archive.path);
    config.state.path = expand_home(&config.state.path);
    validate(&config)?;
    Ok(config)
}

/// Load `path` if it exists, otherwise fall back to built-in defaults.
///
/// Only used for the default config location; an explicitly passed path
/// that does not exist is still an error.
pub fn load_or_default(path: &Path, explicit: bool) -> Result<Config> {
    if !explicit && !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        let config = Config::default();
        validate(&config)?;
        return Ok(config);
    }
    load_config(path)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.pipeline.batch_size == 0 {
        anyhow::bail!("pipeline.batch_size must be > 0");
    }
    if config.pipeline.limit == Some(0) {
        anyhow::bail!("pipeline.limit must be > 0 when set");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if !(1..=50).contains(&config.search.limit) {
        anyhow::bail!("search.limit must be in [1, 50]");
    }
    if !(10..=100).contains(&config.search.page_size) {
        anyhow::bail!("search.page_size must be in [10, 100]");
    }
    if config.index.name.trim().is_empty() {
        anyhow::bail!("index.name must not be empty");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or local.",
            other
        ),
    }

    if config.embedding.is_enabled() && config.embedding.dims() == 0 {
        anyhow::bail!(
            "embedding.dims must be > 0 when provider is '{}'",
            config.embedding.provider
        );
    }

    Ok(())
}
