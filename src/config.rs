//! TOML configuration for the retrieval layer.
//!
//! Every section has defaults, so an empty file (or [`Config::default`])
//! gives an in-memory index with the offline hashing embedder.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use specter_rag_core::index::Metric;
use specter_rag_core::policy::IsolationPolicy;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Snapshot directory. `None` keeps the index in memory only.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub metric: Metric,
    #[serde(default = "default_persist_on_write")]
    pub persist_on_write: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: None,
            metric: Metric::default(),
            persist_on_write: default_persist_on_write(),
        }
    }
}

fn default_persist_on_write() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Candidates fetched per requested result, as headroom for filtering.
    #[serde(default = "default_fan_out_factor")]
    pub fan_out_factor: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Policy for the operator `query` command. Chat sessions are always
    /// strict.
    #[serde(default)]
    pub isolation: IsolationPolicy,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            fan_out_factor: default_fan_out_factor(),
            timeout_ms: default_timeout_ms(),
            isolation: IsolationPolicy::default(),
        }
    }
}

impl RetrievalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_top_k() -> usize {
    5
}
fn default_fan_out_factor() -> usize {
    4
}
fn default_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
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
            dims: default_dims(),
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_dims() -> Option<usize> {
    Some(384)
}
fn default_batch_size() -> usize {
    64
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
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    256
}

/// Read, parse, and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate config text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }

    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.fan_out_factor < 1 {
        anyhow::bail!("retrieval.fan_out_factor must be >= 1");
    }
    if config.retrieval.timeout_ms == 0 {
        anyhow::bail!("retrieval.timeout_ms must be > 0");
    }

    let embedding = &config.embedding;
    if embedding.is_enabled() {
        if embedding.dims.is_none() || embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                embedding.provider
            );
        }
        if embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }
    }

    match embedding.provider.as_str() {
        "disabled" | "hash" => {}
        "openai" | "ollama" => {
            if embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    embedding.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, openai, or ollama.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert!(config.index.path.is_none());
        assert_eq!(config.index.metric, Metric::Cosine);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.retrieval.fan_out_factor, 4);
        assert_eq!(config.retrieval.isolation, IsolationPolicy::Strict);
        assert_eq!(config.retrieval.timeout(), Duration::from_millis(2000));
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.embedding.dims, Some(384));
        assert_eq!(config.chunking.max_tokens, 256);
    }

    #[test]
    fn test_full_config_parses() {
        let config = parse_config(
            r#"
[index]
path = "/tmp/specter/index"
metric = "inner_product"
persist_on_write = false

[retrieval]
top_k = 3
fan_out_factor = 8
timeout_ms = 500
isolation = "unscoped"

[embedding]
provider = "ollama"
model = "nomic-embed-text"
dims = 768
url = "http://localhost:11434"

[chunking]
max_tokens = 128
"#,
        )
        .unwrap();
        assert_eq!(config.index.path, Some(PathBuf::from("/tmp/specter/index")));
        assert_eq!(config.index.metric, Metric::InnerProduct);
        assert!(!config.index.persist_on_write);
        assert_eq!(config.retrieval.isolation, IsolationPolicy::Unscoped);
        assert_eq!(config.embedding.dims, Some(768));
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(parse_config("[retrieval]\ntop_k = 0").is_err());
        assert!(parse_config("[retrieval]\nfan_out_factor = 0").is_err());
        assert!(parse_config("[retrieval]\ntimeout_ms = 0").is_err());
        assert!(parse_config("[chunking]\nmax_tokens = 0").is_err());
        assert!(parse_config("[embedding]\nprovider = \"faiss\"").is_err());
        assert!(parse_config("[embedding]\nprovider = \"openai\"").is_err());
        assert!(parse_config("[embedding]\nprovider = \"hash\"\ndims = 0").is_err());
    }

    #[test]
    fn test_disabled_provider_skips_dims_check() {
        let config = parse_config("[embedding]\nprovider = \"disabled\"\ndims = 0").unwrap();
        assert!(!config.embedding.is_enabled());
    }
}
