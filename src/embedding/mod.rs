//! Embedding providers.
//!
//! Concrete [`Embedder`] implementations:
//! - **[`HashEmbedder`]**: offline, deterministic feature hashing (default).
//! - **[`OpenAIEmbedder`]**: calls the OpenAI embeddings API with batching, retry, and backoff.
//! - **[`OllamaEmbedder`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **[`DisabledEmbedder`]**: fails every call; used when embeddings are not configured.
//!
//! # Provider Selection
//!
//! Use [`create_embedder`] to instantiate the provider named in the
//! configuration:
//!
//! ```rust,no_run
//! # use specter_rag::config::EmbeddingConfig;
//! # use specter_rag::embedding::create_embedder;
//! # use specter_rag_core::embedding::Embedder;
//! let config = EmbeddingConfig::default(); // provider = "hash"
//! let embedder = create_embedder(&config).unwrap();
//! assert_eq!(embedder.dims(), 384);
//! ```
//!
//! # Retry Strategy
//!
//! The OpenAI and Ollama providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

mod hash;

pub use hash::HashEmbedder;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use specter_rag_core::embedding::{ensure_embeddable, Embedder, EmbeddingError};

use crate::config::EmbeddingConfig;
use crate::TRACING_TARGET;

/// Build the embedder named by `config.provider`.
///
/// # Errors
///
/// Fails on an unknown provider, on missing `model`/`dims`, or when the
/// OpenAI provider is selected without `OPENAI_API_KEY`.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    let embedder: Arc<dyn Embedder> = match config.provider.as_str() {
        "hash" => Arc::new(HashEmbedder::new(required_dims(config)?)),
        "openai" => Arc::new(OpenAIEmbedder::new(config)?),
        "ollama" => Arc::new(OllamaEmbedder::new(config)?),
        "disabled" => Arc::new(DisabledEmbedder::new(config.dims.unwrap_or(0))),
        other => bail!("Unknown embedding provider: {}", other),
    };
    tracing::info!(
        target: TRACING_TARGET,
        provider = %config.provider,
        model = embedder.model_name(),
        dims = embedder.dims(),
        "embedding provider ready"
    );
    Ok(embedder)
}

fn required_dims(config: &EmbeddingConfig) -> Result<usize> {
    match config.dims {
        Some(d) if d > 0 => Ok(d),
        _ => bail!("embedding.dims required for provider '{}'", config.provider),
    }
}

fn required_model(config: &EmbeddingConfig) -> Result<String> {
    config.model.clone().ok_or_else(|| {
        anyhow::anyhow!("embedding.model required for provider '{}'", config.provider)
    })
}

// ============ Disabled Provider ============

/// A no-op embedder that always fails.
///
/// Used when `embedding.provider = "disabled"`. Queries degrade to empty
/// results; uploads fail loudly.
pub struct DisabledEmbedder {
    dims: usize,
}

impl DisabledEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::unavailable("embedding provider is disabled"))
    }
}

// ============ Shared HTTP plumbing ============

/// Settings shared by the HTTP-backed providers.
struct HttpSettings {
    client: reqwest::Client,
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
}

impl HttpSettings {
    fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            model: required_model(config)?,
            dims: required_dims(config)?,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
        })
    }

    /// POST `body` to `url`, retrying 429/5xx/network failures with backoff.
    async fn post_with_retry(
        &self,
        label: &str,
        url: &str,
        bearer: Option<&str>,
        body: &Value,
    ) -> Result<Value, EmbeddingError> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::debug!(target: TRACING_TARGET, provider = label, attempt, ?delay, "retrying embedding request");
                tokio::time::sleep(delay).await;
            }

            let mut request = self
                .client
                .post(url)
                .header("Content-Type", "application/json")
                .json(body);
            if let Some(key) = bearer {
                request = request.header("Authorization", format!("Bearer {}", key));
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response.json::<Value>().await.map_err(|e| {
                            EmbeddingError::invalid_response(format!("{label} response body: {e}"))
                        });
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = EmbeddingError::unavailable(format!(
                        "{label} API error {status}: {body_text}"
                    ));
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    last_err = Some(EmbeddingError::unavailable(format!(
                        "{label} connection error ({url}): {e}"
                    )));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            EmbeddingError::unavailable(format!("{label} embedding failed after retries"))
        }))
    }

    fn check_dims(&self, vectors: Vec<Vec<f32>>, expected: usize) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if vectors.len() != expected {
            return Err(EmbeddingError::invalid_response(format!(
                "expected {} embeddings, got {}",
                expected,
                vectors.len()
            )));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dims) {
            return Err(EmbeddingError::invalid_response(format!(
                "expected {} dimensions, got {}",
                self.dims,
                bad.len()
            )));
        }
        Ok(vectors)
    }
}

fn first_vector(mut vectors: Vec<Vec<f32>>) -> Result<Vec<f32>, EmbeddingError> {
    vectors
        .pop()
        .ok_or_else(|| EmbeddingError::invalid_response("empty embedding response"))
}

fn parse_vector(value: &Value) -> Result<Vec<f32>, EmbeddingError> {
    value
        .as_array()
        .ok_or_else(|| EmbeddingError::invalid_response("embedding is not an array"))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| EmbeddingError::invalid_response("embedding component is not a number"))
        })
        .collect()
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Calls `POST /v1/embeddings` with the configured model. Requires the
/// `OPENAI_API_KEY` environment variable.
pub struct OpenAIEmbedder {
    http: HttpSettings,
    api_key: String,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            http: HttpSettings::from_config(config)?,
            api_key,
        })
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbeddingError::invalid_response("OpenAI response missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| EmbeddingError::invalid_response("OpenAI response missing embedding"))?;
        indexed.push((index, parse_vector(embedding)?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.http.model
    }

    fn dims(&self) -> usize {
        self.http.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        first_vector(self.embed_batch(&[text.to_string()]).await?)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.http.batch_size) {
            for text in batch {
                ensure_embeddable(text)?;
            }
            let body = serde_json::json!({ "model": self.http.model, "input": batch });
            let json = self
                .http
                .post_with_retry(
                    "OpenAI",
                    "https://api.openai.com/v1/embeddings",
                    Some(&self.api_key),
                    &body,
                )
                .await?;
            out.extend(self.http.check_dims(parse_openai_response(&json)?, batch.len())?);
        }
        Ok(out)
    }
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default
/// `http://localhost:11434`). Requires an embedding model to be pulled,
/// e.g. `ollama pull nomic-embed-text`.
pub struct OllamaEmbedder {
    http: HttpSettings,
    url: String,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            http: HttpSettings::from_config(config)?,
            url: url.trim_end_matches('/').to_string(),
        })
    }
}

fn parse_ollama_response(json: &Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| EmbeddingError::invalid_response("Ollama response missing embeddings array"))?
        .iter()
        .map(parse_vector)
        .collect()
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.http.model
    }

    fn dims(&self) -> usize {
        self.http.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        first_vector(self.embed_batch(&[text.to_string()]).await?)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let endpoint = format!("{}/api/embed", self.url);
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.http.batch_size) {
            for text in batch {
                ensure_embeddable(text)?;
            }
            let body = serde_json::json!({ "model": self.http.model, "input": batch });
            let json = self
                .http
                .post_with_retry("Ollama", &endpoint, None, &body)
                .await?;
            out.extend(self.http.check_dims(parse_ollama_response(&json)?, batch.len())?);
        }
        Ok(out)
    }
}
