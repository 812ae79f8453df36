//! Embedding gateway implementations.
//!
//! Concrete [`EmbeddingGateway`] backends:
//! - **[`DisabledEmbedder`]**: always errors; used when embeddings are not configured.
//! - **[`GeminiEmbedder`]**: Google Generative Language `embedContent` /
//!   `batchEmbedContents`, with retry and backoff.
//! - **[`OllamaEmbedder`]**: a local Ollama instance's `/api/embed` endpoint.
//! - **[`LocalEmbedder`]**: fastembed, in-process; no network calls after
//!   model download.
//!
//! Use [`create_gateway`] to pick one from configuration:
//!
//! ```rust,no_run
//! # use patrika_assist::config::EmbeddingConfig;
//! # use patrika_assist::embedding::create_gateway;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let gateway = create_gateway(&config).unwrap();
//! assert_eq!(gateway.model_name(), "disabled");
//! ```
//!
//! Every gateway truncates inputs longer than `max_input_bytes` at a char
//! boundary and rejects vectors whose length differs from `dims`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use patrika_assist_core::chunk::floor_char_boundary;
use patrika_assist_core::embedding::{EmbedTask, EmbeddingGateway};

use crate::config::EmbeddingConfig;
use crate::http::send_with_retry;

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_EMBED_MODEL: &str = "text-embedding-004";

/// Cut `text` to at most `max_bytes`, logging when it happens.
pub fn truncate_input(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let cut = floor_char_boundary(text, max_bytes);
    tracing::warn!(
        original_bytes = text.len(),
        truncated_bytes = cut,
        "embedding input truncated"
    );
    &text[..cut]
}

fn check_dims(vector: Vec<f32>, dims: usize) -> Result<Vec<f32>> {
    if vector.len() != dims {
        bail!(
            "embedding has {} dimensions, expected {}",
            vector.len(),
            dims
        );
    }
    Ok(vector)
}

fn json_floats(values: &serde_json::Value) -> Option<Vec<f32>> {
    values
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

// ============ Disabled ============

/// Gateway used when `embedding.provider = "disabled"`.
pub struct DisabledEmbedder;

#[async_trait]
impl EmbeddingGateway for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _text: &str, _task: EmbedTask) -> Result<Vec<f32>> {
        bail!("Embedding provider is disabled")
    }
}

// ============ Gemini ============

/// Gemini embeddings over the Generative Language REST API.
///
/// Requires `GOOGLE_API_KEY` in the environment (see [`GeminiEmbedder::from_env`]).
pub struct GeminiEmbedder {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
    max_input_bytes: usize,
}

impl GeminiEmbedder {
    pub fn new(config: &EmbeddingConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| GEMINI_BASE_URL.to_string()),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_GEMINI_EMBED_MODEL.to_string()),
            dims: config.dims,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            max_input_bytes: config.max_input_bytes,
        })
    }

    pub fn from_env(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("GOOGLE_API_KEY")
            .context("GOOGLE_API_KEY environment variable not set")?;
        Self::new(config, api_key)
    }

    fn model_path(&self) -> String {
        format!("models/{}", self.model)
    }

    fn request_body(&self, text: &str, task: EmbedTask) -> serde_json::Value {
        serde_json::json!({
            "model": self.model_path(),
            "content": { "parts": [{ "text": truncate_input(text, self.max_input_bytes) }] },
            "taskType": task.as_gemini(),
        })
    }

    async fn embed_batch(&self, texts: &[String], task: EmbedTask) -> Result<Vec<Vec<f32>>> {
        let requests: Vec<serde_json::Value> =
            texts.iter().map(|t| self.request_body(t, task)).collect();
        let body = serde_json::json!({ "requests": requests });
        let url = format!("{}/{}:batchEmbedContents", self.base_url, self.model_path());

        let response = send_with_retry("Gemini", self.max_retries, || {
            self.client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(&body)
        })
        .await?;
        let json: serde_json::Value = response.json().await?;
        let vectors = parse_gemini_batch_response(&json)?;
        if vectors.len() != texts.len() {
            bail!(
                "Gemini returned {} embeddings for {} inputs",
                vectors.len(),
                texts.len()
            );
        }
        Ok(vectors)
    }
}

/// Extract `embedding.values` from an `embedContent` response.
pub fn parse_gemini_response(json: &serde_json::Value) -> Result<Vec<f32>> {
    json.get("embedding")
        .and_then(|e| e.get("values"))
        .and_then(json_floats)
        .ok_or_else(|| anyhow::anyhow!("Invalid Gemini response: missing embedding.values"))
}

/// Extract `embeddings[].values` from a `batchEmbedContents` response.
pub fn parse_gemini_batch_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let items = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Gemini response: missing embeddings array"))?;

    items
        .iter()
        .map(|item| {
            item.get("values")
                .and_then(json_floats)
                .ok_or_else(|| anyhow::anyhow!("Invalid Gemini response: missing values"))
        })
        .collect()
}

#[async_trait]
impl EmbeddingGateway for GeminiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str, task: EmbedTask) -> Result<Vec<f32>> {
        let body = self.request_body(text, task);
        let url = format!("{}/{}:embedContent", self.base_url, self.model_path());

        let response = send_with_retry("Gemini", self.max_retries, || {
            self.client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(&body)
        })
        .await?;
        let json: serde_json::Value = response.json().await?;
        check_dims(parse_gemini_response(&json)?, self.dims)
    }

    async fn embed_many(&self, texts: &[String], task: EmbedTask) -> Vec<Option<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            match self.embed_batch(batch, task).await {
                Ok(vectors) => {
                    for vector in vectors {
                        match check_dims(vector, self.dims) {
                            Ok(v) => out.push(Some(v)),
                            Err(e) => {
                                tracing::warn!(error = %e, "discarding embedding");
                                out.push(None);
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, batch = batch.len(), "embedding batch failed");
                    out.extend(std::iter::repeat_with(|| None).take(batch.len()));
                }
            }
        }
        out
    }
}

// ============ Ollama ============

/// Embeddings from a local Ollama instance (default `http://localhost:11434`).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
    max_input_bytes: usize,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            model,
            dims: config.dims,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            max_input_bytes: config.max_input_bytes,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let input: Vec<&str> = texts
            .iter()
            .map(|t| truncate_input(t, self.max_input_bytes))
            .collect();
        let body = serde_json::json!({ "model": self.model, "input": input });
        let endpoint = format!("{}/api/embed", self.url);

        let response = send_with_retry("Ollama", self.max_retries, || {
            self.client.post(&endpoint).json(&body)
        })
        .await
        .with_context(|| format!("is Ollama running at {}?", self.url))?;
        let json: serde_json::Value = response.json().await?;
        parse_ollama_response(&json)
    }
}

pub fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|e| {
            json_floats(e)
                .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: embedding is not an array"))
        })
        .collect()
}

#[async_trait]
impl EmbeddingGateway for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str, _task: EmbedTask) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        let vector = vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))?;
        check_dims(vector, self.dims)
    }

    async fn embed_many(&self, texts: &[String], _task: EmbedTask) -> Vec<Option<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            match self.embed_batch(batch).await {
                Ok(vectors) if vectors.len() == batch.len() => {
                    out.extend(vectors.into_iter().map(|v| check_dims(v, self.dims).ok()));
                }
                Ok(vectors) => {
                    tracing::warn!(got = vectors.len(), expected = batch.len(), "embedding count mismatch");
                    out.extend(std::iter::repeat_with(|| None).take(batch.len()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, batch = batch.len(), "embedding batch failed");
                    out.extend(std::iter::repeat_with(|| None).take(batch.len()));
                }
            }
        }
        out
    }
}

// ============ Local (fastembed) ============

/// In-process embeddings via fastembed. Models are downloaded from Hugging
/// Face on first use and cached; the loaded model is kept for reuse.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    batch_size: usize,
    max_input_bytes: usize,
    model: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "multilingual-e5-base".to_string());
        // Fail fast on unknown names.
        config_to_fastembed_model(&model_name)?;
        Ok(Self {
            model_name,
            dims: config.dims,
            batch_size: config.batch_size.max(1),
            max_input_bytes: config.max_input_bytes,
            model: Arc::new(std::sync::Mutex::new(None)),
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let texts: Vec<String> = texts
            .iter()
            .map(|t| truncate_input(t, self.max_input_bytes).to_string())
            .collect();
        let model_name = self.model_name.clone();
        let batch_size = self.batch_size;
        let slot = Arc::clone(&self.model);

        tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| anyhow::anyhow!("local embedding model lock poisoned"))?;
            if guard.is_none() {
                let model = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(config_to_fastembed_model(&model_name)?)
                        .with_show_download_progress(true),
                )
                .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("local embedding model unavailable"))?;
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))
        })
        .await?
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported 768-dimension models: \
             bge-base-en-v1.5, nomic-embed-text-v1, nomic-embed-text-v1.5, multilingual-e5-base",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl EmbeddingGateway for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str, _task: EmbedTask) -> Result<Vec<f32>> {
        let vector = self
            .embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))?;
        check_dims(vector, self.dims)
    }

    async fn embed_many(&self, texts: &[String], _task: EmbedTask) -> Vec<Option<Vec<f32>>> {
        match self.embed_batch(texts).await {
            Ok(vectors) => vectors
                .into_iter()
                .map(|v| check_dims(v, self.dims).ok())
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "local embedding failed");
                vec![None; texts.len()]
            }
        }
    }
}

/// Create the [`EmbeddingGateway`] named by `config.provider`.
///
/// | Config Value | Gateway |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"gemini"` | [`GeminiEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"local"` | `LocalEmbedder` (needs the `local-embeddings-fastembed` feature) |
pub fn create_gateway(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingGateway>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "gemini" => Ok(Arc::new(GeminiEmbedder::from_env(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gemini_single_and_batch() {
        let single = serde_json::json!({"embedding": {"values": [0.5, -1.0, 2.0]}});
        assert_eq!(parse_gemini_response(&single).unwrap(), vec![0.5, -1.0, 2.0]);

        let batch = serde_json::json!({"embeddings": [{"values": [1.0]}, {"values": [2.0]}]});
        assert_eq!(
            parse_gemini_batch_response(&batch).unwrap(),
            vec![vec![1.0], vec![2.0]]
        );

        assert!(parse_gemini_response(&serde_json::json!({"error": {}})).is_err());
        assert!(parse_gemini_batch_response(&serde_json::json!({"embeddings": [{}]})).is_err());
    }

    #[test]
    fn parses_ollama() {
        let json = serde_json::json!({"embeddings": [[0.1, 0.2], [0.3, 0.4]]});
        let out = parse_ollama_response(&json).unwrap();
        assert_eq!(out.len(), 2);
        assert!(parse_ollama_response(&serde_json::json!({"embeddings": ["x"]})).is_err());
    }

    #[test]
    fn truncates_on_char_boundary() {
        let text = "नमस्ते दुनिया";
        let cut = truncate_input(text, 7);
        assert!(cut.len() <= 7);
        assert!(text.starts_with(cut));
        assert_eq!(truncate_input("short", 100), "short");
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        assert!(check_dims(vec![0.0; 768], 768).is_ok());
        assert!(check_dims(vec![0.0; 384], 768).is_err());
    }

    #[tokio::test]
    async fn disabled_gateway_errors() {
        let gateway = create_gateway(&EmbeddingConfig::default()).unwrap();
        assert_eq!(gateway.model_name(), "disabled");
        assert!(gateway.embed("hi", EmbedTask::Query).await.is_err());
        let many = gateway
            .embed_many(&["a".to_string(), "b".to_string()], EmbedTask::Document)
            .await;
        assert_eq!(many, vec![None, None]);
    }

    #[test]
    fn gemini_request_shape() {
        let config = EmbeddingConfig {
            provider: "gemini".into(),
            ..Default::default()
        };
        let embedder = GeminiEmbedder::new(&config, "key".into()).unwrap();
        let body = embedder.request_body("hello", EmbedTask::Query);
        assert_eq!(body["model"], "models/text-embedding-004");
        assert_eq!(body["content"]["parts"][0]["text"], "hello");
        assert_eq!(body["taskType"], "RETRIEVAL_QUERY");
    }
}
