//! Embedding gateway trait and vector utilities.
//!
//! Defines the [`EmbeddingGateway`] trait that every embedding backend
//! implements, plus pure similarity helpers. Concrete gateways (Gemini,
//! Ollama, fastembed) live in the `patrika-assist` app crate.

use anyhow::Result;
use async_trait::async_trait;

/// Whether text is embedded as a search query or as a stored document.
///
/// Some providers produce asymmetric embeddings and need to know which
/// side of the search a text belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedTask {
    Query,
    Document,
}

impl EmbedTask {
    /// Gemini `taskType` value.
    pub fn as_gemini(&self) -> &'static str {
        match self {
            EmbedTask::Query => "RETRIEVAL_QUERY",
            EmbedTask::Document => "RETRIEVAL_DOCUMENT",
        }
    }
}

/// Maps text to fixed-dimension vectors.
///
/// Implementations must be `Send + Sync`; a single gateway is shared by
/// every connection.
#[async_trait]
pub trait EmbeddingGateway: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-004"`).
    fn model_name(&self) -> &str;

    /// Returns the embedding dimensionality (e.g. `768`).
    fn dims(&self) -> usize;

    /// Embed a single text.
    async fn embed(&self, text: &str, task: EmbedTask) -> Result<Vec<f32>>;

    /// Embed many texts. A failure affects only its own slot.
    ///
    /// The default implementation calls [`embed`](Self::embed) once per
    /// text; providers with a batch endpoint override it.
    async fn embed_many(&self, texts: &[String], task: EmbedTask) -> Vec<Option<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text, task).await.ok());
        }
        out
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or
/// vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
