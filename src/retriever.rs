//! Query-time retrieval: embed the query, search the index, keep passages.
//!
//! Capability failures never escape [`Retriever::retrieve`]: an embedding or
//! index error yields an empty [`RetrievalResult`], which the assembler
//! treats as "no context found". [`Retriever::query_index`] is the raw
//! pass-through used by `POST /index/query` and propagates errors.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use patrika_assist_core::embedding::{EmbedTask, EmbeddingGateway};
use patrika_assist_core::models::{IndexMatch, MetadataFilter, RetrievalResult};
use patrika_assist_core::store::VectorIndex;

#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn EmbeddingGateway>,
    index: Arc<dyn VectorIndex>,
    top_k: usize,
    default_filter: Option<MetadataFilter>,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingGateway>,
        index: Arc<dyn VectorIndex>,
        top_k: usize,
    ) -> Self {
        Self {
            embedder,
            index,
            top_k,
            default_filter: None,
        }
    }

    /// Filter applied to chat turns when the caller has none of its own.
    pub fn with_default_filter(mut self, filter: MetadataFilter) -> Self {
        self.default_filter = (!filter.is_empty()).then_some(filter);
        self
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn default_filter(&self) -> Option<&MetadataFilter> {
        self.default_filter.as_ref()
    }

    /// Passages for `query`: at most `top_k`, restricted by `filter`.
    /// Errors and empty embeddings degrade to an empty result.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> RetrievalResult {
        let vector = match self.embedder.embed(query, EmbedTask::Query).await {
            Ok(v) if v.is_empty() => {
                tracing::warn!("query embedding was empty; continuing without context");
                return RetrievalResult::empty();
            }
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed; continuing without context");
                return RetrievalResult::empty();
            }
        };

        let matches = match self.index.query(&vector, top_k, filter).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "index query failed; continuing without context");
                return RetrievalResult::empty();
            }
        };

        let total = matches.len();
        let result = RetrievalResult::from_matches(matches);
        if result.len() < total {
            tracing::debug!(
                dropped = total - result.len(),
                "matches without text metadata dropped"
            );
        }
        tracing::debug!(passages = result.len(), "retrieved");
        result
    }

    /// Raw similarity search with an explicit filter.
    pub async fn query_index(
        &self,
        query: &str,
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexMatch>> {
        let vector = self
            .embedder
            .embed(query, EmbedTask::Query)
            .await
            .context("Failed to embed query")?;
        if vector.is_empty() {
            bail!("Embedding provider returned an empty vector");
        }
        self.index
            .query(&vector, top_k, filter)
            .await
            .context("Vector index query failed")
    }
}
