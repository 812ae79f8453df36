//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the only contract the retrieval and
//! ingestion pipelines rely on: idempotent upserts keyed by a deterministic
//! id, and nearest-neighbour queries with an optional metadata-equality
//! filter. Backends: [`memory::InMemoryIndex`] here, Pinecone in the app
//! crate.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{IndexMatch, IndexStats, IndexedVector, MetadataFilter};

/// Vectors per upsert call unless a backend says otherwise.
pub const DEFAULT_UPSERT_BATCH: usize = 100;

/// Abstract vector index.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorIndex::upsert) | Insert or replace vectors by id |
/// | [`query`](VectorIndex::query) | Top-k similarity search with optional filter |
/// | [`stats`](VectorIndex::stats) | Vector counts and dimension |
/// | [`delete`](VectorIndex::delete) | Remove vectors matching a non-empty filter |
/// | [`clear`](VectorIndex::clear) | Remove every vector |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Largest slice a single [`upsert`](VectorIndex::upsert) call should
    /// carry. Callers that need per-batch accounting split on this.
    fn upsert_batch_size(&self) -> usize {
        DEFAULT_UPSERT_BATCH
    }

    /// Insert or replace vectors. Returns the number accepted.
    async fn upsert(&self, vectors: &[IndexedVector]) -> Result<usize>;

    /// Return up to `top_k` matches ordered by descending score.
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexMatch>>;

    async fn stats(&self) -> Result<IndexStats>;

    /// Delete every vector whose metadata matches `filter`. Returns the
    /// number removed when the backend reports it. An empty filter is
    /// rejected; use [`clear`](VectorIndex::clear).
    async fn delete(&self, filter: &MetadataFilter) -> Result<Option<usize>>;

    async fn clear(&self) -> Result<()>;
}
