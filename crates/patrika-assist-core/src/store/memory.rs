//! In-memory [`VectorIndex`] for tests and the `memory` index provider.
//!
//! Vectors live in a `HashMap` behind `std::sync::RwLock`. Queries are
//! brute-force cosine similarity over every stored vector.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::{IndexMatch, IndexStats, IndexedVector, MetadataFilter, NamespaceStats};

use super::VectorIndex;

#[derive(Default)]
pub struct InMemoryIndex {
    vectors: RwLock<HashMap<String, IndexedVector>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vectors.read().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of a stored vector, by id.
    pub fn get(&self, id: &str) -> Option<IndexedVector> {
        self.vectors.read().ok()?.get(id).cloned()
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn upsert(&self, vectors: &[IndexedVector]) -> Result<usize> {
        let mut stored = self
            .vectors
            .write()
            .map_err(|_| anyhow!("in-memory index lock poisoned"))?;
        for v in vectors {
            stored.insert(v.id.clone(), v.clone());
        }
        Ok(vectors.len())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexMatch>> {
        let stored = self
            .vectors
            .read()
            .map_err(|_| anyhow!("in-memory index lock poisoned"))?;
        let mut matches: Vec<IndexMatch> = stored
            .values()
            .filter(|v| filter.map_or(true, |f| f.matches(&v.metadata)))
            .map(|v| IndexMatch {
                id: v.id.clone(),
                score: cosine_similarity(vector, &v.values),
                metadata: v.metadata.clone(),
            })
            .collect();
        matches.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn stats(&self) -> Result<IndexStats> {
        let stored = self
            .vectors
            .read()
            .map_err(|_| anyhow!("in-memory index lock poisoned"))?;
        let mut stats = IndexStats {
            dimension: stored.values().next().map_or(0, |v| v.values.len()),
            total_vector_count: stored.len(),
            ..Default::default()
        };
        if !stored.is_empty() {
            stats.namespaces.insert(
                String::new(),
                NamespaceStats {
                    vector_count: stored.len(),
                },
            );
        }
        Ok(stats)
    }

    async fn delete(&self, filter: &MetadataFilter) -> Result<Option<usize>> {
        if filter.is_empty() {
            bail!("refusing to delete with an empty filter");
        }
        let mut stored = self
            .vectors
            .write()
            .map_err(|_| anyhow!("in-memory index lock poisoned"))?;
        let before = stored.len();
        stored.retain(|_, v| !filter.matches(&v.metadata));
        Ok(Some(before - stored.len()))
    }

    async fn clear(&self) -> Result<()> {
        self.vectors
            .write()
            .map_err(|_| anyhow!("in-memory index lock poisoned"))?
            .clear();
        Ok(())
    }
}
