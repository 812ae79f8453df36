//! Pinecone-backed [`VectorIndex`].
//!
//! Two planes:
//! - **Control plane** (`https://api.pinecone.io`): resolve the index host,
//!   create a serverless index when missing, poll until it reports ready.
//! - **Data plane** (`https://{host}`): `/vectors/upsert`, `/query`,
//!   `/describe_index_stats` and `/vectors/delete` (by filter, or all).
//!
//! [`LazyPineconeIndex`] defers the control-plane round trips to the first
//! call and then reuses the resolved client for the life of the process.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use patrika_assist_core::models::{
    ChunkMetadata, IndexMatch, IndexStats, IndexedVector, MetadataFilter, NamespaceStats,
};
use patrika_assist_core::store::VectorIndex;
use serde::Deserialize;
use tokio::sync::OnceCell;

use crate::config::IndexConfig;
use crate::http::send_with_retry;

pub const CONTROL_PLANE_URL: &str = "https://api.pinecone.io";
pub const API_VERSION: &str = "2025-01";
const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// The parts of a `describe_index` response we use.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexDescription {
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub dimension: Option<usize>,
    #[serde(default)]
    pub status: IndexStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IndexStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Debug, Deserialize)]
struct QueryMatch {
    id: String,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    metadata: Option<ChunkMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertResponse {
    #[serde(default)]
    upserted_count: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    #[serde(default)]
    dimension: usize,
    #[serde(default)]
    index_fullness: f64,
    #[serde(default)]
    total_vector_count: usize,
    #[serde(default)]
    namespaces: std::collections::BTreeMap<String, NamespaceCount>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NamespaceCount {
    #[serde(default)]
    vector_count: usize,
}

/// Parse a data-plane `/describe_index_stats` response body.
pub fn parse_stats_response(json: serde_json::Value) -> Result<IndexStats> {
    let parsed: StatsResponse =
        serde_json::from_value(json).context("Invalid Pinecone describe_index_stats response")?;
    Ok(IndexStats {
        dimension: parsed.dimension,
        index_fullness: parsed.index_fullness,
        total_vector_count: parsed.total_vector_count,
        namespaces: parsed
            .namespaces
            .into_iter()
            .map(|(ns, c)| {
                (
                    ns,
                    NamespaceStats {
                        vector_count: c.vector_count,
                    },
                )
            })
            .collect(),
    })
}

/// Parse a data-plane `/query` response body.
pub fn parse_query_response(json: serde_json::Value) -> Result<Vec<IndexMatch>> {
    let parsed: QueryResponse =
        serde_json::from_value(json).context("Invalid Pinecone query response")?;
    Ok(parsed
        .matches
        .into_iter()
        .map(|m| IndexMatch {
            id: m.id,
            score: m.score,
            metadata: m.metadata.unwrap_or_default(),
        })
        .collect())
}

fn data_plane_url(host: &str) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        host.trim_end_matches('/').to_string()
    } else {
        format!("https://{}", host.trim_end_matches('/'))
    }
}

pub struct PineconeIndex {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    namespace: Option<String>,
    upsert_batch_size: usize,
    max_retries: u32,
}

impl PineconeIndex {
    /// Data-plane client for an already-resolved host.
    pub fn with_host(config: &IndexConfig, host: &str, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            base_url: data_plane_url(host),
            namespace: config.namespace.clone(),
            upsert_batch_size: config.upsert_batch_size.max(1),
            max_retries: 3,
        })
    }

    /// Resolve (and if configured, create) the index through the control plane.
    pub async fn connect(
        config: &IndexConfig,
        dims: usize,
        api_key: String,
        control_plane: &str,
    ) -> Result<Self> {
        let control = ControlPlane::new(config, &api_key, control_plane)?;

        let description = match control.describe(&config.name).await? {
            Some(existing) => {
                if let Some(existing_dims) = existing.dimension {
                    if dims > 0 && existing_dims != dims {
                        bail!(
                            "Pinecone index '{}' has dimension {}, embeddings produce {}",
                            config.name,
                            existing_dims,
                            dims
                        );
                    }
                }
                existing
            }
            None if config.create_if_missing => {
                tracing::info!(index = %config.name, dims, "creating Pinecone index");
                control.create(config, dims).await?;
                control.describe(&config.name).await?.with_context(|| {
                    format!("Pinecone index '{}' missing after creation", config.name)
                })?
            }
            None => bail!(
                "Pinecone index '{}' does not exist and index.create_if_missing is false",
                config.name
            ),
        };

        let description = if description.status.ready {
            description
        } else {
            control
                .wait_until_ready(&config.name, Duration::from_secs(config.ready_timeout_secs))
                .await?
        };

        tracing::info!(index = %description.name, host = %description.host, "Pinecone index ready");
        Self::with_host(config, &description.host, api_key)
    }

    pub async fn from_env(config: &IndexConfig, dims: usize) -> Result<Self> {
        let api_key = std::env::var("PINECONE_API_KEY")
            .context("PINECONE_API_KEY environment variable not set")?;
        Self::connect(config, dims, api_key, CONTROL_PLANE_URL).await
    }

    fn upsert_body(&self, batch: &[IndexedVector]) -> serde_json::Value {
        self.with_namespace(serde_json::json!({ "vectors": batch }))
    }

    fn with_namespace(&self, mut body: serde_json::Value) -> serde_json::Value {
        if let Some(ns) = &self.namespace {
            body["namespace"] = serde_json::Value::String(ns.clone());
        }
        body
    }

    fn delete_body(&self, filter: &MetadataFilter) -> serde_json::Value {
        self.with_namespace(serde_json::json!({ "filter": filter.to_pinecone() }))
    }

    fn clear_body(&self) -> serde_json::Value {
        self.with_namespace(serde_json::json!({ "deleteAll": true }))
    }

    /// POST `body` to a data-plane path with retries.
    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        send_with_retry("Pinecone", self.max_retries, || {
            self.client
                .post(&url)
                .header("Api-Key", &self.api_key)
                .header("X-Pinecone-API-Version", API_VERSION)
                .json(body)
        })
        .await
    }

    fn query_body(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "vector": vector,
            "topK": top_k,
            "includeMetadata": true,
        });
        if let Some(f) = filter.filter(|f| !f.is_empty()) {
            body["filter"] = f.to_pinecone();
        }
        self.with_namespace(body)
    }
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    fn upsert_batch_size(&self) -> usize {
        self.upsert_batch_size
    }

    async fn upsert(&self, vectors: &[IndexedVector]) -> Result<usize> {
        let mut accepted = 0;
        for batch in vectors.chunks(self.upsert_batch_size) {
            let response = self.post("/vectors/upsert", &self.upsert_body(batch)).await?;
            let parsed: UpsertResponse = response
                .json()
                .await
                .context("Invalid Pinecone upsert response")?;
            accepted += parsed.upserted_count.unwrap_or(batch.len());
        }
        Ok(accepted)
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexMatch>> {
        let body = self.query_body(vector, top_k, filter);
        let json: serde_json::Value = self
            .post("/query", &body)
            .await?
            .json()
            .await
            .context("Invalid Pinecone query response")?;
        parse_query_response(json)
    }

    async fn stats(&self) -> Result<IndexStats> {
        let json: serde_json::Value = self
            .post("/describe_index_stats", &serde_json::json!({}))
            .await?
            .json()
            .await
            .context("Invalid Pinecone describe_index_stats response")?;
        parse_stats_response(json)
    }

    async fn delete(&self, filter: &MetadataFilter) -> Result<Option<usize>> {
        if filter.is_empty() {
            bail!("refusing to delete with an empty filter");
        }
        self.post("/vectors/delete", &self.delete_body(filter)).await?;
        Ok(None)
    }

    async fn clear(&self) -> Result<()> {
        self.post("/vectors/delete", &self.clear_body()).await?;
        tracing::warn!(namespace = ?self.namespace, "Pinecone index cleared");
        Ok(())
    }
}

struct ControlPlane<'a> {
    client: reqwest::Client,
    api_key: &'a str,
    base_url: &'a str,
}

impl<'a> ControlPlane<'a> {
    fn new(config: &IndexConfig, api_key: &'a str, base_url: &'a str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            base_url,
        })
    }

    async fn describe(&self, name: &str) -> Result<Option<IndexDescription>> {
        let response = self
            .client
            .get(format!("{}/indexes/{}", self.base_url, name))
            .header("Api-Key", self.api_key)
            .header("X-Pinecone-API-Version", API_VERSION)
            .send()
            .await
            .context("Pinecone control plane unreachable")?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Pinecone API error {}: {}", status, body_text);
        }
        let description: IndexDescription = response
            .json()
            .await
            .context("Invalid Pinecone describe_index response")?;
        Ok(Some(description))
    }

    async fn create(&self, config: &IndexConfig, dims: usize) -> Result<()> {
        let body = serde_json::json!({
            "name": config.name,
            "dimension": dims,
            "metric": config.metric,
            "spec": { "serverless": { "cloud": config.cloud, "region": config.region } },
        });
        let response = self
            .client
            .post(format!("{}/indexes", self.base_url))
            .header("Api-Key", self.api_key)
            .header("X-Pinecone-API-Version", API_VERSION)
            .json(&body)
            .send()
            .await
            .context("Pinecone control plane unreachable")?;

        let status = response.status();
        // 409: created concurrently by another process.
        if status.is_success() || status.as_u16() == 409 {
            return Ok(());
        }
        let body_text = response.text().await.unwrap_or_default();
        bail!("Pinecone create_index error {}: {}", status, body_text)
    }

    async fn wait_until_ready(&self, name: &str, timeout: Duration) -> Result<IndexDescription> {
        let started = Instant::now();
        loop {
            if let Some(description) = self.describe(name).await? {
                if description.status.ready {
                    return Ok(description);
                }
                tracing::debug!(index = name, state = %description.status.state, "waiting for index");
            }
            if started.elapsed() >= timeout {
                bail!(
                    "Pinecone index '{}' not ready after {}s",
                    name,
                    timeout.as_secs()
                );
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}

/// A [`PineconeIndex`] connected on first use, exactly once.
///
/// Concurrent first callers wait on the same initialization; a failed
/// initialization is not cached, so the next call retries it.
pub struct LazyPineconeIndex {
    config: IndexConfig,
    dims: usize,
    cell: OnceCell<PineconeIndex>,
}

impl LazyPineconeIndex {
    pub fn new(config: IndexConfig, dims: usize) -> Self {
        Self {
            config,
            dims,
            cell: OnceCell::new(),
        }
    }

    async fn get(&self) -> Result<&PineconeIndex> {
        self.cell
            .get_or_try_init(|| PineconeIndex::from_env(&self.config, self.dims))
            .await
    }
}

#[async_trait]
impl VectorIndex for LazyPineconeIndex {
    fn upsert_batch_size(&self) -> usize {
        self.config.upsert_batch_size.max(1)
    }

    async fn upsert(&self, vectors: &[IndexedVector]) -> Result<usize> {
        self.get().await?.upsert(vectors).await
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexMatch>> {
        self.get().await?.query(vector, top_k, filter).await
    }

    async fn stats(&self) -> Result<IndexStats> {
        self.get().await?.stats().await
    }

    async fn delete(&self, filter: &MetadataFilter) -> Result<Option<usize>> {
        self.get().await?.delete(filter).await
    }

    async fn clear(&self) -> Result<()> {
        self.get().await?.clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> IndexConfig {
        IndexConfig {
            provider: "pinecone".into(),
            namespace: Some("web".into()),
            ..Default::default()
        }
    }

    #[test]
    fn host_gets_https_scheme() {
        assert_eq!(data_plane_url("idx-abc.svc.pinecone.io"), "https://idx-abc.svc.pinecone.io");
        assert_eq!(data_plane_url("http://127.0.0.1:9000/"), "http://127.0.0.1:9000");
    }

    #[test]
    fn query_body_includes_filter_and_namespace() {
        let index = PineconeIndex::with_host(&config(), "h", "k".into()).unwrap();
        let filter = MetadataFilter::new().eq("filename", "a.jsonl");
        let body = index.query_body(&[0.5, 0.25], 3, Some(&filter));
        assert_eq!(body["topK"], 3);
        assert_eq!(body["includeMetadata"], true);
        assert_eq!(body["namespace"], "web");
        assert_eq!(body["filter"]["filename"]["$eq"], "a.jsonl");

        let no_filter = index.query_body(&[0.5], 1, Some(&MetadataFilter::new()));
        assert!(no_filter.get("filter").is_none());
    }

    #[test]
    fn upsert_body_drops_absent_metadata() {
        let index = PineconeIndex::with_host(&config(), "h", "k".into()).unwrap();
        let v = IndexedVector {
            id: "doc_chunk_0_abcd1234".into(),
            values: vec![0.1, 0.2],
            metadata: ChunkMetadata {
                text: Some("hello".into()),
                filename: Some("a.txt".into()),
                ..Default::default()
            },
        };
        let body = index.upsert_body(std::slice::from_ref(&v));
        let meta = body["vectors"][0]["metadata"].as_object().unwrap();
        assert_eq!(meta["text"], "hello");
        assert!(meta.values().all(|v| !v.is_null()));
        assert!(!meta.contains_key("site"));
    }

    #[test]
    fn parses_query_matches() {
        let json = serde_json::json!({
            "matches": [
                {"id": "a", "score": 0.9, "metadata": {"text": "alpha", "chunk_index": 2.0, "lang": "hi"}},
                {"id": "b", "score": 0.4}
            ],
            "namespace": "web"
        });
        let matches = parse_query_response(json).unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].metadata.text.as_deref(), Some("alpha"));
        assert_eq!(matches[0].metadata.chunk_index, Some(2));
        assert!(matches[1].metadata.text.is_none());
    }

    #[test]
    fn parses_index_description() {
        let json = serde_json::json!({
            "name": "patrika-web-index",
            "dimension": 768,
            "metric": "cosine",
            "host": "patrika-web-index-xyz.svc.aped-1234.pinecone.io",
            "status": {"ready": true, "state": "Ready"}
        });
        let d: IndexDescription = serde_json::from_value(json).unwrap();
        assert!(d.status.ready);
        assert_eq!(d.dimension, Some(768));
    }

    #[test]
    fn delete_and_clear_bodies() {
        let index = PineconeIndex::with_host(&config(), "h", "k".into()).unwrap();
        let body = index.delete_body(&MetadataFilter::new().eq("filename", "old.jsonl"));
        assert_eq!(body["filter"]["filename"]["$eq"], "old.jsonl");
        assert_eq!(body["namespace"], "web");
        assert!(body.get("deleteAll").is_none());

        let body = index.clear_body();
        assert_eq!(body["deleteAll"], true);
        assert_eq!(body["namespace"], "web");
    }

    #[test]
    fn parses_index_stats() {
        let json = serde_json::json!({
            "namespaces": {"": {"vectorCount": 40}, "web": {"vectorCount": 2}},
            "dimension": 768,
            "indexFullness": 0.0,
            "totalVectorCount": 42
        });
        let stats = parse_stats_response(json).unwrap();
        assert_eq!(stats.dimension, 768);
        assert_eq!(stats.total_vector_count, 42);
        assert_eq!(stats.namespaces["web"].vector_count, 2);
    }

    /// Serve a fake data plane on an ephemeral port.
    async fn data_plane(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn unreadable_upsert_response_is_an_error() {
        use axum::routing::post;
        let host = data_plane(axum::Router::new().route(
            "/vectors/upsert",
            post(|| async { "<html>maintenance</html>" }),
        ))
        .await;
        let index = PineconeIndex::with_host(&config(), &host, "k".into()).unwrap();
        let v = IndexedVector {
            id: "a".into(),
            values: vec![1.0],
            metadata: ChunkMetadata::default(),
        };
        let err = index.upsert(&[v]).await.unwrap_err();
        assert!(format!("{err:#}").contains("Invalid Pinecone upsert response"));
    }

    #[tokio::test]
    async fn upsert_sums_reported_counts_per_batch() {
        use axum::routing::post;
        use axum::Json;
        let host = data_plane(axum::Router::new().route(
            "/vectors/upsert",
            post(|Json(body): Json<serde_json::Value>| async move {
                let n = body["vectors"].as_array().map_or(0, |v| v.len());
                Json(serde_json::json!({ "upsertedCount": n }))
            }),
        ))
        .await;
        let cfg = IndexConfig {
            upsert_batch_size: 2,
            ..config()
        };
        let index = PineconeIndex::with_host(&cfg, &host, "k".into()).unwrap();
        assert_eq!(index.upsert_batch_size(), 2);
        let vectors: Vec<IndexedVector> = (0..5)
            .map(|i| IndexedVector {
                id: format!("v{i}"),
                values: vec![1.0],
                metadata: ChunkMetadata::default(),
            })
            .collect();
        assert_eq!(index.upsert(&vectors).await.unwrap(), 5);
    }
}
