//! Ingestion pipeline: document → chunks → embeddings → vector index.
//!
//! Two entry points share one path:
//!
//! - [`Ingestor::upsert_document`] for a single document (`POST /documents`,
//!   `assist ingest-text`);
//! - [`Ingestor::ingest_jsonl`] for newline-delimited JSON uploads
//!   (`POST /chat/upload-jsonl`, `assist ingest`).
//!
//! Per-item failures (empty text, embedding errors, rejected upserts) are
//! counted and logged, never fatal to the batch. Vector ids are derived from
//! `(source_id, chunk_index, content_hash)`, so re-ingesting the same
//! content overwrites instead of duplicating.

use std::sync::Arc;

use patrika_assist_core::chunk::{chunk_text, content_hash, preview, vector_id};
use patrika_assist_core::embedding::{EmbedTask, EmbeddingGateway};
use patrika_assist_core::models::{ChunkMetadata, Document, IndexStats, IndexedVector, MetadataFilter};
use patrika_assist_core::store::VectorIndex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::{ChunkingConfig, IngestConfig};
use crate::error::ValidationError;
use crate::progress::{IngestProgressEvent, IngestProgressReporter};

/// Accepted upload extension.
pub const JSONL_EXTENSION: &str = ".jsonl";

/// Record fields tried, in order, for the text to embed.
const TEXT_FIELDS: &[&str] = &["text", "content", "description", "body", "summary", "title"];

/// Outcome of [`Ingestor::upsert_document`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub stored: usize,
    pub failed: usize,
    pub chunks: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
}

/// A JSONL line that could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineError {
    /// 1-based line number in the uploaded file.
    pub line: usize,
    pub message: String,
}

/// Valid records of a JSONL file plus the lines that were rejected.
#[derive(Debug, Clone, Default)]
pub struct ParsedJsonl {
    /// `(line number, object)` in file order.
    pub records: Vec<(usize, Map<String, Value>)>,
    pub errors: Vec<LineError>,
}

/// Outcome of a bulk JSONL ingest.
#[derive(Debug, Clone, Serialize)]
pub struct BulkReport {
    pub filename: String,
    pub total_objects: usize,
    pub successful_stores: usize,
    pub failed_stores: usize,
    pub total_chunks: usize,
    /// Percentage of attempted stores that succeeded, `0.0` when none were attempted.
    pub success_rate: f64,
    pub file_size_bytes: usize,
    pub line_errors: Vec<LineError>,
}

/// Upsert counts; `ids` lists vectors in batches the index accepted.
#[derive(Default)]
struct Stored {
    stored: usize,
    failed: usize,
    ids: Vec<String>,
}

/// Chunked and embedded vectors for one document, not yet upserted.
struct Prepared {
    vectors: Vec<IndexedVector>,
    chunks: usize,
    embed_failures: usize,
}

#[derive(Clone)]
pub struct Ingestor {
    embedder: Arc<dyn EmbeddingGateway>,
    index: Arc<dyn VectorIndex>,
    max_chunk_bytes: usize,
    preview_chars: usize,
    batch_size: usize,
}

impl Ingestor {
    pub fn new(
        embedder: Arc<dyn EmbeddingGateway>,
        index: Arc<dyn VectorIndex>,
        chunking: &ChunkingConfig,
        ingest: &IngestConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            max_chunk_bytes: chunking.max_chunk_bytes,
            preview_chars: chunking.preview_chars,
            batch_size: ingest.batch_size.max(1),
        }
    }

    /// Chunk, embed and upsert one document.
    ///
    /// A document with no text is reported as one failure. Chunks whose
    /// embedding fails are counted as failed and skipped.
    pub async fn upsert_document(&self, doc: &Document) -> UpsertReport {
        let Some(prepared) = self.prepare(doc).await else {
            return UpsertReport {
                failed: 1,
                ..Default::default()
            };
        };
        let stored = self.store(prepared.vectors).await;
        let report = UpsertReport {
            stored: stored.stored,
            failed: stored.failed + prepared.embed_failures,
            chunks: prepared.chunks,
            ids: stored.ids,
        };
        tracing::info!(
            filename = %doc.filename,
            stored = report.stored,
            failed = report.failed,
            chunks = report.chunks,
            "document ingested"
        );
        report
    }

    /// Ingest an uploaded JSONL file.
    ///
    /// Fails only when the file is not UTF-8 or contains no valid object;
    /// bad lines are reported in [`BulkReport::line_errors`].
    pub async fn ingest_jsonl(
        &self,
        content: &[u8],
        filename: &str,
        progress: &dyn IngestProgressReporter,
    ) -> Result<BulkReport, ValidationError> {
        let text = std::str::from_utf8(content).map_err(|_| ValidationError::NotUtf8)?;
        let parsed = parse_jsonl(text)?;
        for e in &parsed.errors {
            tracing::warn!(filename, line = e.line, error = %e.message, "skipping JSONL line");
        }

        let total = parsed.records.len();
        progress.report(IngestProgressEvent::Parsed {
            filename: filename.to_string(),
            objects: total as u64,
            line_errors: parsed.errors.len() as u64,
        });

        let created_at = chrono::Utc::now().timestamp();
        let mut successful = 0usize;
        let mut failed = 0usize;
        let mut total_chunks = 0usize;
        let mut done = 0usize;

        for batch in parsed.records.chunks(self.batch_size) {
            let mut vectors = Vec::new();
            for (offset, (line, record)) in batch.iter().enumerate() {
                let doc = record_to_document(record, done + offset, filename, created_at);
                match self.prepare(&doc).await {
                    Some(p) => {
                        total_chunks += p.chunks;
                        failed += p.embed_failures;
                        vectors.extend(p.vectors);
                    }
                    None => {
                        tracing::warn!(filename, line, "no text content in object");
                        failed += 1;
                    }
                }
            }
            let stored = self.store(vectors).await;
            successful += stored.stored;
            failed += stored.failed;
            done += batch.len();
            progress.report(IngestProgressEvent::Storing {
                filename: filename.to_string(),
                n: done as u64,
                total: total as u64,
            });
        }

        let attempted = successful + failed;
        let report = BulkReport {
            filename: filename.to_string(),
            total_objects: total,
            successful_stores: successful,
            failed_stores: failed,
            total_chunks,
            success_rate: if attempted > 0 {
                successful as f64 / attempted as f64 * 100.0
            } else {
                0.0
            },
            file_size_bytes: content.len(),
            line_errors: parsed.errors,
        };
        tracing::info!(
            filename,
            objects = report.total_objects,
            stored = report.successful_stores,
            failed = report.failed_stores,
            "JSONL ingested"
        );
        Ok(report)
    }

    /// Remove every stored chunk whose metadata matches `filter`, e.g. all
    /// chunks of one `filename`. Returns the count when the index reports it.
    pub async fn delete_documents(&self, filter: &MetadataFilter) -> anyhow::Result<Option<usize>> {
        if filter.is_empty() {
            anyhow::bail!("delete filter must not be empty");
        }
        let deleted = self.index.delete(filter).await?;
        tracing::info!(?filter, ?deleted, "documents deleted");
        Ok(deleted)
    }

    pub async fn index_stats(&self) -> anyhow::Result<IndexStats> {
        self.index.stats().await
    }

    /// Drop every vector in the index (or its configured namespace).
    pub async fn clear_index(&self) -> anyhow::Result<()> {
        self.index.clear().await?;
        tracing::warn!("vector index cleared");
        Ok(())
    }

    /// `None` when the document has no text.
    async fn prepare(&self, doc: &Document) -> Option<Prepared> {
        if doc.text.trim().is_empty() {
            return None;
        }
        let source_id = doc
            .source_id
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| default_source_id(doc));

        let chunks = chunk_text(&doc.text, self.max_chunk_bytes);
        for c in chunks.iter().filter(|c| c.truncated) {
            tracing::warn!(
                filename = %doc.filename,
                chunk_index = c.chunk_index,
                max_bytes = self.max_chunk_bytes,
                "sentence exceeds chunk limit; truncated"
            );
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embedder.embed_many(&texts, EmbedTask::Document).await;
        let total = chunks.len() as i64;

        let mut vectors = Vec::with_capacity(chunks.len());
        let mut embed_failures = 0;
        for (chunk, embedding) in chunks.iter().zip(embeddings) {
            let Some(values) = embedding else {
                embed_failures += 1;
                continue;
            };
            let mut metadata = doc.metadata.clone();
            metadata.text = Some(preview(&chunk.text, self.preview_chars));
            metadata.filename = non_empty(&doc.filename);
            metadata.source_type = non_empty(&doc.source_type);
            metadata.source_id = Some(source_id.clone());
            metadata.chunk_index = Some(chunk.chunk_index);
            metadata.total_chunks = Some(total);
            vectors.push(IndexedVector {
                id: vector_id(&source_id, chunk.chunk_index, &chunk.hash),
                values,
                metadata,
            });
        }
        if embed_failures > 0 {
            tracing::warn!(
                filename = %doc.filename,
                failed = embed_failures,
                "embedding failed for some chunks"
            );
        }

        Some(Prepared {
            vectors,
            chunks: chunks.len(),
            embed_failures,
        })
    }

    /// Returns `(stored, failed)`.
    /// Upsert in index-sized batches so a failing batch only fails its
    /// own vectors.
    async fn store(&self, vectors: Vec<IndexedVector>) -> Stored {
        let mut out = Stored::default();
        for batch in vectors.chunks(self.index.upsert_batch_size().max(1)) {
            match self.index.upsert(batch).await {
                Ok(n) => {
                    let n = n.min(batch.len());
                    out.stored += n;
                    out.failed += batch.len() - n;
                    out.ids.extend(batch.iter().map(|v| v.id.clone()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, vectors = batch.len(), "vector upsert failed");
                    out.failed += batch.len();
                }
            }
        }
        out
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

fn default_source_id(doc: &Document) -> String {
    let basis = if doc.filename.is_empty() {
        &doc.text
    } else {
        &doc.filename
    };
    format!("doc_{}", &content_hash(basis)[..16])
}

/// Check an upload before reading it as JSONL.
pub fn validate_upload(
    filename: Option<&str>,
    content: &[u8],
    max_bytes: usize,
) -> Result<(), ValidationError> {
    let filename = filename
        .filter(|f| !f.trim().is_empty())
        .ok_or(ValidationError::MissingFilename)?;
    if !filename.to_lowercase().ends_with(JSONL_EXTENSION) {
        return Err(ValidationError::UnsupportedFileType {
            filename: filename.to_string(),
            expected: JSONL_EXTENSION,
        });
    }
    if content.is_empty() {
        return Err(ValidationError::EmptyUpload);
    }
    if content.len() > max_bytes {
        return Err(ValidationError::UploadTooLarge {
            size: content.len(),
            limit: max_bytes,
        });
    }
    Ok(())
}

/// Parse newline-delimited JSON objects. Blank lines are skipped; lines
/// that are not JSON objects are reported with their 1-based number.
pub fn parse_jsonl(content: &str) -> Result<ParsedJsonl, ValidationError> {
    let mut parsed = ParsedJsonl::default();
    for (i, line) in content.lines().enumerate() {
        let line_no = i + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(obj)) => parsed.records.push((line_no, obj)),
            Ok(_) => parsed.errors.push(LineError {
                line: line_no,
                message: "expected a JSON object".to_string(),
            }),
            Err(e) => parsed.errors.push(LineError {
                line: line_no,
                message: format!("invalid JSON: {e}"),
            }),
        }
    }
    if parsed.records.is_empty() {
        return Err(ValidationError::NoValidLines);
    }
    Ok(parsed)
}

/// Build a [`Document`] from one JSONL record. `ordinal` is the record's
/// 0-based position among the valid records of the file.
pub fn record_to_document(
    record: &Map<String, Value>,
    ordinal: usize,
    filename: &str,
    created_at: i64,
) -> Document {
    let filename = if filename.is_empty() { "unknown" } else { filename };
    let record_id = record.get("id").and_then(scalar_string);

    let mut metadata = ChunkMetadata {
        created_at: Some(created_at),
        url: record.get("url").and_then(scalar_string),
        title: record.get("title").and_then(scalar_string),
        section: record.get("section").and_then(scalar_string),
        ..Default::default()
    };
    metadata.site = metadata.url.as_deref().and_then(url_host);
    if let Some(id) = &record_id {
        metadata.insert_extra("id", &Value::String(id.clone()));
    }
    if let Some(Value::Object(extra)) = record.get("metadata") {
        for (key, value) in extra {
            metadata.insert_extra(key, value);
        }
    }

    Document {
        source_id: Some(record_id.unwrap_or_else(|| format!("obj_{ordinal}"))),
        text: extract_text(record),
        filename: filename.to_string(),
        source_type: "jsonl".to_string(),
        metadata,
    }
}

/// Typed metadata from a caller-supplied JSON object. Known string fields
/// fill their typed slot; everything else goes through
/// [`ChunkMetadata::insert_extra`], which drops nulls.
pub fn metadata_from_map(map: &Map<String, Value>) -> ChunkMetadata {
    let mut metadata = ChunkMetadata::default();
    for (key, value) in map {
        let text = value.as_str().filter(|s| !s.is_empty()).map(str::to_string);
        match key.as_str() {
            "url" => metadata.url = text,
            "title" => metadata.title = text,
            "section" => metadata.section = text,
            "site" => metadata.site = text,
            "created_at" => metadata.created_at = value.as_i64(),
            _ => {
                metadata.insert_extra(key, value);
            }
        }
    }
    if metadata.site.is_none() {
        metadata.site = metadata.url.as_deref().and_then(url_host);
    }
    metadata
}

/// Text to embed for a record: the first non-empty priority field, else
/// every string field rendered `key: value` and joined with `" | "`.
pub fn extract_text(record: &Map<String, Value>) -> String {
    for field in TEXT_FIELDS {
        match record.get(*field) {
            None | Some(Value::Null) | Some(Value::Bool(false)) => {}
            Some(Value::String(s)) if s.trim().is_empty() => {}
            Some(Value::Array(items)) if items.is_empty() => {}
            Some(Value::Object(map)) if map.is_empty() => {}
            Some(Value::String(s)) => return s.trim().to_string(),
            Some(other) => return other.to_string(),
        }
    }

    let mut parts = Vec::new();
    for (key, value) in record {
        match value {
            Value::String(s) if !s.trim().is_empty() => parts.push(format!("{key}: {s}")),
            Value::Object(nested) => {
                let inner = flatten_strings(nested);
                if !inner.is_empty() {
                    parts.push(format!("{key}: {inner}"));
                }
            }
            _ => {}
        }
    }
    parts.join(" | ")
}

fn flatten_strings(obj: &Map<String, Value>) -> String {
    let mut parts = Vec::new();
    for (key, value) in obj {
        match value {
            Value::String(s) if !s.trim().is_empty() => parts.push(format!("{key}: {s}")),
            Value::Object(nested) => {
                let inner = flatten_strings(nested);
                if !inner.is_empty() {
                    parts.push(inner);
                }
            }
            _ => {}
        }
    }
    parts.join(" | ")
}

/// Non-empty string or number rendered as a string.
fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn url_host(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}
