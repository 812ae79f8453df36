//! Core data models used throughout Patrika Assist.
//!
//! These types represent the documents, chunks, index records, and
//! retrieval results that flow through the ingestion and query paths.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Maximum number of passthrough keys kept in [`ChunkMetadata::extra`].
pub const MAX_EXTRA_FIELDS: usize = 32;

/// Raw document handed to the ingestion pipeline. Ephemeral.
#[derive(Debug, Clone, Default)]
pub struct Document {
    /// Stable identifier of the source record, used to derive chunk ids.
    /// Derived from the filename when absent.
    pub source_id: Option<String>,
    pub text: String,
    pub filename: String,
    pub source_type: String,
    /// Metadata copied onto every chunk of this document.
    pub metadata: ChunkMetadata,
}

/// A size-bounded segment of a document's text.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Position within the parent document, starting at 0.
    pub chunk_index: i64,
    pub text: String,
    /// Hex SHA-256 of `text`.
    pub hash: String,
    /// True when this chunk is a single sentence that was cut to the byte
    /// limit. The bytes past the limit are lost.
    pub truncated: bool,
}

/// A scalar metadata value. There is no null variant: absent values are
/// simply not stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
}

impl MetadataValue {
    /// Convert an arbitrary JSON value. `null` yields `None`; objects and
    /// mixed arrays are stringified.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        use serde_json::Value;
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Self::Int(i)),
                None => n.as_f64().map(Self::Float),
            },
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Array(items) if items.iter().all(|v| v.is_string()) => Some(Self::List(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            )),
            other => Some(Self::Text(other.to_string())),
        }
    }

    /// Parse a command-line value: booleans and integers are recognized,
    /// everything else is text.
    pub fn parse_loose(raw: &str) -> Self {
        match raw {
            "true" => Self::Bool(true),
            "false" => Self::Bool(false),
            _ => raw
                .parse::<i64>()
                .map(Self::Int)
                .unwrap_or_else(|_| Self::Text(raw.to_string())),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for MetadataValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

/// Typed metadata stored alongside each vector.
///
/// Known fields are optional and omitted from the serialized form when
/// `None`; arbitrary passthrough fields go into `extra`, capped at
/// [`MAX_EXTRA_FIELDS`]. Index backends that reject null metadata values
/// never see one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Preview of the chunk text used as grounding context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_int",
        skip_serializing_if = "Option::is_none"
    )]
    pub chunk_index: Option<i64>,
    #[serde(
        default,
        deserialize_with = "lenient_int",
        skip_serializing_if = "Option::is_none"
    )]
    pub total_chunks: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_int",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<i64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, MetadataValue>,
}

/// Index backends may hand integers back as floats (`3.0`).
fn lenient_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<f64> = Option::deserialize(deserializer)?;
    Ok(value.map(|f| f as i64))
}

/// Keys with a dedicated field on [`ChunkMetadata`].
const RESERVED_KEYS: &[&str] = &[
    "text",
    "filename",
    "source_type",
    "source_id",
    "chunk_index",
    "total_chunks",
    "site",
    "url",
    "title",
    "section",
    "created_at",
];

impl ChunkMetadata {
    /// Insert a passthrough field from JSON.
    ///
    /// Returns `false` (and stores nothing) when the value is null, the key
    /// collides with a typed field, or the extension map is full.
    pub fn insert_extra(&mut self, key: &str, value: &serde_json::Value) -> bool {
        if RESERVED_KEYS.contains(&key) {
            return false;
        }
        if self.extra.len() >= MAX_EXTRA_FIELDS && !self.extra.contains_key(key) {
            return false;
        }
        match MetadataValue::from_json(value) {
            Some(v) => {
                self.extra.insert(key.to_string(), v);
                true
            }
            None => false,
        }
    }

    /// Serialize into a flat JSON object. Never contains nulls.
    pub fn to_json(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

/// Metadata-equality predicate. All entries must match (logical AND).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataFilter(pub BTreeMap<String, MetadataValue>);

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: require `key == value`.
    pub fn eq(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Evaluate the predicate against stored metadata.
    pub fn matches(&self, metadata: &ChunkMetadata) -> bool {
        let flat = metadata.to_json();
        self.0.iter().all(|(key, want)| match flat.get(key) {
            Some(have) => serde_json::to_value(want).is_ok_and(|w| json_eq(&w, have)),
            None => false,
        })
    }

    /// Render as a Pinecone-style filter: `{"key": {"$eq": value}}`.
    pub fn to_pinecone(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (key, value) in &self.0 {
            map.insert(key.clone(), serde_json::json!({ "$eq": value }));
        }
        serde_json::Value::Object(map)
    }
}

/// JSON equality that treats `3` and `3.0` as equal.
fn json_eq(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// An `(id, vector, metadata)` triple persisted in the vector index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexedVector {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// A ranked match returned by a vector index query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexMatch {
    pub id: String,
    pub score: f32,
    pub metadata: ChunkMetadata,
}

/// Index-wide counters, as reported by `describe_index_stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub dimension: usize,
    pub index_fullness: f64,
    pub total_vector_count: usize,
    pub namespaces: BTreeMap<String, NamespaceStats>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceStats {
    pub vector_count: usize,
}

/// A grounding passage extracted from an [`IndexMatch`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Passage {
    pub text: String,
    pub score: f32,
    pub metadata: ChunkMetadata,
}

/// Ranked passages, highest similarity first. May be empty, which means
/// "no grounding available", never an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub passages: Vec<Passage>,
}

impl RetrievalResult {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from raw matches: drop matches without a `text` field and
    /// order by descending score.
    pub fn from_matches(matches: Vec<IndexMatch>) -> Self {
        let mut passages: Vec<Passage> = matches
            .into_iter()
            .filter_map(|m| {
                let text = m.metadata.text.clone()?;
                Some(Passage {
                    text,
                    score: m.score,
                    metadata: m.metadata,
                })
            })
            .collect();
        passages.sort_by(|a, b| b.score.total_cmp(&a.score));
        Self { passages }
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.passages.iter().map(|p| p.text.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn none_fields_are_not_serialized() {
        let meta = ChunkMetadata {
            filename: Some("a.jsonl".into()),
            chunk_index: Some(0),
            ..Default::default()
        };
        let flat = meta.to_json();
        assert_eq!(flat.len(), 2);
        assert!(flat.values().all(|v| !v.is_null()));
    }

    #[test]
    fn insert_extra_rejects_null_and_reserved() {
        let mut meta = ChunkMetadata::default();
        assert!(!meta.insert_extra("author", &json!(null)));
        assert!(!meta.insert_extra("text", &json!("override")));
        assert!(meta.insert_extra("author", &json!("desk")));
        assert!(meta.insert_extra("nested", &json!({"a": 1})));
        assert_eq!(
            meta.extra.get("nested"),
            Some(&MetadataValue::Text("{\"a\":1}".into()))
        );
    }

    #[test]
    fn extension_map_is_bounded() {
        let mut meta = ChunkMetadata::default();
        for i in 0..(MAX_EXTRA_FIELDS + 5) {
            meta.insert_extra(&format!("k{i}"), &json!(i));
        }
        assert_eq!(meta.extra.len(), MAX_EXTRA_FIELDS);
    }

    #[test]
    fn deserializes_float_counters() {
        let meta: ChunkMetadata = serde_json::from_value(json!({
            "text": "hello",
            "chunk_index": 2.0,
            "total_chunks": 3,
            "lang": "hi"
        }))
        .unwrap();
        assert_eq!(meta.chunk_index, Some(2));
        assert_eq!(meta.total_chunks, Some(3));
        assert_eq!(meta.extra.get("lang"), Some(&MetadataValue::Text("hi".into())));
    }

    #[test]
    fn filter_matches_by_equality() {
        let meta = ChunkMetadata {
            filename: Some("faq.jsonl".into()),
            source_type: Some("jsonl".into()),
            chunk_index: Some(1),
            ..Default::default()
        };
        assert!(MetadataFilter::new().matches(&meta));
        assert!(MetadataFilter::new().eq("source_type", "jsonl").matches(&meta));
        assert!(MetadataFilter::new().eq("chunk_index", 1i64).matches(&meta));
        assert!(!MetadataFilter::new().eq("filename", "other.jsonl").matches(&meta));
        assert!(!MetadataFilter::new().eq("site", "patrika.com").matches(&meta));
    }

    #[test]
    fn filter_renders_pinecone_syntax() {
        let f = MetadataFilter::new().eq("filename", "faq.jsonl");
        assert_eq!(f.to_pinecone(), json!({"filename": {"$eq": "faq.jsonl"}}));
    }

    #[test]
    fn retrieval_result_drops_textless_and_sorts() {
        let with_text = |id: &str, score: f32| IndexMatch {
            id: id.into(),
            score,
            metadata: ChunkMetadata {
                text: Some(format!("text {id}")),
                ..Default::default()
            },
        };
        let result = RetrievalResult::from_matches(vec![
            with_text("a", 0.2),
            IndexMatch {
                id: "b".into(),
                score: 0.9,
                metadata: ChunkMetadata::default(),
            },
            with_text("c", 0.7),
        ]);
        let texts: Vec<&str> = result.texts().collect();
        assert_eq!(texts, vec!["text c", "text a"]);
    }

    #[test]
    fn parse_loose_values() {
        assert_eq!(MetadataValue::parse_loose("true"), MetadataValue::Bool(true));
        assert_eq!(MetadataValue::parse_loose("12"), MetadataValue::Int(12));
        assert_eq!(
            MetadataValue::parse_loose("jsonl"),
            MetadataValue::Text("jsonl".into())
        );
    }
}
