use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Flat metadata map as stored by backends.
pub type Payload = Map<String, Value>;

/// Conjunction of equality conditions on metadata fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilter {
    conditions: Vec<(String, Value)>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        self.conditions.retain(|(k, _)| *k != key);
        self.conditions.push((key, value.into()));
        self
    }

    /// Builds a filter from caller-supplied key/value pairs. Numeric strings
    /// given for the integer id fields are read as integers.
    pub fn from_map(map: &Payload) -> Self {
        map.iter().fold(Self::new(), |filter, (k, v)| {
            filter.eq(k.clone(), caller_value(k, v))
        })
    }

    pub fn merge(self, other: &MetadataFilter) -> Self {
        other
            .conditions
            .iter()
            .fold(self, |filter, (k, v)| filter.eq(k.clone(), v.clone()))
    }

    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, payload: &Payload) -> bool {
        self.conditions.iter().all(|(key, expected)| {
            payload
                .get(key)
                .map(|actual| actual == expected)
                .unwrap_or(false)
        })
    }
}

const INTEGER_FIELDS: &[&str] = &["document_id", "user_id", "chunk_index", "total_chunks"];

fn caller_value(key: &str, value: &Value) -> Value {
    match value {
        Value::String(s) if INTEGER_FIELDS.contains(&key) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| value.clone()),
        _ => value.clone(),
    }
}

/// Record handed to a backend for storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: Payload,
}

/// Backend search hit; `score` is normalized to `[0, 1]`, higher is closer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub id: String,
    pub text: String,
    pub metadata: Payload,
    pub score: f32,
}

/// Known chunk fields plus open-ended caller metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub document_id: i64,
    pub user_id: i64,
    pub chunk_index: usize,
    pub total_chunks: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(flatten)]
    pub extra: Payload,
}

/// Field names owned by [`ChunkMetadata`]; caller metadata may not shadow them.
pub const RESERVED_FIELDS: &[&str] = &[
    "document_id",
    "user_id",
    "chunk_index",
    "total_chunks",
    "file_name",
    "file_type",
    "source",
    "chunk_id",
];

impl ChunkMetadata {
    pub fn to_payload(&self) -> Payload {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Payload::new(),
        }
    }

    /// Lenient decode; records written by other tools keep their fields in `extra`.
    pub fn from_payload(payload: Payload) -> Self {
        serde_json::from_value::<ChunkMetadata>(Value::Object(payload.clone())).unwrap_or_else(
            |_| ChunkMetadata {
                document_id: int_field(&payload, "document_id"),
                user_id: int_field(&payload, "user_id"),
                chunk_index: int_field(&payload, "chunk_index") as usize,
                total_chunks: int_field(&payload, "total_chunks") as usize,
                file_name: str_field(&payload, "file_name"),
                file_type: str_field(&payload, "file_type"),
                source: str_field(&payload, "source"),
                extra: payload
                    .into_iter()
                    .filter(|(k, _)| !RESERVED_FIELDS.contains(&k.as_str()))
                    .collect(),
            },
        )
    }

    /// Display name of where the chunk came from.
    pub fn source_label(&self) -> Option<&str> {
        self.file_name.as_deref().or(self.source.as_deref())
    }
}

fn int_field(payload: &Payload, key: &str) -> i64 {
    match payload.get(key) {
        Some(Value::Number(n)) => n.as_i64().unwrap_or_default(),
        Some(Value::String(s)) => s.trim().parse().unwrap_or_default(),
        _ => 0,
    }
}

fn str_field(payload: &Payload, key: &str) -> Option<String> {
    match payload.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    }
}

/// A chunk ready to be embedded and stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    /// Stable id of chunk `index` of a user's document.
    pub fn make_id(user_id: i64, document_id: i64, index: usize) -> String {
        format!("doc_{}_{}_{}", user_id, document_id, index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub score: f32,
}

impl From<ScoredRecord> for ScoredChunk {
    fn from(record: ScoredRecord) -> Self {
        Self {
            id: record.id,
            text: record.text,
            metadata: ChunkMetadata::from_payload(record.metadata),
            score: record.score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionStats {
    pub name: String,
    pub count: usize,
    pub metadata: Payload,
}
