use anyhow::Result;
use async_trait::async_trait;
use qdrant_client::{
    config::QdrantConfig,
    qdrant::{
        point_id::PointIdOptions, points_selector::PointsSelectorOneOf, r#match::MatchValue,
        value::Kind, vectors_config::Config, Condition, CountPoints, CreateCollection,
        DeletePoints, Distance, Filter, PointId, PointStruct, PointsIdsList, PointsSelector,
        SearchPoints, UpsertPoints, Value, VectorParams, VectorsConfig, WithPayloadSelector,
        WriteOrdering,
    },
    Qdrant,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::external::error::{service_url, ExternalError};
use crate::store::{MetadataFilter, Payload, ScoredRecord, VectorBackend, VectorRecord};

/// Payload keys holding the chunk id and text next to the flattened metadata.
const ID_FIELD: &str = "_chunk_id";
const TEXT_FIELD: &str = "_text";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Qdrant,
}

impl std::str::FromStr for BackendKind {
    type Err = ExternalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "qdrant" => Ok(BackendKind::Qdrant),
            other => Err(ExternalError::ConfigError(format!(
                "unknown vector backend '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorDBConfig {
    pub backend: BackendKind,
    /// Name of the global knowledge collection.
    pub collection_name: String,
    pub host: String,
    pub port: u16,
    pub vector_size: usize,
    /// Directory for the local backend.
    pub path: String,
    pub timeout_secs: u64,
}

impl VectorDBConfig {
    /// Get the full URL for the Qdrant service
    pub fn get_url(&self) -> Result<String> {
        Ok(service_url(&self.host, self.port)?)
    }
}

impl Default for VectorDBConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            collection_name: "ta_edu_knowledge".to_string(),
            host: "localhost".to_string(),
            port: 6334,
            vector_size: 768,
            path: "./data/vector_db".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Qdrant point ids must be UUIDs or integers; chunk ids map onto UUIDv5.
pub fn point_uuid(chunk_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, chunk_id.as_bytes()).to_string()
}

fn point_id(chunk_id: &str) -> PointId {
    PointId {
        point_id_options: Some(PointIdOptions::Uuid(point_uuid(chunk_id))),
    }
}

fn to_qdrant_value(value: &serde_json::Value) -> Option<Value> {
    match value {
        serde_json::Value::String(s) => Some(Value::from(s.clone())),
        serde_json::Value::Bool(b) => Some(Value::from(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Some(Value::from(i)),
            None => n.as_f64().map(Value::from),
        },
        serde_json::Value::Null => None,
        // Nested structures are kept as their JSON text.
        other => Some(Value::from(other.to_string())),
    }
}

fn from_qdrant_value(value: Value) -> serde_json::Value {
    match value.kind {
        Some(Kind::StringValue(s)) => serde_json::Value::String(s),
        Some(Kind::IntegerValue(i)) => serde_json::Value::from(i),
        Some(Kind::DoubleValue(d)) => serde_json::Value::from(d),
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(b),
        _ => serde_json::Value::Null,
    }
}

/// Qdrant matches keywords, integers and booleans only.
fn to_condition(key: &str, value: &serde_json::Value) -> Result<Condition> {
    let matcher = match value {
        serde_json::Value::String(s) => Some(MatchValue::from(s.clone())),
        serde_json::Value::Bool(b) => Some(MatchValue::from(*b)),
        serde_json::Value::Number(n) => n.as_i64().map(MatchValue::from),
        _ => None,
    };
    let matcher = matcher.ok_or_else(|| {
        ExternalError::VectorDBError(format!(
            "unsupported filter value for '{}': {}",
            key, value
        ))
    })?;
    Ok(Condition::matches(key, matcher))
}

fn to_filter(filter: &MetadataFilter) -> Result<Option<Filter>> {
    if filter.is_empty() {
        return Ok(None);
    }

    let conditions = filter
        .conditions()
        .iter()
        .map(|(key, value)| to_condition(key, value))
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(Filter::must(conditions)))
}

fn optional_filter(filter: Option<&MetadataFilter>) -> Result<Option<Filter>> {
    Ok(filter.map(to_filter).transpose()?.flatten())
}

/// Qdrant-backed [`VectorBackend`]. Cosine similarity scores are clamped to `[0, 1]`.
pub struct QdrantBackend {
    client: Qdrant,
    config: VectorDBConfig,
}

impl QdrantBackend {
    /// Create a new vector database client with the given configuration
    pub fn new(config: VectorDBConfig) -> Result<Self> {
        let url = config.get_url()?;
        let qdrant_config = QdrantConfig::from_url(&url);
        let client = Qdrant::new(qdrant_config)
            .map_err(|e| ExternalError::ConnectionError(e.to_string()))?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl VectorBackend for QdrantBackend {
    async fn ensure_collection(&self, name: &str) -> Result<()> {
        if self.collection_exists(name).await? {
            return Ok(());
        }

        let vectors_config = VectorsConfig {
            config: Some(Config::Params(VectorParams {
                size: self.config.vector_size as u64,
                distance: Distance::Cosine.into(),
                ..Default::default()
            })),
        };

        let create_collection = CreateCollection {
            collection_name: name.to_string(),
            vectors_config: Some(vectors_config),
            ..Default::default()
        };

        if let Err(e) = self.client.create_collection(create_collection).await {
            // Another writer may have created it in the meantime.
            if !self.collection_exists(name).await? {
                return Err(ExternalError::VectorDBError(e.to_string()).into());
            }
        }

        tracing::info!(collection = %name, "Created Qdrant collection");
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        Ok(self
            .client
            .collection_exists(name)
            .await
            .map_err(|e| ExternalError::VectorDBError(e.to_string()))?)
    }

    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<Vec<String>> {
        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();

        let points: Vec<PointStruct> = records
            .into_iter()
            .map(|record| {
                let mut payload: HashMap<String, Value> = record
                    .metadata
                    .iter()
                    .filter_map(|(k, v)| to_qdrant_value(v).map(|v| (k.clone(), v)))
                    .collect();
                payload.insert(ID_FIELD.to_string(), Value::from(record.id.clone()));
                payload.insert(TEXT_FIELD.to_string(), Value::from(record.text));

                PointStruct {
                    id: Some(point_id(&record.id)),
                    payload,
                    vectors: Some(record.embedding.into()),
                }
            })
            .collect();

        let upsert_points = UpsertPoints {
            collection_name: collection.to_string(),
            wait: Some(true),
            points,
            ordering: Some(WriteOrdering::default()),
            ..Default::default()
        };

        self.client
            .upsert_points(upsert_points)
            .await
            .map_err(|e| ExternalError::VectorDBError(e.to_string()))?;

        Ok(ids)
    }

    async fn query(
        &self,
        collection: &str,
        embedding: Vec<f32>,
        limit: usize,
        filter: Option<MetadataFilter>,
    ) -> Result<Vec<ScoredRecord>> {
        let search_request = SearchPoints {
            collection_name: collection.to_string(),
            vector: embedding,
            limit: limit as u64,
            filter: optional_filter(filter.as_ref())?,
            with_payload: Some(WithPayloadSelector::from(true)),
            ..Default::default()
        };

        let results = self
            .client
            .search_points(search_request)
            .await
            .map_err(|e| ExternalError::VectorDBError(e.to_string()))?;

        Ok(results
            .result
            .into_iter()
            .map(|point| {
                let mut metadata: Payload = point
                    .payload
                    .into_iter()
                    .map(|(k, v)| (k, from_qdrant_value(v)))
                    .collect();
                let id = match metadata.remove(ID_FIELD) {
                    Some(serde_json::Value::String(id)) => id,
                    _ => String::new(),
                };
                let text = match metadata.remove(TEXT_FIELD) {
                    Some(serde_json::Value::String(text)) => text,
                    _ => String::new(),
                };

                ScoredRecord {
                    id,
                    text,
                    metadata,
                    score: point.score.clamp(0.0, 1.0),
                }
            })
            .collect())
    }

    async fn delete_ids(&self, collection: &str, ids: Vec<String>) -> Result<usize> {
        let count = ids.len();
        let points_selector = PointsSelector {
            points_selector_one_of: Some(PointsSelectorOneOf::Points(PointsIdsList {
                ids: ids.iter().map(|id| point_id(id)).collect(),
            })),
        };

        let delete_points = DeletePoints {
            collection_name: collection.to_string(),
            wait: Some(true),
            points: Some(points_selector),
            ordering: Some(WriteOrdering::default()),
            ..Default::default()
        };

        self.client
            .delete_points(delete_points)
            .await
            .map_err(|e| ExternalError::VectorDBError(e.to_string()))?;

        Ok(count)
    }

    async fn delete_where(&self, collection: &str, filter: MetadataFilter) -> Result<usize> {
        let Some(qdrant_filter) = to_filter(&filter)? else {
            return Err(ExternalError::VectorDBError(
                "refusing to delete with an empty filter".to_string(),
            )
            .into());
        };

        let matched = self.count(collection, Some(filter)).await?;

        let delete_points = DeletePoints {
            collection_name: collection.to_string(),
            wait: Some(true),
            points: Some(PointsSelector {
                points_selector_one_of: Some(PointsSelectorOneOf::Filter(qdrant_filter)),
            }),
            ordering: Some(WriteOrdering::default()),
            ..Default::default()
        };

        self.client
            .delete_points(delete_points)
            .await
            .map_err(|e| ExternalError::VectorDBError(e.to_string()))?;

        Ok(matched)
    }

    async fn count(&self, collection: &str, filter: Option<MetadataFilter>) -> Result<usize> {
        let request = CountPoints {
            collection_name: collection.to_string(),
            filter: optional_filter(filter.as_ref())?,
            exact: Some(true),
            ..Default::default()
        };

        let response = self
            .client
            .count(request)
            .await
            .map_err(|e| ExternalError::VectorDBError(e.to_string()))?;

        Ok(response.result.map(|r| r.count as usize).unwrap_or(0))
    }

    async fn drop_collection(&self, name: &str) -> Result<()> {
        if !self.collection_exists(name).await? {
            return Ok(());
        }
        self.client
            .delete_collection(name)
            .await
            .map_err(|e| ExternalError::VectorDBError(e.to_string()))?;
        Ok(())
    }
}
