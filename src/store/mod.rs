pub mod local;
pub mod types;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::external::{Embedder, ExternalError};

pub use local::LocalBackend;
pub use types::{
    Chunk, ChunkMetadata, MetadataFilter, PartitionStats, Payload, ScoredChunk, ScoredRecord,
    VectorRecord,
};

#[cfg(test)]
use mockall::automock;

/// Storage engine holding named collections of embedded records.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Creates the collection if missing; never fails because it already exists.
    async fn ensure_collection(&self, name: &str) -> Result<()>;

    async fn collection_exists(&self, name: &str) -> Result<bool>;

    /// Inserts or overwrites records by id.
    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<Vec<String>>;

    async fn query(
        &self,
        collection: &str,
        embedding: Vec<f32>,
        limit: usize,
        filter: Option<MetadataFilter>,
    ) -> Result<Vec<ScoredRecord>>;

    async fn delete_ids(&self, collection: &str, ids: Vec<String>) -> Result<usize>;

    async fn delete_where(&self, collection: &str, filter: MetadataFilter) -> Result<usize>;

    async fn count(&self, collection: &str, filter: Option<MetadataFilter>) -> Result<usize>;

    async fn drop_collection(&self, name: &str) -> Result<()>;
}

/// Knowledge partition: the shared global collection or one user's collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    Global,
    User(i64),
}

impl Partition {
    pub fn collection_name(&self, global_name: &str) -> String {
        match self {
            Partition::Global => global_name.to_string(),
            Partition::User(id) => format!("user_{}_knowledge", id),
        }
    }
}

/// Partitioned, embedding-aware view over a [`VectorBackend`].
pub struct VectorStore {
    backend: Arc<dyn VectorBackend>,
    embedder: Arc<dyn Embedder>,
    global_collection: String,
    timeout: Duration,
    known: RwLock<HashSet<String>>,
}

impl VectorStore {
    pub fn new(
        backend: Arc<dyn VectorBackend>,
        embedder: Arc<dyn Embedder>,
        global_collection: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            embedder,
            global_collection: global_collection.into(),
            timeout,
            known: RwLock::new(HashSet::new()),
        }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn collection_name(&self, partition: &Partition) -> String {
        partition.collection_name(&self.global_collection)
    }

    async fn bounded<F, T>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ExternalError::Timeout {
                operation: operation.to_string(),
                secs: self.timeout.as_secs(),
            })?
    }

    /// Lazily creates a partition's collection the first time it is written.
    async fn get_or_create(&self, partition: &Partition) -> Result<String> {
        let name = self.collection_name(partition);
        if self.known.read().contains(&name) {
            return Ok(name);
        }

        self.bounded("create collection", self.backend.ensure_collection(&name))
            .await?;
        self.known.write().insert(name.clone());
        tracing::debug!(collection = %name, "Collection ready");
        Ok(name)
    }

    async fn existing(&self, partition: &Partition) -> Result<Option<String>> {
        let name = self.collection_name(partition);
        if self.known.read().contains(&name) {
            return Ok(Some(name));
        }

        let exists = self
            .bounded("check collection", self.backend.collection_exists(&name))
            .await?;
        if exists {
            self.known.write().insert(name.clone());
            Ok(Some(name))
        } else {
            Ok(None)
        }
    }

    /// Embeds and upserts chunks into one partition.
    pub async fn add(&self, chunks: &[Chunk], partition: &Partition) -> Result<Vec<String>> {
        self.add_to_partitions(chunks, &[*partition]).await
    }

    /// Embeds chunks once and upserts them into every listed partition.
    pub async fn add_to_partitions(
        &self,
        chunks: &[Chunk],
        partitions: &[Partition],
    ) -> Result<Vec<String>> {
        let records = self.embed_chunks(chunks).await?;
        self.write_records(records, partitions).await
    }

    /// Turns chunks into records ready for upsert. Nothing is written.
    pub async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<VectorRecord>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;
        if embeddings.len() != chunks.len() {
            anyhow::bail!(
                "embedder returned {} vectors for {} chunks",
                embeddings.len(),
                chunks.len()
            );
        }

        Ok(chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| VectorRecord {
                id: chunk.id.clone(),
                text: chunk.text.clone(),
                embedding,
                metadata: chunk.metadata.to_payload(),
            })
            .collect())
    }

    /// Upserts already embedded records into every listed partition.
    pub async fn write_records(
        &self,
        records: Vec<VectorRecord>,
        partitions: &[Partition],
    ) -> Result<Vec<String>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for partition in partitions {
            let collection = self.get_or_create(partition).await?;
            ids = self
                .bounded("upsert", self.backend.upsert(&collection, records.clone()))
                .await?;
            tracing::info!(
                collection = %collection,
                chunks = ids.len(),
                "Stored chunks"
            );
        }

        Ok(ids)
    }

    /// Similarity search in one partition; a missing partition yields no results.
    pub async fn search(
        &self,
        query: &str,
        partition: &Partition,
        top_k: usize,
        filter: Option<MetadataFilter>,
    ) -> Result<Vec<ScoredChunk>> {
        let embedding = self.embedder.embed(query).await?;
        self.search_embedding(embedding, partition, top_k, filter)
            .await
    }

    pub async fn search_embedding(
        &self,
        embedding: Vec<f32>,
        partition: &Partition,
        top_k: usize,
        filter: Option<MetadataFilter>,
    ) -> Result<Vec<ScoredChunk>> {
        let Some(collection) = self.existing(partition).await? else {
            return Ok(Vec::new());
        };

        let records = self
            .bounded(
                "query",
                self.backend.query(&collection, embedding, top_k, filter),
            )
            .await?;

        Ok(records.into_iter().map(ScoredChunk::from).collect())
    }

    /// Searches a user's partition and their share of the global partition,
    /// then merges by score.
    pub async fn hybrid_search(
        &self,
        query: &str,
        user_id: i64,
        top_k: usize,
        filter: Option<MetadataFilter>,
    ) -> Result<Vec<ScoredChunk>> {
        let embedding = self.embedder.embed(query).await?;

        let user_hits = self
            .search_embedding(
                embedding.clone(),
                &Partition::User(user_id),
                top_k,
                filter.clone(),
            )
            .await?;

        let global_filter = filter
            .unwrap_or_default()
            .eq("user_id", user_id);
        let global_hits = self
            .search_embedding(embedding, &Partition::Global, top_k, Some(global_filter))
            .await?;

        Ok(merge_ranked(user_hits, global_hits, top_k))
    }

    pub async fn delete(&self, ids: Vec<String>, partition: &Partition) -> Result<usize> {
        let Some(collection) = self.existing(partition).await? else {
            return Ok(0);
        };
        self.bounded("delete", self.backend.delete_ids(&collection, ids))
            .await
    }

    pub async fn delete_where(&self, filter: MetadataFilter, partition: &Partition) -> Result<usize> {
        let Some(collection) = self.existing(partition).await? else {
            return Ok(0);
        };
        let removed = self
            .bounded("delete", self.backend.delete_where(&collection, filter))
            .await?;
        tracing::debug!(collection = %collection, removed, "Deleted chunks by filter");
        Ok(removed)
    }

    /// Drops a partition and forgets its cached handle.
    pub async fn drop_partition(&self, partition: &Partition) -> Result<()> {
        let name = self.collection_name(partition);
        self.bounded("drop collection", self.backend.drop_collection(&name))
            .await?;
        self.known.write().remove(&name);
        tracing::info!(collection = %name, "Dropped collection");
        Ok(())
    }

    pub async fn count(&self, partition: &Partition, filter: Option<MetadataFilter>) -> Result<usize> {
        let Some(collection) = self.existing(partition).await? else {
            return Ok(0);
        };
        self.bounded("count", self.backend.count(&collection, filter))
            .await
    }

    pub async fn stats(&self, partition: &Partition) -> Result<PartitionStats> {
        let name = self.collection_name(partition);
        let count = self.count(partition, None).await?;

        let mut metadata = Payload::new();
        let description = match partition {
            Partition::Global => "Shared knowledge across all users".to_string(),
            Partition::User(id) => format!("Knowledge base for user {}", id),
        };
        metadata.insert("description".to_string(), description.into());
        if let Partition::User(id) = partition {
            metadata.insert("user_id".to_string(), (*id).into());
        }

        Ok(PartitionStats {
            name,
            count,
            metadata,
        })
    }
}

/// Unions two result lists, keeping the best score per id, best first.
pub fn merge_ranked(
    first: Vec<ScoredChunk>,
    second: Vec<ScoredChunk>,
    top_k: usize,
) -> Vec<ScoredChunk> {
    let mut best: HashMap<String, ScoredChunk> = HashMap::new();
    for hit in first.into_iter().chain(second) {
        match best.get(&hit.id) {
            Some(existing) if existing.score >= hit.score => {}
            _ => {
                best.insert(hit.id.clone(), hit);
            }
        }
    }

    let mut merged: Vec<ScoredChunk> = best.into_values().collect();
    merged.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    merged.truncate(top_k);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::ModelInfo;
    use mockall::predicate::*;

    struct UnitEmbedder;

    #[async_trait]
    impl Embedder for UnitEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }

        fn dimension(&self) -> Option<usize> {
            Some(2)
        }

        fn info(&self) -> ModelInfo {
            ModelInfo {
                model: "unit".to_string(),
                initialized: true,
                parameters: serde_json::Value::Null,
            }
        }
    }

    fn hit(id: &str, score: f32) -> ScoredChunk {
        ScoredChunk {
            id: id.to_string(),
            text: id.to_string(),
            metadata: ChunkMetadata::default(),
            score,
        }
    }

    fn scored(id: &str, score: f32) -> ScoredRecord {
        ScoredRecord {
            id: id.to_string(),
            text: id.to_string(),
            metadata: Payload::new(),
            score,
        }
    }

    #[test]
    fn test_partition_names() {
        assert_eq!(Partition::Global.collection_name("ta_edu_knowledge"), "ta_edu_knowledge");
        assert_eq!(Partition::User(12).collection_name("x"), "user_12_knowledge");
    }

    #[test]
    fn test_merge_ranked_dedupes_and_orders() {
        let merged = merge_ranked(
            vec![hit("a", 0.4), hit("b", 0.9)],
            vec![hit("a", 0.7), hit("c", 0.1)],
            3,
        );
        let ids: Vec<&str> = merged.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert_eq!(merged[1].score, 0.7);

        assert_eq!(merge_ranked(vec![hit("a", 0.4)], vec![], 0).len(), 0);
    }

    #[tokio::test]
    async fn test_hybrid_search_scopes_global_to_user() {
        let mut backend = MockVectorBackend::new();
        backend
            .expect_collection_exists()
            .returning(|_| Ok(true));
        backend
            .expect_query()
            .with(eq("user_3_knowledge"), always(), eq(2usize), eq(None::<MetadataFilter>))
            .times(1)
            .returning(|_, _, _, _| Ok(vec![scored("u1", 0.8)]));
        backend
            .expect_query()
            .with(
                eq("global"),
                always(),
                eq(2usize),
                eq(Some(MetadataFilter::new().eq("user_id", 3))),
            )
            .times(1)
            .returning(|_, _, _, _| Ok(vec![scored("g1", 0.9), scored("g2", 0.1)]));

        let store = VectorStore::new(
            Arc::new(backend),
            Arc::new(UnitEmbedder),
            "global",
            Duration::from_secs(5),
        );

        let hits = store.hybrid_search("deadline", 3, 2, None).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["g1", "u1"]);
    }

    #[tokio::test]
    async fn test_search_missing_partition_is_empty() {
        let mut backend = MockVectorBackend::new();
        backend
            .expect_collection_exists()
            .returning(|_| Ok(false));
        backend.expect_query().never();

        let store = VectorStore::new(
            Arc::new(backend),
            Arc::new(UnitEmbedder),
            "global",
            Duration::from_secs(5),
        );

        let hits = store
            .search("anything", &Partition::User(1), 5, None)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_collection_created_once() {
        let mut backend = MockVectorBackend::new();
        backend
            .expect_ensure_collection()
            .with(eq("user_1_knowledge"))
            .times(1)
            .returning(|_| Ok(()));
        backend
            .expect_upsert()
            .times(2)
            .returning(|_, records| Ok(records.into_iter().map(|r| r.id).collect()));

        let store = VectorStore::new(
            Arc::new(backend),
            Arc::new(UnitEmbedder),
            "global",
            Duration::from_secs(5),
        );
        let chunk = Chunk {
            id: "doc_1_1_0".to_string(),
            text: "hello".to_string(),
            metadata: ChunkMetadata::default(),
        };

        store.add(&[chunk.clone()], &Partition::User(1)).await.unwrap();
        let ids = store.add(&[chunk], &Partition::User(1)).await.unwrap();
        assert_eq!(ids, vec!["doc_1_1_0".to_string()]);
    }
}
