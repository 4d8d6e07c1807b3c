//! Directory-backed embedded vector store.
//!
//! Each collection is a JSON snapshot `<name>.json` followed by a CRC32
//! footer. Writes go to a temp file that is renamed into place, so a crash
//! leaves the previous snapshot intact. A change becomes visible to readers
//! only after its snapshot is on disk. Search is brute-force cosine.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::types::{MetadataFilter, Payload, ScoredRecord, VectorRecord};
use super::VectorBackend;
use crate::external::embedding::cosine_similarity;

const SNAPSHOT_EXTENSION: &str = "json";
const SNAPSHOT_CRC_MAGIC: &[u8; 4] = b"TKC1";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredVector {
    text: String,
    embedding: Vec<f32>,
    metadata: Payload,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CollectionData {
    name: String,
    records: BTreeMap<String, StoredVector>,
}

/// Readers use `data`; writers also hold `writer` for the whole
/// stage, persist and commit sequence.
struct CollectionHandle {
    data: RwLock<CollectionData>,
    writer: Mutex<()>,
}

impl CollectionHandle {
    fn new(data: CollectionData) -> Self {
        Self {
            data: RwLock::new(data),
            writer: Mutex::new(()),
        }
    }
}

type Collection = Arc<CollectionHandle>;

pub struct LocalBackend {
    root: PathBuf,
    collections: RwLock<HashMap<String, Collection>>,
}

/// Collection names become file names, so keep them to a safe alphabet.
fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(anyhow!("invalid collection name length: '{}'", name));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(anyhow!("invalid collection name: '{}'", name));
    }
    Ok(())
}

impl LocalBackend {
    /// Opens (or creates) a store rooted at `root`. Snapshots load lazily.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating vector store directory {:?}", root))?;
        tracing::info!(path = ?root, "Opened local vector store");

        Ok(Self {
            root,
            collections: RwLock::new(HashMap::new()),
        })
    }

    fn snapshot_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.{}", name, SNAPSHOT_EXTENSION))
    }

    async fn load(&self, name: &str) -> Result<Option<Collection>> {
        let cached = self.collections.read().get(name).cloned();
        if cached.is_some() {
            return Ok(cached);
        }

        let path = self.snapshot_path(name);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }

        let raw = tokio::fs::read(&path).await?;
        let data = decode_snapshot(&path, &raw)?;
        let mut collections = self.collections.write();
        let entry = collections
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CollectionHandle::new(data)));
        Ok(Some(entry.clone()))
    }

    async fn get(&self, name: &str) -> Result<Collection> {
        self.load(name)
            .await?
            .ok_or_else(|| anyhow!("collection '{}' does not exist", name))
    }

    /// Applies `change` to a copy of the collection, persists the copy and
    /// only then makes it visible. `change` returns its result and whether
    /// anything changed; unchanged collections are not rewritten.
    async fn mutate<T, F>(&self, collection: &Collection, change: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(&mut CollectionData) -> Result<(T, bool)> + Send,
    {
        let _writer = collection.writer.lock().await;

        let mut staged = collection.data.read().clone();
        let (result, changed) = change(&mut staged)?;
        if !changed {
            return Ok(result);
        }

        let bytes = encode_snapshot(&staged)?;
        persist(self.root.clone(), staged.name.clone(), bytes).await?;
        tracing::debug!(
            collection = %staged.name,
            records = staged.records.len(),
            "Saved collection snapshot"
        );

        *collection.data.write() = staged;
        Ok(result)
    }
}

fn encode_snapshot(data: &CollectionData) -> Result<Vec<u8>> {
    let mut output = serde_json::to_vec(data)?;
    let crc = crc32fast::hash(&output);
    output.extend_from_slice(SNAPSHOT_CRC_MAGIC);
    output.extend_from_slice(&crc.to_be_bytes());
    Ok(output)
}

/// Writes the snapshot to a temp file and renames it into place.
async fn persist(dir: PathBuf, name: String, bytes: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let path = dir.join(format!("{}.{}", name, SNAPSHOT_EXTENSION));
        let tmp_path = dir.join(format!("{}.{}.tmp", name, SNAPSHOT_EXTENSION));
        fs::write(&tmp_path, &bytes)
            .with_context(|| format!("writing snapshot {:?}", tmp_path))?;
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("replacing snapshot {:?}", path))?;
        Ok(())
    })
    .await
    .context("snapshot writer panicked")?
}

fn decode_snapshot(path: &Path, raw: &[u8]) -> Result<CollectionData> {
    let payload = if raw.len() >= 8 && &raw[raw.len() - 8..raw.len() - 4] == SNAPSHOT_CRC_MAGIC {
        let body = &raw[..raw.len() - 8];
        let mut stored = [0u8; 4];
        stored.copy_from_slice(&raw[raw.len() - 4..]);
        let stored_crc = u32::from_be_bytes(stored);
        let computed_crc = crc32fast::hash(body);
        if stored_crc != computed_crc {
            return Err(anyhow!(
                "snapshot {:?} is corrupted: CRC32 {:#010x} != {:#010x}",
                path,
                stored_crc,
                computed_crc
            ));
        }
        body
    } else {
        tracing::warn!(path = ?path, "Snapshot has no checksum footer");
        raw
    };

    let data: CollectionData = serde_json::from_slice(payload)
        .with_context(|| format!("decoding snapshot {:?}", path))?;
    tracing::info!(
        collection = %data.name,
        records = data.records.len(),
        "Loaded collection snapshot"
    );
    Ok(data)
}

fn matches(filter: Option<&MetadataFilter>, metadata: &Payload) -> bool {
    filter.map(|f| f.matches(metadata)).unwrap_or(true)
}

#[async_trait]
impl VectorBackend for LocalBackend {
    async fn ensure_collection(&self, name: &str) -> Result<()> {
        validate_collection_name(name)?;
        if self.load(name).await?.is_some() {
            return Ok(());
        }

        let data = CollectionData {
            name: name.to_string(),
            records: BTreeMap::new(),
        };
        persist(self.root.clone(), name.to_string(), encode_snapshot(&data)?).await?;
        self.collections
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CollectionHandle::new(data)));
        tracing::info!(collection = %name, "Created collection");
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        validate_collection_name(name)?;
        Ok(self.load(name).await?.is_some())
    }

    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<Vec<String>> {
        let handle = self.get(collection).await?;

        self.mutate(&handle, |data| {
            if let Some(dim) = data.records.values().next().map(|r| r.embedding.len()) {
                if let Some(bad) = records.iter().find(|r| r.embedding.len() != dim) {
                    return Err(anyhow!(
                        "record '{}' has dimension {}, collection '{}' expects {}",
                        bad.id,
                        bad.embedding.len(),
                        collection,
                        dim
                    ));
                }
            }

            let mut ids = Vec::with_capacity(records.len());
            for record in records {
                ids.push(record.id.clone());
                data.records.insert(
                    record.id,
                    StoredVector {
                        text: record.text,
                        embedding: record.embedding,
                        metadata: record.metadata,
                    },
                );
            }
            let changed = !ids.is_empty();
            Ok((ids, changed))
        })
        .await
    }

    async fn query(
        &self,
        collection: &str,
        embedding: Vec<f32>,
        limit: usize,
        filter: Option<MetadataFilter>,
    ) -> Result<Vec<ScoredRecord>> {
        let handle = self.get(collection).await?;
        let data = handle.data.read();

        let mut hits: Vec<ScoredRecord> = data
            .records
            .iter()
            .filter(|(_, stored)| matches(filter.as_ref(), &stored.metadata))
            .map(|(id, stored)| ScoredRecord {
                id: id.clone(),
                text: stored.text.clone(),
                metadata: stored.metadata.clone(),
                score: cosine_similarity(&embedding, &stored.embedding),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete_ids(&self, collection: &str, ids: Vec<String>) -> Result<usize> {
        let handle = self.get(collection).await?;

        self.mutate(&handle, |data| {
            let removed = ids
                .iter()
                .filter(|id| data.records.remove(id.as_str()).is_some())
                .count();
            Ok((removed, removed > 0))
        })
        .await
    }

    async fn delete_where(&self, collection: &str, filter: MetadataFilter) -> Result<usize> {
        if filter.is_empty() {
            return Err(anyhow!("refusing to delete from {} with an empty filter", collection));
        }
        let handle = self.get(collection).await?;

        self.mutate(&handle, |data| {
            let before = data.records.len();
            data.records
                .retain(|_, stored| !filter.matches(&stored.metadata));
            let removed = before - data.records.len();
            Ok((removed, removed > 0))
        })
        .await
    }

    async fn count(&self, collection: &str, filter: Option<MetadataFilter>) -> Result<usize> {
        let handle = self.get(collection).await?;
        let data = handle.data.read();
        Ok(data
            .records
            .values()
            .filter(|stored| matches(filter.as_ref(), &stored.metadata))
            .count())
    }

    async fn drop_collection(&self, name: &str) -> Result<()> {
        validate_collection_name(name)?;
        self.collections.write().remove(name);

        let path = self.snapshot_path(name);
        if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }
}
