//! Shared fixtures for unit tests.

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::TemplateRecord;
use crate::external::embedding::normalize;
use crate::external::{Embedder, ModelInfo};
use crate::rag::RagRetriever;
use crate::store::{LocalBackend, VectorStore};

pub(crate) const DIMENSION: usize = 64;

/// Deterministic bag-of-words embedder: texts sharing words score higher.
pub(crate) struct HashEmbedder;

fn bucket(word: &str) -> usize {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in word.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (hash % DIMENSION as u64) as usize
}

pub(crate) fn hash_embedding(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0; DIMENSION];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        vector[bucket(&word.to_lowercase())] += 1.0;
    }
    normalize(vector)
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(hash_embedding(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| hash_embedding(t)).collect())
    }

    fn dimension(&self) -> Option<usize> {
        Some(DIMENSION)
    }

    fn info(&self) -> ModelInfo {
        ModelInfo {
            model: "hash".to_string(),
            initialized: true,
            parameters: serde_json::json!({ "dimension": DIMENSION }),
        }
    }
}

pub(crate) fn store_in(dir: &Path) -> Arc<VectorStore> {
    let backend = LocalBackend::open(dir).unwrap();
    Arc::new(VectorStore::new(
        Arc::new(backend),
        Arc::new(HashEmbedder),
        "ta_edu_knowledge",
        Duration::from_secs(5),
    ))
}

pub(crate) fn retriever_in(dir: &Path) -> Arc<RagRetriever> {
    Arc::new(RagRetriever::new(store_in(dir)))
}

pub(crate) fn template(id: i64, owner_id: i64, content: &str) -> TemplateRecord {
    TemplateRecord {
        id,
        name: format!("template {}", id),
        content: content.to_string(),
        category: None,
        variables: crate::template::extract_variables(content),
        owner_id,
        created_at: None,
    }
}
