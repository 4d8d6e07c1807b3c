use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::chunker::Chunker;
use crate::extract::{self, FileKind};
use crate::store::types::RESERVED_FIELDS;
use crate::store::{Chunk, ChunkMetadata, MetadataFilter, Partition, Payload, VectorStore};

/// Cleaned text shorter than this is treated as empty.
pub const DEFAULT_MIN_TEXT_LENGTH: usize = 10;

/// Caller-supplied description of a document being ingested.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub document_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Free-form fields such as course, subject or owner details.
    #[serde(default)]
    pub extra: Payload,
}

impl DocumentMetadata {
    pub fn new(document_id: i64) -> Self {
        Self {
            document_id,
            ..Default::default()
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

/// Outcome of one document in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemReport {
    pub file_path: String,
    pub document_id: i64,
    pub success: bool,
    pub chunks: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub details: Vec<BatchItemReport>,
}

/// Turns a document on disk into embedded chunks in the user's partition and
/// the global partition.
pub struct DocumentProcessor {
    store: Arc<VectorStore>,
    chunker: Chunker,
    min_text_length: usize,
}

impl DocumentProcessor {
    pub fn new(store: Arc<VectorStore>, chunker: Chunker, min_text_length: usize) -> Self {
        Self {
            store,
            chunker,
            min_text_length,
        }
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    /// Extracts, chunks, embeds and stores one document; returns the chunk
    /// count. Re-processing a document replaces its previous chunks.
    pub async fn process_document(
        &self,
        file_path: &Path,
        user_id: i64,
        metadata: DocumentMetadata,
    ) -> Result<usize> {
        if !file_path.exists() {
            return Err(anyhow!("file not found: {}", file_path.display()));
        }

        let path = file_path.to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || extract::extract(&path))
            .await
            .context("extraction task panicked")??;

        if extracted.text.chars().count() < self.min_text_length {
            tracing::warn!(
                path = %file_path.display(),
                document_id = metadata.document_id,
                "Document has too little text, nothing stored"
            );
            return Ok(0);
        }

        let chunks = self.build_chunks(file_path, user_id, &metadata, &extracted.text);
        let document_id = metadata.document_id;

        // Stored chunks stay untouched until the replacement is embedded.
        let records = self.store.embed_chunks(&chunks).await?;

        let owned = MetadataFilter::new()
            .eq("user_id", user_id)
            .eq("document_id", document_id);
        let partitions = [Partition::User(user_id), Partition::Global];
        let mut previous = Vec::with_capacity(partitions.len());
        for partition in &partitions {
            previous.push(self.store.count(partition, Some(owned.clone())).await?);
        }

        self.store.write_records(records, &partitions).await?;

        for (partition, previous) in partitions.iter().zip(previous) {
            if previous > chunks.len() {
                let stale: Vec<String> = (chunks.len()..previous)
                    .map(|index| Chunk::make_id(user_id, document_id, index))
                    .collect();
                self.store.delete(stale, partition).await?;
            }
        }

        tracing::info!(
            document_id,
            user_id,
            chunks = chunks.len(),
            skipped_sections = extracted.skipped,
            "Processed document"
        );
        Ok(chunks.len())
    }

    fn build_chunks(
        &self,
        file_path: &Path,
        user_id: i64,
        metadata: &DocumentMetadata,
        text: &str,
    ) -> Vec<Chunk> {
        let pieces = self.chunker.split(text);
        let total = pieces.len();

        let mut extra: Payload = metadata
            .extra
            .iter()
            .filter(|(k, _)| !RESERVED_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        extra.insert(
            "file_path".to_string(),
            file_path.display().to_string().into(),
        );
        extra.insert(
            "extraction_time".to_string(),
            Utc::now().to_rfc3339().into(),
        );

        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        let file_type = FileKind::from_path(file_path).map(|k| k.extension().to_string());

        pieces
            .into_iter()
            .enumerate()
            .map(|(index, piece)| Chunk {
                id: Chunk::make_id(user_id, metadata.document_id, index),
                text: piece.text,
                metadata: ChunkMetadata {
                    document_id: metadata.document_id,
                    user_id,
                    chunk_index: index,
                    total_chunks: total,
                    file_name: file_name.clone(),
                    file_type: file_type.clone(),
                    source: metadata.source.clone(),
                    extra: extra.clone(),
                },
            })
            .collect()
    }

    /// Processes documents one after another; a failure is recorded and the
    /// batch continues.
    pub async fn process_batch(
        &self,
        items: Vec<(PathBuf, DocumentMetadata)>,
        user_id: i64,
    ) -> BatchReport {
        let mut report = BatchReport {
            total: items.len(),
            ..Default::default()
        };

        for (path, metadata) in items {
            let document_id = metadata.document_id;
            let item = match self.process_document(&path, user_id, metadata).await {
                Ok(chunks) => BatchItemReport {
                    file_path: path.display().to_string(),
                    document_id,
                    success: true,
                    chunks,
                    error: None,
                },
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "Failed to process document");
                    BatchItemReport {
                        file_path: path.display().to_string(),
                        document_id,
                        success: false,
                        chunks: 0,
                        error: Some(e.to_string()),
                    }
                }
            };

            if item.success {
                report.successful += 1;
            } else {
                report.failed += 1;
            }
            report.details.push(item);
        }

        report
    }
}
