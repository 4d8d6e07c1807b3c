use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::external::{build_prompt, ChatMessage, ChatRole, GenerationParams, LanguageModel};
use crate::store::{
    ChunkMetadata, MetadataFilter, Partition, PartitionStats, ScoredChunk, VectorStore,
};

/// Rough on-disk footprint of one stored chunk, in megabytes.
const MB_PER_CHUNK: f64 = 0.001;

pub const NO_INFORMATION_ANSWER: &str =
    "Xin lỗi, tôi không tìm thấy thông tin liên quan trong tài liệu của bạn.";

const ANSWER_INSTRUCTION: &str = "Bạn là trợ lý giảng dạy. Chỉ dựa vào ngữ cảnh được cung cấp \
để trả lời câu hỏi bằng tiếng Việt, ngắn gọn và chính xác. Nếu ngữ cảnh không có thông tin, \
hãy nói rõ là không biết.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub text: String,
    pub score: f32,
    pub metadata: ChunkMetadata,
    pub source: Option<String>,
}

impl From<ScoredChunk> for SearchResult {
    fn from(chunk: ScoredChunk) -> Self {
        let source = chunk.metadata.source_label().map(str::to_string);
        Self {
            text: chunk.text,
            score: chunk.score,
            metadata: chunk.metadata,
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserKnowledgeStats {
    pub user_id: i64,
    /// Chunks in the user's own partition.
    pub total_chunks: usize,
    /// The user's chunks mirrored into the global partition.
    pub global_chunks: usize,
    pub collections: Vec<PartitionStats>,
    pub storage_used_mb: f64,
    pub last_updated: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<String>,
    pub confidence: f32,
    pub results: Vec<SearchResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatAnswer {
    pub reply: String,
    pub sources: Vec<String>,
    pub results: Vec<SearchResult>,
}

/// Query-time access to stored knowledge.
pub struct RagRetriever {
    store: Arc<VectorStore>,
}

impl RagRetriever {
    pub fn new(store: Arc<VectorStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    /// Hybrid search for a user, or global-only search when `user_id` is `None`.
    pub async fn search(
        &self,
        query: &str,
        user_id: Option<i64>,
        top_k: usize,
        filters: Option<MetadataFilter>,
    ) -> Result<Vec<SearchResult>> {
        let hits = match user_id {
            Some(user_id) => {
                self.store
                    .hybrid_search(query, user_id, top_k, filters)
                    .await?
            }
            None => {
                self.store
                    .search(query, &Partition::Global, top_k, filters)
                    .await?
            }
        };

        tracing::debug!(query, results = hits.len(), "Search finished");
        Ok(hits.into_iter().map(SearchResult::from).collect())
    }

    pub async fn user_stats(&self, user_id: i64) -> Result<UserKnowledgeStats> {
        let user = self.store.stats(&Partition::User(user_id)).await?;
        let global_chunks = self
            .store
            .count(
                &Partition::Global,
                Some(MetadataFilter::new().eq("user_id", user_id)),
            )
            .await?;
        let global = PartitionStats {
            count: global_chunks,
            ..self.store.stats(&Partition::Global).await?
        };

        let total_chunks = user.count;
        Ok(UserKnowledgeStats {
            user_id,
            total_chunks,
            global_chunks,
            storage_used_mb: ((total_chunks + global_chunks) as f64 * MB_PER_CHUNK * 1000.0)
                .round()
                / 1000.0,
            collections: vec![user, global],
            last_updated: Utc::now().to_rfc3339(),
        })
    }

    pub async fn document_chunk_count(&self, document_id: i64, user_id: i64) -> Result<usize> {
        self.store
            .count(
                &Partition::User(user_id),
                Some(
                    MetadataFilter::new()
                        .eq("user_id", user_id)
                        .eq("document_id", document_id),
                ),
            )
            .await
    }

    /// Removes the documents' chunks from both partitions; returns how many
    /// of the documents had anything stored.
    pub async fn delete_documents(&self, user_id: i64, document_ids: &[i64]) -> Result<usize> {
        let mut documents_removed = 0;

        for &document_id in document_ids {
            let filter = MetadataFilter::new()
                .eq("user_id", user_id)
                .eq("document_id", document_id);

            let from_user = self
                .store
                .delete_where(filter.clone(), &Partition::User(user_id))
                .await?;
            let from_global = self
                .store
                .delete_where(filter, &Partition::Global)
                .await?;

            if from_user + from_global > 0 {
                documents_removed += 1;
            }
            tracing::info!(user_id, document_id, from_user, from_global, "Deleted document chunks");
        }

        Ok(documents_removed)
    }

    /// Drops the user's partition and their entries in the global partition.
    pub async fn clear_user_knowledge(&self, user_id: i64) -> Result<usize> {
        let in_user = self.store.count(&Partition::User(user_id), None).await?;
        self.store.drop_partition(&Partition::User(user_id)).await?;
        let in_global = self
            .store
            .delete_where(
                MetadataFilter::new().eq("user_id", user_id),
                &Partition::Global,
            )
            .await?;

        tracing::info!(user_id, in_user, in_global, "Cleared user knowledge");
        Ok(in_user)
    }

    /// Chunks at least `threshold` similar to `text`.
    pub async fn find_similar(
        &self,
        text: &str,
        user_id: i64,
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<SearchResult>> {
        let results = self.search(text, Some(user_id), top_k, None).await?;
        Ok(results
            .into_iter()
            .filter(|r| r.score >= threshold)
            .collect())
    }

    /// Continues a conversation. Context is retrieved for the latest user
    /// turn and handed to the model as the system message; caller-supplied
    /// system messages are replaced.
    pub async fn converse(
        &self,
        llm: &dyn LanguageModel,
        messages: &[ChatMessage],
        user_id: i64,
        top_k: usize,
        max_context_chars: usize,
    ) -> Result<ChatAnswer> {
        let latest = messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.trim())
            .unwrap_or_default();
        let results = if latest.is_empty() {
            Vec::new()
        } else {
            self.search(latest, Some(user_id), top_k, None).await?
        };

        let mut system = ANSWER_INSTRUCTION.to_string();
        if !results.is_empty() {
            system.push_str("\n\n### Ngữ cảnh:\n");
            system.push_str(&build_context(&results, max_context_chars));
        }

        let mut conversation = Vec::with_capacity(messages.len() + 1);
        conversation.push(ChatMessage::system(system));
        conversation.extend(
            messages
                .iter()
                .filter(|m| m.role != ChatRole::System)
                .cloned(),
        );

        let reply = llm.chat(&conversation, None).await?;
        Ok(ChatAnswer {
            reply,
            sources: unique_sources(&results),
            results,
        })
    }

    /// Retrieves context for `question` and asks the LLM to answer from it.
    pub async fn answer(
        &self,
        llm: &dyn LanguageModel,
        question: &str,
        user_id: i64,
        top_k: usize,
        max_context_chars: usize,
    ) -> Result<Answer> {
        let results = self.search(question, Some(user_id), top_k, None).await?;
        if results.is_empty() {
            return Ok(Answer {
                answer: NO_INFORMATION_ANSWER.to_string(),
                sources: Vec::new(),
                confidence: 0.0,
                results,
            });
        }

        let context = build_context(&results, max_context_chars);
        let prompt = build_prompt(ANSWER_INSTRUCTION, &context, question);
        let answer = llm
            .complete(&prompt, Some(GenerationParams::default()))
            .await?;

        let confidence = results.iter().map(|r| r.score).sum::<f32>() / results.len() as f32;
        Ok(Answer {
            answer,
            sources: unique_sources(&results),
            confidence,
            results,
        })
    }
}

/// Distinct result sources in first-seen order.
pub fn unique_sources(results: &[SearchResult]) -> Vec<String> {
    let mut sources: Vec<String> = Vec::new();
    for source in results.iter().filter_map(|r| r.source.as_ref()) {
        if !sources.contains(source) {
            sources.push(source.clone());
        }
    }
    sources
}

const BLOCK_SEPARATOR: &str = "\n---\n";

/// Concatenates results as `[Source: X]` blocks within `max_chars`. The block
/// that crosses the budget is cut short with `...` and assembly stops there.
pub fn build_context(results: &[SearchResult], max_chars: usize) -> String {
    let mut context = String::new();
    let mut used = 0;

    for result in results {
        let source = result.source.as_deref().unwrap_or("Unknown");
        let block = format!("[Source: {}]\n{}", source, result.text.trim());
        let separator = if context.is_empty() { 0 } else { BLOCK_SEPARATOR.len() };
        let block_len = block.chars().count();

        if used + separator + block_len <= max_chars {
            if separator > 0 {
                context.push_str(BLOCK_SEPARATOR);
            }
            context.push_str(&block);
            used += separator + block_len;
            continue;
        }

        let remaining = max_chars.saturating_sub(used + separator + 3);
        if remaining > 0 {
            if separator > 0 {
                context.push_str(BLOCK_SEPARATOR);
            }
            context.extend(block.chars().take(remaining));
            context.push_str("...");
        }
        break;
    }

    context
}
