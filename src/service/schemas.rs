use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::catalog::DocumentStatus;
use crate::external::ChatMessage;
use crate::rag::SearchResult;
use crate::store::Payload;
use crate::template::{CommonVariable, FilledTemplate};

fn default_top_k() -> usize {
    5
}

fn default_true() -> bool {
    true
}

fn default_similarity_threshold() -> f32 {
    0.7
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub user_id: i64,
    pub document_id: i64,
    /// Path of the uploaded file on this host. Falls back to the catalog's path.
    #[serde(default)]
    pub file_path: Option<String>,
    /// Extra metadata stored with every chunk (course, subject, ...).
    #[serde(default)]
    pub metadata: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub document_id: i64,
    pub status: DocumentStatus,
    pub chunks_extracted: usize,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Seconds spent in the background task.
    #[serde(default)]
    pub processing_time: Option<f64>,
}

impl ExtractionResult {
    pub fn processing(document_id: i64) -> Self {
        Self {
            document_id,
            status: DocumentStatus::Processing,
            chunks_extracted: 0,
            error_message: None,
            processing_time: None,
        }
    }

    pub fn failed(document_id: i64, message: impl Into<String>) -> Self {
        Self {
            document_id,
            status: DocumentStatus::Error,
            chunks_extracted: 0,
            error_message: Some(message.into()),
            processing_time: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchExtractionRequest {
    pub user_id: i64,
    pub document_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchExtractionResponse {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<ExtractionResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionStatus {
    pub document_id: i64,
    pub status: DocumentStatus,
    pub chunks_extracted: usize,
    pub original_name: String,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchScope {
    #[default]
    User,
    Global,
}

impl FromStr for SearchScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(SearchScope::User),
            "global" => Ok(SearchScope::Global),
            other => Err(format!(
                "search_scope phải là \"user\" hoặc \"global\", nhận được \"{}\"",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub user_id: i64,
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub search_scope: SearchScope,
    #[serde(default)]
    pub filters: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query: String,
    pub total_results: usize,
    pub results: Vec<SearchResult>,
    /// Seconds.
    pub search_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeStats {
    pub user_id: i64,
    pub total_documents: usize,
    pub total_chunks: usize,
    pub global_chunks: usize,
    pub last_updated: Option<String>,
    pub storage_used_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteKnowledgeRequest {
    pub user_id: i64,
    /// `None` removes everything the user has stored.
    #[serde(default)]
    pub document_ids: Option<Vec<i64>>,
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteKnowledgeResponse {
    pub message: String,
    pub success: bool,
    pub deleted: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateFillRequest {
    pub user_id: i64,
    pub template_id: i64,
    pub question: String,
    #[serde(default)]
    pub context: Payload,
    #[serde(default = "default_true")]
    pub use_rag: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFillItem {
    pub success: bool,
    pub template_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<FilledTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFillResponse {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<BatchFillItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateAnalysisRequest {
    pub template_content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonVariables {
    pub total: usize,
    pub variables: Vec<CommonVariable>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskRequest {
    pub user_id: i64,
    pub question: String,
    #[serde(default)]
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub user_id: i64,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarRequest {
    pub user_id: i64,
    pub text: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Minimum similarity score, `0..=1`.
    #[serde(default = "default_similarity_threshold")]
    pub threshold: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarResponse {
    pub total_results: usize,
    pub results: Vec<SearchResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub service: String,
    pub status: String,
    pub components: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}
