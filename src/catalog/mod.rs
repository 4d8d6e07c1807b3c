//! Read access to the platform backend's users, documents and templates,
//! plus document status updates.

pub mod memory;
pub mod mysql;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use memory::MemoryCatalog;
pub use mysql::MySqlCatalog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Uploaded,
    Processing,
    Ready,
    Error,
}

impl DocumentStatus {
    pub const ALL: [DocumentStatus; 4] = [
        DocumentStatus::Uploaded,
        DocumentStatus::Processing,
        DocumentStatus::Ready,
        DocumentStatus::Error,
    ];

    /// Whether a document may move from `self` to `next`. Re-extraction of a
    /// finished document and duplicate submissions are allowed.
    pub fn can_transition_to(self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (Uploaded, Processing)
                | (Processing, Processing)
                | (Processing, Ready)
                | (Processing, Error)
                | (Ready, Processing)
                | (Error, Processing)
        )
    }

    /// Statuses from which a document may move to `next`.
    pub fn allowed_sources(next: DocumentStatus) -> Vec<DocumentStatus> {
        Self::ALL
            .into_iter()
            .filter(|status| status.can_transition_to(next))
            .collect()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploaded => "uploaded",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Ready => "ready",
            DocumentStatus::Error => "error",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uploaded" => Ok(DocumentStatus::Uploaded),
            "processing" => Ok(DocumentStatus::Processing),
            "ready" => Ok(DocumentStatus::Ready),
            "error" => Ok(DocumentStatus::Error),
            other => Err(anyhow::anyhow!("unknown document status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: i64,
    pub filename: String,
    pub original_name: String,
    pub file_path: String,
    pub file_type: String,
    pub status: DocumentStatus,
    pub owner_id: i64,
    #[serde(default)]
    pub owner_name: Option<String>,
    #[serde(default)]
    pub owner_email: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub id: i64,
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub category: Option<String>,
    /// Declared variable names.
    #[serde(default)]
    pub variables: Vec<String>,
    pub owner_id: i64,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl TemplateRecord {
    /// Placeholders used in the content but missing from `variables`.
    pub fn undeclared_variables(&self) -> Vec<String> {
        crate::template::extract_variables(&self.content)
            .into_iter()
            .filter(|v| !self.variables.contains(v))
            .collect()
    }
}

/// Outcome of a guarded status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Applied { from: DocumentStatus },
    /// The stored status does not allow the move; nothing was written.
    Rejected { current: DocumentStatus },
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn user_exists(&self, user_id: i64) -> Result<bool>;

    async fn document(&self, document_id: i64) -> Result<Option<DocumentRecord>>;

    async fn user_documents(&self, user_id: i64, limit: usize) -> Result<Vec<DocumentRecord>>;

    async fn template(&self, template_id: i64) -> Result<Option<TemplateRecord>>;

    /// Moves a document to `next` when its stored status allows it. The
    /// check and the write are a single atomic step.
    async fn transition_document_status(
        &self,
        document_id: i64,
        next: DocumentStatus,
    ) -> Result<StatusChange>;

    /// Cheap liveness check used by health reporting.
    async fn ping(&self) -> Result<()>;
}
