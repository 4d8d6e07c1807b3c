use thiserror::Error;

use crate::external::ExternalError;

/// Errors surfaced by [`crate::service::KnowledgeService`] operations.
#[derive(Error, Debug)]
pub enum KnowledgeError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("{0}")]
    Validation(String),

    #[error("Extraction failed for document {document_id}: {reason}")]
    Extraction { document_id: i64, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KnowledgeError {
    /// Provider failure wrapped in this error, if any.
    pub fn external(&self) -> Option<&ExternalError> {
        match self {
            KnowledgeError::Other(e) => e.downcast_ref::<ExternalError>(),
            _ => None,
        }
    }
}

impl From<ExternalError> for KnowledgeError {
    fn from(err: ExternalError) -> Self {
        KnowledgeError::Other(err.into())
    }
}

pub type Result<T, E = KnowledgeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_is_recoverable() {
        let err: KnowledgeError =
            ExternalError::ModelNotInitialized("llm".to_string()).into();
        assert!(matches!(
            err.external(),
            Some(ExternalError::ModelNotInitialized(_))
        ));
        assert!(KnowledgeError::Validation("x".to_string()).external().is_none());
    }
}
