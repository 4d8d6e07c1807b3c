pub mod embedding;
pub mod error;
pub mod llm;
pub mod vectordb;

use serde::{Deserialize, Serialize};

pub use embedding::{cosine_similarity, Embedder, EmbeddingConfig, OllamaEmbedder};
pub use error::ExternalError;
pub use llm::{build_prompt, ChatMessage, ChatRole, GenerationParams, LLMConfig, LanguageModel, OllamaLlm};
pub use vectordb::{BackendKind, QdrantBackend, VectorDBConfig};

/// Load state and parameters reported by a model provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model: String,
    pub initialized: bool,
    pub parameters: serde_json::Value,
}

impl ModelInfo {
    pub fn status(&self) -> &'static str {
        if self.initialized {
            "initialized"
        } else {
            "not_initialized"
        }
    }
}
