use anyhow::Result;
use async_trait::async_trait;
use futures::future::try_join_all;
use ollama_rs::{generation::options::GenerationOptions, Ollama};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use url::Url;

use crate::external::error::{service_url, ExternalError};
use crate::external::ModelInfo;

/// Characters per token used to turn token limits into character limits.
pub const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub model: String,
    pub host: String,
    pub port: u16,
    pub max_seq_length: usize,
    pub batch_size: usize,
    pub timeout_secs: u64,
}

impl EmbeddingConfig {
    /// Get the full URL for the Ollama service
    pub fn get_url(&self) -> Result<String> {
        Ok(service_url(&self.host, self.port)?)
    }

    /// Longest input, in characters, passed to the model untruncated.
    pub fn max_input_chars(&self) -> usize {
        self.max_seq_length * CHARS_PER_TOKEN
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "nomic-embed-text".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            max_seq_length: 512,
            batch_size: 32,
            timeout_secs: 60,
        }
    }
}

/// Text to vector mapping used by the vector store.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Vector width, once known.
    fn dimension(&self) -> Option<usize>;

    fn info(&self) -> ModelInfo;
}

/// Cosine similarity clamped to `[0, 1]`; zero-norm inputs score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
}

/// Scales a vector to unit length; zero vectors are returned unchanged.
pub fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|x| *x /= norm);
    }
    vector
}

/// Embedding engine backed by a local Ollama model.
pub struct OllamaEmbedder {
    client: Ollama,
    config: EmbeddingConfig,
    dimension: OnceLock<usize>,
}

impl OllamaEmbedder {
    /// Create a new embedding engine with the given configuration
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        let url = config.get_url()?;
        let url = Url::parse(&url)
            .map_err(|e| ExternalError::ConfigError(format!("Invalid URL: {}", e)))?;

        let client = Ollama::new(
            format!(
                "{}://{}",
                url.scheme(),
                url.host_str().unwrap_or("localhost")
            ),
            config.port,
        );

        Ok(Self {
            client,
            config,
            dimension: OnceLock::new(),
        })
    }

    /// Embeds a sample once and records the model's output dimension.
    pub async fn load(&self) -> Result<usize> {
        if let Some(dimension) = self.dimension.get() {
            return Ok(*dimension);
        }

        let sample = self.request_embedding("dimension check").await?;
        let dimension = *self.dimension.get_or_init(|| sample.len());
        tracing::info!(
            model = %self.config.model,
            dimension,
            "Embedding model loaded"
        );
        Ok(dimension)
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.dimension.get().is_none() {
            return Err(ExternalError::ModelNotInitialized(format!(
                "embedding model '{}' has not been loaded",
                self.config.model
            ))
            .into());
        }
        Ok(())
    }

    fn prepare_input<'a>(&self, text: &'a str) -> Result<&'a str> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ExternalError::OllamaError("cannot embed empty text".to_string()).into());
        }

        let limit = self.config.max_input_chars();
        match text.char_indices().nth(limit) {
            Some((cut, _)) => {
                tracing::warn!(
                    chars = text.chars().count(),
                    limit,
                    "Embedding input truncated"
                );
                Ok(&text[..cut])
            }
            None => Ok(text),
        }
    }

    async fn request_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let secs = self.config.timeout_secs;
        let request = self.client.generate_embeddings(
            self.config.model.clone(),
            text.to_string(),
            Some(GenerationOptions::default()),
        );

        let response = tokio::time::timeout(Duration::from_secs(secs), request)
            .await
            .map_err(|_| ExternalError::Timeout {
                operation: "embedding request".to_string(),
                secs,
            })?
            .map_err(|e| ExternalError::OllamaError(e.to_string()))?;

        Ok(normalize(
            response.embeddings.into_iter().map(|x| x as f32).collect(),
        ))
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.ensure_loaded()?;
        let input = self.prepare_input(text)?;
        self.request_embedding(input).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.ensure_loaded()?;
        let mut vectors = Vec::with_capacity(texts.len());

        for batch in texts.chunks(self.config.batch_size.max(1)) {
            let requests = batch.iter().map(|text| self.embed(text));
            vectors.extend(try_join_all(requests).await?);
        }

        Ok(vectors)
    }

    fn dimension(&self) -> Option<usize> {
        self.dimension.get().copied()
    }

    fn info(&self) -> ModelInfo {
        ModelInfo {
            model: self.config.model.clone(),
            initialized: self.dimension.get().is_some(),
            parameters: serde_json::json!({
                "dimension": self.dimension.get(),
                "max_seq_length": self.config.max_seq_length,
                "batch_size": self.config.batch_size,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_generation() {
        let config = EmbeddingConfig {
            host: "localhost".to_string(),
            ..Default::default()
        };
        assert_eq!(config.get_url().unwrap(), "http://localhost:11434");

        let config = EmbeddingConfig {
            host: "https://example.com".to_string(),
            ..Default::default()
        };
        assert_eq!(config.get_url().unwrap(), "https://example.com:11434");
    }

    #[test]
    fn test_cosine_similarity_bounds() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        // Opposite vectors clamp to zero rather than going negative.
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_normalize() {
        let v = normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_embed_before_load_fails() {
        let embedder = OllamaEmbedder::new(EmbeddingConfig::default()).unwrap();
        let err = embedder.embed("xin chào").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExternalError>(),
            Some(ExternalError::ModelNotInitialized(_))
        ));
        assert!(!embedder.info().initialized);
    }

    #[test]
    fn test_prepare_input_truncates_long_text() {
        let config = EmbeddingConfig {
            max_seq_length: 2,
            ..Default::default()
        };
        let embedder = OllamaEmbedder::new(config).unwrap();

        let input = embedder.prepare_input("ạbcdefghijk").unwrap();
        assert_eq!(input.chars().count(), 8);
        assert!(embedder.prepare_input("   ").is_err());
    }
}
