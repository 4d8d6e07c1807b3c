use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ollama_rs::{
    generation::{
        chat::{request::ChatMessageRequest, ChatMessage as OllamaMessage, MessageRole},
        completion::request::GenerationRequest,
        options::GenerationOptions,
    },
    Ollama,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use url::Url;

use crate::external::error::{service_url, ExternalError};
use crate::external::ModelInfo;

#[cfg(test)]
use mockall::automock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    pub model: String,
    pub host: String,
    pub port: u16,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repeat_penalty: f32,
    pub max_tokens: u32,
    pub context_size: u32,
    /// Temperature used when filling templates.
    pub fill_temperature: f32,
    pub timeout_secs: u64,
    pub max_concurrent_requests: usize,
}

impl LLMConfig {
    /// Get the full URL for the Ollama service
    pub fn get_url(&self) -> Result<String> {
        Ok(service_url(&self.host, self.port)?)
    }

    /// Generation parameters this config applies when a call overrides nothing.
    pub fn default_params(&self) -> GenerationParams {
        GenerationParams {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            top_p: Some(self.top_p),
            top_k: Some(self.top_k),
            repeat_penalty: Some(self.repeat_penalty),
        }
    }
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            model: "vistral".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
            repeat_penalty: 1.1,
            max_tokens: 2048,
            context_size: 4096,
            fill_temperature: 0.3,
            timeout_secs: 120,
            max_concurrent_requests: 1,
        }
    }
}

/// Per-call overrides; unset fields fall back to the configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub repeat_penalty: Option<f32>,
}

impl GenerationParams {
    pub fn with_temperature(temperature: f32) -> Self {
        Self {
            temperature: Some(temperature),
            ..Default::default()
        }
    }

    /// Fills unset fields from `defaults`.
    pub fn or(self, defaults: &GenerationParams) -> GenerationParams {
        GenerationParams {
            temperature: self.temperature.or(defaults.temperature),
            max_tokens: self.max_tokens.or(defaults.max_tokens),
            top_p: self.top_p.or(defaults.top_p),
            top_k: self.top_k.or(defaults.top_k),
            repeat_penalty: self.repeat_penalty.or(defaults.repeat_penalty),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

impl From<&ChatMessage> for OllamaMessage {
    fn from(message: &ChatMessage) -> Self {
        let role = match message.role {
            ChatRole::System => MessageRole::System,
            ChatRole::User => MessageRole::User,
            ChatRole::Assistant => MessageRole::Assistant,
        };
        OllamaMessage::new(role, message.content.clone())
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Single-turn completion of a raw prompt.
    async fn complete(&self, prompt: &str, params: Option<GenerationParams>) -> Result<String>;

    /// Multi-turn chat completion.
    async fn chat(&self, messages: &[ChatMessage], params: Option<GenerationParams>)
        -> Result<String>;

    fn info(&self) -> ModelInfo;
}

/// Sectioned prompt with instruction, context, question and answer slots.
pub fn build_prompt(instruction: &str, context: &str, question: &str) -> String {
    let mut prompt = format!("### Hướng dẫn:\n{}\n\n", instruction.trim());
    if !context.trim().is_empty() {
        prompt.push_str(&format!("### Ngữ cảnh:\n{}\n\n", context.trim()));
    }
    prompt.push_str(&format!("### Câu hỏi:\n{}\n\n### Trả lời:\n", question.trim()));
    prompt
}

/// Local LLM served by Ollama. Calls are queued behind a semaphore.
pub struct OllamaLlm {
    client: Ollama,
    endpoint: String,
    config: LLMConfig,
    loaded: AtomicBool,
    permits: Semaphore,
}

impl OllamaLlm {
    /// Create a new LLM engine with the given configuration
    pub fn new(config: LLMConfig) -> Result<Self> {
        let endpoint = config.get_url()?;
        let url = Url::parse(&endpoint)
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
            endpoint,
            permits: Semaphore::new(config.max_concurrent_requests.max(1)),
            config,
            loaded: AtomicBool::new(false),
        })
    }

    /// Verifies the configured model is installed locally.
    pub async fn load(&self) -> Result<()> {
        let models = self
            .client
            .list_local_models()
            .await
            .map_err(|e| ExternalError::ConnectionError(e.to_string()))?;

        let wanted = &self.config.model;
        let found = models.iter().any(|m| {
            m.name == *wanted || m.name.split(':').next() == Some(wanted.as_str())
        });
        if !found {
            return Err(ExternalError::ModelFileNotFound(format!(
                "model '{}' is not available on {}",
                wanted, self.endpoint
            ))
            .into());
        }

        self.loaded.store(true, Ordering::SeqCst);
        tracing::info!(model = %wanted, "LLM loaded");
        Ok(())
    }

    fn ensure_loaded(&self) -> Result<()> {
        if !self.loaded.load(Ordering::SeqCst) {
            return Err(ExternalError::ModelNotInitialized(format!(
                "LLM '{}' has not been loaded",
                self.config.model
            ))
            .into());
        }
        Ok(())
    }

    fn options(&self, params: Option<GenerationParams>) -> GenerationOptions {
        let params = params
            .unwrap_or_default()
            .or(&self.config.default_params());

        let mut options = GenerationOptions::default().num_ctx(self.config.context_size);
        if let Some(t) = params.temperature {
            options = options.temperature(t);
        }
        if let Some(n) = params.max_tokens {
            options = options.num_predict(n as i32);
        }
        if let Some(p) = params.top_p {
            options = options.top_p(p);
        }
        if let Some(k) = params.top_k {
            options = options.top_k(k);
        }
        if let Some(r) = params.repeat_penalty {
            options = options.repeat_penalty(r);
        }
        options
    }

    async fn queued<F, T>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| anyhow!("LLM queue closed: {}", e))?;

        let secs = self.config.timeout_secs;
        tokio::time::timeout(Duration::from_secs(secs), fut)
            .await
            .map_err(|_| ExternalError::Timeout {
                operation: operation.to_string(),
                secs,
            })?
    }
}

#[async_trait]
impl LanguageModel for OllamaLlm {
    async fn complete(&self, prompt: &str, params: Option<GenerationParams>) -> Result<String> {
        self.ensure_loaded()?;

        let mut request = GenerationRequest::new(self.config.model.clone(), prompt.to_string());
        request.options = Some(self.options(params));

        self.queued("completion", async {
            let response = self
                .client
                .generate(request)
                .await
                .map_err(|e| ExternalError::OllamaError(e.to_string()))?;
            Ok(response.response.trim().to_string())
        })
        .await
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        params: Option<GenerationParams>,
    ) -> Result<String> {
        self.ensure_loaded()?;

        let request = ChatMessageRequest::new(
            self.config.model.clone(),
            messages.iter().map(OllamaMessage::from).collect(),
        )
        .options(self.options(params));

        self.queued("chat", async {
            let response = self
                .client
                .send_chat_messages(request)
                .await
                .map_err(|e| ExternalError::OllamaError(e.to_string()))?;
            let reply = response
                .message
                .ok_or_else(|| ExternalError::OllamaError("chat reply had no message".to_string()))?;
            Ok(reply.content.trim().to_string())
        })
        .await
    }

    fn info(&self) -> ModelInfo {
        ModelInfo {
            model: self.config.model.clone(),
            initialized: self.loaded.load(Ordering::SeqCst),
            parameters: serde_json::json!({
                "context_size": self.config.context_size,
                "max_tokens": self.config.max_tokens,
                "temperature": self.config.temperature,
                "top_p": self.config.top_p,
                "top_k": self.config.top_k,
                "repeat_penalty": self.config.repeat_penalty,
            }),
        }
    }
}
