use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExternalError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Ollama error: {0}")]
    OllamaError(String),

    #[error("Vector DB error: {0}")]
    VectorDBError(String),

    #[error("Model not initialized: {0}")]
    ModelNotInitialized(String),

    #[error("Model file not found: {0}")]
    ModelFileNotFound(String),

    #[error("Timed out after {secs}s: {operation}")]
    Timeout { operation: String, secs: u64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Builds a service URL from a host that may or may not carry a scheme.
pub fn service_url(host: &str, port: u16) -> Result<String, ExternalError> {
    let url = if host.starts_with("http://") || host.starts_with("https://") {
        format!("{}:{}", host.trim_end_matches('/'), port)
    } else {
        format!("http://{}:{}", host, port)
    };

    url::Url::parse(&url).map_err(|e| ExternalError::ConfigError(format!("Invalid URL: {}", e)))?;

    Ok(url)
}
