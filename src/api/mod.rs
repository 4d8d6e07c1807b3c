//! HTTP surface over [`KnowledgeService`].

pub mod error;
pub mod handlers;

use anyhow::Result;
use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::service::KnowledgeService;

pub use error::ApiError;

fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    cors.allow_origin(allowed)
}

pub fn router(service: Arc<KnowledgeService>, cors_origins: &[String]) -> Router {
    let extraction = Router::new()
        .route("/extract", post(handlers::extract))
        .route("/extract-batch", post(handlers::extract_batch))
        .route("/search", post(handlers::search))
        .route("/ask", post(handlers::ask))
        .route("/chat", post(handlers::chat))
        .route("/similar", post(handlers::similar))
        .route("/stats/:user_id", get(handlers::stats))
        .route("/delete-knowledge", post(handlers::delete_knowledge))
        .route(
            "/extraction-status/:document_id",
            get(handlers::extraction_status),
        );

    let template = Router::new()
        .route("/fill", post(handlers::fill_template))
        .route("/analyze", post(handlers::analyze_template))
        .route("/preview/:template_id", post(handlers::preview_template))
        .route("/common-variables", get(handlers::common_variables))
        .route("/batch-fill", post(handlers::batch_fill));

    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .nest("/api/extraction", extraction)
        .nest("/api/template", template)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(cors_origins))
        .with_state(service)
}

pub async fn serve(service: KnowledgeService, config: &ServerConfig) -> Result<()> {
    let app = router(Arc::new(service), &config.cors_origins);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Starting knowledge API on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
