//! Router configuration

use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use super::handlers::{self, AppState};

/// Build the API router
pub fn build_router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/api/v1/chat", post(handlers::chat))
        .route("/api/v1/knowledge/search", post(handlers::search_knowledge))
        .route("/api/v1/admission/stats", get(handlers::admission_stats))
        .route("/metrics", get(handlers::metrics))
        .route("/health", get(handlers::health))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
