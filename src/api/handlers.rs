use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use tracing::{error, info, warn};

use crate::api::models::{
    error_codes, AdmissionStatsResponse, ApiError, ChatRequest, ChatResponse, HealthResponse,
    SearchRequest, SearchResponse,
};
use crate::error::ContextError;
use crate::metrics::METRICS;
use crate::pipeline::ChatPipeline;
use crate::time_operation;

const MAX_TOP_K: usize = 50;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub pipeline: ChatPipeline,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

fn validation_error(message: &str) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError::new(error_codes::VALIDATION_ERROR, message)),
    )
}

/// Map a pipeline failure to a status and user-facing error
pub fn error_response(err: &ContextError) -> (StatusCode, Json<ApiError>) {
    if err.is_unavailable() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(
                error_codes::UPSTREAM_UNAVAILABLE,
                "The assistant is temporarily unavailable. Please try again shortly.",
            )),
        );
    }

    match err {
        ContextError::Validation(message) => validation_error(message),
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiError::new(error_codes::INTERNAL_ERROR, other.to_string())),
        ),
    }
}

/// Answer a chat message
///
/// POST /api/v1/chat
pub async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<ChatResponse> {
    info!(session = %request.session_id, "Chat request");

    let result = time_operation!(
        METRICS.chat_request_duration,
        "chat",
        state
            .pipeline
            .handle_message(&request.session_id, &request.message, request.auxiliary.as_deref())
            .await
    );

    match result {
        Ok(reply) => {
            METRICS.record_chat_request("success");
            Ok(Json(ChatResponse {
                request_id: reply.request_id.to_string(),
                reply: reply.text,
                model_used: reply.model_used,
                was_fallback: reply.was_fallback,
                budget: reply.budget,
                selection: reply.selection,
                search_mode: reply.search_mode,
            }))
        }
        Err(e) => {
            let (status, body) = error_response(&e);
            if status.is_server_error() {
                error!(session = %request.session_id, error = %e, "Chat request failed");
            } else {
                warn!(session = %request.session_id, error = %e, "Chat request rejected");
            }
            METRICS.record_chat_request(status.as_str());
            Err((status, body))
        }
    }
}

/// Search the knowledge store directly
///
/// POST /api/v1/knowledge/search
pub async fn search_knowledge(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> ApiResult<SearchResponse> {
    if request.query.trim().is_empty() {
        return Err(validation_error("Query cannot be empty"));
    }

    let store = &state.pipeline.context().store;
    let top_k = request.top_k.unwrap_or(store.config().default_top_k);
    if top_k == 0 || top_k > MAX_TOP_K {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(
                ApiError::new(error_codes::VALIDATION_ERROR, "top_k out of range")
                    .with_details(serde_json::json!({ "min": 1, "max": MAX_TOP_K, "got": top_k })),
            ),
        ));
    }

    match time_operation!(
        METRICS.chat_request_duration,
        "search",
        store.search_with_mode(&request.query, top_k).await
    ) {
        Ok((cards, mode)) => Ok(Json(SearchResponse { cards, mode })),
        Err(e) => {
            error!(error = %e, "Knowledge search failed");
            Err(error_response(&e.into()))
        }
    }
}

/// Admission and fallback counters
///
/// GET /api/v1/admission/stats
pub async fn admission_stats(State(state): State<AppState>) -> Json<AdmissionStatsResponse> {
    let context = state.pipeline.context();
    Json(AdmissionStatsResponse {
        primary: context.generator.primary_name().to_string(),
        secondary: context.generator.secondary_name().to_string(),
        admission: context.executor().statistics(),
        fallback: context.generator.fallback_stats(),
        conversations: context.conversations.session_count(),
    })
}

/// Prometheus metrics
///
/// GET /metrics
pub async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.export_prometheus(),
    )
}

/// Liveness check
///
/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let store = &state.pipeline.context().store;
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        documents: store.len(),
        embeddings_enabled: store.has_embedder(),
        embedding_cache: store.cache_stats(),
    })
}
