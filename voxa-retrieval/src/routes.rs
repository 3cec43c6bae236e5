//! HTTP surface for the retrieval service.
//!
//! Exposes the context search endpoint consumed by external collaborators
//! (the presentation layer and any non-Rust orchestrator deployments), plus
//! a document ingestion endpoint for loading knowledge.

use crate::service::{gate_context, ContextService};
use crate::traits::KnowledgeChunk;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;

/// Shared state for the retrieval HTTP server.
pub struct RetrievalState {
    pub service: ContextService,
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub match_count: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    /// Gated context block, or null when retrieval is not confident enough.
    pub context: Option<String>,
    /// Number of chunks the search returned (before gating).
    pub chunks_found: usize,
    /// Similarity of the best chunk, when any were found.
    pub top_score: Option<f32>,
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub document_id: String,
    #[serde(default)]
    pub source_file: Option<String>,
    pub chunks: Vec<KnowledgeChunk>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub written: usize,
}

// ============================================================================
// Router
// ============================================================================

/// Build the retrieval router.
pub fn retrieval_router(state: Arc<RetrievalState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/context/search", post(search))
        .route("/api/v1/context/documents", post(ingest))
        .layer(TimeoutLayer::new(Duration::from_secs(10)))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Search the knowledge store for a spoken utterance.
///
/// Retrieval failure degrades to "no context" rather than an error status:
/// the caller is in the middle of a live conversation and proceeds either way.
async fn search(
    State(state): State<Arc<RetrievalState>>,
    Json(request): Json<SearchRequest>,
) -> impl IntoResponse {
    let match_count = request
        .match_count
        .unwrap_or_else(|| state.service.match_count());

    let result = match request.session_id.as_deref() {
        Some(session_id) => {
            state
                .service
                .retrieve_for_session(session_id, &request.query, request.category.as_deref())
                .await
        }
        None => {
            state
                .service
                .retrieve(&request.query, match_count, request.category.as_deref())
                .await
        }
    };

    let chunks = match result {
        Ok(chunks) => chunks,
        Err(e) => {
            tracing::warn!(error = %e, "Context search failed, returning no context");
            Vec::new()
        }
    };

    let top_score = chunks.first().map(|c| c.score);
    let context = gate_context(&chunks, state.service.relevance_threshold());

    Json(SearchResponse {
        context,
        chunks_found: chunks.len(),
        top_score,
    })
}

async fn ingest(
    State(state): State<Arc<RetrievalState>>,
    Json(request): Json<IngestRequest>,
) -> impl IntoResponse {
    match state
        .service
        .ingest(
            &request.document_id,
            request.source_file.as_deref(),
            request.chunks,
        )
        .await
    {
        Ok(written) => (StatusCode::OK, Json(IngestResponse { written })).into_response(),
        Err(e) => {
            tracing::error!(document_id = %request.document_id, error = %e, "Ingestion failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
