use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use crate::api::{clean_query, search_failure};
use crate::models::{HealthResponse, RankedParagraph, SearchRequest, SearchResponse};
use crate::search::Ranker;
use crate::state::AppState;

/// Upper bound on `top_k` accepted from clients.
const MAX_TOP_K: usize = 50;

/// POST /api/search - Rank the book's paragraphs against a query.
pub async fn search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, (StatusCode, String)> {
    let query = clean_query(&req.query)?;
    let ranker = req.ranker.unwrap_or(state.config.ranker);
    let top_k = req.top_k.unwrap_or(state.config.top_k).clamp(1, MAX_TOP_K);

    let results = run_search(&state, &query, ranker, top_k).await?;

    Ok(Json(SearchResponse {
        query,
        ranker,
        results,
    }))
}

/// Shared by the search and ask endpoints.
pub async fn run_search(
    state: &AppState,
    query: &str,
    ranker: Ranker,
    top_k: usize,
) -> Result<Vec<RankedParagraph>, (StatusCode, String)> {
    let results = state
        .rank(query, ranker, top_k)
        .await
        .map_err(search_failure)?;

    tracing::info!(
        "{ranker} search returned {} paragraphs (top score {:.4})",
        results.len(),
        results.first().map(|r| r.score).unwrap_or(0.0)
    );
    Ok(results)
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ready",
        paragraphs: state.corpus.len(),
        embedded_paragraphs: state.vectors.len(),
        embedding_dim: state.vectors.dimension(),
        default_ranker: state.config.ranker,
    })
}
