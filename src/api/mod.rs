pub mod ask;
pub mod search;

use axum::http::StatusCode;

use crate::error::SearchError;
use crate::llm::prompts::sanitize_for_prompt;

pub(crate) const MAX_QUERY_LEN: usize = 2000;

/// Trim, cap and sanitize a user query. Empty queries are rejected.
pub(crate) fn clean_query(raw: &str) -> Result<String, (StatusCode, String)> {
    let query = raw.trim();
    if query.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Query is required".to_string()));
    }
    Ok(sanitize_for_prompt(&truncate_to_char_boundary(query, MAX_QUERY_LEN)))
}

/// Map a ranking failure onto an HTTP status.
pub(crate) fn search_failure(e: anyhow::Error) -> (StatusCode, String) {
    match e.downcast_ref::<SearchError>() {
        Some(err @ SearchError::Encoder { .. }) => {
            tracing::warn!("Query encoding failed: {err}");
            (StatusCode::BAD_GATEWAY, format!("{}: {err}", err.error_code()))
        }
        Some(err) => {
            tracing::error!("Ranking failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("{}: {err}", err.error_code()),
            )
        }
        None => {
            tracing::error!("Ranking failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Search failed: {e}"),
            )
        }
    }
}

pub(crate) fn truncate_to_char_boundary(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    s.char_indices()
        .take_while(|(i, _)| *i < max_len)
        .map(|(_, c)| c)
        .collect()
}
