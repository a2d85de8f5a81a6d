use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::stream::{self, Stream, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;

use crate::api::clean_query;
use crate::api::search::run_search;
use crate::llm::chat_stream::{spawn_producer, stream_generate};
use crate::llm::generate::generate;
use crate::llm::prompts::{build_answer_prompt, build_query_prompt, parse_rewritten_query, Rewrite};
use crate::models::{AskRequest, RankedParagraph};
use crate::state::AppState;

const IDLE_TIMEOUT_SECS: u64 = 30;
const CHANNEL_CAPACITY: usize = 32;

const INVALID_QUERY_MESSAGE: &str =
    "That doesn't look like a question about the book. Try asking about its ideas on purpose, money or work.";

/// POST /api/ask-agent - Rank, build the prompt, return the model's answer.
pub async fn ask_agent(
    State(state): State<AppState>,
    Json(req): Json<AskRequest>,
) -> Result<Json<String>, (StatusCode, String)> {
    let query = clean_query(&req.query)?;
    let results = run_search(&state, &query, state.config.ranker, state.config.top_k).await?;
    let prompt = build_answer_prompt(&query, &results);

    let answer = generate(&state.http_client, &state.config.llm, &prompt)
        .await
        .map_err(|e| {
            tracing::error!("Generation failed: {e:#}");
            (StatusCode::BAD_GATEWAY, format!("LLM error: {e}"))
        })?;

    Ok(Json(answer))
}

/// One event of a streamed answer.
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerEvent {
    RewrittenQuery(String),
    SearchResults(Vec<RankedParagraph>),
    Chunk(String),
    Error(String),
    Done { success: bool },
}

impl AnswerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RewrittenQuery(_) => "rewritten_query",
            Self::SearchResults(_) => "search_results",
            Self::Chunk(_) => "chunk",
            Self::Error(_) => "error",
            Self::Done { .. } => "done",
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::RewrittenQuery(query) => json!({ "query": query }),
            Self::SearchResults(results) => json!({ "results": results }),
            Self::Chunk(content) => json!({ "content": content }),
            Self::Error(message) => json!({ "message": message }),
            Self::Done { success } => json!({ "success": success }),
        }
    }

    fn into_sse(self) -> Event {
        Event::default().event(self.name()).data(self.payload().to_string())
    }
}

/// POST /api/ask-agent/stream - RAG answer streamed as SSE.
///
/// Events, in order: `rewritten_query` (when rewriting is on),
/// `search_results`, any number of `chunk`, then `done`. Failures emit
/// `error` followed by `done` with `success: false`.
pub async fn ask_agent_stream(
    State(state): State<AppState>,
    Json(req): Json<AskRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    // ── Step 1: Validate input ────────────────────────────
    let query = clean_query(&req.query)?;

    // ── Step 2: Acquire semaphore ─────────────────────────
    let permit = state
        .stream_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Answer service at capacity".to_string(),
            )
        })?;

    // ── Step 3: Rewrite query, search, start the model ────
    let mut prelude = Vec::new();
    let producer = match prepare_answer(&state, &query, &mut prelude).await {
        Ok(rx) => Some(rx),
        Err(message) => {
            prelude.push(AnswerEvent::Error(message));
            None
        }
    };

    // ── Step 4: Forward fragments with idle timeout ───────
    // Dropping this stream (client gone) drops the receiver, which cancels
    // the producer task. The permit lives as long as the stream.
    let event_stream = answer_events(prelude, producer, Duration::from_secs(IDLE_TIMEOUT_SECS))
        .map(move |event| {
            let _permit = &permit;
            Ok::<_, Infallible>(event.into_sse())
        });

    Ok(Sse::new(event_stream).keep_alive(KeepAlive::default()))
}

/// The full event sequence of one answer: `prelude`, then a `chunk` per
/// fragment from `producer`, then `done`. An `error` anywhere (in the
/// prelude, from the producer, or an idle gap longer than `idle_timeout`)
/// ends the chunks and makes `done` report `success: false`.
pub fn answer_events(
    prelude: Vec<AnswerEvent>,
    producer: Option<mpsc::Receiver<anyhow::Result<String>>>,
    idle_timeout: Duration,
) -> impl Stream<Item = AnswerEvent> + Send {
    let success = Arc::new(AtomicBool::new(
        !prelude.iter().any(|e| matches!(e, AnswerEvent::Error(_))),
    ));
    let producer = producer.filter(|_| success.load(Ordering::SeqCst));

    let chunk_success = success.clone();
    let chunks = stream::unfold(producer, move |rx| {
        let success = chunk_success.clone();
        async move {
            let mut rx = rx?;
            match tokio::time::timeout(idle_timeout, rx.recv()).await {
                Ok(Some(Ok(content))) => Some((AnswerEvent::Chunk(content), Some(rx))),
                Ok(Some(Err(e))) => {
                    tracing::warn!("Generation stream failed: {e:#}");
                    success.store(false, Ordering::SeqCst);
                    Some((AnswerEvent::Error(e.to_string()), None))
                }
                Ok(None) => None,
                Err(_) => {
                    tracing::warn!("Generation stream idle for {idle_timeout:?}, giving up");
                    success.store(false, Ordering::SeqCst);
                    Some((
                        AnswerEvent::Error("LLM response timed out (idle)".to_string()),
                        None,
                    ))
                }
            }
        }
    });

    let done = stream::once(async move {
        AnswerEvent::Done {
            success: success.load(Ordering::SeqCst),
        }
    });

    stream::iter(prelude).chain(chunks).chain(done)
}

/// Everything that happens before the first model fragment. Pushes the
/// `rewritten_query` and `search_results` events into `prelude`.
async fn prepare_answer(
    state: &AppState,
    query: &str,
    prelude: &mut Vec<AnswerEvent>,
) -> Result<mpsc::Receiver<anyhow::Result<String>>, String> {
    let search_query = if state.config.rewrite_queries {
        search_query_for(rewrite_query(state, query).await, prelude)?
    } else {
        query.to_string()
    };

    let results = run_search(state, &search_query, state.config.ranker, state.config.top_k)
        .await
        .map_err(|(_, message)| message)?;
    let prompt = build_answer_prompt(query, &results);
    prelude.push(AnswerEvent::SearchResults(results));

    let llm_stream = stream_generate(&state.http_client, &state.config.llm, &prompt)
        .await
        .map_err(|e| {
            tracing::error!("Failed to start generation: {e:#}");
            format!("LLM error: {e}")
        })?;

    Ok(spawn_producer(llm_stream, CHANNEL_CAPACITY))
}

/// Query to search with after a rewrite. An invalid query is an error.
fn search_query_for(rewrite: Rewrite, prelude: &mut Vec<AnswerEvent>) -> Result<String, String> {
    match rewrite {
        Rewrite::Query(rewritten) => {
            prelude.push(AnswerEvent::RewrittenQuery(rewritten.clone()));
            Ok(rewritten)
        }
        Rewrite::Invalid => Err(INVALID_QUERY_MESSAGE.to_string()),
    }
}

/// Ask the model to sharpen the query. Falls back to the original on any
/// model failure.
async fn rewrite_query(state: &AppState, query: &str) -> Rewrite {
    match generate(&state.http_client, &state.config.llm, &build_query_prompt(query)).await {
        Ok(reply) => {
            let rewrite = parse_rewritten_query(&reply, query);
            tracing::info!("Query rewrite: {query:?} -> {rewrite:?}");
            rewrite
        }
        Err(e) => {
            tracing::warn!("Query rewrite failed, searching with the original: {e:#}");
            Rewrite::Query(query.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_results() -> Vec<RankedParagraph> {
        vec![RankedParagraph {
            id: 4,
            paragraph: "Money is a tool.".into(),
            score: 0.75,
        }]
    }

    async fn collect(
        prelude: Vec<AnswerEvent>,
        producer: Option<mpsc::Receiver<anyhow::Result<String>>>,
    ) -> Vec<AnswerEvent> {
        answer_events(prelude, producer, Duration::from_secs(IDLE_TIMEOUT_SECS))
            .collect()
            .await
    }

    #[test]
    fn test_search_results_payload_shape() {
        let payload = AnswerEvent::SearchResults(sample_results()).payload();
        assert_eq!(payload["results"][0]["id"], 4);
        assert_eq!(payload["results"][0]["paragraph"], "Money is a tool.");
        assert_eq!(payload["results"][0]["score"], 0.75);
    }

    #[test]
    fn test_event_names() {
        assert_eq!(AnswerEvent::RewrittenQuery("q".into()).name(), "rewritten_query");
        assert_eq!(AnswerEvent::Chunk("c".into()).name(), "chunk");
        assert_eq!(AnswerEvent::Error("e".into()).name(), "error");
        let done = AnswerEvent::Done { success: false };
        assert_eq!(done.name(), "done");
        assert_eq!(done.payload(), json!({ "success": false }));
    }

    #[test]
    fn test_invalid_query_message_is_user_facing() {
        assert!(!INVALID_QUERY_MESSAGE.contains("INVALID_QUERY"));
    }

    #[tokio::test]
    async fn test_successful_answer_event_order() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(Ok("Money ".to_string())).await.unwrap();
        tx.send(Ok("is a tool.".to_string())).await.unwrap();
        drop(tx);

        let prelude = vec![
            AnswerEvent::RewrittenQuery("money as a tool".into()),
            AnswerEvent::SearchResults(sample_results()),
        ];
        let events = collect(prelude, Some(rx)).await;

        assert_eq!(
            events,
            vec![
                AnswerEvent::RewrittenQuery("money as a tool".into()),
                AnswerEvent::SearchResults(sample_results()),
                AnswerEvent::Chunk("Money ".into()),
                AnswerEvent::Chunk("is a tool.".into()),
                AnswerEvent::Done { success: true },
            ]
        );
    }

    #[tokio::test]
    async fn test_upstream_error_ends_stream_unsuccessfully() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(Ok("partial".to_string())).await.unwrap();
        tx.send(Err(anyhow::anyhow!("connection reset"))).await.unwrap();
        tx.send(Ok("never forwarded".to_string())).await.unwrap();
        drop(tx);

        let events = collect(vec![AnswerEvent::SearchResults(vec![])], Some(rx)).await;

        assert_eq!(
            events,
            vec![
                AnswerEvent::SearchResults(vec![]),
                AnswerEvent::Chunk("partial".into()),
                AnswerEvent::Error("connection reset".into()),
                AnswerEvent::Done { success: false },
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_query_yields_error_then_done() {
        let mut prelude = Vec::new();
        let message = search_query_for(Rewrite::Invalid, &mut prelude).unwrap_err();
        assert!(prelude.is_empty());
        prelude.push(AnswerEvent::Error(message));

        let events = collect(prelude, None).await;

        assert_eq!(
            events,
            vec![
                AnswerEvent::Error(INVALID_QUERY_MESSAGE.to_string()),
                AnswerEvent::Done { success: false },
            ]
        );
    }

    #[test]
    fn test_rewritten_query_is_announced() {
        let mut prelude = Vec::new();
        let query =
            search_query_for(Rewrite::Query("purpose of work".into()), &mut prelude).unwrap();
        assert_eq!(query, "purpose of work");
        assert_eq!(prelude, vec![AnswerEvent::RewrittenQuery("purpose of work".into())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_producer_times_out() {
        let (tx, rx) = mpsc::channel::<anyhow::Result<String>>(8);
        tx.send(Ok("The book".to_string())).await.unwrap();

        let events = collect(vec![AnswerEvent::SearchResults(vec![])], Some(rx)).await;
        drop(tx);

        assert_eq!(
            events,
            vec![
                AnswerEvent::SearchResults(vec![]),
                AnswerEvent::Chunk("The book".into()),
                AnswerEvent::Error("LLM response timed out (idle)".into()),
                AnswerEvent::Done { success: false },
            ]
        );
    }
}
