//! # book-rag
//!
//! Question answering over a single book. Paragraphs are retrieved with
//! either a stemmed TF-IDF ranker or cosine similarity over cached
//! embeddings, then handed to an LLM that answers from them.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────┐
//!                 │  User Query  │
//!                 └──────┬───────┘
//!                        │
//!                        ▼
//!              ┌───────────────────┐
//!              │  Query Rewrite    │  (optional, LLM)
//!              │  or INVALID_QUERY │
//!              └─────────┬─────────┘
//!                        │
//!           ┌────────────┴────────────┐
//!           ▼                         ▼
//!   ┌───────────────┐        ┌─────────────────┐
//!   │ Lexical       │        │ Vector          │
//!   │ stem + TF-IDF │        │ cosine vs cache │
//!   └───────┬───────┘        └────────┬────────┘
//!           └────────────┬────────────┘
//!                        │ top_k paragraphs
//!                        ▼
//!              ┌───────────────────┐
//!              │  Answer Prompt    │
//!              └─────────┬─────────┘
//!                        │
//!                        ▼
//!              ┌───────────────────┐
//!              │  LLM (streamed)   │──► SSE: chunk ... done
//!              └───────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`config`] - Environment-based configuration for server, book, cache and providers
//! - [`corpus`] - The book split into id-addressed paragraphs
//! - [`error`] - Typed failures for ranking and the embedding cache
//! - [`models`] - Request/response types and `RankedParagraph`
//! - [`search::normalize`] - Lowercase, strip punctuation, drop stop words, stem
//! - [`search::lexical`] - TF-IDF ranking over normalized paragraphs
//! - [`search::vector`] - Cosine similarity ranking over paragraph embeddings
//! - [`search::cache`] - Checksummed on-disk embedding cache, built on first start
//! - [`llm::embeddings`] - Batch embedding via Ollama, OpenAI or Gemini, plus an offline hash encoder
//! - [`llm::generate`] / [`llm::chat_stream`] - One-shot and streamed generation
//! - [`llm::prompts`] - Answer and query-rewrite prompts
//! - [`api`] - Axum handlers for search, ask and health
//! - [`state`] - Shared application state built once at startup

pub mod api;
pub mod config;
pub mod corpus;
pub mod error;
pub mod llm;
pub mod models;
pub mod search;
pub mod state;
