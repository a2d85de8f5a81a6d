use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::search::vector::DEFAULT_TOP_K;
use crate::search::Ranker;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where the book and the embedding cache live
    pub data_dir: PathBuf,
    /// Server bind address
    pub bind_addr: String,
    /// Book file; defaults to `<data_dir>/book.md`
    pub book_path: Option<PathBuf>,
    /// Embedding cache file; defaults to `<data_dir>/embedded_paragraphs.bin`
    pub cache_path: Option<PathBuf>,
    /// Passages handed to the model per question
    pub top_k: usize,
    /// Ranker used when a request does not pick one
    pub ranker: Ranker,
    /// Ask the model to rewrite the query before searching (streaming endpoint)
    pub rewrite_queries: bool,
    /// Maximum concurrent streaming answers
    pub max_concurrent_streams: usize,
    /// Chat / generation model
    pub llm: LlmConfig,
    /// Paragraph and query encoder
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// "gemini", "ollama" or "openai"
    pub provider: String,
    /// Base URL for the LLM API
    pub base_url: String,
    /// Model name for answers and query rewriting
    pub chat_model: String,
    /// API key (required for cloud providers)
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// "ollama", "openai", "gemini", or "hash" (offline feature hashing)
    pub provider: String,
    /// Base URL for the embedding API
    pub base_url: String,
    /// Model name for embeddings; recorded in the cache header
    pub model: String,
    /// API key (only needed for cloud providers)
    pub api_key: Option<String>,
    /// Paragraphs per encode call while building the cache
    pub batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            bind_addr: "127.0.0.1:8000".to_string(),
            book_path: None,
            cache_path: None,
            top_k: DEFAULT_TOP_K,
            ranker: Ranker::Vector,
            rewrite_queries: true,
            max_concurrent_streams: 3,
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            base_url: default_base_url("gemini").to_string(),
            chat_model: "gemini-3-flash-preview".to_string(),
            api_key: None,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            base_url: default_base_url("ollama").to_string(),
            model: "nomic-embed-text".to_string(),
            api_key: None,
            batch_size: 8,
        }
    }
}

/// Base URL used when only the provider is configured.
pub fn default_base_url(provider: &str) -> &'static str {
    match provider {
        "gemini" => "https://generativelanguage.googleapis.com",
        "openai" => "https://api.openai.com",
        _ => "http://localhost:11434",
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup so tests do not touch the process
    /// environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = get("BOOK_RAG_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(addr) = get("BOOK_RAG_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(path) = get("BOOK_RAG_BOOK_PATH") {
            config.book_path = Some(PathBuf::from(path));
        }
        if let Some(path) = get("BOOK_RAG_CACHE_PATH") {
            config.cache_path = Some(PathBuf::from(path));
        }
        if let Some(v) = get("BOOK_RAG_TOP_K").and_then(|v| v.parse().ok()) {
            config.top_k = v;
        }
        if let Some(val) = get("BOOK_RAG_RANKER") {
            match val.parse() {
                Ok(ranker) => config.ranker = ranker,
                Err(e) => tracing::warn!("Ignoring BOOK_RAG_RANKER: {e}"),
            }
        }
        if let Some(v) = get("BOOK_RAG_REWRITE_QUERIES").and_then(|v| parse_bool(&v)) {
            config.rewrite_queries = v;
        }
        if let Some(v) = get("BOOK_RAG_MAX_CONCURRENT_STREAMS").and_then(|v| v.parse().ok()) {
            config.max_concurrent_streams = v;
        }

        // Chat model
        if let Some(provider) = get("LLM_PROVIDER") {
            config.llm.base_url = default_base_url(&provider).to_string();
            config.llm.provider = provider;
        }
        if let Some(url) = get("LLM_BASE_URL") {
            config.llm.base_url = url;
        }
        if let Some(model) = get("LLM_CHAT_MODEL") {
            config.llm.chat_model = model;
        }
        if let Some(key) = get("LLM_API_KEY").or_else(|| get("GEMINI_API_KEY")) {
            config.llm.api_key = Some(key);
        }

        // Encoder
        if let Some(provider) = get("EMBEDDING_PROVIDER") {
            config.embedding.base_url = default_base_url(&provider).to_string();
            config.embedding.provider = provider;
        }
        if let Some(url) = get("EMBEDDING_BASE_URL") {
            config.embedding.base_url = url;
        }
        if let Some(model) = get("EMBEDDING_MODEL") {
            config.embedding.model = model;
        }
        if let Some(key) = get("EMBEDDING_API_KEY") {
            config.embedding.api_key = Some(key);
        } else if config.embedding.provider == "gemini" {
            config.embedding.api_key = config.llm.api_key.clone();
        }
        if let Some(v) = get("EMBEDDING_BATCH_SIZE").and_then(|v| v.parse::<usize>().ok()) {
            config.embedding.batch_size = v.max(1);
        }

        config
    }

    /// Reject configurations the service cannot start with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.llm.provider == "hash" {
            anyhow::bail!("LLM provider 'hash' cannot generate text; it is only valid for EMBEDDING_PROVIDER");
        }
        for (what, provider, key) in [
            ("LLM", &self.llm.provider, &self.llm.api_key),
            ("Embedding", &self.embedding.provider, &self.embedding.api_key),
        ] {
            match provider.as_str() {
                "ollama" | "hash" => {}
                "gemini" | "openai" => {
                    if key.as_deref().map_or(true, str::is_empty) {
                        anyhow::bail!("{what} provider '{provider}' requires an API key (set LLM_API_KEY, GEMINI_API_KEY or EMBEDDING_API_KEY)");
                    }
                }
                other => anyhow::bail!("Unknown {what} provider: {other}"),
            }
        }
        if self.top_k == 0 {
            anyhow::bail!("BOOK_RAG_TOP_K must be at least 1");
        }
        Ok(())
    }

    pub fn book_path(&self) -> PathBuf {
        self.book_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("book.md"))
    }

    pub fn cache_path(&self) -> PathBuf {
        self.cache_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("embedded_paragraphs.bin"))
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
