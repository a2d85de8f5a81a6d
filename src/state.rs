use anyhow::Context;
use std::sync::Arc;

use crate::config::Config;
use crate::corpus::Corpus;
use crate::llm::embeddings::{encoder_from_config, TextEncoder};
use crate::models::RankedParagraph;
use crate::search::cache;
use crate::search::lexical::LexicalIndex;
use crate::search::vector::VectorIndex;
use crate::search::Ranker;

/// Shared application state. Built once before the listener binds; every
/// field is read-only afterwards.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub corpus: Arc<Corpus>,
    pub lexical: Arc<LexicalIndex>,
    pub vectors: Arc<VectorIndex>,
    pub encoder: Arc<dyn TextEncoder>,
    pub http_client: reqwest::Client,
    pub stream_semaphore: Arc<tokio::sync::Semaphore>,
}

impl AppState {
    /// Load the book, build the lexical index, and load or build the
    /// embedding cache. Any failure here must keep the service from starting.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(120))
            .build()?;
        let encoder = encoder_from_config(http_client.clone(), &config.embedding)?;
        let corpus = Corpus::load(&config.book_path())?;
        Self::from_parts(config, corpus, encoder, http_client).await
    }

    /// Build state around an already-loaded corpus and encoder.
    pub async fn from_parts(
        config: Config,
        corpus: Corpus,
        encoder: Arc<dyn TextEncoder>,
        http_client: reqwest::Client,
    ) -> anyhow::Result<Self> {
        let lexical = LexicalIndex::build(&corpus);

        tracing::info!("Loading embeddings (model '{}')...", encoder.model());
        let entries = cache::load_or_build(
            &config.cache_path(),
            &corpus,
            encoder.as_ref(),
            config.embedding.batch_size,
        )
        .await
        .context("Failed to prepare paragraph embeddings")?;
        let vectors = VectorIndex::new(entries)?;
        tracing::info!(
            "Vector index ready: {} paragraphs x {} dimensions",
            vectors.len(),
            vectors.dimension()
        );

        let max_streams = config.max_concurrent_streams.max(1);
        Ok(Self {
            config: Arc::new(config),
            corpus: Arc::new(corpus),
            lexical: Arc::new(lexical),
            vectors: Arc::new(vectors),
            encoder,
            http_client,
            stream_semaphore: Arc::new(tokio::sync::Semaphore::new(max_streams)),
        })
    }

    /// Rank the book against `query` with `ranker`, keeping at most `top_k`.
    ///
    /// Scoring runs on the blocking pool; only query encoding is async.
    pub async fn rank(
        &self,
        query: &str,
        ranker: Ranker,
        top_k: usize,
    ) -> anyhow::Result<Vec<RankedParagraph>> {
        match ranker {
            Ranker::Lexical => {
                let lexical = self.lexical.clone();
                let query = query.to_string();
                let mut results =
                    tokio::task::spawn_blocking(move || lexical.search(&query)).await?;
                results.truncate(top_k);
                Ok(results)
            }
            Ranker::Vector => {
                let query_embedding = self
                    .encoder
                    .encode_one(query)
                    .await
                    .map_err(|e| crate::error::SearchError::encoder(format!("{e:#}")))?;
                let vectors = self.vectors.clone();
                let results =
                    tokio::task::spawn_blocking(move || vectors.search(&query_embedding, top_k))
                        .await??;
                Ok(results)
            }
        }
    }
}
