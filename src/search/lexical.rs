//! TF-IDF ranking over stemmed paragraph vocabularies.

use std::collections::{BTreeMap, BTreeSet};

use crate::corpus::Corpus;
use crate::models::RankedParagraph;
use crate::search::normalize::normalize;

/// A paragraph reduced to its normalized vocabulary.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: usize,
    pub text: String,
    pub tokens: BTreeSet<String>,
}

impl Chunk {
    pub fn new(id: usize, text: impl Into<String>) -> Self {
        let text = text.into();
        let tokens = normalize(&text);
        Self { id, text, tokens }
    }

    /// Occurrences of `token` in this chunk. Chunks store a token set, so
    /// this is 0 or 1.
    pub fn term_frequency(&self, token: &str) -> usize {
        usize::from(self.tokens.contains(token))
    }
}

/// Smoothed inverse document frequency: `ln((N + 1) / (df + 1))`.
///
/// Non-negative for every `0 <= df <= N`, and 0 when the token is in every
/// chunk.
pub fn idf(corpus_size: usize, document_frequency: usize) -> f32 {
    ((corpus_size as f32 + 1.0) / (document_frequency as f32 + 1.0)).ln()
}

/// Rank `chunks` against `query` by summed TF×IDF over the query's tokens.
///
/// Only chunks with a positive score are returned, best first. Equal scores
/// keep corpus order. No truncation happens here.
pub fn rank(chunks: &[Chunk], query: &str) -> Vec<RankedParagraph> {
    let query_tokens = normalize(query);
    if query_tokens.is_empty() {
        return Vec::new();
    }

    let n_chunks = chunks.len();
    let token_idfs: BTreeMap<&str, f32> = query_tokens
        .iter()
        .map(|token| {
            let df = chunks.iter().filter(|c| c.tokens.contains(token)).count();
            (token.as_str(), idf(n_chunks, df))
        })
        .collect();

    let mut results: Vec<RankedParagraph> = chunks
        .iter()
        .filter_map(|chunk| {
            let score: f32 = token_idfs
                .iter()
                .map(|(token, idf)| chunk.term_frequency(token) as f32 * idf)
                .sum();
            (score > 0.0).then(|| RankedParagraph {
                id: chunk.id,
                paragraph: chunk.text.clone(),
                score,
            })
        })
        .collect();

    // Stable sort: ties stay in corpus order
    results.sort_by(|a, b| b.score.total_cmp(&a.score));
    results
}

/// In-memory lexical index over the whole corpus. Rebuilt every process
/// start; it is cheap compared to embedding.
#[derive(Debug, Clone, Default)]
pub struct LexicalIndex {
    chunks: Vec<Chunk>,
}

impl LexicalIndex {
    pub fn build(corpus: &Corpus) -> Self {
        let chunks: Vec<Chunk> = corpus.iter().map(|(id, text)| Chunk::new(id, text)).collect();
        let vocabulary: BTreeSet<&str> = chunks
            .iter()
            .flat_map(|c| c.tokens.iter().map(String::as_str))
            .collect();
        tracing::info!(
            "Built lexical index: {} chunks, {} distinct stems",
            chunks.len(),
            vocabulary.len()
        );
        Self { chunks }
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn search(&self, query: &str) -> Vec<RankedParagraph> {
        rank(&self.chunks, query)
    }
}
