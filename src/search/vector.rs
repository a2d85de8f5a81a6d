use serde::{Deserialize, Serialize};

use crate::error::SearchError;
use crate::llm::embeddings::TextEncoder;
use crate::models::RankedParagraph;

/// Number of passages returned when the caller does not say otherwise.
pub const DEFAULT_TOP_K: usize = 5;

/// A paragraph together with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedParagraph {
    pub id: usize,
    pub paragraph: String,
    pub embedding: Vec<f32>,
}

/// Read-only set of embedded paragraphs searched by cosine similarity.
#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    entries: Vec<EmbeddedParagraph>,
    dimension: usize,
}

impl VectorIndex {
    /// All entries must share one dimension.
    pub fn new(entries: Vec<EmbeddedParagraph>) -> Result<Self, SearchError> {
        let dimension = entries.first().map(|e| e.embedding.len()).unwrap_or(0);
        if let Some(bad) = entries.iter().find(|e| e.embedding.len() != dimension) {
            return Err(SearchError::corrupt(format!(
                "paragraph {} has {} dimensions, expected {dimension}",
                bad.id,
                bad.embedding.len()
            )));
        }
        Ok(Self { entries, dimension })
    }

    pub fn entries(&self) -> &[EmbeddedParagraph] {
        &self.entries
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rank against an already-encoded query.
    pub fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<RankedParagraph>, SearchError> {
        rank(&self.entries, query_embedding, top_k)
    }

    /// Encode `query` and rank.
    pub async fn search_text(
        &self,
        encoder: &dyn TextEncoder,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RankedParagraph>, SearchError> {
        let query_embedding = encoder
            .encode_one(query)
            .await
            .map_err(|e| SearchError::encoder(format!("{e:#}")))?;
        self.search(&query_embedding, top_k)
    }
}

/// Rank paragraphs by cosine similarity to `query_embedding`, best first,
/// keeping at most `top_k`.
pub fn rank(
    paragraphs: &[EmbeddedParagraph],
    query_embedding: &[f32],
    top_k: usize,
) -> Result<Vec<RankedParagraph>, SearchError> {
    if let Some(first) = paragraphs.first() {
        if first.embedding.len() != query_embedding.len() {
            return Err(SearchError::DimensionMismatch {
                expected: first.embedding.len(),
                actual: query_embedding.len(),
            });
        }
    }

    let mut scored: Vec<(f32, &EmbeddedParagraph)> = paragraphs
        .iter()
        .map(|p| (cosine_similarity(query_embedding, &p.embedding), p))
        .collect();

    // Sort descending by score; stable, so ties keep corpus order
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    scored.truncate(top_k);

    Ok(scored
        .into_iter()
        .map(|(score, p)| RankedParagraph {
            id: p.id,
            paragraph: p.paragraph.clone(),
            score,
        })
        .collect())
}

/// Cosine similarity in `[-1, 1]`. Zero-magnitude or mismatched vectors
/// score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 || !denom.is_finite() {
        0.0
    } else {
        // Rounding can push a self-match just past 1.0
        (dot / denom).clamp(-1.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn para(id: usize, embedding: Vec<f32>) -> EmbeddedParagraph {
        EmbeddedParagraph {
            id,
            paragraph: format!("paragraph {id}"),
            embedding,
        }
    }

    fn five_paragraphs() -> Vec<EmbeddedParagraph> {
        vec![
            para(0, vec![1.0, 0.0, 0.0]),
            para(1, vec![0.9, 0.1, 0.0]),
            para(2, vec![0.5, 0.5, 0.0]),
            para(3, vec![0.2, 0.8, 0.1]),
            para(4, vec![0.1, 0.1, 0.9]),
        ]
    }

    #[test]
    fn test_cosine_identical() {
        let v = [0.3, -0.4, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = [1.0, 2.0];
        let b = [-1.0, -2.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn test_cosine_zero_vector_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_cosine_length_mismatch_is_zero() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_top_k_truncates() {
        let results = rank(&five_paragraphs(), &[1.0, 0.2, 0.0], 2).unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_top_k_larger_than_corpus() {
        let results = rank(&five_paragraphs(), &[1.0, 0.0, 0.0], 50).unwrap();
        assert_eq!(results.len(), 5);
    }

    #[test]
    fn test_sorted_and_bounded() {
        let results = rank(&five_paragraphs(), &[0.3, 0.3, 0.3], 5).unwrap();
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert!(results.iter().all(|r| (-1.0..=1.0).contains(&r.score)));
    }

    #[test]
    fn test_exact_match_ranks_first() {
        let results = rank(&five_paragraphs(), &[0.5, 0.5, 0.0], 3).unwrap();
        assert_eq!(results[0].id, 2);
        assert!((results[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_dimension_mismatch_is_an_error() {
        let err = rank(&five_paragraphs(), &[1.0, 0.0], 5).unwrap_err();
        assert!(matches!(
            err,
            SearchError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
    }

    #[test]
    fn test_empty_corpus() {
        assert!(rank(&[], &[1.0], 5).unwrap().is_empty());
    }

    #[test]
    fn test_zero_query_scores_zero() {
        let results = rank(&five_paragraphs(), &[0.0, 0.0, 0.0], 5).unwrap();
        assert!(results.iter().all(|r| r.score == 0.0));
        // Ties keep corpus order
        let ids: Vec<usize> = results.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_index_rejects_ragged_embeddings() {
        let err = VectorIndex::new(vec![para(0, vec![1.0, 0.0]), para(1, vec![1.0])]).unwrap_err();
        assert!(matches!(err, SearchError::CorruptCache { .. }));
    }

    #[test]
    fn test_index_search() {
        let index = VectorIndex::new(five_paragraphs()).unwrap();
        assert_eq!(index.dimension(), 3);
        let results = index.search(&[0.0, 0.0, 1.0], 1).unwrap();
        assert_eq!(results[0].id, 4);
    }
}
