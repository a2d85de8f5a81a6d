use serde::{Deserialize, Serialize};

use crate::search::Ranker;

/// One ranked passage. Produced per query and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedParagraph {
    pub id: usize,
    pub paragraph: String,
    pub score: f32,
}

/// Search request
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    /// Falls back to the configured ranker
    pub ranker: Option<Ranker>,
    /// Falls back to the configured top-k
    pub top_k: Option<usize>,
}

/// Search response
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub ranker: Ranker,
    pub results: Vec<RankedParagraph>,
}

/// Question for the agent
#[derive(Debug, Clone, Deserialize)]
pub struct AskRequest {
    pub query: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub paragraphs: usize,
    pub embedded_paragraphs: usize,
    pub embedding_dim: usize,
    pub default_ranker: Ranker,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranked_paragraph_wire_shape() {
        let hit = RankedParagraph {
            id: 3,
            paragraph: "Work you love.".into(),
            score: 0.5,
        };
        let json = serde_json::to_value(&hit).unwrap();
        assert_eq!(json["id"], 3);
        assert_eq!(json["paragraph"], "Work you love.");
        assert_eq!(json["score"], 0.5);
    }

    #[test]
    fn test_search_request_defaults() {
        let req: SearchRequest = serde_json::from_str(r#"{"query":"money"}"#).unwrap();
        assert!(req.ranker.is_none());
        assert!(req.top_k.is_none());
    }

    #[test]
    fn test_search_request_with_ranker() {
        let req: SearchRequest =
            serde_json::from_str(r#"{"query":"money","ranker":"lexical","top_k":3}"#).unwrap();
        assert_eq!(req.ranker, Some(Ranker::Lexical));
        assert_eq!(req.top_k, Some(3));
    }
}
