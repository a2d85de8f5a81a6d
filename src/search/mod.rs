pub mod cache;
pub mod lexical;
pub mod normalize;
pub mod vector;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which engine ranks the passages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ranker {
    /// TF-IDF over stemmed tokens
    Lexical,
    /// Cosine similarity over embeddings
    Vector,
}

impl Ranker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lexical => "lexical",
            Self::Vector => "vector",
        }
    }
}

impl fmt::Display for Ranker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Ranker {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lexical" | "keyword" | "tfidf" => Ok(Self::Lexical),
            "vector" | "semantic" => Ok(Self::Vector),
            other => Err(format!("unknown ranker '{other}' (expected 'lexical' or 'vector')")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("keyword".parse::<Ranker>().unwrap(), Ranker::Lexical);
        assert_eq!(" Semantic ".parse::<Ranker>().unwrap(), Ranker::Vector);
        assert!("bm25".parse::<Ranker>().is_err());
    }

    #[test]
    fn test_serializes_to_snake_case() {
        assert_eq!(serde_json::to_value(Ranker::Lexical).unwrap(), "lexical");
        assert_eq!(Ranker::Vector.to_string(), "vector");
    }
}
