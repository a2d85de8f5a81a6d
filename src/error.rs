use thiserror::Error;

/// Failures raised by the ranking engines and the embedding cache.
///
/// Degenerate queries are not errors: they produce empty result lists.
#[derive(Error, Debug)]
pub enum SearchError {
    /// Query and corpus embeddings disagree on dimensionality.
    #[error("Embedding dimension mismatch: corpus vectors have {expected} dimensions, query has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The encoder returned nothing for a text it was asked to embed.
    #[error("Encoder returned no embedding for {count} input(s)")]
    EmptyEmbedding { count: usize },

    /// The cache file exists but cannot be trusted.
    #[error("Embedding cache is corrupt: {reason}")]
    CorruptCache { reason: String },

    /// The cache was written by an incompatible build.
    #[error("Unsupported embedding cache version {found} (expected {expected})")]
    UnsupportedCacheVersion { found: u32, expected: u32 },

    /// The text encoder failed.
    #[error("Encoder error: {message}")]
    Encoder { message: String },
}

impl SearchError {
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptCache {
            reason: reason.into(),
        }
    }

    pub fn encoder(message: impl Into<String>) -> Self {
        Self::Encoder {
            message: message.into(),
        }
    }

    /// Stable code for API error payloads.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            Self::EmptyEmbedding { .. } => "EMPTY_EMBEDDING",
            Self::CorruptCache { .. } => "CORRUPT_CACHE",
            Self::UnsupportedCacheVersion { .. } => "UNSUPPORTED_CACHE_VERSION",
            Self::Encoder { .. } => "ENCODER_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_mismatch_display() {
        let err = SearchError::DimensionMismatch {
            expected: 768,
            actual: 384,
        };
        let msg = err.to_string();
        assert!(msg.contains("768"));
        assert!(msg.contains("384"));
        assert_eq!(err.error_code(), "DIMENSION_MISMATCH");
    }

    #[test]
    fn test_helper_constructors() {
        assert_eq!(SearchError::corrupt("bad crc").error_code(), "CORRUPT_CACHE");
        assert_eq!(SearchError::encoder("timeout").error_code(), "ENCODER_ERROR");
    }
}
