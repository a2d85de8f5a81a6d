//! On-disk cache of paragraph embeddings.
//!
//! File layout: `[magic "BRAG"][u32 version LE][bincode payload][u32 CRC32 BE]`.
//! The CRC covers everything before it. The payload carries a header tying
//! the embeddings to the corpus fingerprint and encoder model, so a cache
//! built from another book or model is detected and rebuilt.
//!
//! Writes go to a temp file and are renamed into place. Nothing coordinates
//! two processes building the same cache; run one builder before serving.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;

use crate::corpus::Corpus;
use crate::error::SearchError;
use crate::llm::embeddings::TextEncoder;
use crate::search::vector::EmbeddedParagraph;

const CACHE_MAGIC: &[u8; 4] = b"BRAG";
pub const CACHE_VERSION: u32 = 1;

/// Identifies what a cache was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheHeader {
    pub corpus_fingerprint: String,
    pub paragraph_count: u64,
    pub model: String,
    pub dimension: u64,
}

impl CacheHeader {
    pub fn new(corpus: &Corpus, model: &str, dimension: usize) -> Self {
        Self {
            corpus_fingerprint: corpus.fingerprint(),
            paragraph_count: corpus.len() as u64,
            model: model.to_string(),
            dimension: dimension as u64,
        }
    }

    /// Why this cache cannot serve `corpus` encoded by `model`, if it can't.
    pub fn staleness(&self, corpus: &Corpus, model: &str) -> Option<String> {
        if self.model != model {
            return Some(format!(
                "built with model '{}', configured model is '{model}'",
                self.model
            ));
        }
        if self.paragraph_count != corpus.len() as u64 {
            return Some(format!(
                "holds {} paragraphs, corpus has {}",
                self.paragraph_count,
                corpus.len()
            ));
        }
        if self.corpus_fingerprint != corpus.fingerprint() {
            return Some("corpus content changed".to_string());
        }
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheFile {
    pub header: CacheHeader,
    pub entries: Vec<EmbeddedParagraph>,
}

impl CacheFile {
    /// Entries must be `0..n` in order, one per paragraph, all of the
    /// recorded dimension.
    fn validate(&self) -> Result<(), SearchError> {
        if self.entries.len() as u64 != self.header.paragraph_count {
            return Err(SearchError::corrupt(format!(
                "header says {} paragraphs, file has {}",
                self.header.paragraph_count,
                self.entries.len()
            )));
        }
        for (position, entry) in self.entries.iter().enumerate() {
            if entry.id != position {
                return Err(SearchError::corrupt(format!(
                    "entry at position {position} has id {}",
                    entry.id
                )));
            }
            if entry.embedding.len() as u64 != self.header.dimension {
                return Err(SearchError::corrupt(format!(
                    "paragraph {} has {} dimensions, header says {}",
                    entry.id,
                    entry.embedding.len(),
                    self.header.dimension
                )));
            }
        }
        Ok(())
    }
}

/// Write `file` to `path` atomically.
pub fn save(path: &Path, file: &CacheFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let payload = bincode::serialize(file).context("Failed to serialize embedding cache")?;

    let mut output = Vec::with_capacity(payload.len() + 12);
    output.extend_from_slice(CACHE_MAGIC);
    output.extend_from_slice(&CACHE_VERSION.to_le_bytes());
    output.extend_from_slice(&payload);
    let crc = crc32fast::hash(&output);
    output.extend_from_slice(&crc.to_be_bytes());

    let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
    let written = std::fs::write(&tmp_path, &output)
        .with_context(|| format!("Failed to write {}", tmp_path.display()))
        .and_then(|()| {
            std::fs::rename(&tmp_path, path)
                .with_context(|| format!("Failed to move cache into place at {}", path.display()))
        });
    if let Err(e) = written {
        if let Err(cleanup) = std::fs::remove_file(&tmp_path) {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove {}: {cleanup}", tmp_path.display());
            }
        }
        return Err(e);
    }

    tracing::info!(
        "Saved embedding cache {} ({} paragraphs, {} bytes, CRC32={:#010x})",
        path.display(),
        file.entries.len(),
        output.len(),
        crc
    );
    Ok(())
}

/// Read the cache at `path`. `Ok(None)` when the file does not exist.
///
/// A damaged file is a [`SearchError::CorruptCache`]; a file from another
/// format version is [`SearchError::UnsupportedCacheVersion`].
pub fn load(path: &Path) -> Result<Option<CacheFile>> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };

    if raw.len() < 12 || &raw[..4] != CACHE_MAGIC {
        return Err(SearchError::corrupt(format!("{} is not an embedding cache", path.display())).into());
    }

    let (body, crc_bytes) = raw.split_at(raw.len() - 4);
    let stored_crc = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let computed_crc = crc32fast::hash(body);
    if stored_crc != computed_crc {
        return Err(SearchError::corrupt(format!(
            "CRC32 mismatch: expected {stored_crc:#010x}, got {computed_crc:#010x}"
        ))
        .into());
    }

    let version = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
    if version != CACHE_VERSION {
        return Err(SearchError::UnsupportedCacheVersion {
            found: version,
            expected: CACHE_VERSION,
        }
        .into());
    }

    let file: CacheFile = bincode::deserialize(&body[8..])
        .map_err(|e| SearchError::corrupt(format!("undecodable payload: {e}")))?;
    file.validate()?;

    tracing::debug!("Embedding cache CRC32 verified: {stored_crc:#010x}");
    Ok(Some(file))
}

/// Encode every paragraph, `batch_size` at a time.
///
/// Batching bounds memory on the encoder side; the result does not depend on
/// it.
pub async fn build(
    corpus: &Corpus,
    encoder: &dyn TextEncoder,
    batch_size: usize,
) -> Result<Vec<EmbeddedParagraph>> {
    let batch_size = batch_size.max(1);
    let total_batches = corpus.len().div_ceil(batch_size);
    let started = Instant::now();
    let mut embeddings: Vec<Vec<f32>> = Vec::with_capacity(corpus.len());

    for (batch_no, batch) in corpus.paragraphs().chunks(batch_size).enumerate() {
        let encoded = encoder
            .encode(batch)
            .await
            .with_context(|| format!("Failed to encode batch {}/{total_batches}", batch_no + 1))?;
        if encoded.len() != batch.len() {
            return Err(SearchError::EmptyEmbedding {
                count: batch.len().saturating_sub(encoded.len()),
            }
            .into());
        }
        embeddings.extend(encoded);

        if (batch_no + 1) % 25 == 0 || batch_no + 1 == total_batches {
            tracing::info!(
                "Encoded batch {}/{total_batches} ({} paragraphs)",
                batch_no + 1,
                embeddings.len()
            );
        }
    }

    if let Some(first) = embeddings.first() {
        let dimension = first.len();
        if let Some(bad) = embeddings.iter().find(|e| e.len() != dimension) {
            return Err(SearchError::DimensionMismatch {
                expected: dimension,
                actual: bad.len(),
            }
            .into());
        }
    }

    tracing::info!(
        "Encoded {} paragraphs in {:.1}s",
        embeddings.len(),
        started.elapsed().as_secs_f32()
    );

    Ok(corpus
        .iter()
        .zip(embeddings)
        .map(|((id, paragraph), embedding)| EmbeddedParagraph {
            id,
            paragraph: paragraph.to_string(),
            embedding,
        })
        .collect())
}

/// Load the cache for `corpus`, or build and persist it when it is missing,
/// stale, or from an older format. A corrupt cache is an error.
pub async fn load_or_build(
    path: &Path,
    corpus: &Corpus,
    encoder: &dyn TextEncoder,
    batch_size: usize,
) -> Result<Vec<EmbeddedParagraph>> {
    match load(path) {
        Ok(Some(file)) => match file.header.staleness(corpus, encoder.model()) {
            None => {
                tracing::info!(
                    "Loaded {} embedded paragraphs from {}",
                    file.entries.len(),
                    path.display()
                );
                return Ok(file.entries);
            }
            Some(reason) => {
                tracing::warn!("Embedding cache {} is stale ({reason}), rebuilding", path.display());
            }
        },
        Ok(None) => {
            tracing::info!("No embedding cache at {}, generating embeddings", path.display());
        }
        Err(e) => match e.downcast_ref::<SearchError>() {
            Some(SearchError::UnsupportedCacheVersion { .. }) => {
                tracing::warn!("{e}, rebuilding");
            }
            _ => {
                return Err(e.context(format!(
                    "Embedding cache {} is unusable; delete it to regenerate",
                    path.display()
                )));
            }
        },
    }

    let entries = build(corpus, encoder, batch_size).await?;
    let dimension = entries.first().map(|e| e.embedding.len()).unwrap_or(0);
    let file = CacheFile {
        header: CacheHeader::new(corpus, encoder.model(), dimension),
        entries,
    };
    save(path, &file)?;
    Ok(file.entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::embeddings::HashEncoder;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts encode calls and the largest batch seen.
    struct CountingEncoder {
        inner: HashEncoder,
        calls: AtomicUsize,
        max_batch: AtomicUsize,
    }

    impl CountingEncoder {
        fn new() -> Self {
            Self {
                inner: HashEncoder::new(16),
                calls: AtomicUsize::new(0),
                max_batch: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TextEncoder for CountingEncoder {
        async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.max_batch.fetch_max(texts.len(), Ordering::SeqCst);
            self.inner.encode(texts).await
        }

        fn model(&self) -> &str {
            self.inner.model()
        }
    }

    fn corpus() -> Corpus {
        Corpus::from_paragraphs([
            "Money is a tool.",
            "Purpose drives profit.",
            "Work you love.",
            "Escape the rat race.",
            "Build a one-person business.",
        ])
    }

    #[tokio::test]
    async fn test_build_batches_and_keeps_order() {
        let encoder = CountingEncoder::new();
        let entries = build(&corpus(), &encoder, 2).await.unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 3);
        assert_eq!(encoder.max_batch.load(Ordering::SeqCst), 2);
        for (i, e) in entries.iter().enumerate() {
            assert_eq!(e.id, i);
            assert_eq!(e.paragraph, corpus().get(i).unwrap());
        }
    }

    #[tokio::test]
    async fn test_build_empty_corpus() {
        let encoder = HashEncoder::new(8);
        let entries = build(&Corpus::default(), &encoder, 8).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("cache.bin")).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_start_reuses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        let encoder = CountingEncoder::new();

        let first = load_or_build(&path, &corpus(), &encoder, 8).await.unwrap();
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 1);

        let second = load_or_build(&path, &corpus(), &encoder, 8).await.unwrap();
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_changed_corpus_triggers_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        let encoder = CountingEncoder::new();

        load_or_build(&path, &corpus(), &encoder, 8).await.unwrap();
        let edited = Corpus::from_paragraphs(["Money is a tool.", "Purpose drives profit!"]);
        let entries = load_or_build(&path, &edited, &encoder, 8).await.unwrap();

        assert_eq!(encoder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].paragraph, "Purpose drives profit!");
    }

    #[tokio::test]
    async fn test_changed_model_triggers_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");

        load_or_build(&path, &corpus(), &HashEncoder::new(8), 8).await.unwrap();
        let entries = load_or_build(&path, &corpus(), &HashEncoder::new(12), 8)
            .await
            .unwrap();
        assert_eq!(entries[0].embedding.len(), 12);
    }

    #[tokio::test]
    async fn test_flipped_byte_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        load_or_build(&path, &corpus(), &HashEncoder::new(8), 8).await.unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        let mid = raw.len() / 2;
        raw[mid] ^= 0xff;
        std::fs::write(&path, &raw).unwrap();

        let err = load(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SearchError>(),
            Some(SearchError::CorruptCache { .. })
        ));

        // Fatal at startup rather than silently rebuilt
        assert!(load_or_build(&path, &corpus(), &HashEncoder::new(8), 8)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_foreign_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        std::fs::write(&path, b"not a cache at all").unwrap();
        let err = load(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SearchError>(),
            Some(SearchError::CorruptCache { .. })
        ));
    }

    #[tokio::test]
    async fn test_old_version_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");

        let mut raw = Vec::new();
        raw.extend_from_slice(CACHE_MAGIC);
        raw.extend_from_slice(&0u32.to_le_bytes());
        raw.extend_from_slice(b"legacy payload");
        let crc = crc32fast::hash(&raw);
        raw.extend_from_slice(&crc.to_be_bytes());
        std::fs::write(&path, &raw).unwrap();

        let err = load(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SearchError>(),
            Some(SearchError::UnsupportedCacheVersion { found: 0, .. })
        ));

        let entries = load_or_build(&path, &corpus(), &HashEncoder::new(8), 8)
            .await
            .unwrap();
        assert_eq!(entries.len(), 5);
        assert!(load(&path).unwrap().is_some());
    }

    #[test]
    fn test_failed_save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // A non-empty directory where the cache should go makes the rename fail
        let path = dir.path().join("cache.bin");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupied"), b"x").unwrap();

        let file = CacheFile {
            header: CacheHeader::new(&corpus(), "hash-8", 8),
            entries: Vec::new(),
        };
        let err = save(&path, &file).unwrap_err();
        assert!(err.to_string().contains("Failed to move cache into place"));

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["cache.bin".to_string()]);
    }

    #[test]
    fn test_validate_rejects_out_of_order_ids() {
        let c = Corpus::from_paragraphs(["a", "b"]);
        let file = CacheFile {
            header: CacheHeader::new(&c, "m", 1),
            entries: vec![
                EmbeddedParagraph {
                    id: 1,
                    paragraph: "b".into(),
                    embedding: vec![1.0],
                },
                EmbeddedParagraph {
                    id: 0,
                    paragraph: "a".into(),
                    embedding: vec![1.0],
                },
            ],
        };
        assert!(matches!(
            file.validate(),
            Err(SearchError::CorruptCache { .. })
        ));
    }

    #[test]
    fn test_staleness_reasons() {
        let c = corpus();
        let header = CacheHeader::new(&c, "hash-8", 8);
        assert!(header.staleness(&c, "hash-8").is_none());
        assert!(header.staleness(&c, "other").unwrap().contains("model"));
        let shorter = Corpus::from_paragraphs(["Money is a tool."]);
        assert!(header.staleness(&shorter, "hash-8").unwrap().contains("paragraphs"));
    }
}
