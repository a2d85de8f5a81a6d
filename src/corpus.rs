use anyhow::{Context, Result};
use std::path::Path;

/// Paragraphs are separated by a single blank line.
pub const PARAGRAPH_SEPARATOR: &str = "\n\n";

/// The book, split into paragraphs. A paragraph's id is its index.
///
/// Loaded once at startup and never mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    paragraphs: Vec<String>,
}

fn normalize_line_endings(text: &str) -> std::borrow::Cow<'_, str> {
    if text.contains('\r') {
        std::borrow::Cow::Owned(text.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        std::borrow::Cow::Borrowed(text)
    }
}

impl Corpus {
    /// Split `text` on blank-line boundaries. Empty paragraphs are kept so
    /// that ids stay aligned with the source text. CRLF and lone CR line
    /// endings are read as `\n`.
    pub fn from_text(text: &str) -> Self {
        let text = normalize_line_endings(text);
        Self {
            paragraphs: text.split(PARAGRAPH_SEPARATOR).map(str::to_string).collect(),
        }
    }

    pub fn from_paragraphs<I, S>(paragraphs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paragraphs: paragraphs.into_iter().map(Into::into).collect(),
        }
    }

    /// Read and split the book at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read book file {}", path.display()))?;
        let corpus = Self::from_text(&text);
        tracing::info!(
            "Loaded {} paragraphs from {}",
            corpus.len(),
            path.display()
        );
        Ok(corpus)
    }

    pub fn len(&self) -> usize {
        self.paragraphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paragraphs.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&str> {
        self.paragraphs.get(id).map(String::as_str)
    }

    pub fn paragraphs(&self) -> &[String] {
        &self.paragraphs
    }

    /// `(id, text)` pairs in corpus order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> + '_ {
        self.paragraphs
            .iter()
            .enumerate()
            .map(|(id, p)| (id, p.as_str()))
    }

    /// Content hash identifying this exact sequence of paragraphs.
    ///
    /// Each paragraph is length-prefixed so that moving a boundary changes
    /// the hash even when the concatenated text does not.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(self.paragraphs.len() as u64).to_le_bytes());
        for p in &self.paragraphs {
            hasher.update(&(p.len() as u64).to_le_bytes());
            hasher.update(p.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}
