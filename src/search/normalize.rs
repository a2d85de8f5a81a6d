//! Lexical normalization: lowercase, strip punctuation, drop English stop
//! words, stem.
//!
//! Stop-word removal and stemming run through a tantivy `TextAnalyzer`
//! (Snowball English stemmer). Punctuation is stripped before tokenizing so
//! that contractions collapse into one token ("don't" -> "dont") instead of
//! being split in two.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use tantivy::tokenizer::{
    Language, Stemmer, StopWordFilter, TextAnalyzer, TokenStream, WhitespaceTokenizer,
};

/// NLTK English stop-word list.
///
/// Entries containing an apostrophe can never match because punctuation is
/// stripped first; they are kept so the list stays the canonical one.
pub const ENGLISH_STOP_WORDS: &[&str] = &[
    "i", "me", "my", "myself", "we", "our", "ours", "ourselves", "you", "you're", "you've",
    "you'll", "you'd", "your", "yours", "yourself", "yourselves", "he", "him", "his", "himself",
    "she", "she's", "her", "hers", "herself", "it", "it's", "its", "itself", "they", "them",
    "their", "theirs", "themselves", "what", "which", "who", "whom", "this", "that", "that'll",
    "these", "those", "am", "is", "are", "was", "were", "be", "been", "being", "have", "has",
    "had", "having", "do", "does", "did", "doing", "a", "an", "the", "and", "but", "if", "or",
    "because", "as", "until", "while", "of", "at", "by", "for", "with", "about", "against",
    "between", "into", "through", "during", "before", "after", "above", "below", "to", "from",
    "up", "down", "in", "out", "on", "off", "over", "under", "again", "further", "then", "once",
    "here", "there", "when", "where", "why", "how", "all", "any", "both", "each", "few", "more",
    "most", "other", "some", "such", "no", "nor", "not", "only", "own", "same", "so", "than",
    "too", "very", "s", "t", "can", "will", "just", "don", "don't", "should", "should've", "now",
    "d", "ll", "m", "o", "re", "ve", "y", "ain", "aren", "aren't", "couldn", "couldn't", "didn",
    "didn't", "doesn", "doesn't", "hadn", "hadn't", "hasn", "hasn't", "haven", "haven't", "isn",
    "isn't", "ma", "mightn", "mightn't", "mustn", "mustn't", "needn", "needn't", "shan",
    "shan't", "shouldn", "shouldn't", "wasn", "wasn't", "weren", "weren't", "won", "won't",
    "wouldn", "wouldn't",
];

static ANALYZER: LazyLock<TextAnalyzer> = LazyLock::new(|| {
    TextAnalyzer::builder(WhitespaceTokenizer::default())
        .filter(StopWordFilter::remove(
            ENGLISH_STOP_WORDS.iter().map(|w| w.to_string()),
        ))
        .filter(Stemmer::new(Language::English))
        .build()
});

/// Reduce `text` to its set of stemmed content tokens.
///
/// A `BTreeSet` keeps iteration order fixed so that score sums are
/// reproducible across runs.
pub fn normalize(text: &str) -> BTreeSet<String> {
    let cleaned = strip_punctuation(text);
    let mut analyzer = ANALYZER.clone();
    let mut stream = analyzer.token_stream(&cleaned);

    let mut tokens = BTreeSet::new();
    while stream.advance() {
        let token = &stream.token().text;
        if !token.is_empty() {
            tokens.insert(token.clone());
        }
    }
    tokens
}

/// Lowercase, keep word characters (alphanumerics and `_`), map any
/// whitespace to a plain space, drop everything else.
fn strip_punctuation(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() || c == '_' {
                Some(c)
            } else if c.is_whitespace() {
                Some(' ')
            } else {
                None
            }
        })
        .collect()
}
