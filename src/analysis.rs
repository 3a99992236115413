//! Text normalization and TF-IDF weighting.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref NON_WORD: Regex =
        Regex::new(r"[^\p{L}\p{N}\s]+").expect("non-word pattern is valid");
}

/// Split text into lowercase word tokens.
///
/// Every run of characters that is neither a letter, a number nor whitespace
/// becomes a space, then the text is split on whitespace. Duplicates are kept
/// in order of appearance.
///
/// ```
/// use pelta::analysis::tokenize;
///
/// assert_eq!(tokenize("Hello, World! hello"), vec!["hello", "world", "hello"]);
/// ```
pub fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    NON_WORD
        .replace_all(&lowered, " ")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Inverse document frequency: `ln((total_docs + 1) / max(doc_freq, 1))`.
pub fn idf(total_docs: u64, doc_freq: usize) -> f64 {
    ((total_docs as f64 + 1.0) / (doc_freq.max(1) as f64)).ln()
}
