//! Query and chunk tokenization.

use std::collections::HashSet;

/// Split into lowercase alphanumeric runs.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

/// Distinct terms of `text`, minus stopwords.
pub fn term_set(text: &str, stopwords: &HashSet<String>) -> HashSet<String> {
    tokenize(text).filter(|t| !stopwords.contains(t)).collect()
}
