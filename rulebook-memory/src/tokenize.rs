//! Tokenizer shared by the lexical index, the vectorizer and query parsing

use std::collections::HashSet;

/// Built-in English stop words
pub const DEFAULT_STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "am", "an", "and", "any", "are",
    "as", "at", "be", "because", "been", "before", "being", "below", "between", "both", "but",
    "by", "can", "could", "did", "do", "does", "doing", "down", "during", "each", "few", "for",
    "from", "further", "had", "has", "have", "having", "he", "her", "here", "hers", "herself",
    "him", "himself", "his", "how", "i", "if", "in", "into", "is", "it", "its", "itself", "just",
    "me", "more", "most", "my", "myself", "no", "nor", "not", "now", "of", "off", "on", "once",
    "only", "or", "other", "our", "ours", "ourselves", "out", "over", "own", "same", "she",
    "should", "so", "some", "such", "than", "that", "the", "their", "theirs", "them",
    "themselves", "then", "there", "these", "they", "this", "those", "through", "to", "too",
    "under", "until", "up", "very", "was", "we", "were", "what", "when", "where", "which",
    "while", "who", "whom", "why", "will", "with", "would", "you", "your", "yours", "yourself",
    "yourselves",
];

/// Lowercasing, stop-word-dropping tokenizer.
///
/// Splits on every non-alphanumeric character, so `"HNSW-based index"` yields
/// `["hnsw", "based", "index"]`.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    stop_words: HashSet<String>,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new(DEFAULT_STOP_WORDS.iter().copied())
    }
}

impl Tokenizer {
    pub fn new<I, S>(stop_words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            stop_words: stop_words
                .into_iter()
                .map(|w| w.as_ref().to_lowercase())
                .collect(),
        }
    }

    pub fn is_stop_word(&self, token: &str) -> bool {
        self.stop_words.contains(token)
    }

    /// Tokens in input order, duplicates kept
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        split_words(text)
            .filter(|token| !self.is_stop_word(token))
            .collect()
    }
}

/// Lowercased alphanumeric runs, without stop-word filtering
pub fn split_words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|raw| !raw.is_empty())
        .map(|raw| raw.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn splits_lowercases_and_drops_stop_words() {
        let tokenizer = Tokenizer::default();
        assert_eq!(
            tokenizer.tokenize("Fixed the HNSW-based index, for REAL!"),
            vec!["fixed", "hnsw", "based", "index", "real"]
        );
    }

    #[test]
    fn stop_word_only_text_is_empty() {
        let tokenizer = Tokenizer::default();
        assert!(tokenizer.tokenize("the and of, to").is_empty());
        assert!(tokenizer.tokenize("").is_empty());
    }

    #[test]
    fn custom_stop_words_are_case_insensitive() {
        let tokenizer = Tokenizer::new(["Rulebook"]);
        assert_eq!(tokenizer.tokenize("rulebook the memory"), vec!["the", "memory"]);
    }
}
