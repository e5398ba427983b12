//! Keyword heuristics for records saved without an explicit type

use crate::memory::MemoryType;
use crate::tokenize::split_words;

/// Rules in priority order; a word matches a keyword when it starts with it
/// (`"fixed"` matches `"fix"`). The first rule with a hit wins.
const RULES: &[(MemoryType, &[&str])] = &[
    (MemoryType::Bugfix, &["fix", "bug", "error"]),
    (MemoryType::Feature, &["add", "new", "feature"]),
    (MemoryType::Refactor, &["refactor"]),
    (MemoryType::Decision, &["decide", "decision", "chose"]),
    (MemoryType::Discovery, &["found", "discover"]),
    (MemoryType::Change, &["change", "update"]),
];

/// Guess a record's type from its content
pub fn classify(content: &str) -> MemoryType {
    let words: Vec<String> = split_words(content).collect();

    RULES
        .iter()
        .find(|(_, keywords)| {
            words
                .iter()
                .any(|word| keywords.iter().any(|keyword| word.starts_with(keyword)))
        })
        .map(|(memory_type, _)| *memory_type)
        .unwrap_or(MemoryType::Observation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bug_report_is_bugfix() {
        assert_eq!(
            classify("Fixed authentication bug causing login failures"),
            MemoryType::Bugfix
        );
    }

    #[test]
    fn earlier_rule_wins() {
        // "added" (feature) and "error" (bugfix) both appear; bugfix is listed first
        assert_eq!(classify("Added retry on error"), MemoryType::Bugfix);
        assert_eq!(classify("Added a new export command"), MemoryType::Feature);
    }

    #[test]
    fn each_rule_is_reachable() {
        assert_eq!(classify("Refactoring the parser"), MemoryType::Refactor);
        assert_eq!(classify("We decided to use SQLite"), MemoryType::Decision);
        assert_eq!(classify("Chose rusqlite over sqlx"), MemoryType::Decision);
        assert_eq!(classify("Discovered a race in the watcher"), MemoryType::Discovery);
        assert_eq!(classify("Updated the CI matrix"), MemoryType::Change);
    }

    #[test]
    fn falls_back_to_observation() {
        assert_eq!(classify("The build takes four minutes"), MemoryType::Observation);
        assert_eq!(classify(""), MemoryType::Observation);
    }
}
