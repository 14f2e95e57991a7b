//! Person-name normalizer.
//!
//! Produces the comparison key used for grouping and lookup:
//! - Uppercase
//! - NFD decomposition with combining marks dropped (JOÃO → JOAO)
//! - Deep mode only: digits and punctuation removed, stopwords dropped
//! - Whitespace collapsed and trimmed
//!
//! Empty input yields an empty key, which never matches anything.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Default prepositions removed in deep mode.
pub const DEFAULT_STOPWORDS: &[&str] = &["DE", "DA", "DO", "DAS", "DOS", "DES"];

/// How aggressively names are folded.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NormalizeMode {
    /// Case, accents and whitespace only.
    Basic,
    /// Basic plus digits, punctuation and stopwords.
    #[default]
    Deep,
}

/// Normalizer for person names.
#[derive(Debug, Clone)]
pub struct NameNormalizer {
    mode: NormalizeMode,
    /// Uppercased, accent-free stopwords
    stopwords: HashSet<String>,
}

impl Default for NameNormalizer {
    fn default() -> Self {
        Self::new(NormalizeMode::Deep)
    }
}

impl NameNormalizer {
    /// Create a normalizer with the default stopword list.
    pub fn new(mode: NormalizeMode) -> Self {
        Self::with_stopwords(mode, DEFAULT_STOPWORDS.iter().copied())
    }

    /// Create a normalizer with a custom stopword list.
    pub fn with_stopwords<I, S>(mode: NormalizeMode, stopwords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let stopwords = stopwords
            .into_iter()
            .map(|w| fold(w.as_ref()))
            .filter(|w| !w.is_empty())
            .collect();
        Self { mode, stopwords }
    }

    /// Canonical comparison key for a raw name.
    pub fn normalize(&self, raw: &str) -> String {
        let folded = fold(raw);
        match self.mode {
            NormalizeMode::Basic => collapse_whitespace(&folded),
            NormalizeMode::Deep => {
                let stripped: String = folded
                    .chars()
                    .map(|c| if c.is_alphabetic() || c.is_whitespace() { c } else { ' ' })
                    .collect();
                stripped
                    .split_whitespace()
                    .filter(|token| !self.stopwords.contains(*token))
                    .collect::<Vec<_>>()
                    .join(" ")
            }
        }
    }
}

/// Key with the basic rules.
pub fn basic_key(raw: &str) -> String {
    collapse_whitespace(&fold(raw))
}

/// Key with the deep rules and default stopwords.
pub fn deep_key(raw: &str) -> String {
    NameNormalizer::new(NormalizeMode::Deep).normalize(raw)
}

/// Uppercase and strip diacritics.
fn fold(raw: &str) -> String {
    raw.to_uppercase()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect()
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_accent_case_whitespace() {
        assert_eq!(basic_key("João  da   Silva"), "JOAO DA SILVA");
        assert_eq!(basic_key("JOAO DA SILVA"), basic_key("joão da silva"));
        assert_eq!(basic_key("  Conceição "), "CONCEICAO");
    }

    #[test]
    fn test_deep_strips_stopwords_and_punctuation() {
        assert_eq!(deep_key("Maria das Dores (2)"), "MARIA DORES");
        assert_eq!(deep_key("JOSÉ DOS SANTOS-FILHO"), "JOSE SANTOS FILHO");
        assert_eq!(deep_key("Ana de Souza, 1958"), "ANA SOUZA");
    }

    #[test]
    fn test_basic_keeps_stopwords() {
        let basic = NameNormalizer::new(NormalizeMode::Basic);
        assert_eq!(basic.normalize("Maria das Dores"), "MARIA DAS DORES");
    }

    #[test]
    fn test_custom_stopwords() {
        let normalizer = NameNormalizer::with_stopwords(NormalizeMode::Deep, ["e", "Dá"]);
        assert_eq!(normalizer.normalize("Pedro e Paulo da Silva"), "PEDRO PAULO SILVA");
        assert_eq!(normalizer.normalize("Pedro de Paulo"), "PEDRO DE PAULO");
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(deep_key(""), "");
        assert_eq!(deep_key(" -- 123 "), "");
        assert_eq!(NameNormalizer::default().normalize(""), "");
    }

    proptest! {
        #[test]
        fn prop_normalize_idempotent(name in "[a-zA-ZÀ-ÿ0-9 .,()'-]{0,40}") {
            for mode in [NormalizeMode::Basic, NormalizeMode::Deep] {
                let normalizer = NameNormalizer::new(mode);
                let once = normalizer.normalize(&name);
                prop_assert_eq!(normalizer.normalize(&once), once);
            }
        }

        #[test]
        fn prop_case_insensitive(name in "[a-zA-Zà-ÿ ]{0,30}") {
            prop_assert_eq!(deep_key(&name.to_lowercase()), deep_key(&name.to_uppercase()));
        }
    }
}
