//! Pluggable tokenizers.
//!
//! The engine only relies on [`Tokenizer::tokenize`] being deterministic: the same text always
//! yields the same token sequence. Two implementations ship with the crate:
//!
//! - [`WhitespaceTokenizer`] -- split on whitespace, optionally lowercase.
//! - [`AnalyzerTokenizer`] -- regex word extraction followed by a chain of [`TokenFilter`]s
//!   (lowercasing, length bounds, stopword removal).
//!
//! ```
//! use wordflow::tokenizer::{AnalyzerTokenizer, Tokenizer};
//!
//! let t = AnalyzerTokenizer::english().unwrap();
//! assert_eq!(t.tokenize("The cat, the HAT!").unwrap(), vec!["cat", "hat"]);
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::TokenizeError;
use crate::record::Record;

/// Maps text to an ordered sequence of normalized tokens.
pub trait Tokenizer: Send + Sync {
    /// Tokenize one piece of text.
    ///
    /// # Errors
    /// Returns a [`TokenizeError`] when the text cannot be tokenized; the engine skips the record.
    fn tokenize(&self, text: &str) -> Result<Vec<String>, TokenizeError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Decode a record payload and tokenize it.
    ///
    /// # Errors
    /// Fails on non-UTF-8 payloads and on anything [`Tokenizer::tokenize`] rejects.
    fn tokenize_record(&self, record: &Record) -> Result<Vec<String>, TokenizeError> {
        self.tokenize(record.text()?)
    }
}

/* ===================== WhitespaceTokenizer ===================== */

/// Splits on Unicode whitespace.
#[derive(Clone, Copy, Debug)]
pub struct WhitespaceTokenizer {
    pub lowercase: bool,
}

impl Default for WhitespaceTokenizer {
    fn default() -> Self {
        Self { lowercase: true }
    }
}

impl Tokenizer for WhitespaceTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<String>, TokenizeError> {
        Ok(text
            .split_whitespace()
            .map(|w| {
                if self.lowercase {
                    w.to_lowercase()
                } else {
                    w.to_string()
                }
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "whitespace"
    }
}

/* ===================== Token filters ===================== */

/// One step of an analyzer chain. Returning `None` drops the token.
pub trait TokenFilter: Send + Sync {
    fn apply(&self, token: String) -> Option<String>;
}

/// Lowercases every token.
#[derive(Clone, Copy, Debug, Default)]
pub struct LowercaseFilter;

impl TokenFilter for LowercaseFilter {
    fn apply(&self, token: String) -> Option<String> {
        if token.chars().any(char::is_uppercase) {
            Some(token.to_lowercase())
        } else {
            Some(token)
        }
    }
}

/// Keeps tokens whose length in characters is within `[min, max]`.
#[derive(Clone, Copy, Debug)]
pub struct LengthFilter {
    pub min: usize,
    pub max: usize,
}

impl TokenFilter for LengthFilter {
    fn apply(&self, token: String) -> Option<String> {
        let n = token.chars().count();
        (n >= self.min && n <= self.max).then_some(token)
    }
}

/// Drops tokens present in a stopword set. Compare after lowercasing.
#[derive(Clone, Debug, Default)]
pub struct StopwordFilter {
    words: HashSet<String>,
}

impl StopwordFilter {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            words: words.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn english() -> Self {
        Self::new(ENGLISH_STOPWORDS.iter().copied())
    }

    #[must_use]
    pub fn contains(&self, word: &str) -> bool {
        self.words.contains(word)
    }
}

impl TokenFilter for StopwordFilter {
    fn apply(&self, token: String) -> Option<String> {
        (!self.words.contains(&token)).then_some(token)
    }
}

/// A compact English stopword list.
pub const ENGLISH_STOPWORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "am", "an", "and", "any", "are", "as", "at", "be",
    "because", "been", "before", "being", "but", "by", "can", "could", "did", "do", "does",
    "doing", "down", "during", "each", "few", "for", "from", "further", "had", "has", "have",
    "having", "he", "her", "here", "hers", "him", "his", "how", "i", "if", "in", "into", "is",
    "it", "its", "itself", "just", "me", "more", "most", "my", "no", "nor", "not", "now", "of",
    "off", "on", "once", "only", "or", "other", "our", "ours", "out", "over", "own", "same",
    "she", "should", "so", "some", "such", "than", "that", "the", "their", "theirs", "them",
    "then", "there", "these", "they", "this", "those", "through", "to", "too", "under", "until",
    "up", "very", "was", "we", "were", "what", "when", "where", "which", "while", "who", "whom",
    "why", "will", "with", "would", "you", "your", "yours",
];

/* ===================== AnalyzerTokenizer ===================== */

/// Default word pattern: letters/digits, allowing inner apostrophes (`don't`).
pub const DEFAULT_WORD_PATTERN: &str = r"[\p{L}\p{N}]+(?:['’][\p{L}\p{N}]+)*";

/// Regex word extraction followed by a filter chain.
pub struct AnalyzerTokenizer {
    words: Regex,
    filters: Vec<Box<dyn TokenFilter>>,
    max_tokens: Option<usize>,
}

impl AnalyzerTokenizer {
    #[must_use]
    pub fn builder() -> AnalyzerBuilder {
        AnalyzerBuilder::default()
    }

    /// Lowercase, at least two characters, English stopwords removed.
    ///
    /// # Errors
    /// Only fails if the built-in pattern does not compile.
    pub fn english() -> Result<Self> {
        Self::builder()
            .lowercase()
            .length(2, usize::MAX)
            .stopwords(StopwordFilter::english())
            .build()
    }
}

impl Tokenizer for AnalyzerTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<String>, TokenizeError> {
        let mut out = Vec::new();
        for m in self.words.find_iter(text) {
            let token = self
                .filters
                .iter()
                .try_fold(m.as_str().to_string(), |tok, f| f.apply(tok));
            if let Some(token) = token {
                out.push(token);
            }
            if let Some(max) = self.max_tokens
                && out.len() > max
            {
                return Err(TokenizeError::Rejected(format!(
                    "more than {max} tokens in one record"
                )));
            }
        }
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "analyzer"
    }
}

/// Builder for [`AnalyzerTokenizer`]. Filters run in the order they are added.
#[derive(Default)]
pub struct AnalyzerBuilder {
    pattern: Option<String>,
    filters: Vec<Box<dyn TokenFilter>>,
    max_tokens: Option<usize>,
}

impl AnalyzerBuilder {
    #[must_use]
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    #[must_use]
    pub fn lowercase(self) -> Self {
        self.filter(LowercaseFilter)
    }

    #[must_use]
    pub fn length(self, min: usize, max: usize) -> Self {
        self.filter(LengthFilter { min, max })
    }

    #[must_use]
    pub fn stopwords(self, stop: StopwordFilter) -> Self {
        self.filter(stop)
    }

    #[must_use]
    pub fn filter(mut self, f: impl TokenFilter + 'static) -> Self {
        self.filters.push(Box::new(f));
        self
    }

    /// Reject records producing more than `max` tokens.
    #[must_use]
    pub fn max_tokens(mut self, max: usize) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// # Errors
    /// Returns an error if the word pattern is not a valid regex.
    pub fn build(self) -> Result<AnalyzerTokenizer> {
        let pattern = self.pattern.as_deref().unwrap_or(DEFAULT_WORD_PATTERN);
        let words = Regex::new(pattern).with_context(|| format!("compile word pattern {pattern:?}"))?;
        Ok(AnalyzerTokenizer {
            words,
            filters: self.filters,
            max_tokens: self.max_tokens,
        })
    }
}

/* ===================== Config ===================== */

/// Which stopwords an analyzer drops.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stopwords {
    #[default]
    None,
    English,
    Custom(Vec<String>),
}

/// Serializable tokenizer selection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenizerSpec {
    Whitespace {
        #[serde(default = "default_true")]
        lowercase: bool,
    },
    Analyzer {
        #[serde(default)]
        pattern: Option<String>,
        #[serde(default = "default_min_length")]
        min_length: usize,
        #[serde(default)]
        stopwords: Stopwords,
        #[serde(default)]
        max_tokens: Option<usize>,
    },
}

fn default_true() -> bool {
    true
}

fn default_min_length() -> usize {
    1
}

impl Default for TokenizerSpec {
    fn default() -> Self {
        Self::Whitespace { lowercase: true }
    }
}

impl TokenizerSpec {
    /// Instantiate the described tokenizer.
    ///
    /// # Errors
    /// Returns an error if a custom pattern fails to compile.
    pub fn build(&self) -> Result<Arc<dyn Tokenizer>> {
        match self {
            Self::Whitespace { lowercase } => Ok(Arc::new(WhitespaceTokenizer {
                lowercase: *lowercase,
            })),
            Self::Analyzer {
                pattern,
                min_length,
                stopwords,
                max_tokens,
            } => {
                let mut b = AnalyzerTokenizer::builder()
                    .lowercase()
                    .length(*min_length, usize::MAX);
                if let Some(p) = pattern {
                    b = b.pattern(p.clone());
                }
                b = match stopwords {
                    Stopwords::None => b,
                    Stopwords::English => b.stopwords(StopwordFilter::english()),
                    Stopwords::Custom(words) => {
                        b.stopwords(StopwordFilter::new(words.iter().map(|w| w.to_lowercase())))
                    }
                };
                if let Some(max) = max_tokens {
                    b = b.max_tokens(*max);
                }
                Ok(Arc::new(b.build()?))
            }
        }
    }
}
