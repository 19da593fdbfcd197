//! Text normalization: the canonical token stream every later stage keys on.
//!
//! TF-IDF fitting, keyword tagging, and theme matching all operate on the
//! output of [`Normalizer::normalize`], so the same instance must be used
//! for every stage of one pipeline run.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use rust_stemmers::{Algorithm, Stemmer};

/// URLs, HTML-like tags, mentions, and hashtags.
static NOISE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)https?://\S+|www\.\S+|<[^<>]*>|@\w+|#\w+").expect("noise pattern")
});

/// Anything left that is not a lowercase letter, digit, or whitespace.
static NON_ALNUM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9\s]").expect("non-alnum pattern"));

/// Stemming behavior for the normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StemMode {
    /// Keep tokens as-is.
    Off,
    /// English Snowball stemming, so that "crashes" and "crash" share a key.
    #[default]
    English,
}

/// Minimal token length kept after filtering (strictly greater than).
const MIN_TOKEN_LEN: usize = 2;

/// Normalizes raw review text into a lowercase, noise-free token stream.
pub struct Normalizer {
    stopwords: HashSet<String>,
    stemmer: Option<Stemmer>,
}

impl Normalizer {
    /// Build a normalizer with the built-in stopword list.
    pub fn new(stem_mode: StemMode) -> Self {
        Self::with_stopwords(stem_mode, std::iter::empty::<String>())
    }

    /// Build a normalizer with extra stopwords on top of the built-in list.
    pub fn with_stopwords<I, S>(stem_mode: StemMode, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut stopwords: HashSet<String> =
            DEFAULT_STOPWORDS.iter().map(|s| s.to_string()).collect();
        stopwords.extend(extra.into_iter().map(|s| s.into().to_lowercase()));
        let stemmer = match stem_mode {
            StemMode::Off => None,
            StemMode::English => Some(Stemmer::create(Algorithm::English)),
        };
        Self { stopwords, stemmer }
    }

    /// Normalize a possibly-missing text field. `None` maps to the empty
    /// string, never an error.
    pub fn normalize_opt(&self, text: Option<&str>) -> String {
        match text {
            Some(t) => self.normalize(t),
            None => String::new(),
        }
    }

    /// Lowercase, strip URLs/HTML/punctuation, drop stopwords and tokens of
    /// length <= 2, optionally stem, and collapse whitespace.
    ///
    /// Running the result through `normalize` again yields the same string.
    pub fn normalize(&self, text: &str) -> String {
        let lower = text.to_lowercase();
        let no_noise = NOISE_RE.replace_all(&lower, " ");
        let plain = NON_ALNUM_RE.replace_all(&no_noise, " ");
        plain
            .split_whitespace()
            .filter(|w| w.len() > MIN_TOKEN_LEN && !self.stopwords.contains(*w))
            .map(|w| self.stem_fixpoint(w))
            .filter(|w| w.len() > MIN_TOKEN_LEN && !self.stopwords.contains(w))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Stem until the output stops changing. Snowball is not idempotent on
    /// its own output ("responsiveness" → "respons" → "respon"), and a
    /// stable token stream is what keeps re-normalization a no-op.
    fn stem_fixpoint(&self, word: &str) -> String {
        let Some(stemmer) = &self.stemmer else {
            return word.to_string();
        };
        let mut current = word.to_string();
        loop {
            let next = stemmer.stem(&current).into_owned();
            if next == current {
                return current;
            }
            current = next;
        }
    }
}

/// Load an additional stopword file: one word per line, `#` comments and
/// blank lines ignored.
pub fn load_stopword_file(path: &Path) -> io::Result<Vec<String>> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| l.to_lowercase())
        .collect())
}

/// Built-in English stopword list. Deliberately small: domain words like
/// "not" or "out" carry signal for theme phrases and stay in.
const DEFAULT_STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "had", "has", "have",
    "he", "her", "his", "i", "if", "in", "is", "it", "its", "of", "on", "or", "she", "so", "that",
    "the", "their", "them", "they", "this", "to", "was", "we", "were", "will", "with", "you",
    "your",
];
