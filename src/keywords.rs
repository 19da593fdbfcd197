//! Group-wise TF-IDF keyword extraction and per-row keyword tagging.
//!
//! Each group (bank) gets its own vectorizer fit over its own documents
//! only; terms from one bank never leak into another bank's vocabulary.
//! Weighting matches the usual vectorizer conventions: raw term counts,
//! smoothed idf `ln((1 + n) / (1 + df)) + 1`, and l2-normalized rows,
//! ranked by mean weight across the group's documents.

use std::collections::{BTreeMap, HashMap, HashSet};

use log::warn;
use regex::Regex;
use serde::Serialize;

use crate::ReviewRecord;

/// Knobs for the per-group vectorizer.
#[derive(Debug, Clone)]
pub struct TfidfOptions {
    /// Inclusive n-gram range, e.g. `(1, 2)` for unigrams and bigrams.
    pub ngram_range: (usize, usize),
    /// Document-frequency floor. Relaxed to 1 for groups with fewer
    /// documents than this, rather than failing.
    pub min_df: usize,
    /// Vocabulary cap per group; overflow is trimmed by corpus frequency.
    pub max_features: usize,
    /// How many ranked terms to keep per group.
    pub top_n: usize,
}

impl Default for TfidfOptions {
    fn default() -> Self {
        Self {
            ngram_range: (1, 2),
            min_df: 2,
            max_features: 5000,
            top_n: 50,
        }
    }
}

/// One row of the ranked top-term table, exported per group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopTerm {
    pub bank: String,
    pub term: String,
    pub score: f64,
    pub rank: usize,
}

/// Compute ranked `(term, mean weight)` lists per group.
///
/// Groups whose vocabulary ends up empty after filtering yield an empty
/// list with a warning; extraction never aborts over a single group.
pub fn extract_scored_terms(
    records: &[ReviewRecord],
    opts: &TfidfOptions,
) -> BTreeMap<String, Vec<(String, f64)>> {
    let mut groups: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for r in records {
        groups.entry(&r.bank).or_default().push(&r.normalized);
    }

    let mut out = BTreeMap::new();
    for (bank, docs) in groups {
        let ranked = fit_group(&docs, opts);
        if ranked.is_empty() {
            warn!("tf-idf produced no terms for group '{bank}'");
        }
        out.insert(bank.to_string(), ranked);
    }
    out
}

/// Same as [`extract_scored_terms`] but keeping only the term names.
pub fn extract_top_terms(
    records: &[ReviewRecord],
    opts: &TfidfOptions,
) -> BTreeMap<String, Vec<String>> {
    extract_scored_terms(records, opts)
        .into_iter()
        .map(|(bank, terms)| (bank, terms.into_iter().map(|(t, _)| t).collect()))
        .collect()
}

/// Flatten per-group ranked terms into exportable rows (rank starts at 1).
pub fn top_term_table(scored: &BTreeMap<String, Vec<(String, f64)>>) -> Vec<TopTerm> {
    let mut rows = Vec::new();
    for (bank, terms) in scored {
        for (rank, (term, score)) in terms.iter().enumerate() {
            rows.push(TopTerm {
                bank: bank.clone(),
                term: term.clone(),
                score: *score,
                rank: rank + 1,
            });
        }
    }
    rows
}

/// Fit a single vectorizer over the whole corpus, ignoring groups. Used to
/// build the global candidate vocabulary that row tagging matches against.
pub fn global_candidates(records: &[ReviewRecord], opts: &TfidfOptions) -> Vec<String> {
    let docs: Vec<&str> = records.iter().map(|r| r.normalized.as_str()).collect();
    fit_group(&docs, opts).into_iter().map(|(t, _)| t).collect()
}

/// Fit one group's documents and return terms ranked by mean tf-idf weight,
/// descending, with an alphabetical tiebreak. Empty input, or an empty
/// vocabulary after the document-frequency floor, yields an empty list.
fn fit_group(docs: &[&str], opts: &TfidfOptions) -> Vec<(String, f64)> {
    if docs.is_empty() {
        return Vec::new();
    }

    // Per-document term counts and corpus-wide document frequency.
    let mut doc_counts: Vec<HashMap<String, f64>> = Vec::with_capacity(docs.len());
    let mut df: HashMap<String, usize> = HashMap::new();
    let mut corpus_freq: HashMap<String, f64> = HashMap::new();
    for doc in docs {
        let tokens: Vec<&str> = doc.split_whitespace().collect();
        let mut counts: HashMap<String, f64> = HashMap::new();
        for gram in ngrams(&tokens, opts.ngram_range) {
            *counts.entry(gram).or_insert(0.0) += 1.0;
        }
        for (term, c) in &counts {
            *df.entry(term.clone()).or_insert(0) += 1;
            *corpus_freq.entry(term.clone()).or_insert(0.0) += c;
        }
        doc_counts.push(counts);
    }

    // Degrade gracefully: a group smaller than min_df uses a floor of 1.
    let min_df = if docs.len() < opts.min_df { 1 } else { opts.min_df };
    let mut vocab: Vec<String> = df
        .iter()
        .filter(|(_, d)| **d >= min_df)
        .map(|(t, _)| t.clone())
        .collect();
    if vocab.is_empty() {
        return Vec::new();
    }
    if vocab.len() > opts.max_features {
        vocab.sort_by(|a, b| {
            let fa = corpus_freq.get(a).copied().unwrap_or(0.0);
            let fb = corpus_freq.get(b).copied().unwrap_or(0.0);
            fb.partial_cmp(&fa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.cmp(b))
        });
        vocab.truncate(opts.max_features);
    }
    let vocab: HashSet<String> = vocab.into_iter().collect();

    let n = docs.len() as f64;
    let idf: HashMap<&String, f64> = vocab
        .iter()
        .map(|t| {
            let d = df.get(t).copied().unwrap_or(0) as f64;
            (t, ((1.0 + n) / (1.0 + d)).ln() + 1.0)
        })
        .collect();

    // Mean of l2-normalized tf-idf rows.
    let mut sums: HashMap<&String, f64> = HashMap::new();
    for counts in &doc_counts {
        let weights: Vec<(&String, f64)> = counts
            .iter()
            .filter_map(|(t, c)| {
                vocab
                    .get(t)
                    .and_then(|t| idf.get(t).map(|i| (t, c * i)))
            })
            .collect();
        let norm = weights.iter().map(|(_, w)| w * w).sum::<f64>().sqrt();
        if norm == 0.0 {
            continue;
        }
        for (t, w) in weights {
            *sums.entry(t).or_insert(0.0) += w / norm;
        }
    }

    let mut ranked: Vec<(String, f64)> = vocab
        .iter()
        .map(|t| (t.clone(), sums.get(t).copied().unwrap_or(0.0) / n))
        .collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    ranked.truncate(opts.top_n);
    ranked
}

fn ngrams(tokens: &[&str], range: (usize, usize)) -> Vec<String> {
    let (lo, hi) = (range.0.max(1), range.1.max(range.0));
    let mut out = Vec::new();
    for n in lo..=hi {
        for window in tokens.windows(n) {
            out.push(window.join(" "));
        }
    }
    out
}

/// Whole-word keyword matcher over a candidate vocabulary.
///
/// Candidates are scanned in specificity order: multi-word terms first,
/// then longer before shorter, then lexicographic for determinism.
pub struct KeywordTagger {
    patterns: Vec<(String, Regex)>,
}

impl KeywordTagger {
    /// Compile candidates into boundary-respecting, case-insensitive
    /// matchers. Candidates that fail to compile are skipped with a
    /// warning, not fatal.
    pub fn compile(candidates: &[String]) -> Self {
        let mut ordered: Vec<&String> = candidates.iter().collect();
        ordered.sort_by(|a, b| {
            let multi_a = a.contains(' ');
            let multi_b = b.contains(' ');
            multi_b
                .cmp(&multi_a)
                .then_with(|| b.len().cmp(&a.len()))
                .then_with(|| a.cmp(b))
        });

        let mut patterns = Vec::with_capacity(ordered.len());
        for term in ordered {
            if term.trim().is_empty() {
                continue;
            }
            match Regex::new(&format!(r"(?i)\b{}\b", regex::escape(term))) {
                Ok(re) => patterns.push((term.clone(), re)),
                Err(e) => warn!("invalid keyword pattern '{term}': {e}"),
            }
        }
        Self { patterns }
    }

    /// Scan normalized text for up to `top_k` candidate occurrences, in
    /// priority order. No match yields an empty list, not an error.
    pub fn tag(&self, text: &str, top_k: usize) -> Vec<String> {
        if text.is_empty() || top_k == 0 {
            return Vec::new();
        }
        let mut found = Vec::new();
        for (term, re) in &self.patterns {
            if re.is_match(text) {
                found.push(term.clone());
                if found.len() >= top_k {
                    break;
                }
            }
        }
        found
    }
}

/// Set the keyword field on every record from a compiled candidate set.
pub fn tag_rows(records: &mut [ReviewRecord], tagger: &KeywordTagger, top_k: usize) {
    for r in records {
        r.keywords = tagger.tag(&r.normalized, top_k);
    }
}
