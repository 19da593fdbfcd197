//! Per-bank/per-theme/per-month rollups and example-quote selection.
//!
//! Everything here is recomputed fresh from the annotated relation on each
//! reporting run; there is no incremental state.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use log::info;
use serde::Serialize;

use crate::ReviewRecord;

/// Theme share of one bank: row count and percentage of the bank's rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThemeShareRow {
    pub bank: String,
    pub theme: String,
    pub count: usize,
    pub pct: f64,
}

/// One point of the per-bank monthly sentiment time series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlySentimentRow {
    pub bank: String,
    /// First day of the calendar month.
    pub month: NaiveDate,
    /// Mean over rows with a sentiment score; `None` if no row in the
    /// bucket carries one.
    pub avg_sentiment: Option<f64>,
    pub count: usize,
}

/// Theme share joined with mean sentiment for that (bank, theme) subset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThemeSentimentRow {
    pub bank: String,
    pub theme: String,
    pub pct: f64,
    pub avg_sentiment: Option<f64>,
    pub cnt: usize,
}

/// A representative or pain-point quote for one (scope, theme) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExampleQuote {
    pub bank: String,
    pub review: String,
    pub rating: Option<u8>,
    pub sentiment_score: Option<f64>,
    pub date: Option<NaiveDate>,
    pub matched_theme: String,
    /// "global" or the bank name the selection was restricted to.
    pub scope: String,
}

/// Quote selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum QuoteMode {
    /// Most negative sentiment first, for pain-point reporting.
    #[default]
    MostNegative,
    /// Score closest to the subset's mean.
    Representative,
}

/// Row counts per bank, logged and returned for the run report.
pub fn sample_sizes(records: &[ReviewRecord]) -> Vec<(String, usize)> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for r in records {
        *counts.entry(&r.bank).or_insert(0) += 1;
    }
    let sizes: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(bank, n)| (bank.to_string(), n))
        .collect();
    for (bank, n) in &sizes {
        info!("sample size for '{bank}': {n} reviews");
    }
    sizes
}

/// Theme share per bank. `pct` divides by the bank's total row count, not
/// the grand total, so multi-label overlap may push a bank's percentages
/// past 100 while a single-label partition sums to 100.
pub fn theme_share(records: &[ReviewRecord]) -> Vec<ThemeShareRow> {
    let mut banks: BTreeMap<&str, (usize, BTreeMap<&str, usize>)> = BTreeMap::new();
    for r in records {
        let entry = banks.entry(&r.bank).or_default();
        entry.0 += 1;
        for theme in &r.themes {
            if theme.is_empty() {
                continue;
            }
            *entry.1.entry(theme).or_insert(0) += 1;
        }
    }

    let mut rows = Vec::new();
    for (bank, (total, counts)) in banks {
        if total == 0 {
            continue;
        }
        let mut bank_rows: Vec<ThemeShareRow> = counts
            .into_iter()
            .map(|(theme, count)| ThemeShareRow {
                bank: bank.to_string(),
                theme: theme.to_string(),
                count,
                pct: 100.0 * count as f64 / total as f64,
            })
            .collect();
        bank_rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.theme.cmp(&b.theme)));
        rows.extend(bank_rows);
    }
    rows
}

/// Bucket sentiment by calendar month per bank. Rows without a date are
/// skipped; rows without a score count toward `count` but not the mean.
pub fn monthly_sentiment(records: &[ReviewRecord]) -> Vec<MonthlySentimentRow> {
    let mut buckets: BTreeMap<(&str, NaiveDate), (f64, usize, usize)> = BTreeMap::new();
    for r in records {
        let Some(date) = r.date else { continue };
        let Some(month) = NaiveDate::from_ymd_opt(date.year(), date.month(), 1) else {
            continue;
        };
        let entry = buckets.entry((&r.bank, month)).or_insert((0.0, 0, 0));
        entry.2 += 1;
        if let Some(s) = &r.sentiment {
            entry.0 += s.score;
            entry.1 += 1;
        }
    }
    buckets
        .into_iter()
        .map(|((bank, month), (sum, scored, count))| MonthlySentimentRow {
            bank: bank.to_string(),
            month,
            avg_sentiment: (scored > 0).then(|| sum / scored as f64),
            count,
        })
        .collect()
}

/// Join theme shares with mean sentiment per (bank, theme), dropping
/// subsets below `min_samples`. Sorted by bank ascending, share descending.
pub fn theme_sentiment_summary(
    shares: &[ThemeShareRow],
    records: &[ReviewRecord],
    min_samples: usize,
) -> Vec<ThemeSentimentRow> {
    let mut rows = Vec::new();
    for share in shares {
        if share.count < min_samples {
            continue;
        }
        let mut sum = 0.0;
        let mut scored = 0usize;
        for r in records {
            if r.bank != share.bank || !r.themes.iter().any(|t| t == &share.theme) {
                continue;
            }
            if let Some(s) = &r.sentiment {
                sum += s.score;
                scored += 1;
            }
        }
        rows.push(ThemeSentimentRow {
            bank: share.bank.clone(),
            theme: share.theme.clone(),
            pct: share.pct,
            avg_sentiment: (scored > 0).then(|| sum / scored as f64),
            cnt: share.count,
        });
    }
    rows.sort_by(|a, b| {
        a.bank.cmp(&b.bank).then_with(|| {
            b.pct
                .partial_cmp(&a.pct)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    });
    rows
}

/// Select up to `n` example quotes for one theme, optionally restricted to
/// one bank. Theme matching is a case-insensitive substring test so that
/// "Stability" also finds "Stability/Reliability". Review text is cut to a
/// display-friendly length with an ellipsis marker.
pub fn example_quotes(
    records: &[ReviewRecord],
    bank: Option<&str>,
    theme: &str,
    n: usize,
    mode: QuoteMode,
    max_len: usize,
) -> Vec<ExampleQuote> {
    let needle = theme.to_lowercase();
    let mut matches: Vec<&ReviewRecord> = records
        .iter()
        .filter(|r| bank.is_none_or(|b| r.bank == b))
        .filter(|r| r.themes.iter().any(|t| t.to_lowercase().contains(&needle)))
        .collect();
    if matches.is_empty() {
        return Vec::new();
    }

    let score_of = |r: &ReviewRecord| r.sentiment.as_ref().map_or(0.0, |s| s.score);
    match mode {
        QuoteMode::MostNegative => {
            matches.sort_by(|a, b| {
                score_of(a)
                    .partial_cmp(&score_of(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        QuoteMode::Representative => {
            let mean =
                matches.iter().map(|r| score_of(r)).sum::<f64>() / matches.len() as f64;
            matches.sort_by(|a, b| {
                (score_of(a) - mean)
                    .abs()
                    .partial_cmp(&(score_of(b) - mean).abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
    }

    matches
        .into_iter()
        .take(n)
        .map(|r| ExampleQuote {
            bank: r.bank.clone(),
            review: truncate_display(&r.review, max_len),
            rating: r.rating,
            sentiment_score: r.sentiment.as_ref().map(|s| s.score),
            date: r.date,
            matched_theme: theme.to_string(),
            scope: bank.unwrap_or("global").to_string(),
        })
        .collect()
}

/// Global and per-bank quotes for every theme of interest, in theme order.
pub fn collect_example_quotes(
    records: &[ReviewRecord],
    themes: &[String],
    n: usize,
    mode: QuoteMode,
    max_len: usize,
) -> Vec<ExampleQuote> {
    let mut banks: Vec<&str> = records.iter().map(|r| r.bank.as_str()).collect();
    banks.sort_unstable();
    banks.dedup();

    let mut out = Vec::new();
    for theme in themes {
        out.extend(example_quotes(records, None, theme, n, mode, max_len));
        for bank in &banks {
            out.extend(example_quotes(records, Some(bank), theme, n, mode, max_len));
        }
    }
    out
}

/// Cut text for display on a character boundary, appending `…` when
/// anything was removed.
pub fn truncate_display(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => {
            let mut s = text[..byte_idx].trim_end().to_string();
            s.push('…');
            s
        }
        None => text.to_string(),
    }
}
