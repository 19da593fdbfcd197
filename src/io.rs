//! Input relation loading and table export.
//!
//! Loading coerces malformed ratings/dates to null and excludes unusable
//! rows locally — only an entirely missing required column is a hard stop,
//! since nothing downstream can proceed without it.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use log::{debug, info};
use serde::Serialize;

use crate::aggregate::{ExampleQuote, MonthlySentimentRow, ThemeSentimentRow, ThemeShareRow};
use crate::keywords::TopTerm;
use crate::{PipelineError, ReviewRecord};

/// Output format for exported tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ExportFormat {
    #[default]
    Csv,
    Tsv,
    Json,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Tsv => "tsv",
            ExportFormat::Json => "json",
        }
    }
}

/// Neutralize spreadsheet formula injection: cells starting with `=`, `+`,
/// `-`, or `@` get a leading single quote unless one is already there.
pub fn csv_safe_cell(cell: String) -> String {
    if cell.starts_with(['=', '+', '-', '@']) && !cell.starts_with('\'') {
        format!("'{cell}")
    } else {
        cell
    }
}

/// Outcome of loading the input relation, with per-category exclusion and
/// coercion counts for the log.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub records: Vec<ReviewRecord>,
    pub skipped_short: usize,
    pub skipped_duplicates: usize,
    pub coerced_ratings: usize,
    pub coerced_dates: usize,
}

/// Aliases accepted for each logical input column, checked in order.
const TEXT_ALIASES: &[&str] = &["review", "review_text", "content"];
const GROUP_ALIASES: &[&str] = &["bank", "app", "app_name"];
const RATING_ALIASES: &[&str] = &["rating", "score", "stars"];
const DATE_ALIASES: &[&str] = &["date", "review_date", "at"];
const ID_ALIASES: &[&str] = &["review_id", "id"];

/// Read the review relation from a CSV file.
///
/// `text_col` and `group_col` are tried first, then the standard aliases.
/// A missing text or group column is a [`PipelineError::MissingColumn`]
/// hard stop; everything else degrades row by row.
pub fn read_reviews_csv(
    path: &Path,
    text_col: &str,
    group_col: &str,
) -> Result<LoadReport, PipelineError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_lowercase())
        .collect();

    let find = |preferred: &str, aliases: &[&str]| -> Option<usize> {
        std::iter::once(preferred)
            .chain(aliases.iter().copied())
            .find_map(|name| headers.iter().position(|h| h == name))
    };

    let text_idx = find(text_col, TEXT_ALIASES)
        .ok_or_else(|| PipelineError::MissingColumn(text_col.to_string()))?;
    let group_idx = find(group_col, GROUP_ALIASES)
        .ok_or_else(|| PipelineError::MissingColumn(group_col.to_string()))?;
    let rating_idx = find("rating", RATING_ALIASES);
    let date_idx = find("date", DATE_ALIASES);
    let id_idx = find("review_id", ID_ALIASES);

    let mut report = LoadReport::default();
    let mut seen_ids = std::collections::HashSet::new();

    for (row_no, result) in reader.records().enumerate() {
        let row = result?;
        let get = |idx: usize| row.get(idx).unwrap_or("").trim();

        let review = get(text_idx).to_string();
        if review.chars().count() <= 2 {
            report.skipped_short += 1;
            continue;
        }

        let id = match id_idx {
            Some(idx) if !get(idx).is_empty() => get(idx).to_string(),
            _ => (row_no + 1).to_string(),
        };
        if id_idx.is_some() && !seen_ids.insert(id.clone()) {
            report.skipped_duplicates += 1;
            continue;
        }

        let rating = rating_idx.and_then(|idx| {
            let raw = get(idx);
            if raw.is_empty() {
                return None;
            }
            match parse_rating(raw) {
                Some(r) => Some(r),
                None => {
                    debug!("row {}: unparseable rating '{raw}' coerced to null", row_no + 1);
                    report.coerced_ratings += 1;
                    None
                }
            }
        });

        let date = date_idx.and_then(|idx| {
            let raw = get(idx);
            if raw.is_empty() {
                return None;
            }
            match parse_date(raw) {
                Some(d) => Some(d),
                None => {
                    debug!("row {}: unparseable date '{raw}' coerced to null", row_no + 1);
                    report.coerced_dates += 1;
                    None
                }
            }
        });

        let mut record = ReviewRecord::new(id, get(group_idx), review);
        record.rating = rating;
        record.date = date;
        report.records.push(record);
    }

    info!(
        "loaded {} reviews from {} ({} short rows skipped, {} duplicates, {} ratings and {} dates coerced to null)",
        report.records.len(),
        path.display(),
        report.skipped_short,
        report.skipped_duplicates,
        report.coerced_ratings,
        report.coerced_dates,
    );
    Ok(report)
}

/// Ratings are 1–5 stars; anything else (including out-of-range numerics)
/// maps to null.
fn parse_rating(raw: &str) -> Option<u8> {
    let value: f64 = raw.parse().ok()?;
    if (1.0..=5.0).contains(&value) {
        Some(value.round() as u8)
    } else {
        None
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y/%m/%d"))
        .ok()
        .or_else(|| {
            chrono::DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.date_naive())
                .ok()
        })
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .map(|dt| dt.date())
                .ok()
        })
}

/// A row type exportable as a delimited table. Implementations sanitize
/// their free-text cells; numeric cells stay untouched.
pub trait TableRow {
    fn headers() -> &'static [&'static str];
    fn cells(&self) -> Vec<String>;
}

fn opt_cell<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

fn opt_float_cell(value: &Option<f64>) -> String {
    value.map(|v| format!("{v:.4}")).unwrap_or_default()
}

impl TableRow for ReviewRecord {
    fn headers() -> &'static [&'static str] {
        &[
            "review_id",
            "bank",
            "review",
            "rating",
            "date",
            "keywords",
            "theme_primary",
            "theme_secondary",
            "themes",
            "sentiment_label",
            "sentiment_score",
        ]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            csv_safe_cell(self.id.clone()),
            csv_safe_cell(self.bank.clone()),
            csv_safe_cell(self.review.clone()),
            opt_cell(&self.rating),
            opt_cell(&self.date),
            csv_safe_cell(self.keywords.join("|")),
            csv_safe_cell(self.theme_primary().unwrap_or("").to_string()),
            csv_safe_cell(self.theme_secondary().unwrap_or("").to_string()),
            csv_safe_cell(self.themes.join("|")),
            self.sentiment
                .as_ref()
                .map(|s| s.label.to_string())
                .unwrap_or_default(),
            opt_float_cell(&self.sentiment.as_ref().map(|s| s.score)),
        ]
    }
}

impl TableRow for TopTerm {
    fn headers() -> &'static [&'static str] {
        &["bank", "term", "score", "rank"]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            csv_safe_cell(self.bank.clone()),
            csv_safe_cell(self.term.clone()),
            format!("{:.6}", self.score),
            self.rank.to_string(),
        ]
    }
}

impl TableRow for ThemeShareRow {
    fn headers() -> &'static [&'static str] {
        &["bank", "theme", "count", "pct"]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            csv_safe_cell(self.bank.clone()),
            csv_safe_cell(self.theme.clone()),
            self.count.to_string(),
            format!("{:.2}", self.pct),
        ]
    }
}

impl TableRow for MonthlySentimentRow {
    fn headers() -> &'static [&'static str] {
        &["bank", "month", "avg_sentiment", "count"]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            csv_safe_cell(self.bank.clone()),
            self.month.format("%Y-%m-%d").to_string(),
            opt_float_cell(&self.avg_sentiment),
            self.count.to_string(),
        ]
    }
}

impl TableRow for ThemeSentimentRow {
    fn headers() -> &'static [&'static str] {
        &["bank", "theme", "pct", "avg_sentiment", "cnt"]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            csv_safe_cell(self.bank.clone()),
            csv_safe_cell(self.theme.clone()),
            format!("{:.2}", self.pct),
            opt_float_cell(&self.avg_sentiment),
            self.cnt.to_string(),
        ]
    }
}

impl TableRow for ExampleQuote {
    fn headers() -> &'static [&'static str] {
        &[
            "bank",
            "review",
            "rating",
            "sentiment_score",
            "date",
            "matched_theme",
            "scope",
        ]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            csv_safe_cell(self.bank.clone()),
            csv_safe_cell(self.review.clone()),
            opt_cell(&self.rating),
            opt_float_cell(&self.sentiment_score),
            opt_cell(&self.date),
            csv_safe_cell(self.matched_theme.clone()),
            csv_safe_cell(self.scope.clone()),
        ]
    }
}

/// Path of one output table inside `out_dir`.
pub fn output_path(out_dir: &Path, name: &str, format: ExportFormat) -> PathBuf {
    out_dir.join(format!("{name}.{}", format.extension()))
}

/// Write one table in the selected format. CSV/TSV cells go through the
/// sanitizer; JSON keeps the raw values.
pub fn write_table<T: TableRow + Serialize>(
    rows: &[T],
    out_dir: &Path,
    name: &str,
    format: ExportFormat,
) -> Result<PathBuf, PipelineError> {
    fs::create_dir_all(out_dir)?;
    let path = output_path(out_dir, name, format);
    match format {
        ExportFormat::Json => {
            let file = File::create(&path)?;
            serde_json::to_writer_pretty(BufWriter::new(file), rows)?;
        }
        ExportFormat::Csv | ExportFormat::Tsv => {
            let delimiter = if format == ExportFormat::Tsv { b'\t' } else { b',' };
            let mut writer = csv::WriterBuilder::new()
                .delimiter(delimiter)
                .from_path(&path)?;
            writer.write_record(T::headers())?;
            for row in rows {
                writer.write_record(row.cells())?;
            }
            writer.flush()?;
        }
    }
    info!("wrote {}", path.display());
    Ok(path)
}
