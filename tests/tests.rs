//! Integration tests for `review_insights`.
//
// This suite verifies:
// - Library behavior (pipeline end-to-end, engine selection, reconciliation,
//   batch failure handling, sequential degradation)
// - Input loading (column aliases, coercions, duplicate handling)
// - CLI behavior including export formats and failure modes
//
// Notes:
// - CLI tests pass explicit --out-dir paths; no global CWD changes.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use assert_cmd::prelude::*;
use assert_fs::prelude::*;
use predicates::prelude::*;
use serde_json::Value as Json;

use review_insights::sentiment::{EngineError, ModelScore, annotate_with_model};
use review_insights::{
    EngineChoice, ModelBackend, ModelPrediction, PipelineError, PipelineOptions, ReviewRecord,
    SentimentLabel, ThemeRule, default_rules, read_reviews_csv, run_pipeline,
};

// --------------------- helpers ---------------------

/// Create a file with content in a temp dir.
fn write_file(dir: &assert_fs::TempDir, name: &str, content: &str) -> PathBuf {
    let f = dir.child(name);
    f.write_str(content).unwrap();
    f.path().to_path_buf()
}

fn read_to_string<P: AsRef<Path>>(p: P) -> String {
    fs::read_to_string(p).unwrap()
}

/// A small review relation covering two banks, both themes, and a mix of
/// polarities.
fn sample_csv() -> &'static str {
    "review_id,bank,review,rating,date\n\
     r1,Alpha,App crashes constantly after the update,1,2024-01-05\n\
     r2,Alpha,Fast transfers and easy to use interface,5,2024-01-20\n\
     r3,Alpha,Cannot login since the update. Terrible.,1,2024-02-02\n\
     r4,Beta,Love this app. Transfers are quick and reliable,5,2024-01-11\n\
     r5,Beta,Payment failed twice and support never responds,2,2024-02-15\n\
     r6,Beta,Good design but the loading is slow,3,2024-02-28\n"
}

fn sample_records() -> Vec<ReviewRecord> {
    let mut rows = Vec::new();
    for (id, bank, review, rating, date) in [
        ("r1", "Alpha", "App crashes constantly after the update", 1, "2024-01-05"),
        ("r2", "Alpha", "Fast transfers and easy to use interface", 5, "2024-01-20"),
        ("r3", "Alpha", "Cannot login since the update. Terrible.", 1, "2024-02-02"),
        ("r4", "Beta", "Love this app. Transfers are quick and reliable", 5, "2024-01-11"),
        ("r5", "Beta", "Payment failed twice and support never responds", 2, "2024-02-15"),
        ("r6", "Beta", "Good design but the loading is slow", 3, "2024-02-28"),
    ] {
        let mut r = ReviewRecord::new(id, bank, review);
        r.rating = Some(rating);
        r.date = chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok();
        rows.push(r);
    }
    rows
}

fn small_opts() -> PipelineOptions {
    PipelineOptions {
        min_df: 1,
        quote_count: 2,
        ..Default::default()
    }
}

fn run_cli_ok(args: &[&str]) -> assert_cmd::assert::Assert {
    let mut cmd = assert_cmd::Command::cargo_bin("review_insights").unwrap();
    cmd.args(args).assert().success()
}

fn run_cli_fail(args: &[&str]) -> assert_cmd::assert::Assert {
    let mut cmd = assert_cmd::Command::cargo_bin("review_insights").unwrap();
    cmd.args(args).assert().failure()
}

/// Backend returning a fixed label/confidence for every input.
struct FixedBackend {
    label: &'static str,
    confidence: f64,
}

impl ModelBackend for FixedBackend {
    fn classify_batch(&self, texts: &[&str]) -> Result<Vec<ModelPrediction>, EngineError> {
        Ok(texts
            .iter()
            .map(|_| ModelPrediction {
                label: self.label.to_string(),
                confidence: self.confidence,
            })
            .collect())
    }
}

// --------------------- pipeline tests ---------------------

#[test]
fn lexicon_pipeline_end_to_end() {
    let out = run_pipeline(sample_records(), &default_rules(), &small_opts(), None).unwrap();

    assert_eq!(out.records.len(), 6);
    assert!((out.sentiment_coverage - 1.0).abs() < 1e-9);
    assert_eq!(out.failed_batches, 0);

    let r1 = &out.records[0];
    assert_eq!(r1.sentiment.unwrap().label, SentimentLabel::Negative);
    assert_eq!(r1.theme_primary(), Some("Stability"));

    let r2 = &out.records[1];
    assert_eq!(r2.sentiment.unwrap().label, SentimentLabel::Positive);
    assert!(r2.themes.iter().any(|t| t == "Performance"));
    assert!(r2.themes.iter().any(|t| t == "Payments"));

    // Both banks appear in sample sizes and top terms.
    assert_eq!(out.sample_sizes, vec![("Alpha".to_string(), 3), ("Beta".to_string(), 3)]);
    assert!(out.top_terms.iter().any(|t| t.bank == "Alpha"));
    assert!(out.top_terms.iter().any(|t| t.bank == "Beta"));
    // Top terms from one bank never come from the other's documents only.
    assert!(out.group_terms.contains_key("Alpha"));

    // Monthly buckets land on the first of the month.
    assert!(out.monthly.iter().all(|m| m.month.format("%d").to_string() == "01"));

    assert!(!out.quotes.is_empty());
}

#[test]
fn multi_label_order_follows_rule_declaration() {
    // "Stability" is declared before "Performance"; a row matching both
    // gets Stability as its primary theme regardless of text order.
    let mut r = ReviewRecord::new("1", "Alpha", "Fast app until it crashes");
    r.rating = Some(3);
    let out = run_pipeline(vec![r], &default_rules(), &small_opts(), None).unwrap();
    assert_eq!(out.records[0].theme_primary(), Some("Stability"));
    assert_eq!(out.records[0].theme_secondary(), Some("Performance"));
}

#[test]
fn crash_and_praise_rows_get_opposite_annotations() {
    let rules = vec![
        ThemeRule::new("Stability", &["crash"]),
        ThemeRule::new("Performance", &["fast"]),
    ];
    let mut r1 = ReviewRecord::new("1", "A", "App crashes on login");
    r1.rating = Some(1);
    let mut r2 = ReviewRecord::new("2", "A", "Fast transfers, love it");
    r2.rating = Some(5);

    let out = run_pipeline(vec![r1, r2], &rules, &small_opts(), None).unwrap();

    assert_eq!(out.records[0].theme_primary(), Some("Stability"));
    assert_eq!(out.records[1].theme_primary(), Some("Performance"));

    let s1 = out.records[0].sentiment.unwrap();
    assert_eq!(s1.label, SentimentLabel::Negative);
    assert!(s1.score < 0.0);
    let s2 = out.records[1].sentiment.unwrap();
    assert_eq!(s2.label, SentimentLabel::Positive);
    assert!(s2.score > 0.0);
}

#[test]
fn stemming_lets_rules_match_inflected_text() {
    // Rule phrase "crash" vs review text "crashes": both normalize to the
    // same stem, so the theme still applies.
    let rules = vec![ThemeRule::new("Stability", &["crash"])];
    let r = ReviewRecord::new("1", "Alpha", "It crashes every single day");
    let out = run_pipeline(vec![r], &rules, &small_opts(), None).unwrap();
    assert_eq!(out.records[0].themes, vec!["Stability".to_string()]);
}

#[test]
fn model_engine_without_backend_is_a_config_error() {
    let opts = PipelineOptions {
        engine: EngineChoice::Model,
        ..small_opts()
    };
    let err = run_pipeline(sample_records(), &default_rules(), &opts, None).unwrap_err();
    assert!(matches!(err, PipelineError::Config(_)));
}

#[test]
fn model_engine_annotates_every_row() {
    let backend = FixedBackend {
        label: "negative",
        confidence: 0.8,
    };
    let opts = PipelineOptions {
        engine: EngineChoice::Model,
        batch_size: 2,
        ..small_opts()
    };
    let out = run_pipeline(sample_records(), &default_rules(), &opts, Some(&backend)).unwrap();
    for r in &out.records {
        let s = r.sentiment.unwrap();
        assert_eq!(s.label, SentimentLabel::Negative);
        assert!((s.score + 0.8).abs() < 1e-12);
    }
}

#[test]
fn both_engines_reconcile_by_confidence() {
    // Confident model overrides the lexicon everywhere.
    let confident = FixedBackend {
        label: "negative",
        confidence: 0.95,
    };
    let opts = PipelineOptions {
        engine: EngineChoice::Both,
        ..small_opts()
    };
    let out =
        run_pipeline(sample_records(), &default_rules(), &opts, Some(&confident)).unwrap();
    assert!(out
        .records
        .iter()
        .all(|r| r.sentiment.unwrap().label == SentimentLabel::Negative));

    // An unsure model leaves the lexicon's verdicts in place.
    let unsure = FixedBackend {
        label: "negative",
        confidence: 0.3,
    };
    let out = run_pipeline(sample_records(), &default_rules(), &opts, Some(&unsure)).unwrap();
    assert_eq!(
        out.records[1].sentiment.unwrap().label,
        SentimentLabel::Positive
    );
}

// --------------------- batching tests ---------------------

/// Fails any batch containing the poison marker.
struct PoisonBackend;

impl ModelBackend for PoisonBackend {
    fn classify_batch(&self, texts: &[&str]) -> Result<Vec<ModelPrediction>, EngineError> {
        if texts.iter().any(|t| t.contains("BOOM")) {
            return Err(EngineError::Scoring("poisoned batch".to_string()));
        }
        Ok(texts
            .iter()
            .map(|_| ModelPrediction {
                label: "positive".to_string(),
                confidence: 0.9,
            })
            .collect())
    }
}

#[test]
fn failed_batch_degrades_to_neutral_without_aborting() {
    let texts: Vec<String> = vec![
        "good".into(),
        "good".into(),
        "BOOM".into(),
        "good".into(),
        "good".into(),
        "good".into(),
    ];
    let run = annotate_with_model(&texts, &PoisonBackend, 2, 2);
    assert_eq!(run.scores.len(), 6);
    assert_eq!(run.failed_batches, 1);
    // Rows 2..4 were in the failed batch and fall back to neutral.
    assert_eq!(run.scores[2], ModelScore::neutral());
    assert_eq!(run.scores[3], ModelScore::neutral());
    // Other batches are unaffected.
    assert_eq!(run.scores[0].sentiment.label, SentimentLabel::Positive);
    assert_eq!(run.scores[5].sentiment.label, SentimentLabel::Positive);
}

/// Declares itself unsafe for concurrent calls and records overlap.
struct SequentialOnlyBackend {
    active: AtomicUsize,
    overlaps: AtomicUsize,
    order: Mutex<Vec<usize>>,
}

impl SequentialOnlyBackend {
    fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            overlaps: AtomicUsize::new(0),
            order: Mutex::new(Vec::new()),
        }
    }
}

impl ModelBackend for SequentialOnlyBackend {
    fn classify_batch(&self, texts: &[&str]) -> Result<Vec<ModelPrediction>, EngineError> {
        if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.order.lock().unwrap().push(texts.len());
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|_| ModelPrediction {
                label: "neutral".to_string(),
                confidence: 0.5,
            })
            .collect())
    }

    fn concurrent_safe(&self) -> bool {
        false
    }
}

#[test]
fn concurrent_unsafe_backend_runs_batches_sequentially() {
    let backend = SequentialOnlyBackend::new();
    let texts: Vec<String> = (0..10).map(|i| format!("review {i}")).collect();
    let run = annotate_with_model(&texts, &backend, 3, 4);
    assert_eq!(run.scores.len(), 10);
    assert_eq!(backend.overlaps.load(Ordering::SeqCst), 0);
    // Submission order is preserved: 3, 3, 3, then the 1-row remainder.
    assert_eq!(*backend.order.lock().unwrap(), vec![3, 3, 3, 1]);
}

// --------------------- input loading tests ---------------------

#[test]
fn loader_accepts_aliased_columns_and_coerces_bad_values() {
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_file(
        &dir,
        "aliased.csv",
        "id,app_name,content,stars,at\n\
         1,Alpha,Great app overall,5,2024-03-01\n\
         2,Alpha,Constant crashes lately,eleven,2024-03-02\n\
         3,Alpha,Slow loading screens,4,yesterday\n\
         4,Alpha,ok,3,2024-03-04\n\
         1,Alpha,Duplicate of the first row,5,2024-03-05\n",
    );
    let report = read_reviews_csv(&path, "review", "bank").unwrap();
    assert_eq!(report.records.len(), 3);
    assert_eq!(report.skipped_short, 1);
    assert_eq!(report.skipped_duplicates, 1);
    assert_eq!(report.coerced_ratings, 1);
    assert_eq!(report.coerced_dates, 1);
    assert_eq!(report.records[1].rating, None);
    assert_eq!(report.records[2].date, None);
}

#[test]
fn loader_counts_characters_not_bytes_for_short_rows() {
    // Two emoji are eight bytes but still only two characters; the row is
    // just as unusable as "ok" and must be excluded the same way.
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_file(
        &dir,
        "emoji.csv",
        "bank,review\nAlpha,😡😡\nAlpha,Great app overall\n",
    );
    let report = read_reviews_csv(&path, "review", "bank").unwrap();
    assert_eq!(report.records.len(), 1);
    assert_eq!(report.skipped_short, 1);
    assert_eq!(report.records[0].review, "Great app overall");
}

#[test]
fn loader_requires_text_and_group_columns() {
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_file(&dir, "broken.csv", "foo,bar\n1,2\n");
    let err = read_reviews_csv(&path, "review", "bank").unwrap_err();
    assert!(matches!(err, PipelineError::MissingColumn(_)));
}

#[test]
fn loader_falls_back_to_row_index_ids() {
    let dir = assert_fs::TempDir::new().unwrap();
    let path = write_file(
        &dir,
        "noid.csv",
        "bank,review\nAlpha,Great app overall\nAlpha,Crashes a lot\n",
    );
    let report = read_reviews_csv(&path, "review", "bank").unwrap();
    assert_eq!(report.records[0].id, "1");
    assert_eq!(report.records[1].id, "2");
}

// --------------------- CLI tests ---------------------

#[test]
fn cli_writes_all_tables() {
    let dir = assert_fs::TempDir::new().unwrap();
    let input = write_file(&dir, "reviews.csv", sample_csv());
    let out_dir = dir.child("out");

    run_cli_ok(&[
        input.to_str().unwrap(),
        "--out-dir",
        out_dir.path().to_str().unwrap(),
        "--min-df",
        "1",
    ])
    .stdout(predicate::str::contains("Reviews annotated: 6"));

    for name in [
        "reviews_annotated",
        "tfidf_top_terms",
        "theme_summary_by_bank",
        "monthly_sentiment_by_bank",
        "theme_sentiment_summary",
        "theme_example_quotes",
    ] {
        out_dir.child(format!("{name}.csv")).assert(predicate::path::exists());
    }

    let annotated = read_to_string(out_dir.child("reviews_annotated.csv").path());
    assert!(annotated.contains("sentiment_label"));
    assert!(annotated.contains("negative"));
}

#[test]
fn cli_json_export_is_valid_json() {
    let dir = assert_fs::TempDir::new().unwrap();
    let input = write_file(&dir, "reviews.csv", sample_csv());
    let out_dir = dir.child("out");

    run_cli_ok(&[
        input.to_str().unwrap(),
        "--out-dir",
        out_dir.path().to_str().unwrap(),
        "--export-format",
        "json",
        "--min-df",
        "1",
    ]);

    let s = read_to_string(out_dir.child("theme_summary_by_bank.json").path());
    let v: Json = serde_json::from_str(&s).expect("valid json");
    let rows = v.as_array().expect("json array");
    assert!(rows.iter().any(|r| r["bank"] == "Alpha"));
}

#[test]
fn cli_fails_on_missing_column() {
    let dir = assert_fs::TempDir::new().unwrap();
    let input = write_file(&dir, "bad.csv", "foo,bar\n1,2\n");
    let out_dir = dir.child("out");

    run_cli_fail(&[
        input.to_str().unwrap(),
        "--out-dir",
        out_dir.path().to_str().unwrap(),
    ]);
}

#[test]
fn cli_rejects_model_engine_without_backend() {
    let dir = assert_fs::TempDir::new().unwrap();
    let input = write_file(&dir, "reviews.csv", sample_csv());
    let out_dir = dir.child("out");

    run_cli_fail(&[
        input.to_str().unwrap(),
        "--out-dir",
        out_dir.path().to_str().unwrap(),
        "--engine",
        "model",
    ]);
}

#[test]
fn cli_applies_custom_rules_and_stopwords() {
    let dir = assert_fs::TempDir::new().unwrap();
    let input = write_file(&dir, "reviews.csv", sample_csv());
    let rules = write_file(
        &dir,
        "rules.json",
        r#"[{"theme": "Updates", "phrases": ["update"]}]"#,
    );
    let stopwords = write_file(&dir, "stop.txt", "# extra stopwords\ntransfers\n");
    let out_dir = dir.child("out");

    run_cli_ok(&[
        input.to_str().unwrap(),
        "--out-dir",
        out_dir.path().to_str().unwrap(),
        "--rules",
        rules.to_str().unwrap(),
        "--stopwords",
        stopwords.to_str().unwrap(),
        "--min-df",
        "1",
    ]);

    let shares = read_to_string(out_dir.child("theme_summary_by_bank.csv").path());
    assert!(shares.contains("Updates"));
    assert!(!shares.contains("Stability"));

    // Stopworded term disappears from the top-term table.
    let terms = read_to_string(out_dir.child("tfidf_top_terms.csv").path());
    assert!(!terms.contains("transfer"));
}
