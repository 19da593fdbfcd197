//! Review-insights pipeline for bank mobile-app reviews: normalization,
//! group-wise TF-IDF keywords, rule-based theme labels, dual-engine
//! sentiment, and per-bank rollups with example quotes.
//!
//! [`run_pipeline`] is the whole pipeline as a library call; the binary is
//! a thin CLI over it.

pub mod aggregate;
pub mod io;
pub mod keywords;
pub mod normalize;
pub mod sentiment;
pub mod themes;

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::NaiveDate;
use log::info;
use serde::Serialize;
use thiserror::Error;

pub use aggregate::{
    ExampleQuote, MonthlySentimentRow, QuoteMode, ThemeSentimentRow, ThemeShareRow,
};
pub use io::{ExportFormat, LoadReport, csv_safe_cell, read_reviews_csv, write_table};
pub use keywords::{KeywordTagger, TfidfOptions, TopTerm};
pub use normalize::{Normalizer, StemMode};
pub use sentiment::{
    LexiconEngine, ModelBackend, ModelPrediction, Sentiment, SentimentEngine, SentimentLabel,
};
pub use themes::{ThemeMatcherSet, ThemeRule, default_rules, load_rules};

/// One review flowing through the pipeline, annotations filled in stage by
/// stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewRecord {
    pub id: String,
    pub bank: String,
    pub review: String,
    /// Normalized text; derived, not exported.
    #[serde(skip)]
    pub normalized: String,
    pub rating: Option<u8>,
    pub date: Option<NaiveDate>,
    pub keywords: Vec<String>,
    pub themes: Vec<String>,
    pub sentiment: Option<Sentiment>,
}

impl ReviewRecord {
    pub fn new<I, B, R>(id: I, bank: B, review: R) -> Self
    where
        I: Into<String>,
        B: Into<String>,
        R: Into<String>,
    {
        Self {
            id: id.into(),
            bank: bank.into(),
            review: review.into(),
            normalized: String::new(),
            rating: None,
            date: None,
            keywords: Vec::new(),
            themes: Vec::new(),
            sentiment: None,
        }
    }

    /// First matched theme, in rule declaration order.
    pub fn theme_primary(&self) -> Option<&str> {
        self.themes.first().map(String::as_str)
    }

    pub fn theme_secondary(&self) -> Option<&str> {
        self.themes.get(1).map(String::as_str)
    }
}

/// Which sentiment engine(s) annotate the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum EngineChoice {
    /// Lexicon only, over the raw review text.
    #[default]
    Lexicon,
    /// Pretrained classifier only, over the normalized text.
    Model,
    /// Both, merged per row by model confidence.
    Both,
}

/// Everything tunable about one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub text_col: String,
    pub group_col: String,
    pub top_n: usize,
    pub top_k: usize,
    pub ngram_range: (usize, usize),
    pub min_df: usize,
    pub max_features: usize,
    pub engine: EngineChoice,
    /// Model confidence at or above which its label overrides the lexicon.
    pub confidence_threshold: f64,
    pub batch_size: usize,
    pub workers: usize,
    /// Minimum (bank, theme) subset size admitted to the summary table.
    pub min_samples: usize,
    pub stem_mode: StemMode,
    pub extra_stopwords: Vec<String>,
    pub quote_count: usize,
    pub quote_mode: QuoteMode,
    pub quote_max_len: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            text_col: "review".to_string(),
            group_col: "bank".to_string(),
            top_n: 50,
            top_k: 5,
            ngram_range: (1, 2),
            min_df: 2,
            max_features: 5000,
            engine: EngineChoice::Lexicon,
            confidence_threshold: 0.85,
            batch_size: 32,
            workers: 4,
            min_samples: 1,
            stem_mode: StemMode::English,
            extra_stopwords: Vec::new(),
            quote_count: 5,
            quote_mode: QuoteMode::MostNegative,
            quote_max_len: 200,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("required column '{0}' not found in input")]
    MissingColumn(String),
    #[error("configuration error: {0}")]
    Config(String),
}

/// Everything one run produces.
#[derive(Debug)]
pub struct PipelineOutput {
    pub records: Vec<ReviewRecord>,
    pub top_terms: Vec<TopTerm>,
    pub group_terms: BTreeMap<String, Vec<(String, f64)>>,
    pub sample_sizes: Vec<(String, usize)>,
    pub shares: Vec<ThemeShareRow>,
    pub monthly: Vec<MonthlySentimentRow>,
    pub summary: Vec<ThemeSentimentRow>,
    pub quotes: Vec<ExampleQuote>,
    pub sentiment_coverage: f64,
    pub failed_batches: usize,
}

impl PipelineOutput {
    /// Human-readable run summary for stdout.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Reviews annotated: {}", self.records.len());
        for (bank, n) in &self.sample_sizes {
            let _ = writeln!(out, "  {bank}: {n} reviews");
        }
        let _ = writeln!(
            out,
            "Sentiment coverage: {:.1}%",
            self.sentiment_coverage * 100.0
        );
        if self.failed_batches > 0 {
            let _ = writeln!(
                out,
                "Model batches substituted with neutral defaults: {}",
                self.failed_batches
            );
        }
        let _ = writeln!(out, "Theme rows: {}", self.shares.len());
        let _ = writeln!(out, "Monthly sentiment points: {}", self.monthly.len());
        let _ = writeln!(out, "Example quotes: {}", self.quotes.len());
        out
    }
}

/// Run the full annotation and aggregation pipeline over loaded records.
///
/// `backend` is required when `opts.engine` involves the model; selecting
/// the model without one is a configuration error, not a silent fallback.
pub fn run_pipeline(
    mut records: Vec<ReviewRecord>,
    rules: &[ThemeRule],
    opts: &PipelineOptions,
    backend: Option<&dyn ModelBackend>,
) -> Result<PipelineOutput, PipelineError> {
    if matches!(opts.engine, EngineChoice::Model | EngineChoice::Both) && backend.is_none() {
        return Err(PipelineError::Config(
            "model engine selected but no model backend is configured".to_string(),
        ));
    }

    let normalizer = Normalizer::with_stopwords(opts.stem_mode, &opts.extra_stopwords);
    for r in &mut records {
        r.normalized = normalizer.normalize(&r.review);
    }
    info!("normalized {} reviews", records.len());

    let tfidf = TfidfOptions {
        ngram_range: opts.ngram_range,
        min_df: opts.min_df,
        max_features: opts.max_features,
        top_n: opts.top_n,
    };
    let group_terms = keywords::extract_scored_terms(&records, &tfidf);
    let top_terms = keywords::top_term_table(&group_terms);
    let candidates = keywords::global_candidates(&records, &tfidf);
    let tagger = KeywordTagger::compile(&candidates);
    keywords::tag_rows(&mut records, &tagger, opts.top_k);

    let matchers = ThemeMatcherSet::compile_normalized(rules, &normalizer);
    for r in &mut records {
        r.themes = matchers.assign(&r.normalized);
    }

    let mut failed_batches = 0;
    match opts.engine {
        EngineChoice::Lexicon => {
            let engine = LexiconEngine::new();
            for r in &mut records {
                r.sentiment = Some(engine.score(&r.review));
            }
        }
        EngineChoice::Model => {
            let backend = backend.ok_or_else(|| {
                PipelineError::Config("model backend missing".to_string())
            })?;
            let texts: Vec<String> = records.iter().map(|r| r.normalized.clone()).collect();
            let run =
                sentiment::annotate_with_model(&texts, backend, opts.batch_size, opts.workers);
            failed_batches = run.failed_batches;
            for (r, score) in records.iter_mut().zip(run.scores) {
                r.sentiment = Some(score.sentiment);
            }
        }
        EngineChoice::Both => {
            let backend = backend.ok_or_else(|| {
                PipelineError::Config("model backend missing".to_string())
            })?;
            let engine = LexiconEngine::new();
            let texts: Vec<String> = records.iter().map(|r| r.normalized.clone()).collect();
            let run =
                sentiment::annotate_with_model(&texts, backend, opts.batch_size, opts.workers);
            failed_batches = run.failed_batches;
            for (r, model) in records.iter_mut().zip(run.scores) {
                let lexicon = engine.score(&r.review);
                r.sentiment = Some(sentiment::reconcile(
                    lexicon,
                    &model,
                    opts.confidence_threshold,
                ));
            }
        }
    }

    let sentiments: Vec<Option<Sentiment>> = records.iter().map(|r| r.sentiment).collect();
    let sentiment_coverage = sentiment::coverage(&sentiments);
    sentiment::report_coverage(sentiment_coverage);

    let sample_sizes = aggregate::sample_sizes(&records);
    let shares = aggregate::theme_share(&records);
    let monthly = aggregate::monthly_sentiment(&records);
    let summary = aggregate::theme_sentiment_summary(&shares, &records, opts.min_samples);
    let theme_names = matchers.theme_names();
    let quotes = aggregate::collect_example_quotes(
        &records,
        &theme_names,
        opts.quote_count,
        opts.quote_mode,
        opts.quote_max_len,
    );

    Ok(PipelineOutput {
        records,
        top_terms,
        group_terms,
        sample_sizes,
        shares,
        monthly,
        summary,
        quotes,
        sentiment_coverage,
        failed_batches,
    })
}
