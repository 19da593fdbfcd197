#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process;

use clap::Parser;
use log::{error, info};

use review_insights::io::write_table;
use review_insights::normalize::load_stopword_file;
use review_insights::{
    EngineChoice, ExportFormat, PipelineError, PipelineOptions, QuoteMode, StemMode, ThemeRule,
    default_rules, load_rules, read_reviews_csv, run_pipeline,
};

/// Annotate bank mobile-app reviews with keywords, themes, and sentiment,
/// then export per-bank aggregate tables.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Input CSV of reviews.
    input: PathBuf,

    /// Directory for the exported tables.
    #[arg(long, default_value = "out")]
    out_dir: PathBuf,

    /// Export format for all tables.
    #[arg(long, value_enum, default_value_t = ExportFormat::Csv)]
    export_format: ExportFormat,

    /// Extra stopword file, one word per line.
    #[arg(long)]
    stopwords: Option<PathBuf>,

    /// Theme rule file (JSON array); built-in rules when omitted.
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Column holding the group (bank) name.
    #[arg(long, default_value = "bank")]
    group_col: String,

    /// Column holding the review text.
    #[arg(long, default_value = "review")]
    text_col: String,

    /// Ranked terms kept per bank in the top-term table.
    #[arg(long, default_value_t = 50)]
    top_n: usize,

    /// Keywords tagged per review.
    #[arg(long, default_value_t = 5)]
    top_k: usize,

    /// Smallest n-gram size.
    #[arg(long, default_value_t = 1)]
    ngram_min: usize,

    /// Largest n-gram size.
    #[arg(long, default_value_t = 2)]
    ngram_max: usize,

    /// Document-frequency floor for the vectorizer.
    #[arg(long, default_value_t = 2)]
    min_df: usize,

    /// Vocabulary cap per group.
    #[arg(long, default_value_t = 5000)]
    max_features: usize,

    /// Sentiment engine(s) to run.
    #[arg(long, value_enum, default_value_t = EngineChoice::Lexicon)]
    engine: EngineChoice,

    /// Model confidence at or above which its label wins reconciliation.
    #[arg(long, default_value_t = 0.85)]
    threshold: f64,

    /// Rows per model batch.
    #[arg(long, default_value_t = 32)]
    batch_size: usize,

    /// Worker threads for batched model scoring.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Minimum (bank, theme) subset size in the summary table.
    #[arg(long, default_value_t = 1)]
    min_samples: usize,

    /// Disable stemming during normalization.
    #[arg(long)]
    no_stem: bool,

    /// Example quotes per (scope, theme) pair.
    #[arg(long, default_value_t = 5)]
    quotes: usize,

    /// Quote selection strategy.
    #[arg(long, value_enum, default_value_t = QuoteMode::MostNegative)]
    quote_mode: QuoteMode,

    /// Display length quotes are cut to.
    #[arg(long, default_value_t = 200)]
    quote_max_len: usize,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        error!("{e}");
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), PipelineError> {
    let extra_stopwords = match &cli.stopwords {
        Some(path) => load_stopword_file(path)?,
        None => Vec::new(),
    };

    let rules: Vec<ThemeRule> = match &cli.rules {
        Some(path) => {
            let rules = load_rules(path)?;
            info!("loaded {} theme rules from {}", rules.len(), path.display());
            rules
        }
        None => default_rules(),
    };

    let opts = PipelineOptions {
        text_col: cli.text_col.clone(),
        group_col: cli.group_col.clone(),
        top_n: cli.top_n,
        top_k: cli.top_k,
        ngram_range: (cli.ngram_min, cli.ngram_max),
        min_df: cli.min_df,
        max_features: cli.max_features,
        engine: cli.engine,
        confidence_threshold: cli.threshold,
        batch_size: cli.batch_size,
        workers: cli.workers,
        min_samples: cli.min_samples,
        stem_mode: if cli.no_stem {
            StemMode::Off
        } else {
            StemMode::English
        },
        extra_stopwords,
        quote_count: cli.quotes,
        quote_mode: cli.quote_mode,
        quote_max_len: cli.quote_max_len,
    };

    let report = read_reviews_csv(&cli.input, &opts.text_col, &opts.group_col)?;
    let output = run_pipeline(report.records, &rules, &opts, None)?;

    let fmt = cli.export_format;
    write_table(&output.records, &cli.out_dir, "reviews_annotated", fmt)?;
    write_table(&output.top_terms, &cli.out_dir, "tfidf_top_terms", fmt)?;
    write_table(&output.shares, &cli.out_dir, "theme_summary_by_bank", fmt)?;
    write_table(&output.monthly, &cli.out_dir, "monthly_sentiment_by_bank", fmt)?;
    write_table(&output.summary, &cli.out_dir, "theme_sentiment_summary", fmt)?;
    write_table(&output.quotes, &cli.out_dir, "theme_example_quotes", fmt)?;

    print!("{}", output.render_summary());
    Ok(())
}
