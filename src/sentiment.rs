//! Sentiment annotation: a lexicon engine, a model-engine seam, batched
//! parallel scoring, and confidence-based reconciliation of the two.
//!
//! Both engines produce a canonical label plus a signed score whose sign
//! agrees with the label: positive ⇒ score ≥ 0, negative ⇒ score ≤ 0,
//! neutral ⇒ score ≈ 0 (the lexicon keeps its sub-threshold raw value,
//! the model's coerced neutral is exactly 0.0).

use std::collections::HashMap;
use std::fmt;

use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical sentiment labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Negative,
    Neutral,
}

impl SentimentLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentLabel::Positive => "positive",
            SentimentLabel::Negative => "negative",
            SentimentLabel::Neutral => "neutral",
        }
    }

    /// Normalize a loosely-spelled label. Anything unrecognized falls back
    /// to neutral.
    pub fn from_loose(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "positive" | "pos" => SentimentLabel::Positive,
            "negative" | "neg" => SentimentLabel::Negative,
            _ => SentimentLabel::Neutral,
        }
    }
}

impl fmt::Display for SentimentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A label with its signed score. Sign encodes polarity, magnitude encodes
/// confidence or intensity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    pub label: SentimentLabel,
    pub score: f64,
}

impl Sentiment {
    pub fn neutral() -> Self {
        Self {
            label: SentimentLabel::Neutral,
            score: 0.0,
        }
    }
}

/// The capability both engines share.
pub trait SentimentEngine {
    fn score(&self, text: &str) -> Sentiment;
}

/// Positive/negative threshold on the compound score.
pub const SENTIMENT_THRESHOLD: f64 = 0.05;

/// Dampening applied to a valence hit preceded by a negation token.
const NEGATION_FACTOR: f64 = -0.74;

/// How many preceding tokens are searched for a negation.
const NEGATION_WINDOW: usize = 3;

/// Normalization constant for the compound score.
const COMPOUND_ALPHA: f64 = 15.0;

/// Lexicon-based engine: context-free polarity scoring of raw text.
/// Deterministic, no external state beyond the fixed embedded lexicon.
pub struct LexiconEngine {
    lexicon: HashMap<&'static str, f64>,
}

impl LexiconEngine {
    pub fn new() -> Self {
        Self {
            lexicon: LEXICON.iter().copied().collect(),
        }
    }
}

impl Default for LexiconEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SentimentEngine for LexiconEngine {
    /// Sum valences of known tokens, flip hits within a trailing negation
    /// window, and squash the sum into (-1, 1). Thresholds: >= +0.05
    /// positive, <= -0.05 negative, else neutral.
    fn score(&self, text: &str) -> Sentiment {
        let tokens: Vec<String> = text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric() && c != '\'')
            .filter(|t| !t.is_empty())
            .map(|t| t.trim_matches('\'').to_string())
            .collect();
        if tokens.is_empty() {
            return Sentiment::neutral();
        }

        let mut total = 0.0;
        for (i, token) in tokens.iter().enumerate() {
            let Some(&valence) = self.lexicon.get(token.as_str()) else {
                continue;
            };
            let negated = tokens[i.saturating_sub(NEGATION_WINDOW)..i]
                .iter()
                .any(|t| NEGATIONS.contains(&t.as_str()));
            total += if negated {
                valence * NEGATION_FACTOR
            } else {
                valence
            };
        }

        let compound = total / (total * total + COMPOUND_ALPHA).sqrt();
        let label = if compound >= SENTIMENT_THRESHOLD {
            SentimentLabel::Positive
        } else if compound <= -SENTIMENT_THRESHOLD {
            SentimentLabel::Negative
        } else {
            SentimentLabel::Neutral
        };
        Sentiment {
            label,
            score: compound,
        }
    }
}

/// Scoring-engine failure inside a batch. Recovered per batch, never a
/// hard stop for the run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("scoring failed: {0}")]
    Scoring(String),
}

/// Raw output of a pretrained classifier: a label string and a confidence
/// probability in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPrediction {
    pub label: String,
    pub confidence: f64,
}

/// Seam for the pretrained classifier binding, an external collaborator.
///
/// `concurrent_safe` declares whether the binding tolerates concurrent
/// invocation; when it does not, batch submission degrades to sequential
/// rather than risking concurrent state mutation.
pub trait ModelBackend: Sync {
    fn classify_batch(&self, texts: &[&str]) -> Result<Vec<ModelPrediction>, EngineError>;

    /// Engine-imposed input-size limit; text is truncated to this many
    /// characters before scoring.
    fn max_input_chars(&self) -> usize {
        512
    }

    fn concurrent_safe(&self) -> bool {
        true
    }
}

/// A model prediction mapped into the pipeline's signed-score convention.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelScore {
    /// The backend's label, lowercased but otherwise untouched.
    pub raw_label: String,
    /// The backend's confidence probability, kept for reconciliation.
    pub confidence: f64,
    pub sentiment: Sentiment,
}

impl ModelScore {
    /// Default used for failed batches and empty inputs.
    pub fn neutral() -> Self {
        Self {
            raw_label: "neutral".to_string(),
            confidence: 0.0,
            sentiment: Sentiment::neutral(),
        }
    }

    /// Map a raw prediction: negate the probability for "negative", keep it
    /// for "positive", and coerce any other label to neutral with the score
    /// forced to 0.0. The coercion discards the model's confidence for the
    /// final score on purpose; this is the defined contract.
    pub fn from_prediction(pred: ModelPrediction) -> Self {
        let raw_label = pred.label.to_lowercase();
        let sentiment = match raw_label.as_str() {
            "positive" | "pos" => Sentiment {
                label: SentimentLabel::Positive,
                score: pred.confidence,
            },
            "negative" | "neg" => Sentiment {
                label: SentimentLabel::Negative,
                score: -pred.confidence,
            },
            _ => Sentiment::neutral(),
        };
        Self {
            raw_label,
            confidence: pred.confidence,
            sentiment,
        }
    }
}

/// Pipeline-side wrapper around a [`ModelBackend`]: owns truncation,
/// empty-input short-circuiting, and the signed-score mapping.
pub struct ModelEngine<'a> {
    backend: &'a dyn ModelBackend,
}

impl<'a> ModelEngine<'a> {
    pub fn new(backend: &'a dyn ModelBackend) -> Self {
        Self { backend }
    }

    /// Score one batch. Blank texts map straight to neutral without
    /// consulting the backend; the rest are truncated and classified.
    pub fn score_batch(&self, texts: &[&str]) -> Result<Vec<ModelScore>, EngineError> {
        let max = self.backend.max_input_chars();
        let mut out = vec![ModelScore::neutral(); texts.len()];
        let mut live_idx = Vec::new();
        let mut live_texts = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            if !text.trim().is_empty() {
                live_idx.push(i);
                live_texts.push(truncate_chars(text, max));
            }
        }
        if live_texts.is_empty() {
            return Ok(out);
        }
        let preds = self.backend.classify_batch(&live_texts)?;
        if preds.len() != live_texts.len() {
            return Err(EngineError::Scoring(format!(
                "backend returned {} results for {} inputs",
                preds.len(),
                live_texts.len()
            )));
        }
        for (i, pred) in live_idx.into_iter().zip(preds) {
            out[i] = ModelScore::from_prediction(pred);
        }
        Ok(out)
    }
}

/// Truncate on a character boundary, never mid-codepoint.
fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &s[..byte_idx],
        None => s,
    }
}

/// Result of a batched model run over the whole relation.
#[derive(Debug)]
pub struct ModelRun {
    /// One score per input row, in input order.
    pub scores: Vec<ModelScore>,
    /// Batches that failed and were substituted with neutral defaults.
    pub failed_batches: usize,
}

/// Score every text with the model backend in fixed-size batches.
///
/// Batches run across a bounded rayon pool when the backend tolerates
/// concurrent calls, sequentially otherwise. Results are scattered back by
/// start index, so output order never depends on completion order. A
/// failed batch degrades to neutral defaults for all its members and is
/// counted, never aborting the run.
pub fn annotate_with_model(
    texts: &[String],
    backend: &dyn ModelBackend,
    batch_size: usize,
    workers: usize,
) -> ModelRun {
    let total = texts.len();
    if total == 0 {
        return ModelRun {
            scores: Vec::new(),
            failed_batches: 0,
        };
    }
    let batch_size = batch_size.max(1);
    let engine = ModelEngine::new(backend);
    let chunks: Vec<(usize, Vec<&str>)> = texts
        .chunks(batch_size)
        .enumerate()
        .map(|(i, chunk)| (i * batch_size, chunk.iter().map(String::as_str).collect()))
        .collect();

    let score_chunk = |(start, batch): &(usize, Vec<&str>)| (*start, engine.score_batch(batch));

    let results: Vec<(usize, Result<Vec<ModelScore>, EngineError>)> =
        if backend.concurrent_safe() && workers > 1 {
            match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
                Ok(pool) => pool.install(|| chunks.par_iter().map(score_chunk).collect()),
                Err(e) => {
                    warn!("worker pool unavailable ({e}); scoring batches sequentially");
                    chunks.iter().map(score_chunk).collect()
                }
            }
        } else {
            chunks.iter().map(score_chunk).collect()
        };

    let mut failed_batches = 0;
    let mut placed: Vec<(usize, Vec<ModelScore>)> = Vec::with_capacity(results.len());
    for (start, result) in results {
        match result {
            Ok(scores) => placed.push((start, scores)),
            Err(e) => {
                let len = batch_size.min(total - start);
                warn!(
                    "sentiment batch for rows {start}..{} failed: {e}; substituting neutral defaults",
                    start + len
                );
                failed_batches += 1;
                placed.push((start, vec![ModelScore::neutral(); len]));
            }
        }
    }

    ModelRun {
        scores: scatter_batches(total, placed),
        failed_batches,
    }
}

/// Write batch results back to their original index positions. Input
/// batches may arrive in any completion order; the i-th output always
/// corresponds to the i-th input row.
pub fn scatter_batches(total: usize, batches: Vec<(usize, Vec<ModelScore>)>) -> Vec<ModelScore> {
    let mut out = vec![ModelScore::neutral(); total];
    for (start, scores) in batches {
        for (offset, score) in scores.into_iter().enumerate() {
            if let Some(slot) = out.get_mut(start + offset) {
                *slot = score;
            } else {
                warn!("batch result at {} overruns output of {total} rows", start + offset);
            }
        }
    }
    out
}

/// Merge the two engines' output for one row: the model's label wins when
/// its confidence meets the threshold, otherwise the lexicon's is kept.
/// The merged label is always one of the three canonical labels, so a
/// high-confidence unrecognized model label still lands on neutral.
pub fn reconcile(lexicon: Sentiment, model: &ModelScore, confidence_threshold: f64) -> Sentiment {
    if model.confidence >= confidence_threshold {
        Sentiment {
            label: SentimentLabel::from_loose(&model.raw_label),
            score: model.sentiment.score,
        }
    } else {
        lexicon
    }
}

/// Coverage below this fraction is flagged as a warning after a run.
pub const COVERAGE_WARN_THRESHOLD: f64 = 0.90;

/// Fraction of rows carrying a sentiment label.
pub fn coverage(sentiments: &[Option<Sentiment>]) -> f64 {
    if sentiments.is_empty() {
        return 0.0;
    }
    sentiments.iter().filter(|s| s.is_some()).count() as f64 / sentiments.len() as f64
}

/// Log the coverage metric, warning below the 90% floor. Low coverage is a
/// warning, not a failure.
pub fn report_coverage(cov: f64) {
    if cov < COVERAGE_WARN_THRESHOLD {
        warn!("sentiment coverage {:.1}% is below 90%", cov * 100.0);
    } else {
        info!("sentiment coverage {:.1}%", cov * 100.0);
    }
}

const NEGATIONS: &[&str] = &[
    "not", "no", "never", "none", "cannot", "cant", "can't", "dont", "don't", "doesnt",
    "doesn't", "didnt", "didn't", "wont", "won't", "isnt", "isn't", "wasnt", "wasn't",
];

/// Valence lexicon tuned for app-review vocabulary. Values follow the
/// usual -4..+4 intensity convention.
const LEXICON: &[(&str, f64)] = &[
    ("love", 3.2),
    ("loves", 3.2),
    ("loved", 3.2),
    ("excellent", 3.4),
    ("amazing", 3.3),
    ("fantastic", 3.2),
    ("perfect", 3.4),
    ("awesome", 3.1),
    ("great", 3.1),
    ("best", 3.2),
    ("good", 1.9),
    ("nice", 1.8),
    ("happy", 2.4),
    ("like", 1.5),
    ("easy", 1.9),
    ("fast", 1.7),
    ("quick", 1.5),
    ("smooth", 1.7),
    ("simple", 1.3),
    ("helpful", 1.8),
    ("friendly", 1.9),
    ("reliable", 2.0),
    ("stable", 1.5),
    ("secure", 1.6),
    ("convenient", 1.9),
    ("intuitive", 1.8),
    ("improved", 1.6),
    ("works", 1.4),
    ("worst", -3.4),
    ("fraud", -3.3),
    ("scam", -3.2),
    ("terrible", -3.1),
    ("horrible", -3.1),
    ("awful", -3.0),
    ("hate", -2.9),
    ("stolen", -2.8),
    ("crash", -2.7),
    ("crashes", -2.7),
    ("crashed", -2.7),
    ("crashing", -2.7),
    ("useless", -2.6),
    ("broken", -2.4),
    ("buggy", -2.4),
    ("frustrating", -2.4),
    ("fail", -2.3),
    ("fails", -2.3),
    ("failed", -2.3),
    ("failure", -2.3),
    ("waste", -2.3),
    ("freeze", -2.2),
    ("freezes", -2.2),
    ("frozen", -2.2),
    ("disappointing", -2.2),
    ("disappointed", -2.2),
    ("bad", -2.1),
    ("bug", -2.1),
    ("bugs", -2.1),
    ("annoying", -2.0),
    ("poor", -2.0),
    ("lost", -1.9),
    ("error", -1.9),
    ("errors", -1.9),
    ("slow", -1.8),
    ("stuck", -1.8),
    ("confusing", -1.8),
    ("problem", -1.7),
    ("problems", -1.7),
    ("wrong", -1.6),
];

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted {
        label: &'static str,
        confidence: f64,
    }

    impl ModelBackend for Scripted {
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

    #[test]
    fn lexicon_thresholds_and_sign_agree() {
        let engine = LexiconEngine::new();
        let neg = engine.score("App crashes on login");
        assert_eq!(neg.label, SentimentLabel::Negative);
        assert!(neg.score < 0.0);

        let pos = engine.score("Fast transfers, love it");
        assert_eq!(pos.label, SentimentLabel::Positive);
        assert!(pos.score > 0.0);

        let neu = engine.score("the statement of account");
        assert_eq!(neu.label, SentimentLabel::Neutral);
        assert!(neu.score.abs() < SENTIMENT_THRESHOLD);
    }

    #[test]
    fn lexicon_negation_flips_polarity() {
        let engine = LexiconEngine::new();
        let s = engine.score("not good at all");
        assert_eq!(s.label, SentimentLabel::Negative);
    }

    #[test]
    fn empty_text_is_neutral_zero() {
        let engine = LexiconEngine::new();
        assert_eq!(engine.score(""), Sentiment::neutral());
    }

    #[test]
    fn model_sign_mapping() {
        let pos = ModelScore::from_prediction(ModelPrediction {
            label: "POSITIVE".into(),
            confidence: 0.9,
        });
        assert_eq!(pos.sentiment.label, SentimentLabel::Positive);
        assert!((pos.sentiment.score - 0.9).abs() < 1e-12);

        let neg = ModelScore::from_prediction(ModelPrediction {
            label: "negative".into(),
            confidence: 0.8,
        });
        assert!((neg.sentiment.score + 0.8).abs() < 1e-12);
    }

    #[test]
    fn unknown_model_label_coerces_to_neutral_zero() {
        // The confidence is discarded for the final score here; asserting
        // the exact contract rather than inheriting it silently.
        let odd = ModelScore::from_prediction(ModelPrediction {
            label: "LABEL_2".into(),
            confidence: 0.97,
        });
        assert_eq!(odd.sentiment, Sentiment::neutral());
        assert!((odd.confidence - 0.97).abs() < 1e-12);
    }

    #[test]
    fn scatter_ignores_completion_order() {
        let mk = |score: f64| ModelScore {
            raw_label: "positive".into(),
            confidence: score,
            sentiment: Sentiment {
                label: SentimentLabel::Positive,
                score,
            },
        };
        // Batches deliberately out of submission order.
        let batches = vec![
            (4, vec![mk(4.0), mk(5.0)]),
            (0, vec![mk(0.0), mk(1.0)]),
            (2, vec![mk(2.0), mk(3.0)]),
        ];
        let out = scatter_batches(6, batches);
        for (i, score) in out.iter().enumerate() {
            assert!((score.sentiment.score - i as f64).abs() < 1e-12);
        }
    }

    #[test]
    fn empty_strings_batch_is_all_neutral() {
        let texts = vec![String::new(); 32];
        let run = annotate_with_model(&texts, &Scripted { label: "positive", confidence: 0.99 }, 32, 4);
        assert_eq!(run.scores.len(), 32);
        assert_eq!(run.failed_batches, 0);
        assert!(run.scores.iter().all(|s| s.sentiment == Sentiment::neutral()));
    }

    #[test]
    fn reconcile_prefers_confident_model() {
        let lexicon = Sentiment {
            label: SentimentLabel::Positive,
            score: 0.4,
        };
        let model = ModelScore::from_prediction(ModelPrediction {
            label: "negative".into(),
            confidence: 0.9,
        });
        let merged = reconcile(lexicon, &model, 0.85);
        assert_eq!(merged.label, SentimentLabel::Negative);

        let unsure = ModelScore::from_prediction(ModelPrediction {
            label: "negative".into(),
            confidence: 0.5,
        });
        let merged = reconcile(lexicon, &unsure, 0.85);
        assert_eq!(merged.label, SentimentLabel::Positive);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("ab", 10), "ab");
    }
}
