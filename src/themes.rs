//! Rule-based, multi-label theme classification.
//!
//! Rules are an explicit, declaration-ordered value compiled once per run;
//! there is no process-wide rule state. The first matched theme is the
//! primary one, the second the secondary — purely positional, driven by
//! rule declaration order, never by match strength.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use log::warn;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::PipelineError;
use crate::normalize::Normalizer;

/// One theme and its trigger phrases, in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeRule {
    pub theme: String,
    pub phrases: Vec<String>,
}

impl ThemeRule {
    pub fn new<S: Into<String>>(theme: S, phrases: &[&str]) -> Self {
        Self {
            theme: theme.into(),
            phrases: phrases.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Built-in rule set for bank mobile-app reviews. Order matters: earlier
/// themes win the primary slot on multi-label rows.
pub fn default_rules() -> Vec<ThemeRule> {
    vec![
        ThemeRule::new(
            "Account Access",
            &["login", "password", "otp", "locked out", "authentication", "fingerprint", "verification"],
        ),
        ThemeRule::new(
            "Stability",
            &["crash", "freeze", "bug", "error", "not working", "broken"],
        ),
        ThemeRule::new(
            "Performance",
            &["slow", "fast", "loading", "lag", "speed", "quick"],
        ),
        ThemeRule::new(
            "Payments",
            &["transfer", "payment", "send money", "transaction", "deposit", "withdraw"],
        ),
        ThemeRule::new(
            "Support",
            &["customer service", "support", "helpline", "response", "complaint"],
        ),
        ThemeRule::new(
            "UI/UX",
            &["easy use", "interface", "design", "intuitive", "navigation", "update"],
        ),
    ]
}

/// Load a rule file: a JSON array of `{"theme": ..., "phrases": [...]}`
/// objects, kept in file order.
pub fn load_rules(path: &Path) -> Result<Vec<ThemeRule>, PipelineError> {
    let file = File::open(path)?;
    let rules: Vec<ThemeRule> = serde_json::from_reader(BufReader::new(file))?;
    Ok(rules)
}

/// Compiled whole-word, case-insensitive matchers per theme.
pub struct ThemeMatcherSet {
    themes: Vec<(String, Vec<Regex>)>,
}

impl ThemeMatcherSet {
    /// Compile each non-empty trimmed phrase into a matcher. Invalid
    /// phrases are skipped with a warning, not fatal.
    pub fn compile(rules: &[ThemeRule]) -> Self {
        let mut themes = Vec::with_capacity(rules.len());
        for rule in rules {
            let mut patterns = Vec::new();
            for phrase in &rule.phrases {
                let phrase = phrase.trim();
                if phrase.is_empty() {
                    continue;
                }
                match Regex::new(&format!(r"(?i)\b{}\b", regex::escape(phrase))) {
                    Ok(re) => patterns.push(re),
                    Err(e) => warn!("invalid phrase '{phrase}' for theme '{}': {e}", rule.theme),
                }
            }
            themes.push((rule.theme.clone(), patterns));
        }
        Self { themes }
    }

    /// Compile rules against the run's normalizer: each phrase is passed
    /// through the same normalization the review text gets, so stemmed or
    /// stopword-filtered text still matches its triggers. Phrases that
    /// normalize to nothing are dropped with a warning.
    pub fn compile_normalized(rules: &[ThemeRule], normalizer: &Normalizer) -> Self {
        let normalized: Vec<ThemeRule> = rules
            .iter()
            .map(|rule| {
                let phrases = rule
                    .phrases
                    .iter()
                    .filter_map(|p| {
                        let np = normalizer.normalize(p);
                        if np.is_empty() {
                            warn!(
                                "phrase '{p}' for theme '{}' normalizes to nothing; skipped",
                                rule.theme
                            );
                            None
                        } else {
                            Some(np)
                        }
                    })
                    .collect();
                ThemeRule {
                    theme: rule.theme.clone(),
                    phrases,
                }
            })
            .collect();
        Self::compile(&normalized)
    }

    /// Assign zero or more themes to a text, in rule declaration order.
    /// Empty text yields an empty list.
    pub fn assign(&self, text: &str) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }
        let mut matched = Vec::new();
        for (theme, patterns) in &self.themes {
            if patterns.iter().any(|p| p.is_match(text)) {
                matched.push(theme.clone());
            }
        }
        matched
    }

    /// Theme names in declaration order.
    pub fn theme_names(&self) -> Vec<String> {
        self.themes.iter().map(|(t, _)| t.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::StemMode;

    fn rules() -> Vec<ThemeRule> {
        vec![
            ThemeRule::new("Stability", &["crash", "freeze"]),
            ThemeRule::new("Performance", &["fast", "slow"]),
        ]
    }

    #[test]
    fn multi_label_in_declaration_order() {
        let set = ThemeMatcherSet::compile(&rules());
        // Both themes match; order follows rule declaration, not position
        // in the text.
        assert_eq!(
            set.assign("fast app until crash"),
            vec!["Stability".to_string(), "Performance".to_string()]
        );
    }

    #[test]
    fn empty_text_yields_no_themes() {
        let set = ThemeMatcherSet::compile(&rules());
        assert!(set.assign("").is_empty());
    }

    #[test]
    fn whole_word_matching() {
        let set = ThemeMatcherSet::compile(&rules());
        assert!(set.assign("crashless experience").is_empty());
        assert_eq!(set.assign("it crash often"), vec!["Stability".to_string()]);
    }

    #[test]
    fn blank_phrases_are_skipped() {
        let rules = vec![ThemeRule::new("Empty", &["", "   "])];
        let set = ThemeMatcherSet::compile(&rules);
        assert!(set.assign("anything at all").is_empty());
    }

    #[test]
    fn normalized_compilation_matches_stemmed_text() {
        let normalizer = Normalizer::new(StemMode::English);
        let rules = vec![ThemeRule::new("Stability", &["crashes"])];
        let set = ThemeMatcherSet::compile_normalized(&rules, &normalizer);
        let text = normalizer.normalize("App crashes on login");
        assert_eq!(set.assign(&text), vec!["Stability".to_string()]);
    }
}
