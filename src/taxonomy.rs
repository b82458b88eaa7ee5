//! Label taxonomy: what each classifier label means for focus.
//!
//! The taxonomy is resolved once at session start and handed to the pipeline
//! by value. Labels the classifier returns that are not in the taxonomy are
//! filtered out before voting.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;

/// How a label counts toward a focus decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelCategory {
    Distraction,
    Focus,
    Absence,
    Borderline,
    Neutral,
}

/// Category and minimum confidence for one label.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabelRule {
    pub category: LabelCategory,
    /// A label only votes when its confidence reaches this value
    pub threshold: f64,
}

impl LabelRule {
    pub fn new(category: LabelCategory, threshold: f64) -> Self {
        Self {
            category,
            threshold,
        }
    }

    /// Whether a label at `confidence` is strong enough to vote.
    pub fn admits(&self, confidence: f64) -> bool {
        confidence >= self.threshold
    }
}

/// Immutable label → rule mapping for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelTaxonomy {
    labels: BTreeMap<String, LabelRule>,
}

impl LabelTaxonomy {
    pub fn new(labels: impl IntoIterator<Item = (String, LabelRule)>) -> Self {
        Self {
            labels: labels.into_iter().collect(),
        }
    }

    /// Load a taxonomy from a JSON object of `label -> {category, threshold}`.
    pub fn from_json_file(path: &Path) -> Result<Self, TaxonomyError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, TaxonomyError> {
        let labels: BTreeMap<String, LabelRule> = serde_json::from_str(content)?;
        if labels.is_empty() {
            return Err(TaxonomyError::Empty);
        }
        for (label, rule) in &labels {
            if !(0.0..=1.0).contains(&rule.threshold) {
                return Err(TaxonomyError::InvalidThreshold {
                    label: label.clone(),
                    threshold: rule.threshold,
                });
            }
        }
        Ok(Self { labels })
    }

    pub fn rule(&self, label: &str) -> Option<&LabelRule> {
        self.labels.get(label)
    }

    pub fn category(&self, label: &str) -> Option<LabelCategory> {
        self.labels.get(label).map(|r| r.category)
    }

    /// The rule for `label` if it is known and `confidence` clears its threshold.
    pub fn voting_rule(&self, label: &str, confidence: f64) -> Option<&LabelRule> {
        self.labels.get(label).filter(|r| r.admits(confidence))
    }

    /// Drop labels outside the taxonomy. Returns the kept labels and how many
    /// were discarded.
    pub fn filter(&self, labels: HashMap<String, f64>) -> (HashMap<String, f64>, usize) {
        let before = labels.len();
        let kept: HashMap<String, f64> = labels
            .into_iter()
            .filter(|(label, _)| self.labels.contains_key(label))
            .collect();
        let dropped = before - kept.len();
        (kept, dropped)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &LabelRule)> {
        self.labels.iter()
    }
}

/// Fallback label set used when no profile is supplied.
impl Default for LabelTaxonomy {
    fn default() -> Self {
        use LabelCategory::*;

        let entries: [(&str, LabelCategory, f64); 20] = [
            // camera
            ("Focused", Focus, 0.5),
            ("LookingAtScreen", Focus, 0.5),
            ("Typing", Focus, 0.5),
            ("Reading", Focus, 0.5),
            ("HeadAway", Distraction, 0.5),
            ("EyesOffScreen", Distraction, 0.5),
            ("Phone", Distraction, 0.5),
            ("MicroSleep", Distraction, 0.6),
            ("Absent", Absence, 0.5),
            ("NoPerson", Absence, 0.5),
            ("Yawning", Borderline, 0.5),
            // screen
            ("Coding", Focus, 0.5),
            ("Documents", Focus, 0.5),
            ("Terminal", Focus, 0.5),
            ("SocialMedia", Distraction, 0.5),
            ("Games", Distraction, 0.5),
            ("Video", Distraction, 0.5),
            ("Shopping", Distraction, 0.5),
            ("News", Borderline, 0.5),
            ("Desktop", Neutral, 0.5),
        ];

        Self::new(
            entries
                .into_iter()
                .map(|(label, category, threshold)| {
                    (label.to_string(), LabelRule::new(category, threshold))
                }),
        )
    }
}

/// Taxonomy loading errors.
#[derive(Debug, Error)]
pub enum TaxonomyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Taxonomy defines no labels")]
    Empty,
    #[error("Label {label} has threshold {threshold} outside [0, 1]")]
    InvalidThreshold { label: String, threshold: f64 },
}
