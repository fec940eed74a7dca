//! Quality gate for generated installments.
//!
//! Generated text is never trusted on the first pass: every draft is scored,
//! and drafts below the accept threshold are regenerated with a concrete
//! deficiency list until one passes or the attempt cap is hit.

mod gate;
mod heuristic;

pub use gate::{AttemptRecord, GateError, GateOutcome, QualityGate};
pub use heuristic::HeuristicScorer;

use serde::{Deserialize, Serialize};

/// A parsed installment draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub title: String,
    pub body: String,
}

impl Draft {
    pub fn word_count(&self) -> usize {
        self.body.split_whitespace().count()
    }

    /// Form used when sending the draft back for a rewrite.
    pub fn to_text(&self) -> String {
        if self.title.is_empty() {
            self.body.clone()
        } else {
            format!("Title: {}\n\n{}", self.title, self.body)
        }
    }
}

/// Split model output into title and body.
///
/// The first non-empty line is the title when it starts with `Title:` or a
/// markdown heading. The body is required.
pub fn parse_draft(raw: &str) -> Option<Draft> {
    let raw = raw.trim();
    let mut lines = raw.lines();
    let first = lines.by_ref().find(|l| !l.trim().is_empty())?.trim();

    let title = first
        .get(..6)
        .filter(|prefix| prefix.eq_ignore_ascii_case("title:"))
        .map(|_| first[6..].trim())
        .or_else(|| first.strip_prefix('#').map(|t| t.trim_start_matches('#').trim()));

    let (title, body) = match title {
        Some(title) => (title.trim_matches(['"', '*']).trim().to_string(), lines.collect::<Vec<_>>().join("\n")),
        None => (String::new(), raw.to_string()),
    };

    let body = body.trim().to_string();
    if body.is_empty() {
        return None;
    }
    Some(Draft { title, body })
}

/// Scores per dimension, each 0-100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionScores {
    pub style: u8,
    pub consistency: u8,
    pub variety: u8,
    pub structure: u8,
}

impl DimensionScores {
    /// The weakest dimension.
    pub fn min(&self) -> u8 {
        self.style.min(self.consistency).min(self.variety).min(self.structure)
    }
}

/// Relative weight of each dimension in the overall score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityWeights {
    pub style: f32,
    pub consistency: f32,
    pub variety: f32,
    pub structure: f32,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            style: 0.2,
            consistency: 0.35,
            variety: 0.2,
            structure: 0.25,
        }
    }
}

impl QualityWeights {
    /// Weighted average, rounded.
    pub fn overall(&self, scores: &DimensionScores) -> u8 {
        let total = self.style + self.consistency + self.variety + self.structure;
        if total <= 0.0 {
            return 0;
        }
        let sum = self.style * f32::from(scores.style)
            + self.consistency * f32::from(scores.consistency)
            + self.variety * f32::from(scores.variety)
            + self.structure * f32::from(scores.structure);
        (sum / total).round().clamp(0.0, 100.0) as u8
    }
}

/// What to do with a scored draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityAction {
    Accept,
    AutoRewrite,
    /// Too poor for an automatic fix to be likely.
    FlagForReview,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Overall score needed to accept.
    pub accept_threshold: u8,
    /// Below this a draft is flagged for review rather than auto-rewritten.
    pub review_floor: u8,
    /// A draft with any dimension below this is never accepted outright.
    pub dimension_floor: u8,
    /// Total attempts including the first draft.
    pub max_attempts: u32,
    pub weights: QualityWeights,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            accept_threshold: 75,
            review_floor: 50,
            dimension_floor: 50,
            max_attempts: 3,
            weights: QualityWeights::default(),
        }
    }
}

impl QualityConfig {
    pub fn with_accept_threshold(mut self, threshold: u8) -> Self {
        self.accept_threshold = threshold;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn action_for(&self, overall: u8, scores: &DimensionScores) -> QualityAction {
        if overall >= self.accept_threshold && scores.min() >= self.dimension_floor {
            QualityAction::Accept
        } else if overall >= self.review_floor {
            QualityAction::AutoRewrite
        } else {
            QualityAction::FlagForReview
        }
    }
}

/// A scored draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub scores: DimensionScores,
    pub overall: u8,
    pub action: QualityAction,
    /// Concrete deficiencies, phrased as fix instructions.
    pub issues: Vec<String>,
}

/// What a scorer may look at besides the draft.
#[derive(Debug, Clone, Default)]
pub struct ScoringContext {
    pub installment: u32,
    pub dead_entities: Vec<String>,
    pub prior_titles: Vec<String>,
    pub prior_openings: Vec<String>,
    pub prior_closings: Vec<String>,
}

/// Scores drafts. Implementations must be deterministic.
pub trait QualityScorer: Send + Sync {
    /// Per-dimension scores and deficiencies.
    fn score_dimensions(&self, draft: &Draft, context: &ScoringContext) -> (DimensionScores, Vec<String>);

    /// Full report under a configuration.
    fn score(&self, draft: &Draft, context: &ScoringContext, config: &QualityConfig) -> QualityReport {
        let (scores, issues) = self.score_dimensions(draft, context);
        let overall = config.weights.overall(&scores);
        QualityReport {
            scores,
            overall,
            action: config.action_for(overall, &scores),
            issues,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_draft_with_title_line() {
        let draft = parse_draft("Title: The Iron Gate\n\nKael ran.\n\nHe stopped.").unwrap();
        assert_eq!(draft.title, "The Iron Gate");
        assert_eq!(draft.body, "Kael ran.\n\nHe stopped.");

        let draft = parse_draft("## **Ashes**\nThe fire was out.").unwrap();
        assert_eq!(draft.title, "Ashes");
        assert_eq!(draft.body, "The fire was out.");
    }

    #[test]
    fn test_parse_draft_without_title() {
        let draft = parse_draft("The fire was out. Nobody spoke.").unwrap();
        assert!(draft.title.is_empty());
        assert_eq!(draft.word_count(), 6);
    }

    #[test]
    fn test_parse_draft_requires_body() {
        assert!(parse_draft("").is_none());
        assert!(parse_draft("   \n  ").is_none());
        assert!(parse_draft("Title: Only a title").is_none());
    }

    #[test]
    fn test_actions_by_threshold() {
        let config = QualityConfig::default();
        let even = |v: u8| DimensionScores { style: v, consistency: v, variety: v, structure: v };
        assert_eq!(config.action_for(90, &even(90)), QualityAction::Accept);
        assert_eq!(config.action_for(75, &even(75)), QualityAction::Accept);
        assert_eq!(config.action_for(60, &even(60)), QualityAction::AutoRewrite);
        assert_eq!(config.action_for(20, &even(20)), QualityAction::FlagForReview);

        // One failing dimension blocks acceptance.
        let lopsided = DimensionScores { consistency: 30, ..even(100) };
        assert_eq!(config.action_for(80, &lopsided), QualityAction::AutoRewrite);
    }

    #[test]
    fn test_weighted_overall() {
        let weights = QualityWeights::default();
        let perfect = DimensionScores { style: 100, consistency: 100, variety: 100, structure: 100 };
        assert_eq!(weights.overall(&perfect), 100);
        let no_consistency = DimensionScores { consistency: 0, ..perfect };
        assert_eq!(weights.overall(&no_consistency), 65);
    }
}
