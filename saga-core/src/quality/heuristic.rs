//! Deterministic rule-based scorer.

use super::{DimensionScores, Draft, QualityScorer, ScoringContext};
use crate::text::{self, contains_word, word_overlap};
use std::collections::HashMap;

/// Verbs that mean a character is present and acting.
const ACTION_VERBS: &[&str] = &[
    "said", "says", "replied", "whispered", "shouted", "asked", "answered", "walked", "ran", "smiled",
    "nodded", "laughed", "attacked", "grabbed", "stood", "turned", "drew",
];

/// Words that put a dead character in a legitimate context.
const MEMORY_MARKERS: &[&str] = &[
    "remembered", "remembers", "memory", "memories", "ghost", "corpse", "grave", "body", "funeral",
    "dead", "death", "died", "mourned", "dreamed", "flashback", "once", "used to",
];

/// Scores structure, variety, consistency and style with fixed rules.
#[derive(Debug, Clone)]
pub struct HeuristicScorer {
    min_words: usize,
    max_words: usize,
    min_paragraphs: usize,
    /// Overlap above which two titles/lines count as repeats.
    similarity: f32,
}

impl Default for HeuristicScorer {
    fn default() -> Self {
        Self {
            min_words: 800,
            max_words: 8000,
            min_paragraphs: 3,
            similarity: 0.7,
        }
    }
}

impl HeuristicScorer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_words(mut self, min_words: usize) -> Self {
        self.min_words = min_words;
        self
    }

    pub fn with_min_paragraphs(mut self, min_paragraphs: usize) -> Self {
        self.min_paragraphs = min_paragraphs;
        self
    }

    fn structure(&self, draft: &Draft, issues: &mut Vec<String>) -> i32 {
        let mut score = 100;
        let words = draft.word_count();

        if draft.title.trim().is_empty() {
            score -= 15;
            issues.push("Give the installment a title on the first line as `Title: ...`.".to_string());
        }
        if words < self.min_words && self.min_words > 0 {
            let shortfall = 1.0 - words as f32 / self.min_words as f32;
            score -= (50.0 * shortfall).round() as i32;
            issues.push(format!("Too short: {words} words, aim for at least {}.", self.min_words));
        }
        if words > self.max_words {
            score -= 10;
            issues.push(format!("Too long: {words} words, stay under {}.", self.max_words));
        }
        let paragraphs = draft.body.split("\n\n").filter(|p| !p.trim().is_empty()).count();
        if paragraphs < self.min_paragraphs {
            score -= 15;
            issues.push("Break the text into more paragraphs and scenes.".to_string());
        }
        let ending = draft.body.trim_end().chars().last();
        if !matches!(ending, Some('.' | '!' | '?' | '"' | '\'' | '”' | '’' | '*' | ')' | '…')) {
            score -= 10;
            issues.push("The text stops mid-sentence; finish the final scene.".to_string());
        }
        score
    }

    fn variety(&self, draft: &Draft, context: &ScoringContext, issues: &mut Vec<String>) -> i32 {
        let mut score = 100;
        let similar = |a: &str, b: &str| text::normalize(a) == text::normalize(b) || word_overlap(a, b) >= self.similarity;

        if !draft.title.is_empty() {
            if let Some(prior) = context.prior_titles.iter().find(|t| similar(&draft.title, t)) {
                score -= 30;
                issues.push(format!("The title repeats an earlier one (\"{prior}\"); choose a distinct title."));
            }
        }
        if let Some(opening) = text::first_sentence(&draft.body) {
            if let Some(prior) = context.prior_openings.iter().find(|o| similar(opening, o)) {
                score -= 25;
                issues.push(format!("The opening line mirrors an earlier opening (\"{prior}\"); open differently."));
            }
        }
        if let Some(closing) = text::last_sentence(&draft.body) {
            if let Some(prior) = context.prior_closings.iter().find(|c| similar(closing, c)) {
                score -= 25;
                issues.push(format!("The ending mirrors an earlier ending (\"{prior}\"); end on a different note."));
            }
        }
        score
    }

    fn consistency(&self, draft: &Draft, context: &ScoringContext, issues: &mut Vec<String>) -> i32 {
        let mut score = 100;
        let sentences = text::sentences(&draft.body);

        for name in &context.dead_entities {
            let acting = sentences.iter().any(|sentence| {
                contains_word(sentence, name)
                    && ACTION_VERBS.iter().any(|v| contains_word(sentence, v))
                    && !MEMORY_MARKERS.iter().any(|m| contains_word(sentence, m))
            });
            if acting {
                score -= 60;
                issues.push(format!(
                    "{name} is dead but speaks or acts on the page; remove them or make it a memory."
                ));
            }
        }
        score
    }

    fn style(&self, draft: &Draft, issues: &mut Vec<String>) -> i32 {
        let mut score = 100;
        let sentences = text::sentences(&draft.body);
        if sentences.is_empty() {
            return 0;
        }

        let mut seen: HashMap<String, usize> = HashMap::new();
        for sentence in &sentences {
            if sentence.split_whitespace().count() >= 4 {
                *seen.entry(text::normalize(sentence)).or_default() += 1;
            }
        }
        let repeats: usize = seen.values().filter(|n| **n > 1).map(|n| n - 1).sum();
        if repeats > 0 {
            score -= (10 * repeats as i32).min(40);
            issues.push(format!("{repeats} sentence(s) are repeated verbatim; vary the prose."));
        }

        let total_words: usize = sentences.iter().map(|s| s.split_whitespace().count()).sum();
        let average = total_words as f32 / sentences.len() as f32;
        if sentences.len() >= 5 && !(5.0..=40.0).contains(&average) {
            score -= 15;
            issues.push(format!("Average sentence length is {average:.0} words; aim for a natural mix."));
        }

        if sentences.len() >= 6 {
            let mut starts: HashMap<String, usize> = HashMap::new();
            for sentence in &sentences {
                if let Some(word) = sentence.split_whitespace().next() {
                    *starts.entry(word.to_lowercase()).or_default() += 1;
                }
            }
            if let Some((word, count)) = starts.into_iter().max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0))) {
                if count as f32 / sentences.len() as f32 > 0.3 {
                    score -= 15;
                    issues.push(format!("Too many sentences start with \"{word}\"; vary sentence openings."));
                }
            }
        }
        score
    }
}

impl QualityScorer for HeuristicScorer {
    fn score_dimensions(&self, draft: &Draft, context: &ScoringContext) -> (DimensionScores, Vec<String>) {
        let mut issues = Vec::new();
        let clamp = |v: i32| v.clamp(0, 100) as u8;
        let structure = clamp(self.structure(draft, &mut issues));
        let variety = clamp(self.variety(draft, context, &mut issues));
        let consistency = clamp(self.consistency(draft, context, &mut issues));
        let style = clamp(self.style(draft, &mut issues));
        (
            DimensionScores {
                style,
                consistency,
                variety,
                structure,
            },
            issues,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::{parse_draft, QualityAction, QualityConfig};

    fn good_draft() -> Draft {
        parse_draft(
            "Title: The Ferryman's Price\n\n\
             Rain hammered the docks as Kael searched for the ferryman.\n\n\
             The old man demanded a memory as payment, and Kael hesitated before agreeing.\n\n\
             Across the river, the lanterns of Ashford flickered like dying stars. \
             Something waited for him there, patient and hungry.",
        )
        .unwrap()
    }

    fn scorer() -> HeuristicScorer {
        HeuristicScorer::new().with_min_words(20)
    }

    #[test]
    fn test_good_draft_is_accepted() {
        let report = scorer().score(&good_draft(), &ScoringContext::default(), &QualityConfig::default());
        assert_eq!(report.action, QualityAction::Accept, "{report:?}");
        assert!(report.issues.is_empty());
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let context = ScoringContext {
            prior_titles: vec!["The Ferryman's Price".into()],
            ..ScoringContext::default()
        };
        let config = QualityConfig::default();
        let a = scorer().score(&good_draft(), &context, &config);
        let b = scorer().score(&good_draft(), &context, &config);
        assert_eq!(a, b);
    }

    #[test]
    fn test_repeated_title_and_opening_penalized() {
        let draft = good_draft();
        let context = ScoringContext {
            prior_titles: vec!["the ferryman's price".into()],
            prior_openings: vec!["Rain hammered the docks as Kael searched for the ferryman.".into()],
            ..ScoringContext::default()
        };
        let report = scorer().score(&draft, &context, &QualityConfig::default());
        assert_eq!(report.scores.variety, 45);
        assert_eq!(report.issues.len(), 2);
    }

    #[test]
    fn test_dead_character_speaking_is_inconsistent() {
        let draft = parse_draft("Title: Return\n\nMira smiled and said hello. Kael froze.\n\nLater he remembered Mira laughed once.\n\nThe end.").unwrap();
        let context = ScoringContext {
            dead_entities: vec!["Mira".into()],
            ..ScoringContext::default()
        };
        let report = scorer().score(&draft, &context, &QualityConfig::default());
        assert_eq!(report.scores.consistency, 40);
        assert_ne!(report.action, QualityAction::Accept);
        assert!(report.issues.iter().any(|i| i.contains("Mira is dead")));
    }

    #[test]
    fn test_short_truncated_untitled_draft_scores_low() {
        let draft = parse_draft("Kael walked to the").unwrap();
        let report = HeuristicScorer::new().score(&draft, &ScoringContext::default(), &QualityConfig::default());
        assert!(report.scores.structure < 30);
        assert_ne!(report.action, QualityAction::Accept);
        assert!(report.issues.len() >= 3);
    }
}
