//! One-shot distillation of a world document into structured constraints.

use super::fact::{fact_key, normalize_predicate, AuthorityLevel, Fact, FactCategory, FactValue};
use crate::generation::{repair, GenerationError, GenerationRequest, Generator, Purpose};
use crate::prompts;
use crate::text::contains_word;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info};

/// Default cap on mutable constraints included in one context.
pub const DEFAULT_MUTABLE_LIMIT: usize = 30;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("could not parse constraint output")]
    Unparseable,
}

/// Whether violating a constraint is a continuity error or a plot development.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    /// Violation is a continuity error. Always in context.
    Immutable,
    /// Violation is an allowed development. In context only when relevant.
    Mutable,
}

/// A structured fact distilled from the world document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldConstraint {
    pub subject: String,
    pub predicate: String,
    pub value: FactValue,
    pub kind: ConstraintKind,
    pub category: FactCategory,
    /// Extra trigger words for relevance matching.
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl WorldConstraint {
    pub fn key(&self) -> String {
        fact_key(&self.subject, &self.predicate)
    }

    pub fn describe(&self) -> String {
        format!("{} {}: {}", self.subject, self.predicate.replace('_', " "), self.value)
    }

    /// Whether the subject or any keyword appears in `text`.
    pub fn is_relevant_to(&self, text: &str) -> bool {
        contains_word(text, &self.subject) || self.keywords.iter().any(|k| contains_word(text, k))
    }

    /// Immutable constraints become canon; mutable ones start as narrated.
    pub fn to_fact(&self) -> Fact {
        let authority = match self.kind {
            ConstraintKind::Immutable => AuthorityLevel::Canon,
            ConstraintKind::Mutable => AuthorityLevel::Narrated,
        };
        Fact::new(&self.subject, &self.predicate, self.value.clone(), authority).with_category(self.category)
    }
}

/// Deduplicated constraints, split by kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSet {
    pub immutable: Vec<WorldConstraint>,
    pub mutable: Vec<WorldConstraint>,
}

impl ConstraintSet {
    pub fn len(&self) -> usize {
        self.immutable.len() + self.mutable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mutable constraints triggered by `text`, in document order, capped.
    pub fn relevant_mutable(&self, text: &str, limit: usize) -> Vec<&WorldConstraint> {
        self.mutable
            .iter()
            .filter(|c| c.is_relevant_to(text))
            .take(limit)
            .collect()
    }

    /// All constraints as facts for the canon store.
    pub fn to_facts(&self) -> Vec<Fact> {
        self.immutable
            .iter()
            .chain(self.mutable.iter())
            .map(WorldConstraint::to_fact)
            .collect()
    }

    /// Recover constraints from stored planning-time facts (source 0):
    /// canon facts become immutable, narrated ones mutable. Keywords are not
    /// stored with facts, so mutable constraints match by subject only.
    pub fn from_world_facts<'a>(facts: impl IntoIterator<Item = &'a Fact>) -> Self {
        let mut set = ConstraintSet::default();
        for fact in facts.into_iter().filter(|f| f.source_installment == 0) {
            let kind = match fact.authority {
                AuthorityLevel::Canon => ConstraintKind::Immutable,
                AuthorityLevel::Narrated => ConstraintKind::Mutable,
                _ => continue,
            };
            set.push(WorldConstraint {
                subject: fact.subject.clone(),
                predicate: fact.predicate.clone(),
                value: fact.value.clone(),
                kind,
                category: fact.category,
                keywords: Vec::new(),
            });
        }
        set.immutable.sort_by_key(WorldConstraint::key);
        set.mutable.sort_by_key(WorldConstraint::key);
        set
    }

    fn push(&mut self, constraint: WorldConstraint) {
        match constraint.kind {
            ConstraintKind::Immutable => self.immutable.push(constraint),
            ConstraintKind::Mutable => self.mutable.push(constraint),
        }
    }
}

/// Entry as the model writes it; every field optional until validated.
#[derive(Debug, Deserialize)]
struct RawConstraint {
    subject: Option<String>,
    predicate: Option<String>,
    value: Option<FactValue>,
    kind: Option<String>,
    category: Option<String>,
    #[serde(default)]
    keywords: Vec<String>,
}

impl RawConstraint {
    fn validate(self, bucket: Option<ConstraintKind>) -> Option<WorldConstraint> {
        let subject = self.subject.filter(|s| !s.trim().is_empty())?;
        let predicate = self.predicate.filter(|p| !p.trim().is_empty())?;
        let value = self.value.filter(|v| !v.normalized().is_empty())?;
        let kind = match bucket {
            Some(kind) => kind,
            None => match self.kind?.trim().to_lowercase().as_str() {
                "immutable" | "fixed" | "hard" => ConstraintKind::Immutable,
                "mutable" | "soft" | "changeable" => ConstraintKind::Mutable,
                _ => return None,
            },
        };
        let category = self
            .category
            .and_then(|c| c.parse().ok())
            .unwrap_or_else(|| FactCategory::from_predicate(&predicate));

        Some(WorldConstraint {
            subject: subject.trim().to_string(),
            predicate: normalize_predicate(&predicate),
            value,
            kind,
            category,
            keywords: self
                .keywords
                .into_iter()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect(),
        })
    }
}

/// Turns a foundational world description into a [`ConstraintSet`].
#[derive(Debug, Clone)]
pub struct ConstraintExtractor {
    max_output_tokens: usize,
}

impl Default for ConstraintExtractor {
    fn default() -> Self {
        Self {
            max_output_tokens: 4000,
        }
    }
}

impl ConstraintExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_output_tokens(mut self, max: usize) -> Self {
        self.max_output_tokens = max;
        self
    }

    /// Run the extraction pass over `world_document`.
    pub async fn extract(
        &self,
        generator: &dyn Generator,
        world_document: &str,
    ) -> Result<ConstraintSet, ExtractError> {
        let request = GenerationRequest::new(
            Purpose::ConstraintExtraction,
            prompts::CONSTRAINT_EXTRACTION,
            format!("World document:\n\n{world_document}"),
        )
        .with_max_output_tokens(self.max_output_tokens)
        .with_temperature(0.1);

        let raw = generator.invoke(request).await?;
        let set = Self::parse(&raw)?;
        info!(
            immutable = set.immutable.len(),
            mutable = set.mutable.len(),
            "world constraints extracted"
        );
        Ok(set)
    }

    /// Parse model output. Accepts `{"immutable": [...], "mutable": [...]}`
    /// or a flat array whose entries carry a `kind`.
    ///
    /// Entries missing a required field are dropped; duplicates by
    /// (subject, predicate) keep the first occurrence.
    pub fn parse(raw: &str) -> Result<ConstraintSet, ExtractError> {
        let value = repair::repair_json(raw).ok_or(ExtractError::Unparseable)?;

        let entries: Vec<(Value, Option<ConstraintKind>)> = match value {
            Value::Array(items) => items.into_iter().map(|item| (item, None)).collect(),
            Value::Object(mut map) => {
                let mut entries = Vec::new();
                for (field, kind) in [
                    ("immutable", ConstraintKind::Immutable),
                    ("mutable", ConstraintKind::Mutable),
                ] {
                    if let Some(Value::Array(items)) = map.remove(field) {
                        entries.extend(items.into_iter().map(|item| (item, Some(kind))));
                    }
                }
                if let Some(Value::Array(items)) = map.remove("constraints") {
                    entries.extend(items.into_iter().map(|item| (item, None)));
                }
                entries
            }
            _ => return Err(ExtractError::Unparseable),
        };

        let mut set = ConstraintSet::default();
        let mut seen = HashSet::new();
        let mut dropped = 0usize;

        for (entry, bucket) in entries {
            let constraint = serde_json::from_value::<RawConstraint>(entry)
                .ok()
                .and_then(|raw| raw.validate(bucket));
            match constraint {
                Some(constraint) if seen.insert(constraint.key()) => set.push(constraint),
                _ => dropped += 1,
            }
        }

        if dropped > 0 {
            debug!(dropped, "dropped invalid or duplicate constraints");
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockGenerator;

    const WORLD_JSON: &str = r#"{
        "immutable": [
            {"subject": "The Veil", "predicate": "magic_rule", "value": "every spell costs a memory", "category": "world_rule"},
            {"subject": "Kael", "predicate": "birthplace", "value": "Ashford"},
            {"subject": "Kael", "predicate": "Birthplace", "value": "Elsewhere"}
        ],
        "mutable": [
            {"subject": "Kael", "predicate": "rank", "value": "squire", "keywords": ["knighthood"]},
            {"subject": "Ashford", "predicate": "ruler", "value": "Lord Bren"},
            {"subject": "", "predicate": "ruler", "value": "nobody"},
            {"predicate": "ruler", "value": "nobody"}
        ]
    }"#;

    #[test]
    fn test_parse_object_shape_with_dedup_and_validation() {
        let set = ConstraintExtractor::parse(WORLD_JSON).unwrap();
        assert_eq!(set.immutable.len(), 2);
        assert_eq!(set.mutable.len(), 2);

        // First occurrence kept.
        assert_eq!(set.immutable[1].value, FactValue::text("Ashford"));
        assert_eq!(set.immutable[0].category, FactCategory::WorldRule);
        assert_eq!(set.mutable[0].category, FactCategory::PowerLevel);
    }

    #[test]
    fn test_parse_flat_array_requires_kind() {
        let raw = r#"[
            {"subject": "Kael", "predicate": "eye_color", "value": "grey", "kind": "immutable"},
            {"subject": "Kael", "predicate": "location", "value": "Ashford", "kind": "mutable"},
            {"subject": "Kael", "predicate": "mood", "value": "grim"}
        ]"#;
        let set = ConstraintExtractor::parse(raw).unwrap();
        assert_eq!(set.immutable.len(), 1);
        assert_eq!(set.mutable.len(), 1);
    }

    #[test]
    fn test_parse_truncated_output() {
        let raw = r#"```json
{"immutable": [{"subject": "The Veil", "predicate": "magic_rule", "value": "costs memory"}], "mutable": [{"subject": "Kael", "predi"#;
        let set = ConstraintExtractor::parse(raw).unwrap();
        assert_eq!(set.immutable.len(), 1);
        assert!(set.mutable.is_empty());
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(matches!(ConstraintExtractor::parse("I cannot do that."), Err(ExtractError::Unparseable)));
    }

    #[test]
    fn test_relevant_mutable_matches_subject_and_keywords() {
        let set = ConstraintExtractor::parse(WORLD_JSON).unwrap();

        let hits = set.relevant_mutable("The squire dreamed of knighthood.", DEFAULT_MUTABLE_LIMIT);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].subject, "Kael");

        let hits = set.relevant_mutable("Kael rode back to Ashford.", DEFAULT_MUTABLE_LIMIT);
        assert_eq!(hits.len(), 2);

        let hits = set.relevant_mutable("Kael rode back to Ashford.", 1);
        assert_eq!(hits.len(), 1);
        assert!(set.relevant_mutable("Nothing here.", DEFAULT_MUTABLE_LIMIT).is_empty());
    }

    #[test]
    fn test_to_facts_authority() {
        let set = ConstraintExtractor::parse(WORLD_JSON).unwrap();
        let facts = set.to_facts();
        assert_eq!(facts.len(), 4);
        assert!(facts[..2].iter().all(|f| f.authority == AuthorityLevel::Canon));
        assert!(facts[2..].iter().all(|f| f.authority == AuthorityLevel::Narrated));
    }

    #[test]
    fn test_rebuild_from_world_facts() {
        let set = ConstraintExtractor::parse(WORLD_JSON).unwrap();
        let mut facts = set.to_facts();
        facts.push(Fact::new("Kael", "mood", "grim", AuthorityLevel::Narrated).with_source(4));

        let rebuilt = ConstraintSet::from_world_facts(&facts);
        assert_eq!(rebuilt.immutable.len(), 2);
        assert_eq!(rebuilt.mutable.len(), 2);
        assert!(rebuilt
            .immutable
            .iter()
            .any(|c| c.subject == "The Veil" && c.category == FactCategory::WorldRule));
        assert!(rebuilt.mutable.iter().all(|c| c.predicate != "mood"));
    }

    #[tokio::test]
    async fn test_extract_through_generator() {
        let mock = MockGenerator::new();
        mock.push_response(Purpose::ConstraintExtraction, WORLD_JSON);

        let set = ConstraintExtractor::new().extract(&mock, "A world of memory magic.").await.unwrap();
        assert_eq!(set.len(), 4);

        let calls = mock.calls();
        assert_eq!(calls[0].purpose, Purpose::ConstraintExtraction);
        assert!(calls[0].user.contains("memory magic"));
    }
}
