//! Canonical facts about the story world.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FactId(Uuid);

impl FactId {
    /// Create a new unique fact ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FactId {
    fn default() -> Self {
        Self::new()
    }
}

/// How canonically binding a fact is. Later variants outrank earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityLevel {
    /// Guessed from prose by extraction.
    Inferred,
    /// Stated directly in an installment.
    Narrated,
    /// Confirmed by repetition or by its weight (deaths, world-changing events).
    Established,
    /// From the story plan or world bible.
    Foundational,
    /// Immutable world constraint.
    Canon,
}

impl AuthorityLevel {
    pub fn name(&self) -> &'static str {
        match self {
            AuthorityLevel::Inferred => "inferred",
            AuthorityLevel::Narrated => "narrated",
            AuthorityLevel::Established => "established",
            AuthorityLevel::Foundational => "foundational",
            AuthorityLevel::Canon => "canon",
        }
    }
}

impl FromStr for AuthorityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "inferred" | "low" => Ok(AuthorityLevel::Inferred),
            "narrated" | "medium" => Ok(AuthorityLevel::Narrated),
            "established" | "high" => Ok(AuthorityLevel::Established),
            "foundational" => Ok(AuthorityLevel::Foundational),
            "canon" | "immutable" => Ok(AuthorityLevel::Canon),
            other => Err(format!("unknown authority level: {other}")),
        }
    }
}

/// A fact's value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FactValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FactValue {
    pub fn text(value: impl Into<String>) -> Self {
        FactValue::Text(value.into())
    }

    /// Comparable form: lowercase text with collapsed whitespace.
    pub fn normalized(&self) -> String {
        match self {
            FactValue::Bool(b) => b.to_string(),
            FactValue::Number(n) => n.to_string(),
            FactValue::Text(t) => crate::text::normalize(t),
        }
    }

    /// Equality after normalization. `"True"` and `true` are the same value.
    pub fn same_as(&self, other: &FactValue) -> bool {
        self.normalized() == other.normalized()
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FactValue::Bool(b) => Some(*b),
            FactValue::Text(t) => match crate::text::normalize(t).as_str() {
                "true" | "yes" => Some(true),
                "false" | "no" => Some(false),
                _ => None,
            },
            FactValue::Number(_) => None,
        }
    }
}

impl fmt::Display for FactValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactValue::Bool(b) => write!(f, "{b}"),
            FactValue::Number(n) => write!(f, "{n}"),
            FactValue::Text(t) => write!(f, "{t}"),
        }
    }
}

impl From<bool> for FactValue {
    fn from(value: bool) -> Self {
        FactValue::Bool(value)
    }
}

impl From<&str> for FactValue {
    fn from(value: &str) -> Self {
        FactValue::Text(value.to_string())
    }
}

impl From<String> for FactValue {
    fn from(value: String) -> Self {
        FactValue::Text(value)
    }
}

/// How severe a continuity problem is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Minor,
    Major,
    Critical,
}

/// Categories of facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactCategory {
    /// Alive, dead, missing, transformed.
    CharacterStatus,
    /// Laws of the world: magic costs, geography, politics.
    WorldRule,
    /// Strength, rank, cultivation stage.
    PowerLevel,
    Relationship,
    Location,
    Possession,
    /// Personality and appearance.
    Trait,
    Event,
    Other,
}

impl FactCategory {
    pub fn name(&self) -> &'static str {
        match self {
            FactCategory::CharacterStatus => "character_status",
            FactCategory::WorldRule => "world_rule",
            FactCategory::PowerLevel => "power_level",
            FactCategory::Relationship => "relationship",
            FactCategory::Location => "location",
            FactCategory::Possession => "possession",
            FactCategory::Trait => "trait",
            FactCategory::Event => "event",
            FactCategory::Other => "other",
        }
    }

    /// Issue severity for a conflict in this category.
    pub fn severity(&self) -> Severity {
        match self {
            FactCategory::CharacterStatus | FactCategory::WorldRule => Severity::Critical,
            FactCategory::PowerLevel => Severity::Major,
            _ => Severity::Minor,
        }
    }

    /// Categories describing a living entity's current state. A dead entity
    /// cannot acquire new ones.
    pub fn is_state_changing(&self) -> bool {
        matches!(
            self,
            FactCategory::CharacterStatus
                | FactCategory::Location
                | FactCategory::PowerLevel
                | FactCategory::Possession
        )
    }

    /// Guess the category from a predicate name.
    pub fn from_predicate(predicate: &str) -> Self {
        let p = normalize_predicate(predicate);
        let has = |needles: &[&str]| needles.iter().any(|n| p.contains(n));

        if has(&["dead", "alive", "status", "condition", "missing", "injur"]) {
            FactCategory::CharacterStatus
        } else if has(&["rule", "law", "cost", "forbidden", "cannot", "requires"]) {
            FactCategory::WorldRule
        } else if has(&["power", "level", "rank", "realm", "stage", "tier", "strength"]) {
            FactCategory::PowerLevel
        } else if has(&["ally", "enemy", "rival", "friend", "mentor", "loves", "married", "relationship", "sibling", "parent"]) {
            FactCategory::Relationship
        } else if has(&["location", "located", "lives", "resides", "at_", "in_"]) {
            FactCategory::Location
        } else if has(&["owns", "possess", "has_", "wields", "carries", "holds"]) {
            FactCategory::Possession
        } else if has(&["trait", "personality", "appearance", "eye", "hair", "temperament"]) {
            FactCategory::Trait
        } else if has(&["event", "happened", "occurred", "battle", "war"]) {
            FactCategory::Event
        } else {
            FactCategory::Other
        }
    }
}

impl FromStr for FactCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_predicate(s).as_str() {
            "character_status" | "status" => Ok(FactCategory::CharacterStatus),
            "world_rule" | "rule" => Ok(FactCategory::WorldRule),
            "power_level" | "power" => Ok(FactCategory::PowerLevel),
            "relationship" => Ok(FactCategory::Relationship),
            "location" => Ok(FactCategory::Location),
            "possession" | "item" => Ok(FactCategory::Possession),
            "trait" => Ok(FactCategory::Trait),
            "event" => Ok(FactCategory::Event),
            "other" => Ok(FactCategory::Other),
            other => Err(format!("unknown fact category: {other}")),
        }
    }
}

/// Lowercase, trimmed, spaces and dashes as underscores.
pub fn normalize_predicate(predicate: &str) -> String {
    predicate
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() || c == '-' { '_' } else { c })
        .collect()
}

/// Lookup key: at most one active fact exists per key.
pub fn fact_key(subject: &str, predicate: &str) -> String {
    format!("{}::{}", crate::text::normalize(subject), normalize_predicate(predicate))
}

/// A single assertion about the story world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: FactId,
    pub subject: String,
    pub predicate: String,
    pub value: FactValue,
    pub category: FactCategory,
    pub authority: AuthorityLevel,
    /// Installment that asserted this fact; 0 for planning-time facts.
    pub source_installment: u32,
    pub confidence: f32,
    /// First installment the fact holds for.
    #[serde(default)]
    pub valid_from: Option<u32>,
    /// First installment the fact no longer holds for.
    #[serde(default)]
    pub valid_until: Option<u32>,
}

impl Fact {
    /// Create a fact, inferring its category from the predicate.
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        value: impl Into<FactValue>,
        authority: AuthorityLevel,
    ) -> Self {
        let predicate = predicate.into();
        Self {
            id: FactId::new(),
            subject: subject.into().trim().to_string(),
            category: FactCategory::from_predicate(&predicate),
            predicate: normalize_predicate(&predicate),
            value: value.into(),
            authority,
            source_installment: 0,
            confidence: 1.0,
            valid_from: None,
            valid_until: None,
        }
    }

    pub fn with_category(mut self, category: FactCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_source(mut self, installment: u32) -> Self {
        self.source_installment = installment;
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_validity(mut self, from: Option<u32>, until: Option<u32>) -> Self {
        self.valid_from = from;
        self.valid_until = until;
        self
    }

    pub fn key(&self) -> String {
        fact_key(&self.subject, &self.predicate)
    }

    /// Whether the fact holds at the given installment.
    pub fn is_active_at(&self, installment: u32) -> bool {
        self.valid_from.map_or(true, |from| installment >= from)
            && self.valid_until.map_or(true, |until| installment < until)
    }

    /// Whether this fact asserts that its subject is dead.
    pub fn is_death_fact(&self) -> bool {
        match self.predicate.as_str() {
            "is_dead" | "dead" => self.value.as_bool() == Some(true),
            "is_alive" | "alive" => self.value.as_bool() == Some(false),
            "status" | "state" | "condition" | "life_status" => matches!(
                self.value.normalized().as_str(),
                "dead" | "deceased" | "killed" | "slain"
            ),
            _ => false,
        }
    }

    /// One-line form for prompt context.
    pub fn describe(&self) -> String {
        format!("{} {}: {}", self.subject, self.predicate.replace('_', " "), self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authority_ordering() {
        assert!(AuthorityLevel::Canon > AuthorityLevel::Foundational);
        assert!(AuthorityLevel::Foundational > AuthorityLevel::Established);
        assert!(AuthorityLevel::Established > AuthorityLevel::Narrated);
        assert!(AuthorityLevel::Narrated > AuthorityLevel::Inferred);
        assert_eq!("HIGH".parse::<AuthorityLevel>(), Ok(AuthorityLevel::Established));
    }

    #[test]
    fn test_value_normalization() {
        assert!(FactValue::text("  The Iron  Keep ").same_as(&FactValue::text("the iron keep")));
        assert!(!FactValue::Bool(true).same_as(&FactValue::Bool(false)));
        assert_eq!(FactValue::text("Yes").as_bool(), Some(true));
    }

    #[test]
    fn test_untagged_value_serde() {
        let v: FactValue = serde_json::from_str("true").unwrap();
        assert_eq!(v, FactValue::Bool(true));
        let v: FactValue = serde_json::from_str("3").unwrap();
        assert_eq!(v, FactValue::Number(3.0));
        let v: FactValue = serde_json::from_str("\"north\"").unwrap();
        assert_eq!(v, FactValue::text("north"));
    }

    #[test]
    fn test_category_inference_and_severity() {
        assert_eq!(FactCategory::from_predicate("is_dead"), FactCategory::CharacterStatus);
        assert_eq!(FactCategory::from_predicate("magic rule"), FactCategory::WorldRule);
        assert_eq!(FactCategory::from_predicate("cultivation_realm"), FactCategory::PowerLevel);
        assert_eq!(FactCategory::from_predicate("mentor_of"), FactCategory::Relationship);
        assert_eq!(FactCategory::from_predicate("favorite_food"), FactCategory::Other);

        assert_eq!(FactCategory::CharacterStatus.severity(), Severity::Critical);
        assert_eq!(FactCategory::WorldRule.severity(), Severity::Critical);
        assert_eq!(FactCategory::PowerLevel.severity(), Severity::Major);
        assert_eq!(FactCategory::Location.severity(), Severity::Minor);
    }

    #[test]
    fn test_key_is_case_insensitive() {
        let a = Fact::new("Mira", "Is Dead", true, AuthorityLevel::Narrated);
        let b = Fact::new("mira ", "is_dead", false, AuthorityLevel::Narrated);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_death_fact_detection() {
        assert!(Fact::new("A", "is_dead", true, AuthorityLevel::Narrated).is_death_fact());
        assert!(!Fact::new("A", "is_dead", false, AuthorityLevel::Narrated).is_death_fact());
        assert!(Fact::new("A", "status", "Deceased", AuthorityLevel::Narrated).is_death_fact());
        assert!(Fact::new("A", "is_alive", false, AuthorityLevel::Narrated).is_death_fact());
        assert!(!Fact::new("A", "location", "dead marshes", AuthorityLevel::Narrated).is_death_fact());
    }

    #[test]
    fn test_validity_window() {
        let fact = Fact::new("A", "location", "keep", AuthorityLevel::Narrated)
            .with_validity(Some(5), Some(10));
        assert!(!fact.is_active_at(4));
        assert!(fact.is_active_at(5));
        assert!(fact.is_active_at(9));
        assert!(!fact.is_active_at(10));
    }
}
