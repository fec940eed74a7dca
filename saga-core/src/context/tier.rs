//! Context detail tiers.

use super::ContextConfig;
use crate::planning::StoryArc;
use serde::{Deserialize, Serialize};

/// How much context an installment gets. The main cost/quality lever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextTier {
    Full,
    Medium,
    Minimal,
}

/// What a tier includes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierProfile {
    /// Raw installments offered to the recent layer.
    pub recent_raw: usize,
    /// Cap on relevant mutable constraints.
    pub max_mutable_facts: usize,
    /// Facts per mentioned subject.
    pub max_subject_facts: usize,
    /// Entries per anti-repetition list.
    pub anti_repetition_items: usize,
    pub include_bible: bool,
}

impl TierProfile {
    pub fn full() -> Self {
        Self {
            recent_raw: 3,
            max_mutable_facts: 30,
            max_subject_facts: 8,
            anti_repetition_items: 20,
            include_bible: true,
        }
    }

    pub fn medium() -> Self {
        Self {
            recent_raw: 2,
            max_mutable_facts: 15,
            max_subject_facts: 5,
            anti_repetition_items: 10,
            include_bible: true,
        }
    }

    pub fn minimal() -> Self {
        Self {
            recent_raw: 1,
            max_mutable_facts: 8,
            max_subject_facts: 3,
            anti_repetition_items: 5,
            include_bible: false,
        }
    }
}

/// Pick the tier for an installment.
///
/// Golden installments and arc start, end and climax get full context.
/// Installments with twist activity, and every `medium_every`th, get medium.
/// Everything else gets minimal.
pub fn classify_tier(
    installment: u32,
    arc: Option<&StoryArc>,
    twist_activity: bool,
    config: &ContextConfig,
) -> ContextTier {
    if installment <= config.golden_installments {
        return ContextTier::Full;
    }
    if let Some(arc) = arc {
        if arc.is_boundary(installment) || arc.climax_installment == installment {
            return ContextTier::Full;
        }
    }
    if twist_activity || (config.medium_every > 0 && installment % config.medium_every == 0) {
        return ContextTier::Medium;
    }
    ContextTier::Minimal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planning::ArcShape;

    #[test]
    fn test_tier_classification() {
        let config = ContextConfig::default();
        let arc = StoryArc::new(2, 11, 20, &ArcShape::default(), "trial");

        assert_eq!(classify_tier(3, None, false, &config), ContextTier::Full);
        assert_eq!(classify_tier(11, Some(&arc), false, &config), ContextTier::Full);
        assert_eq!(classify_tier(20, Some(&arc), false, &config), ContextTier::Full);
        assert_eq!(classify_tier(18, Some(&arc), false, &config), ContextTier::Full);
        assert_eq!(classify_tier(15, Some(&arc), false, &config), ContextTier::Medium);
        assert_eq!(classify_tier(13, Some(&arc), true, &config), ContextTier::Medium);
        assert_eq!(classify_tier(13, Some(&arc), false, &config), ContextTier::Minimal);
    }
}
