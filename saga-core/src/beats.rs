//! Beat ledger: cooldowns on recognizable narrative devices.
//!
//! A beat used at installment `n` is forbidden for every installment
//! `m < n + cooldown` and allowed again from `n + cooldown` on.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Recognizable narrative devices subject to repetition cooldowns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeatType {
    // Minor reaction beats.
    ShockedReaction,
    Banter,
    InnerReflection,
    // Moderate beats.
    RivalTaunt,
    NarrowEscape,
    TrainingSession,
    Flashback,
    PowerReveal,
    // Major beats.
    Ambush,
    SecretRevealed,
    Tournament,
    Betrayal,
    AllyDeath,
    // Rare structural beats.
    Prophecy,
    TimeSkip,
    WorldShift,
    Resurrection,
}

impl BeatType {
    pub const ALL: [BeatType; 17] = [
        BeatType::ShockedReaction,
        BeatType::Banter,
        BeatType::InnerReflection,
        BeatType::RivalTaunt,
        BeatType::NarrowEscape,
        BeatType::TrainingSession,
        BeatType::Flashback,
        BeatType::PowerReveal,
        BeatType::Ambush,
        BeatType::SecretRevealed,
        BeatType::Tournament,
        BeatType::Betrayal,
        BeatType::AllyDeath,
        BeatType::Prophecy,
        BeatType::TimeSkip,
        BeatType::WorldShift,
        BeatType::Resurrection,
    ];

    /// Installments before the beat may be used again.
    pub fn default_cooldown(&self) -> u32 {
        match self {
            BeatType::ShockedReaction => 3,
            BeatType::Banter => 3,
            BeatType::InnerReflection => 4,
            BeatType::RivalTaunt => 5,
            BeatType::NarrowEscape => 6,
            BeatType::TrainingSession => 7,
            BeatType::Flashback => 8,
            BeatType::PowerReveal => 10,
            BeatType::Ambush => 12,
            BeatType::SecretRevealed => 15,
            BeatType::Tournament => 25,
            BeatType::Betrayal => 30,
            BeatType::AllyDeath => 40,
            BeatType::Prophecy => 50,
            BeatType::TimeSkip => 60,
            BeatType::WorldShift => 80,
            BeatType::Resurrection => 100,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BeatType::ShockedReaction => "shocked_reaction",
            BeatType::Banter => "banter",
            BeatType::InnerReflection => "inner_reflection",
            BeatType::RivalTaunt => "rival_taunt",
            BeatType::NarrowEscape => "narrow_escape",
            BeatType::TrainingSession => "training_session",
            BeatType::Flashback => "flashback",
            BeatType::PowerReveal => "power_reveal",
            BeatType::Ambush => "ambush",
            BeatType::SecretRevealed => "secret_revealed",
            BeatType::Tournament => "tournament",
            BeatType::Betrayal => "betrayal",
            BeatType::AllyDeath => "ally_death",
            BeatType::Prophecy => "prophecy",
            BeatType::TimeSkip => "time_skip",
            BeatType::WorldShift => "world_shift",
            BeatType::Resurrection => "resurrection",
        }
    }

    /// Human-readable form for prompts.
    pub fn description(&self) -> &'static str {
        match self {
            BeatType::ShockedReaction => "a character frozen in shock at a revelation",
            BeatType::Banter => "light banter between companions",
            BeatType::InnerReflection => "a quiet inner monologue",
            BeatType::RivalTaunt => "a rival mocking the protagonist",
            BeatType::NarrowEscape => "a last-second escape",
            BeatType::TrainingSession => "a training or practice scene",
            BeatType::Flashback => "a flashback to the past",
            BeatType::PowerReveal => "a reveal of hidden strength",
            BeatType::Ambush => "an ambush",
            BeatType::SecretRevealed => "a major secret coming to light",
            BeatType::Tournament => "a tournament or formal contest",
            BeatType::Betrayal => "a betrayal by someone trusted",
            BeatType::AllyDeath => "the death of an ally",
            BeatType::Prophecy => "a prophecy or omen",
            BeatType::TimeSkip => "a jump forward in time",
            BeatType::WorldShift => "a world-altering event",
            BeatType::Resurrection => "someone returning from death",
        }
    }
}

impl fmt::Display for BeatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BeatType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted: String = s
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c })
            .collect();
        BeatType::ALL
            .iter()
            .find(|beat| beat.name() == wanted)
            .copied()
            .ok_or_else(|| format!("unknown beat type: {s}"))
    }
}

/// One recorded use of a beat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeatUsage {
    pub installment: u32,
    pub beat: BeatType,
    /// First installment at which the beat is usable again.
    pub cooldown_expiry: u32,
}

/// Append-only log of beat uses with a last-used index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BeatLedger {
    usages: Vec<BeatUsage>,
    last_used: HashMap<BeatType, u32>,
    #[serde(default)]
    cooldown_overrides: HashMap<BeatType, u32>,
}

impl BeatLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the cooldown for one beat type.
    pub fn with_cooldown(mut self, beat: BeatType, cooldown: u32) -> Self {
        self.cooldown_overrides.insert(beat, cooldown);
        self
    }

    pub fn cooldown(&self, beat: BeatType) -> u32 {
        self.cooldown_overrides
            .get(&beat)
            .copied()
            .unwrap_or_else(|| beat.default_cooldown())
    }

    /// True iff the beat was never used, or `at >= last use + cooldown`.
    pub fn can_use(&self, beat: BeatType, at: u32) -> bool {
        match self.last_used.get(&beat) {
            None => true,
            Some(&last) => at >= last.saturating_add(self.cooldown(beat)),
        }
    }

    /// Record a use. The last-used index only moves forward, so replaying an
    /// older installment does not shorten an active cooldown.
    pub fn record_use(&mut self, beat: BeatType, at: u32) -> BeatUsage {
        let usage = BeatUsage {
            installment: at,
            beat,
            cooldown_expiry: at.saturating_add(self.cooldown(beat)),
        };
        self.usages.push(usage.clone());
        let last = self.last_used.entry(beat).or_insert(at);
        *last = (*last).max(at);
        usage
    }

    /// Beat types currently forbidden at `at`, in declaration order.
    pub fn restrictions(&self, at: u32) -> Vec<BeatType> {
        BeatType::ALL
            .iter()
            .copied()
            .filter(|beat| !self.can_use(*beat, at))
            .collect()
    }

    /// Restrictions phrased as a negative generation constraint.
    pub fn restriction_prompt(&self, at: u32) -> Option<String> {
        let forbidden = self.restrictions(at);
        if forbidden.is_empty() {
            return None;
        }
        let mut out = String::from("Do NOT use these narrative devices in this installment (used too recently):\n");
        for beat in forbidden {
            let last = self.last_used.get(&beat).copied().unwrap_or_default();
            out.push_str(&format!(
                "- {} (last used in installment {}, available again at {})\n",
                beat.description(),
                last,
                last.saturating_add(self.cooldown(beat))
            ));
        }
        Some(out)
    }

    /// Longest cooldown of any beat type. Uses older than this many
    /// installments no longer restrict anything.
    pub fn longest_cooldown(&self) -> u32 {
        BeatType::ALL.iter().map(|beat| self.cooldown(*beat)).max().unwrap_or(0)
    }

    /// Rebuild a ledger from recorded (beat, installment) uses.
    pub fn replay(mut self, uses: impl IntoIterator<Item = (BeatType, u32)>) -> Self {
        for (beat, at) in uses {
            self.record_use(beat, at);
        }
        self
    }

    pub fn usages(&self) -> &[BeatUsage] {
        &self.usages
    }

    pub fn last_used(&self, beat: BeatType) -> Option<u32> {
        self.last_used.get(&beat).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unused_beat_is_usable() {
        let ledger = BeatLedger::new();
        assert!(BeatType::ALL.iter().all(|beat| ledger.can_use(*beat, 1)));
        assert!(ledger.restrictions(1).is_empty());
        assert!(ledger.restriction_prompt(1).is_none());
    }

    #[test]
    fn test_cooldown_window_is_exact() {
        for beat in BeatType::ALL {
            let mut ledger = BeatLedger::new();
            let n = 17;
            let usage = ledger.record_use(beat, n);
            let cooldown = beat.default_cooldown();
            assert_eq!(usage.cooldown_expiry, n + cooldown);

            for m in n..n + cooldown {
                assert!(!ledger.can_use(beat, m), "{beat} usable at {m}");
            }
            assert!(ledger.can_use(beat, n + cooldown));
            assert!(ledger.can_use(beat, n + cooldown + 50));
        }
    }

    #[test]
    fn test_cooldown_ranges() {
        assert!(BeatType::ShockedReaction.default_cooldown() <= 3);
        assert_eq!(BeatType::Resurrection.default_cooldown(), 100);
    }

    #[test]
    fn test_restrictions() {
        let mut ledger = BeatLedger::new();
        ledger.record_use(BeatType::Banter, 10);
        ledger.record_use(BeatType::Betrayal, 5);

        assert_eq!(ledger.restrictions(11), vec![BeatType::Banter, BeatType::Betrayal]);
        assert_eq!(ledger.restrictions(13), vec![BeatType::Betrayal]);
        assert!(ledger.restrictions(35).is_empty());

        let prompt = ledger.restriction_prompt(11).unwrap();
        assert!(prompt.contains("betrayal by someone trusted"));
        assert!(prompt.contains("available again at 35"));
    }

    #[test]
    fn test_older_use_does_not_shorten_cooldown() {
        let mut ledger = BeatLedger::new();
        ledger.record_use(BeatType::Ambush, 20);
        ledger.record_use(BeatType::Ambush, 5);
        assert_eq!(ledger.last_used(BeatType::Ambush), Some(20));
        assert!(!ledger.can_use(BeatType::Ambush, 25));
        assert_eq!(ledger.usages().len(), 2);
    }

    #[test]
    fn test_cooldown_override() {
        let mut ledger = BeatLedger::new().with_cooldown(BeatType::Flashback, 2);
        ledger.record_use(BeatType::Flashback, 4);
        assert!(!ledger.can_use(BeatType::Flashback, 5));
        assert!(ledger.can_use(BeatType::Flashback, 6));
    }

    #[test]
    fn test_parse_beat_type() {
        assert_eq!("Secret Revealed".parse::<BeatType>(), Ok(BeatType::SecretRevealed));
        assert_eq!("time-skip".parse::<BeatType>(), Ok(BeatType::TimeSkip));
        assert!("dance_off".parse::<BeatType>().is_err());
    }

    #[test]
    fn test_replay_restores_cooldowns() {
        let ledger = BeatLedger::new().replay([(BeatType::Betrayal, 10), (BeatType::Banter, 11)]);
        assert!(!ledger.can_use(BeatType::Betrayal, 39));
        assert!(ledger.can_use(BeatType::Betrayal, 40));
        assert_eq!(ledger.restrictions(12), vec![BeatType::Banter, BeatType::Betrayal]);
        assert_eq!(ledger.longest_cooldown(), 100);
        assert_eq!(BeatLedger::new().with_cooldown(BeatType::Resurrection, 150).longest_cooldown(), 150);
    }

    #[test]
    fn test_ledger_serializes() {
        let mut ledger = BeatLedger::new();
        ledger.record_use(BeatType::Ambush, 3);
        let json = serde_json::to_string(&ledger).unwrap();
        let restored: BeatLedger = serde_json::from_str(&json).unwrap();
        assert!(!restored.can_use(BeatType::Ambush, 4));
    }
}
