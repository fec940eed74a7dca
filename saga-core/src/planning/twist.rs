//! Twists scheduled inside an arc.

use super::arc::StoryArc;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TwistId(Uuid);

impl TwistId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TwistId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TwistType {
    Betrayal,
    HiddenIdentity,
    Revelation,
    Reversal,
    Loss,
    UnexpectedAlly,
    PowerShift,
}

impl TwistType {
    pub const ALL: [TwistType; 7] = [
        TwistType::Betrayal,
        TwistType::HiddenIdentity,
        TwistType::Revelation,
        TwistType::Reversal,
        TwistType::Loss,
        TwistType::UnexpectedAlly,
        TwistType::PowerShift,
    ];

    pub fn description(&self) -> &'static str {
        match self {
            TwistType::Betrayal => "a trusted figure betrays the protagonist",
            TwistType::HiddenIdentity => "someone's true identity comes out",
            TwistType::Revelation => "a hidden truth about the world surfaces",
            TwistType::Reversal => "apparent victory turns into defeat, or the reverse",
            TwistType::Loss => "something or someone important is lost",
            TwistType::UnexpectedAlly => "an enemy or stranger becomes an ally",
            TwistType::PowerShift => "the balance of power shifts suddenly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactLevel {
    Minor,
    Moderate,
    Major,
    Shattering,
}

/// Twist lifecycle: planned, then foreshadowed, then revealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TwistStatus {
    Planned,
    Foreshadowed,
    Revealed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Twist {
    pub id: TwistId,
    pub arc_number: u32,
    pub target_installment: u32,
    pub twist_type: TwistType,
    pub impact: ImpactLevel,
    pub status: TwistStatus,
}

/// Relative window inside an arc where a twist lands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwistWindow {
    /// Start of the window as a fraction of the arc length.
    pub start: f32,
    /// End of the window as a fraction of the arc length.
    pub end: f32,
    pub impact: ImpactLevel,
}

impl TwistWindow {
    pub fn new(start: f32, end: f32, impact: ImpactLevel) -> Self {
        Self { start, end, impact }
    }

    /// Inclusive offset range from the arc start for an arc of `len`
    /// installments.
    pub fn offsets(&self, len: u32) -> (u32, u32) {
        let last = len.saturating_sub(1);
        // The epsilon keeps 10 * 0.9 from flooring to 8.
        let to_offset =
            |fraction: f32| ((len as f32 * fraction.clamp(0.0, 1.0) + 1e-4).floor() as u32).min(last);
        let lo = to_offset(self.start.min(self.end));
        let hi = to_offset(self.start.max(self.end));
        (lo, hi)
    }
}

/// Default windows: a lower-impact twist at 40-50% and a higher-impact one
/// at 80-90% of the arc.
pub fn default_windows() -> Vec<TwistWindow> {
    vec![
        TwistWindow::new(0.4, 0.5, ImpactLevel::Moderate),
        TwistWindow::new(0.8, 0.9, ImpactLevel::Major),
    ]
}

/// Schedule one twist per window. Pure given the random source.
pub fn schedule_twists(arc: &StoryArc, windows: &[TwistWindow], rng: &mut impl Rng) -> Vec<Twist> {
    let len = arc.installment_count();
    windows
        .iter()
        .map(|window| {
            let (lo, hi) = window.offsets(len);
            let offset = rng.gen_range(lo..=hi);
            let twist_type = *TwistType::ALL.choose(rng).unwrap_or(&TwistType::Revelation);
            Twist {
                id: TwistId::new(),
                arc_number: arc.arc_number,
                target_installment: arc.start + offset,
                twist_type,
                impact: window.impact,
                status: TwistStatus::Planned,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planning::arc::ArcShape;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn arc(number: u32, start: u32, end: u32) -> StoryArc {
        StoryArc::new(number, start, end, &ArcShape::default(), "trial")
    }

    #[test]
    fn test_window_offsets() {
        let window = TwistWindow::new(0.4, 0.5, ImpactLevel::Moderate);
        assert_eq!(window.offsets(10), (4, 5));
        assert_eq!(window.offsets(1), (0, 0));
        let late = TwistWindow::new(0.8, 0.9, ImpactLevel::Major);
        assert_eq!(late.offsets(10), (8, 9));
        assert_eq!(late.offsets(3), (2, 2));
    }

    #[test]
    fn test_twists_land_inside_their_windows() {
        let arc = arc(3, 21, 30);
        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            let twists = schedule_twists(&arc, &default_windows(), &mut rng);
            assert_eq!(twists.len(), 2);
            assert!((25..=26).contains(&twists[0].target_installment));
            assert!((29..=30).contains(&twists[1].target_installment));
            assert!(twists[0].impact < twists[1].impact);
            assert!(twists.iter().all(|t| t.arc_number == 3 && t.status == TwistStatus::Planned));
        }
    }

    #[test]
    fn test_scheduling_is_reproducible() {
        let arc = arc(1, 1, 10);
        let a = schedule_twists(&arc, &default_windows(), &mut StdRng::seed_from_u64(7));
        let b = schedule_twists(&arc, &default_windows(), &mut StdRng::seed_from_u64(7));
        let key = |ts: &[Twist]| ts.iter().map(|t| (t.target_installment, t.twist_type)).collect::<Vec<_>>();
        assert_eq!(key(&a), key(&b));
    }
}
