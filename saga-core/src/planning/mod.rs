//! Arc and tension planning.
//!
//! The story is cut into fixed-length arcs. Each arc gets a rise-peak-fall
//! tension curve and a set of twists at configured relative windows. Arcs are
//! derived from the installment number alone, so re-planning after a restart
//! reproduces the same structure.

mod arc;
mod twist;

pub use arc::{ArcShape, ArcStatus, StoryArc};
pub use twist::{
    default_windows, schedule_twists, ImpactLevel, Twist, TwistId, TwistStatus, TwistType, TwistWindow,
};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Fallback arc themes, cycled by arc number.
const DEFAULT_THEMES: &[&str] = &[
    "awakening and first steps",
    "trial by fire",
    "alliances and rivalries",
    "loss and resolve",
    "hidden truths",
    "reckoning",
];

/// Configuration for the arc planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArcPlannerConfig {
    /// Installments per arc.
    pub arc_size: u32,
    pub shape: ArcShape,
    /// One twist per window, per arc.
    pub twist_windows: Vec<TwistWindow>,
    /// How many installments ahead a twist starts being foreshadowed.
    pub foreshadow_lookahead: u32,
    /// Tension used when no arc covers an installment.
    pub default_tension: u8,
    /// Minor character milestone every N installments.
    pub minor_milestone_every: u32,
    /// Major character milestone every N installments.
    pub major_milestone_every: u32,
    /// Seed for twist scheduling.
    pub seed: u64,
}

impl Default for ArcPlannerConfig {
    fn default() -> Self {
        Self {
            arc_size: 10,
            shape: ArcShape::default(),
            twist_windows: default_windows(),
            foreshadow_lookahead: 3,
            default_tension: 50,
            minor_milestone_every: 5,
            major_milestone_every: 10,
            seed: 0,
        }
    }
}

impl ArcPlannerConfig {
    pub fn with_arc_size(mut self, arc_size: u32) -> Self {
        self.arc_size = arc_size.max(1);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_twist_windows(mut self, windows: Vec<TwistWindow>) -> Self {
        self.twist_windows = windows;
        self
    }
}

/// Pacing bucket derived from the tension target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pacing {
    /// Below 40: setup, breathing room.
    Slow,
    /// 40 to 59.
    Moderate,
    /// 60 to 79: escalation.
    Fast,
    /// 80 and above.
    Climax,
}

impl Pacing {
    pub fn from_tension(tension: u8) -> Self {
        match tension {
            0..=39 => Pacing::Slow,
            40..=59 => Pacing::Moderate,
            60..=79 => Pacing::Fast,
            _ => Pacing::Climax,
        }
    }

    fn guidance(&self) -> &'static str {
        match self {
            Pacing::Slow => "Slow pacing: setup, character moments and worldbuilding. Let scenes breathe.",
            Pacing::Moderate => "Moderate pacing: develop the conflict and keep the plot moving.",
            Pacing::Fast => "Fast pacing: escalate. Shorter scenes, rising stakes, little downtime.",
            Pacing::Climax => {
                "Climax mode: maximum intensity. Include a decisive moment that changes the situation, \
                 and end on a cliffhanger."
            }
        }
    }
}

/// Guidance for one installment, composed from the arc plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotObjectives {
    pub installment: u32,
    pub arc_number: u32,
    pub tension: u8,
    pub pacing: Pacing,
    pub directives: Vec<String>,
    /// Twists this installment should foreshadow.
    pub foreshadow: Vec<TwistId>,
    /// Twist this installment should reveal.
    pub reveal: Option<TwistId>,
}

impl PlotObjectives {
    pub fn to_prompt(&self) -> String {
        let mut out = format!(
            "Installment {} objectives (tension target {}/100):\n",
            self.installment, self.tension
        );
        for directive in &self.directives {
            out.push_str("- ");
            out.push_str(directive);
            out.push('\n');
        }
        out
    }
}

/// Owns arcs and twists for one story.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArcPlanner {
    config: ArcPlannerConfig,
    arcs: BTreeMap<u32, StoryArc>,
    twists: Vec<Twist>,
    /// Themes set by the story plan, keyed by arc number.
    #[serde(default)]
    themes: BTreeMap<u32, String>,
}

impl ArcPlanner {
    pub fn new(config: ArcPlannerConfig) -> Self {
        Self {
            config,
            arcs: BTreeMap::new(),
            twists: Vec::new(),
            themes: BTreeMap::new(),
        }
    }

    /// Rebuild from persisted arcs and twists.
    pub fn restore(config: ArcPlannerConfig, arcs: Vec<StoryArc>, twists: Vec<Twist>) -> Self {
        let mut planner = Self::new(config);
        for arc in arcs {
            planner.themes.insert(arc.arc_number, arc.theme.clone());
            planner.arcs.insert(arc.arc_number, arc);
        }
        planner.twists = twists;
        planner
    }

    pub fn config(&self) -> &ArcPlannerConfig {
        &self.config
    }

    pub fn arc_size(&self) -> u32 {
        self.config.arc_size.max(1)
    }

    /// Arc number covering installment `n` (1-based).
    pub fn arc_number_for(&self, installment: u32) -> u32 {
        (installment.max(1) - 1) / self.arc_size() + 1
    }

    /// Set the theme for an arc. Applies to the arc if it already exists.
    pub fn set_theme(&mut self, arc_number: u32, theme: impl Into<String>) {
        let theme = theme.into();
        if let Some(arc) = self.arcs.get_mut(&arc_number) {
            arc.theme = theme.clone();
        }
        self.themes.insert(arc_number, theme);
    }

    pub fn set_outline(&mut self, arc_number: u32, outline: impl Into<String>) {
        if let Some(arc) = self.arcs.get_mut(&arc_number) {
            arc.outline = Some(outline.into());
        }
    }

    pub fn set_brief(&mut self, installment: u32, brief: impl Into<String>) {
        let arc_number = self.arc_number_for(installment);
        if let Some(arc) = self.arcs.get_mut(&arc_number) {
            arc.briefs.insert(installment, brief.into());
        }
    }

    /// Return the arc covering `installment`, creating it and scheduling its
    /// twists if needed. Idempotent.
    pub fn ensure_arc(&mut self, installment: u32) -> &StoryArc {
        let arc_number = self.arc_number_for(installment);
        if !self.arcs.contains_key(&arc_number) {
            let arc = self.build_arc(arc_number);
            let twists = schedule_twists(&arc, &self.config.twist_windows, &mut self.arc_rng(arc_number));
            debug!(
                arc = arc_number,
                start = arc.start,
                end = arc.end,
                twists = twists.len(),
                "arc planned"
            );
            self.twists.retain(|t| t.arc_number != arc_number);
            self.twists.extend(twists);
            self.arcs.insert(arc_number, arc);
        }
        &self.arcs[&arc_number]
    }

    /// Ensure every arc up to and including the one covering `installment`.
    pub fn ensure_through(&mut self, installment: u32) {
        let last_arc = self.arc_number_for(installment);
        for arc_number in 1..=last_arc {
            let start = (arc_number - 1) * self.arc_size() + 1;
            self.ensure_arc(start);
        }
    }

    fn build_arc(&self, arc_number: u32) -> StoryArc {
        let size = self.arc_size();
        let start = (arc_number - 1) * size + 1;
        let end = start + size - 1;
        let theme = self.themes.get(&arc_number).cloned().unwrap_or_else(|| {
            DEFAULT_THEMES[(arc_number as usize - 1) % DEFAULT_THEMES.len()].to_string()
        });
        StoryArc::new(arc_number, start, end, &self.config.shape, theme)
    }

    /// Per-arc random source, derived from the story seed.
    fn arc_rng(&self, arc_number: u32) -> StdRng {
        StdRng::seed_from_u64(self.config.seed ^ u64::from(arc_number).wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }

    pub fn arc(&self, arc_number: u32) -> Option<&StoryArc> {
        self.arcs.get(&arc_number)
    }

    pub fn arc_mut(&mut self, arc_number: u32) -> Option<&mut StoryArc> {
        self.arcs.get_mut(&arc_number)
    }

    /// The existing arc covering an installment.
    pub fn arc_for(&self, installment: u32) -> Option<&StoryArc> {
        self.arcs.get(&self.arc_number_for(installment))
    }

    pub fn arcs(&self) -> impl Iterator<Item = &StoryArc> {
        self.arcs.values()
    }

    pub fn twists(&self) -> &[Twist] {
        &self.twists
    }

    pub fn twists_for_arc(&self, arc_number: u32) -> Vec<&Twist> {
        self.twists.iter().filter(|t| t.arc_number == arc_number).collect()
    }

    /// Tension target for an installment; the default when no arc covers it.
    pub fn tension_target(&self, installment: u32) -> u8 {
        self.arc_for(installment)
            .and_then(|arc| arc.tension_at(installment))
            .unwrap_or(self.config.default_tension)
    }

    /// Unrevealed twists landing strictly after `installment` and within the
    /// lookahead.
    pub fn upcoming_twists(&self, installment: u32) -> Vec<&Twist> {
        let horizon = installment.saturating_add(self.config.foreshadow_lookahead);
        self.twists
            .iter()
            .filter(|t| t.status != TwistStatus::Revealed)
            .filter(|t| t.target_installment > installment && t.target_installment <= horizon)
            .collect()
    }

    /// Unrevealed twist targeting exactly this installment.
    pub fn twist_at(&self, installment: u32) -> Option<&Twist> {
        self.twists
            .iter()
            .find(|t| t.target_installment == installment && t.status != TwistStatus::Revealed)
    }

    /// Whether a twist is scheduled at or shortly after this installment.
    pub fn has_twist_activity(&self, installment: u32) -> bool {
        self.twist_at(installment).is_some() || !self.upcoming_twists(installment).is_empty()
    }

    /// Compose pacing, theme, twist and milestone guidance for an installment.
    pub fn plot_objectives(&self, installment: u32) -> PlotObjectives {
        let tension = self.tension_target(installment);
        let pacing = Pacing::from_tension(tension);
        let arc = self.arc_for(installment);
        let mut directives = vec![pacing.guidance().to_string()];

        if let Some(arc) = arc {
            directives.push(format!("Arc theme: {}. Let it color this installment.", arc.theme));
            if let Some(brief) = arc.brief(installment) {
                directives.push(format!("Installment brief: {brief}"));
            }
        }

        let upcoming = self.upcoming_twists(installment);
        for twist in &upcoming {
            directives.push(format!(
                "Foreshadow subtly: {} (in {} installments). Plant a hint without revealing it.",
                twist.twist_type.description(),
                twist.target_installment - installment
            ));
        }

        let reveal = self.twist_at(installment);
        if let Some(twist) = reveal {
            directives.push(format!(
                "Reveal the planned twist in this installment: {}.",
                twist.twist_type.description()
            ));
        }

        if arc.is_some_and(|arc| arc.climax_installment == installment) {
            directives.push(
                "This is the climax installment of the arc. Deliver the confrontation the arc has been building toward."
                    .to_string(),
            );
        }

        let major = self.config.major_milestone_every;
        let minor = self.config.minor_milestone_every;
        if major > 0 && installment % major == 0 {
            directives.push(
                "Major character milestone: the protagonist makes a significant, lasting change (new ability, hard choice, changed belief)."
                    .to_string(),
            );
        } else if minor > 0 && installment % minor == 0 {
            directives.push("Minor character milestone: show a small but visible step in the protagonist's growth.".to_string());
        }

        PlotObjectives {
            installment,
            arc_number: self.arc_number_for(installment),
            tension,
            pacing,
            directives,
            foreshadow: upcoming.iter().map(|t| t.id).collect(),
            reveal: reveal.map(|t| t.id),
        }
    }

    /// Advance twist lifecycle after an installment is accepted.
    pub fn mark_twists(&mut self, objectives: &PlotObjectives) {
        for twist in &mut self.twists {
            if objectives.reveal == Some(twist.id) {
                twist.status = TwistStatus::Revealed;
            } else if objectives.foreshadow.contains(&twist.id) && twist.status == TwistStatus::Planned {
                twist.status = TwistStatus::Foreshadowed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner() -> ArcPlanner {
        ArcPlanner::new(ArcPlannerConfig::default().with_seed(42))
    }

    #[test]
    fn test_ensure_arc_is_idempotent_and_contains() {
        let mut planner = planner();
        for n in 1..=95 {
            let arc = planner.ensure_arc(n).clone();
            assert!(arc.contains(n), "arc {} does not contain {n}", arc.arc_number);
            assert_eq!(planner.ensure_arc(n), &arc);
        }
        assert_eq!(planner.arcs().count(), 10);
        assert_eq!(planner.twists().len(), 20);
    }

    #[test]
    fn test_arcs_partition_contiguously() {
        let mut planner = ArcPlanner::new(ArcPlannerConfig::default().with_arc_size(7));
        planner.ensure_through(50);
        let arcs: Vec<_> = planner.arcs().collect();
        assert_eq!(arcs[0].start, 1);
        for pair in arcs.windows(2) {
            assert_eq!(pair[0].end + 1, pair[1].start);
        }
        assert!(arcs.last().unwrap().contains(50));
    }

    #[test]
    fn test_two_twists_per_arc() {
        let mut planner = planner();
        planner.ensure_through(20);
        assert_eq!(planner.twists_for_arc(1).len(), 2);
        assert_eq!(planner.twists_for_arc(2).len(), 2);
    }

    #[test]
    fn test_reconstruction_is_deterministic() {
        let mut a = planner();
        let mut b = planner();
        a.ensure_through(30);
        b.ensure_arc(25);
        let targets = |p: &ArcPlanner, arc: u32| {
            p.twists_for_arc(arc).iter().map(|t| (t.target_installment, t.twist_type)).collect::<Vec<_>>()
        };
        assert_eq!(targets(&a, 3), targets(&b, 3));
    }

    #[test]
    fn test_tension_target_defaults() {
        let mut planner = planner();
        assert_eq!(planner.tension_target(5), 50);
        planner.ensure_arc(5);
        assert_eq!(planner.tension_target(1), 20);
        assert_eq!(planner.tension_target(8), 95);
    }

    #[test]
    fn test_objectives_climax_and_milestones() {
        let mut planner = planner();
        planner.ensure_arc(1);

        let climax = planner.plot_objectives(8);
        assert_eq!(climax.pacing, Pacing::Climax);
        let text = climax.to_prompt();
        assert!(text.contains("climax installment"));
        assert!(text.contains("cliffhanger"));

        let opening = planner.plot_objectives(1);
        assert_eq!(opening.pacing, Pacing::Slow);
        assert!(!opening.to_prompt().contains("milestone"));

        assert!(planner.plot_objectives(5).to_prompt().contains("Minor character milestone"));
        let ten = planner.plot_objectives(10).to_prompt();
        assert!(ten.contains("Major character milestone"));
        assert!(!ten.contains("Minor character milestone"));
    }

    #[test]
    fn test_twist_lifecycle() {
        let mut planner = planner();
        planner.ensure_arc(1);
        let twist = planner.twists_for_arc(1)[0].clone();
        let before = twist.target_installment - 1;

        let objectives = planner.plot_objectives(before);
        assert!(objectives.foreshadow.contains(&twist.id));
        assert!(objectives.to_prompt().contains("Foreshadow"));
        planner.mark_twists(&objectives);
        assert_eq!(planner.twists_for_arc(1)[0].status, TwistStatus::Foreshadowed);

        let objectives = planner.plot_objectives(twist.target_installment);
        assert_eq!(objectives.reveal, Some(twist.id));
        planner.mark_twists(&objectives);
        assert_eq!(planner.twists_for_arc(1)[0].status, TwistStatus::Revealed);
        assert!(planner.twist_at(twist.target_installment).is_none());
    }

    #[test]
    fn test_themes_from_story_plan() {
        let mut planner = planner();
        planner.set_theme(2, "the drowned city");
        assert_eq!(planner.ensure_arc(15).theme, "the drowned city");
        planner.set_brief(15, "Kael reaches the gate");
        assert!(planner.plot_objectives(15).to_prompt().contains("Kael reaches the gate"));
    }
}
