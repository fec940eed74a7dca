//! The story plan written once at the start of a story.

use crate::generation::repair;
use crate::planning::ArcPlanner;
use serde::{Deserialize, Serialize};

/// Plan for one arc as the model writes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArcSketch {
    #[serde(alias = "arc_number")]
    pub arc: u32,
    #[serde(default)]
    pub theme: String,
    #[serde(default)]
    pub outline: String,
    /// One line per installment, in order.
    #[serde(default)]
    pub briefs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoryPlan {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub bible: String,
    #[serde(default)]
    pub arcs: Vec<ArcSketch>,
}

impl StoryPlan {
    /// Parse model output. A plan with neither a bible nor arcs is rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut plan: StoryPlan = repair::parse_structured(raw)?;
        plan.arcs.retain(|arc| arc.arc > 0);
        if plan.bible.trim().is_empty() && plan.arcs.is_empty() {
            return None;
        }
        Some(plan)
    }

    /// Set arc themes. Call before arcs are planned.
    pub fn apply_themes(&self, planner: &mut ArcPlanner) {
        for sketch in &self.arcs {
            if !sketch.theme.trim().is_empty() {
                planner.set_theme(sketch.arc, sketch.theme.trim());
            }
        }
    }

    /// Attach outlines and per-installment briefs to planned arcs.
    pub fn apply_outlines(&self, planner: &mut ArcPlanner) {
        for sketch in &self.arcs {
            let Some(start) = planner.arc(sketch.arc).map(|arc| arc.start) else {
                continue;
            };
            if !sketch.outline.trim().is_empty() {
                planner.set_outline(sketch.arc, sketch.outline.trim());
            }
            for (offset, brief) in sketch.briefs.iter().enumerate().take(planner.arc_size() as usize) {
                if !brief.trim().is_empty() {
                    planner.set_brief(start + offset as u32, brief.trim());
                }
            }
        }
    }
}
