//! Arcs and their tension curves.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Parameters of the default rise-peak-fall tension curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArcShape {
    /// Tension at the first installment of the arc.
    pub baseline: u8,
    /// Tension just before the climax.
    pub near_peak: u8,
    /// Tension at the climax.
    pub peak: u8,
    /// Tension at the last installment of the arc.
    pub fall_to: u8,
    /// Position of the climax as a fraction of the arc length.
    pub rise_fraction: f32,
}

impl Default for ArcShape {
    fn default() -> Self {
        Self {
            baseline: 20,
            near_peak: 85,
            peak: 95,
            fall_to: 50,
            rise_fraction: 0.7,
        }
    }
}

impl ArcShape {
    /// Offset of the climax within an arc of `len` installments.
    pub fn climax_index(&self, len: u32) -> u32 {
        let index = (len as f32 * self.rise_fraction.clamp(0.0, 1.0) + 1e-4).floor() as u32;
        index.min(len.saturating_sub(1))
    }

    /// Linear rise to just below the peak, the peak at the climax index, then
    /// a linear fall. Integer-rounded and bounded to [0, 100].
    pub fn tension_curve(&self, len: u32) -> Vec<u8> {
        if len == 0 {
            return Vec::new();
        }
        let peak = f32::from(self.peak.min(100));
        let near_peak = f32::from(self.near_peak).min(peak);
        let baseline = f32::from(self.baseline).min(near_peak);
        let fall_to = f32::from(self.fall_to).min(peak);

        let climax = self.climax_index(len);
        let last = len - 1;

        (0..len)
            .map(|i| {
                let value = if i < climax {
                    if climax <= 1 {
                        baseline
                    } else {
                        baseline + (near_peak - baseline) * i as f32 / (climax - 1) as f32
                    }
                } else if i == climax {
                    peak
                } else {
                    peak + (fall_to - peak) * (i - climax) as f32 / (last - climax) as f32
                };
                value.round().clamp(0.0, 100.0) as u8
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArcStatus {
    Planned,
    InProgress,
    Completed,
    /// No installment in the arc succeeded.
    Failed,
}

/// A contiguous block of installments sharing a tension curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryArc {
    pub arc_number: u32,
    /// First installment, inclusive.
    pub start: u32,
    /// Last installment, inclusive.
    pub end: u32,
    /// One value per installment, indexed by offset from `start`.
    pub tension_curve: Vec<u8>,
    pub climax_installment: u32,
    pub theme: String,
    pub status: ArcStatus,
    /// Free-text plan for the arc, from the story plan.
    #[serde(default)]
    pub outline: Option<String>,
    /// Per-installment briefs keyed by installment number.
    #[serde(default)]
    pub briefs: BTreeMap<u32, String>,
}

impl StoryArc {
    pub fn new(arc_number: u32, start: u32, end: u32, shape: &ArcShape, theme: impl Into<String>) -> Self {
        let len = end.saturating_sub(start) + 1;
        Self {
            arc_number,
            start,
            end,
            tension_curve: shape.tension_curve(len),
            climax_installment: start + shape.climax_index(len),
            theme: theme.into(),
            status: ArcStatus::Planned,
            outline: None,
            briefs: BTreeMap::new(),
        }
    }

    /// Number of installments in the arc.
    pub fn installment_count(&self) -> u32 {
        self.end - self.start + 1
    }

    pub fn contains(&self, installment: u32) -> bool {
        (self.start..=self.end).contains(&installment)
    }

    /// Tension for an installment in this arc.
    pub fn tension_at(&self, installment: u32) -> Option<u8> {
        if !self.contains(installment) {
            return None;
        }
        self.tension_curve.get((installment - self.start) as usize).copied()
    }

    pub fn is_boundary(&self, installment: u32) -> bool {
        installment == self.start || installment == self.end
    }

    pub fn brief(&self, installment: u32) -> Option<&str> {
        self.briefs.get(&installment).map(String::as_str)
    }

    /// Plan text for prompt context.
    pub fn describe(&self) -> String {
        let mut out = format!(
            "Arc {} (installments {}-{}), theme: {}. Climax at installment {}.",
            self.arc_number, self.start, self.end, self.theme, self.climax_installment
        );
        if let Some(outline) = &self.outline {
            out.push('\n');
            out.push_str(outline);
        }
        out
    }
}
