//! Layer gathering and budgeted assembly.

use super::tier::{classify_tier, ContextTier, TierProfile};
use super::{ContextConfig, ContextPayload, Layer, LayerError, LayerKind, OmitReason, OmittedLayer};
use crate::beats::BeatLedger;
use crate::canon::{CanonStore, ConstraintSet};
use crate::memory::{InstallmentRecord, NarrativeMemory};
use crate::planning::{ArcPlanner, PlotObjectives};
use tracing::{debug, warn};

/// Maximum distinct subjects whose facts are pulled into the canon layer.
const MAX_CONTEXT_SUBJECTS: usize = 8;

/// Content offered for a layer.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerContent {
    Text(String),
    /// Formatted installments, oldest first. The newest that fit are kept.
    Installments(Vec<String>),
}

/// A layer as offered to [`assemble`].
#[derive(Debug, Clone)]
pub enum LayerCandidate {
    Ready(LayerKind, LayerContent),
    Failed(LayerKind, LayerError),
    Excluded(LayerKind),
}

impl LayerCandidate {
    pub fn text(kind: LayerKind, text: impl Into<String>) -> Self {
        LayerCandidate::Ready(kind, LayerContent::Text(text.into()))
    }

    pub fn kind(&self) -> LayerKind {
        match self {
            LayerCandidate::Ready(kind, _) | LayerCandidate::Failed(kind, _) | LayerCandidate::Excluded(kind) => *kind,
        }
    }
}

/// Assemble layers greedily in [`LayerKind::ORDER`] under `budget` tokens.
///
/// Pure: the same candidates always produce the same payload.
pub fn assemble(
    installment: u32,
    tier: ContextTier,
    budget: usize,
    mut candidates: Vec<LayerCandidate>,
) -> ContextPayload {
    candidates.sort_by_key(LayerCandidate::kind);

    let mut layers = Vec::new();
    let mut omitted = Vec::new();
    let mut total = 0usize;

    for candidate in candidates {
        let kind = candidate.kind();
        let remaining = budget.saturating_sub(total);
        let outcome = match candidate {
            LayerCandidate::Excluded(_) => Err(OmitReason::ExcludedByTier),
            LayerCandidate::Failed(_, err) => {
                warn!(installment, layer = ?kind, error = %err, "context layer unavailable, omitting");
                Err(OmitReason::FetchFailed(err.0))
            }
            LayerCandidate::Ready(_, LayerContent::Text(text)) => {
                if text.trim().is_empty() {
                    Err(OmitReason::Empty)
                } else {
                    fit(Layer::new(kind, &text), remaining)
                }
            }
            LayerCandidate::Ready(_, LayerContent::Installments(items)) => {
                if items.is_empty() {
                    Err(OmitReason::Empty)
                } else {
                    fit_newest(kind, &items, remaining)
                }
            }
        };

        match outcome {
            Ok(layer) => {
                total += layer.tokens;
                layers.push(layer);
            }
            Err(reason) => {
                debug!(installment, layer = ?kind, reason = ?reason, "context layer omitted");
                omitted.push(OmittedLayer { kind, reason });
            }
        }
    }

    ContextPayload {
        installment,
        tier,
        layers,
        omitted,
        total_tokens: total,
        budget,
    }
}

fn fit(layer: Layer, remaining: usize) -> Result<Layer, OmitReason> {
    if layer.tokens <= remaining {
        Ok(layer)
    } else {
        Err(OmitReason::OverBudget {
            needed: layer.tokens,
            remaining,
        })
    }
}

/// Keep as many of the newest items as fit, rendered oldest first.
fn fit_newest(kind: LayerKind, items: &[String], remaining: usize) -> Result<Layer, OmitReason> {
    let mut smallest = None;
    for keep in (1..=items.len()).rev() {
        let body = items[items.len() - keep..].join("\n\n");
        let layer = Layer::new(kind, &body);
        if layer.tokens <= remaining {
            return Ok(layer);
        }
        smallest = Some(layer.tokens);
    }
    Err(OmitReason::OverBudget {
        needed: smallest.unwrap_or_default(),
        remaining,
    })
}

/// Everything the assembler reads for one installment.
pub struct ContextSources<'a> {
    pub canon: &'a CanonStore,
    pub constraints: &'a ConstraintSet,
    pub memory: &'a NarrativeMemory,
    pub planner: &'a ArcPlanner,
    pub ledger: &'a BeatLedger,
    pub objectives: &'a PlotObjectives,
    /// Recent accepted installments, oldest first. Read from durable storage
    /// when memory does not hold them, so it may fail.
    pub recent: Result<Vec<InstallmentRecord>, LayerError>,
}

/// Builds [`ContextPayload`]s from story state.
#[derive(Debug, Clone, Default)]
pub struct ContextAssembler {
    config: ContextConfig,
}

impl ContextAssembler {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn tier_for(&self, installment: u32, planner: &ArcPlanner) -> ContextTier {
        classify_tier(
            installment,
            planner.arc_for(installment),
            planner.has_twist_activity(installment),
            &self.config,
        )
    }

    /// Gather every layer for `installment` and assemble under the budget.
    pub fn build(&self, installment: u32, sources: ContextSources<'_>) -> ContextPayload {
        let tier = self.tier_for(installment, sources.planner);
        let profile = self.config.profile(tier);
        let candidates = self.candidates(installment, profile, sources);
        let payload = assemble(installment, tier, self.config.budget_tokens, candidates);
        debug!(
            installment,
            tier = ?tier,
            tokens = payload.total_tokens,
            layers = payload.layers.len(),
            omitted = payload.omitted.len(),
            "context assembled"
        );
        payload
    }

    fn candidates(&self, installment: u32, profile: &TierProfile, sources: ContextSources<'_>) -> Vec<LayerCandidate> {
        let bible = if profile.include_bible {
            let text = sources.memory.bible().map(|b| b.text.clone()).unwrap_or_default();
            LayerCandidate::text(LayerKind::GlobalBible, text)
        } else {
            LayerCandidate::Excluded(LayerKind::GlobalBible)
        };

        let recent = match &sources.recent {
            Ok(records) => {
                let skip = records.len().saturating_sub(profile.recent_raw);
                let items = records[skip..].iter().map(format_installment).collect();
                LayerCandidate::Ready(LayerKind::RecentInstallments, LayerContent::Installments(items))
            }
            Err(err) => LayerCandidate::Failed(LayerKind::RecentInstallments, err.clone()),
        };

        let synopsis = sources.memory.synopsis();
        let synopsis_text = if synopsis.is_empty() {
            String::new()
        } else {
            synopsis.to_prompt()
        };

        vec![
            bible,
            LayerCandidate::text(LayerKind::Canon, canon_layer(profile, &sources)),
            LayerCandidate::text(LayerKind::RollingSynopsis, synopsis_text),
            recent,
            LayerCandidate::text(LayerKind::ArcPlan, arc_plan_layer(installment, &sources)),
            LayerCandidate::text(
                LayerKind::AntiRepetition,
                anti_repetition_layer(installment, profile, &sources),
            ),
        ]
    }
}

fn format_installment(record: &InstallmentRecord) -> String {
    format!("--- Installment {}: {} ---\n{}", record.number, record.title, record.text.trim())
}

/// Text that decides which mutable constraints and subjects are relevant.
fn relevance_text(sources: &ContextSources<'_>) -> String {
    let mut text = String::new();
    if let Some(arc) = sources.planner.arc(sources.objectives.arc_number) {
        text.push_str(&arc.describe());
        text.push('\n');
        if let Some(brief) = arc.brief(sources.objectives.installment) {
            text.push_str(brief);
            text.push('\n');
        }
    }
    let synopsis = sources.memory.synopsis();
    text.push_str(&synopsis.text);
    text.push('\n');
    for name in synopsis.allies.iter().chain(&synopsis.enemies) {
        text.push_str(name);
        text.push('\n');
    }
    if let Some(last) = sources.memory.last_installment() {
        text.push_str(&last.summary);
        text.push('\n');
        text.push_str(&last.closing_line);
    }
    text
}

fn canon_layer(profile: &TierProfile, sources: &ContextSources<'_>) -> String {
    let mut out = String::new();

    if !sources.constraints.immutable.is_empty() {
        out.push_str("Immutable world rules (violating any of these is a continuity error):\n");
        for constraint in &sources.constraints.immutable {
            out.push_str(&format!("- {}\n", constraint.describe()));
        }
    }

    let dead = sources.canon.dead_entities();
    if !dead.is_empty() {
        out.push_str("Dead characters (they must not appear alive, speak, or act, except in memories):\n");
        for name in dead {
            out.push_str(&format!("- {name}\n"));
        }
    }

    let relevance = relevance_text(sources);
    let mutable = sources
        .constraints
        .relevant_mutable(&relevance, profile.max_mutable_facts);
    if !mutable.is_empty() {
        out.push_str("Current world state (may change through the plot):\n");
        for constraint in mutable {
            out.push_str(&format!("- {}\n", constraint.describe()));
        }
    }

    let subjects = sources.canon.subjects_in(&relevance);
    let mut fact_lines = Vec::new();
    for subject in subjects.iter().take(MAX_CONTEXT_SUBJECTS) {
        for fact in sources.canon.facts_for_subject(subject, profile.max_subject_facts) {
            fact_lines.push(format!("- {}", fact.describe()));
        }
    }
    if !fact_lines.is_empty() {
        out.push_str("Established facts:\n");
        out.push_str(&fact_lines.join("\n"));
        out.push('\n');
    }

    out
}

fn arc_plan_layer(installment: u32, sources: &ContextSources<'_>) -> String {
    let mut out = String::new();
    if let Some(arc) = sources.planner.arc_for(installment) {
        out.push_str(&arc.describe());
        out.push('\n');
    }
    out.push_str(&sources.objectives.to_prompt());
    out
}

fn anti_repetition_layer(installment: u32, profile: &TierProfile, sources: &ContextSources<'_>) -> String {
    let k = profile.anti_repetition_items;
    let memory = sources.memory;
    let mut out = String::new();

    let lists: [(&str, Vec<&str>); 3] = [
        (
            "Previous titles. The new title must not reuse their wording or pattern",
            memory.prior_titles().rev().take(k).collect(),
        ),
        (
            "Previous opening lines. The new installment must open with a structurally different first sentence (different subject, rhythm and situation)",
            memory.prior_openings().rev().take(k).collect(),
        ),
        (
            "Previous closing lines. The new installment must end differently from every example below; do not reuse the same cliffhanger structure",
            memory.prior_closings().rev().take(k).collect(),
        ),
    ];

    for (instruction, items) in lists {
        if items.is_empty() {
            continue;
        }
        out.push_str(instruction);
        out.push_str(":\n");
        for item in items {
            out.push_str(&format!("- {item}\n"));
        }
    }

    if let Some(restrictions) = sources.ledger.restriction_prompt(installment) {
        out.push_str(&restrictions);
    }
    out
}
