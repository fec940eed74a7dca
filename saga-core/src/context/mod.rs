//! Hierarchical context assembly.
//!
//! Every installment gets a freshly assembled, size-bounded payload built
//! from ordered layers:
//!
//! ```text
//! ┌──────────────────────────┐
//! │ 1. Global bible          │  static reference, refreshed every few arcs
//! │ 2. Canon                 │  immutable rules, the dead, relevant facts
//! │ 3. Rolling synopsis      │  replaced at each arc boundary
//! │ 4. Recent installments   │  full text, newest kept first
//! │ 5. Arc plan              │  arc outline + plot objectives
//! │ 6. Anti-repetition       │  prior titles/openings/closings, beat cooldowns
//! └──────────────────────────┘
//! ```
//!
//! A layer is included only if it fits in what is left of the budget. A
//! layer that does not fit, fails to load, or is empty is skipped and
//! recorded; the remaining layers keep their order.

mod assembler;
mod tier;

pub use assembler::{assemble, ContextAssembler, ContextSources, LayerCandidate, LayerContent};
pub use tier::{classify_tier, ContextTier, TierProfile};

use crate::text::estimate_tokens;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A layer source could not be read.
#[derive(Debug, Clone, Error)]
#[error("layer unavailable: {0}")]
pub struct LayerError(pub String);

/// Context layers in assembly order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    GlobalBible,
    Canon,
    RollingSynopsis,
    RecentInstallments,
    ArcPlan,
    AntiRepetition,
}

impl LayerKind {
    pub const ORDER: [LayerKind; 6] = [
        LayerKind::GlobalBible,
        LayerKind::Canon,
        LayerKind::RollingSynopsis,
        LayerKind::RecentInstallments,
        LayerKind::ArcPlan,
        LayerKind::AntiRepetition,
    ];

    pub fn title(&self) -> &'static str {
        match self {
            LayerKind::GlobalBible => "STORY BIBLE",
            LayerKind::Canon => "CANON",
            LayerKind::RollingSynopsis => "STORY SO FAR",
            LayerKind::RecentInstallments => "RECENT INSTALLMENTS",
            LayerKind::ArcPlan => "ARC PLAN",
            LayerKind::AntiRepetition => "DO NOT REPEAT",
        }
    }
}

/// An included layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub kind: LayerKind,
    pub text: String,
    pub tokens: usize,
}

impl Layer {
    pub fn new(kind: LayerKind, body: &str) -> Self {
        let text = format!("=== {} ===\n{}\n", kind.title(), body.trim_end());
        let tokens = estimate_tokens(&text);
        Self { kind, text, tokens }
    }
}

/// Why a layer was left out.
#[derive(Debug, Clone, PartialEq)]
pub enum OmitReason {
    OverBudget { needed: usize, remaining: usize },
    FetchFailed(String),
    Empty,
    /// Not part of this tier's profile.
    ExcludedByTier,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OmittedLayer {
    pub kind: LayerKind,
    pub reason: OmitReason,
}

/// Configuration for context assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Budget in estimated tokens.
    pub budget_tokens: usize,
    /// Installments up to this number always get full context.
    pub golden_installments: u32,
    /// Every Nth installment gets at least medium context.
    pub medium_every: u32,
    pub full: TierProfile,
    pub medium: TierProfile,
    pub minimal: TierProfile,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget_tokens: 24_000,
            golden_installments: 5,
            medium_every: 5,
            full: TierProfile::full(),
            medium: TierProfile::medium(),
            minimal: TierProfile::minimal(),
        }
    }
}

impl ContextConfig {
    pub fn with_budget(mut self, budget_tokens: usize) -> Self {
        self.budget_tokens = budget_tokens;
        self
    }

    pub fn profile(&self, tier: ContextTier) -> &TierProfile {
        match tier {
            ContextTier::Full => &self.full,
            ContextTier::Medium => &self.medium,
            ContextTier::Minimal => &self.minimal,
        }
    }
}

/// The assembled context for one installment. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextPayload {
    pub installment: u32,
    pub tier: ContextTier,
    pub layers: Vec<Layer>,
    pub omitted: Vec<OmittedLayer>,
    pub total_tokens: usize,
    pub budget: usize,
}

impl ContextPayload {
    pub fn includes(&self, kind: LayerKind) -> bool {
        self.layers.iter().any(|l| l.kind == kind)
    }

    pub fn layer(&self, kind: LayerKind) -> Option<&Layer> {
        self.layers.iter().find(|l| l.kind == kind)
    }

    pub fn kinds(&self) -> Vec<LayerKind> {
        self.layers.iter().map(|l| l.kind).collect()
    }

    /// All included layers joined in order.
    pub fn to_prompt_string(&self) -> String {
        self.layers
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
