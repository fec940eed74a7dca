//! Continuity issues: contradictions queued for review.

use super::fact::{Fact, FactCategory, Severity};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a continuity issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IssueId(Uuid);

impl IssueId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for IssueId {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle of an issue: open, then resolved or ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    Resolved,
    Ignored,
}

/// How a reviewer settled an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// The existing fact stands; the candidate is dropped.
    KeepExisting,
    /// The candidate replaces the existing fact.
    AcceptCandidate,
}

/// An unresolved contradiction between two equally authoritative facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuityIssue {
    pub id: IssueId,
    /// Installment the contradicting assertion came from.
    pub installment: u32,
    pub severity: Severity,
    pub category: FactCategory,
    pub existing: Fact,
    pub candidate: Fact,
    pub suggested_resolution: String,
    pub status: IssueStatus,
    #[serde(default)]
    pub resolution: Option<Resolution>,
}

impl ContinuityIssue {
    pub fn new(existing: Fact, candidate: Fact) -> Self {
        let category = candidate.category;
        let suggested_resolution = suggest(&existing, &candidate);
        Self {
            id: IssueId::new(),
            installment: candidate.source_installment,
            severity: category.severity(),
            category,
            existing,
            candidate,
            suggested_resolution,
            status: IssueStatus::Open,
            resolution: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == IssueStatus::Open
    }

    /// One-line form for logs and review listings.
    pub fn describe(&self) -> String {
        format!(
            "[{:?}] {} {}: \"{}\" (installment {}) vs \"{}\" (installment {})",
            self.severity,
            self.existing.subject,
            self.existing.predicate,
            self.existing.value,
            self.existing.source_installment,
            self.candidate.value,
            self.candidate.source_installment,
        )
    }
}

fn suggest(existing: &Fact, candidate: &Fact) -> String {
    if existing.is_death_fact() && !candidate.is_death_fact() {
        return format!(
            "{} died in installment {}; keep the death unless a resurrection is intended",
            existing.subject, existing.source_installment
        );
    }
    if existing.confidence > candidate.confidence {
        format!(
            "keep \"{}\" (confidence {:.2} vs {:.2})",
            existing.value, existing.confidence, candidate.confidence
        )
    } else {
        format!(
            "accept \"{}\" if installment {} deliberately changed it; otherwise keep \"{}\"",
            candidate.value, candidate.source_installment, existing.value
        )
    }
}
