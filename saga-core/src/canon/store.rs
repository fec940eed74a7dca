//! Authority-ranked fact store with conflict resolution.

use super::fact::{AuthorityLevel, Fact, FactId};
use super::issue::{ContinuityIssue, IssueId, IssueStatus, Resolution};
use super::CanonError;
use crate::text::contains_word;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Default number of facts per subject included in prompt context.
pub const DEFAULT_SUBJECT_FACTS: usize = 8;

/// Result of checking a candidate fact against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictCheck {
    /// No active fact under the same key.
    None,
    /// Same value already recorded at equal or higher authority.
    NoOp,
    /// Same value, asserted at a higher authority than recorded.
    Confirm(Fact),
    /// Candidate outranks the existing fact and replaces it.
    Replace(Fact),
    /// Candidate is outranked and is dropped.
    Discard(Fact),
    /// Equal authority at or above the high-stakes threshold.
    Escalate(Fact),
    /// Equal authority below the threshold; the newer assertion wins.
    NewestWins { existing: Fact, candidate_is_newer: bool },
}

impl ConflictCheck {
    /// Whether the values actually disagree.
    pub fn is_conflict(&self) -> bool {
        !matches!(self, ConflictCheck::None | ConflictCheck::NoOp | ConflictCheck::Confirm(_))
    }
}

/// Outcome of [`CanonStore::register_fact`].
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    Inserted(FactId),
    /// The same value was already recorded.
    Unchanged(FactId),
    /// The same value was confirmed at a higher authority.
    Upgraded { id: FactId, from: AuthorityLevel },
    /// The fact replaced an active fact under the same key.
    Replaced { id: FactId, previous: Fact },
    /// The fact was outranked by the active one and dropped.
    Discarded { existing: FactId },
    /// The fact contradicts an equally authoritative one; queued for review.
    Escalated(IssueId),
    /// The fact was refused without a conflict check (e.g. a dead entity moving).
    Rejected { reason: String },
}

impl Registration {
    /// Whether the fact is now the active fact for its key.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Registration::Inserted(_)
                | Registration::Unchanged(_)
                | Registration::Upgraded { .. }
                | Registration::Replaced { .. }
        )
    }

    /// Whether registering the fact hit a contradiction.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Registration::Replaced { .. }
                | Registration::Discarded { .. }
                | Registration::Escalated(_)
                | Registration::Rejected { .. }
        )
    }

    pub fn issue(&self) -> Option<IssueId> {
        match self {
            Registration::Escalated(id) => Some(*id),
            _ => None,
        }
    }
}

/// The canonical fact store for a single story.
///
/// Invariant: at most one active fact per (subject, predicate). A strictly
/// higher-authority fact always overrides a lower one, in either order of
/// assertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonStore {
    /// Active facts by key.
    facts: HashMap<String, Fact>,
    /// Superseded facts, oldest first.
    #[serde(default)]
    history: Vec<Fact>,
    #[serde(default)]
    issues: Vec<ContinuityIssue>,
    /// Equal-authority conflicts at or above this tier escalate.
    high_stakes_threshold: AuthorityLevel,
    /// Installment used for validity checks.
    #[serde(default)]
    current_installment: u32,
}

impl Default for CanonStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CanonStore {
    pub fn new() -> Self {
        Self {
            facts: HashMap::new(),
            history: Vec::new(),
            issues: Vec::new(),
            high_stakes_threshold: AuthorityLevel::Established,
            current_installment: 0,
        }
    }

    /// Rebuild from persisted active facts and issues. Facts are taken as
    /// already resolved; a later duplicate key replaces an earlier one.
    pub fn restore(facts: Vec<Fact>, issues: Vec<ContinuityIssue>) -> Self {
        let mut store = Self::new();
        for fact in facts {
            store.current_installment = store.current_installment.max(fact.source_installment);
            if let Some(previous) = store.facts.insert(fact.key(), fact) {
                store.history.push(previous);
            }
        }
        store.issues = issues;
        store
    }

    pub fn with_high_stakes_threshold(mut self, threshold: AuthorityLevel) -> Self {
        self.high_stakes_threshold = threshold;
        self
    }

    pub fn high_stakes_threshold(&self) -> AuthorityLevel {
        self.high_stakes_threshold
    }

    pub fn current_installment(&self) -> u32 {
        self.current_installment
    }

    /// Move the validity clock forward.
    pub fn advance_to(&mut self, installment: u32) {
        self.current_installment = self.current_installment.max(installment);
    }

    pub fn len(&self) -> usize {
        self.active_facts().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a fact, resolving any contradiction by authority.
    pub fn register_fact(&mut self, mut fact: Fact) -> Registration {
        if fact.is_death_fact() && fact.authority < AuthorityLevel::Established {
            fact.authority = AuthorityLevel::Established;
        }

        if let Some(reason) = self.dead_subject_rejection(&fact) {
            debug!(subject = %fact.subject, predicate = %fact.predicate, "{reason}");
            return Registration::Rejected { reason };
        }

        let key = fact.key();
        match self.check_conflict(&fact) {
            ConflictCheck::None => {
                let id = fact.id;
                if let Some(expired) = self.facts.insert(key, fact) {
                    self.history.push(expired);
                }
                Registration::Inserted(id)
            }
            ConflictCheck::NoOp => {
                let existing = &self.facts[&key];
                Registration::Unchanged(existing.id)
            }
            ConflictCheck::Confirm(previous) => self.upgrade(key, fact, previous),
            ConflictCheck::Replace(previous) => {
                debug!(
                    subject = %fact.subject,
                    predicate = %fact.predicate,
                    from = previous.authority.name(),
                    to = fact.authority.name(),
                    "fact overridden by higher authority"
                );
                self.replace(key, fact, previous)
            }
            ConflictCheck::NewestWins { existing, candidate_is_newer: true } => {
                self.replace(key, fact, existing)
            }
            ConflictCheck::NewestWins { existing, candidate_is_newer: false }
            | ConflictCheck::Discard(existing) => {
                debug!(
                    subject = %fact.subject,
                    predicate = %fact.predicate,
                    "candidate fact discarded"
                );
                Registration::Discarded { existing: existing.id }
            }
            ConflictCheck::Escalate(existing) => self.escalate(existing, fact),
        }
    }

    /// Check a candidate against the active fact with the same key. Pure.
    pub fn check_conflict(&self, candidate: &Fact) -> ConflictCheck {
        let Some(existing) = self.active(&candidate.key()) else {
            return ConflictCheck::None;
        };

        if existing.value.same_as(&candidate.value) {
            return if candidate.authority > existing.authority {
                ConflictCheck::Confirm(existing.clone())
            } else {
                ConflictCheck::NoOp
            };
        }

        let existing = existing.clone();
        if candidate.authority > existing.authority {
            ConflictCheck::Replace(existing)
        } else if candidate.authority < existing.authority {
            ConflictCheck::Discard(existing)
        } else if candidate.authority >= self.high_stakes_threshold {
            ConflictCheck::Escalate(existing)
        } else {
            let candidate_is_newer = candidate.source_installment >= existing.source_installment;
            ConflictCheck::NewestWins { existing, candidate_is_newer }
        }
    }

    fn replace(&mut self, key: String, fact: Fact, previous: Fact) -> Registration {
        let id = fact.id;
        self.facts.insert(key, fact);
        self.history.push(previous.clone());
        Registration::Replaced { id, previous }
    }

    /// Raise the recorded fact to the candidate's authority. The id and the
    /// original source stay; later contradictions compare against the new tier.
    fn upgrade(&mut self, key: String, candidate: Fact, previous: Fact) -> Registration {
        debug!(
            subject = %candidate.subject,
            predicate = %candidate.predicate,
            from = previous.authority.name(),
            to = candidate.authority.name(),
            "fact confirmed at higher authority"
        );
        let mut upgraded = previous.clone();
        upgraded.authority = candidate.authority;
        upgraded.category = candidate.category;
        upgraded.confidence = upgraded.confidence.max(candidate.confidence);
        upgraded.valid_until = match (previous.valid_until, candidate.valid_until) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        };
        let id = upgraded.id;
        self.facts.insert(key, upgraded);
        Registration::Upgraded { id, from: previous.authority }
    }

    fn escalate(&mut self, existing: Fact, candidate: Fact) -> Registration {
        // The same contradiction asserted twice stays one issue.
        if let Some(open) = self.issues.iter().find(|issue| {
            issue.is_open()
                && issue.existing.id == existing.id
                && issue.candidate.value.same_as(&candidate.value)
        }) {
            return Registration::Escalated(open.id);
        }

        let issue = ContinuityIssue::new(existing, candidate);
        warn!(
            severity = ?issue.severity,
            installment = issue.installment,
            "continuity issue raised: {}",
            issue.describe()
        );
        let id = issue.id;
        self.issues.push(issue);
        Registration::Escalated(id)
    }

    /// A dead entity cannot take on new state unless the assertion outranks
    /// the death itself.
    fn dead_subject_rejection(&self, fact: &Fact) -> Option<String> {
        if !fact.category.is_state_changing() || fact.is_death_fact() {
            return None;
        }
        let death = self.death_fact(&fact.subject)?;
        if death.key() == fact.key() || fact.authority > death.authority {
            return None;
        }
        Some(format!(
            "{} is dead since installment {}; {} rejected",
            death.subject, death.source_installment, fact.predicate
        ))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    fn active(&self, key: &str) -> Option<&Fact> {
        self.facts
            .get(key)
            .filter(|fact| fact.is_active_at(self.current_installment))
    }

    /// All facts that currently hold.
    pub fn active_facts(&self) -> impl Iterator<Item = &Fact> {
        self.facts
            .values()
            .filter(|fact| fact.is_active_at(self.current_installment))
    }

    /// The active fact for a key, if any.
    pub fn get(&self, subject: &str, predicate: &str) -> Option<&Fact> {
        self.active(&super::fact::fact_key(subject, predicate))
    }

    /// Facts about an entity, highest authority first, at most `top_k`.
    pub fn facts_for_subject(&self, name: &str, top_k: usize) -> Vec<&Fact> {
        let name = crate::text::normalize(name);
        let mut facts: Vec<&Fact> = self
            .active_facts()
            .filter(|fact| crate::text::normalize(&fact.subject) == name)
            .collect();
        facts.sort_by(|a, b| {
            b.authority
                .cmp(&a.authority)
                .then(b.source_installment.cmp(&a.source_installment))
                .then(a.predicate.cmp(&b.predicate))
        });
        facts.truncate(top_k);
        facts
    }

    /// The active death fact for an entity, if it is dead.
    pub fn death_fact(&self, name: &str) -> Option<&Fact> {
        let name = crate::text::normalize(name);
        self.active_facts()
            .filter(|fact| crate::text::normalize(&fact.subject) == name)
            .find(|fact| fact.is_death_fact())
    }

    pub fn is_entity_dead(&self, name: &str) -> bool {
        self.death_fact(name).is_some()
    }

    /// Names of all dead entities, sorted.
    pub fn dead_entities(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .active_facts()
            .filter(|fact| fact.is_death_fact())
            .map(|fact| fact.subject.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Distinct subjects mentioned in `text` at word boundaries.
    pub fn subjects_in(&self, text: &str) -> Vec<String> {
        let mut subjects: Vec<String> = self
            .active_facts()
            .map(|fact| fact.subject.clone())
            .filter(|subject| contains_word(text, subject))
            .collect();
        subjects.sort();
        subjects.dedup();
        subjects
    }

    /// Superseded facts, oldest first.
    pub fn history(&self) -> &[Fact] {
        &self.history
    }

    // =========================================================================
    // Issue backlog
    // =========================================================================

    pub fn issues(&self) -> &[ContinuityIssue] {
        &self.issues
    }

    /// Open issues, most severe first, then oldest installment first.
    pub fn open_issues(&self) -> Vec<&ContinuityIssue> {
        let mut open: Vec<&ContinuityIssue> = self.issues.iter().filter(|i| i.is_open()).collect();
        open.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.installment.cmp(&b.installment)));
        open
    }

    pub fn resolve_issue(&mut self, id: IssueId, resolution: Resolution) -> Result<(), CanonError> {
        let issue = self.open_issue_mut(id)?;
        issue.status = IssueStatus::Resolved;
        issue.resolution = Some(resolution);
        let candidate = issue.candidate.clone();

        if resolution == Resolution::AcceptCandidate {
            let key = candidate.key();
            if let Some(previous) = self.facts.insert(key, candidate) {
                self.history.push(previous);
            }
        }
        Ok(())
    }

    pub fn ignore_issue(&mut self, id: IssueId) -> Result<(), CanonError> {
        let issue = self.open_issue_mut(id)?;
        issue.status = IssueStatus::Ignored;
        Ok(())
    }

    fn open_issue_mut(&mut self, id: IssueId) -> Result<&mut ContinuityIssue, CanonError> {
        let issue = self
            .issues
            .iter_mut()
            .find(|issue| issue.id == id)
            .ok_or(CanonError::UnknownIssue(id))?;
        if !issue.is_open() {
            return Err(CanonError::IssueClosed(id));
        }
        Ok(issue)
    }
}
