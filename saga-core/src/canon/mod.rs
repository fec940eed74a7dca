//! Canonical facts and world constraints.
//!
//! ```text
//! world document ──> ConstraintExtractor ──> ConstraintSet
//!                                               │ immutable: Canon authority
//!                                               │ mutable:   Narrated authority
//!                                               v
//! installment ──> fact extraction ──────────> CanonStore ──> ContinuityIssue backlog
//! ```

mod constraints;
mod fact;
mod issue;
mod store;

pub use constraints::{
    ConstraintExtractor, ConstraintKind, ConstraintSet, ExtractError, WorldConstraint,
    DEFAULT_MUTABLE_LIMIT,
};
pub use fact::{
    fact_key, normalize_predicate, AuthorityLevel, Fact, FactCategory, FactId, FactValue, Severity,
};
pub use issue::{ContinuityIssue, IssueId, IssueStatus, Resolution};
pub use store::{CanonStore, ConflictCheck, Registration, DEFAULT_SUBJECT_FACTS};

use thiserror::Error;

/// Errors from the issue backlog.
#[derive(Debug, Error)]
pub enum CanonError {
    #[error("no continuity issue with id {0:?}")]
    UnknownIssue(IssueId),

    #[error("continuity issue {0:?} is already closed")]
    IssueClosed(IssueId),
}
