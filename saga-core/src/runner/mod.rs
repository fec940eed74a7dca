//! The story runner: a state machine that drives one story from premise to
//! target length.
//!
//! ```text
//! idle ─> planning_story ─> planning_arcs ─> writing ─> completed
//!                                             │  ^
//!                                    pause()  v  │ resume()
//!                                            paused
//!
//! any phase ─> error   (planning failure, arc with zero successes)
//! stop()    ─> idle    (observed at the top of each installment)
//! ```
//!
//! One runner owns one story. Installments are written strictly in order
//! because each one's context depends on the effects of the last.

mod config;
mod handle;
mod pipeline;
mod plan;
mod post;

pub use config::{FailurePolicy, RunConfig};
pub use handle::RunnerHandle;
pub use pipeline::Runner;
pub use plan::{ArcSketch, StoryPlan};

use crate::memory::InstallmentRecord;
use crate::persist::StoreError;
use crate::planning::StoryArc;
use crate::quality::GateError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Runner lifecycle states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    #[default]
    Idle,
    PlanningStory,
    PlanningArcs,
    Writing,
    Paused,
    Completed,
    Error,
}

impl RunnerStatus {
    pub fn name(&self) -> &'static str {
        match self {
            RunnerStatus::Idle => "idle",
            RunnerStatus::PlanningStory => "planning_story",
            RunnerStatus::PlanningArcs => "planning_arcs",
            RunnerStatus::Writing => "writing",
            RunnerStatus::Paused => "paused",
            RunnerStatus::Completed => "completed",
            RunnerStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunnerStatus::Completed | RunnerStatus::Error)
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every installment up to the target exists.
    TargetReached,
    /// The per-run installment cap was hit.
    SessionLimit,
    /// `stop()` was called.
    Stopped,
    PlanningFailed,
    /// An arc finished without a single accepted installment.
    ArcFailed,
}

/// Observable runner state. Published to handles and kept in snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerState {
    pub status: RunnerStatus,
    pub current_arc: u32,
    pub current_installment: u32,
    /// Highest installment written for the story, across runs.
    pub progress: u32,
    /// Installments written by this run.
    pub written: u32,
    /// Failed attempts in this run.
    pub failed: u32,
    pub rewrites: u32,
    /// Installments accepted without passing the quality gate.
    pub flagged: u32,
    pub last_error: Option<String>,
    pub stop_reason: Option<StopReason>,
}

/// Errors surfaced by a run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("planning failed: {0}")]
    Planning(String),

    #[error("installment {number} failed: {source}")]
    Installment {
        number: u32,
        #[source]
        source: GateError,
    },

    #[error("could not save installment {number}: {source}")]
    Persist {
        number: u32,
        #[source]
        source: StoreError,
    },

    #[error("arc {0} finished without a single accepted installment")]
    ArcFailed(u32),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Summary of one call to [`Runner::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub status: RunnerStatus,
    pub stop_reason: Option<StopReason>,
    /// Installments written by this run.
    pub installments_written: u32,
    pub installments_failed: u32,
    pub failed_installments: Vec<u32>,
    pub arcs_completed: u32,
    pub rewrites: u32,
    pub flagged_for_review: u32,
    /// Highest installment that exists after the run.
    pub last_installment: u32,
    pub first_error: Option<String>,
    /// False for error runs and for runs that wrote nothing.
    pub success: bool,
}

/// Callbacks fired on runner transitions. All methods default to no-ops.
pub trait RunnerEvents: Send + Sync {
    fn on_phase(&self, _status: RunnerStatus) {}

    fn on_installment(&self, _record: &InstallmentRecord) {}

    /// Fired when an arc completes.
    fn on_arc(&self, _arc: &StoryArc) {}

    fn on_error(&self, _error: &RunError) {}
}

/// Events sink that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEvents;

impl RunnerEvents for NoEvents {}
