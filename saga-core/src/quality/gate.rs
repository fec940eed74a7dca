//! Bounded draft/score/rewrite loop.

use super::{parse_draft, Draft, QualityAction, QualityConfig, QualityReport, QualityScorer, ScoringContext};
use crate::generation::{GenerationError, GenerationRequest, Generator, Purpose};
use crate::prompts;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum GateError {
    /// The first draft could not be generated at all.
    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("no attempt produced a usable draft")]
    NoUsableDraft,
}

/// One pass through the gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub overall: u8,
    pub action: QualityAction,
}

/// The draft the gate settled on.
#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub draft: Draft,
    pub report: QualityReport,
    pub attempts: Vec<AttemptRecord>,
    /// The draft was kept without passing.
    pub needs_review: bool,
    pub rewrites: u32,
}

/// Scores drafts and asks for rewrites until one passes or attempts run out.
#[derive(Clone)]
pub struct QualityGate {
    scorer: Arc<dyn QualityScorer>,
    config: QualityConfig,
}

impl QualityGate {
    pub fn new(scorer: Arc<dyn QualityScorer>, config: QualityConfig) -> Self {
        Self { scorer, config }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    /// Generate a draft for `request` and push it through the gate.
    ///
    /// If no attempt passes, the best-scoring one is kept (earliest on ties)
    /// and marked for review. A draft scored below the review floor, or an
    /// error after the first attempt, ends the loop early with the best
    /// draft so far.
    pub async fn run(
        &self,
        generator: &dyn Generator,
        request: GenerationRequest,
        context: &ScoringContext,
    ) -> Result<GateOutcome, GateError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = Vec::new();
        let mut best: Option<(Draft, QualityReport)> = None;
        let mut last: Option<(Draft, QualityReport)> = None;

        for attempt in 1..=max_attempts {
            let attempt_request = match &last {
                None => request.clone(),
                Some((draft, report)) => self.rewrite_request(&request, draft, report),
            };

            let raw = match generator.invoke(attempt_request).await {
                Ok(raw) => raw,
                Err(e) if attempt == 1 => return Err(GateError::Generation(e)),
                Err(e) => {
                    warn!(installment = context.installment, attempt, error = %e, "Rewrite failed, keeping best draft");
                    break;
                }
            };

            let (draft, report) = match parse_draft(&raw) {
                Some(draft) => {
                    let report = self.scorer.score(&draft, context, &self.config);
                    (draft, report)
                }
                None => {
                    warn!(installment = context.installment, attempt, "Draft had no usable body");
                    attempts.push(AttemptRecord {
                        attempt,
                        overall: 0,
                        action: QualityAction::FlagForReview,
                    });
                    continue;
                }
            };

            debug!(
                installment = context.installment,
                attempt,
                overall = report.overall,
                action = ?report.action,
                "Scored draft"
            );
            attempts.push(AttemptRecord {
                attempt,
                overall: report.overall,
                action: report.action,
            });

            if report.action == QualityAction::Accept {
                return Ok(GateOutcome {
                    draft,
                    report,
                    rewrites: attempt - 1,
                    attempts,
                    needs_review: false,
                });
            }

            let flagged = report.action == QualityAction::FlagForReview;
            if best.as_ref().map_or(true, |(_, b)| report.overall > b.overall) {
                best = Some((draft.clone(), report.clone()));
            }
            if flagged {
                // Below the review floor a rewrite is not attempted.
                info!(
                    installment = context.installment,
                    attempt,
                    overall = report.overall,
                    "Draft below review floor, skipping rewrites"
                );
                break;
            }
            last = Some((draft, report));
        }

        let (draft, report) = best.ok_or(GateError::NoUsableDraft)?;
        let rewrites = attempts.len().saturating_sub(1) as u32;
        info!(
            installment = context.installment,
            overall = report.overall,
            attempts = attempts.len(),
            "No draft passed the gate, keeping best for review"
        );
        Ok(GateOutcome {
            draft,
            report,
            attempts,
            needs_review: true,
            rewrites,
        })
    }

    fn rewrite_request(&self, original: &GenerationRequest, draft: &Draft, report: &QualityReport) -> GenerationRequest {
        let issues = if report.issues.is_empty() {
            "- Raise the overall quality of the prose.".to_string()
        } else {
            report.issues.iter().map(|i| format!("- {i}")).collect::<Vec<_>>().join("\n")
        };
        let user = format!(
            "{}\n\n=== PREVIOUS DRAFT (score {}/100) ===\n{}\n\n=== FIX THESE PROBLEMS ===\n{}",
            original.user,
            report.overall,
            draft.to_text(),
            issues
        );
        GenerationRequest::new(Purpose::Rewrite, prompts::REWRITE, user)
            .with_max_output_tokens(original.max_output_tokens)
            .with_temperature(original.temperature)
    }
}
