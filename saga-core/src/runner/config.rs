//! Run configuration.

use super::RunError;
use crate::canon::AuthorityLevel;
use crate::context::ContextConfig;
use crate::generation::GenerationSettings;
use crate::memory::MemoryConfig;
use crate::planning::ArcPlannerConfig;
use crate::quality::QualityConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What to do when an installment cannot be produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Try the same installment again up to `max_retries` times, then skip it.
    RetryImmediately { max_retries: u32 },
    /// Pause the runner; the installment is retried after `resume()`.
    PauseForResume,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::RetryImmediately { max_retries: 1 }
    }
}

/// Configuration for one story run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Storage key for the story.
    pub story_id: String,
    pub premise: String,
    /// Optional foundational world document for constraint extraction.
    pub world_document: Option<String>,
    /// Story length in installments.
    pub target_installments: u32,
    /// Cap on installments written by one run.
    pub session_limit: Option<u32>,
    /// Snapshot every N installments. 0 disables periodic snapshots.
    pub snapshot_interval: u32,
    pub failure_policy: FailurePolicy,
    /// Equal-authority conflicts at or above this tier go to review.
    pub high_stakes_threshold: AuthorityLevel,
    pub planner: ArcPlannerConfig,
    pub context: ContextConfig,
    pub quality: QualityConfig,
    pub memory: MemoryConfig,
    pub generation: GenerationSettings,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            story_id: "story".to_string(),
            premise: String::new(),
            world_document: None,
            target_installments: 100,
            session_limit: None,
            snapshot_interval: 5,
            failure_policy: FailurePolicy::default(),
            high_stakes_threshold: AuthorityLevel::Established,
            planner: ArcPlannerConfig::default(),
            context: ContextConfig::default(),
            quality: QualityConfig::default(),
            memory: MemoryConfig::default(),
            generation: GenerationSettings::default(),
        }
    }
}

impl RunConfig {
    pub fn new(story_id: impl Into<String>, premise: impl Into<String>) -> Self {
        Self {
            story_id: story_id.into(),
            premise: premise.into(),
            ..Self::default()
        }
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self, RunError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RunError::Config(format!("{}: {e}", path.display())))?;
        let config: Self =
            serde_json::from_str(&content).map_err(|e| RunError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RunError> {
        if self.story_id.trim().is_empty() {
            return Err(RunError::Config("story id is empty".into()));
        }
        if self.target_installments == 0 {
            return Err(RunError::Config("target must be at least one installment".into()));
        }
        if self.planner.arc_size == 0 {
            return Err(RunError::Config("arc size must be at least one".into()));
        }
        Ok(())
    }

    pub fn with_world_document(mut self, document: impl Into<String>) -> Self {
        self.world_document = Some(document.into());
        self
    }

    pub fn with_target(mut self, installments: u32) -> Self {
        self.target_installments = installments;
        self
    }

    pub fn with_arc_size(mut self, arc_size: u32) -> Self {
        self.planner = self.planner.with_arc_size(arc_size);
        self
    }

    pub fn with_session_limit(mut self, limit: u32) -> Self {
        self.session_limit = Some(limit);
        self
    }

    pub fn with_snapshot_interval(mut self, interval: u32) -> Self {
        self.snapshot_interval = interval;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.planner = self.planner.with_seed(seed);
        self
    }

    pub fn with_planner(mut self, planner: ArcPlannerConfig) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_context(mut self, context: ContextConfig) -> Self {
        self.context = context;
        self
    }

    pub fn with_quality(mut self, quality: QualityConfig) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_memory(mut self, memory: MemoryConfig) -> Self {
        self.memory = memory;
        self
    }

    /// Number of arcs needed to reach the target.
    pub fn arc_count(&self) -> u32 {
        self.target_installments.div_ceil(self.planner.arc_size.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: RunConfig = serde_json::from_str(
            r#"{"story_id": "ember", "premise": "A courier carries a forbidden letter.",
                "target_installments": 30, "failure_policy": {"mode": "pause_for_resume"}}"#,
        )
        .unwrap();
        assert_eq!(config.story_id, "ember");
        assert_eq!(config.failure_policy, FailurePolicy::PauseForResume);
        assert_eq!(config.planner.arc_size, 10);
        assert_eq!(config.arc_count(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(RunConfig::new("", "p").validate().is_err());
        assert!(RunConfig::new("s", "p").with_target(0).validate().is_err());
        assert_eq!(RunConfig::new("s", "p").with_target(25).with_arc_size(10).arc_count(), 3);
    }

    #[tokio::test]
    async fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        tokio::fs::write(&path, r#"{"story_id": "ember", "session_limit": 2}"#).await.unwrap();

        let config = RunConfig::from_json_file(&path).await.unwrap();
        assert_eq!(config.session_limit, Some(2));

        let missing = RunConfig::from_json_file(dir.path().join("nope.json")).await;
        assert!(matches!(missing, Err(RunError::Config(_))));
    }
}
