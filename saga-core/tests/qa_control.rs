//! Pause, stop, session limits and resuming across runs.
//!
//! Run with: `cargo test -p saga-core --test qa_control`

use saga_core::beats::BeatType;
use saga_core::generation::{GenerationError, Purpose};
use saga_core::memory::InstallmentRecord;
use saga_core::persist::{JsonFileStore, MemoryStore, StoryStore};
use saga_core::quality::HeuristicScorer;
use saga_core::runner::{FailurePolicy, Runner, RunnerEvents, RunnerHandle, RunnerStatus, StopReason};
use saga_core::testing::{mock_draft, TestHarness};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Calls `stop()` or `pause()` once installment `at` is written.
struct ActAt {
    handle: RunnerHandle,
    at: u32,
    stop: bool,
}

impl RunnerEvents for ActAt {
    fn on_installment(&self, record: &InstallmentRecord) {
        if record.number == self.at {
            if self.stop {
                self.handle.stop();
            } else {
                self.handle.pause();
            }
        }
    }
}

/// Records every phase the runner enters.
#[derive(Default)]
struct Phases(Mutex<Vec<RunnerStatus>>);

impl RunnerEvents for Phases {
    fn on_phase(&self, status: RunnerStatus) {
        self.0.lock().unwrap().push(status);
    }
}

// =============================================================================
// Session limit and reconstruction
// =============================================================================

#[tokio::test]
async fn test_session_limit_from_installment_fifty() {
    let h = TestHarness::new(100, 10).configure(|c| c.with_session_limit(1));
    h.seed_installments(50).await.unwrap();

    let result = h.run().await;

    assert_eq!(result.status, RunnerStatus::Completed);
    assert_eq!(result.stop_reason, Some(StopReason::SessionLimit));
    assert_eq!(result.installments_written, 1);
    assert_eq!(result.last_installment, 51);
    assert!(result.success);

    let latest = h.store.latest_installment(&h.config.story_id).await.unwrap();
    assert_eq!(latest, Some(51));
    // No new story plan for an existing story.
    assert!(h.generator.calls_for(Purpose::StoryPlan).is_empty());
}

#[tokio::test]
async fn test_phases_in_order() {
    let h = TestHarness::new(2, 2);
    let phases = Arc::new(Phases::default());
    let mut runner = h.runner().with_events(phases.clone());
    runner.run().await;

    let seen = phases.0.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            RunnerStatus::PlanningStory,
            RunnerStatus::PlanningArcs,
            RunnerStatus::Writing,
            RunnerStatus::Completed,
        ]
    );
}

#[tokio::test]
async fn test_target_already_reached_writes_nothing() {
    let h = TestHarness::new(3, 3);
    h.seed_installments(3).await.unwrap();
    let result = h.run().await;

    assert_eq!(result.status, RunnerStatus::Completed);
    assert_eq!(result.installments_written, 0);
    assert!(!result.success);
}

// =============================================================================
// Stop and pause
// =============================================================================

#[tokio::test]
async fn test_stop_then_resume_from_snapshot() {
    let h = TestHarness::new(12, 6);
    let runner = h.runner();
    let handle = runner.handle();
    let mut runner = runner.with_events(Arc::new(ActAt { handle: handle.clone(), at: 4, stop: true }));

    let first = runner.run().await;
    assert_eq!(first.status, RunnerStatus::Idle);
    assert_eq!(first.stop_reason, Some(StopReason::Stopped));
    assert_eq!(first.installments_written, 4);
    assert!(first.success);
    assert!(handle.is_stopped());
    assert_eq!(handle.state().status, RunnerStatus::Idle);

    let second = h.run().await;
    assert_eq!(second.status, RunnerStatus::Completed);
    assert_eq!(second.installments_written, 8);
    assert_eq!(second.last_installment, 12);
    assert_eq!(second.arcs_completed, 2);
    assert_eq!(h.generator.calls_for(Purpose::StoryPlan).len(), 1);
    assert_eq!(h.installments().await.unwrap().len(), 12);
}

#[tokio::test]
async fn test_pause_and_resume() {
    let h = TestHarness::new(6, 6);
    let runner = h.runner();
    let handle = runner.handle();
    let mut runner = runner.with_events(Arc::new(ActAt { handle: handle.clone(), at: 2, stop: false }));

    let controller = async {
        let mut states = handle.subscribe();
        let written = states.wait_for(|s| s.status == RunnerStatus::Paused).await.unwrap().written;
        assert!(handle.is_paused());
        handle.resume();
        written
    };
    let (result, written_at_pause) = tokio::join!(runner.run(), controller);

    assert_eq!(written_at_pause, 2);
    assert_eq!(result.status, RunnerStatus::Completed);
    assert_eq!(result.installments_written, 6);
}

#[tokio::test]
async fn test_stop_while_paused() {
    let h = TestHarness::new(6, 6);
    let runner = h.runner();
    let handle = runner.handle();
    let mut runner = runner.with_events(Arc::new(ActAt { handle: handle.clone(), at: 1, stop: false }));

    let controller = async {
        let mut states = handle.subscribe();
        states.wait_for(|s| s.status == RunnerStatus::Paused).await.unwrap();
        handle.stop();
    };
    let (result, ()) = tokio::join!(runner.run(), controller);

    assert_eq!(result.status, RunnerStatus::Idle);
    assert_eq!(result.stop_reason, Some(StopReason::Stopped));
    assert_eq!(result.installments_written, 1);
}

#[tokio::test]
async fn test_failure_pauses_for_resume() {
    let h = TestHarness::new(3, 3).configure(|c| c.with_failure_policy(FailurePolicy::PauseForResume));
    // Call 0 is the story plan, call 1 the first draft of installment 1.
    h.generator.fail_next_after(1, GenerationError::Timeout);
    let mut runner = h.runner();
    let handle = runner.handle();

    let controller = async {
        let mut states = handle.subscribe();
        let failed = states.wait_for(|s| s.status == RunnerStatus::Paused).await.unwrap().failed;
        handle.resume();
        failed
    };
    let (result, failed_at_pause) = tokio::join!(runner.run(), controller);

    assert_eq!(failed_at_pause, 1);
    assert_eq!(result.status, RunnerStatus::Completed);
    assert_eq!(result.installments_written, 3);
    assert_eq!(result.installments_failed, 1);
}

// =============================================================================
// Snapshots
// =============================================================================

#[tokio::test]
async fn test_catch_up_when_snapshot_is_behind() {
    let h = TestHarness::new(10, 5).configure(|c| c.with_session_limit(7));
    let first = h.run().await;
    assert_eq!(first.last_installment, 7);

    // Installment 8 reached the store but no snapshot recorded it.
    let (title, body) = mock_draft(500);
    let mut record = InstallmentRecord::new(8, 2, title, body);
    record.summary = "A late installment.".into();
    h.store.save_installment(&h.config.story_id, &record).await.unwrap();

    let second = h.configure(|c| c.with_session_limit(10)).run().await;
    assert_eq!(second.status, RunnerStatus::Completed);
    assert_eq!(second.installments_written, 2);
    assert_eq!(second.last_installment, 10);
}

#[tokio::test]
async fn test_json_file_store_run_and_resume() {
    let dir = TempDir::new().unwrap();
    let h = TestHarness::new(6, 3);
    let runner = |target: u32| {
        Runner::new(
            h.config.clone().with_target(target),
            h.generator.clone(),
            Arc::new(JsonFileStore::new(dir.path())),
        )
        .with_scorer(Arc::new(HeuristicScorer::new().with_min_words(60)))
    };

    let first = runner(4).run().await;
    assert_eq!(first.installments_written, 4);
    assert!(dir.path().join("test-story").join("snapshot.json").exists());
    assert!(dir.path().join("test-story").join("installments").join("00004.json").exists());

    let second = runner(6).run().await;
    assert_eq!(second.status, RunnerStatus::Completed);
    assert_eq!(second.installments_written, 2);

    let store = JsonFileStore::new(dir.path());
    let installments = store.load_installments("test-story", 1, 6).await.unwrap();
    assert_eq!(installments.len(), 6);
    assert_eq!(store.load_arcs("test-story").await.unwrap().len(), 2);
}

/// The prompt of the most recent installment request.
fn last_installment_prompt(h: &TestHarness) -> String {
    h.generator
        .calls_for(Purpose::Installment)
        .last()
        .map(|call| call.user.clone())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_resume_without_snapshot_keeps_world_rules_title_and_cooldowns() {
    let dir = TempDir::new().unwrap();
    let h = TestHarness::new(10, 10).configure(|c| c.with_world_document("Magic costs memory."));
    let runner = |limit: u32| {
        Runner::new(
            h.config.clone().with_session_limit(limit),
            h.generator.clone(),
            Arc::new(JsonFileStore::new(dir.path())),
        )
        .with_scorer(Arc::new(HeuristicScorer::new().with_min_words(60)))
    };
    let story_dir = dir.path().join("test-story");

    let first = runner(3).run().await;
    assert_eq!(first.last_installment, 3);
    assert!(last_installment_prompt(&h).contains("Immutable world rules"));
    assert!(story_dir.join("story.json").exists());

    // Installments 1 and 3 used banter, 2 an inner monologue.
    std::fs::remove_file(story_dir.join("snapshot.json")).unwrap();
    let second = runner(1).run().await;
    assert_eq!(second.status, RunnerStatus::Completed);
    assert_eq!(second.last_installment, 4);

    let prompt = last_installment_prompt(&h);
    assert!(prompt.contains("Immutable world rules"));
    assert!(prompt.contains("every spell costs a memory"));
    assert!(prompt.contains("Write installment 4 of \"The Ember Road\""));
    assert!(prompt.contains(BeatType::Banter.description()));
    assert!(prompt.contains(BeatType::InnerReflection.description()));
    assert_eq!(h.generator.calls_for(Purpose::StoryPlan).len(), 1);

    let stored = JsonFileStore::new(dir.path());
    let record = stored.load_installment("test-story", 4).await.unwrap().unwrap();
    assert!(!record.beats.is_empty());

    // Without the header the rules still come back from canon.
    std::fs::remove_file(story_dir.join("snapshot.json")).unwrap();
    std::fs::remove_file(story_dir.join("story.json")).unwrap();
    let third = runner(1).run().await;
    assert_eq!(third.last_installment, 5);
    let prompt = last_installment_prompt(&h);
    assert!(prompt.contains("every spell costs a memory"));
    assert!(prompt.contains("Write installment 5 of \"Untitled\""));
}

#[tokio::test]
async fn test_resume_mid_arc_counts_stored_installments_only() {
    let h = TestHarness::new(4, 4)
        .configure(|c| c.with_session_limit(2).with_failure_policy(FailurePolicy::RetryImmediately { max_retries: 0 }));
    let first = h.run().await;
    assert_eq!(first.last_installment, 2);
    let snapshot = h.store.load_snapshot(&h.config.story_id).await.unwrap().unwrap();
    assert_eq!(snapshot.progress, 2);

    // The snapshot claims two installments of arc 1, but none reached this store.
    let store = Arc::new(MemoryStore::new());
    store.save_snapshot(&h.config.story_id, &snapshot).await.unwrap();
    h.generator.fail_purpose(Purpose::Installment, GenerationError::ContentPolicy("refused".into()));

    let mut config = h.config.clone();
    config.session_limit = None;
    let result = Runner::new(config, h.generator.clone(), store)
        .with_scorer(Arc::new(HeuristicScorer::new().with_min_words(60)))
        .run()
        .await;

    assert_eq!(result.status, RunnerStatus::Error);
    assert_eq!(result.stop_reason, Some(StopReason::ArcFailed));
    assert_eq!(result.failed_installments, vec![3, 4]);
}

#[tokio::test]
async fn test_resume_mid_arc_completes_the_arc() {
    let h = TestHarness::new(6, 6).configure(|c| c.with_session_limit(3));
    let first = h.run().await;
    assert_eq!(first.arcs_completed, 0);

    let second = h.configure(|c| c.with_session_limit(10)).run().await;
    assert_eq!(second.status, RunnerStatus::Completed);
    assert_eq!(second.installments_written, 3);
    assert_eq!(second.arcs_completed, 1);
}
