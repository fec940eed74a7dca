//! End-to-end runs against the mock generator and in-memory store.
//!
//! Run with: `cargo test -p saga-core --test qa_full_run`

use saga_core::canon::AuthorityLevel;
use saga_core::generation::{GenerationError, Purpose};
use saga_core::persist::StoryStore;
use saga_core::planning::ArcStatus;
use saga_core::runner::{FailurePolicy, RunnerStatus, StopReason};
use saga_core::testing::TestHarness;

// =============================================================================
// Fresh story
// =============================================================================

#[tokio::test]
async fn test_fresh_story_twenty_installments_two_arcs() {
    let h = TestHarness::new(20, 10);
    let result = h.run().await;

    assert_eq!(result.status, RunnerStatus::Completed);
    assert_eq!(result.stop_reason, Some(StopReason::TargetReached));
    assert_eq!(result.installments_written, 20);
    assert_eq!(result.installments_failed, 0);
    assert_eq!(result.last_installment, 20);
    assert_eq!(result.arcs_completed, 2);
    assert_eq!(result.flagged_for_review, 0);
    assert!(result.success);

    let story = &h.config.story_id;
    let arcs = h.store.load_arcs(story).await.unwrap();
    assert_eq!(arcs.len(), 2);
    assert!(arcs.iter().all(|arc| arc.status == ArcStatus::Completed));

    let twists = h.store.load_twists(story).await.unwrap();
    for arc in &arcs {
        let count = twists.iter().filter(|t| t.arc_number == arc.arc_number).count();
        assert_eq!(count, 2, "arc {} twists", arc.arc_number);
    }

    let installments = h.installments().await.unwrap();
    assert_eq!(installments.len(), 20);
    assert!(installments.iter().enumerate().all(|(i, r)| r.number == i as u32 + 1));
    assert!(installments.iter().all(|r| !r.summary.is_empty() && !r.title.is_empty()));
}

#[tokio::test]
async fn test_story_is_planned_once_and_synopsis_follows_arcs() {
    let h = TestHarness::new(20, 10);
    h.run().await;

    assert_eq!(h.generator.calls_for(Purpose::StoryPlan).len(), 1);
    assert_eq!(h.generator.calls_for(Purpose::Installment).len(), 20);
    assert_eq!(h.generator.calls_for(Purpose::SynopsisUpdate).len(), 2);

    let story = &h.config.story_id;
    let synopsis = h.store.load_synopsis(story).await.unwrap().unwrap();
    assert_eq!(synopsis.through_installment, 20);
    assert!(synopsis.text.contains("Kael"));

    let snapshot = h.store.load_snapshot(story).await.unwrap().unwrap();
    assert_eq!(snapshot.progress, 20);
    assert_eq!(snapshot.title.as_deref(), Some("The Ember Road"));
    assert_eq!(snapshot.state.status, RunnerStatus::Completed);
}

#[tokio::test]
async fn test_installment_prompt_carries_context() {
    let h = TestHarness::new(3, 3);
    h.run().await;

    let calls = h.generator.calls_for(Purpose::Installment);
    assert!(calls[0].user.contains("Write installment 1 of \"The Ember Road\""));
    assert!(calls[2].user.contains("Write installment 3"));
    // The previous installment's title is listed for anti-repetition.
    let installments = h.installments().await.unwrap();
    assert!(calls[2].user.contains(&installments[1].title));
}

#[tokio::test]
async fn test_world_document_becomes_canon() {
    let h = TestHarness::new(2, 2).configure(|c| c.with_world_document("Magic costs memory. Kael lives in the capital."));
    let result = h.run().await;
    assert!(result.success);

    let plan_call = &h.generator.calls_for(Purpose::StoryPlan)[0];
    assert!(plan_call.user.contains("every spell costs a memory"));

    let snapshot = h.store.load_snapshot(&h.config.story_id).await.unwrap().unwrap();
    let rule = snapshot.canon.get("Magic", "cost").unwrap();
    assert_eq!(rule.authority, AuthorityLevel::Canon);
    assert_eq!(snapshot.constraints.immutable.len(), 1);
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_unparseable_plan_is_fatal() {
    let h = TestHarness::new(5, 5);
    h.generator.push_response(Purpose::StoryPlan, "I'd rather not plan this story.");
    let result = h.run().await;

    assert_eq!(result.status, RunnerStatus::Error);
    assert_eq!(result.stop_reason, Some(StopReason::PlanningFailed));
    assert_eq!(result.installments_written, 0);
    assert!(!result.success);
    assert!(result.first_error.unwrap().contains("planning"));
    assert_eq!(h.generator.calls_for(Purpose::Installment).len(), 0);
}

#[tokio::test]
async fn test_failed_installment_is_retried() {
    let h = TestHarness::new(4, 4);
    // Call 0 is the story plan, call 1 the first draft of installment 1.
    h.generator.fail_next_after(1, GenerationError::ContentPolicy("refused".into()));
    let result = h.run().await;

    assert_eq!(result.status, RunnerStatus::Completed);
    assert_eq!(result.installments_written, 4);
    assert_eq!(result.installments_failed, 1);
    assert!(result.failed_installments.is_empty());
    assert!(result.first_error.is_some());
    assert!(result.success);
}

#[tokio::test]
async fn test_arc_with_no_installments_fails_the_run() {
    let h = TestHarness::new(20, 5)
        .configure(|c| c.with_failure_policy(FailurePolicy::RetryImmediately { max_retries: 0 }));
    h.generator.fail_purpose(Purpose::Installment, GenerationError::ContentPolicy("refused".into()));
    let result = h.run().await;

    assert_eq!(result.status, RunnerStatus::Error);
    assert_eq!(result.stop_reason, Some(StopReason::ArcFailed));
    assert_eq!(result.installments_written, 0);
    assert_eq!(result.failed_installments, vec![1, 2, 3, 4, 5]);
    assert!(!result.success);

    let arcs = h.store.load_arcs(&h.config.story_id).await.unwrap();
    assert_eq!(arcs[0].status, ArcStatus::Failed);
}

#[tokio::test]
async fn test_partial_arc_failure_does_not_abort() {
    let h = TestHarness::new(5, 5)
        .configure(|c| c.with_failure_policy(FailurePolicy::RetryImmediately { max_retries: 0 }));
    h.generator.fail_next_after(1, GenerationError::ContentPolicy("refused".into()));
    let result = h.run().await;

    assert_eq!(result.status, RunnerStatus::Completed);
    assert_eq!(result.installments_written, 4);
    assert_eq!(result.failed_installments, vec![1]);
    assert_eq!(result.arcs_completed, 1);
    assert!(result.success);
}

#[tokio::test]
async fn test_enrichment_failures_never_block() {
    let h = TestHarness::new(5, 5);
    h.generator.fail_purpose(Purpose::FactExtraction, GenerationError::Overloaded);
    h.generator.fail_purpose(Purpose::BeatDetection, GenerationError::Overloaded);
    h.generator.fail_purpose(Purpose::Summary, GenerationError::Overloaded);
    h.generator.fail_purpose(Purpose::SynopsisUpdate, GenerationError::Overloaded);
    let result = h.run().await;

    assert_eq!(result.status, RunnerStatus::Completed);
    assert_eq!(result.installments_written, 5);

    // Fallback summaries are the opening sentences.
    let installments = h.installments().await.unwrap();
    assert!(installments.iter().all(|r| r.summary.starts_with(&r.opening_line)));
    // The synopsis falls back to a digest of the summaries.
    let synopsis = h.store.load_synopsis(&h.config.story_id).await.unwrap().unwrap();
    assert_eq!(synopsis.through_installment, 5);
    assert!(!synopsis.text.is_empty());
}

#[tokio::test]
async fn test_weak_drafts_are_rewritten() {
    let h = TestHarness::new(1, 1);
    h.generator.push_response(Purpose::Installment, "Title: Stub\n\nToo short to keep");
    let result = h.run().await;

    assert_eq!(result.installments_written, 1);
    assert_eq!(result.rewrites, 1);
    assert_eq!(result.flagged_for_review, 0);

    let rewrite = &h.generator.calls_for(Purpose::Rewrite)[0];
    assert!(rewrite.user.contains("Too short to keep"));
}
