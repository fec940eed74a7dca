//! Testing utilities for the story runner.
//!
//! This module provides tools for integration testing:
//! - `MockGenerator` for deterministic testing without API calls
//! - `TestHarness` for scripted runs against an in-memory store

use crate::generation::{GenerationError, GenerationRequest, Generator, Purpose};
use crate::memory::InstallmentRecord;
use crate::persist::{MemoryStore, StoreError, StoryStore};
use crate::quality::HeuristicScorer;
use crate::runner::{RunConfig, RunResult, Runner};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

// ============================================================================
// Mock generator
// ============================================================================

const ADJECTIVES: [&str; 13] = [
    "Silent", "Broken", "Hollow", "Crimson", "Drowned", "Gilded", "Ashen", "Frozen", "Hidden", "Burning", "Last",
    "Iron", "Pale",
];
const NOUNS: [&str; 11] = [
    "Gate", "Crown", "Harbor", "Lantern", "Oath", "Bridge", "Orchard", "Tower", "Market", "Chapel", "Forge",
];
const NAMES: [&str; 7] = ["Kael", "Mira", "Orin", "Tessa", "Bram", "Ilse", "Corvin"];
const VERBS: [&str; 11] = [
    "hurried", "climbed", "limped", "rode", "drifted", "crept", "marched", "wandered", "sprinted", "sailed", "trudged",
];
const PLACES: [&str; 13] = [
    "harbor", "citadel", "ruins", "archive", "orchard", "pass", "marsh", "bazaar", "observatory", "shrine", "quarry",
    "lighthouse", "barracks",
];
const SKIES: [&str; 13] = [
    "bells", "stars", "lanterns", "torches", "clouds", "banners", "fires", "waves", "candles", "beacons", "embers",
    "windows", "moons",
];
const FADES: [&str; 11] = [
    "faded", "burned", "trembled", "darkened", "shattered", "sang", "dimmed", "wept", "hushed", "flickered", "broke",
];

const STORY_PLAN: &str = r#"{
  "title": "The Ember Road",
  "bible": "Kael is a courier carrying a forbidden letter across a collapsing empire. Mira is a smuggler who owes him a life. Magic costs the caster a memory.",
  "arcs": [
    {"arc": 1, "theme": "flight from the capital", "outline": "Kael steals the letter and flees the capital with the guard at his heels.",
     "briefs": ["Kael is handed the letter.", "Kael escapes the city walls."]},
    {"arc": 2, "theme": "the smuggler's debt", "outline": "Mira collects on an old debt and the road turns south.",
     "briefs": ["Mira finds Kael at the crossing."]}
  ]
}"#;

const CONSTRAINTS: &str = r#"{
  "immutable": [
    {"subject": "Magic", "predicate": "cost", "value": "every spell costs a memory", "category": "world_rule"}
  ],
  "mutable": [
    {"subject": "Kael", "predicate": "location", "value": "the capital", "keywords": ["capital"]}
  ]
}"#;

const SYNOPSIS: &str = r#"{
  "synopsis": "Kael fled the capital with the forbidden letter and crossed the river with Mira's help.",
  "protagonist_state": "Tired, hunted, still carrying the letter.",
  "allies": ["Mira (smuggler)"],
  "enemies": ["The Warden (hunts Kael)"],
  "open_threads": ["What the letter says"]
}"#;

/// Title and body of the `k`th default draft. Titles, openings and closings
/// vary with `k` so consecutive drafts pass the anti-repetition checks.
pub fn mock_draft(k: usize) -> (String, String) {
    let name = NAMES[k % NAMES.len()];
    let title = format!("The {} {}", ADJECTIVES[k % ADJECTIVES.len()], NOUNS[k % NOUNS.len()]);
    let body = format!(
        "{name} {verb} toward the {place}. The air smelled of rain, old iron and older promises. \
         Every step cost {name} more than the last, but the road would not wait.\n\n\
         A stranger waited at the crossing with news from the capital. \
         {name} listened without a word, weighing each promise against the last betrayal. \
         Somewhere behind them, a bell began to toll.\n\n\
         Neither of them spoke of what the bell meant for the people still sleeping in the valley. \
         Behind {other}, the {sky} {fade}.",
        verb = VERBS[k % VERBS.len()],
        place = PLACES[k % PLACES.len()],
        other = NAMES[(k + 3) % NAMES.len()],
        sky = SKIES[k % SKIES.len()],
        fade = FADES[k % FADES.len()],
    );
    (title, body)
}

fn default_response(purpose: Purpose, k: usize) -> String {
    match purpose {
        Purpose::Installment | Purpose::Rewrite => {
            let (title, body) = mock_draft(k);
            format!("Title: {title}\n\n{body}")
        }
        Purpose::StoryPlan => STORY_PLAN.to_string(),
        Purpose::ConstraintExtraction => CONSTRAINTS.to_string(),
        Purpose::FactExtraction => format!(
            r#"{{"facts": [{{"subject": "{}", "predicate": "location", "value": "the {}", "category": "location"}}]}}"#,
            NAMES[k % NAMES.len()],
            PLACES[k % PLACES.len()]
        ),
        Purpose::BeatDetection => {
            if k % 2 == 0 {
                r#"{"beats": ["banter"]}"#.to_string()
            } else {
                r#"{"beats": ["inner_reflection"]}"#.to_string()
            }
        }
        Purpose::Summary => format!(
            "{} reached the {} and heard the bell toll.",
            NAMES[k % NAMES.len()],
            PLACES[k % PLACES.len()]
        ),
        Purpose::SynopsisUpdate => SYNOPSIS.to_string(),
        Purpose::BibleRefresh => format!(
            "Kael is a courier carrying a forbidden letter. Mira travels with him. \
             Magic costs the caster a memory. Revision {k}."
        ),
    }
}

#[derive(Default)]
struct MockState {
    scripted: HashMap<Purpose, VecDeque<String>>,
    /// Failures keyed by absolute call index.
    failures: BTreeMap<usize, GenerationError>,
    /// Failures returned for every call of a purpose.
    sticky: HashMap<Purpose, GenerationError>,
    calls: Vec<GenerationRequest>,
    counters: HashMap<Purpose, usize>,
}

/// A generator that returns scripted responses, then deterministic defaults.
///
/// Each call is answered by, in order: a failure scheduled for that call
/// index, a failure set for the purpose, the next scripted response for the
/// purpose, or a built-in default that parses cleanly for every purpose.
#[derive(Default)]
pub struct MockGenerator {
    state: Mutex<MockState>,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a response for the next call with `purpose`.
    pub fn push_response(&self, purpose: Purpose, text: impl Into<String>) {
        self.lock().scripted.entry(purpose).or_default().push_back(text.into());
    }

    /// Fail the next call that does not already have a failure scheduled.
    pub fn fail_next(&self, error: GenerationError) {
        let mut state = self.lock();
        let mut index = state.calls.len();
        while state.failures.contains_key(&index) {
            index += 1;
        }
        state.failures.insert(index, error);
    }

    /// Let `skip` calls through, then fail the one after.
    pub fn fail_next_after(&self, skip: usize, error: GenerationError) {
        let mut state = self.lock();
        let index = state.calls.len() + skip;
        state.failures.insert(index, error);
    }

    /// Fail every call with `purpose` until cleared.
    pub fn fail_purpose(&self, purpose: Purpose, error: GenerationError) {
        self.lock().sticky.insert(purpose, error);
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.failures.clear();
        state.sticky.clear();
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Every request received, in order.
    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.lock().calls.clone()
    }

    /// Requests received for one purpose.
    pub fn calls_for(&self, purpose: Purpose) -> Vec<GenerationRequest> {
        self.lock().calls.iter().filter(|c| c.purpose == purpose).cloned().collect()
    }

    fn respond(&self, request: GenerationRequest) -> Result<String, GenerationError> {
        let mut state = self.lock();
        let index = state.calls.len();
        let purpose = request.purpose;
        state.calls.push(request);

        if let Some(error) = state.failures.remove(&index) {
            return Err(error);
        }
        if let Some(error) = state.sticky.get(&purpose) {
            return Err(error.clone());
        }
        if let Some(text) = state.scripted.get_mut(&purpose).and_then(VecDeque::pop_front) {
            return Ok(text);
        }

        // Rewrites continue the draft sequence.
        let key = match purpose {
            Purpose::Rewrite => Purpose::Installment,
            other => other,
        };
        let counter = state.counters.entry(key).or_default();
        let k = *counter;
        *counter += 1;
        Ok(default_response(purpose, k))
    }
}

#[async_trait]
impl Generator for MockGenerator {
    async fn invoke(&self, request: GenerationRequest) -> Result<String, GenerationError> {
        self.respond(request)
    }
}

// ============================================================================
// Test harness
// ============================================================================

/// A mock generator, an in-memory store and a small run configuration.
pub struct TestHarness {
    pub generator: Arc<MockGenerator>,
    pub store: Arc<MemoryStore>,
    pub config: RunConfig,
}

impl TestHarness {
    pub fn new(target: u32, arc_size: u32) -> Self {
        let config = RunConfig::new(
            "test-story",
            "A courier carries a forbidden letter across a collapsing empire.",
        )
        .with_target(target)
        .with_arc_size(arc_size)
        .with_seed(7)
        .with_snapshot_interval(5);

        Self {
            generator: Arc::new(MockGenerator::new()),
            store: Arc::new(MemoryStore::new()),
            config,
        }
    }

    /// Adjust the run configuration.
    pub fn configure(mut self, f: impl FnOnce(RunConfig) -> RunConfig) -> Self {
        self.config = f(self.config);
        self
    }

    /// A runner over the harness generator and store. The scorer's length
    /// floor fits the mock drafts.
    pub fn runner(&self) -> Runner {
        Runner::new(self.config.clone(), self.generator.clone(), self.store.clone())
            .with_scorer(Arc::new(HeuristicScorer::new().with_min_words(60)))
    }

    pub async fn run(&self) -> RunResult {
        self.runner().run().await
    }

    /// Write installments 1..=through straight to the store, as an earlier
    /// run without snapshots would have left them.
    pub async fn seed_installments(&self, through: u32) -> Result<(), StoreError> {
        let arc_size = self.config.planner.arc_size.max(1);
        for n in 1..=through {
            let (title, body) = mock_draft(1000 + n as usize);
            let mut record = InstallmentRecord::new(n, (n - 1) / arc_size + 1, title, body);
            record.summary = format!("Installment {n} happened.");
            self.store.save_installment(&self.config.story_id, &record).await?;
        }
        Ok(())
    }

    /// Every stored installment, in order.
    pub async fn installments(&self) -> Result<Vec<InstallmentRecord>, StoreError> {
        self.store.load_installments(&self.config.story_id, 1, u32::MAX).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::{parse_draft, QualityAction, QualityConfig, QualityScorer, ScoringContext};

    #[tokio::test]
    async fn test_scripted_then_default() {
        let mock = MockGenerator::new();
        mock.push_response(Purpose::Summary, "scripted");
        let request = || GenerationRequest::new(Purpose::Summary, "sys", "user");

        assert_eq!(mock.invoke(request()).await.unwrap(), "scripted");
        assert!(mock.invoke(request()).await.unwrap().contains("reached the"));
        assert_eq!(mock.calls_for(Purpose::Summary).len(), 2);
    }

    #[tokio::test]
    async fn test_failure_scheduling() {
        let mock = MockGenerator::new();
        mock.fail_next_after(1, GenerationError::Timeout);
        mock.fail_next(GenerationError::Overloaded);
        let request = || GenerationRequest::new(Purpose::Summary, "sys", "user");

        assert!(matches!(mock.invoke(request()).await, Err(GenerationError::Overloaded)));
        assert!(matches!(mock.invoke(request()).await, Err(GenerationError::Timeout)));
        assert!(mock.invoke(request()).await.is_ok());

        mock.fail_purpose(Purpose::Summary, GenerationError::Overloaded);
        assert!(mock.invoke(request()).await.is_err());
        mock.clear_failures();
        assert!(mock.invoke(request()).await.is_ok());
    }

    #[test]
    fn test_consecutive_default_drafts_pass_the_heuristic_gate() {
        let scorer = HeuristicScorer::new().with_min_words(60);
        let mut context = ScoringContext::default();
        for k in 0..12 {
            let (title, body) = mock_draft(k);
            let draft = parse_draft(&format!("Title: {title}\n\n{body}")).unwrap();
            let report = scorer.score(&draft, &context, &QualityConfig::default());
            assert_eq!(report.action, QualityAction::Accept, "draft {k}: {report:?}");

            let record = InstallmentRecord::new(k as u32 + 1, 1, title, body);
            context.prior_titles.push(record.title.clone());
            context.prior_openings.push(record.opening_line.clone());
            context.prior_closings.push(record.closing_line.clone());
        }
    }
}
