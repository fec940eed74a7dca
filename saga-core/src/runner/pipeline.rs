//! The run loop.
//!
//! ```text
//! load ─┬─ snapshot ──────> restore (+ catch up from stored installments)
//!       ├─ records only ──> reconstruct from header, facts, arcs, beats, synopsis
//!       └─ nothing ───────> constraints ─> story plan
//!                                │
//!                     plan arcs through target ─> snapshot
//!                                │
//!   ┌────────────────────────────┘
//!   v
//! for n in progress+1..=target:
//!     stop? limit? paused?
//!     context ─> quality gate ─> save text ─> facts | beats | summary ─> memory
//!     arc end?  synopsis, bible refresh, save arc
//!     every k:  snapshot
//! ```

use super::handle::RunnerHandle;
use super::plan::StoryPlan;
use super::post;
use super::{
    FailurePolicy, NoEvents, RunConfig, RunError, RunResult, RunnerEvents, RunnerState, RunnerStatus, StopReason,
};
use crate::beats::BeatLedger;
use crate::canon::{CanonStore, ConstraintExtractor, ConstraintSet, ExtractError, Registration};
use crate::context::{ContextAssembler, ContextSources, LayerError, OmitReason};
use crate::generation::{GenerationRequest, Generator, Purpose};
use crate::memory::{InstallmentRecord, NarrativeMemory, RollingSynopsis};
use crate::persist::{StoreError, StoryHeader, StorySnapshot, StoryStore, SNAPSHOT_VERSION};
use crate::planning::{ArcPlanner, ArcStatus, StoryArc};
use crate::prompts;
use crate::quality::{HeuristicScorer, QualityGate, QualityScorer, ScoringContext};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ============================================================================
// Story state
// ============================================================================

/// Everything the runner knows about the story being written.
struct StoryState {
    title: Option<String>,
    memory: NarrativeMemory,
    canon: CanonStore,
    constraints: ConstraintSet,
    ledger: BeatLedger,
    planner: ArcPlanner,
    /// Highest installment written.
    progress: u32,
}

impl StoryState {
    fn title(&self) -> &str {
        self.title.as_deref().unwrap_or("Untitled")
    }
}

/// Run totals that are not part of the published state.
#[derive(Default)]
struct Tally {
    failed_installments: Vec<u32>,
    arcs_completed: u32,
    first_error: Option<String>,
}

impl Tally {
    fn record_error(&mut self, error: &RunError) {
        if self.first_error.is_none() {
            self.first_error = Some(error.to_string());
        }
    }
}

// ============================================================================
// Runner
// ============================================================================

/// Drives one story from premise to target length.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use saga_core::generation::Generator;
/// # use saga_core::persist::MemoryStore;
/// # use saga_core::runner::{RunConfig, Runner};
/// # async fn example(generator: Arc<dyn Generator>) {
/// let config = RunConfig::new("ember", "A courier carries a forbidden letter.").with_target(30);
/// let mut runner = Runner::new(config, generator, Arc::new(MemoryStore::new()));
/// let handle = runner.handle();
/// let result = runner.run().await;
/// assert_eq!(handle.state().status, result.status);
/// # }
/// ```
pub struct Runner {
    config: RunConfig,
    generator: Arc<dyn Generator>,
    store: Arc<dyn StoryStore>,
    gate: QualityGate,
    assembler: ContextAssembler,
    events: Arc<dyn RunnerEvents>,
    stop: CancellationToken,
    pause_rx: watch::Receiver<bool>,
    pause_tx: Arc<watch::Sender<bool>>,
    state_tx: watch::Sender<RunnerState>,
    state: RunnerState,
    handle: RunnerHandle,
}

impl Runner {
    pub fn new(config: RunConfig, generator: Arc<dyn Generator>, store: Arc<dyn StoryStore>) -> Self {
        let stop = CancellationToken::new();
        let (pause_tx, pause_rx) = watch::channel(false);
        let pause_tx = Arc::new(pause_tx);
        let (state_tx, state_rx) = watch::channel(RunnerState::default());
        let handle = RunnerHandle::new(stop.clone(), pause_tx.clone(), state_rx);

        Self {
            gate: QualityGate::new(Arc::new(HeuristicScorer::new()), config.quality.clone()),
            assembler: ContextAssembler::new(config.context.clone()),
            config,
            generator,
            store,
            events: Arc::new(NoEvents),
            stop,
            pause_rx,
            pause_tx,
            state_tx,
            state: RunnerState::default(),
            handle,
        }
    }

    /// Replace the draft scorer.
    pub fn with_scorer(mut self, scorer: Arc<dyn QualityScorer>) -> Self {
        self.gate = QualityGate::new(scorer, self.config.quality.clone());
        self
    }

    pub fn with_events(mut self, events: Arc<dyn RunnerEvents>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Control handle. Valid before, during and after `run`.
    pub fn handle(&self) -> RunnerHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> &RunnerState {
        &self.state
    }

    /// Run until the target, the session limit, a stop, or a fatal error.
    pub async fn run(&mut self) -> RunResult {
        info!(
            story = %self.config.story_id,
            target = self.config.target_installments,
            "starting run"
        );
        self.state = RunnerState::default();
        self.publish();

        let mut tally = Tally::default();
        if let Err(e) = self.run_inner(&mut tally).await {
            error!(story = %self.config.story_id, error = %e, "run failed");
            let reason = match e {
                RunError::ArcFailed(_) => StopReason::ArcFailed,
                _ => StopReason::PlanningFailed,
            };
            tally.record_error(&e);
            self.events.on_error(&e);
            self.state.last_error = Some(e.to_string());
            self.state.stop_reason = Some(reason);
            self.set_status(RunnerStatus::Error);
        }

        let result = self.result(&tally);
        info!(
            story = %self.config.story_id,
            status = result.status.name(),
            written = result.installments_written,
            failed = result.installments_failed,
            last = result.last_installment,
            "run finished"
        );
        result
    }

    async fn run_inner(&mut self, tally: &mut Tally) -> Result<(), RunError> {
        self.config.validate()?;

        let (mut story, plan) = self.load_or_plan().await?;
        self.state.progress = story.progress;
        self.plan_arcs(&mut story, plan.as_ref()).await;
        self.save_snapshot(&story).await;

        self.write_loop(&mut story, tally).await?;
        self.save_snapshot(&story).await;
        Ok(())
    }

    fn result(&self, tally: &Tally) -> RunResult {
        RunResult {
            status: self.state.status,
            stop_reason: self.state.stop_reason,
            installments_written: self.state.written,
            installments_failed: self.state.failed,
            failed_installments: tally.failed_installments.clone(),
            arcs_completed: tally.arcs_completed,
            rewrites: self.state.rewrites,
            flagged_for_review: self.state.flagged,
            last_installment: self.state.progress,
            first_error: tally.first_error.clone(),
            success: self.state.status != RunnerStatus::Error && self.state.written > 0,
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }

    fn set_status(&mut self, status: RunnerStatus) {
        if self.state.status != status {
            debug!(story = %self.config.story_id, from = self.state.status.name(), to = status.name(), "runner transition");
        }
        self.state.status = status;
        self.publish();
        self.events.on_phase(status);
    }

    fn finish(&mut self, status: RunnerStatus, reason: StopReason) {
        info!(story = %self.config.story_id, reason = ?reason, "run ending");
        self.state.stop_reason = Some(reason);
        self.set_status(status);
    }

    /// Log a failed optional write. Only the installment text itself is
    /// required to reach the store.
    fn optional(&self, what: &str, result: Result<(), StoreError>) {
        if let Err(e) = result {
            warn!(story = %self.config.story_id, error = %e, "failed to save {what}");
        }
    }

    // ========================================================================
    // Loading and planning
    // ========================================================================

    async fn load_or_plan(&mut self) -> Result<(StoryState, Option<StoryPlan>), RunError> {
        let story_id = self.config.story_id.clone();
        let snapshot = match self.store.load_snapshot(&story_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(story = %story_id, error = %e, "snapshot unreadable, rebuilding from records");
                None
            }
        };
        let latest = self.store.latest_installment(&story_id).await?.unwrap_or(0);

        match snapshot {
            Some(snapshot) => Ok((self.restore_snapshot(snapshot, latest).await, None)),
            None if latest > 0 => Ok((self.reconstruct(latest).await?, None)),
            None => {
                let (story, plan) = self.plan_story().await?;
                Ok((story, Some(plan)))
            }
        }
    }

    async fn restore_snapshot(&self, snapshot: StorySnapshot, latest: u32) -> StoryState {
        let story_id = &self.config.story_id;
        info!(story = %story_id, progress = snapshot.progress, saved_at = %snapshot.saved_at, "resuming from snapshot");
        let mut story = StoryState {
            title: snapshot.title,
            memory: snapshot.memory,
            canon: snapshot.canon,
            constraints: snapshot.constraints,
            ledger: snapshot.ledger,
            planner: snapshot.planner,
            progress: snapshot.progress,
        };

        if latest > story.progress {
            info!(story = %story_id, snapshot = story.progress, latest, "snapshot is behind stored installments, catching up");
            match self.store.load_installments(story_id, story.progress + 1, latest).await {
                Ok(records) => {
                    for record in records {
                        story.memory.record_installment(record);
                    }
                }
                Err(e) => warn!(story = %story_id, error = %e, "could not load installments newer than the snapshot"),
            }
            match self.store.load_facts(story_id).await {
                Ok(facts) => {
                    let since = story.progress;
                    for fact in facts.into_iter().filter(|f| f.source_installment > since) {
                        story.canon.register_fact(fact);
                    }
                }
                Err(e) => warn!(story = %story_id, error = %e, "could not load facts newer than the snapshot"),
            }
            story.progress = latest;
        }
        story.canon.advance_to(story.progress);
        story
    }

    /// Rebuild from per-record storage when there is no usable snapshot.
    async fn reconstruct(&self, latest: u32) -> Result<StoryState, RunError> {
        let story_id = &self.config.story_id;
        warn!(story = %story_id, progress = latest, "no snapshot, reconstructing from stored records");

        let arcs = self.store.load_arcs(story_id).await?;
        let twists = self.store.load_twists(story_id).await?;
        let mut planner = ArcPlanner::restore(self.config.planner.clone(), arcs, twists);
        planner.ensure_through(latest);

        let facts = self.store.load_facts(story_id).await?;
        let issues = self.store.load_issues(story_id).await?;
        let mut canon = CanonStore::restore(facts.clone(), issues).with_high_stakes_threshold(self.config.high_stakes_threshold);
        canon.advance_to(latest);

        let mut memory = NarrativeMemory::new(self.config.memory.clone());
        let window = self.config.memory.recent_window.max(self.config.memory.anti_repetition_window) as u32;
        let first = latest.saturating_sub(window.saturating_sub(1)).max(1);
        for record in self.store.load_installments(story_id, first, latest).await? {
            memory.record_installment(record);
        }
        if let Some(synopsis) = self.store.load_synopsis(story_id).await? {
            memory.replace_synopsis(synopsis);
        }

        let (title, constraints) = match self.store.load_header(story_id).await? {
            Some(header) => {
                if let Some(bible) = header.bible {
                    memory.restore_bible(bible);
                }
                (header.title, header.constraints)
            }
            None => {
                warn!(story = %story_id, "no story header, rebuilding world rules from canon and continuing without a bible");
                (None, ConstraintSet::from_world_facts(&facts))
            }
        };

        // Uses older than the longest cooldown restrict nothing.
        let ledger = BeatLedger::new();
        let first = latest.saturating_sub(ledger.longest_cooldown()).max(1);
        let uses: Vec<_> = self
            .store
            .load_installments(story_id, first, latest)
            .await?
            .into_iter()
            .flat_map(|record| {
                let number = record.number;
                record.beats.into_iter().map(move |beat| (beat, number))
            })
            .collect();
        debug!(story = %story_id, uses = uses.len(), "beat ledger replayed");
        let ledger = ledger.replay(uses);

        Ok(StoryState {
            title,
            memory,
            canon,
            constraints,
            ledger,
            planner,
            progress: latest,
        })
    }

    async fn plan_story(&mut self) -> Result<(StoryState, StoryPlan), RunError> {
        self.set_status(RunnerStatus::PlanningStory);
        let story_id = self.config.story_id.clone();

        let mut canon = CanonStore::new().with_high_stakes_threshold(self.config.high_stakes_threshold);
        let mut constraints = ConstraintSet::default();
        let document = self.config.world_document.clone().filter(|d| !d.trim().is_empty());
        if let Some(document) = document {
            match ConstraintExtractor::new().extract(self.generator.as_ref(), &document).await {
                Ok(set) => {
                    let facts = set.to_facts();
                    for fact in facts.iter().cloned() {
                        canon.register_fact(fact);
                    }
                    self.optional("world facts", self.store.save_facts(&story_id, &facts).await);
                    constraints = set;
                }
                Err(ExtractError::Unparseable) => {
                    warn!(story = %story_id, "world document yielded no usable constraints");
                }
                Err(e) => return Err(RunError::Planning(e.to_string())),
            }
        }

        let settings = &self.config.generation;
        let mut user = format!(
            "Premise:\n{}\n\nPlan {} arcs of {} installments each, {} installments in total.",
            self.config.premise.trim(),
            self.config.arc_count(),
            self.config.planner.arc_size,
            self.config.target_installments,
        );
        if !constraints.immutable.is_empty() {
            user.push_str("\n\nWorld rules that can never change:\n");
            for rule in &constraints.immutable {
                user.push_str(&format!("- {}\n", rule.describe()));
            }
        }
        let request = GenerationRequest::new(Purpose::StoryPlan, prompts::STORY_PLAN, user)
            .with_max_output_tokens(settings.installment_max_tokens)
            .with_temperature(settings.creative_temperature);
        let raw = self
            .generator
            .invoke(request)
            .await
            .map_err(|e| RunError::Planning(e.to_string()))?;
        let plan = StoryPlan::parse(&raw).ok_or_else(|| RunError::Planning("story plan could not be parsed".into()))?;

        let mut memory = NarrativeMemory::new(self.config.memory.clone());
        if plan.bible.trim().is_empty() {
            warn!(story = %story_id, "story plan has no bible, using the premise");
            memory.set_bible(self.config.premise.trim());
        } else {
            memory.set_bible(plan.bible.trim());
        }
        let mut planner = ArcPlanner::new(self.config.planner.clone());
        plan.apply_themes(&mut planner);

        let title = Some(plan.title.trim().to_string()).filter(|t| !t.is_empty());
        info!(story = %story_id, title = ?title, arcs = plan.arcs.len(), "story planned");

        let story = StoryState {
            title,
            memory,
            canon,
            constraints,
            ledger: BeatLedger::new(),
            planner,
            progress: 0,
        };
        self.save_header(&story).await;
        Ok((story, plan))
    }

    async fn plan_arcs(&mut self, story: &mut StoryState, plan: Option<&StoryPlan>) {
        self.set_status(RunnerStatus::PlanningArcs);
        story.planner.ensure_through(self.config.target_installments);
        if let Some(plan) = plan {
            plan.apply_outlines(&mut story.planner);
        }

        let story_id = &self.config.story_id;
        let arcs: Vec<StoryArc> = story.planner.arcs().cloned().collect();
        for arc in &arcs {
            self.optional("arc", self.store.save_arc(story_id, arc).await);
        }
        self.optional("twists", self.store.save_twists(story_id, story.planner.twists()).await);
        debug!(story = %story_id, arcs = arcs.len(), twists = story.planner.twists().len(), "arcs planned");
    }

    async fn save_header(&self, story: &StoryState) {
        let header = StoryHeader {
            title: story.title.clone(),
            bible: story.memory.bible().cloned(),
            constraints: story.constraints.clone(),
        };
        self.optional("story header", self.store.save_header(&self.config.story_id, &header).await);
    }

    async fn save_snapshot(&self, story: &StoryState) {
        let snapshot = StorySnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            progress: story.progress,
            title: story.title.clone(),
            state: self.state.clone(),
            memory: story.memory.clone(),
            canon: story.canon.clone(),
            constraints: story.constraints.clone(),
            ledger: story.ledger.clone(),
            planner: story.planner.clone(),
        };
        match self.store.save_snapshot(&self.config.story_id, &snapshot).await {
            Ok(()) => debug!(story = %self.config.story_id, progress = story.progress, "snapshot saved"),
            Err(e) => warn!(story = %self.config.story_id, error = %e, "failed to save snapshot"),
        }
    }

    // ========================================================================
    // Writing
    // ========================================================================

    async fn write_loop(&mut self, story: &mut StoryState, tally: &mut Tally) -> Result<(), RunError> {
        self.set_status(RunnerStatus::Writing);
        let target = self.config.target_installments;
        let mut successes: HashMap<u32, u32> = HashMap::new();
        let mut failures_here = 0u32;
        let mut n = story.progress + 1;

        // Installments stored by earlier runs count toward the arc in progress.
        if let Some((arc_number, start)) = story.planner.arc_for(n).map(|arc| (arc.arc_number, arc.start)) {
            if story.progress >= start {
                let stored = self.stored_in_arc(start, story.progress).await;
                successes.insert(arc_number, stored);
            }
        }

        while n <= target {
            if self.stop.is_cancelled() {
                self.finish(RunnerStatus::Idle, StopReason::Stopped);
                return Ok(());
            }
            if let Some(limit) = self.config.session_limit {
                if self.state.written >= limit {
                    self.finish(RunnerStatus::Completed, StopReason::SessionLimit);
                    return Ok(());
                }
            }
            if !self.wait_while_paused().await {
                self.finish(RunnerStatus::Idle, StopReason::Stopped);
                return Ok(());
            }

            let arc_number = story.planner.arc_number_for(n);
            if let Some(arc) = story.planner.arc_mut(arc_number) {
                if arc.status == ArcStatus::Planned {
                    arc.status = ArcStatus::InProgress;
                }
            }
            self.state.current_arc = arc_number;
            self.state.current_installment = n;
            self.publish();

            match self.write_installment(story, n).await {
                Ok(record) => {
                    *successes.entry(arc_number).or_default() += 1;
                    failures_here = 0;
                    story.progress = n;
                    self.state.progress = n;
                    self.state.written += 1;
                    self.publish();
                    self.events.on_installment(&record);
                }
                Err(e) => {
                    error!(story = %self.config.story_id, installment = n, error = %e, "installment failed");
                    failures_here += 1;
                    tally.record_error(&e);
                    self.state.failed += 1;
                    self.state.last_error = Some(e.to_string());
                    self.publish();
                    self.events.on_error(&e);

                    match self.config.failure_policy {
                        FailurePolicy::RetryImmediately { max_retries } if failures_here <= max_retries => {
                            info!(installment = n, retry = failures_here, "retrying installment");
                            continue;
                        }
                        FailurePolicy::RetryImmediately { .. } => {
                            warn!(installment = n, "skipping installment");
                            tally.failed_installments.push(n);
                            failures_here = 0;
                        }
                        FailurePolicy::PauseForResume => {
                            warn!(installment = n, "pausing until resumed");
                            self.pause_tx.send_replace(true);
                            continue;
                        }
                    }
                }
            }

            if story.planner.arc(arc_number).map(|arc| arc.end) == Some(n) {
                let written = successes.get(&arc_number).copied().unwrap_or(0);
                self.finish_arc(story, arc_number, written, tally).await?;
            }
            if self.config.snapshot_interval > 0 && n % self.config.snapshot_interval == 0 {
                self.save_snapshot(story).await;
            }
            n += 1;
        }

        self.finish(RunnerStatus::Completed, StopReason::TargetReached);
        Ok(())
    }

    /// Accepted installments already stored in `start..=through`.
    async fn stored_in_arc(&self, start: u32, through: u32) -> u32 {
        match self.store.load_installments(&self.config.story_id, start, through).await {
            Ok(records) => records.len() as u32,
            Err(e) => {
                warn!(story = %self.config.story_id, error = %e, "could not count stored installments, assuming all were written");
                through - start + 1
            }
        }
    }

    /// Block while paused. Returns false if stopped in the meantime.
    async fn wait_while_paused(&mut self) -> bool {
        if !*self.pause_rx.borrow_and_update() {
            return true;
        }
        info!(story = %self.config.story_id, "paused");
        self.set_status(RunnerStatus::Paused);
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return false,
                changed = self.pause_rx.changed() => {
                    if changed.is_err() || !*self.pause_rx.borrow_and_update() {
                        break;
                    }
                }
            }
        }
        info!(story = %self.config.story_id, "resumed");
        self.set_status(RunnerStatus::Writing);
        true
    }

    async fn write_installment(&mut self, story: &mut StoryState, n: u32) -> Result<InstallmentRecord, RunError> {
        story.canon.advance_to(n);
        let objectives = story.planner.plot_objectives(n);
        let recent = self.recent_installments(story, n).await;

        let payload = self.assembler.build(
            n,
            ContextSources {
                canon: &story.canon,
                constraints: &story.constraints,
                memory: &story.memory,
                planner: &story.planner,
                ledger: &story.ledger,
                objectives: &objectives,
                recent,
            },
        );
        for omitted in &payload.omitted {
            if let OmitReason::FetchFailed(reason) = &omitted.reason {
                warn!(installment = n, layer = ?omitted.kind, %reason, "writing without context layer");
            }
        }

        let settings = &self.config.generation;
        let user = format!(
            "{}\n\nWrite installment {n} of \"{}\".",
            payload.to_prompt_string(),
            story.title()
        );
        let request = GenerationRequest::new(Purpose::Installment, prompts::INSTALLMENT, user)
            .with_max_output_tokens(settings.installment_max_tokens)
            .with_temperature(settings.creative_temperature);
        let scoring = ScoringContext {
            installment: n,
            dead_entities: story.canon.dead_entities(),
            prior_titles: story.memory.prior_titles().map(String::from).collect(),
            prior_openings: story.memory.prior_openings().map(String::from).collect(),
            prior_closings: story.memory.prior_closings().map(String::from).collect(),
        };

        let outcome = self
            .gate
            .run(self.generator.as_ref(), request, &scoring)
            .await
            .map_err(|source| RunError::Installment { number: n, source })?;

        let mut record = InstallmentRecord::new(n, objectives.arc_number, outcome.draft.title, outcome.draft.body);
        record.score = outcome.report.overall;
        record.needs_review = outcome.needs_review;
        record.attempts = outcome.attempts.len() as u32;
        self.state.rewrites += outcome.rewrites;
        if outcome.needs_review {
            warn!(installment = n, score = record.score, "installment kept for review");
            self.state.flagged += 1;
        }

        // The accepted text is the one write that must succeed.
        self.store
            .save_installment(&self.config.story_id, &record)
            .await
            .map_err(|source| RunError::Persist { number: n, source })?;

        self.post_process(story, &mut record).await;

        story.planner.mark_twists(&objectives);
        if !objectives.foreshadow.is_empty() || objectives.reveal.is_some() {
            self.optional("twists", self.store.save_twists(&self.config.story_id, story.planner.twists()).await);
        }

        info!(
            story = %self.config.story_id,
            installment = n,
            arc = record.arc_number,
            title = %record.title,
            words = record.word_count(),
            score = record.score,
            attempts = record.attempts,
            "installment written"
        );
        Ok(record)
    }

    /// Recent installments for context, from memory or the store.
    async fn recent_installments(&self, story: &StoryState, n: u32) -> Result<Vec<InstallmentRecord>, LayerError> {
        let previous = n.saturating_sub(1);
        let held: Vec<InstallmentRecord> = story.memory.recent().cloned().collect();
        if previous == 0 || held.last().map(|r| r.number) == Some(previous) {
            return Ok(held);
        }
        let window = story.memory.config().recent_window as u32;
        let first = previous.saturating_sub(window.saturating_sub(1)).max(1);
        self.store
            .load_installments(&self.config.story_id, first, previous)
            .await
            .map_err(|e| LayerError(e.to_string()))
    }

    /// Facts, beats and a summary for an accepted installment. Failures here
    /// only cost enrichment, never the installment.
    async fn post_process(&self, story: &mut StoryState, record: &mut InstallmentRecord) {
        let story_id = &self.config.story_id;
        let settings = &self.config.generation;
        let generator = self.generator.as_ref();
        let n = record.number;

        let view: &InstallmentRecord = record;
        let (facts, beats, summary) = tokio::join!(
            post::extract_facts(generator, settings, view),
            post::detect_beats(generator, settings, view),
            post::summarize(generator, settings, view),
        );

        match facts {
            Ok(facts) => {
                let mut changed = Vec::new();
                let mut escalated = 0;
                for fact in facts {
                    let (subject, predicate) = (fact.subject.clone(), fact.predicate.clone());
                    match story.canon.register_fact(fact) {
                        Registration::Inserted(_) | Registration::Upgraded { .. } | Registration::Replaced { .. } => {
                            if let Some(active) = story.canon.get(&subject, &predicate) {
                                changed.push(active.clone());
                            }
                        }
                        Registration::Escalated(issue) => {
                            warn!(installment = n, %subject, %predicate, issue = ?issue, "continuity conflict queued for review");
                            escalated += 1;
                        }
                        Registration::Rejected { reason } => {
                            debug!(installment = n, %subject, %predicate, %reason, "fact rejected");
                        }
                        Registration::Unchanged(_) | Registration::Discarded { .. } => {}
                    }
                }
                if !changed.is_empty() {
                    self.optional("facts", self.store.save_facts(story_id, &changed).await);
                }
                if escalated > 0 {
                    self.optional("issues", self.store.save_issues(story_id, story.canon.issues()).await);
                }
            }
            Err(e) => warn!(installment = n, error = %e, "fact extraction failed"),
        }

        match beats {
            Ok(beats) => {
                for &beat in &beats {
                    if !story.ledger.can_use(beat, n) {
                        warn!(installment = n, beat = beat.name(), "beat repeated inside its cooldown");
                    }
                    story.ledger.record_use(beat, n);
                }
                record.beats = beats;
            }
            Err(e) => warn!(installment = n, error = %e, "beat detection failed"),
        }

        record.summary = match summary {
            Ok(summary) => summary,
            Err(e) => {
                warn!(installment = n, error = %e, "summary failed, using the opening");
                post::fallback_summary(record)
            }
        };
        story.memory.record_installment(record.clone());
        self.optional("installment summary", self.store.save_installment(story_id, record).await);
    }

    // ========================================================================
    // Arc boundaries
    // ========================================================================

    async fn finish_arc(
        &mut self,
        story: &mut StoryState,
        arc_number: u32,
        written: u32,
        tally: &mut Tally,
    ) -> Result<(), RunError> {
        if written == 0 {
            if let Some(arc) = story.planner.arc_mut(arc_number) {
                arc.status = ArcStatus::Failed;
            }
            if let Some(arc) = story.planner.arc(arc_number) {
                self.optional("arc", self.store.save_arc(&self.config.story_id, arc).await);
            }
            self.save_snapshot(story).await;
            return Err(RunError::ArcFailed(arc_number));
        }

        self.update_synopsis(story, arc_number).await;
        if story.memory.bible_refresh_due(arc_number) {
            self.refresh_bible(story).await;
        }

        let Some(arc) = story.planner.arc_mut(arc_number) else {
            return Ok(());
        };
        arc.status = ArcStatus::Completed;
        let arc = arc.clone();
        self.optional("arc", self.store.save_arc(&self.config.story_id, &arc).await);
        tally.arcs_completed += 1;
        info!(story = %self.config.story_id, arc = arc_number, installments = written, "arc completed");
        self.events.on_arc(&arc);
        Ok(())
    }

    async fn update_synopsis(&self, story: &mut StoryState, arc_number: u32) {
        let through = story.progress;
        let max_chars = story.memory.config().max_synopsis_chars;
        let previous = story.memory.synopsis().clone();
        let summaries = story.memory.summaries_between(previous.through_installment + 1, through);

        let mut user = if previous.is_empty() {
            "There is no synopsis yet; this is the first arc.\n".to_string()
        } else {
            previous.to_prompt()
        };
        user.push_str("\nSummaries of the installments since:\n");
        for (number, summary) in &summaries {
            user.push_str(&format!("[{number}] {summary}\n"));
        }
        user.push_str(&format!("\nKeep the synopsis under {max_chars} characters."));

        let settings = &self.config.generation;
        let request = GenerationRequest::new(Purpose::SynopsisUpdate, prompts::SYNOPSIS_UPDATE, user)
            .with_max_output_tokens(settings.auxiliary_max_tokens)
            .with_temperature(settings.analytic_temperature);
        let updated = match self.generator.invoke(request).await {
            Ok(raw) => RollingSynopsis::from_model_output(&raw, through, arc_number, max_chars),
            Err(e) => {
                warn!(arc = arc_number, error = %e, "synopsis update failed");
                None
            }
        };
        let synopsis = updated.unwrap_or_else(|| {
            warn!(arc = arc_number, "using fallback synopsis");
            RollingSynopsis::fallback(&previous, &summaries, through, arc_number, max_chars)
        });

        story.memory.replace_synopsis(synopsis);
        self.optional(
            "synopsis",
            self.store.save_synopsis(&self.config.story_id, story.memory.synopsis()).await,
        );
    }

    async fn refresh_bible(&self, story: &mut StoryState) {
        let Some(bible) = story.memory.bible().cloned() else {
            return;
        };
        let mut user = format!(
            "Current bible (version {}):\n{}\n\n{}\nRecent installments:\n",
            bible.version,
            bible.text,
            story.memory.synopsis().to_prompt()
        );
        for record in story.memory.recent() {
            let line = if record.summary.is_empty() { &record.title } else { &record.summary };
            user.push_str(&format!("[{}] {line}\n", record.number));
        }

        let settings = &self.config.generation;
        let request = GenerationRequest::new(Purpose::BibleRefresh, prompts::BIBLE_REFRESH, user)
            .with_max_output_tokens(settings.installment_max_tokens)
            .with_temperature(settings.analytic_temperature);
        match self.generator.invoke(request).await {
            Ok(text) if !text.trim().is_empty() => {
                story.memory.refresh_bible(text.trim(), story.progress);
                info!(story = %self.config.story_id, through = story.progress, "bible refreshed");
                self.save_header(story).await;
            }
            Ok(_) => warn!(story = %self.config.story_id, "bible refresh was empty, keeping the old bible"),
            Err(e) => warn!(story = %self.config.story_id, error = %e, "bible refresh failed, keeping the old bible"),
        }
    }
}
