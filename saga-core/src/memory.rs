//! Hierarchical narrative memory.
//!
//! Three tiers of recall, from coarsest to finest:
//! - the global bible, written once at planning time and periodically
//!   refreshed by folding in recent developments
//! - the rolling synopsis, replaced (never appended) at each arc boundary
//! - a sliding window of recent installments in full text
//!
//! Plus bounded lists of prior titles, opening lines and closing lines for
//! anti-repetition.

use crate::beats::BeatType;
use crate::generation::repair;
use crate::text;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Memory sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Installments kept in full text.
    pub recent_window: usize,
    /// Entries kept in each anti-repetition list.
    pub anti_repetition_window: usize,
    /// Upper bound on the synopsis text.
    pub max_synopsis_chars: usize,
    /// Refresh the bible every N arcs. 0 disables refresh.
    pub bible_refresh_interval: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            recent_window: 5,
            anti_repetition_window: 40,
            max_synopsis_chars: 6000,
            bible_refresh_interval: 3,
        }
    }
}

/// Static world and character reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalBible {
    pub text: String,
    pub version: u32,
    /// Last installment folded into the bible.
    pub refreshed_through: u32,
}

/// Compressed summary of the whole story so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollingSynopsis {
    pub text: String,
    #[serde(default)]
    pub protagonist_state: String,
    #[serde(default)]
    pub allies: Vec<String>,
    #[serde(default)]
    pub enemies: Vec<String>,
    #[serde(default)]
    pub open_threads: Vec<String>,
    /// Last installment covered.
    #[serde(default)]
    pub through_installment: u32,
    /// Arc the synopsis was last replaced at.
    #[serde(default)]
    pub arc_number: u32,
}

/// Shape of a synopsis update as the model writes it.
#[derive(Debug, Deserialize)]
struct SynopsisOutput {
    #[serde(alias = "text")]
    synopsis: String,
    #[serde(default)]
    protagonist_state: String,
    #[serde(default)]
    allies: Vec<String>,
    #[serde(default)]
    enemies: Vec<String>,
    #[serde(default)]
    open_threads: Vec<String>,
}

impl RollingSynopsis {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Parse a model-written synopsis update, bounded to `max_chars`.
    pub fn from_model_output(raw: &str, through: u32, arc_number: u32, max_chars: usize) -> Option<Self> {
        let output: SynopsisOutput = repair::parse_structured(raw)?;
        if output.synopsis.trim().is_empty() {
            return None;
        }
        Some(Self {
            text: text::truncate_chars(output.synopsis.trim(), max_chars),
            protagonist_state: output.protagonist_state,
            allies: output.allies,
            enemies: output.enemies,
            open_threads: output.open_threads,
            through_installment: through,
            arc_number,
        })
    }

    /// Deterministic replacement used when the model update fails: the
    /// newest summaries are kept whole, the old synopsis fills what is left.
    pub fn fallback(
        previous: &RollingSynopsis,
        summaries: &[(u32, String)],
        through: u32,
        arc_number: u32,
        max_chars: usize,
    ) -> Self {
        let mut recent = Vec::new();
        let mut used = 0;
        for (number, summary) in summaries.iter().rev() {
            let line = format!("[{number}] {summary}");
            let cost = line.chars().count() + 1;
            if used + cost > max_chars {
                break;
            }
            used += cost;
            recent.push(line);
        }
        recent.reverse();

        let remaining = max_chars.saturating_sub(used);
        let mut text = String::new();
        if remaining > 16 && !previous.is_empty() {
            text.push_str(&text::truncate_chars(previous.text.trim(), remaining - 1));
            text.push('\n');
        }
        text.push_str(&recent.join("\n"));

        Self {
            text: text::truncate_chars(text.trim(), max_chars),
            through_installment: through,
            arc_number,
            ..previous.clone()
        }
    }

    pub fn to_prompt(&self) -> String {
        let mut out = format!("Story so far (through installment {}):\n{}\n", self.through_installment, self.text);
        if !self.protagonist_state.is_empty() {
            out.push_str(&format!("Protagonist: {}\n", self.protagonist_state));
        }
        if !self.allies.is_empty() {
            out.push_str(&format!("Allies: {}\n", self.allies.join(", ")));
        }
        if !self.enemies.is_empty() {
            out.push_str(&format!("Enemies: {}\n", self.enemies.join(", ")));
        }
        if !self.open_threads.is_empty() {
            out.push_str("Open threads:\n");
            for thread in &self.open_threads {
                out.push_str(&format!("- {thread}\n"));
            }
        }
        out
    }
}

/// An accepted installment as memory keeps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallmentRecord {
    pub number: u32,
    pub arc_number: u32,
    pub title: String,
    pub text: String,
    pub summary: String,
    pub opening_line: String,
    pub closing_line: String,
    pub score: u8,
    pub needs_review: bool,
    pub attempts: u32,
    pub written_at: DateTime<Utc>,
    /// Beats detected in the text; replayed into the ledger on reconstruction.
    #[serde(default)]
    pub beats: Vec<BeatType>,
}

impl InstallmentRecord {
    /// Build a record, deriving opening and closing lines from the text.
    pub fn new(number: u32, arc_number: u32, title: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        let opening_line = text::first_sentence(&text).unwrap_or_default().to_string();
        let closing_line = text::last_sentence(&text).unwrap_or_default().to_string();
        Self {
            number,
            arc_number,
            title: title.into(),
            text,
            summary: String::new(),
            opening_line,
            closing_line,
            score: 0,
            needs_review: false,
            attempts: 1,
            written_at: Utc::now(),
            beats: Vec::new(),
        }
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

/// Narrative memory for one story.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NarrativeMemory {
    config: MemoryConfig,
    bible: Option<GlobalBible>,
    synopsis: RollingSynopsis,
    recent: VecDeque<InstallmentRecord>,
    /// Summaries not yet folded into the synopsis.
    pending_summaries: BTreeMap<u32, String>,
    titles: VecDeque<String>,
    openings: VecDeque<String>,
    closings: VecDeque<String>,
}

impl NarrativeMemory {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn bible(&self) -> Option<&GlobalBible> {
        self.bible.as_ref()
    }

    /// Install the planning-time bible.
    pub fn set_bible(&mut self, text: impl Into<String>) {
        self.bible = Some(GlobalBible {
            text: text.into(),
            version: 1,
            refreshed_through: 0,
        });
    }

    /// Put back a bible read from storage.
    pub fn restore_bible(&mut self, bible: GlobalBible) {
        self.bible = Some(bible);
    }

    /// Replace the bible text with a refreshed version.
    pub fn refresh_bible(&mut self, text: impl Into<String>, through: u32) {
        let version = self.bible.as_ref().map_or(0, |b| b.version) + 1;
        self.bible = Some(GlobalBible {
            text: text.into(),
            version,
            refreshed_through: through,
        });
    }

    /// Whether the bible is due a refresh after finishing `arc_number`.
    pub fn bible_refresh_due(&self, arc_number: u32) -> bool {
        let interval = self.config.bible_refresh_interval;
        self.bible.is_some() && interval > 0 && arc_number > 0 && arc_number % interval == 0
    }

    pub fn synopsis(&self) -> &RollingSynopsis {
        &self.synopsis
    }

    /// Replace the synopsis and drop the summaries it now covers.
    pub fn replace_synopsis(&mut self, synopsis: RollingSynopsis) {
        let through = synopsis.through_installment;
        self.pending_summaries.retain(|number, _| *number > through);
        self.synopsis = synopsis;
    }

    /// Summaries for installments in `start..=end` not yet in the synopsis.
    pub fn summaries_between(&self, start: u32, end: u32) -> Vec<(u32, String)> {
        self.pending_summaries
            .range(start..=end)
            .map(|(n, s)| (*n, s.clone()))
            .collect()
    }

    /// Remember an accepted installment.
    pub fn record_installment(&mut self, record: InstallmentRecord) {
        let window = self.config.anti_repetition_window;
        push_bounded(&mut self.titles, record.title.clone(), window);
        push_bounded(&mut self.openings, record.opening_line.clone(), window);
        push_bounded(&mut self.closings, record.closing_line.clone(), window);

        self.pending_summaries.insert(record.number, record.summary.clone());
        self.recent.retain(|r| r.number != record.number);
        self.recent.push_back(record);
        while self.recent.len() > self.config.recent_window.max(1) {
            self.recent.pop_front();
        }
    }

    /// Update the summary of an already recorded installment.
    pub fn set_summary(&mut self, number: u32, summary: impl Into<String>) {
        let summary = summary.into();
        if let Some(record) = self.recent.iter_mut().find(|r| r.number == number) {
            record.summary = summary.clone();
        }
        if number > self.synopsis.through_installment {
            self.pending_summaries.insert(number, summary);
        }
    }

    /// Recent installments, oldest first.
    pub fn recent(&self) -> impl DoubleEndedIterator<Item = &InstallmentRecord> {
        self.recent.iter()
    }

    pub fn last_installment(&self) -> Option<&InstallmentRecord> {
        self.recent.back()
    }

    pub fn prior_titles(&self) -> impl DoubleEndedIterator<Item = &str> {
        self.titles.iter().map(String::as_str)
    }

    pub fn prior_openings(&self) -> impl DoubleEndedIterator<Item = &str> {
        self.openings.iter().map(String::as_str)
    }

    pub fn prior_closings(&self) -> impl DoubleEndedIterator<Item = &str> {
        self.closings.iter().map(String::as_str)
    }
}

fn push_bounded(list: &mut VecDeque<String>, value: String, max: usize) {
    if value.trim().is_empty() {
        return;
    }
    list.push_back(value);
    while list.len() > max {
        list.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: u32, title: &str) -> InstallmentRecord {
        let mut record = InstallmentRecord::new(
            n,
            1,
            title,
            format!("Installment {n} opens here. Things happen. It ends on a cliff {n}!"),
        );
        record.summary = format!("summary {n}");
        record
    }

    #[test]
    fn test_record_derives_lines() {
        let r = record(3, "The Gate");
        assert_eq!(r.opening_line, "Installment 3 opens here.");
        assert_eq!(r.closing_line, "It ends on a cliff 3!");
    }

    #[test]
    fn test_recent_window_is_bounded() {
        let mut memory = NarrativeMemory::new(MemoryConfig {
            recent_window: 2,
            anti_repetition_window: 3,
            ..MemoryConfig::default()
        });
        for n in 1..=5 {
            memory.record_installment(record(n, &format!("Title {n}")));
        }
        let recent: Vec<u32> = memory.recent().map(|r| r.number).collect();
        assert_eq!(recent, vec![4, 5]);
        let titles: Vec<&str> = memory.prior_titles().collect();
        assert_eq!(titles, vec!["Title 3", "Title 4", "Title 5"]);
        assert_eq!(memory.last_installment().unwrap().number, 5);
    }

    #[test]
    fn test_replace_synopsis_consumes_summaries() {
        let mut memory = NarrativeMemory::default();
        for n in 1..=12 {
            memory.record_installment(record(n, "t"));
        }
        assert_eq!(memory.summaries_between(1, 10).len(), 10);

        memory.replace_synopsis(RollingSynopsis {
            text: "Arc one happened.".into(),
            through_installment: 10,
            arc_number: 1,
            ..RollingSynopsis::default()
        });
        assert!(memory.summaries_between(1, 10).is_empty());
        assert_eq!(memory.summaries_between(1, 20).len(), 2);
        assert_eq!(memory.synopsis().text, "Arc one happened.");
    }

    #[test]
    fn test_synopsis_from_model_output() {
        let raw = r#"{"synopsis": "Kael left Ashford.", "allies": ["Ren"], "open_threads": ["the missing key"]}"#;
        let synopsis = RollingSynopsis::from_model_output(raw, 10, 1, 100).unwrap();
        assert_eq!(synopsis.allies, vec!["Ren".to_string()]);
        assert_eq!(synopsis.through_installment, 10);
        assert!(synopsis.to_prompt().contains("the missing key"));

        assert!(RollingSynopsis::from_model_output("{\"synopsis\": \"\"}", 10, 1, 100).is_none());
        assert!(RollingSynopsis::from_model_output("nope", 10, 1, 100).is_none());
    }

    #[test]
    fn test_fallback_is_bounded_and_keeps_newest() {
        let previous = RollingSynopsis {
            text: "x".repeat(500),
            allies: vec!["Ren".into()],
            ..RollingSynopsis::default()
        };
        let summaries: Vec<(u32, String)> = (11..=20).map(|n| (n, format!("event {n}"))).collect();
        let synopsis = RollingSynopsis::fallback(&previous, &summaries, 20, 2, 120);

        assert!(synopsis.text.chars().count() <= 120);
        assert!(synopsis.text.contains("[20] event 20"));
        assert_eq!(synopsis.allies, vec!["Ren".to_string()]);
        assert_eq!(synopsis.through_installment, 20);
    }

    #[test]
    fn test_bible_refresh_schedule() {
        let mut memory = NarrativeMemory::default();
        assert!(!memory.bible_refresh_due(3));
        memory.set_bible("The world.");
        assert!(memory.bible_refresh_due(3));
        assert!(!memory.bible_refresh_due(2));
        memory.refresh_bible("The world, updated.", 30);
        let bible = memory.bible().unwrap();
        assert_eq!(bible.version, 2);
        assert_eq!(bible.refreshed_through, 30);
    }
}
