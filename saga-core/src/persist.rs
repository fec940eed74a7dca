//! Durable story storage.
//!
//! Every write is an upsert under a natural key (story + installment number,
//! story + subject + predicate, story + arc number, ...), so a retried write
//! never duplicates anything.
//!
//! Two implementations:
//! - [`MemoryStore`] for tests and embedding
//! - [`JsonFileStore`], one directory per story:
//!
//! ```text
//! <root>/<story>/
//!     installments/00001.json
//!     story.json  facts.json  issues.json  arcs.json  twists.json
//!     synopsis.json  snapshot.json
//! ```

use crate::beats::BeatLedger;
use crate::canon::{CanonStore, ConstraintSet, ContinuityIssue, Fact};
use crate::memory::{GlobalBible, InstallmentRecord, NarrativeMemory, RollingSynopsis};
use crate::planning::{ArcPlanner, StoryArc, Twist};
use crate::runner::RunnerState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Invalid story id: {0:?}")]
    InvalidStoryId(String),
}

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything needed to resume a story without re-planning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorySnapshot {
    /// Format version for compatibility checking.
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    /// Last installment written when the snapshot was taken.
    pub progress: u32,
    #[serde(default)]
    pub title: Option<String>,
    pub state: RunnerState,
    pub memory: NarrativeMemory,
    pub canon: CanonStore,
    #[serde(default)]
    pub constraints: ConstraintSet,
    #[serde(default)]
    pub ledger: BeatLedger,
    pub planner: ArcPlanner,
}

/// Planning output that never changes per installment: written once after
/// planning and again when the bible is refreshed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoryHeader {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub bible: Option<GlobalBible>,
    #[serde(default)]
    pub constraints: ConstraintSet,
}

/// Keyed, idempotent storage for one or more stories.
#[async_trait]
pub trait StoryStore: Send + Sync {
    /// Upsert by story.
    async fn save_header(&self, story: &str, header: &StoryHeader) -> Result<(), StoreError>;

    async fn load_header(&self, story: &str) -> Result<Option<StoryHeader>, StoreError>;

    /// Upsert by (story, installment number).
    async fn save_installment(&self, story: &str, record: &InstallmentRecord) -> Result<(), StoreError>;

    async fn load_installment(&self, story: &str, number: u32) -> Result<Option<InstallmentRecord>, StoreError>;

    /// Installments in `start..=end` that exist, in order.
    async fn load_installments(&self, story: &str, start: u32, end: u32)
        -> Result<Vec<InstallmentRecord>, StoreError>;

    /// Highest installment number stored.
    async fn latest_installment(&self, story: &str) -> Result<Option<u32>, StoreError>;

    /// Upsert by (story, subject, predicate).
    async fn save_facts(&self, story: &str, facts: &[Fact]) -> Result<(), StoreError>;

    async fn load_facts(&self, story: &str) -> Result<Vec<Fact>, StoreError>;

    /// Upsert by issue id.
    async fn save_issues(&self, story: &str, issues: &[ContinuityIssue]) -> Result<(), StoreError>;

    async fn load_issues(&self, story: &str) -> Result<Vec<ContinuityIssue>, StoreError>;

    /// Upsert by (story, arc number).
    async fn save_arc(&self, story: &str, arc: &StoryArc) -> Result<(), StoreError>;

    async fn load_arcs(&self, story: &str) -> Result<Vec<StoryArc>, StoreError>;

    /// Upsert by twist id.
    async fn save_twists(&self, story: &str, twists: &[Twist]) -> Result<(), StoreError>;

    async fn load_twists(&self, story: &str) -> Result<Vec<Twist>, StoreError>;

    async fn save_synopsis(&self, story: &str, synopsis: &RollingSynopsis) -> Result<(), StoreError>;

    async fn load_synopsis(&self, story: &str) -> Result<Option<RollingSynopsis>, StoreError>;

    async fn save_snapshot(&self, story: &str, snapshot: &StorySnapshot) -> Result<(), StoreError>;

    /// The stored snapshot. A snapshot from another format version is an error.
    async fn load_snapshot(&self, story: &str) -> Result<Option<StorySnapshot>, StoreError>;
}

// =============================================================================
// In-memory store
// =============================================================================

#[derive(Debug, Default)]
struct StoryRecords {
    header: Option<StoryHeader>,
    installments: BTreeMap<u32, InstallmentRecord>,
    facts: BTreeMap<String, Fact>,
    issues: Vec<ContinuityIssue>,
    arcs: BTreeMap<u32, StoryArc>,
    twists: Vec<Twist>,
    synopsis: Option<RollingSynopsis>,
    snapshot: Option<StorySnapshot>,
}

/// Store that keeps everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    stories: RwLock<HashMap<String, StoryRecords>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn read<T>(&self, story: &str, f: impl FnOnce(&StoryRecords) -> T) -> T
    where
        T: Default,
    {
        self.stories.read().await.get(story).map(f).unwrap_or_default()
    }

    async fn write(&self, story: &str, f: impl FnOnce(&mut StoryRecords)) {
        let mut stories = self.stories.write().await;
        f(stories.entry(story.to_string()).or_default());
    }
}

#[async_trait]
impl StoryStore for MemoryStore {
    async fn save_header(&self, story: &str, header: &StoryHeader) -> Result<(), StoreError> {
        let header = header.clone();
        self.write(story, |s| s.header = Some(header)).await;
        Ok(())
    }

    async fn load_header(&self, story: &str) -> Result<Option<StoryHeader>, StoreError> {
        Ok(self.read(story, |s| s.header.clone()).await)
    }

    async fn save_installment(&self, story: &str, record: &InstallmentRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.write(story, |s| {
            s.installments.insert(record.number, record);
        })
        .await;
        Ok(())
    }

    async fn load_installment(&self, story: &str, number: u32) -> Result<Option<InstallmentRecord>, StoreError> {
        Ok(self.read(story, |s| s.installments.get(&number).cloned()).await)
    }

    async fn load_installments(
        &self,
        story: &str,
        start: u32,
        end: u32,
    ) -> Result<Vec<InstallmentRecord>, StoreError> {
        if start > end {
            return Ok(Vec::new());
        }
        Ok(self
            .read(story, |s| s.installments.range(start..=end).map(|(_, r)| r.clone()).collect())
            .await)
    }

    async fn latest_installment(&self, story: &str) -> Result<Option<u32>, StoreError> {
        Ok(self.read(story, |s| s.installments.keys().next_back().copied()).await)
    }

    async fn save_facts(&self, story: &str, facts: &[Fact]) -> Result<(), StoreError> {
        self.write(story, |s| {
            for fact in facts {
                s.facts.insert(fact.key(), fact.clone());
            }
        })
        .await;
        Ok(())
    }

    async fn load_facts(&self, story: &str) -> Result<Vec<Fact>, StoreError> {
        Ok(self.read(story, |s| s.facts.values().cloned().collect()).await)
    }

    async fn save_issues(&self, story: &str, issues: &[ContinuityIssue]) -> Result<(), StoreError> {
        self.write(story, |s| upsert_by(&mut s.issues, issues, |i| i.id)).await;
        Ok(())
    }

    async fn load_issues(&self, story: &str) -> Result<Vec<ContinuityIssue>, StoreError> {
        Ok(self.read(story, |s| s.issues.clone()).await)
    }

    async fn save_arc(&self, story: &str, arc: &StoryArc) -> Result<(), StoreError> {
        let arc = arc.clone();
        self.write(story, |s| {
            s.arcs.insert(arc.arc_number, arc);
        })
        .await;
        Ok(())
    }

    async fn load_arcs(&self, story: &str) -> Result<Vec<StoryArc>, StoreError> {
        Ok(self.read(story, |s| s.arcs.values().cloned().collect()).await)
    }

    async fn save_twists(&self, story: &str, twists: &[Twist]) -> Result<(), StoreError> {
        self.write(story, |s| upsert_by(&mut s.twists, twists, |t| t.id)).await;
        Ok(())
    }

    async fn load_twists(&self, story: &str) -> Result<Vec<Twist>, StoreError> {
        Ok(self.read(story, |s| s.twists.clone()).await)
    }

    async fn save_synopsis(&self, story: &str, synopsis: &RollingSynopsis) -> Result<(), StoreError> {
        let synopsis = synopsis.clone();
        self.write(story, |s| s.synopsis = Some(synopsis)).await;
        Ok(())
    }

    async fn load_synopsis(&self, story: &str) -> Result<Option<RollingSynopsis>, StoreError> {
        Ok(self.read(story, |s| s.synopsis.clone()).await)
    }

    async fn save_snapshot(&self, story: &str, snapshot: &StorySnapshot) -> Result<(), StoreError> {
        let snapshot = snapshot.clone();
        self.write(story, |s| s.snapshot = Some(snapshot)).await;
        Ok(())
    }

    async fn load_snapshot(&self, story: &str) -> Result<Option<StorySnapshot>, StoreError> {
        let snapshot = self.read(story, |s| s.snapshot.clone()).await;
        snapshot.map(check_version).transpose()
    }
}

// =============================================================================
// JSON file store
// =============================================================================

/// Store that writes one directory of JSON files per story.
#[derive(Debug)]
pub struct JsonFileStore {
    root: PathBuf,
    /// Serializes read-modify-write of collection files.
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn story_dir(&self, story: &str) -> Result<PathBuf, StoreError> {
        let valid = !story.is_empty()
            && story
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidStoryId(story.to_string()));
        }
        Ok(self.root.join(story))
    }

    fn installment_path(&self, story: &str, number: u32) -> Result<PathBuf, StoreError> {
        Ok(self.story_dir(story)?.join("installments").join(format!("{number:05}.json")))
    }

    fn file(&self, story: &str, name: &str) -> Result<PathBuf, StoreError> {
        Ok(self.story_dir(story)?.join(name))
    }

    async fn read_list<T: DeserializeOwned>(&self, story: &str, name: &str) -> Result<Vec<T>, StoreError> {
        Ok(read_json(&self.file(story, name)?).await?.unwrap_or_default())
    }

    async fn installment_numbers(&self, story: &str) -> Result<Vec<u32>, StoreError> {
        let dir = self.story_dir(story)?.join("installments");
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut numbers = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Some(number) = path.file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse().ok()) {
                    numbers.push(number);
                }
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }
}

#[async_trait]
impl StoryStore for JsonFileStore {
    async fn save_header(&self, story: &str, header: &StoryHeader) -> Result<(), StoreError> {
        write_json(&self.file(story, "story.json")?, header).await
    }

    async fn load_header(&self, story: &str) -> Result<Option<StoryHeader>, StoreError> {
        read_json(&self.file(story, "story.json")?).await
    }

    async fn save_installment(&self, story: &str, record: &InstallmentRecord) -> Result<(), StoreError> {
        write_json(&self.installment_path(story, record.number)?, record).await
    }

    async fn load_installment(&self, story: &str, number: u32) -> Result<Option<InstallmentRecord>, StoreError> {
        read_json(&self.installment_path(story, number)?).await
    }

    async fn load_installments(
        &self,
        story: &str,
        start: u32,
        end: u32,
    ) -> Result<Vec<InstallmentRecord>, StoreError> {
        let mut records = Vec::new();
        for number in self.installment_numbers(story).await? {
            if (start..=end).contains(&number) {
                if let Some(record) = self.load_installment(story, number).await? {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    async fn latest_installment(&self, story: &str) -> Result<Option<u32>, StoreError> {
        Ok(self.installment_numbers(story).await?.last().copied())
    }

    async fn save_facts(&self, story: &str, facts: &[Fact]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.file(story, "facts.json")?;
        let mut stored: BTreeMap<String, Fact> = read_json(&path).await?.unwrap_or_default();
        for fact in facts {
            stored.insert(fact.key(), fact.clone());
        }
        write_json(&path, &stored).await
    }

    async fn load_facts(&self, story: &str) -> Result<Vec<Fact>, StoreError> {
        let stored: BTreeMap<String, Fact> = read_json(&self.file(story, "facts.json")?).await?.unwrap_or_default();
        Ok(stored.into_values().collect())
    }

    async fn save_issues(&self, story: &str, issues: &[ContinuityIssue]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut stored: Vec<ContinuityIssue> = self.read_list(story, "issues.json").await?;
        upsert_by(&mut stored, issues, |i| i.id);
        write_json(&self.file(story, "issues.json")?, &stored).await
    }

    async fn load_issues(&self, story: &str) -> Result<Vec<ContinuityIssue>, StoreError> {
        self.read_list(story, "issues.json").await
    }

    async fn save_arc(&self, story: &str, arc: &StoryArc) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut stored: Vec<StoryArc> = self.read_list(story, "arcs.json").await?;
        upsert_by(&mut stored, std::slice::from_ref(arc), |a| a.arc_number);
        stored.sort_by_key(|a| a.arc_number);
        write_json(&self.file(story, "arcs.json")?, &stored).await
    }

    async fn load_arcs(&self, story: &str) -> Result<Vec<StoryArc>, StoreError> {
        self.read_list(story, "arcs.json").await
    }

    async fn save_twists(&self, story: &str, twists: &[Twist]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut stored: Vec<Twist> = self.read_list(story, "twists.json").await?;
        upsert_by(&mut stored, twists, |t| t.id);
        write_json(&self.file(story, "twists.json")?, &stored).await
    }

    async fn load_twists(&self, story: &str) -> Result<Vec<Twist>, StoreError> {
        self.read_list(story, "twists.json").await
    }

    async fn save_synopsis(&self, story: &str, synopsis: &RollingSynopsis) -> Result<(), StoreError> {
        write_json(&self.file(story, "synopsis.json")?, synopsis).await
    }

    async fn load_synopsis(&self, story: &str) -> Result<Option<RollingSynopsis>, StoreError> {
        read_json(&self.file(story, "synopsis.json")?).await
    }

    async fn save_snapshot(&self, story: &str, snapshot: &StorySnapshot) -> Result<(), StoreError> {
        write_json(&self.file(story, "snapshot.json")?, snapshot).await
    }

    async fn load_snapshot(&self, story: &str) -> Result<Option<StorySnapshot>, StoreError> {
        let path = self.file(story, "snapshot.json")?;
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // Check the version before parsing the rest so an old layout reports
        // a mismatch rather than a parse error.
        #[derive(Deserialize)]
        struct Partial {
            version: u32,
        }
        let partial: Partial = serde_json::from_str(&content)?;
        if partial.version != SNAPSHOT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: SNAPSHOT_VERSION,
                found: partial.version,
            });
        }
        Ok(Some(serde_json::from_str(&content)?))
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn check_version(snapshot: StorySnapshot) -> Result<StorySnapshot, StoreError> {
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(StoreError::VersionMismatch {
            expected: SNAPSHOT_VERSION,
            found: snapshot.version,
        });
    }
    Ok(snapshot)
}

fn upsert_by<T: Clone, K: PartialEq>(stored: &mut Vec<T>, items: &[T], key: impl Fn(&T) -> K) {
    for item in items {
        match stored.iter_mut().find(|existing| key(existing) == key(item)) {
            Some(existing) => *existing = item.clone(),
            None => stored.push(item.clone()),
        }
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write through a temp file and rename, so a crash never leaves a torn file.
async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let content = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canon::AuthorityLevel;
    use crate::planning::{ArcPlannerConfig, ArcShape};
    use tempfile::TempDir;

    fn record(number: u32) -> InstallmentRecord {
        InstallmentRecord::new(number, 1, format!("Title {number}"), format!("Text of installment {number}."))
    }

    fn snapshot(progress: u32) -> StorySnapshot {
        StorySnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            progress,
            title: Some("The Long Road".into()),
            state: RunnerState::default(),
            memory: NarrativeMemory::default(),
            canon: CanonStore::new(),
            constraints: ConstraintSet::default(),
            ledger: BeatLedger::new(),
            planner: ArcPlanner::new(ArcPlannerConfig::default()),
        }
    }

    async fn exercise(store: &dyn StoryStore) {
        for n in [3, 1, 2] {
            store.save_installment("saga", &record(n)).await.unwrap();
        }
        // Retried write does not duplicate.
        store.save_installment("saga", &record(2)).await.unwrap();
        assert_eq!(store.latest_installment("saga").await.unwrap(), Some(3));
        let numbers: Vec<u32> = store
            .load_installments("saga", 2, 10)
            .await
            .unwrap()
            .iter()
            .map(|r| r.number)
            .collect();
        assert_eq!(numbers, vec![2, 3]);
        assert!(store.load_installment("saga", 9).await.unwrap().is_none());
        assert_eq!(store.latest_installment("other").await.unwrap(), None);

        let first = Fact::new("Kael", "location", "Ashford", AuthorityLevel::Narrated);
        let second = Fact::new("kael", "Location", "the coast", AuthorityLevel::Narrated);
        store.save_facts("saga", &[first]).await.unwrap();
        store.save_facts("saga", &[second]).await.unwrap();
        let facts = store.load_facts("saga").await.unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].value.to_string(), "the coast");

        let arc = StoryArc::new(1, 1, 10, &ArcShape::default(), "first steps");
        store.save_arc("saga", &arc).await.unwrap();
        store.save_arc("saga", &arc).await.unwrap();
        assert_eq!(store.load_arcs("saga").await.unwrap().len(), 1);

        assert!(store.load_header("saga").await.unwrap().is_none());
        let header = StoryHeader {
            title: Some("The Long Road".into()),
            ..StoryHeader::default()
        };
        store.save_header("saga", &header).await.unwrap();
        assert_eq!(store.load_header("saga").await.unwrap(), Some(header));

        assert!(store.load_snapshot("saga").await.unwrap().is_none());
        store.save_snapshot("saga", &snapshot(3)).await.unwrap();
        let loaded = store.load_snapshot("saga").await.unwrap().unwrap();
        assert_eq!(loaded.progress, 3);
        assert_eq!(loaded.title.as_deref(), Some("The Long Road"));
    }

    #[tokio::test]
    async fn test_memory_store_upserts() {
        exercise(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_json_store_upserts() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        exercise(&store).await;
        assert!(dir.path().join("saga/installments/00002.json").exists());
        assert!(!dir.path().join("saga/snapshot.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_snapshot_version_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        let mut old = snapshot(1);
        old.version = SNAPSHOT_VERSION + 1;
        store.save_snapshot("saga", &old).await.unwrap();

        let err = store.load_snapshot("saga").await.unwrap_err();
        assert!(matches!(err, StoreError::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_rejects_path_like_story_ids() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        let err = store.save_installment("../escape", &record(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidStoryId(_)));
    }
}
