//! Synchronized entity model.
//!
//! # Responsibility
//! - Define the canonical records exchanged between the local store and the
//!   remote record store.
//! - Provide identity and clock accessors used by the merge engine.
//!
//! # Invariants
//! - `id` is stable and never reused for another entity.
//! - `last_modified` is Unix epoch milliseconds and is the merge clock for
//!   every kind except `JournalEntry`, which merges on `updated_at`.
//! - Subtask `is_completed` is derived from completion records after merge.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Stable identifier for every synchronized entity.
pub type EntityId = Uuid;

/// Calendar day key in `YYYY-MM-DD` form.
pub type DayKey = String;

/// Entity collections the engine keeps in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Task,
    Category,
    Reward,
    PointsHistory,
    TrackingSession,
    JournalEntry,
    JournalAttachment,
}

impl EntityKind {
    /// All kinds in apply order. Categories come first so tasks referencing a
    /// freshly synced category find it locally.
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Category,
        EntityKind::Task,
        EntityKind::Reward,
        EntityKind::PointsHistory,
        EntityKind::TrackingSession,
        EntityKind::JournalAttachment,
        EntityKind::JournalEntry,
    ];

    /// Stable storage/wire label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Category => "category",
            Self::Reward => "reward",
            Self::PointsHistory => "points_history",
            Self::TrackingSession => "tracking_session",
            Self::JournalEntry => "journal_entry",
            Self::JournalAttachment => "journal_attachment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One day's completion of a task.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub completed_at: i64,
    #[serde(default)]
    pub completed_subtasks: BTreeSet<Uuid>,
    #[serde(default)]
    pub points_awarded: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: Uuid,
    pub title: String,
    /// Derived from `Task::completions`; recomputed after every merge.
    #[serde(default)]
    pub is_completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: EntityId,
    pub title: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub category_id: Option<EntityId>,
    /// Higher value means more important.
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub points: i64,
    #[serde(default)]
    pub due_at: Option<i64>,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    #[serde(default)]
    pub completions: BTreeMap<DayKey, CompletionRecord>,
    #[serde(default)]
    pub completion_dates: BTreeSet<i64>,
    pub last_modified: i64,
}

impl Task {
    pub fn new(title: impl Into<String>, last_modified: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            notes: String::new(),
            category_id: None,
            priority: 0,
            points: 0,
            due_at: None,
            subtasks: Vec::new(),
            completions: BTreeMap::new(),
            completion_dates: BTreeSet::new(),
            last_modified,
        }
    }

    /// Recomputes subtask completion flags from completion records.
    ///
    /// A subtask is completed when any day's record lists it.
    pub fn recompute_subtask_flags(&mut self) {
        let completed: BTreeSet<Uuid> = self
            .completions
            .values()
            .flat_map(|record| record.completed_subtasks.iter().copied())
            .collect();
        for subtask in &mut self.subtasks {
            subtask.is_completed = completed.contains(&subtask.id);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub sort_order: i32,
    pub last_modified: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reward {
    pub id: EntityId,
    pub title: String,
    #[serde(default)]
    pub cost: i64,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub redemption_dates: BTreeSet<i64>,
    pub last_modified: i64,
}

/// Points earned on one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsHistoryEntry {
    pub id: EntityId,
    pub day: DayKey,
    pub points: i64,
    pub last_modified: i64,
}

/// Time tracked against a task. Immutable once `ended_at` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingSession {
    pub id: EntityId,
    #[serde(default)]
    pub task_id: Option<EntityId>,
    pub started_at: i64,
    #[serde(default)]
    pub ended_at: Option<i64>,
    #[serde(default)]
    pub duration_ms: i64,
    pub last_modified: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Photo,
    VoiceMemo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalAttachment {
    pub id: EntityId,
    pub entry_id: EntityId,
    pub kind: AttachmentKind,
    /// Opaque asset reference owned by the host application.
    pub asset_ref: String,
    pub created_at: i64,
    pub last_modified: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: EntityId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub mood: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub photos: Vec<JournalAttachment>,
    #[serde(default)]
    pub voice_memos: Vec<JournalAttachment>,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_modified: i64,
}

impl JournalEntry {
    /// Whether the entry carries no user content yet.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
            && self.title.trim().is_empty()
            && self.mood.as_deref().map_or(true, |mood| mood.trim().is_empty())
            && self.tags.is_empty()
            && self.photos.is_empty()
            && self.voice_memos.is_empty()
    }
}

/// Any synchronized record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Entity {
    Task(Task),
    Category(Category),
    Reward(Reward),
    PointsHistory(PointsHistoryEntry),
    TrackingSession(TrackingSession),
    JournalEntry(JournalEntry),
    JournalAttachment(JournalAttachment),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Task(_) => EntityKind::Task,
            Self::Category(_) => EntityKind::Category,
            Self::Reward(_) => EntityKind::Reward,
            Self::PointsHistory(_) => EntityKind::PointsHistory,
            Self::TrackingSession(_) => EntityKind::TrackingSession,
            Self::JournalEntry(_) => EntityKind::JournalEntry,
            Self::JournalAttachment(_) => EntityKind::JournalAttachment,
        }
    }

    pub fn id(&self) -> EntityId {
        match self {
            Self::Task(task) => task.id,
            Self::Category(category) => category.id,
            Self::Reward(reward) => reward.id,
            Self::PointsHistory(entry) => entry.id,
            Self::TrackingSession(session) => session.id,
            Self::JournalEntry(entry) => entry.id,
            Self::JournalAttachment(attachment) => attachment.id,
        }
    }

    pub fn last_modified(&self) -> i64 {
        match self {
            Self::Task(task) => task.last_modified,
            Self::Category(category) => category.last_modified,
            Self::Reward(reward) => reward.last_modified,
            Self::PointsHistory(entry) => entry.last_modified,
            Self::TrackingSession(session) => session.last_modified,
            Self::JournalEntry(entry) => entry.last_modified,
            Self::JournalAttachment(attachment) => attachment.last_modified,
        }
    }
}
