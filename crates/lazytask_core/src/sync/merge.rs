//! Merge engine.
//!
//! # Responsibility
//! - Decide the authoritative local state when a local and a remote copy of
//!   the same entity meet, per entity kind.
//!
//! # Invariants
//! - Every function here is pure: no I/O, no clock, no randomness.
//! - Union fields (task completions, completion dates, reward redemptions,
//!   journal tags/attachments) never lose an element present on either side.
//! - Completion and redemption unions are commutative.
//! - Merging a copy with itself yields `TakeLocal`.
//! - Journal merges do not depend on which side is local; ties fall back to
//!   comparing the values themselves.

use crate::config::{PointsMergePolicy, TaskTieBreak};
use crate::model::entity::{
    Category, CompletionRecord, DayKey, Entity, EntityId, JournalAttachment, JournalEntry,
    PointsHistoryEntry, Reward, Task, TrackingSession,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

/// Outcome of merging one local and one remote copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult<T> {
    TakeLocal,
    TakeRemote,
    Merged(T),
}

impl<T: Clone> MergeResult<T> {
    /// Materializes the winning value.
    pub fn into_value(self, local: &T, remote: &T) -> T {
        match self {
            Self::TakeLocal => local.clone(),
            Self::TakeRemote => remote.clone(),
            Self::Merged(value) => value,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> MergeResult<U> {
        match self {
            Self::TakeLocal => MergeResult::TakeLocal,
            Self::TakeRemote => MergeResult::TakeRemote,
            Self::Merged(value) => MergeResult::Merged(f(value)),
        }
    }
}

/// Policy knobs and side information for one merge.
#[derive(Debug, Clone, Copy)]
pub struct MergeContext<'a> {
    pub task_tie_break: TaskTieBreak,
    pub points_policy: PointsMergePolicy,
    pub journal_window_ms: i64,
    /// Tombstoned attachment ids, stripped from journal attachment unions.
    pub deleted_attachments: &'a BTreeSet<EntityId>,
}

/// Single-entity resolution against the ledger and delete signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Remove the entity locally (tombstoned or hard-deleted).
    Drop,
    /// Write this entity to the local store.
    Write(Entity),
    /// Local state is already authoritative.
    Unchanged,
}

/// Resolves `(local?, remote?, hard_delete, tombstoned)` into one local state.
pub fn resolve(
    local: Option<&Entity>,
    remote: Option<&Entity>,
    is_hard_delete: bool,
    is_tombstoned: bool,
    ctx: &MergeContext<'_>,
) -> Resolution {
    if is_tombstoned || is_hard_delete {
        return Resolution::Drop;
    }
    match (local, remote) {
        (_, None) => Resolution::Unchanged,
        (None, Some(remote)) => Resolution::Write(remote.clone()),
        (Some(local), Some(remote)) => match merge_entities(local, remote, ctx) {
            MergeResult::TakeLocal => Resolution::Unchanged,
            MergeResult::TakeRemote => Resolution::Write(remote.clone()),
            MergeResult::Merged(merged) => Resolution::Write(merged),
        },
    }
}

/// Dispatches to the kind-specific merge. Mismatched kinds keep local.
pub fn merge_entities(local: &Entity, remote: &Entity, ctx: &MergeContext<'_>) -> MergeResult<Entity> {
    if local == remote {
        return MergeResult::TakeLocal;
    }
    match (local, remote) {
        (Entity::Task(local), Entity::Task(remote)) => {
            merge_task(local, remote, ctx.task_tie_break).map(Entity::Task)
        }
        (Entity::Category(local), Entity::Category(remote)) => {
            merge_category(local, remote).map(Entity::Category)
        }
        (Entity::Reward(local), Entity::Reward(remote)) => {
            merge_reward(local, remote).map(Entity::Reward)
        }
        (Entity::PointsHistory(local), Entity::PointsHistory(remote)) => {
            merge_points(local, remote, ctx.points_policy).map(Entity::PointsHistory)
        }
        (Entity::TrackingSession(local), Entity::TrackingSession(remote)) => {
            merge_tracking_session(local, remote).map(Entity::TrackingSession)
        }
        (Entity::JournalEntry(local), Entity::JournalEntry(remote)) => merge_journal_entry(
            local,
            remote,
            ctx.journal_window_ms,
            ctx.deleted_attachments,
        )
        .map(Entity::JournalEntry),
        (Entity::JournalAttachment(local), Entity::JournalAttachment(remote)) => {
            merge_attachment(local, remote).map(Entity::JournalAttachment)
        }
        _ => MergeResult::TakeLocal,
    }
}

fn classify<T: PartialEq>(merged: T, local: &T, remote: &T) -> MergeResult<T> {
    if merged == *local {
        MergeResult::TakeLocal
    } else if merged == *remote {
        MergeResult::TakeRemote
    } else {
        MergeResult::Merged(merged)
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Newer task wins in whole; completions and completion dates are unioned.
///
/// On equal `last_modified` the copies are treated as concurrent and the
/// base is chosen by `tie_break`. Subtask flags are recomputed afterwards.
pub fn merge_task(local: &Task, remote: &Task, tie_break: TaskTieBreak) -> MergeResult<Task> {
    let base = match local.last_modified.cmp(&remote.last_modified) {
        Ordering::Greater => local,
        Ordering::Less => remote,
        Ordering::Equal => match tie_break {
            TaskTieBreak::PreferRemote => remote,
            TaskTieBreak::HigherPriority if local.priority > remote.priority => local,
            TaskTieBreak::HigherPriority => remote,
        },
    };

    let mut merged = base.clone();
    merged.completions = union_completions(&local.completions, &remote.completions);
    merged.completion_dates = local
        .completion_dates
        .union(&remote.completion_dates)
        .copied()
        .collect();
    merged.recompute_subtask_flags();
    classify(merged, local, remote)
}

/// Key-by-key union. A day present on both sides merges its two records.
pub fn union_completions(
    local: &BTreeMap<DayKey, CompletionRecord>,
    remote: &BTreeMap<DayKey, CompletionRecord>,
) -> BTreeMap<DayKey, CompletionRecord> {
    let mut merged = local.clone();
    for (day, incoming) in remote {
        merged
            .entry(day.clone())
            .and_modify(|existing| *existing = merge_completion_record(existing, incoming))
            .or_insert_with(|| incoming.clone());
    }
    merged
}

fn merge_completion_record(a: &CompletionRecord, b: &CompletionRecord) -> CompletionRecord {
    CompletionRecord {
        completed_at: a.completed_at.max(b.completed_at),
        completed_subtasks: a
            .completed_subtasks
            .union(&b.completed_subtasks)
            .copied()
            .collect(),
        points_awarded: a.points_awarded.max(b.points_awarded),
    }
}

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

/// Trimmed, whitespace-collapsed, lowercase name used for de-duplication.
pub fn normalize_category_name(name: &str) -> String {
    WHITESPACE_RUN
        .replace_all(name.trim(), " ")
        .to_lowercase()
}

/// Categories never resolve on timestamps: the first-seen local copy stays.
pub fn merge_category(_local: &Category, _remote: &Category) -> MergeResult<Category> {
    MergeResult::TakeLocal
}

/// De-duplicates by id and normalized name, local entries first.
///
/// Remote entries already represented by id or by normalized name are
/// dropped; the rest are appended in remote order.
pub fn merge_categories(local: &[Category], remote: &[Category]) -> Vec<Category> {
    let mut seen_ids: HashSet<EntityId> = HashSet::new();
    let mut seen_names: HashSet<String> = HashSet::new();
    let mut merged = Vec::with_capacity(local.len() + remote.len());

    for category in local.iter().chain(remote.iter()) {
        let name_key = normalize_category_name(&category.name);
        if seen_ids.contains(&category.id) || seen_names.contains(&name_key) {
            continue;
        }
        seen_ids.insert(category.id);
        seen_names.insert(name_key);
        merged.push(category.clone());
    }
    merged
}

// ---------------------------------------------------------------------------
// Reward
// ---------------------------------------------------------------------------

/// Remote metadata wins; redemption dates are the union of both sides.
pub fn merge_reward(local: &Reward, remote: &Reward) -> MergeResult<Reward> {
    let mut merged = remote.clone();
    merged.redemption_dates = local
        .redemption_dates
        .union(&remote.redemption_dates)
        .copied()
        .collect();
    merged.last_modified = local.last_modified.max(remote.last_modified);
    classify(merged, local, remote)
}

// ---------------------------------------------------------------------------
// Points history
// ---------------------------------------------------------------------------

/// Merges two entries for the same calendar day. The local id is kept so
/// entries created independently on two devices collapse into one.
pub fn merge_points(
    local: &PointsHistoryEntry,
    remote: &PointsHistoryEntry,
    policy: PointsMergePolicy,
) -> MergeResult<PointsHistoryEntry> {
    let points = match policy {
        PointsMergePolicy::MaxPerDay => local.points.max(remote.points),
        PointsMergePolicy::LastModifiedWins if remote.last_modified > local.last_modified => {
            remote.points
        }
        PointsMergePolicy::LastModifiedWins => local.points,
    };
    let merged = PointsHistoryEntry {
        id: local.id,
        day: local.day.clone(),
        points,
        last_modified: local.last_modified.max(remote.last_modified),
    };
    classify(merged, local, remote)
}

// ---------------------------------------------------------------------------
// Tracking sessions and attachments
// ---------------------------------------------------------------------------

/// Whole-record last-modified-wins; remote on ties.
pub fn merge_tracking_session(
    local: &TrackingSession,
    remote: &TrackingSession,
) -> MergeResult<TrackingSession> {
    last_modified_wins(local.last_modified, remote.last_modified)
}

pub fn merge_attachment(
    local: &JournalAttachment,
    remote: &JournalAttachment,
) -> MergeResult<JournalAttachment> {
    last_modified_wins(local.last_modified, remote.last_modified)
}

fn last_modified_wins<T>(local: i64, remote: i64) -> MergeResult<T> {
    if local > remote {
        MergeResult::TakeLocal
    } else {
        MergeResult::TakeRemote
    }
}

// ---------------------------------------------------------------------------
// Journal entries
// ---------------------------------------------------------------------------

/// Journal merge.
///
/// 1. An empty side loses to a non-empty side.
/// 2. Edits within `window_ms` of each other are merged field by field.
/// 3. Otherwise the newer `updated_at` wins outright.
pub fn merge_journal_entry(
    local: &JournalEntry,
    remote: &JournalEntry,
    window_ms: i64,
    deleted_attachments: &BTreeSet<EntityId>,
) -> MergeResult<JournalEntry> {
    match (local.is_empty(), remote.is_empty()) {
        (true, false) => return MergeResult::TakeRemote,
        (false, true) => return MergeResult::TakeLocal,
        _ => {}
    }

    let gap = local.updated_at.abs_diff(remote.updated_at);
    if gap > window_ms.unsigned_abs() {
        return if local.updated_at > remote.updated_at {
            MergeResult::TakeLocal
        } else {
            MergeResult::TakeRemote
        };
    }

    let newer = local
        .updated_at
        .cmp(&remote.updated_at)
        .then(local.last_modified.cmp(&remote.last_modified));
    let merged = JournalEntry {
        id: local.id,
        title: pick_text(&local.title, &remote.title, newer),
        text: pick_text(&local.text, &remote.text, newer),
        mood: pick_mood(local.mood.as_ref(), remote.mood.as_ref(), newer),
        tags: union_tags(&local.tags, &remote.tags, newer),
        photos: union_attachments(&local.photos, &remote.photos, deleted_attachments),
        voice_memos: union_attachments(&local.voice_memos, &remote.voice_memos, deleted_attachments),
        created_at: local.created_at.min(remote.created_at),
        updated_at: local.updated_at.max(remote.updated_at),
        last_modified: local.last_modified.max(remote.last_modified),
    };
    classify(merged, local, remote)
}

/// `newer` orders local against remote. Equal clocks fall back to the
/// value itself so both devices pick the same side.
fn prefers_local<T: Ord + ?Sized>(newer: Ordering, local: &T, remote: &T) -> bool {
    match newer {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => local >= remote,
    }
}

fn pick_text(local: &str, remote: &str, newer: Ordering) -> String {
    match (local.trim().is_empty(), remote.trim().is_empty()) {
        (false, true) => local.to_string(),
        (true, false) => remote.to_string(),
        _ if prefers_local(newer, local, remote) => local.to_string(),
        _ => remote.to_string(),
    }
}

fn pick_mood(local: Option<&String>, remote: Option<&String>, newer: Ordering) -> Option<String> {
    let local = local.filter(|mood| !mood.trim().is_empty());
    let remote = remote.filter(|mood| !mood.trim().is_empty());
    match (local, remote) {
        (Some(local), Some(remote)) if prefers_local(newer, local, remote) => Some(local.clone()),
        (_, Some(remote)) => Some(remote.clone()),
        (Some(local), None) => Some(local.clone()),
        (None, None) => None,
    }
}

/// Preferred side's tags first, then unseen tags from the other side;
/// compared case-insensitively.
fn union_tags(local: &[String], remote: &[String], newer: Ordering) -> Vec<String> {
    let (first, second) = if prefers_local(newer, local, remote) {
        (local, remote)
    } else {
        (remote, local)
    };
    let mut seen = HashSet::new();
    let mut tags = Vec::with_capacity(local.len() + remote.len());
    for tag in first.iter().chain(second.iter()) {
        let trimmed = tag.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_lowercase()) {
            tags.push(trimmed.to_string());
        }
    }
    tags
}

/// Union by id, newest first, without tombstoned attachments. When both
/// sides carry the same id the newer `last_modified` copy is kept, then the
/// greater `asset_ref`.
fn union_attachments(
    local: &[JournalAttachment],
    remote: &[JournalAttachment],
    deleted: &BTreeSet<EntityId>,
) -> Vec<JournalAttachment> {
    let mut by_id: BTreeMap<EntityId, &JournalAttachment> = BTreeMap::new();
    for attachment in local.iter().chain(remote.iter()) {
        if deleted.contains(&attachment.id) {
            continue;
        }
        by_id
            .entry(attachment.id)
            .and_modify(|existing| {
                let newer = attachment
                    .last_modified
                    .cmp(&existing.last_modified)
                    .then_with(|| attachment.asset_ref.cmp(&existing.asset_ref));
                if newer == Ordering::Greater {
                    *existing = attachment;
                }
            })
            .or_insert(attachment);
    }

    let mut merged: Vec<JournalAttachment> = by_id.into_values().cloned().collect();
    merged.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
    merged
}
