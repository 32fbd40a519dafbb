//! Batch applier.
//!
//! # Responsibility
//! - Apply one fetched batch to the local store: deletion markers first,
//!   then hard deletes, then upserts per kind in `EntityKind::ALL` order.
//! - Queue merged or locally-newer copies for push-back so the remote
//!   converges on the merged state.
//!
//! # Invariants
//! - A tombstoned id is never written locally.
//! - Re-applying the same batch performs no writes: a merged copy equal to
//!   the local one is not written.
//! - Change tags are recorded only after the record's state has been applied.

use crate::config::SyncConfig;
use crate::model::entity::{Category, Entity, EntityId, EntityKind, PointsHistoryEntry};
use crate::sync::clock::Clock;
use crate::sync::error::SyncResult;
use crate::sync::fetcher::{HardDelete, IncomingEntity, SyncChanges};
use crate::sync::local_store::LocalStore;
use crate::sync::merge::{merge_categories, merge_points, resolve, MergeContext, MergeResult, Resolution};
use crate::sync::outbox::{Outbox, OutboxOp};
use crate::sync::record_index::RecordIndex;
use crate::sync::tombstone::TombstoneLedger;
use log::{debug, info, warn};
use std::collections::{BTreeSet, HashSet};
use uuid::Uuid;

/// What one apply pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub affected: BTreeSet<EntityKind>,
    pub written: usize,
    pub deleted: usize,
    pub skipped_tombstoned: usize,
    pub duplicates_dropped: usize,
    pub push_back: usize,
}

pub struct BatchApplier<'a> {
    local: &'a dyn LocalStore,
    ledger: &'a TombstoneLedger,
    index: &'a RecordIndex,
    outbox: &'a Outbox,
    config: &'a SyncConfig,
    clock: &'a dyn Clock,
}

impl<'a> BatchApplier<'a> {
    pub fn new(
        local: &'a dyn LocalStore,
        ledger: &'a TombstoneLedger,
        index: &'a RecordIndex,
        outbox: &'a Outbox,
        config: &'a SyncConfig,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            local,
            ledger,
            index,
            outbox,
            config,
            clock,
        }
    }

    pub fn apply(&self, changes: &SyncChanges) -> SyncResult<ApplyReport> {
        let mut report = ApplyReport::default();

        for marker in &changes.markers {
            self.apply_delete(marker.kind, marker.entity_id, marker.deleted_at, &mut report)?;
        }
        for delete in &changes.hard_deletes {
            self.apply_hard_delete(delete, &mut report)?;
        }

        let deleted_attachments = self.ledger.deleted_ids(EntityKind::JournalAttachment)?;
        let ctx = MergeContext {
            task_tie_break: self.config.task_tie_break,
            points_policy: self.config.points_merge_policy,
            journal_window_ms: self.config.journal_concurrency_window_ms,
            deleted_attachments: &deleted_attachments,
        };

        for kind in EntityKind::ALL {
            let Some(incoming) = changes.upserts.get(&kind) else {
                continue;
            };
            match kind {
                EntityKind::Category => self.apply_categories(incoming, &mut report)?,
                EntityKind::PointsHistory => self.apply_points(incoming, &ctx, &mut report)?,
                _ => {
                    for item in incoming {
                        self.apply_upsert(item, &ctx, &mut report)?;
                    }
                }
            }
        }

        self.index.prune_tombstoned()?;
        info!(
            "event=apply_batch module=apply status=ok written={} deleted={} skipped_tombstoned={} duplicates_dropped={} push_back={} affected_kinds={}",
            report.written,
            report.deleted,
            report.skipped_tombstoned,
            report.duplicates_dropped,
            report.push_back,
            report.affected.len()
        );
        Ok(report)
    }

    fn apply_delete(
        &self,
        kind: EntityKind,
        id: EntityId,
        deleted_at: i64,
        report: &mut ApplyReport,
    ) -> SyncResult<()> {
        self.ledger.record_remote(kind, id, deleted_at)?;
        if self.local.get(kind, id)?.is_some() {
            self.local.delete(kind, id)?;
            report.deleted += 1;
            report.affected.insert(kind);
        }
        Ok(())
    }

    fn apply_hard_delete(&self, delete: &HardDelete, report: &mut ApplyReport) -> SyncResult<()> {
        let Ok(id) = Uuid::parse_str(&delete.record_id) else {
            // Marker records and foreign ids have no local counterpart.
            debug!(
                "event=apply_hard_delete module=apply status=skip reason=not_entity_id record_id={}",
                delete.record_id
            );
            return Ok(());
        };
        let kind = match delete.kind {
            Some(kind) => Some(kind),
            None => self.find_local_kind(id)?,
        };
        match kind {
            Some(kind) => self.apply_delete(kind, id, self.clock.now_ms(), report),
            None => {
                warn!(
                    "event=apply_hard_delete module=apply status=skip reason=kind_unresolved record_id={}",
                    delete.record_id
                );
                Ok(())
            }
        }
    }

    fn find_local_kind(&self, id: EntityId) -> SyncResult<Option<EntityKind>> {
        for kind in EntityKind::ALL {
            if self.local.get(kind, id)?.is_some() {
                return Ok(Some(kind));
            }
        }
        Ok(None)
    }

    fn apply_upsert(
        &self,
        item: &IncomingEntity,
        ctx: &MergeContext<'_>,
        report: &mut ApplyReport,
    ) -> SyncResult<()> {
        let remote = &item.entity;
        let kind = remote.kind();
        let id = remote.id();
        let tombstoned = self.ledger.is_deleted(kind, id)?;
        let local = self.local.get(kind, id)?;

        match resolve(local.as_ref(), Some(remote), false, tombstoned, ctx) {
            Resolution::Drop => {
                report.skipped_tombstoned += 1;
                if local.is_some() {
                    self.local.delete(kind, id)?;
                    report.deleted += 1;
                    report.affected.insert(kind);
                }
                return Ok(());
            }
            Resolution::Write(value) => {
                self.local.upsert(&value)?;
                report.written += 1;
                report.affected.insert(kind);
                if value != *remote {
                    self.queue_push_back(kind, id, report)?;
                }
            }
            Resolution::Unchanged => {
                if local.as_ref() != Some(remote) {
                    self.queue_push_back(kind, id, report)?;
                }
            }
        }
        self.record_tag(item)
    }

    fn apply_categories(&self, incoming: &[IncomingEntity], report: &mut ApplyReport) -> SyncResult<()> {
        let local: Vec<Category> = self
            .local
            .get_all(EntityKind::Category)?
            .into_iter()
            .filter_map(|entity| match entity {
                Entity::Category(category) => Some(category),
                _ => None,
            })
            .collect();

        let mut live = Vec::with_capacity(incoming.len());
        let mut remote = Vec::with_capacity(incoming.len());
        for item in incoming {
            let Entity::Category(category) = &item.entity else {
                continue;
            };
            if self.ledger.is_deleted(EntityKind::Category, category.id)? {
                report.skipped_tombstoned += 1;
                continue;
            }
            live.push(item);
            remote.push(category.clone());
        }

        let local_ids: HashSet<EntityId> = local.iter().map(|category| category.id).collect();
        let mut added = 0usize;
        for category in merge_categories(&local, &remote) {
            if local_ids.contains(&category.id) {
                continue;
            }
            self.local.upsert(&Entity::Category(category))?;
            added += 1;
        }
        // Same-id remote copies keep the local version and are not counted.
        let dropped = remote
            .iter()
            .filter(|category| !local_ids.contains(&category.id))
            .count()
            .saturating_sub(added);
        if dropped > 0 {
            debug!("event=category_dedup module=apply status=ok dropped={dropped}");
        }

        report.written += added;
        report.duplicates_dropped += dropped;
        if added > 0 {
            report.affected.insert(EntityKind::Category);
        }
        for item in live {
            self.record_tag(item)?;
        }
        Ok(())
    }

    /// Points entries are matched by id, then by calendar day.
    fn apply_points(
        &self,
        incoming: &[IncomingEntity],
        ctx: &MergeContext<'_>,
        report: &mut ApplyReport,
    ) -> SyncResult<()> {
        let mut local: Vec<PointsHistoryEntry> = self
            .local
            .get_all(EntityKind::PointsHistory)?
            .into_iter()
            .filter_map(|entity| match entity {
                Entity::PointsHistory(entry) => Some(entry),
                _ => None,
            })
            .collect();

        for item in incoming {
            let Entity::PointsHistory(remote) = &item.entity else {
                continue;
            };
            if self.ledger.is_deleted(EntityKind::PointsHistory, remote.id)? {
                report.skipped_tombstoned += 1;
                continue;
            }

            let slot = local
                .iter()
                .position(|entry| entry.id == remote.id)
                .or_else(|| local.iter().position(|entry| entry.day == remote.day));
            match slot {
                None => {
                    self.local.upsert(&item.entity)?;
                    report.written += 1;
                    report.affected.insert(EntityKind::PointsHistory);
                    local.push(remote.clone());
                }
                Some(slot) => {
                    let current = local[slot].clone();
                    match merge_points(&current, remote, ctx.points_policy) {
                        MergeResult::TakeLocal => {
                            if current.id == remote.id && current != *remote {
                                self.queue_push_back(EntityKind::PointsHistory, current.id, report)?;
                            }
                        }
                        MergeResult::TakeRemote => {
                            if current.id != remote.id {
                                self.local.delete(EntityKind::PointsHistory, current.id)?;
                            }
                            self.local.upsert(&item.entity)?;
                            report.written += 1;
                            report.affected.insert(EntityKind::PointsHistory);
                            local[slot] = remote.clone();
                        }
                        MergeResult::Merged(merged) => {
                            self.local.upsert(&Entity::PointsHistory(merged.clone()))?;
                            report.written += 1;
                            report.affected.insert(EntityKind::PointsHistory);
                            self.queue_push_back(EntityKind::PointsHistory, merged.id, report)?;
                            local[slot] = merged;
                        }
                    }
                }
            }
            self.record_tag(item)?;
        }
        Ok(())
    }

    fn queue_push_back(&self, kind: EntityKind, id: EntityId, report: &mut ApplyReport) -> SyncResult<()> {
        self.outbox.enqueue(kind, id, OutboxOp::Upsert, self.clock.now_ms())?;
        report.push_back += 1;
        Ok(())
    }

    fn record_tag(&self, item: &IncomingEntity) -> SyncResult<()> {
        self.index.record(
            &item.entity.id().to_string(),
            item.entity.kind(),
            item.change_tag.as_deref(),
            self.clock.now_ms(),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::BatchApplier;
    use crate::config::SyncConfig;
    use crate::db::{open_db_in_memory, share};
    use crate::model::entity::{Category, Entity, EntityKind, PointsHistoryEntry, Reward, Task};
    use crate::sync::clock::ManualClock;
    use crate::sync::fetcher::{HardDelete, IncomingEntity, SyncChanges};
    use crate::sync::local_store::{InMemoryLocalStore, LocalStore};
    use crate::sync::outbox::Outbox;
    use crate::sync::record_index::RecordIndex;
    use crate::sync::tombstone::{Tombstone, TombstoneLedger};
    use std::sync::Arc;
    use uuid::Uuid;

    struct Fixture {
        local: InMemoryLocalStore,
        ledger: TombstoneLedger,
        index: RecordIndex,
        outbox: Outbox,
        config: SyncConfig,
        clock: ManualClock,
    }

    impl Fixture {
        fn new() -> Self {
            let conn = share(open_db_in_memory().unwrap());
            Self {
                local: InMemoryLocalStore::new(),
                ledger: TombstoneLedger::new(conn.clone(), Arc::new(ManualClock::new(1_000))),
                index: RecordIndex::new(conn.clone()),
                outbox: Outbox::new(conn),
                config: SyncConfig::default(),
                clock: ManualClock::new(1_000),
            }
        }

        fn apply(&self, changes: &SyncChanges) -> super::ApplyReport {
            BatchApplier::new(
                &self.local,
                &self.ledger,
                &self.index,
                &self.outbox,
                &self.config,
                &self.clock,
            )
            .apply(changes)
            .unwrap()
        }
    }

    fn batch(entities: Vec<Entity>) -> SyncChanges {
        let mut changes = SyncChanges::default();
        for entity in entities {
            changes
                .upserts
                .entry(entity.kind())
                .or_default()
                .push(IncomingEntity {
                    entity,
                    change_tag: Some("t1".to_string()),
                });
        }
        changes
    }

    fn category(name: &str) -> Category {
        Category {
            id: Uuid::new_v4(),
            name: name.to_string(),
            color: None,
            sort_order: 0,
            last_modified: 1,
        }
    }

    #[test]
    fn reapplying_a_batch_writes_nothing() {
        let fixture = Fixture::new();
        let changes = batch(vec![
            Entity::Task(Task::new("a", 10)),
            Entity::Category(category("Work")),
        ]);

        let first = fixture.apply(&changes);
        assert_eq!(first.written, 2);
        let writes = fixture.local.write_count();

        let second = fixture.apply(&changes);
        assert_eq!(second.written, 0);
        assert!(second.affected.is_empty());
        assert_eq!(fixture.local.write_count(), writes);
        assert_eq!(second.push_back, 0);
    }

    #[test]
    fn tombstoned_ids_are_not_resurrected() {
        let fixture = Fixture::new();
        let task = Task::new("gone", 10);
        fixture.ledger.mark_deleted(EntityKind::Task, task.id).unwrap();

        let report = fixture.apply(&batch(vec![Entity::Task(task.clone())]));
        assert_eq!(report.skipped_tombstoned, 1);
        assert!(fixture.local.get(EntityKind::Task, task.id).unwrap().is_none());
    }

    #[test]
    fn markers_apply_before_upserts_in_the_same_batch() {
        let fixture = Fixture::new();
        let task = Task::new("deleted elsewhere", 10);
        fixture.local.upsert(&Entity::Task(task.clone())).unwrap();

        let mut changes = batch(vec![Entity::Task(task.clone())]);
        changes.markers.push(Tombstone {
            kind: EntityKind::Task,
            entity_id: task.id,
            deleted_at: 20,
        });
        let report = fixture.apply(&changes);

        assert_eq!(report.deleted, 1);
        assert!(fixture.local.get(EntityKind::Task, task.id).unwrap().is_none());
        assert!(fixture.ledger.is_deleted(EntityKind::Task, task.id).unwrap());
    }

    #[test]
    fn hard_delete_without_index_entry_searches_local_kinds() {
        let fixture = Fixture::new();
        let reward = Reward {
            id: Uuid::new_v4(),
            title: "movie".to_string(),
            cost: 30,
            icon: None,
            redemption_dates: Default::default(),
            last_modified: 1,
        };
        fixture.local.upsert(&Entity::Reward(reward.clone())).unwrap();

        let mut changes = SyncChanges::default();
        changes.hard_deletes.push(HardDelete {
            record_id: reward.id.to_string(),
            kind: None,
        });
        changes.hard_deletes.push(HardDelete {
            record_id: Uuid::new_v4().to_string(),
            kind: None,
        });
        let report = fixture.apply(&changes);

        assert_eq!(report.deleted, 1);
        assert!(report.affected.contains(&EntityKind::Reward));
        assert!(fixture.local.get(EntityKind::Reward, reward.id).unwrap().is_none());
    }

    #[test]
    fn duplicate_category_names_collapse_to_the_local_copy() {
        let fixture = Fixture::new();
        let local = category("Work");
        fixture.local.upsert(&Entity::Category(local.clone())).unwrap();

        let report = fixture.apply(&batch(vec![
            Entity::Category(category("  work ")),
            Entity::Category(category("Health")),
        ]));

        assert_eq!(report.written, 1);
        assert_eq!(report.duplicates_dropped, 1);
        let names: Vec<String> = fixture
            .local
            .get_all(EntityKind::Category)
            .unwrap()
            .into_iter()
            .filter_map(|entity| match entity {
                Entity::Category(category) => Some(category.name),
                _ => None,
            })
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"Work".to_string()));
        assert!(names.contains(&"Health".to_string()));
    }

    #[test]
    fn points_for_the_same_day_merge_into_the_local_entry() {
        let fixture = Fixture::new();
        let local = PointsHistoryEntry {
            id: Uuid::new_v4(),
            day: "2024-05-01".to_string(),
            points: 20,
            last_modified: 5,
        };
        fixture.local.upsert(&Entity::PointsHistory(local.clone())).unwrap();
        let remote = PointsHistoryEntry {
            id: Uuid::new_v4(),
            day: "2024-05-01".to_string(),
            points: 35,
            last_modified: 4,
        };

        let report = fixture.apply(&batch(vec![Entity::PointsHistory(remote)]));
        assert_eq!(report.written, 1);
        assert_eq!(report.push_back, 1);

        let entries = fixture.local.get_all(EntityKind::PointsHistory).unwrap();
        assert_eq!(entries.len(), 1);
        match &entries[0] {
            Entity::PointsHistory(entry) => {
                assert_eq!(entry.id, local.id);
                assert_eq!(entry.points, 35);
            }
            other => panic!("unexpected entity {other:?}"),
        }
    }

    #[test]
    fn merged_tasks_are_queued_for_push_back() {
        let fixture = Fixture::new();
        let mut local = Task::new("run", 10);
        local
            .completions
            .insert("2024-05-01".to_string(), Default::default());
        fixture.local.upsert(&Entity::Task(local.clone())).unwrap();

        let mut remote = local.clone();
        remote.completions.clear();
        remote
            .completions
            .insert("2024-05-02".to_string(), Default::default());
        remote.last_modified = 20;

        let report = fixture.apply(&batch(vec![Entity::Task(remote)]));
        assert_eq!(report.push_back, 1);
        assert_eq!(fixture.outbox.len().unwrap(), 1);
        match fixture.local.get(EntityKind::Task, local.id).unwrap() {
            Some(Entity::Task(task)) => assert_eq!(task.completions.len(), 2),
            other => panic!("unexpected entity {other:?}"),
        }
        assert_eq!(
            fixture.index.change_tag(&local.id.to_string()).unwrap().as_deref(),
            Some("t1")
        );
    }
}
