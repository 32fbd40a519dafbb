//! Write pipeline.
//!
//! # Responsibility
//! - Push local upserts and deletes to the remote store.
//! - Resolve write conflicts by merging with the server copy and
//!   resubmitting, with exponential backoff between attempts.
//! - Drain the outbox so failed writes are retried on later cycles.
//!
//! # Invariants
//! - A tombstoned entity is never pushed as an upsert.
//! - At most `max_push_attempts` pushes per entity per call; no backoff
//!   sleep follows the final attempt.
//! - An outbox row is only completed after the remote acknowledged it.
//! - A delete pushes its deletion marker before removing the remote record.

use crate::config::SyncConfig;
use crate::model::entity::{Entity, EntityId, EntityKind};
use crate::sync::cancel::CancelToken;
use crate::sync::clock::{Clock, Sleeper};
use crate::sync::env::SyncEnv;
use crate::sync::error::{SyncError, SyncResult};
use crate::sync::local_store::LocalStore;
use crate::sync::merge::{merge_entities, MergeContext};
use crate::sync::outbox::{Outbox, OutboxOp};
use crate::sync::record::{decode_entity, encode_entity, encode_marker};
use crate::sync::record_index::RecordIndex;
use crate::sync::remote::{RemoteRecordStore, ZoneId};
use crate::sync::state::ObserverHub;
use crate::sync::tombstone::{Tombstone, TombstoneLedger};
use log::{debug, error, info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// The remote accepted the entity. `merged` is set when a conflict
    /// merge changed what was finally written.
    Pushed { attempts: u32, merged: bool },
    /// The server copy already contained every local change.
    AdoptedServer { attempts: u32 },
    SkippedTombstoned,
    /// Sync is off; the write waits in the outbox.
    Queued,
}

/// Result of one outbox drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub pushed: usize,
    pub deleted: usize,
    pub failed: usize,
    /// Rows dropped because the entity no longer exists locally.
    pub discarded: usize,
}

pub struct WritePipeline {
    zone: ZoneId,
    remote: Arc<dyn RemoteRecordStore>,
    local: Arc<dyn LocalStore>,
    ledger: TombstoneLedger,
    index: RecordIndex,
    outbox: Outbox,
    observers: ObserverHub,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl WritePipeline {
    pub fn new(env: &SyncEnv, config: SyncConfig, observers: ObserverHub) -> Self {
        Self {
            zone: ZoneId::new(config.zone_id.clone()),
            remote: Arc::clone(&env.remote),
            local: Arc::clone(&env.local),
            ledger: TombstoneLedger::new(env.state_db.clone(), Arc::clone(&env.clock)),
            index: RecordIndex::new(env.state_db.clone()),
            outbox: Outbox::new(env.state_db.clone()),
            observers,
            config,
            clock: Arc::clone(&env.clock),
            sleeper: Arc::clone(&env.sleeper),
        }
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Queues a local upsert without contacting the remote.
    pub fn enqueue(&self, entity: &Entity) -> SyncResult<PushOutcome> {
        if self.ledger.is_deleted(entity.kind(), entity.id())? {
            return Ok(PushOutcome::SkippedTombstoned);
        }
        self.outbox
            .enqueue(entity.kind(), entity.id(), OutboxOp::Upsert, self.clock.now_ms())?;
        Ok(PushOutcome::Queued)
    }

    /// Pushes one local upsert, merging through conflicts.
    pub fn push(&self, entity: &Entity, cancel: &CancelToken) -> SyncResult<PushOutcome> {
        let kind = entity.kind();
        if self.ledger.is_deleted(kind, entity.id())? {
            debug!("event=push_entity module=pipeline status=skip kind={kind} reason=tombstoned");
            return Ok(PushOutcome::SkippedTombstoned);
        }
        self.outbox
            .enqueue(kind, entity.id(), OutboxOp::Upsert, self.clock.now_ms())?;
        self.push_enqueued(entity, cancel)
    }

    /// Records a local delete: tombstone, outbox marker, local removal.
    pub fn record_delete(&self, kind: EntityKind, id: EntityId) -> SyncResult<()> {
        self.ledger.mark_deleted(kind, id)?;
        if self.local.get(kind, id)?.is_some() {
            self.local.delete(kind, id)?;
            self.observers.notify_data_changed(&[kind]);
        }
        Ok(())
    }

    /// Records a local delete and propagates it.
    pub fn delete(&self, kind: EntityKind, id: EntityId, cancel: &CancelToken) -> SyncResult<()> {
        self.record_delete(kind, id)?;
        self.push_delete(kind, id, cancel)
    }

    /// Retries every pending write, oldest first.
    ///
    /// Per-entity failures are counted and left queued; only failures that
    /// would fail every write (cancellation, auth, quota, missing zone,
    /// local storage) abort the drain.
    pub fn flush_outbox(&self, cancel: &CancelToken) -> SyncResult<FlushReport> {
        let pending = self.outbox.pending()?;
        let mut report = FlushReport::default();
        if pending.is_empty() {
            return Ok(report);
        }
        let started_at = Instant::now();

        for write in pending {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let result = match write.op {
                OutboxOp::Upsert => {
                    let current = self.local.get(write.kind, write.entity_id)?;
                    match current {
                        Some(entity) if !self.ledger.is_deleted(write.kind, write.entity_id)? => {
                            self.push_enqueued(&entity, cancel).map(|_| report.pushed += 1)
                        }
                        _ => {
                            self.outbox
                                .complete(write.kind, write.entity_id, OutboxOp::Upsert)?;
                            report.discarded += 1;
                            Ok(())
                        }
                    }
                }
                OutboxOp::Delete => self
                    .push_delete(write.kind, write.entity_id, cancel)
                    .map(|()| report.deleted += 1),
            };

            if let Err(err) = result {
                if aborts_flush(&err) {
                    return Err(err);
                }
                report.failed += 1;
            }
        }

        info!(
            "event=flush_outbox module=pipeline status=ok pushed={} deleted={} failed={} discarded={} duration_ms={}",
            report.pushed,
            report.deleted,
            report.failed,
            report.discarded,
            started_at.elapsed().as_millis()
        );
        Ok(report)
    }

    fn push_enqueued(&self, entity: &Entity, cancel: &CancelToken) -> SyncResult<PushOutcome> {
        let kind = entity.kind();
        let id = entity.id();
        match self.push_with_retry(entity, cancel) {
            Ok(outcome) => {
                self.outbox.complete(kind, id, OutboxOp::Upsert)?;
                Ok(outcome)
            }
            Err(err) => {
                if matches!(err, SyncError::NotFound(_)) {
                    self.index.clear_change_tag(&id.to_string())?;
                }
                if !matches!(err, SyncError::Cancelled) {
                    self.outbox.record_attempt(kind, id)?;
                }
                warn!(
                    "event=push_entity module=pipeline status=error kind={kind} error_code={}",
                    err.code()
                );
                Err(err)
            }
        }
    }

    fn push_with_retry(&self, entity: &Entity, cancel: &CancelToken) -> SyncResult<PushOutcome> {
        let kind = entity.kind();
        let record_id = entity.id().to_string();
        let deleted_attachments = self.ledger.deleted_ids(EntityKind::JournalAttachment)?;
        let ctx = self.merge_context(&deleted_attachments);
        let max_attempts = self.config.max_push_attempts.max(1);

        let mut target = entity.clone();
        let mut change_tag = self.index.change_tag(&record_id)?;
        let mut merged = false;

        for attempt in 0..max_attempts {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let record = encode_entity(&target, change_tag.clone())?;
            let err = match self.remote.push(&self.zone, &record, cancel) {
                Ok(saved) => {
                    self.index.record(
                        &record_id,
                        kind,
                        saved.change_tag.as_deref(),
                        self.clock.now_ms(),
                    )?;
                    if merged {
                        self.adopt_locally(&target, &ctx)?;
                    }
                    info!(
                        "event=push_entity module=pipeline status=ok kind={kind} attempts={} merged={merged}",
                        attempt + 1
                    );
                    return Ok(PushOutcome::Pushed {
                        attempts: attempt + 1,
                        merged,
                    });
                }
                Err(envelope) => SyncError::from_remote(envelope),
            };

            let SyncError::Conflict { server_record } = err else {
                return Err(err);
            };
            warn!(
                "event=push_entity module=pipeline status=conflict kind={kind} attempt={}",
                attempt + 1
            );
            let server_record = match server_record {
                Some(record) => Some(*record),
                None => self
                    .remote
                    .fetch_record(&self.zone, &record_id, cancel)
                    .map_err(SyncError::from_remote)?,
            };

            match server_record {
                Some(server) => {
                    if let Some(server_entity) = decode_entity(&server)? {
                        let next = merge_entities(&target, &server_entity, &ctx)
                            .into_value(&target, &server_entity);
                        if next == server_entity {
                            self.index.record(
                                &record_id,
                                kind,
                                server.change_tag.as_deref(),
                                self.clock.now_ms(),
                            )?;
                            self.adopt_locally(&server_entity, &ctx)?;
                            info!(
                                "event=push_entity module=pipeline status=ok kind={kind} attempts={} adopted_server=true",
                                attempt + 1
                            );
                            return Ok(PushOutcome::AdoptedServer {
                                attempts: attempt + 1,
                            });
                        }
                        target = next;
                        merged = true;
                    }
                    change_tag = server.change_tag;
                }
                None => change_tag = None,
            }

            if attempt + 1 < max_attempts
                && !self.sleeper.sleep(self.config.backoff_for(attempt), cancel)
            {
                return Err(SyncError::Cancelled);
            }
        }

        error!(
            "event=push_entity module=pipeline status=error kind={kind} error_code=retries_exhausted attempts={max_attempts}"
        );
        Err(SyncError::RetriesExhausted {
            record_id,
            attempts: max_attempts,
        })
    }

    /// Folds a conflict-merged copy into whatever the local store holds now.
    fn adopt_locally(&self, merged: &Entity, ctx: &MergeContext<'_>) -> SyncResult<()> {
        let kind = merged.kind();
        let id = merged.id();
        if self.ledger.is_deleted(kind, id)? {
            return Ok(());
        }
        let Some(current) = self.local.get(kind, id)? else {
            return Ok(());
        };
        let next = merge_entities(&current, merged, ctx).into_value(&current, merged);
        if next != current {
            self.local.upsert(&next)?;
            self.observers.notify_data_changed(&[kind]);
        }
        Ok(())
    }

    fn push_delete(&self, kind: EntityKind, id: EntityId, cancel: &CancelToken) -> SyncResult<()> {
        let tombstone = self.ledger.tombstone(kind, id)?.unwrap_or(Tombstone {
            kind,
            entity_id: id,
            deleted_at: self.clock.now_ms(),
        });
        let marker = encode_marker(&tombstone)?;

        let marker_result = match self.remote.push(&self.zone, &marker, cancel) {
            // An existing marker already carries the delete.
            Ok(_) => Ok(()),
            Err(envelope) => match SyncError::from_remote(envelope) {
                SyncError::Conflict { .. } => Ok(()),
                other => Err(other),
            },
        };
        let result = marker_result.and_then(|()| {
            match self.remote.delete(&self.zone, &id.to_string(), cancel) {
                Ok(()) => Ok(()),
                Err(envelope) => match SyncError::from_remote(envelope) {
                    SyncError::NotFound(_) => Ok(()),
                    other => Err(other),
                },
            }
        });

        if let Err(err) = result {
            if !matches!(err, SyncError::Cancelled) {
                self.outbox.record_attempt(kind, id)?;
            }
            warn!(
                "event=push_delete module=pipeline status=error kind={kind} error_code={}",
                err.code()
            );
            return Err(err);
        }

        self.index.remove(&id.to_string())?;
        self.outbox.complete(kind, id, OutboxOp::Delete)?;
        info!("event=push_delete module=pipeline status=ok kind={kind}");
        Ok(())
    }

    fn merge_context<'a>(&self, deleted_attachments: &'a BTreeSet<EntityId>) -> MergeContext<'a> {
        MergeContext {
            task_tie_break: self.config.task_tie_break,
            points_policy: self.config.points_merge_policy,
            journal_window_ms: self.config.journal_concurrency_window_ms,
            deleted_attachments,
        }
    }
}

fn aborts_flush(err: &SyncError) -> bool {
    matches!(
        err,
        SyncError::Cancelled
            | SyncError::Auth(_)
            | SyncError::Quota(_)
            | SyncError::ZoneMissing
            | SyncError::LocalStore(_)
            | SyncError::Db(_)
    )
}
