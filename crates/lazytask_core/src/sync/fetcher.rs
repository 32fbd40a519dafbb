//! Change fetcher.
//!
//! # Responsibility
//! - Run one incremental (or full) fetch against the remote store and bucket
//!   the result into a `SyncChanges` batch.
//! - Own the durable id→kind index used to resolve bare hard deletes.
//!
//! # Invariants
//! - The fetcher never advances the stored cursor; it only returns the
//!   candidate cursor. The orchestrator commits it after the batch is applied.
//! - A rejected cursor is cleared and the fetch retried once without one.
//! - Change tags are not recorded here, only kinds: a tag must not claim a
//!   server version the local store has not applied yet.

use crate::model::entity::{Entity, EntityKind};
use crate::sync::cancel::CancelToken;
use crate::sync::clock::{Clock, Sleeper};
use crate::sync::cursor::SyncCursorStore;
use crate::sync::error::{SyncError, SyncResult};
use crate::sync::record::{decode_record, DecodedRecord};
use crate::sync::record_index::RecordIndex;
use crate::sync::remote::{RemoteRecordStore, SyncCursor, ZoneId};
use crate::sync::tombstone::Tombstone;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A remote entity together with the server version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingEntity {
    pub entity: Entity,
    pub change_tag: Option<String>,
}

/// A hard delete reported as a bare id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardDelete {
    pub record_id: String,
    /// Resolved from the record index or a marker in the same batch.
    pub kind: Option<EntityKind>,
}

/// One fetched batch, bucketed by change type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncChanges {
    pub upserts: BTreeMap<EntityKind, Vec<IncomingEntity>>,
    pub hard_deletes: Vec<HardDelete>,
    pub markers: Vec<Tombstone>,
    pub new_cursor: Option<SyncCursor>,
    pub full_fetch: bool,
    /// Records skipped because they could not be decoded or are unknown.
    pub skipped: usize,
}

impl SyncChanges {
    pub fn upsert_count(&self) -> usize {
        self.upserts.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.hard_deletes.is_empty() && self.markers.is_empty()
    }
}

pub struct ChangeFetcher {
    remote: Arc<dyn RemoteRecordStore>,
    index: RecordIndex,
    cursors: SyncCursorStore,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    page_limit: u32,
    cursor_retry_delay: Duration,
}

impl ChangeFetcher {
    pub fn new(
        remote: Arc<dyn RemoteRecordStore>,
        index: RecordIndex,
        cursors: SyncCursorStore,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        page_limit: u32,
        cursor_retry_delay: Duration,
    ) -> Self {
        Self {
            remote,
            index,
            cursors,
            clock,
            sleeper,
            page_limit,
            cursor_retry_delay,
        }
    }

    /// Fetches every change since `cursor`, or everything when it is `None`.
    pub fn fetch(
        &self,
        zone: &ZoneId,
        cursor: Option<&SyncCursor>,
        cancel: &CancelToken,
    ) -> SyncResult<SyncChanges> {
        match self.fetch_since(zone, cursor, cancel) {
            Err(SyncError::CursorInvalid) if cursor.is_some() => {
                warn!(
                    "event=fetch_changes module=fetcher status=error zone={zone} error_code=cursor_invalid action=full_refetch"
                );
                self.cursors.clear(zone)?;
                if !self.sleeper.sleep(self.cursor_retry_delay, cancel) {
                    return Err(SyncError::Cancelled);
                }
                self.fetch_since(zone, None, cancel)
            }
            other => other,
        }
    }

    fn fetch_since(
        &self,
        zone: &ZoneId,
        cursor: Option<&SyncCursor>,
        cancel: &CancelToken,
    ) -> SyncResult<SyncChanges> {
        let started_at = Instant::now();
        let mode = if cursor.is_some() { "incremental" } else { "full" };
        info!("event=fetch_changes module=fetcher status=start zone={zone} mode={mode}");

        let mut changes = SyncChanges {
            full_fetch: cursor.is_none(),
            ..SyncChanges::default()
        };
        let mut deleted_ids = Vec::new();
        let mut page_cursor = cursor.cloned();
        let mut pages = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let page = self
                .remote
                .fetch_changes(zone, page_cursor.as_ref(), self.page_limit, cancel)
                .map_err(SyncError::from_remote)?;
            pages += 1;

            for record in &page.records {
                match decode_record(record) {
                    Ok(DecodedRecord::Entity(entity)) => {
                        let kind = entity.kind();
                        self.index
                            .record_kind(&record.record_id, kind, self.clock.now_ms())?;
                        changes.upserts.entry(kind).or_default().push(IncomingEntity {
                            entity,
                            change_tag: record.change_tag.clone(),
                        });
                    }
                    Ok(DecodedRecord::Marker(tombstone)) => changes.markers.push(tombstone),
                    Ok(DecodedRecord::Unknown(record_type)) => {
                        debug!(
                            "event=fetch_changes module=fetcher status=skip reason=unknown_type record_type={record_type}"
                        );
                        changes.skipped += 1;
                    }
                    Err(err) => {
                        warn!(
                            "event=fetch_changes module=fetcher status=skip reason=decode_failed error={err}"
                        );
                        changes.skipped += 1;
                    }
                }
            }
            deleted_ids.extend(page.deleted_ids);

            let advanced = page.new_cursor.is_some() && page.new_cursor != page_cursor;
            if let Some(next) = page.new_cursor {
                page_cursor = Some(next);
            }
            if !page.more_coming {
                break;
            }
            if !advanced {
                warn!(
                    "event=fetch_changes module=fetcher status=error zone={zone} error_code=cursor_not_advancing pages={pages}"
                );
                break;
            }
        }

        for record_id in deleted_ids {
            let kind = self.resolve_deleted_kind(&record_id, &changes.markers)?;
            changes.hard_deletes.push(HardDelete { record_id, kind });
        }
        changes.new_cursor = page_cursor;

        info!(
            "event=fetch_changes module=fetcher status=ok zone={zone} mode={mode} pages={pages} upserts={} hard_deletes={} markers={} skipped={} duration_ms={}",
            changes.upsert_count(),
            changes.hard_deletes.len(),
            changes.markers.len(),
            changes.skipped,
            started_at.elapsed().as_millis()
        );
        Ok(changes)
    }

    fn resolve_deleted_kind(
        &self,
        record_id: &str,
        markers: &[Tombstone],
    ) -> SyncResult<Option<EntityKind>> {
        if let Some(kind) = self.index.kind_of(record_id)? {
            return Ok(Some(kind));
        }
        Ok(markers
            .iter()
            .find(|marker| marker.entity_id.to_string() == record_id)
            .map(|marker| marker.kind))
    }
}
