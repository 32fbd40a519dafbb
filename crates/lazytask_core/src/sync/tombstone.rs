//! Tombstone ledger.
//!
//! # Responsibility
//! - Durably record deleted entity ids per kind.
//! - Enqueue a deletion-marker write for every local delete.
//!
//! # Invariants
//! - Tombstones are additive: once present, no upsert may resurrect the id
//!   until `clear_all` (or an explicit `unmark_deleted`).
//! - `mark_deleted` writes the tombstone and its outbox row in one transaction.
//! - All operations are idempotent.

use crate::db::{lock, DbError, DbResult, SharedConnection};
use crate::model::entity::{EntityId, EntityKind};
use crate::sync::clock::Clock;
use crate::sync::outbox::{discard_in, enqueue_in, OutboxOp};
use log::{debug, info};
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tombstone {
    pub kind: EntityKind,
    pub entity_id: EntityId,
    pub deleted_at: i64,
}

#[derive(Clone)]
pub struct TombstoneLedger {
    conn: SharedConnection,
    clock: Arc<dyn Clock>,
}

impl TombstoneLedger {
    pub fn new(conn: SharedConnection, clock: Arc<dyn Clock>) -> Self {
        Self { conn, clock }
    }

    /// Records a local delete and enqueues its deletion marker.
    ///
    /// Returns `true` when the id was not tombstoned before.
    pub fn mark_deleted(&self, kind: EntityKind, id: EntityId) -> DbResult<bool> {
        let now = self.clock.now_ms();
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO tombstones (kind, entity_id, deleted_at) VALUES (?1, ?2, ?3);",
            params![kind.as_str(), id.to_string(), now],
        )? > 0;
        if inserted {
            enqueue_in(&tx, kind, id, OutboxOp::Delete, now)?;
        }
        tx.commit()?;

        if inserted {
            info!("event=tombstone_mark module=tombstone status=ok kind={kind} origin=local");
        }
        Ok(inserted)
    }

    /// Records a tombstone learned from another device. No marker is
    /// enqueued and any pending local write for the id is dropped.
    pub fn record_remote(&self, kind: EntityKind, id: EntityId, deleted_at: i64) -> DbResult<bool> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO tombstones (kind, entity_id, deleted_at) VALUES (?1, ?2, ?3);",
            params![kind.as_str(), id.to_string(), deleted_at],
        )? > 0;
        discard_in(&tx, kind, id)?;
        tx.commit()?;

        if inserted {
            debug!("event=tombstone_mark module=tombstone status=ok kind={kind} origin=remote");
        }
        Ok(inserted)
    }

    pub fn is_deleted(&self, kind: EntityKind, id: EntityId) -> DbResult<bool> {
        let conn = lock(&self.conn)?;
        let found = conn
            .query_row(
                "SELECT 1 FROM tombstones WHERE kind = ?1 AND entity_id = ?2;",
                params![kind.as_str(), id.to_string()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn tombstone(&self, kind: EntityKind, id: EntityId) -> DbResult<Option<Tombstone>> {
        let conn = lock(&self.conn)?;
        let deleted_at = conn
            .query_row(
                "SELECT deleted_at FROM tombstones WHERE kind = ?1 AND entity_id = ?2;",
                params![kind.as_str(), id.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(deleted_at.map(|deleted_at| Tombstone {
            kind,
            entity_id: id,
            deleted_at,
        }))
    }

    /// Removes one tombstone and any pending marker for it.
    pub fn unmark_deleted(&self, kind: EntityKind, id: EntityId) -> DbResult<bool> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM tombstones WHERE kind = ?1 AND entity_id = ?2;",
            params![kind.as_str(), id.to_string()],
        )? > 0;
        tx.execute(
            "DELETE FROM outbox WHERE kind = ?1 AND entity_id = ?2 AND op = 'delete';",
            params![kind.as_str(), id.to_string()],
        )?;
        tx.commit()?;
        if removed {
            info!("event=tombstone_unmark module=tombstone status=ok kind={kind}");
        }
        Ok(removed)
    }

    /// Tombstoned ids of one kind.
    pub fn deleted_ids(&self, kind: EntityKind) -> DbResult<BTreeSet<EntityId>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare("SELECT entity_id FROM tombstones WHERE kind = ?1;")?;
        let mut rows = stmt.query([kind.as_str()])?;
        let mut ids = BTreeSet::new();
        while let Some(row) = rows.next()? {
            let text: String = row.get(0)?;
            ids.insert(parse_id(&text)?);
        }
        Ok(ids)
    }

    pub fn list(&self) -> DbResult<Vec<Tombstone>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT kind, entity_id, deleted_at FROM tombstones ORDER BY deleted_at ASC, entity_id ASC;",
        )?;
        let mut rows = stmt.query([])?;
        let mut tombstones = Vec::new();
        while let Some(row) = rows.next()? {
            let kind_text: String = row.get(0)?;
            let id_text: String = row.get(1)?;
            tombstones.push(Tombstone {
                kind: EntityKind::parse(&kind_text).ok_or_else(|| {
                    DbError::InvalidData(format!("unknown kind `{kind_text}` in tombstones.kind"))
                })?,
                entity_id: parse_id(&id_text)?,
                deleted_at: row.get(2)?,
            });
        }
        Ok(tombstones)
    }

    /// Full reset. Returns the number of tombstones removed.
    pub fn clear_all(&self) -> DbResult<usize> {
        let conn = lock(&self.conn)?;
        let removed = conn.execute("DELETE FROM tombstones;", [])?;
        info!("event=tombstone_clear module=tombstone status=ok removed={removed}");
        Ok(removed)
    }
}

fn parse_id(text: &str) -> DbResult<EntityId> {
    Uuid::parse_str(text)
        .map_err(|_| DbError::InvalidData(format!("invalid uuid `{text}` in tombstones.entity_id")))
}
