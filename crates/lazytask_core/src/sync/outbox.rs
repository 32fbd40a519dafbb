//! Durable queue of pending remote writes.
//!
//! # Responsibility
//! - Remember every local upsert/delete until the remote acknowledges it, so
//!   a failed push degrades to "retry on next sync".
//!
//! # Invariants
//! - One row per `(kind, entity_id)`; the latest intent wins, except that a
//!   pending delete is never downgraded to an upsert.
//! - `complete` only removes the row when the op still matches, so an intent
//!   enqueued while a push was in flight is not lost.

use crate::db::{lock, DbError, DbResult, SharedConnection};
use crate::model::entity::{EntityId, EntityKind};
use rusqlite::{params, Connection};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxOp {
    Upsert,
    /// Push the deletion marker, then hard-delete the remote record.
    Delete,
}

impl OutboxOp {
    fn as_str(self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "upsert" => Some(Self::Upsert),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub kind: EntityKind,
    pub entity_id: EntityId,
    pub op: OutboxOp,
    pub enqueued_at: i64,
    pub attempts: u32,
}

/// SQLite-backed outbox sharing the engine-state connection.
#[derive(Clone)]
pub struct Outbox {
    conn: SharedConnection,
}

impl Outbox {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    pub fn enqueue(
        &self,
        kind: EntityKind,
        entity_id: EntityId,
        op: OutboxOp,
        now_ms: i64,
    ) -> DbResult<()> {
        let conn = lock(&self.conn)?;
        enqueue_in(&conn, kind, entity_id, op, now_ms)
    }

    /// Removes the row if it still carries `op`. Returns whether it was removed.
    pub fn complete(&self, kind: EntityKind, entity_id: EntityId, op: OutboxOp) -> DbResult<bool> {
        let conn = lock(&self.conn)?;
        let removed = conn.execute(
            "DELETE FROM outbox WHERE kind = ?1 AND entity_id = ?2 AND op = ?3;",
            params![kind.as_str(), entity_id.to_string(), op.as_str()],
        )?;
        Ok(removed > 0)
    }

    /// Drops any pending write for the entity.
    pub fn discard(&self, kind: EntityKind, entity_id: EntityId) -> DbResult<()> {
        let conn = lock(&self.conn)?;
        discard_in(&conn, kind, entity_id)
    }

    pub fn record_attempt(&self, kind: EntityKind, entity_id: EntityId) -> DbResult<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "UPDATE outbox SET attempts = attempts + 1 WHERE kind = ?1 AND entity_id = ?2;",
            params![kind.as_str(), entity_id.to_string()],
        )?;
        Ok(())
    }

    /// Pending writes, oldest first.
    pub fn pending(&self) -> DbResult<Vec<PendingWrite>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT kind, entity_id, op, enqueued_at, attempts
             FROM outbox
             ORDER BY enqueued_at ASC, kind ASC, entity_id ASC;",
        )?;
        let mut rows = stmt.query([])?;
        let mut pending = Vec::new();
        while let Some(row) = rows.next()? {
            let kind_text: String = row.get(0)?;
            let id_text: String = row.get(1)?;
            let op_text: String = row.get(2)?;
            pending.push(PendingWrite {
                kind: EntityKind::parse(&kind_text).ok_or_else(|| {
                    DbError::InvalidData(format!("unknown kind `{kind_text}` in outbox.kind"))
                })?,
                entity_id: Uuid::parse_str(&id_text).map_err(|_| {
                    DbError::InvalidData(format!("invalid uuid `{id_text}` in outbox.entity_id"))
                })?,
                op: OutboxOp::parse(&op_text).ok_or_else(|| {
                    DbError::InvalidData(format!("unknown op `{op_text}` in outbox.op"))
                })?,
                enqueued_at: row.get(3)?,
                attempts: row.get(4)?,
            });
        }
        Ok(pending)
    }

    pub fn len(&self) -> DbResult<usize> {
        let conn = lock(&self.conn)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM outbox;", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    pub fn is_empty(&self) -> DbResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn clear(&self) -> DbResult<usize> {
        let conn = lock(&self.conn)?;
        Ok(conn.execute("DELETE FROM outbox;", [])?)
    }
}

/// Enqueues on an already-locked connection, so callers can combine it with
/// other writes in one transaction.
pub(crate) fn enqueue_in(
    conn: &Connection,
    kind: EntityKind,
    entity_id: EntityId,
    op: OutboxOp,
    now_ms: i64,
) -> DbResult<()> {
    conn.execute(
        "INSERT INTO outbox (kind, entity_id, op, enqueued_at, attempts)
         VALUES (?1, ?2, ?3, ?4, 0)
         ON CONFLICT(kind, entity_id) DO UPDATE SET
            op = CASE WHEN outbox.op = 'delete' THEN 'delete' ELSE excluded.op END,
            enqueued_at = excluded.enqueued_at;",
        params![kind.as_str(), entity_id.to_string(), op.as_str(), now_ms],
    )?;
    Ok(())
}

pub(crate) fn discard_in(conn: &Connection, kind: EntityKind, entity_id: EntityId) -> DbResult<()> {
    conn.execute(
        "DELETE FROM outbox WHERE kind = ?1 AND entity_id = ?2;",
        params![kind.as_str(), entity_id.to_string()],
    )?;
    Ok(())
}
