//! Durable record-id index.
//!
//! # Responsibility
//! - Map remote record ids to entity kinds, because hard deletes arrive as
//!   bare ids.
//! - Remember the last server change tag per record for optimistic pushes.
//!
//! # Invariants
//! - Owned by the change fetcher; the write pipeline only updates tags.
//! - Entries for tombstoned ids may be pruned: their deletion marker already
//!   names the kind.

use crate::db::{lock, DbError, DbResult, SharedConnection};
use crate::model::entity::EntityKind;
use log::info;
use rusqlite::{params, OptionalExtension};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub kind: EntityKind,
    pub change_tag: Option<String>,
}

#[derive(Clone)]
pub struct RecordIndex {
    conn: SharedConnection,
}

impl RecordIndex {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Records the kind and latest change tag of a record.
    pub fn record(
        &self,
        record_id: &str,
        kind: EntityKind,
        change_tag: Option<&str>,
        now_ms: i64,
    ) -> DbResult<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO record_index (record_id, kind, change_tag, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(record_id) DO UPDATE SET
                kind = excluded.kind,
                change_tag = excluded.change_tag,
                updated_at = excluded.updated_at;",
            params![record_id, kind.as_str(), change_tag, now_ms],
        )?;
        Ok(())
    }

    /// Records only the kind, keeping any known change tag. Used at fetch
    /// time, before the record is applied.
    pub fn record_kind(&self, record_id: &str, kind: EntityKind, now_ms: i64) -> DbResult<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO record_index (record_id, kind, change_tag, updated_at) VALUES (?1, ?2, NULL, ?3)
             ON CONFLICT(record_id) DO UPDATE SET
                kind = excluded.kind,
                updated_at = excluded.updated_at;",
            params![record_id, kind.as_str(), now_ms],
        )?;
        Ok(())
    }

    pub fn lookup(&self, record_id: &str) -> DbResult<Option<IndexEntry>> {
        let conn = lock(&self.conn)?;
        let row = conn
            .query_row(
                "SELECT kind, change_tag FROM record_index WHERE record_id = ?1;",
                [record_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()?;
        match row {
            Some((kind_text, change_tag)) => {
                let kind = EntityKind::parse(&kind_text).ok_or_else(|| {
                    DbError::InvalidData(format!("unknown kind `{kind_text}` in record_index.kind"))
                })?;
                Ok(Some(IndexEntry { kind, change_tag }))
            }
            None => Ok(None),
        }
    }

    pub fn kind_of(&self, record_id: &str) -> DbResult<Option<EntityKind>> {
        Ok(self.lookup(record_id)?.map(|entry| entry.kind))
    }

    pub fn change_tag(&self, record_id: &str) -> DbResult<Option<String>> {
        Ok(self.lookup(record_id)?.and_then(|entry| entry.change_tag))
    }

    /// Forgets the change tag so the next push creates the record.
    pub fn clear_change_tag(&self, record_id: &str) -> DbResult<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "UPDATE record_index SET change_tag = NULL WHERE record_id = ?1;",
            [record_id],
        )?;
        Ok(())
    }

    pub fn remove(&self, record_id: &str) -> DbResult<()> {
        let conn = lock(&self.conn)?;
        conn.execute("DELETE FROM record_index WHERE record_id = ?1;", [record_id])?;
        Ok(())
    }

    /// Drops entries whose `(kind, id)` is tombstoned. Returns the count.
    pub fn prune_tombstoned(&self) -> DbResult<usize> {
        let conn = lock(&self.conn)?;
        let pruned = conn.execute(
            "DELETE FROM record_index
             WHERE EXISTS (
                SELECT 1 FROM tombstones
                WHERE tombstones.kind = record_index.kind
                  AND tombstones.entity_id = record_index.record_id
             );",
            [],
        )?;
        if pruned > 0 {
            info!("event=record_index_prune module=record_index status=ok pruned={pruned}");
        }
        Ok(pruned)
    }

    pub fn clear(&self) -> DbResult<usize> {
        let conn = lock(&self.conn)?;
        Ok(conn.execute("DELETE FROM record_index;", params![])?)
    }
}

#[cfg(test)]
mod tests {
    use super::RecordIndex;
    use crate::db::{open_db_in_memory, share};
    use crate::model::entity::EntityKind;
    use crate::sync::clock::ManualClock;
    use crate::sync::tombstone::TombstoneLedger;
    use std::sync::Arc;
    use uuid::Uuid;

    #[test]
    fn records_kind_and_change_tag() {
        let index = RecordIndex::new(share(open_db_in_memory().unwrap()));
        index.record("abc", EntityKind::Reward, Some("t1"), 1).unwrap();
        assert_eq!(index.kind_of("abc").unwrap(), Some(EntityKind::Reward));
        assert_eq!(index.change_tag("abc").unwrap().as_deref(), Some("t1"));

        index.clear_change_tag("abc").unwrap();
        assert!(index.change_tag("abc").unwrap().is_none());
        assert_eq!(index.kind_of("abc").unwrap(), Some(EntityKind::Reward));
        assert!(index.kind_of("missing").unwrap().is_none());
    }

    #[test]
    fn prune_drops_only_tombstoned_entries() {
        let conn = share(open_db_in_memory().unwrap());
        let index = RecordIndex::new(conn.clone());
        let ledger = TombstoneLedger::new(conn, Arc::new(ManualClock::new(0)));
        let dead = Uuid::new_v4();
        let alive = Uuid::new_v4();
        index.record(&dead.to_string(), EntityKind::Task, None, 1).unwrap();
        index.record(&alive.to_string(), EntityKind::Task, None, 1).unwrap();
        ledger.mark_deleted(EntityKind::Task, dead).unwrap();

        assert_eq!(index.prune_tombstoned().unwrap(), 1);
        assert!(index.kind_of(&dead.to_string()).unwrap().is_none());
        assert!(index.kind_of(&alive.to_string()).unwrap().is_some());
    }
}
