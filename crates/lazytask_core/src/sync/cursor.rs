//! Per-zone sync cursor store.
//!
//! # Invariants
//! - A cursor is written only after its batch was applied locally; callers
//!   enforce ordering, this store only persists.
//! - `clear` forces the next fetch to be a full fetch.

use crate::db::{lock, DbResult, SharedConnection};
use crate::sync::remote::{SyncCursor, ZoneId};
use log::info;
use rusqlite::{params, OptionalExtension};

#[derive(Clone)]
pub struct SyncCursorStore {
    conn: SharedConnection,
}

impl SyncCursorStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    pub fn get(&self, zone: &ZoneId) -> DbResult<Option<SyncCursor>> {
        let conn = lock(&self.conn)?;
        let cursor = conn
            .query_row(
                "SELECT cursor FROM sync_cursors WHERE zone_id = ?1;",
                [zone.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(cursor.map(SyncCursor))
    }

    pub fn set(&self, zone: &ZoneId, cursor: &SyncCursor, now_ms: i64) -> DbResult<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO sync_cursors (zone_id, cursor, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(zone_id) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at;",
            params![zone.as_str(), cursor.as_str(), now_ms],
        )?;
        Ok(())
    }

    /// Removes the cursor for one zone. Returns whether one existed.
    pub fn clear(&self, zone: &ZoneId) -> DbResult<bool> {
        let conn = lock(&self.conn)?;
        let removed = conn.execute("DELETE FROM sync_cursors WHERE zone_id = ?1;", [zone.as_str()])?;
        if removed > 0 {
            info!("event=cursor_clear module=cursor status=ok zone={zone}");
        }
        Ok(removed > 0)
    }

    pub fn clear_all(&self) -> DbResult<usize> {
        let conn = lock(&self.conn)?;
        Ok(conn.execute("DELETE FROM sync_cursors;", [])?)
    }
}
