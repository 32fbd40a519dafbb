//! Persisted user preferences that shape engine state.

use crate::db::{lock, DbResult, SharedConnection};
use rusqlite::{params, OptionalExtension};

const SYNC_ENABLED_KEY: &str = "sync_enabled";

#[derive(Clone)]
pub struct EnginePrefs {
    conn: SharedConnection,
}

impl EnginePrefs {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Sync is enabled unless the user turned it off.
    pub fn sync_enabled(&self) -> DbResult<bool> {
        let conn = lock(&self.conn)?;
        let value = conn
            .query_row(
                "SELECT value FROM engine_prefs WHERE key = ?1;",
                [SYNC_ENABLED_KEY],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value.as_deref() != Some("false"))
    }

    pub fn set_sync_enabled(&self, enabled: bool) -> DbResult<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO engine_prefs (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
            params![SYNC_ENABLED_KEY, if enabled { "true" } else { "false" }],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::EnginePrefs;
    use crate::db::{open_db_in_memory, share};

    #[test]
    fn defaults_to_enabled_and_persists_toggle() {
        let prefs = EnginePrefs::new(share(open_db_in_memory().unwrap()));
        assert!(prefs.sync_enabled().unwrap());
        prefs.set_sync_enabled(false).unwrap();
        assert!(!prefs.sync_enabled().unwrap());
        prefs.set_sync_enabled(true).unwrap();
        assert!(prefs.sync_enabled().unwrap());
    }
}
