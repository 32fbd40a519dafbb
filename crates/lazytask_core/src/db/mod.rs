//! SQLite storage for durable sync-engine state.
//!
//! # Responsibility
//! - Open and configure the engine-state database (tombstones, cursors,
//!   record index, outbox, preferences).
//! - Apply schema migrations in deterministic order.
//! - Share one connection between engine components behind a mutex.
//!
//! # Invariants
//! - Migration version is tracked via `PRAGMA user_version`.
//! - Engine components must not touch state before migrations succeed.
//! - Every read-modify-write happens while holding the connection lock.

use rusqlite::Connection;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard};

pub mod migrations;
mod open;

pub use open::{open_db, open_db_in_memory};

pub type DbResult<T> = Result<T, DbError>;

/// Connection handle shared by ledger, cursor store, record index and outbox.
pub type SharedConnection = Arc<Mutex<Connection>>;

#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },
    /// A thread panicked while holding the connection lock.
    LockPoisoned,
    /// Persisted value cannot be converted back into its domain type.
    InvalidData(String),
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::UnsupportedSchemaVersion {
                db_version,
                latest_supported,
            } => write!(
                f,
                "database schema version {db_version} is newer than supported {latest_supported}"
            ),
            Self::LockPoisoned => write!(f, "engine state connection lock is poisoned"),
            Self::InvalidData(message) => write!(f, "invalid persisted sync state: {message}"),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::UnsupportedSchemaVersion { .. } | Self::LockPoisoned | Self::InvalidData(_) => {
                None
            }
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

/// Wraps a migrated connection for sharing across engine components.
pub fn share(conn: Connection) -> SharedConnection {
    Arc::new(Mutex::new(conn))
}

/// Acquires the shared connection.
pub fn lock(conn: &SharedConnection) -> DbResult<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|_| DbError::LockPoisoned)
}
