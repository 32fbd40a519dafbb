//! Collaborators injected into the engine.

use crate::db::SharedConnection;
use crate::sync::clock::{Clock, Sleeper, SystemClock, ThreadSleeper};
use crate::sync::local_store::LocalStore;
use crate::sync::remote::RemoteRecordStore;
use std::sync::Arc;

/// Everything the engine reads from or writes to outside itself.
#[derive(Clone)]
pub struct SyncEnv {
    pub local: Arc<dyn LocalStore>,
    pub remote: Arc<dyn RemoteRecordStore>,
    /// Engine-state database (tombstones, cursors, record index, outbox).
    pub state_db: SharedConnection,
    pub clock: Arc<dyn Clock>,
    pub sleeper: Arc<dyn Sleeper>,
}

impl SyncEnv {
    /// Wall clock and real sleeps.
    pub fn system(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteRecordStore>,
        state_db: SharedConnection,
    ) -> Self {
        Self {
            local,
            remote,
            state_db,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(ThreadSleeper),
        }
    }
}
