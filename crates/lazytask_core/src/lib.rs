//! Sync and conflict-resolution engine for LazyTask.
//! The local store stays authoritative; this crate keeps it convergent with
//! one remote record zone.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod sync;

pub use config::{ConfigError, PointsMergePolicy, SyncConfig, TaskTieBreak};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::entity::{
    AttachmentKind, Category, CompletionRecord, DayKey, Entity, EntityId, EntityKind,
    JournalAttachment, JournalEntry, PointsHistoryEntry, Reward, Subtask, Task, TrackingSession,
};
pub use sync::cancel::CancelToken;
pub use sync::clock::{Clock, Sleeper, SystemClock, ThreadSleeper};
pub use sync::env::SyncEnv;
pub use sync::error::{SyncError, SyncResult};
pub use sync::local_store::{InMemoryLocalStore, LocalStore, LocalStoreError};
pub use sync::orchestrator::{SkipReason, SyncOrchestrator, SyncOutcome, SyncReport, SyncTrigger};
pub use sync::pipeline::PushOutcome;
pub use sync::remote::{
    FetchedChanges, RemoteErrorEnvelope, RemoteRecord, RemoteRecordStore, RemoteResult,
    SyncCursor, SyncStage, ZoneId,
};
pub use sync::state::{SyncObserver, SyncState, SyncStatus};
