//! Remote record store boundary.
//!
//! # Responsibility
//! - Describe the opaque record/zone API the engine talks to.
//! - Carry remote failures as an envelope until the fetcher or pipeline
//!   translates them into `SyncError`.
//!
//! # Invariants
//! - Every blocking call receives the cycle's `CancelToken`.
//! - `record_id` of an entity record is the bare entity UUID string.

use crate::sync::cancel::CancelToken;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

pub type RemoteResult<T> = Result<T, RemoteErrorEnvelope>;

/// Logical partition of the remote store holding one account's records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneId(pub String);

impl ZoneId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ZoneId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque change token marking how far remote changes were consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor(pub String);

impl SyncCursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One record as stored remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub record_id: String,
    pub record_type: String,
    /// Server-assigned version used for optimistic concurrency; `None` when
    /// the record is being created.
    pub change_tag: Option<String>,
    pub modified_at: i64,
    pub fields: serde_json::Value,
}

/// One page of changes since a cursor.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FetchedChanges {
    pub records: Vec<RemoteRecord>,
    /// Bare ids of hard-deleted records; kind is not reported.
    pub deleted_ids: Vec<String>,
    pub new_cursor: Option<SyncCursor>,
    pub more_coming: bool,
}

/// Sync stage in which a remote failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    Fetch,
    Push,
    Delete,
    Zone,
    Subscribe,
}

impl SyncStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Push => "push",
            Self::Delete => "delete",
            Self::Zone => "zone",
            Self::Subscribe => "subscribe",
        }
    }
}

/// Well-known remote error codes. Adapters may report others.
pub mod codes {
    pub const NETWORK_FAILURE: &str = "network_failure";
    pub const TIMEOUT: &str = "timeout";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const SERVICE_BUSY: &str = "service_busy";
    pub const SERVER_RECORD_CHANGED: &str = "server_record_changed";
    pub const CHANGE_TOKEN_EXPIRED: &str = "change_token_expired";
    pub const ZONE_NOT_FOUND: &str = "zone_not_found";
    pub const RECORD_NOT_FOUND: &str = "record_not_found";
    pub const NOT_AUTHENTICATED: &str = "not_authenticated";
    pub const QUOTA_EXCEEDED: &str = "quota_exceeded";
    pub const CANCELLED: &str = "cancelled";
}

/// Raw failure reported by a remote adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteErrorEnvelope {
    pub stage: SyncStage,
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub retry_after_ms: Option<u64>,
    /// Current server copy, when a conflict response carries it.
    pub server_record: Option<Box<RemoteRecord>>,
}

impl RemoteErrorEnvelope {
    pub fn new(
        stage: SyncStage,
        code: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self {
            stage,
            code: code.into(),
            message: message.into(),
            retryable,
            retry_after_ms: None,
            server_record: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }

    pub fn with_server_record(mut self, record: RemoteRecord) -> Self {
        self.server_record = Some(Box::new(record));
        self
    }

    pub fn conflict(stage: SyncStage, server_record: Option<RemoteRecord>) -> Self {
        let envelope = Self::new(
            stage,
            codes::SERVER_RECORD_CHANGED,
            "record changed on server",
            false,
        );
        match server_record {
            Some(record) => envelope.with_server_record(record),
            None => envelope,
        }
    }

    pub fn cancelled(stage: SyncStage) -> Self {
        Self::new(stage, codes::CANCELLED, "operation cancelled", false)
    }
}

impl Display for RemoteErrorEnvelope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "remote {} failed ({}): {}",
            self.stage.as_str(),
            self.code,
            self.message
        )
    }
}

/// Opaque remote record/zone API.
///
/// Implementations are expected to be blocking request/response calls; the
/// engine treats each call as a suspension point and passes the cycle's token.
pub trait RemoteRecordStore: Send + Sync {
    /// Returns changes since `cursor`, or every record when `cursor` is `None`.
    fn fetch_changes(
        &self,
        zone: &ZoneId,
        cursor: Option<&SyncCursor>,
        limit: u32,
        cancel: &CancelToken,
    ) -> RemoteResult<FetchedChanges>;

    /// Reads the current server copy of one record.
    fn fetch_record(
        &self,
        zone: &ZoneId,
        record_id: &str,
        cancel: &CancelToken,
    ) -> RemoteResult<Option<RemoteRecord>>;

    /// Saves a record. Rejects with `server_record_changed` when `change_tag`
    /// does not match the server copy.
    fn push(
        &self,
        zone: &ZoneId,
        record: &RemoteRecord,
        cancel: &CancelToken,
    ) -> RemoteResult<RemoteRecord>;

    fn delete(&self, zone: &ZoneId, record_id: &str, cancel: &CancelToken) -> RemoteResult<()>;

    fn ensure_zone(&self, zone: &ZoneId, cancel: &CancelToken) -> RemoteResult<()>;

    fn subscribe_to_changes(&self, zone: &ZoneId) -> RemoteResult<()>;
}
