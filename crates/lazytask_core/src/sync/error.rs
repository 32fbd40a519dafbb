//! Sync error taxonomy.
//!
//! # Invariants
//! - Remote envelopes are translated here and never reach the orchestrator.
//! - Only `Transient` errors are plain-backoff retryable.

use crate::config::ConfigError;
use crate::db::DbError;
use crate::sync::local_store::LocalStoreError;
use crate::sync::remote::{codes, RemoteErrorEnvelope, RemoteRecord};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug)]
pub enum SyncError {
    /// Network, rate limit, server busy or timeout.
    Transient {
        code: String,
        message: String,
        retry_after_ms: Option<u64>,
    },
    /// A write lost a race; resolved by merge-and-resubmit.
    Conflict {
        server_record: Option<Box<RemoteRecord>>,
    },
    /// The stored cursor was rejected; a full fetch is required.
    CursorInvalid,
    /// The remote zone does not exist; it must be recreated.
    ZoneMissing,
    NotFound(String),
    Auth(String),
    Quota(String),
    /// Non-retryable remote failure with an unrecognized code.
    Rejected {
        code: String,
        message: String,
    },
    /// Conflict retries for one record hit the ceiling.
    RetriesExhausted {
        record_id: String,
        attempts: u32,
    },
    Cancelled,
    /// A remote record could not be decoded into an entity.
    Decode {
        record_id: String,
        message: String,
    },
    LocalStore(LocalStoreError),
    Db(DbError),
    Config(ConfigError),
}

impl SyncError {
    /// Translates a remote envelope into the engine taxonomy.
    pub fn from_remote(envelope: RemoteErrorEnvelope) -> Self {
        match envelope.code.as_str() {
            codes::SERVER_RECORD_CHANGED => Self::Conflict {
                server_record: envelope.server_record,
            },
            codes::CHANGE_TOKEN_EXPIRED => Self::CursorInvalid,
            codes::ZONE_NOT_FOUND => Self::ZoneMissing,
            codes::RECORD_NOT_FOUND => Self::NotFound(envelope.message),
            codes::NOT_AUTHENTICATED => Self::Auth(envelope.message),
            codes::QUOTA_EXCEEDED => Self::Quota(envelope.message),
            codes::CANCELLED => Self::Cancelled,
            codes::NETWORK_FAILURE | codes::TIMEOUT | codes::RATE_LIMITED | codes::SERVICE_BUSY => {
                Self::transient(envelope)
            }
            _ if envelope.retryable => Self::transient(envelope),
            _ => Self::Rejected {
                code: envelope.code,
                message: envelope.message,
            },
        }
    }

    fn transient(envelope: RemoteErrorEnvelope) -> Self {
        Self::Transient {
            code: envelope.code,
            message: envelope.message,
            retry_after_ms: envelope.retry_after_ms,
        }
    }

    /// Whether an automatic sync retry may help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. }
                | Self::Conflict { .. }
                | Self::CursorInvalid
                | Self::ZoneMissing
                | Self::RetriesExhausted { .. }
        )
    }

    /// Stable short code used in logs.
    pub fn code(&self) -> &str {
        match self {
            Self::Transient { code, .. } => code.as_str(),
            Self::Conflict { .. } => "conflict",
            Self::CursorInvalid => "cursor_invalid",
            Self::ZoneMissing => "zone_missing",
            Self::NotFound(_) => "not_found",
            Self::Auth(_) => "auth",
            Self::Quota(_) => "quota",
            Self::Rejected { code, .. } => code.as_str(),
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Cancelled => "cancelled",
            Self::Decode { .. } => "decode_failed",
            Self::LocalStore(_) => "local_store",
            Self::Db(_) => "state_db",
            Self::Config(_) => "config",
        }
    }

    /// Human-readable reason shown through `SyncState::Error`.
    pub fn user_reason(&self) -> String {
        match self {
            Self::Transient { .. } => "Network unavailable; will retry.".to_string(),
            Self::Auth(_) => "Sign in to your account to sync.".to_string(),
            Self::Quota(_) => "Cloud storage is full.".to_string(),
            Self::RetriesExhausted { .. } | Self::Conflict { .. } => {
                "Some changes could not be uploaded; will retry.".to_string()
            }
            other => format!("Sync failed: {other}"),
        }
    }
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient { code, message, .. } => {
                write!(f, "transient remote failure ({code}): {message}")
            }
            Self::Conflict { .. } => write!(f, "write conflict with server copy"),
            Self::CursorInvalid => write!(f, "sync cursor expired or invalid"),
            Self::ZoneMissing => write!(f, "remote zone is missing"),
            Self::NotFound(message) => write!(f, "remote record not found: {message}"),
            Self::Auth(message) => write!(f, "remote authentication failed: {message}"),
            Self::Quota(message) => write!(f, "remote quota exceeded: {message}"),
            Self::Rejected { code, message } => write!(f, "remote rejected ({code}): {message}"),
            Self::RetriesExhausted {
                record_id,
                attempts,
            } => write!(f, "push of {record_id} still conflicting after {attempts} attempts"),
            Self::Cancelled => write!(f, "sync cancelled"),
            Self::Decode { record_id, message } => {
                write!(f, "cannot decode remote record {record_id}: {message}")
            }
            Self::LocalStore(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::Config(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::LocalStore(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::Config(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for SyncError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<ConfigError> for SyncError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<LocalStoreError> for SyncError {
    fn from(value: LocalStoreError) -> Self {
        Self::LocalStore(value)
    }
}

impl From<RemoteErrorEnvelope> for SyncError {
    fn from(value: RemoteErrorEnvelope) -> Self {
        Self::from_remote(value)
    }
}

#[cfg(test)]
mod tests {
    use super::SyncError;
    use crate::sync::remote::{codes, RemoteErrorEnvelope, SyncStage};

    #[test]
    fn translates_known_codes() {
        let conflict = SyncError::from_remote(RemoteErrorEnvelope::conflict(SyncStage::Push, None));
        assert!(matches!(conflict, SyncError::Conflict { .. }));

        let expired = SyncError::from_remote(RemoteErrorEnvelope::new(
            SyncStage::Fetch,
            codes::CHANGE_TOKEN_EXPIRED,
            "expired",
            false,
        ));
        assert!(matches!(expired, SyncError::CursorInvalid));

        let zone = SyncError::from_remote(RemoteErrorEnvelope::new(
            SyncStage::Fetch,
            codes::ZONE_NOT_FOUND,
            "gone",
            false,
        ));
        assert!(matches!(zone, SyncError::ZoneMissing));

        let busy = SyncError::from_remote(
            RemoteErrorEnvelope::new(SyncStage::Push, codes::RATE_LIMITED, "slow down", true)
                .with_retry_after(3_000),
        );
        assert!(matches!(
            busy,
            SyncError::Transient {
                retry_after_ms: Some(3_000),
                ..
            }
        ));
    }

    #[test]
    fn unknown_codes_follow_retryable_flag() {
        let retryable = SyncError::from_remote(RemoteErrorEnvelope::new(
            SyncStage::Push,
            "weird_hiccup",
            "?",
            true,
        ));
        assert!(retryable.is_retryable());

        let fatal = SyncError::from_remote(RemoteErrorEnvelope::new(
            SyncStage::Push,
            "bad_request",
            "schema",
            false,
        ));
        assert!(matches!(fatal, SyncError::Rejected { .. }));
        assert!(!fatal.is_retryable());
    }

    #[test]
    fn auth_and_quota_are_not_retryable() {
        let auth = SyncError::from_remote(RemoteErrorEnvelope::new(
            SyncStage::Fetch,
            codes::NOT_AUTHENTICATED,
            "no account",
            false,
        ));
        assert!(!auth.is_retryable());
        assert_eq!(auth.user_reason(), "Sign in to your account to sync.");

        let quota = SyncError::from_remote(RemoteErrorEnvelope::new(
            SyncStage::Push,
            codes::QUOTA_EXCEEDED,
            "full",
            false,
        ));
        assert!(!quota.is_retryable());
    }
}
