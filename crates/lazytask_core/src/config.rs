//! Sync engine configuration.
//!
//! # Responsibility
//! - Hold every tunable threshold of the engine in one place.
//! - Parse host-provided JSON configuration with per-field defaults.
//!
//! # Invariants
//! - `validate()` must pass before a config reaches the orchestrator.
//! - Durations are stored in milliseconds.

use serde::Deserialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

const DEFAULT_ZONE_ID: &str = "lazytask_zone";
const DEFAULT_MIN_SYNC_INTERVAL_MS: u64 = 5_000;
const DEFAULT_MAX_PUSH_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;
const DEFAULT_FAILURE_COOLDOWN_MS: u64 = 5 * 60 * 1_000;
const DEFAULT_CURSOR_RETRY_DELAY_MS: u64 = 1_000;
const DEFAULT_RECOVERY_RETRY_DELAY_MS: u64 = 2_000;
const DEFAULT_JOURNAL_CONCURRENCY_WINDOW_MS: i64 = 120_000;
const DEFAULT_FETCH_PAGE_LIMIT: u32 = 200;

/// Resolution for tasks whose `last_modified` values are exactly equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskTieBreak {
    /// Start from the remote copy, then overlay completions.
    #[default]
    PreferRemote,
    /// Start from the copy with higher priority; remote when equal.
    HigherPriority,
}

/// Per-day points merge rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointsMergePolicy {
    /// Keep the larger total. Safe under redelivery; drops lower corrections.
    #[default]
    MaxPerDay,
    /// Newer `last_modified` wins, so corrections downward propagate.
    LastModifiedWins,
}

/// Engine thresholds and policies.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Remote zone holding every record of this account.
    pub zone_id: String,
    /// Minimum spacing between automatic sync attempts.
    pub min_sync_interval_ms: u64,
    /// Total push attempts for one entity before giving up.
    pub max_push_attempts: u32,
    /// Backoff before retry `n` is `backoff_base_ms * 2^n`.
    pub backoff_base_ms: u64,
    /// Failed cycles tolerated before automatic syncs are suppressed.
    pub max_consecutive_failures: u32,
    pub failure_cooldown_ms: u64,
    /// Pause before the full refetch that follows an expired cursor.
    pub cursor_retry_delay_ms: u64,
    /// Pause before the single recovery retry of a failed cycle.
    pub recovery_retry_delay_ms: u64,
    /// Journal edits closer than this are merged field by field.
    pub journal_concurrency_window_ms: i64,
    pub task_tie_break: TaskTieBreak,
    pub points_merge_policy: PointsMergePolicy,
    pub fetch_page_limit: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            zone_id: DEFAULT_ZONE_ID.to_string(),
            min_sync_interval_ms: DEFAULT_MIN_SYNC_INTERVAL_MS,
            max_push_attempts: DEFAULT_MAX_PUSH_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            failure_cooldown_ms: DEFAULT_FAILURE_COOLDOWN_MS,
            cursor_retry_delay_ms: DEFAULT_CURSOR_RETRY_DELAY_MS,
            recovery_retry_delay_ms: DEFAULT_RECOVERY_RETRY_DELAY_MS,
            journal_concurrency_window_ms: DEFAULT_JOURNAL_CONCURRENCY_WINDOW_MS,
            task_tie_break: TaskTieBreak::default(),
            points_merge_policy: PointsMergePolicy::default(),
            fetch_page_limit: DEFAULT_FETCH_PAGE_LIMIT,
        }
    }
}

/// Configuration parse/validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Parse(String),
    Invalid {
        field: &'static str,
        message: &'static str,
    },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(message) => write!(f, "sync config is not valid JSON: {message}"),
            Self::Invalid { field, message } => write!(f, "sync config `{field}` {message}"),
        }
    }
}

impl Error for ConfigError {}

impl SyncConfig {
    /// Parses JSON config; missing fields fall back to defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.zone_id.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "zone_id",
                message: "must not be blank",
            });
        }
        if self.max_push_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "max_push_attempts",
                message: "must be at least 1",
            });
        }
        if self.max_push_attempts > 16 {
            return Err(ConfigError::Invalid {
                field: "max_push_attempts",
                message: "must be at most 16",
            });
        }
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::Invalid {
                field: "max_consecutive_failures",
                message: "must be at least 1",
            });
        }
        if self.journal_concurrency_window_ms < 0 {
            return Err(ConfigError::Invalid {
                field: "journal_concurrency_window_ms",
                message: "must not be negative",
            });
        }
        if self.fetch_page_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "fetch_page_limit",
                message: "must be at least 1",
            });
        }
        Ok(())
    }

    /// Delay before push retry number `attempt` (zero-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }

    pub fn min_sync_interval(&self) -> Duration {
        Duration::from_millis(self.min_sync_interval_ms)
    }

    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_millis(self.failure_cooldown_ms)
    }

    pub fn cursor_retry_delay(&self) -> Duration {
        Duration::from_millis(self.cursor_retry_delay_ms)
    }

    pub fn recovery_retry_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, PointsMergePolicy, SyncConfig, TaskTieBreak};
    use std::time::Duration;

    #[test]
    fn defaults_match_engine_thresholds() {
        let config = SyncConfig::default();
        assert_eq!(config.min_sync_interval(), Duration::from_secs(5));
        assert_eq!(config.max_push_attempts, 3);
        assert_eq!(config.failure_cooldown(), Duration::from_secs(300));
        assert_eq!(config.journal_concurrency_window_ms, 120_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults_for_missing_fields() {
        let config = SyncConfig::from_json_str(
            r#"{"zone_id":"custom","task_tie_break":"higher_priority","points_merge_policy":"last_modified_wins"}"#,
        )
        .expect("partial config should parse");
        assert_eq!(config.zone_id, "custom");
        assert_eq!(config.task_tie_break, TaskTieBreak::HigherPriority);
        assert_eq!(config.points_merge_policy, PointsMergePolicy::LastModifiedWins);
        assert_eq!(config.max_push_attempts, 3);
    }

    #[test]
    fn rejects_blank_zone_and_zero_attempts() {
        let blank = SyncConfig::from_json_str(r#"{"zone_id":"  "}"#).unwrap_err();
        assert!(matches!(blank, ConfigError::Invalid { field: "zone_id", .. }));

        let zero = SyncConfig::from_json_str(r#"{"max_push_attempts":0}"#).unwrap_err();
        assert!(matches!(
            zero,
            ConfigError::Invalid {
                field: "max_push_attempts",
                ..
            }
        ));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = SyncConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let config = SyncConfig {
            backoff_base_ms: 100,
            ..SyncConfig::default()
        };
        assert_eq!(config.backoff_for(0), Duration::from_millis(100));
        assert_eq!(config.backoff_for(1), Duration::from_millis(200));
        assert_eq!(config.backoff_for(2), Duration::from_millis(400));
    }
}
