//! Engine state and change notifications.
//!
//! # Responsibility
//! - Define the observable sync lifecycle.
//! - Fan out data-changed and state-changed events to registered observers.
//!
//! # Invariants
//! - Observers are called outside any engine lock.
//! - One data-changed event per affected kind per apply.

use crate::model::entity::EntityKind;
use log::warn;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, RwLock};

/// Sync lifecycle: `Idle → Syncing → {Success, Error} → Idle`, plus
/// `Disabled` from any state while the user has sync turned off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
    Success,
    /// Human-readable reason for the last failed cycle.
    Error(String),
    Disabled,
}

impl SyncState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Success => "success",
            Self::Error(_) => "error",
            Self::Disabled => "disabled",
        }
    }

    /// States a new cycle may start from.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Idle | Self::Success | Self::Error(_))
    }
}

impl Display for SyncState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error(reason) => write!(f, "error: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Point-in-time snapshot for UI and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub state: SyncState,
    pub consecutive_failures: u32,
    pub last_attempt_ms: Option<i64>,
    pub last_success_ms: Option<i64>,
    pub cooldown_until_ms: Option<i64>,
    pub pending_writes: usize,
}

/// Receives engine events. Both methods default to no-ops.
pub trait SyncObserver: Send + Sync {
    fn data_changed(&self, _kind: EntityKind) {}
    fn state_changed(&self, _state: &SyncState) {}
}

/// Registered observers, shared between orchestrator and write pipeline.
#[derive(Clone, Default)]
pub struct ObserverHub {
    observers: Arc<RwLock<Vec<Arc<dyn SyncObserver>>>>,
}

impl ObserverHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn SyncObserver>) {
        match self.observers.write() {
            Ok(mut observers) => observers.push(observer),
            Err(_) => warn!("event=observer_register module=state status=error error_code=lock_poisoned"),
        }
    }

    pub fn notify_data_changed<'a>(&self, kinds: impl IntoIterator<Item = &'a EntityKind>) {
        let kinds: BTreeSet<EntityKind> = kinds.into_iter().copied().collect();
        if kinds.is_empty() {
            return;
        }
        for observer in self.snapshot() {
            for kind in &kinds {
                observer.data_changed(*kind);
            }
        }
    }

    pub fn notify_state(&self, state: &SyncState) {
        for observer in self.snapshot() {
            observer.state_changed(state);
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn SyncObserver>> {
        self.observers
            .read()
            .map(|observers| observers.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::{ObserverHub, SyncObserver, SyncState};
    use crate::model::entity::EntityKind;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        kinds: Mutex<Vec<EntityKind>>,
        states: Mutex<Vec<SyncState>>,
    }

    impl SyncObserver for Recorder {
        fn data_changed(&self, kind: EntityKind) {
            self.kinds.lock().unwrap().push(kind);
        }

        fn state_changed(&self, state: &SyncState) {
            self.states.lock().unwrap().push(state.clone());
        }
    }

    #[test]
    fn data_changed_fires_once_per_kind() {
        let hub = ObserverHub::new();
        let recorder = Arc::new(Recorder::default());
        hub.register(recorder.clone());

        hub.notify_data_changed(&[EntityKind::Task, EntityKind::Reward, EntityKind::Task]);
        hub.notify_state(&SyncState::Syncing);

        assert_eq!(
            *recorder.kinds.lock().unwrap(),
            vec![EntityKind::Task, EntityKind::Reward]
        );
        assert_eq!(*recorder.states.lock().unwrap(), vec![SyncState::Syncing]);
    }

    #[test]
    fn settled_states_allow_a_new_cycle() {
        assert!(SyncState::Idle.is_settled());
        assert!(SyncState::Error("offline".to_string()).is_settled());
        assert!(!SyncState::Syncing.is_settled());
        assert!(!SyncState::Disabled.is_settled());
        assert_eq!(SyncState::Error("x".to_string()).to_string(), "error: x");
    }
}
