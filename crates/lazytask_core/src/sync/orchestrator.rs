//! Sync orchestrator.
//!
//! # Responsibility
//! - Own the sync lifecycle and decide when a cycle may run (enabled flag,
//!   throttle, failure cooldown, in-flight guard).
//! - Run one cycle: drain the outbox, fetch, apply, commit the cursor, notify.
//! - Recover once from an expired cursor or a missing zone.
//!
//! # Invariants
//! - At most one cycle runs at a time.
//! - The cursor is committed only after its batch was applied, and never by
//!   a cancelled or superseded cycle.
//! - A superseded cycle leaves state and counters to the cycle that
//!   replaced it.
//! - Data-changed events fire once per affected kind, after the cursor commit,
//!   or before returning when a cancelled cycle already wrote locally.
//! - After a failure only the user can fix, automatic triggers are skipped
//!   until a manual or forced sync.

use crate::config::SyncConfig;
use crate::model::entity::{Entity, EntityId, EntityKind};
use crate::sync::apply::BatchApplier;
use crate::sync::cancel::CancelToken;
use crate::sync::cursor::SyncCursorStore;
use crate::sync::env::SyncEnv;
use crate::sync::error::{SyncError, SyncResult};
use crate::sync::fetcher::ChangeFetcher;
use crate::sync::outbox::Outbox;
use crate::sync::pipeline::{FlushReport, PushOutcome, WritePipeline};
use crate::sync::prefs::EnginePrefs;
use crate::sync::record_index::RecordIndex;
use crate::sync::remote::ZoneId;
use crate::sync::state::{ObserverHub, SyncObserver, SyncState, SyncStatus};
use crate::sync::tombstone::TombstoneLedger;
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Why a sync was requested. Only used for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Launch,
    Foreground,
    RemoteNotification,
    LocalChange,
    Manual,
}

impl SyncTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Launch => "launch",
            Self::Foreground => "foreground",
            Self::RemoteNotification => "remote_notification",
            Self::LocalChange => "local_change",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    AlreadySyncing,
    Throttled,
    CoolingDown,
    /// The last cycle failed in a way only the user can fix (sign-in, quota,
    /// rejected data); only a manual or forced sync runs.
    AwaitingUser,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::AlreadySyncing => "already_syncing",
            Self::Throttled => "throttled",
            Self::CoolingDown => "cooling_down",
            Self::AwaitingUser => "awaiting_user",
        }
    }
}

/// Counters from one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub full_fetch: bool,
    pub fetched: usize,
    pub written: usize,
    pub deleted: usize,
    pub pushed: usize,
    pub push_failures: usize,
    pub affected: Vec<EntityKind>,
    /// The cycle needed a cursor or zone recovery retry.
    pub recovered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    Skipped(SkipReason),
    Failed { code: String, reason: String },
    Cancelled,
    /// A forced resync, disable or reset replaced this cycle.
    Superseded,
}

#[derive(Debug)]
struct Lifecycle {
    state: SyncState,
    generation: u64,
    in_flight: Option<CancelToken>,
    last_attempt_ms: Option<i64>,
    last_success_ms: Option<i64>,
    consecutive_failures: u32,
    cooldown_until_ms: Option<i64>,
    /// Server-requested pause from the last transient failure.
    retry_after_until_ms: Option<i64>,
    awaiting_user: bool,
}

/// Single entry point hosts drive sync through.
pub struct SyncOrchestrator {
    config: SyncConfig,
    zone: ZoneId,
    env: SyncEnv,
    ledger: TombstoneLedger,
    cursors: SyncCursorStore,
    index: RecordIndex,
    outbox: Outbox,
    prefs: EnginePrefs,
    fetcher: ChangeFetcher,
    pipeline: WritePipeline,
    observers: ObserverHub,
    lifecycle: Mutex<Lifecycle>,
    run_lock: Mutex<()>,
}

impl SyncOrchestrator {
    pub fn new(env: SyncEnv, config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;
        let zone = ZoneId::new(config.zone_id.clone());
        let observers = ObserverHub::new();
        let ledger = TombstoneLedger::new(env.state_db.clone(), Arc::clone(&env.clock));
        let cursors = SyncCursorStore::new(env.state_db.clone());
        let index = RecordIndex::new(env.state_db.clone());
        let prefs = EnginePrefs::new(env.state_db.clone());
        let fetcher = ChangeFetcher::new(
            Arc::clone(&env.remote),
            index.clone(),
            cursors.clone(),
            Arc::clone(&env.clock),
            Arc::clone(&env.sleeper),
            config.fetch_page_limit,
            config.cursor_retry_delay(),
        );
        let pipeline = WritePipeline::new(&env, config.clone(), observers.clone());
        let state = if prefs.sync_enabled()? {
            SyncState::Idle
        } else {
            SyncState::Disabled
        };
        info!(
            "event=sync_engine_init module=orchestrator status=ok zone={zone} state={}",
            state.label()
        );

        Ok(Self {
            outbox: Outbox::new(env.state_db.clone()),
            config,
            zone,
            env,
            ledger,
            cursors,
            index,
            prefs,
            fetcher,
            pipeline,
            observers,
            lifecycle: Mutex::new(Lifecycle {
                state,
                generation: 0,
                in_flight: None,
                last_attempt_ms: None,
                last_success_ms: None,
                consecutive_failures: 0,
                cooldown_until_ms: None,
                retry_after_until_ms: None,
                awaiting_user: false,
            }),
            run_lock: Mutex::new(()),
        })
    }

    pub fn register_observer(&self, observer: Arc<dyn SyncObserver>) {
        self.observers.register(observer);
    }

    pub fn state(&self) -> SyncState {
        self.lifecycle().state.clone()
    }

    pub fn status(&self) -> SyncResult<SyncStatus> {
        let pending_writes = self.outbox.len()?;
        let lifecycle = self.lifecycle();
        Ok(SyncStatus {
            state: lifecycle.state.clone(),
            consecutive_failures: lifecycle.consecutive_failures,
            last_attempt_ms: lifecycle.last_attempt_ms,
            last_success_ms: lifecycle.last_success_ms,
            cooldown_until_ms: lifecycle.cooldown_until_ms,
            pending_writes,
        })
    }

    pub fn tombstones(&self) -> &TombstoneLedger {
        &self.ledger
    }

    /// Runs a cycle unless sync is disabled, already running, throttled or
    /// cooling down after repeated failures. Blocks until the cycle ends.
    pub fn request_sync(&self, trigger: SyncTrigger) -> SyncOutcome {
        let now = self.env.clock.now_ms();
        let (token, generation, transitions) = {
            let mut lifecycle = self.lifecycle();
            if let Some(reason) = self.admission(&mut lifecycle, now, trigger) {
                debug!(
                    "event=sync_request module=orchestrator status=skip trigger={} reason={}",
                    trigger.as_str(),
                    reason.as_str()
                );
                return SyncOutcome::Skipped(reason);
            }
            begin_cycle(&mut lifecycle, now)
        };
        info!(
            "event=sync_request module=orchestrator status=start trigger={} generation={generation}",
            trigger.as_str()
        );
        self.notify_states(&transitions);

        let _running = self.run_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let result = self.run_with_recovery(&token);
        self.finish(generation, result)
    }

    /// Drops the cursor and refetches everything, superseding any cycle in
    /// flight. Ignores throttle and cooldown.
    pub fn force_full_resync(&self) -> SyncOutcome {
        let now = self.env.clock.now_ms();
        let (token, generation, transitions) = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state == SyncState::Disabled {
                return SyncOutcome::Skipped(SkipReason::Disabled);
            }
            if let Some(previous) = lifecycle.in_flight.take() {
                previous.cancel();
                info!("event=force_resync module=orchestrator status=superseding");
            }
            lifecycle.consecutive_failures = 0;
            lifecycle.cooldown_until_ms = None;
            lifecycle.retry_after_until_ms = None;
            lifecycle.awaiting_user = false;
            begin_cycle(&mut lifecycle, now)
        };
        self.notify_states(&transitions);

        // The superseded cycle may still hold the lock; clearing the cursor
        // after it exits keeps it from racing the clear.
        let _running = self.run_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let result = self
            .cursors
            .clear(&self.zone)
            .map_err(SyncError::from)
            .and_then(|_| self.run_with_recovery(&token));
        self.finish(generation, result)
    }

    /// Persists the user's choice. Disabling cancels any cycle in flight.
    pub fn set_sync_enabled(&self, enabled: bool) -> SyncResult<()> {
        self.prefs.set_sync_enabled(enabled)?;
        let transition = {
            let mut lifecycle = self.lifecycle();
            if enabled {
                if lifecycle.state == SyncState::Disabled {
                    lifecycle.state = SyncState::Idle;
                    Some(SyncState::Idle)
                } else {
                    None
                }
            } else {
                if let Some(token) = lifecycle.in_flight.take() {
                    token.cancel();
                }
                lifecycle.generation += 1;
                if lifecycle.state == SyncState::Disabled {
                    None
                } else {
                    lifecycle.state = SyncState::Disabled;
                    Some(SyncState::Disabled)
                }
            }
        };
        info!("event=sync_toggle module=orchestrator status=ok enabled={enabled}");
        if let Some(state) = transition {
            self.observers.notify_state(&state);
        }
        Ok(())
    }

    /// Forgets every tombstone, cursor, index entry and pending write.
    pub fn reset_all(&self) -> SyncResult<()> {
        {
            let mut lifecycle = self.lifecycle();
            if let Some(token) = lifecycle.in_flight.take() {
                token.cancel();
            }
            lifecycle.generation += 1;
        }
        let _running = self.run_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let tombstones = self.ledger.clear_all()?;
        let cursors = self.cursors.clear_all()?;
        let indexed = self.index.clear()?;
        let pending = self.outbox.clear()?;

        let state = {
            let mut lifecycle = self.lifecycle();
            lifecycle.consecutive_failures = 0;
            lifecycle.cooldown_until_ms = None;
            lifecycle.retry_after_until_ms = None;
            lifecycle.awaiting_user = false;
            lifecycle.last_attempt_ms = None;
            if lifecycle.state != SyncState::Disabled {
                lifecycle.state = SyncState::Idle;
            }
            lifecycle.state.clone()
        };
        info!(
            "event=sync_reset module=orchestrator status=ok tombstones={tombstones} cursors={cursors} indexed={indexed} pending={pending}"
        );
        self.observers.notify_state(&state);
        Ok(())
    }

    /// Propagates a local upsert the host already wrote to its store.
    ///
    /// Remote failures leave the write queued for the next cycle and are not
    /// returned; only local storage failures are.
    pub fn push_local(&self, entity: &Entity) -> SyncResult<PushOutcome> {
        if !self.is_enabled() {
            return self.pipeline.enqueue(entity);
        }
        match self.pipeline.push(entity, &CancelToken::new()) {
            Err(err) if !is_local_failure(&err) => {
                warn!(
                    "event=push_local module=orchestrator status=deferred kind={} error_code={}",
                    entity.kind(),
                    err.code()
                );
                Ok(PushOutcome::Queued)
            }
            other => other,
        }
    }

    /// Deletes locally, tombstones the id and propagates the delete.
    pub fn delete_local(&self, kind: EntityKind, id: EntityId) -> SyncResult<()> {
        if !self.is_enabled() {
            return self.pipeline.record_delete(kind, id);
        }
        match self.pipeline.delete(kind, id, &CancelToken::new()) {
            Err(err) if !is_local_failure(&err) => {
                warn!(
                    "event=delete_local module=orchestrator status=deferred kind={kind} error_code={}",
                    err.code()
                );
                Ok(())
            }
            other => other,
        }
    }

    fn is_enabled(&self) -> bool {
        self.lifecycle().state != SyncState::Disabled
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admission(
        &self,
        lifecycle: &mut Lifecycle,
        now: i64,
        trigger: SyncTrigger,
    ) -> Option<SkipReason> {
        match lifecycle.state {
            SyncState::Disabled => return Some(SkipReason::Disabled),
            SyncState::Syncing => return Some(SkipReason::AlreadySyncing),
            _ => {}
        }
        if lifecycle.awaiting_user && trigger != SyncTrigger::Manual {
            return Some(SkipReason::AwaitingUser);
        }
        if let Some(until) = lifecycle.cooldown_until_ms {
            if now < until {
                return Some(SkipReason::CoolingDown);
            }
            lifecycle.cooldown_until_ms = None;
            lifecycle.consecutive_failures = 0;
        }
        if let Some(until) = lifecycle.retry_after_until_ms {
            if now < until {
                return Some(SkipReason::Throttled);
            }
            lifecycle.retry_after_until_ms = None;
        }
        if let Some(last) = lifecycle.last_attempt_ms {
            let min_interval = i64::try_from(self.config.min_sync_interval_ms).unwrap_or(i64::MAX);
            if now.saturating_sub(last) < min_interval {
                return Some(SkipReason::Throttled);
            }
        }
        None
    }

    fn run_with_recovery(&self, token: &CancelToken) -> SyncResult<SyncReport> {
        match self.run_cycle(token) {
            Err(SyncError::CursorInvalid) => {
                warn!("event=sync_recover module=orchestrator status=start error_code=cursor_invalid");
                self.cursors.clear(&self.zone)?;
                self.retry_after_recovery(token)
            }
            Err(SyncError::ZoneMissing) => {
                warn!("event=sync_recover module=orchestrator status=start error_code=zone_missing");
                self.prepare_zone(token)?;
                self.retry_after_recovery(token)
            }
            other => other,
        }
    }

    fn retry_after_recovery(&self, token: &CancelToken) -> SyncResult<SyncReport> {
        if !self
            .env
            .sleeper
            .sleep(self.config.recovery_retry_delay(), token)
        {
            return Err(SyncError::Cancelled);
        }
        let mut report = self.run_cycle(token)?;
        report.recovered = true;
        Ok(report)
    }

    fn prepare_zone(&self, token: &CancelToken) -> SyncResult<()> {
        self.env
            .remote
            .ensure_zone(&self.zone, token)
            .map_err(SyncError::from_remote)?;
        if let Err(envelope) = self.env.remote.subscribe_to_changes(&self.zone) {
            warn!(
                "event=subscribe_changes module=orchestrator status=error error_code={}",
                envelope.code
            );
        }
        Ok(())
    }

    fn run_cycle(&self, token: &CancelToken) -> SyncResult<SyncReport> {
        let started_at = Instant::now();
        let cursor = self.cursors.get(&self.zone)?;
        if cursor.is_none() {
            self.prepare_zone(token)?;
        }

        let flushed = self.pipeline.flush_outbox(token)?;
        let changes = self.fetcher.fetch(&self.zone, cursor.as_ref(), token)?;
        if token.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let applied = BatchApplier::new(
            self.env.local.as_ref(),
            &self.ledger,
            &self.index,
            &self.outbox,
            &self.config,
            self.env.clock.as_ref(),
        )
        .apply(&changes)?;
        if token.is_cancelled() {
            // The batch is already in the local store; only the cursor waits.
            self.observers.notify_data_changed(&applied.affected);
            return Err(SyncError::Cancelled);
        }

        if let Some(next) = &changes.new_cursor {
            if cursor.as_ref() != Some(next) {
                self.cursors.set(&self.zone, next, self.env.clock.now_ms())?;
            }
        }
        self.observers.notify_data_changed(&applied.affected);

        let pushed_back = if applied.push_back > 0 {
            self.pipeline.flush_outbox(token)?
        } else {
            FlushReport::default()
        };

        let report = SyncReport {
            full_fetch: changes.full_fetch,
            fetched: changes.upsert_count() + changes.hard_deletes.len() + changes.markers.len(),
            written: applied.written,
            deleted: applied.deleted,
            pushed: flushed.pushed + flushed.deleted + pushed_back.pushed,
            push_failures: flushed.failed + pushed_back.failed,
            affected: applied.affected.into_iter().collect(),
            recovered: false,
        };
        info!(
            "event=sync_cycle module=orchestrator status=ok full_fetch={} fetched={} written={} deleted={} pushed={} push_failures={} duration_ms={}",
            report.full_fetch,
            report.fetched,
            report.written,
            report.deleted,
            report.pushed,
            report.push_failures,
            started_at.elapsed().as_millis()
        );
        Ok(report)
    }

    fn finish(&self, generation: u64, result: SyncResult<SyncReport>) -> SyncOutcome {
        let now = self.env.clock.now_ms();
        let (outcome, state) = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.generation != generation {
                info!("event=sync_cycle module=orchestrator status=superseded generation={generation}");
                return SyncOutcome::Superseded;
            }
            lifecycle.in_flight = None;
            match result {
                Ok(report) => {
                    lifecycle.state = SyncState::Success;
                    lifecycle.consecutive_failures = 0;
                    lifecycle.cooldown_until_ms = None;
                    lifecycle.retry_after_until_ms = None;
                    lifecycle.awaiting_user = false;
                    lifecycle.last_success_ms = Some(now);
                    (SyncOutcome::Completed(report), SyncState::Success)
                }
                Err(SyncError::Cancelled) => {
                    lifecycle.state = SyncState::Idle;
                    (SyncOutcome::Cancelled, SyncState::Idle)
                }
                Err(err) => {
                    lifecycle.consecutive_failures += 1;
                    lifecycle.awaiting_user = !err.is_retryable() && !is_local_failure(&err);
                    if let SyncError::Transient {
                        retry_after_ms: Some(delay),
                        ..
                    } = &err
                    {
                        let delay = i64::try_from(*delay).unwrap_or(i64::MAX);
                        lifecycle.retry_after_until_ms = Some(now.saturating_add(delay));
                    }
                    if lifecycle.consecutive_failures >= self.config.max_consecutive_failures {
                        let cooldown = i64::try_from(self.config.failure_cooldown_ms).unwrap_or(i64::MAX);
                        lifecycle.cooldown_until_ms = Some(now.saturating_add(cooldown));
                        warn!(
                            "event=sync_cooldown module=orchestrator status=start failures={} cooldown_ms={}",
                            lifecycle.consecutive_failures, self.config.failure_cooldown_ms
                        );
                    }
                    error!(
                        "event=sync_cycle module=orchestrator status=error error_code={} failures={} awaiting_user={}",
                        err.code(),
                        lifecycle.consecutive_failures,
                        lifecycle.awaiting_user
                    );
                    let reason = err.user_reason();
                    lifecycle.state = SyncState::Error(reason.clone());
                    (
                        SyncOutcome::Failed {
                            code: err.code().to_string(),
                            reason: reason.clone(),
                        },
                        SyncState::Error(reason),
                    )
                }
            }
        };
        self.observers.notify_state(&state);
        outcome
    }

    fn notify_states(&self, states: &[SyncState]) {
        for state in states {
            self.observers.notify_state(state);
        }
    }
}

/// Moves a settled lifecycle into `Syncing` and hands out a fresh token.
fn begin_cycle(lifecycle: &mut Lifecycle, now: i64) -> (CancelToken, u64, Vec<SyncState>) {
    let mut transitions = Vec::with_capacity(2);
    if matches!(lifecycle.state, SyncState::Success | SyncState::Error(_)) {
        transitions.push(SyncState::Idle);
    }
    if lifecycle.state != SyncState::Syncing {
        transitions.push(SyncState::Syncing);
    }
    lifecycle.state = SyncState::Syncing;
    lifecycle.generation += 1;
    lifecycle.last_attempt_ms = Some(now);
    let token = CancelToken::new();
    lifecycle.in_flight = Some(token.clone());
    (token, lifecycle.generation, transitions)
}

fn is_local_failure(err: &SyncError) -> bool {
    matches!(err, SyncError::LocalStore(_) | SyncError::Db(_))
}

#[cfg(test)]
mod tests {
    use super::{begin_cycle, Lifecycle, SkipReason, SyncOrchestrator, SyncOutcome, SyncTrigger};
    use crate::config::SyncConfig;
    use crate::db::{open_db_in_memory, share};
    use crate::sync::cancel::CancelToken;
    use crate::sync::clock::{ManualClock, RecordingSleeper};
    use crate::sync::env::SyncEnv;
    use crate::sync::local_store::InMemoryLocalStore;
    use crate::sync::remote::{
        FetchedChanges, RemoteRecord, RemoteRecordStore, RemoteResult, SyncCursor, ZoneId,
    };
    use crate::sync::state::SyncState;
    use std::sync::Arc;
    use std::time::Duration;

    struct EmptyRemote;

    impl RemoteRecordStore for EmptyRemote {
        fn fetch_changes(
            &self,
            _zone: &ZoneId,
            _cursor: Option<&SyncCursor>,
            _limit: u32,
            _cancel: &CancelToken,
        ) -> RemoteResult<FetchedChanges> {
            Ok(FetchedChanges {
                new_cursor: Some(SyncCursor::new("c1")),
                ..FetchedChanges::default()
            })
        }

        fn fetch_record(
            &self,
            _zone: &ZoneId,
            _record_id: &str,
            _cancel: &CancelToken,
        ) -> RemoteResult<Option<RemoteRecord>> {
            Ok(None)
        }

        fn push(
            &self,
            _zone: &ZoneId,
            record: &RemoteRecord,
            _cancel: &CancelToken,
        ) -> RemoteResult<RemoteRecord> {
            Ok(record.clone())
        }

        fn delete(&self, _zone: &ZoneId, _record_id: &str, _cancel: &CancelToken) -> RemoteResult<()> {
            Ok(())
        }

        fn ensure_zone(&self, _zone: &ZoneId, _cancel: &CancelToken) -> RemoteResult<()> {
            Ok(())
        }

        fn subscribe_to_changes(&self, _zone: &ZoneId) -> RemoteResult<()> {
            Ok(())
        }
    }

    fn orchestrator(clock: Arc<ManualClock>) -> SyncOrchestrator {
        let env = SyncEnv {
            local: Arc::new(InMemoryLocalStore::new()),
            remote: Arc::new(EmptyRemote),
            state_db: share(open_db_in_memory().unwrap()),
            clock,
            sleeper: Arc::new(RecordingSleeper::new()),
        };
        SyncOrchestrator::new(env, SyncConfig::default()).unwrap()
    }

    #[test]
    fn second_request_inside_interval_is_throttled() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let engine = orchestrator(clock.clone());

        assert!(matches!(
            engine.request_sync(SyncTrigger::Launch),
            SyncOutcome::Completed(_)
        ));
        assert_eq!(engine.state(), SyncState::Success);
        assert_eq!(
            engine.request_sync(SyncTrigger::Foreground),
            SyncOutcome::Skipped(SkipReason::Throttled)
        );

        clock.advance(Duration::from_secs(6));
        assert!(matches!(
            engine.request_sync(SyncTrigger::Foreground),
            SyncOutcome::Completed(_)
        ));
    }

    #[test]
    fn disabled_engine_skips_every_request() {
        let clock = Arc::new(ManualClock::new(0));
        let engine = orchestrator(clock);
        engine.set_sync_enabled(false).unwrap();

        assert_eq!(engine.state(), SyncState::Disabled);
        assert_eq!(
            engine.request_sync(SyncTrigger::Manual),
            SyncOutcome::Skipped(SkipReason::Disabled)
        );
        assert_eq!(
            engine.force_full_resync(),
            SyncOutcome::Skipped(SkipReason::Disabled)
        );

        engine.set_sync_enabled(true).unwrap();
        assert_eq!(engine.state(), SyncState::Idle);
    }

    #[test]
    fn begin_cycle_passes_through_idle_after_a_result() {
        let mut lifecycle = Lifecycle {
            state: SyncState::Error("offline".to_string()),
            generation: 4,
            in_flight: None,
            last_attempt_ms: None,
            last_success_ms: None,
            consecutive_failures: 1,
            cooldown_until_ms: None,
            retry_after_until_ms: None,
            awaiting_user: false,
        };

        let (_token, generation, transitions) = begin_cycle(&mut lifecycle, 77);
        assert_eq!(generation, 5);
        assert_eq!(transitions, vec![SyncState::Idle, SyncState::Syncing]);
        assert_eq!(lifecycle.last_attempt_ms, Some(77));
        assert!(lifecycle.in_flight.is_some());
    }
}
