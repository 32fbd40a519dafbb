#![allow(dead_code)]

use lazytask_core::db::{open_db_in_memory, share, SharedConnection};
use lazytask_core::sync::clock::{ManualClock, RecordingSleeper};
use lazytask_core::sync::local_store::{ChangeCallback, LocalStoreResult};
use lazytask_core::sync::record::{decode_entity, encode_entity};
use lazytask_core::sync::remote::codes;
use lazytask_core::{
    CancelToken, Entity, EntityId, EntityKind, FetchedChanges, InMemoryLocalStore, LocalStore,
    LocalStoreError, RemoteErrorEnvelope, RemoteRecord, RemoteRecordStore, RemoteResult,
    SyncConfig, SyncCursor, SyncEnv, SyncObserver, SyncOrchestrator, SyncOutcome, SyncStage,
    SyncState, SyncTrigger, ZoneId,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::{Duration, Instant};

pub const START_MS: i64 = 1_700_000_000_000;

#[derive(Default)]
struct ZoneState {
    exists: bool,
    epoch: u64,
    seq: u64,
    next_tag: u64,
    records: BTreeMap<String, RemoteRecord>,
    log: Vec<(u64, String)>,
    failing_fetches: usize,
    fetch_failure_code: String,
    fetch_retry_after_ms: Option<u64>,
    always_conflict: bool,
    fetch_calls: usize,
    push_calls: usize,
}

/// In-memory record zone with sequence-number cursors and change tags.
pub struct FakeRemote {
    state: Mutex<ZoneState>,
    held_page: Mutex<Option<Vec<RemoteRecord>>>,
    held_fetch_entered: AtomicBool,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ZoneState {
                exists: true,
                ..ZoneState::default()
            }),
            held_page: Mutex::new(None),
            held_fetch_entered: AtomicBool::new(false),
        })
    }

    fn zone(&self) -> MutexGuard<'_, ZoneState> {
        self.state.lock().unwrap()
    }

    /// Writes an entity as another device would, bypassing any engine.
    pub fn seed(&self, entity: &Entity) {
        let mut zone = self.zone();
        let record = encode_entity(entity, None).unwrap();
        store(&mut zone, record);
    }

    /// Hard-deletes a record as another device would.
    pub fn remove(&self, record_id: &str) {
        let mut zone = self.zone();
        if zone.records.remove(record_id).is_some() {
            zone.seq += 1;
            let seq = zone.seq;
            zone.log.push((seq, record_id.to_string()));
        }
    }

    pub fn entity(&self, id: EntityId) -> Option<Entity> {
        let zone = self.zone();
        zone.records
            .get(&id.to_string())
            .and_then(|record| decode_entity(record).unwrap())
    }

    pub fn has_record(&self, record_id: &str) -> bool {
        self.zone().records.contains_key(record_id)
    }

    pub fn record_types(&self) -> Vec<String> {
        self.zone()
            .records
            .values()
            .map(|record| record.record_type.clone())
            .collect()
    }

    /// Every outstanding cursor becomes invalid.
    pub fn expire_cursors(&self) {
        self.zone().epoch += 1;
    }

    /// Drops the zone and everything in it.
    pub fn delete_zone(&self) {
        let mut zone = self.zone();
        zone.exists = false;
        zone.records.clear();
        zone.log.clear();
        zone.epoch += 1;
    }

    pub fn fail_fetches(&self, count: usize, code: &str) {
        let mut zone = self.zone();
        zone.failing_fetches = count;
        zone.fetch_failure_code = code.to_string();
    }

    pub fn fail_fetches_with_retry_after(&self, count: usize, code: &str, retry_after_ms: u64) {
        let mut zone = self.zone();
        zone.failing_fetches = count;
        zone.fetch_failure_code = code.to_string();
        zone.fetch_retry_after_ms = Some(retry_after_ms);
    }

    /// The next fetch blocks until its cancel token fires, then returns
    /// `entities` anyway, like a transport that ignores cancellation.
    pub fn hold_next_fetch(&self, entities: &[Entity]) {
        let records = entities
            .iter()
            .map(|entity| encode_entity(entity, Some("held".to_string())).unwrap())
            .collect();
        *self.held_page.lock().unwrap() = Some(records);
        self.held_fetch_entered.store(false, Ordering::SeqCst);
    }

    /// Waits until a held fetch is in flight.
    pub fn wait_for_held_fetch(&self) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if self.held_fetch_entered.load(Ordering::SeqCst) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    pub fn set_always_conflict(&self, enabled: bool) {
        self.zone().always_conflict = enabled;
    }

    pub fn fetch_calls(&self) -> usize {
        self.zone().fetch_calls
    }

    pub fn push_calls(&self) -> usize {
        self.zone().push_calls
    }
}

fn store(zone: &mut ZoneState, mut record: RemoteRecord) -> RemoteRecord {
    zone.next_tag += 1;
    record.change_tag = Some(format!("tag-{}", zone.next_tag));
    zone.seq += 1;
    let seq = zone.seq;
    zone.log.push((seq, record.record_id.clone()));
    zone.records.insert(record.record_id.clone(), record.clone());
    record
}

fn cursor_for(epoch: u64, seq: u64) -> SyncCursor {
    SyncCursor::new(format!("{epoch}:{seq}"))
}

fn parse_cursor(cursor: &SyncCursor) -> Option<(u64, u64)> {
    let (epoch, seq) = cursor.as_str().split_once(':')?;
    Some((epoch.parse().ok()?, seq.parse().ok()?))
}

impl RemoteRecordStore for FakeRemote {
    fn fetch_changes(
        &self,
        _zone_id: &ZoneId,
        cursor: Option<&SyncCursor>,
        limit: u32,
        cancel: &CancelToken,
    ) -> RemoteResult<FetchedChanges> {
        if cancel.is_cancelled() {
            return Err(RemoteErrorEnvelope::cancelled(SyncStage::Fetch));
        }
        let held = self.held_page.lock().unwrap().take();
        if let Some(records) = held {
            self.held_fetch_entered.store(true, Ordering::SeqCst);
            let deadline = Instant::now() + Duration::from_secs(5);
            while !cancel.is_cancelled() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            let epoch = self.zone().epoch;
            return Ok(FetchedChanges {
                records,
                new_cursor: Some(cursor_for(epoch, 9_999)),
                ..FetchedChanges::default()
            });
        }
        let mut zone = self.zone();
        zone.fetch_calls += 1;
        if zone.failing_fetches > 0 {
            zone.failing_fetches -= 1;
            let mut envelope = RemoteErrorEnvelope::new(
                SyncStage::Fetch,
                zone.fetch_failure_code.clone(),
                "injected failure",
                true,
            );
            if let Some(delay) = zone.fetch_retry_after_ms {
                envelope = envelope.with_retry_after(delay);
            }
            return Err(envelope);
        }
        if !zone.exists {
            return Err(RemoteErrorEnvelope::new(
                SyncStage::Fetch,
                codes::ZONE_NOT_FOUND,
                "zone missing",
                false,
            ));
        }

        let since = match cursor {
            None => 0,
            Some(cursor) => match parse_cursor(cursor) {
                Some((epoch, seq)) if epoch == zone.epoch => seq,
                _ => {
                    return Err(RemoteErrorEnvelope::new(
                        SyncStage::Fetch,
                        codes::CHANGE_TOKEN_EXPIRED,
                        "cursor expired",
                        false,
                    ))
                }
            },
        };

        let mut latest: BTreeMap<String, u64> = BTreeMap::new();
        for (seq, record_id) in zone.log.iter().filter(|(seq, _)| *seq > since) {
            latest.insert(record_id.clone(), *seq);
        }
        let mut ordered: Vec<(u64, String)> =
            latest.into_iter().map(|(record_id, seq)| (seq, record_id)).collect();
        ordered.sort();
        let limit = limit.max(1) as usize;
        let more_coming = ordered.len() > limit;
        ordered.truncate(limit);
        let through = if more_coming {
            ordered.last().map_or(since, |(seq, _)| *seq)
        } else {
            zone.seq
        };

        let mut changes = FetchedChanges {
            new_cursor: Some(cursor_for(zone.epoch, through)),
            more_coming,
            ..FetchedChanges::default()
        };
        for (_, record_id) in ordered {
            match zone.records.get(&record_id) {
                Some(record) => changes.records.push(record.clone()),
                None => changes.deleted_ids.push(record_id),
            }
        }
        Ok(changes)
    }

    fn fetch_record(
        &self,
        _zone_id: &ZoneId,
        record_id: &str,
        _cancel: &CancelToken,
    ) -> RemoteResult<Option<RemoteRecord>> {
        Ok(self.zone().records.get(record_id).cloned())
    }

    fn push(
        &self,
        _zone_id: &ZoneId,
        record: &RemoteRecord,
        cancel: &CancelToken,
    ) -> RemoteResult<RemoteRecord> {
        if cancel.is_cancelled() {
            return Err(RemoteErrorEnvelope::cancelled(SyncStage::Push));
        }
        let mut zone = self.zone();
        zone.push_calls += 1;
        if !zone.exists {
            return Err(RemoteErrorEnvelope::new(
                SyncStage::Push,
                codes::ZONE_NOT_FOUND,
                "zone missing",
                false,
            ));
        }
        let server = zone.records.get(&record.record_id).cloned();
        let stale = match &server {
            Some(server) => server.change_tag != record.change_tag,
            None => false,
        };
        if zone.always_conflict || stale {
            return Err(RemoteErrorEnvelope::conflict(SyncStage::Push, server));
        }
        Ok(store(&mut zone, record.clone()))
    }

    fn delete(&self, _zone_id: &ZoneId, record_id: &str, cancel: &CancelToken) -> RemoteResult<()> {
        if cancel.is_cancelled() {
            return Err(RemoteErrorEnvelope::cancelled(SyncStage::Delete));
        }
        let mut zone = self.zone();
        if zone.records.remove(record_id).is_none() {
            return Err(RemoteErrorEnvelope::new(
                SyncStage::Delete,
                codes::RECORD_NOT_FOUND,
                "no such record",
                false,
            ));
        }
        zone.seq += 1;
        let seq = zone.seq;
        zone.log.push((seq, record_id.to_string()));
        Ok(())
    }

    fn ensure_zone(&self, _zone_id: &ZoneId, _cancel: &CancelToken) -> RemoteResult<()> {
        self.zone().exists = true;
        Ok(())
    }

    fn subscribe_to_changes(&self, _zone_id: &ZoneId) -> RemoteResult<()> {
        Ok(())
    }
}

/// Local store that starts rejecting upserts after a budget is spent.
#[derive(Default)]
pub struct FlakyLocalStore {
    inner: InMemoryLocalStore,
    upsert_budget: Mutex<Option<usize>>,
}

impl FlakyLocalStore {
    pub fn fail_after(&self, upserts: usize) {
        *self.upsert_budget.lock().unwrap() = Some(upserts);
    }

    pub fn heal(&self) {
        *self.upsert_budget.lock().unwrap() = None;
    }
}

impl LocalStore for FlakyLocalStore {
    fn get_all(&self, kind: EntityKind) -> LocalStoreResult<Vec<Entity>> {
        self.inner.get_all(kind)
    }

    fn get(&self, kind: EntityKind, id: EntityId) -> LocalStoreResult<Option<Entity>> {
        self.inner.get(kind, id)
    }

    fn upsert(&self, entity: &Entity) -> LocalStoreResult<()> {
        {
            let mut budget = self.upsert_budget.lock().unwrap();
            if let Some(remaining) = budget.as_mut() {
                if *remaining == 0 {
                    return Err(LocalStoreError::Unavailable("disk full".to_string()));
                }
                *remaining -= 1;
            }
        }
        self.inner.upsert(entity)
    }

    fn delete(&self, kind: EntityKind, id: EntityId) -> LocalStoreResult<()> {
        self.inner.delete(kind, id)
    }

    fn on_changed(&self, callback: ChangeCallback) {
        self.inner.on_changed(callback);
    }
}

/// Local store that switches sync off from inside its first upsert, as a
/// user toggling sync while a batch is being applied would.
#[derive(Default)]
pub struct DisablingLocalStore {
    inner: InMemoryLocalStore,
    engine: OnceLock<Weak<SyncOrchestrator>>,
    armed: AtomicBool,
}

impl DisablingLocalStore {
    pub fn disable_on_first_write(&self, engine: &Arc<SyncOrchestrator>) {
        let _ = self.engine.set(Arc::downgrade(engine));
        self.armed.store(true, Ordering::SeqCst);
    }
}

impl LocalStore for DisablingLocalStore {
    fn get_all(&self, kind: EntityKind) -> LocalStoreResult<Vec<Entity>> {
        self.inner.get_all(kind)
    }

    fn get(&self, kind: EntityKind, id: EntityId) -> LocalStoreResult<Option<Entity>> {
        self.inner.get(kind, id)
    }

    fn upsert(&self, entity: &Entity) -> LocalStoreResult<()> {
        self.inner.upsert(entity)?;
        if self.armed.swap(false, Ordering::SeqCst) {
            if let Some(engine) = self.engine.get().and_then(Weak::upgrade) {
                engine.set_sync_enabled(false).unwrap();
            }
        }
        Ok(())
    }

    fn delete(&self, kind: EntityKind, id: EntityId) -> LocalStoreResult<()> {
        self.inner.delete(kind, id)
    }

    fn on_changed(&self, callback: ChangeCallback) {
        self.inner.on_changed(callback);
    }
}

/// Records every observer event.
#[derive(Default)]
pub struct EventLog {
    pub kinds: Mutex<Vec<EntityKind>>,
    pub states: Mutex<Vec<SyncState>>,
}

impl SyncObserver for EventLog {
    fn data_changed(&self, kind: EntityKind) {
        self.kinds.lock().unwrap().push(kind);
    }

    fn state_changed(&self, state: &SyncState) {
        self.states.lock().unwrap().push(state.clone());
    }
}

/// One simulated device: its own local store, engine state and clock.
pub struct Device<L: LocalStore + 'static = InMemoryLocalStore> {
    pub engine: SyncOrchestrator,
    pub local: Arc<L>,
    pub state_db: SharedConnection,
    pub clock: Arc<ManualClock>,
    pub sleeper: Arc<RecordingSleeper>,
}

impl Device<InMemoryLocalStore> {
    pub fn new(remote: &Arc<FakeRemote>) -> Self {
        Self::with_store(remote, Arc::new(InMemoryLocalStore::new()), SyncConfig::default())
    }
}

impl<L: LocalStore + 'static> Device<L> {
    pub fn with_store(remote: &Arc<FakeRemote>, local: Arc<L>, config: SyncConfig) -> Self {
        let state_db = share(open_db_in_memory().unwrap());
        Self::reopen(remote, local, state_db, config)
    }

    /// Builds an engine over existing engine state, as after an app restart.
    pub fn reopen(
        remote: &Arc<FakeRemote>,
        local: Arc<L>,
        state_db: SharedConnection,
        config: SyncConfig,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(START_MS));
        let sleeper = Arc::new(RecordingSleeper::new());
        let env = SyncEnv {
            local: local.clone(),
            remote: remote.clone(),
            state_db: state_db.clone(),
            clock: clock.clone(),
            sleeper: sleeper.clone(),
        };
        Self {
            engine: SyncOrchestrator::new(env, config).unwrap(),
            local,
            state_db,
            clock,
            sleeper,
        }
    }

    /// Waits out the throttle window, then requests a sync.
    pub fn sync(&self) -> SyncOutcome {
        self.clock.advance(Duration::from_secs(10));
        self.engine.request_sync(SyncTrigger::Manual)
    }

    /// Writes locally and hands the write to the engine, like a UI edit.
    pub fn save(&self, entity: Entity) {
        self.clock.advance(Duration::from_millis(1));
        self.local.upsert(&entity).unwrap();
        self.engine.push_local(&entity).unwrap();
    }

    pub fn get(&self, kind: EntityKind, id: EntityId) -> Option<Entity> {
        self.local.get(kind, id).unwrap()
    }

    pub fn all(&self, kind: EntityKind) -> Vec<Entity> {
        self.local.get_all(kind).unwrap()
    }
}

pub fn completed(outcome: SyncOutcome) -> lazytask_core::SyncReport {
    match outcome {
        SyncOutcome::Completed(report) => report,
        other => panic!("expected a completed sync, got {other:?}"),
    }
}
