//! The sync façade used by the UI layer.
//!
//! Coordinates the [`LocalStore`] and a [`RemoteMirror`]:
//!
//! - `save` writes locally first, repairs cross-references, then pushes in
//!   the background. A failed push leaves the key pending; pending keys are
//!   retried on `sync_all` and whenever the remote answers again.
//! - `load` pulls, compares timestamps and keeps whichever side is newer.
//! - `subscribe` applies peer writes from the change feed and drops this
//!   device's own echoes as well as stale or duplicate deliveries.
//!
//! Nothing here holds a lock across IO. Races between background pushes,
//! loads and new writes are settled by timestamps alone.

use crate::{
    connectivity::Connectivity,
    error::{NetworkFailure, Result, SyncError},
    local_store::LocalStore,
    remote::{RemoteMirror, RemoteSubscription},
};
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use ensemble_engine::{
    reconcile::{resolve, should_apply},
    Collection, CollectionKey, ConsistencyEnforcer, DeviceId, Divergence, EnforcementOutcome,
    Error as EngineError, LocalSnapshot, LogicalClock, Resolution, Session, SyncPhase,
    SyncRecord, Timestamp, KNOWN_COLLECTIONS,
};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, trace, warn};

/// Pause before reopening a change feed that ended or failed to open.
pub const DEFAULT_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

/// Handle for one `subscribe` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Last time the remote answered any call
    pub last_sync_time: Option<DateTime<Utc>>,
    pub device_id: DeviceId,
    /// As reported by the host's connectivity signal
    pub online: bool,
    /// Keys with a local write the remote has not acknowledged
    pub pending: Vec<CollectionKey>,
}

/// A local snapshot written by this device: a save, or a pushed snapshot
/// restored over an older peer delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalChange {
    pub key: CollectionKey,
    pub data: Collection,
    pub timestamp: Timestamp,
}

/// What a save wrote locally.
#[derive(Debug, Clone, Default)]
pub struct SaveReport {
    /// Every key written, including partners rewritten by the enforcer
    pub written: BTreeMap<CollectionKey, LocalSnapshot>,
    pub enforcement: EnforcementOutcome,
}

/// Per-key outcome of `sync_all` or `push_all_local`.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub completed: Vec<CollectionKey>,
    pub failed: Vec<(CollectionKey, SyncError)>,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct KeyState {
    phase: SyncPhase,
    pending: bool,
    pushing: bool,
    /// Timestamp of the latest snapshot written by `save` on this device
    last_save: Timestamp,
}

struct ActiveSubscription {
    key: CollectionKey,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ActiveSubscription {
    fn stop(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

struct Shared {
    session: Session,
    local: LocalStore,
    remote: Arc<dyn RemoteMirror>,
    enforcer: ConsistencyEnforcer,
    connectivity: Connectivity,
    keys: Vec<CollectionKey>,
    resubscribe_delay: Duration,
    clock: AtomicU64,
    last_sync: AtomicU64,
    states: DashMap<CollectionKey, KeyState>,
    subscriptions: DashMap<SubscriptionId, ActiveSubscription>,
    next_subscription: AtomicU64,
    pushes: TaskTracker,
    shutdown: CancellationToken,
    local_changes: broadcast::Sender<LocalChange>,
}

pub struct OrchestratorBuilder {
    session: Session,
    local: LocalStore,
    remote: Arc<dyn RemoteMirror>,
    enforcer: ConsistencyEnforcer,
    connectivity: Connectivity,
    keys: Vec<CollectionKey>,
    resubscribe_delay: Duration,
}

impl OrchestratorBuilder {
    /// Replace the default ensemble rule table.
    pub fn enforcer(mut self, enforcer: ConsistencyEnforcer) -> Self {
        self.enforcer = enforcer;
        self
    }

    pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    /// Replace the set of keys handled by `sync_all` and `push_all_local`.
    pub fn keys<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<CollectionKey>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    /// Build the orchestrator. Inside a Tokio runtime this also starts
    /// watching the connectivity signal.
    pub fn build(self) -> SyncOrchestrator {
        let (local_changes, _) = broadcast::channel(64);
        let orchestrator = SyncOrchestrator {
            shared: Arc::new(Shared {
                session: self.session,
                local: self.local,
                remote: self.remote,
                enforcer: self.enforcer,
                connectivity: self.connectivity,
                keys: self.keys,
                resubscribe_delay: self.resubscribe_delay,
                clock: AtomicU64::new(0),
                last_sync: AtomicU64::new(0),
                states: DashMap::new(),
                subscriptions: DashMap::new(),
                next_subscription: AtomicU64::new(1),
                pushes: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                local_changes,
            }),
        };

        if tokio::runtime::Handle::try_current().is_ok() {
            watch_connectivity(Arc::downgrade(&orchestrator.shared));
        }
        orchestrator
    }
}

/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SyncOrchestrator {
    shared: Arc<Shared>,
}

impl SyncOrchestrator {
    pub fn builder(
        session: Session,
        local: LocalStore,
        remote: Arc<dyn RemoteMirror>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            session,
            local,
            remote,
            enforcer: ConsistencyEnforcer::ensemble(),
            connectivity: Connectivity::default(),
            keys: KNOWN_COLLECTIONS.iter().map(|k| k.to_string()).collect(),
            resubscribe_delay: DEFAULT_RESUBSCRIBE_DELAY,
        }
    }

    /// Orchestrator with the default rule table and key set.
    pub fn new(session: Session, local: LocalStore, remote: Arc<dyn RemoteMirror>) -> Self {
        Self::builder(session, local, remote).build()
    }

    pub fn session(&self) -> &Session {
        &self.shared.session
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.shared.session.device_id
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.shared.local
    }

    pub fn keys(&self) -> &[CollectionKey] {
        &self.shared.keys
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Persist `data` locally and push it in the background.
    ///
    /// Returns the stored contents, which differ from `data` when the
    /// enforcer repaired a cross-reference.
    pub async fn save(&self, key: &str, data: Collection) -> Result<Collection> {
        let mut report = self.write_local(vec![(key.to_string(), data)])?;
        self.spawn_pushes(&report);
        Ok(report
            .written
            .remove(key)
            .map(|snapshot| snapshot.data)
            .unwrap_or_default())
    }

    /// Save several related collections with a single enforcer pass.
    pub async fn save_batch<I>(&self, entries: I) -> Result<SaveReport>
    where
        I: IntoIterator<Item = (CollectionKey, Collection)>,
    {
        let report = self.write_local(entries.into_iter().collect())?;
        self.spawn_pushes(&report);
        Ok(report)
    }

    /// Save `data` and wait for the remote to accept it.
    ///
    /// The local write stands even when the push fails; the key is then
    /// pending like any other failed push.
    pub async fn push_now(&self, key: &str, data: Collection) -> Result<Timestamp> {
        let mut report = self.write_local(vec![(key.to_string(), data)])?;
        let snapshot = report
            .written
            .remove(key)
            .ok_or_else(|| EngineError::UnknownCollection(key.to_string()))?;
        self.spawn_pushes(&report);

        self.update_state(key, |s| s.pushing = true);
        Ok(self.push_snapshot(key, snapshot).await?)
    }

    /// Force every local snapshot onto the remote regardless of timestamps.
    ///
    /// Used when the user declares this device authoritative.
    pub async fn push_all_local(&self) -> SyncReport {
        let mut report = SyncReport::default();

        for key in &self.shared.keys {
            let snapshot = match self.shared.local.read(key) {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => continue,
                Err(err) => {
                    error!(key = %key, error = %err, "local snapshot unreadable");
                    report.failed.push((key.clone(), err.into()));
                    continue;
                }
            };

            self.update_state(key, |s| s.pushing = true);
            match self.push_snapshot(key, snapshot).await {
                Ok(_) => report.completed.push(key.clone()),
                Err(err) => report.failed.push((key.clone(), err.into())),
            }
        }

        info!(
            pushed = report.completed.len(),
            failed = report.failed.len(),
            "pushed all local snapshots"
        );
        report
    }

    fn write_local(&self, entries: Vec<(CollectionKey, Collection)>) -> Result<SaveReport> {
        let mut working: BTreeMap<CollectionKey, Collection> = BTreeMap::new();
        for (key, data) in entries {
            self.check_key(&key)?;
            working.insert(key, data);
        }

        let touched: Vec<CollectionKey> = working.keys().cloned().collect();
        let touched_refs: Vec<&str> = touched.iter().map(String::as_str).collect();

        for partner in self.shared.enforcer.collections_needed(&touched_refs) {
            if working.contains_key(&partner) {
                continue;
            }
            if !self.phase(&partner).is_hydrated() {
                trace!(key = %partner, "partner not hydrated, its rules wait");
                continue;
            }
            match self.shared.local.read(&partner) {
                Ok(snapshot) => {
                    working.insert(partner, snapshot.map(|s| s.data).unwrap_or_default());
                }
                Err(err) => warn!(key = %partner, error = %err, "partner unreadable, its rules wait"),
            }
        }

        let enforcement = self.shared.enforcer.enforce(&mut working, &touched_refs);
        log_enforcement(&enforcement);

        let mut report = SaveReport {
            written: BTreeMap::new(),
            enforcement,
        };

        for (key, data) in working {
            if !touched.contains(&key) && !report.enforcement.changed.contains(&key) {
                continue;
            }

            match self.shared.local.read(&key) {
                Ok(Some(existing)) => self.observe(existing.last_modified),
                Ok(None) => {}
                Err(err) => warn!(key = %key, error = %err, "overwriting unreadable snapshot"),
            }
            let timestamp = self.tick();

            let snapshot = self
                .shared
                .local
                .write(&key, &data, timestamp)
                .inspect_err(|err| error!(key = %key, error = %err, "local write failed"))?;

            self.update_state(&key, |s| {
                s.phase = SyncPhase::Diverged(Divergence::LocalAhead);
                s.pending = true;
                s.last_save = timestamp;
            });
            debug!(key = %key, timestamp, entities = data.len(), "saved locally");

            let _ = self.shared.local_changes.send(LocalChange {
                key: key.clone(),
                data,
                timestamp,
            });
            report.written.insert(key, snapshot);
        }

        Ok(report)
    }

    fn spawn_pushes(&self, report: &SaveReport) {
        for (key, snapshot) in &report.written {
            self.spawn_push(key.clone(), snapshot.clone());
        }
    }

    fn spawn_push(&self, key: CollectionKey, snapshot: LocalSnapshot) {
        self.update_state(&key, |s| s.pushing = true);
        let this = self.clone();
        self.shared.pushes.spawn(async move {
            let _ = this.push_snapshot(&key, snapshot).await;
        });
    }

    async fn push_snapshot(
        &self,
        key: &str,
        snapshot: LocalSnapshot,
    ) -> std::result::Result<Timestamp, NetworkFailure> {
        let session = &self.shared.session;
        let result = self
            .shared
            .remote
            .push(key, &snapshot.data, &session.device_id, &session.owner_id)
            .await;
        self.update_state(key, |s| s.pushing = false);

        match result {
            Ok(server_ts) => {
                self.acknowledge(key, &snapshot, server_ts);
                self.remote_reachable();
                Ok(server_ts)
            }
            Err(err) => {
                self.update_state(key, |s| s.pending = true);
                warn!(key = %key, error = %err, "push failed, key pending");
                Err(err)
            }
        }
    }

    /// Record a push acknowledgement.
    ///
    /// The server now holds `pushed` at `server_ts`. If no newer local save
    /// happened in the meantime the local snapshot follows it: either it
    /// adopts the server timestamp, or, when a peer delivery older than
    /// `server_ts` replaced it while the push was in flight, the pushed data
    /// is written back.
    fn acknowledge(&self, key: &str, pushed: &LocalSnapshot, server_ts: Timestamp) {
        self.observe(server_ts);

        let current = match self.shared.local.read(key) {
            Ok(current) => current,
            Err(err) => {
                error!(key = %key, error = %err, "cannot confirm push locally");
                return;
            }
        };
        let last_save = self
            .shared
            .states
            .get(key)
            .map(|s| s.last_save)
            .unwrap_or_default();

        let restore = match current {
            Some(snapshot) if snapshot.last_modified == pushed.last_modified => false,
            Some(snapshot)
                if last_save <= pushed.last_modified && snapshot.last_modified < server_ts =>
            {
                info!(
                    key = %key,
                    local_ts = snapshot.last_modified,
                    server_ts,
                    "pushed snapshot outranks peer delivery, restoring it"
                );
                true
            }
            _ => {
                trace!(key = %key, server_ts, "acknowledged push already superseded");
                return;
            }
        };

        if restore || server_ts > pushed.last_modified {
            if let Err(err) = self.shared.local.write(key, &pushed.data, server_ts) {
                error!(key = %key, error = %err, "cannot record server timestamp");
                return;
            }
        }
        self.update_state(key, |s| {
            s.pending = false;
            s.phase = SyncPhase::Synced;
        });
        if restore {
            let _ = self.shared.local_changes.send(LocalChange {
                key: key.to_string(),
                data: pushed.data.clone(),
                timestamp: server_ts,
            });
        }
        debug!(key = %key, server_ts, "push acknowledged");
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Hydrate `key`, resolving local against remote by timestamp.
    ///
    /// Falls back to the local snapshot when the remote is unreachable. Fails
    /// only when neither side can be read.
    pub async fn load(&self, key: &str) -> Result<Collection> {
        self.check_key(key)?;
        self.update_state(key, |s| {
            if !s.phase.is_hydrated() {
                s.phase = SyncPhase::Loading;
            }
        });

        let remote = self.shared.remote.pull(key).await;
        let local = self.shared.local.read(key);

        let (local, remote) = match (local, remote) {
            (Ok(local), Ok(remote)) => (local, remote),
            (Ok(local), Err(err)) => {
                warn!(key = %key, error = %err, "remote unavailable, serving local snapshot");
                self.update_state(key, |s| {
                    s.phase = if s.pending {
                        SyncPhase::Diverged(Divergence::LocalAhead)
                    } else {
                        SyncPhase::Synced
                    };
                });
                return Ok(local.map(|s| s.data).unwrap_or_default());
            }
            (Err(storage), Ok(remote)) => {
                error!(key = %key, error = %storage, "local snapshot unreadable, serving remote copy");
                self.remote_reachable();
                let Some(record) = remote else {
                    self.update_state(key, |s| s.phase = SyncPhase::Synced);
                    return Ok(Collection::new());
                };
                self.observe(record.timestamp);
                self.update_state(key, |s| s.phase = SyncPhase::Diverged(Divergence::RemoteAhead));
                return Ok(record.data);
            }
            (Err(storage), Err(network)) => {
                error!(key = %key, storage = %storage, network = %network, "no data source available");
                self.update_state(key, |s| {
                    if s.phase == SyncPhase::Loading {
                        s.phase = SyncPhase::Unloaded;
                    }
                });
                return Err(storage.into());
            }
        };

        let resolution = resolve(local.as_ref(), remote.as_ref());
        let mut phase = resolution.resulting_phase();

        let data = match (resolution, local, remote) {
            (Resolution::AcceptRemote { overwrites_local }, local, Some(record)) => {
                if overwrites_local {
                    info!(
                        key = %key,
                        local_ts = ?local.as_ref().map(|s| s.last_modified),
                        remote_ts = record.timestamp,
                        from_device = %record.device_id,
                        "remote snapshot overwrites local"
                    );
                }
                self.observe(record.timestamp);
                if let Err(err) = self.shared.local.write(key, &record.data, record.timestamp) {
                    error!(key = %key, error = %err, "cannot store remote snapshot");
                    phase = SyncPhase::Diverged(Divergence::RemoteAhead);
                }
                record.data
            }
            (Resolution::KeepLocal { remote_present }, Some(snapshot), remote) => {
                self.observe(snapshot.last_modified);
                if remote
                    .as_ref()
                    .is_some_and(|r| self.is_own_copy(r, &snapshot))
                {
                    phase = SyncPhase::Synced;
                } else if remote_present {
                    info!(
                        key = %key,
                        local_ts = snapshot.last_modified,
                        remote_ts = ?remote.as_ref().map(|r| r.timestamp),
                        "local snapshot is newer than remote"
                    );
                }
                snapshot.data
            }
            (Resolution::InSync, Some(snapshot), _) => snapshot.data,
            _ => Collection::new(),
        };

        let pending = phase == SyncPhase::Diverged(Divergence::LocalAhead);
        self.update_state(key, |s| {
            s.phase = phase;
            s.pending = pending;
        });
        if pending {
            debug!(key = %key, "local ahead of remote, push pending");
        }

        self.remote_reachable();
        Ok(data)
    }

    /// `load` every known key in order. Individual failures are logged and
    /// reported, never raised.
    pub async fn sync_all(&self) -> SyncReport {
        let mut report = SyncReport::default();

        for key in &self.shared.keys {
            match self.load(key).await {
                Ok(_) => report.completed.push(key.clone()),
                Err(err) => {
                    warn!(key = %key, error = %err, "sync failed");
                    report.failed.push((key.clone(), err));
                }
            }
        }
        self.retry_pending();

        info!(
            loaded = report.completed.len(),
            failed = report.failed.len(),
            "sync complete"
        );
        report
    }

    // ========================================================================
    // Change feed
    // ========================================================================

    /// Call `on_change` with every peer write to `key`.
    ///
    /// This device's own writes, stale records and duplicates never reach
    /// the callback. The feed is reopened automatically if it drops.
    pub async fn subscribe<F>(&self, key: &str, on_change: F) -> Result<SubscriptionId>
    where
        F: FnMut(Collection) + Send + 'static,
    {
        self.check_key(key)?;

        let feed = match self.shared.remote.subscribe(key).await {
            Ok(feed) => {
                self.remote_reachable();
                Some(feed)
            }
            Err(err) => {
                warn!(key = %key, error = %err, "change feed unavailable, will retry");
                None
            }
        };

        let seen = match self.shared.local.read(key) {
            Ok(snapshot) => snapshot.map(|s| s.last_modified).unwrap_or(0),
            Err(_) => 0,
        };

        let id = SubscriptionId(self.shared.next_subscription.fetch_add(1, Ordering::SeqCst));
        let cancel = self.shared.shutdown.child_token();
        let task = tokio::spawn(self.clone().run_subscription(
            key.to_string(),
            feed,
            on_change,
            cancel.clone(),
            seen,
        ));

        self.shared.subscriptions.insert(
            id,
            ActiveSubscription {
                key: key.to_string(),
                cancel,
                task,
            },
        );
        debug!(key = %key, id = id.0, "subscribed");
        Ok(id)
    }

    /// Stop one subscription. Returns whether it was active.
    pub fn cancel(&self, id: SubscriptionId) -> bool {
        match self.shared.subscriptions.remove(&id) {
            Some((_, subscription)) => {
                subscription.stop();
                true
            }
            None => false,
        }
    }

    /// Stop every subscription to `key`. Returns how many were stopped.
    pub fn unsubscribe(&self, key: &str) -> usize {
        let ids: Vec<SubscriptionId> = self
            .shared
            .subscriptions
            .iter()
            .filter(|entry| entry.value().key == key)
            .map(|entry| *entry.key())
            .collect();

        ids.into_iter().filter(|id| self.cancel(*id)).count()
    }

    /// Stop all subscriptions and wait for in-flight pushes.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let ids: Vec<SubscriptionId> = self
            .shared
            .subscriptions
            .iter()
            .map(|entry| *entry.key())
            .collect();
        for id in ids {
            self.cancel(id);
        }
        self.settle().await;
        debug!("orchestrator shut down");
    }

    /// Wait until every background push started so far has finished.
    pub async fn settle(&self) {
        self.shared.pushes.close();
        self.shared.pushes.wait().await;
        self.shared.pushes.reopen();
    }

    async fn run_subscription<F>(
        self,
        key: CollectionKey,
        mut feed: Option<RemoteSubscription>,
        mut on_change: F,
        cancel: CancellationToken,
        mut seen: Timestamp,
    ) where
        F: FnMut(Collection) + Send + 'static,
    {
        loop {
            if let Some(mut active) = feed.take() {
                loop {
                    let record = tokio::select! {
                        _ = cancel.cancelled() => return,
                        record = active.next() => record,
                    };
                    let Some(record) = record else {
                        break;
                    };
                    if let Some(data) = self.apply_delivery(&key, record, &mut seen) {
                        if cancel.is_cancelled() {
                            return;
                        }
                        on_change(data);
                    }
                }
                debug!(key = %key, "change feed ended");
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.shared.resubscribe_delay) => {}
            }

            let reopened = tokio::select! {
                _ = cancel.cancelled() => return,
                reopened = self.shared.remote.subscribe(&key) => reopened,
            };
            match reopened {
                Ok(active) => {
                    debug!(key = %key, "change feed reopened");
                    self.remote_reachable();
                    feed = Some(active);
                    // Catch up on writes made while the feed was down.
                    if let Ok(Some(record)) = self.shared.remote.pull(&key).await {
                        if let Some(data) = self.apply_delivery(&key, record, &mut seen) {
                            if cancel.is_cancelled() {
                                return;
                            }
                            on_change(data);
                        }
                    }
                }
                Err(err) => trace!(key = %key, error = %err, "change feed still unavailable"),
            }
        }
    }

    /// Apply one delivered record. Returns the data to hand to the callback,
    /// or `None` when the delivery is an echo, stale or a duplicate.
    fn apply_delivery(
        &self,
        key: &str,
        record: SyncRecord,
        seen: &mut Timestamp,
    ) -> Option<Collection> {
        if record.key != key {
            trace!(key = %key, got = %record.key, "record for another key ignored");
            return None;
        }
        self.observe(record.timestamp);

        if record.is_echo_for(&self.shared.session.device_id) {
            debug!(key = %key, timestamp = record.timestamp, "own write echoed, ignored");
            return None;
        }
        if record.timestamp <= *seen {
            trace!(key = %key, timestamp = record.timestamp, "duplicate delivery dropped");
            return None;
        }

        let local = match self.shared.local.read(key) {
            Ok(local) => local,
            Err(err) => {
                error!(key = %key, error = %err, "cannot apply remote change");
                return None;
            }
        };

        if should_apply(local.as_ref(), record.timestamp) {
            if let Some(existing) = &local {
                info!(
                    key = %key,
                    local_ts = existing.last_modified,
                    remote_ts = record.timestamp,
                    from_device = %record.device_id,
                    "remote change overwrites local snapshot"
                );
            }
            if let Err(err) = self.shared.local.write(key, &record.data, record.timestamp) {
                error!(key = %key, error = %err, "cannot store remote change");
                return None;
            }
            self.update_state(key, |s| {
                s.phase = SyncPhase::Synced;
                s.pending = false;
            });
        } else if local.as_ref().map(|s| s.last_modified) != Some(record.timestamp) {
            // Another subscription may already have stored this exact
            // record; anything else is older than what we hold.
            debug!(
                key = %key,
                timestamp = record.timestamp,
                local_ts = ?local.as_ref().map(|s| s.last_modified),
                "stale delivery dropped"
            );
            return None;
        }

        *seen = record.timestamp;
        Some(record.data)
    }

    // ========================================================================
    // State
    // ========================================================================

    pub fn phase(&self, key: &str) -> SyncPhase {
        self.shared
            .states
            .get(key)
            .map(|s| s.phase)
            .unwrap_or_default()
    }

    pub fn status(&self) -> SyncStatus {
        let last = self.shared.last_sync.load(Ordering::SeqCst);
        let last_sync_time = if last == 0 {
            None
        } else {
            i64::try_from(last)
                .ok()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        };

        let mut pending: Vec<CollectionKey> = self
            .shared
            .states
            .iter()
            .filter(|entry| entry.value().pending)
            .map(|entry| entry.key().clone())
            .collect();
        pending.sort();

        SyncStatus {
            last_sync_time,
            device_id: self.shared.session.device_id.clone(),
            online: self.shared.connectivity.is_online(),
            pending,
        }
    }

    /// Writes made through `save` on this device, for in-process listeners.
    pub fn local_changes(&self) -> broadcast::Receiver<LocalChange> {
        self.shared.local_changes.subscribe()
    }

    /// Push every pending key that has no push in flight.
    fn retry_pending(&self) {
        let due: Vec<CollectionKey> = self
            .shared
            .states
            .iter()
            .filter(|entry| entry.value().pending && !entry.value().pushing)
            .map(|entry| entry.key().clone())
            .collect();

        for key in due {
            match self.shared.local.read(&key) {
                Ok(Some(snapshot)) => {
                    debug!(key = %key, "retrying pending push");
                    self.spawn_push(key, snapshot);
                }
                Ok(None) => self.update_state(&key, |s| s.pending = false),
                Err(err) => error!(key = %key, error = %err, "pending snapshot unreadable"),
            }
        }
    }

    fn remote_reachable(&self) {
        self.shared.last_sync.store(now_ms(), Ordering::SeqCst);
        self.retry_pending();
    }

    /// The remote holds exactly what this device last wrote.
    fn is_own_copy(&self, remote: &SyncRecord, local: &LocalSnapshot) -> bool {
        remote.is_echo_for(&self.shared.session.device_id) && remote.data == local.data
    }

    fn check_key(&self, key: &str) -> Result<()> {
        if self.shared.keys.iter().any(|k| k == key) {
            Ok(())
        } else {
            Err(EngineError::UnknownCollection(key.to_string()).into())
        }
    }

    fn update_state(&self, key: &str, f: impl FnOnce(&mut KeyState)) {
        let mut entry = self.shared.states.entry(key.to_string()).or_default();
        f(entry.value_mut());
    }

    fn tick(&self) -> Timestamp {
        let now = now_ms();
        let mut issued = now;
        // Closure always returns Some, so the update cannot fail.
        let _ = self
            .shared
            .clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                issued = LogicalClock::starting_at(last).tick(now);
                Some(issued)
            });
        issued
    }

    fn observe(&self, timestamp: Timestamp) {
        self.shared.clock.fetch_max(timestamp, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("session", &self.shared.session)
            .field("keys", &self.shared.keys)
            .field("subscriptions", &self.shared.subscriptions.len())
            .finish_non_exhaustive()
    }
}

/// Retry pending pushes each time the host reports the network is back.
fn watch_connectivity(shared: Weak<Shared>) {
    let Some(strong) = shared.upgrade() else {
        return;
    };
    let mut online = strong.connectivity.watch();
    let stop = strong.shutdown.clone();
    drop(strong);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if !*online.borrow_and_update() {
                        continue;
                    }
                    let Some(shared) = shared.upgrade() else {
                        break;
                    };
                    debug!("connectivity restored, retrying pending pushes");
                    SyncOrchestrator { shared }.retry_pending();
                }
            }
        }
    });
}

fn log_enforcement(outcome: &EnforcementOutcome) {
    for report in &outcome.reports {
        for repair in &report.repairs {
            warn!(
                rule = %report.rule,
                container = report.container.as_deref().unwrap_or("-"),
                repair = ?repair,
                "repaired referential drift"
            );
        }
    }
    for rule in &outcome.skipped {
        debug!(rule = %rule, "rule skipped, a partner collection is not hydrated");
    }
}

fn now_ms() -> Timestamp {
    Utc::now().timestamp_millis().max(0) as Timestamp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::MemoryBackend, remote::MemoryRemote};
    use serde_json::json;

    fn orchestrator() -> (SyncOrchestrator, MemoryRemote) {
        let remote = MemoryRemote::new();
        let local = LocalStore::new(Arc::new(MemoryBackend::new()));
        let session = Session::new("owner-1", DeviceId::new("dev-a"));
        (
            SyncOrchestrator::new(session, local, Arc::new(remote.clone())),
            remote,
        )
    }

    #[tokio::test]
    async fn unknown_keys_are_rejected() {
        let (sync, _) = orchestrator();
        let err = sync.save("setlists", Collection::new()).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Engine(EngineError::UnknownCollection(_))
        ));
        assert!(sync.load("setlists").await.is_err());
    }

    #[tokio::test]
    async fn clock_is_strictly_increasing() {
        let (sync, _) = orchestrator();
        let a = sync.tick();
        let b = sync.tick();
        sync.observe(b + 1_000_000);
        let c = sync.tick();
        assert!(b > a);
        assert!(c > b + 1_000_000);
    }

    #[tokio::test]
    async fn phases_follow_lifecycle() {
        let (sync, _) = orchestrator();
        assert_eq!(sync.phase("tasks"), SyncPhase::Unloaded);

        sync.load("tasks").await.unwrap();
        assert_eq!(sync.phase("tasks"), SyncPhase::Synced);

        sync.save("tasks", vec![json!({"id": "t1"})].into())
            .await
            .unwrap();
        sync.settle().await;
        assert_eq!(sync.phase("tasks"), SyncPhase::Synced);
    }

    #[tokio::test]
    async fn status_reports_pending_keys() {
        let (sync, remote) = orchestrator();
        remote.set_online(false);

        sync.save("tasks", vec![json!({"id": "t1"})].into())
            .await
            .unwrap();
        sync.settle().await;

        let status = sync.status();
        assert_eq!(status.pending, vec!["tasks".to_string()]);
        assert_eq!(status.device_id, "dev-a");
        assert!(status.online);
        assert!(status.last_sync_time.is_none());
    }
}
