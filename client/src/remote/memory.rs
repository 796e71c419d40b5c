use super::{RemoteMirror, RemoteSubscription};
use crate::error::NetworkFailure;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use ensemble_engine::{
    Collection, CollectionKey, DeviceId, LogicalClock, SyncRecord, Timestamp, UserId,
};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tracing::trace;

/// In-process remote with the same semantics as the sync server.
///
/// Cloning shares the underlying documents, so several orchestrators built on
/// clones behave like devices talking to one server. Timestamps are assigned
/// as `max(now_ms, last + 1)` and every push is delivered to every
/// subscriber, the writer included.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    documents: DashMap<CollectionKey, SyncRecord>,
    subscribers: DashMap<CollectionKey, Vec<mpsc::UnboundedSender<SyncRecord>>>,
    clock: AtomicU64,
    offline: AtomicBool,
    pushes: AtomicU64,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing or regaining the network. While offline every call
    /// fails with [`NetworkFailure::Offline`].
    pub fn set_online(&self, online: bool) {
        self.inner.offline.store(!online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        !self.inner.offline.load(Ordering::SeqCst)
    }

    /// The stored document for `key`.
    pub fn document(&self, key: &str) -> Option<SyncRecord> {
        self.inner.documents.get(key).map(|r| r.value().clone())
    }

    /// Number of pushes accepted so far.
    pub fn push_count(&self) -> u64 {
        self.inner.pushes.load(Ordering::SeqCst)
    }

    /// Number of live subscriptions for `key`.
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.inner
            .subscribers
            .get(key)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Store a record verbatim, keeping its timestamp, without notifying
    /// subscribers. The clock is raised so later pushes sort after it.
    pub fn put(&self, record: SyncRecord) {
        self.observe(record.timestamp);
        self.inner.documents.insert(record.key.clone(), record);
    }

    /// Deliver a record to the subscribers of its key without storing it,
    /// as a redelivering change feed would.
    pub fn deliver(&self, record: SyncRecord) {
        self.broadcast(&record);
    }

    fn next_timestamp(&self) -> Timestamp {
        let now = Utc::now().timestamp_millis().max(0) as Timestamp;
        let mut issued = now;
        // Closure always returns Some, so the update cannot fail.
        let _ = self
            .inner
            .clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                issued = LogicalClock::starting_at(last).tick(now);
                Some(issued)
            });
        issued
    }

    fn observe(&self, timestamp: Timestamp) {
        self.inner.clock.fetch_max(timestamp, Ordering::SeqCst);
    }

    fn broadcast(&self, record: &SyncRecord) {
        if let Some(mut subs) = self.inner.subscribers.get_mut(&record.key) {
            subs.retain(|tx| tx.send(record.clone()).is_ok());
            trace!(key = %record.key, subscribers = subs.len(), "delivered record");
        }
    }

    fn check_online(&self) -> Result<(), NetworkFailure> {
        if self.is_online() {
            Ok(())
        } else {
            Err(NetworkFailure::Offline)
        }
    }
}

#[async_trait]
impl RemoteMirror for MemoryRemote {
    async fn pull(&self, key: &str) -> Result<Option<SyncRecord>, NetworkFailure> {
        self.check_online()?;
        Ok(self.document(key))
    }

    async fn push(
        &self,
        key: &str,
        data: &Collection,
        device_id: &DeviceId,
        owner_id: &UserId,
    ) -> Result<Timestamp, NetworkFailure> {
        self.check_online()?;

        let timestamp = self.next_timestamp();
        let record = SyncRecord::new(key, data.clone(), timestamp, device_id.clone(), owner_id);
        self.inner.documents.insert(key.to_string(), record.clone());
        self.inner.pushes.fetch_add(1, Ordering::SeqCst);
        self.broadcast(&record);

        Ok(timestamp)
    }

    async fn subscribe(&self, key: &str) -> Result<RemoteSubscription, NetworkFailure> {
        self.check_online()?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .entry(key.to_string())
            .or_default()
            .push(tx);
        Ok(RemoteSubscription::new(key, rx))
    }
}

impl std::fmt::Debug for MemoryRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRemote")
            .field("documents", &self.inner.documents.len())
            .field("online", &self.is_online())
            .finish()
    }
}
