//! The remote authoritative copy of every collection.
//!
//! One document per `(owner, key)` holding the last accepted [`SyncRecord`].
//! Adapters never retry: retry and backoff belong to the orchestrator.

mod http;
mod memory;

pub use http::HttpRemote;
pub use memory::MemoryRemote;

use crate::error::NetworkFailure;
use async_trait::async_trait;
use ensemble_engine::{Collection, CollectionKey, DeviceId, SyncRecord, Timestamp, UserId};
use tokio::sync::mpsc;

#[async_trait]
pub trait RemoteMirror: Send + Sync {
    /// Fetch the current record for `key`, if any.
    async fn pull(&self, key: &str) -> Result<Option<SyncRecord>, NetworkFailure>;

    /// Write a new record and return the timestamp the remote assigned to it.
    async fn push(
        &self,
        key: &str,
        data: &Collection,
        device_id: &DeviceId,
        owner_id: &UserId,
    ) -> Result<Timestamp, NetworkFailure>;

    /// Receive every record written to `key` from now on, including this
    /// device's own writes.
    ///
    /// Delivery is at-least-once; callers must tolerate duplicates.
    async fn subscribe(&self, key: &str) -> Result<RemoteSubscription, NetworkFailure>;
}

/// A live change feed for one key.
///
/// Dropping it (or calling [`close`](Self::close)) releases the underlying
/// stream. `next` returns `None` once the feed ends, e.g. when the
/// connection drops.
#[derive(Debug)]
pub struct RemoteSubscription {
    key: CollectionKey,
    records: mpsc::UnboundedReceiver<SyncRecord>,
}

impl RemoteSubscription {
    pub fn new(key: impl Into<CollectionKey>, records: mpsc::UnboundedReceiver<SyncRecord>) -> Self {
        Self {
            key: key.into(),
            records,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn next(&mut self) -> Option<SyncRecord> {
        self.records.recv().await
    }

    pub fn close(mut self) {
        self.records.close();
    }
}
