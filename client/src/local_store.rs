//! Whole-collection snapshots in local persistence.
//!
//! Each key is stored as a JSON-serialized [`LocalSnapshot`] under
//! `<namespace>:<key>`. No merge logic lives here: `write` overwrites
//! unconditionally and the orchestrator decides what to write.

use crate::{backend::KeyValueBackend, error::StorageFailure};
use ensemble_engine::{Collection, LocalSnapshot, Timestamp};
use std::sync::Arc;

/// Namespace prefix used for collection snapshots.
pub const DEFAULT_NAMESPACE: &str = "ensemble";

#[derive(Clone)]
pub struct LocalStore {
    backend: Arc<dyn KeyValueBackend>,
    namespace: String,
}

impl LocalStore {
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self::with_namespace(backend, DEFAULT_NAMESPACE)
    }

    pub fn with_namespace(backend: Arc<dyn KeyValueBackend>, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn KeyValueBackend> {
        &self.backend
    }

    /// The current snapshot for `key`, if one was ever written.
    pub fn read(&self, key: &str) -> Result<Option<LocalSnapshot>, StorageFailure> {
        let Some(text) = self.backend.get(&self.storage_key(key))? else {
            return Ok(None);
        };
        LocalSnapshot::from_json(&text)
            .map(Some)
            .map_err(|source| StorageFailure::Corrupt {
                key: key.to_string(),
                source,
            })
    }

    /// Replace the snapshot for `key`.
    pub fn write(
        &self,
        key: &str,
        data: &Collection,
        timestamp: Timestamp,
    ) -> Result<LocalSnapshot, StorageFailure> {
        let snapshot = LocalSnapshot::new(data.clone(), timestamp);
        let text = snapshot.to_json().map_err(|source| StorageFailure::Encode {
            key: key.to_string(),
            source,
        })?;
        self.backend.set(&self.storage_key(key), &text)?;
        Ok(snapshot)
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}
