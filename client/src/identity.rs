//! Stable per-installation device identifier.

use crate::backend::KeyValueBackend;
use ensemble_engine::DeviceId;
use tracing::{info, warn};
use uuid::Uuid;

/// Reserved key; outside the collection namespace so no collection can
/// shadow it.
pub const DEVICE_ID_KEY: &str = "ensemble.meta:device-id";

/// Read the persisted device id, creating and persisting one on first run.
///
/// Never fails. When persistence is unavailable the returned id lives only
/// in memory for this process.
pub fn get_or_create(backend: &dyn KeyValueBackend) -> DeviceId {
    match backend.get(DEVICE_ID_KEY) {
        Ok(Some(stored)) if !stored.trim().is_empty() => return DeviceId::new(stored.trim()),
        Ok(_) => {}
        Err(err) => {
            warn!(error = %err, "device id unreadable, using an in-memory id");
            return generate();
        }
    }

    let id = generate();
    match backend.set(DEVICE_ID_KEY, id.as_str()) {
        Ok(()) => info!(device_id = %id, "created device id"),
        Err(err) => warn!(device_id = %id, error = %err, "device id not persisted, using an in-memory id"),
    }
    id
}

/// A fresh id: a v7 UUID, i.e. current time plus random entropy.
pub fn generate() -> DeviceId {
    DeviceId::new(Uuid::now_v7().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[test]
    fn created_once_then_reused() {
        let backend = MemoryBackend::new();
        let first = get_or_create(&backend);
        let second = get_or_create(&backend);
        assert_eq!(first, second);
        assert_eq!(
            backend.get(DEVICE_ID_KEY).unwrap().as_deref(),
            Some(first.as_str())
        );
    }

    #[test]
    fn blank_stored_id_is_replaced() {
        let backend = MemoryBackend::new();
        backend.set(DEVICE_ID_KEY, "  ").unwrap();
        let id = get_or_create(&backend);
        assert!(!id.as_str().trim().is_empty());
        assert_eq!(get_or_create(&backend), id);
    }

    #[test]
    fn unavailable_storage_degrades_to_memory() {
        let backend = MemoryBackend::new();
        backend.set_available(false);
        let a = get_or_create(&backend);
        let b = get_or_create(&backend);
        // Each call invents a new id since nothing can be persisted.
        assert_ne!(a, b);
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(generate(), generate());
    }
}
