//! String key/value persistence underneath the local store.
//!
//! Writes are durable before they return. `FileBackend` writes a temporary
//! file, syncs it and renames it over the old value, so a crash leaves either
//! the old or the new snapshot and never a torn one.

use crate::error::StorageFailure;
use dashmap::DashMap;
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

/// A namespaced string-keyed store holding JSON text.
pub trait KeyValueBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageFailure>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageFailure>;
}

/// In-process backend for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    values: DashMap<String, String>,
    unavailable: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail, as a full or revoked disk would.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn check(&self) -> Result<(), StorageFailure> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageFailure::Unavailable("memory backend disabled".into()));
        }
        Ok(())
    }
}

impl KeyValueBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StorageFailure> {
        self.check()?;
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageFailure> {
        self.check()?;
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// One file per key inside a data directory.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Open (and create if needed) the data directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageFailure> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StorageFailure::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(key)))
    }
}

impl KeyValueBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StorageFailure> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageFailure::Io { path, source }),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageFailure> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let io = |source| StorageFailure::Io {
            path: tmp.clone(),
            source,
        };

        let mut file = fs::File::create(&tmp).map_err(io)?;
        file.write_all(value.as_bytes()).map_err(io)?;
        file.sync_all().map_err(io)?;
        drop(file);

        fs::rename(&tmp, &path).map_err(|source| StorageFailure::Io { path, source })
    }
}

/// Map a key onto a portable file name. Bytes outside `[A-Za-z0-9._-]` are
/// percent-encoded so distinct keys never share a file.
fn file_stem(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => out.push(byte as char),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_backend_round_trip() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get("a").unwrap(), None);
        backend.set("a", "1").unwrap();
        backend.set("a", "2").unwrap();
        assert_eq!(backend.get("a").unwrap().as_deref(), Some("2"));
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn memory_backend_can_be_disabled() {
        let backend = MemoryBackend::new();
        backend.set("a", "1").unwrap();
        backend.set_available(false);
        assert!(matches!(
            backend.get("a"),
            Err(StorageFailure::Unavailable(_))
        ));
        assert!(backend.set("a", "2").is_err());
        backend.set_available(true);
        assert_eq!(backend.get("a").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn file_backend_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        backend.set("ensemble:members", r#"{"data":[]}"#).unwrap();

        let reopened = FileBackend::open(dir.path()).unwrap();
        assert_eq!(
            reopened.get("ensemble:members").unwrap().as_deref(),
            Some(r#"{"data":[]}"#)
        );
        assert_eq!(reopened.get("ensemble:tasks").unwrap(), None);
    }

    #[test]
    fn file_backend_creates_nested_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let backend = FileBackend::open(&nested).unwrap();
        backend.set("k", "v").unwrap();
        assert!(nested.join("k.json").exists());
        assert!(!nested.join("k.json.tmp").exists());
    }

    #[test]
    fn file_stems_do_not_collide() {
        assert_eq!(file_stem("ensemble:members"), "ensemble%3Amembers");
        assert_ne!(file_stem("a/b"), file_stem("a_b"));
        assert_eq!(file_stem("plain-key_1.x"), "plain-key_1.x");
    }
}
