//! Lifecycle phase of one collection key on one device.
//!
//! ```text
//! Unloaded -> Loading -> Synced <-> Diverged(LocalAhead) <-> Diverged(RemoteAhead)
//! ```
//!
//! Only `Synced` is quiescent. Divergence is resolved by the orchestrator as
//! soon as it is detected and never surfaced as a user decision.

use serde::{Deserialize, Serialize};

/// Which side holds the newer snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Divergence {
    /// Local snapshot is newer than the remote record (or the only copy)
    LocalAhead,
    /// Remote record is newer than the local snapshot
    RemoteAhead,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "phase", content = "divergence")]
pub enum SyncPhase {
    #[default]
    Unloaded,
    /// Initial hydration in progress
    Loading,
    Synced,
    Diverged(Divergence),
}

impl SyncPhase {
    /// Whether the key has been hydrated at least once.
    pub fn is_hydrated(self) -> bool {
        !matches!(self, SyncPhase::Unloaded | SyncPhase::Loading)
    }

    pub fn is_quiescent(self) -> bool {
        self == SyncPhase::Synced
    }
}
