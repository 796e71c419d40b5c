//! # Ensemble Client
//!
//! Local-first sync for the ensemble manager, device side.
//!
//! Every named collection lives in a [`LocalStore`] and is mirrored to a
//! [`RemoteMirror`]. The [`SyncOrchestrator`] is the single entry point:
//! writes land locally first and reach the remote in the background, loads
//! resolve local against remote by timestamp, and the change feed applies
//! peer writes while dropping this device's own echoes.
//!
//! Screens use a [`CollectionBinding`] per collection.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ensemble_client::{connect, ClientConfig, CollectionBinding};
//! use ensemble_engine::{Collection, MEMBERS};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let sync = connect(ClientConfig::from_env()?)?;
//! sync.sync_all().await;
//!
//! let members = CollectionBinding::open(sync.clone(), MEMBERS, Collection::new()).await;
//! let mut roster = members.data();
//! roster.push(json!({"id": "m1", "name": "Ana", "assignedInventory": []}));
//! members.set_data(roster).await?;
//!
//! sync.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod binding;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod identity;
pub mod local_store;
pub mod orchestrator;
pub mod remote;

pub use backend::{FileBackend, KeyValueBackend, MemoryBackend};
pub use binding::{BindingState, CollectionBinding};
pub use config::{ClientConfig, ConfigError};
pub use connectivity::Connectivity;
pub use error::{NetworkFailure, Result, StorageFailure, SyncError};
pub use local_store::LocalStore;
pub use orchestrator::{
    LocalChange, OrchestratorBuilder, SaveReport, SubscriptionId, SyncOrchestrator, SyncReport,
    SyncStatus,
};
pub use remote::{HttpRemote, MemoryRemote, RemoteMirror, RemoteSubscription};

use ensemble_engine::Session;
use std::sync::Arc;
use tracing::info;

/// Wire a file-backed store, the persisted device id and the HTTP remote
/// into an orchestrator.
///
/// Must be called from within a Tokio runtime.
pub fn connect(config: ClientConfig) -> Result<SyncOrchestrator> {
    let backend: Arc<dyn KeyValueBackend> = Arc::new(FileBackend::open(&config.data_dir)?);
    let device_id = identity::get_or_create(backend.as_ref());
    let session = Session::new(config.owner_id.clone(), device_id);

    let remote = HttpRemote::new(
        config.server_url.clone(),
        config.bearer_token(),
        config.request_timeout,
    )?;

    info!(
        server = %config.server_url,
        owner_id = %session.owner_id,
        device_id = %session.device_id,
        "sync client ready"
    );

    Ok(
        SyncOrchestrator::builder(session, LocalStore::new(backend), Arc::new(remote))
            .resubscribe_delay(config.resubscribe_delay)
            .build(),
    )
}
