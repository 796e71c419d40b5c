//! UI-facing view of one collection.
//!
//! The only surface CRUD screens use: they read `data`, call `set_data` on
//! edits and watch the state channel for changes. Peer writes arrive through
//! the change feed; writes made elsewhere on this device (another screen, or
//! an enforcer repair of this collection) arrive through the orchestrator's
//! local change feed.

use crate::{
    error::Result,
    orchestrator::{SubscriptionId, SyncOrchestrator},
};
use ensemble_engine::{Collection, CollectionKey, SyncPhase, Timestamp};
use std::sync::Arc;
use tokio::{
    sync::{broadcast::error::RecvError, watch},
    task::JoinHandle,
};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct BindingState {
    pub data: Collection,
    /// An initial load or refresh is in progress
    pub loading: bool,
    /// Last failure, cleared by the next success
    pub error: Option<String>,
}

pub struct CollectionBinding {
    orchestrator: SyncOrchestrator,
    key: CollectionKey,
    state: Arc<watch::Sender<BindingState>>,
    subscription: Option<SubscriptionId>,
    local_feed: Option<JoinHandle<()>>,
}

impl CollectionBinding {
    /// Hydrate `key` and start listening for changes.
    ///
    /// `default` is shown until the first load finishes, and kept if
    /// neither side has ever stored the collection. Failures are recorded in
    /// [`BindingState::error`] rather than returned.
    pub async fn open(
        orchestrator: SyncOrchestrator,
        key: impl Into<CollectionKey>,
        default: Collection,
    ) -> Self {
        let (state, _) = watch::channel(BindingState {
            data: default,
            loading: true,
            error: None,
        });
        let mut binding = Self {
            orchestrator,
            key: key.into(),
            state: Arc::new(state),
            subscription: None,
            local_feed: None,
        };

        let _ = binding.refresh().await;
        binding.listen().await;
        binding
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn data(&self) -> Collection {
        self.state.borrow().data.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.state.borrow().loading
    }

    pub fn error(&self) -> Option<String> {
        self.state.borrow().error.clone()
    }

    pub fn phase(&self) -> SyncPhase {
        self.orchestrator.phase(&self.key)
    }

    /// Receive every state change.
    pub fn watch(&self) -> watch::Receiver<BindingState> {
        self.state.subscribe()
    }

    /// Replace the collection. The stored value, possibly repaired by the
    /// enforcer, becomes the new state.
    pub async fn set_data(&self, data: Collection) -> Result<()> {
        match self.orchestrator.save(&self.key, data.clone()).await {
            Ok(stored) => {
                self.state.send_modify(|s| {
                    s.data = stored;
                    s.error = None;
                });
                Ok(())
            }
            Err(err) => {
                self.state.send_modify(|s| {
                    s.data = data;
                    s.error = Some(err.to_string());
                });
                Err(err)
            }
        }
    }

    /// Reload from the orchestrator.
    pub async fn refresh(&self) -> Result<()> {
        self.state.send_modify(|s| s.loading = true);

        let result = self.orchestrator.load(&self.key).await;
        let never_stored = matches!(self.orchestrator.local_store().read(&self.key), Ok(None));

        match result {
            Ok(data) => {
                self.state.send_modify(|s| {
                    if !(data.is_empty() && never_stored) {
                        s.data = data;
                    }
                    s.loading = false;
                    s.error = None;
                });
                Ok(())
            }
            Err(err) => {
                self.state.send_modify(|s| {
                    s.loading = false;
                    s.error = Some(err.to_string());
                });
                Err(err)
            }
        }
    }

    /// Push the current in-memory value and wait for the remote to accept it.
    pub async fn sync(&self) -> Result<Timestamp> {
        let data = self.data();
        match self.orchestrator.push_now(&self.key, data).await {
            Ok(timestamp) => {
                self.state.send_modify(|s| s.error = None);
                Ok(timestamp)
            }
            Err(err) => {
                self.state.send_modify(|s| s.error = Some(err.to_string()));
                Err(err)
            }
        }
    }

    /// Release the subscription and the local change listener.
    pub fn close(mut self) {
        self.release();
    }

    async fn listen(&mut self) {
        let state = self.state.clone();
        let subscribed = self
            .orchestrator
            .subscribe(&self.key, move |data| {
                state.send_modify(|s| {
                    s.data = data;
                    s.error = None;
                });
            })
            .await;
        match subscribed {
            Ok(id) => self.subscription = Some(id),
            Err(err) => {
                warn!(key = %self.key, error = %err, "binding has no change feed");
                self.state.send_modify(|s| s.error = Some(err.to_string()));
            }
        }

        let mut changes = self.orchestrator.local_changes();
        let orchestrator = self.orchestrator.clone();
        let state = self.state.clone();
        let key = self.key.clone();
        self.local_feed = Some(tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) if change.key == key => {
                        state.send_modify(|s| s.data = change.data);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(key = %key, skipped, "binding lagged, rereading local snapshot");
                        if let Ok(Some(snapshot)) = orchestrator.local_store().read(&key) {
                            state.send_modify(|s| s.data = snapshot.data);
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }

    fn release(&mut self) {
        if let Some(id) = self.subscription.take() {
            self.orchestrator.cancel(id);
        }
        if let Some(task) = self.local_feed.take() {
            task.abort();
        }
    }
}

impl Drop for CollectionBinding {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for CollectionBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionBinding")
            .field("key", &self.key)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}
