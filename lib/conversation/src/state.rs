//! The single mutable store shared by every writer.
//!
//! Writers go through [`SharedState::commit`], which holds the lock across
//! read, merge and write, then persists the cache and publishes change
//! notifications before releasing it.

use crate::cache::{CacheSnapshot, LocalCache};
use crate::context::{Context, ContextBinder};
use crate::error::ChatError;
use crate::message::Message;
use crate::session::{SessionStore, SessionSummary};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tracing::warn;

/// Loading and error state for the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStatus {
    /// Number of background reconciliations in flight.
    pub syncing: usize,
    /// Whether a send is waiting on the chat backend.
    pub sending: bool,
    /// The most recent error surfaced to the caller.
    pub last_error: Option<ChatError>,
}

impl ServiceStatus {
    /// Returns true if anything is in flight.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.syncing > 0 || self.sending
    }
}

pub(crate) struct SharedState {
    store: Mutex<SessionStore>,
    binder: Mutex<ContextBinder>,
    cache: Arc<dyn LocalCache>,
    namespace: String,
    sessions_tx: watch::Sender<Vec<SessionSummary>>,
    messages_tx: watch::Sender<Vec<Message>>,
    context_tx: watch::Sender<Context>,
    status_tx: watch::Sender<ServiceStatus>,
}

impl SharedState {
    /// Reads the cache synchronously and publishes it.
    pub(crate) fn load(cache: Arc<dyn LocalCache>, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let store = CacheSnapshot::load(cache.as_ref(), &namespace).into_store();

        let (sessions_tx, _) = watch::channel(store.list());
        let (messages_tx, _) = watch::channel(active_messages(&store));
        let (context_tx, _) = watch::channel(Context::None);
        let (status_tx, _) = watch::channel(ServiceStatus::default());

        Self {
            store: Mutex::new(store),
            binder: Mutex::new(ContextBinder::new()),
            cache,
            namespace,
            sessions_tx,
            messages_tx,
            context_tx,
            status_tx,
        }
    }

    /// Runs a read-only closure against the store.
    pub(crate) async fn read<R>(&self, f: impl FnOnce(&SessionStore) -> R) -> R {
        let store = self.store.lock().await;
        f(&store)
    }

    /// Mutates the store, then persists and publishes.
    pub(crate) async fn commit<R>(&self, f: impl FnOnce(&mut SessionStore) -> R) -> R {
        let mut store = self.store.lock().await;
        let out = f(&mut store);
        self.persist_and_publish(&store);
        out
    }

    /// Like [`commit`](Self::commit), but `None` means nothing changed and
    /// nothing is written.
    pub(crate) async fn try_commit<R>(
        &self,
        f: impl FnOnce(&mut SessionStore) -> Option<R>,
    ) -> Option<R> {
        let mut store = self.store.lock().await;
        let out = f(&mut store)?;
        self.persist_and_publish(&store);
        Some(out)
    }

    fn persist_and_publish(&self, store: &SessionStore) {
        if let Err(e) = CacheSnapshot::capture(store).store(self.cache.as_ref(), &self.namespace) {
            warn!(namespace = %self.namespace, error = %e, "failed to write session cache");
        }
        self.sessions_tx.send_replace(store.list());
        self.messages_tx.send_replace(active_messages(store));
    }

    /// Returns the active context.
    pub(crate) async fn context(&self) -> Context {
        self.binder.lock().await.current().clone()
    }

    /// Changes the active context and publishes it.
    pub(crate) async fn update_context<R>(&self, f: impl FnOnce(&mut ContextBinder) -> R) -> R {
        let mut binder = self.binder.lock().await;
        let out = f(&mut binder);
        self.context_tx.send_replace(binder.current().clone());
        out
    }

    /// Adjusts the loading/error state.
    pub(crate) fn update_status(&self, f: impl FnOnce(&mut ServiceStatus)) {
        self.status_tx.send_modify(f);
    }

    pub(crate) fn status(&self) -> ServiceStatus {
        self.status_tx.borrow().clone()
    }

    pub(crate) fn subscribe_sessions(&self) -> watch::Receiver<Vec<SessionSummary>> {
        self.sessions_tx.subscribe()
    }

    pub(crate) fn subscribe_messages(&self) -> watch::Receiver<Vec<Message>> {
        self.messages_tx.subscribe()
    }

    pub(crate) fn subscribe_context(&self) -> watch::Receiver<Context> {
        self.context_tx.subscribe()
    }

    pub(crate) fn subscribe_status(&self) -> watch::Receiver<ServiceStatus> {
        self.status_tx.subscribe()
    }
}

fn active_messages(store: &SessionStore) -> Vec<Message> {
    store
        .active()
        .map(|s| s.messages().to_vec())
        .unwrap_or_default()
}
