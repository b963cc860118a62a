//! The facade a UI talks to.
//!
//! [`ChatService`] owns the shared store and wires the reconciliation
//! engine and dispatcher to it. All operations return immediately from the
//! local cache where they can; network work either runs in the background
//! (reconciliation) or is awaited by the caller (send).

use crate::cache::LocalCache;
use crate::config::ConversationConfig;
use crate::context::Context;
use crate::dispatch::{ChatDispatcher, SendOutcome};
use crate::error::ChatError;
use crate::message::Message;
use crate::reconcile::{ReconcileOutcome, ReconciliationEngine};
use crate::remote::{AnalysisLookup, ChatBackend, ConversationRemote};
use crate::session::SessionSummary;
use crate::state::SharedState;
use counsel_core::{AnalysisId, LocalSessionId, UserId};
use rootcause::prelude::Report;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use crate::state::ServiceStatus;

struct Inner {
    config: ConversationConfig,
    state: SharedState,
    remote: Arc<dyn ConversationRemote>,
    engine: ReconciliationEngine,
    dispatcher: ChatDispatcher,
    shutdown: CancellationToken,
    refresh: Mutex<Option<(LocalSessionId, CancellationToken)>>,
}

/// Conversation sessions for one user, cached locally and synced remotely.
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct ChatService {
    inner: Arc<Inner>,
}

impl ChatService {
    /// Creates the service and publishes the cached session list.
    ///
    /// No network call is made; call [`start_sync`](Self::start_sync) to
    /// reconcile with the remote store.
    #[must_use]
    pub fn new(
        config: ConversationConfig,
        user_id: UserId,
        remote: Arc<dyn ConversationRemote>,
        backend: Arc<dyn ChatBackend>,
        lookup: Arc<dyn AnalysisLookup>,
        cache: Arc<dyn LocalCache>,
    ) -> Self {
        let state = SharedState::load(cache, config.cache_namespace.clone());
        let engine = ReconciliationEngine::new(remote.clone(), user_id.clone(), &config);
        let dispatcher =
            ChatDispatcher::new(remote.clone(), backend, lookup, user_id, &config);
        Self {
            inner: Arc::new(Inner {
                config,
                state,
                remote,
                engine,
                dispatcher,
                shutdown: CancellationToken::new(),
                refresh: Mutex::new(None),
            }),
        }
    }

    /// Session list, most recently updated first.
    pub fn subscribe_sessions(&self) -> watch::Receiver<Vec<SessionSummary>> {
        self.inner.state.subscribe_sessions()
    }

    /// Messages of the active session in sequence order.
    pub fn subscribe_messages(&self) -> watch::Receiver<Vec<Message>> {
        self.inner.state.subscribe_messages()
    }

    /// The active context.
    pub fn subscribe_context(&self) -> watch::Receiver<Context> {
        self.inner.state.subscribe_context()
    }

    /// Loading and error state.
    pub fn subscribe_status(&self) -> watch::Receiver<ServiceStatus> {
        self.inner.state.subscribe_status()
    }

    /// Returns the current loading and error state.
    #[must_use]
    pub fn status(&self) -> ServiceStatus {
        self.inner.state.status()
    }

    /// Returns the sessions, most recently updated first.
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        self.inner.state.read(|store| store.list()).await
    }

    /// Returns the id of the active session.
    pub async fn active_session(&self) -> Option<LocalSessionId> {
        self.inner.state.read(|store| store.active_id()).await
    }

    /// Returns the messages of a session.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::SessionNotFound`] for an unknown id.
    pub async fn messages(&self, id: LocalSessionId) -> counsel_core::Result<Vec<Message>, ChatError> {
        self.inner
            .state
            .read(|store| store.messages(id).map(<[Message]>::to_vec))
            .await
            .map_err(|e| Report::from(ChatError::from(e)))
    }

    /// Creates a session, makes it active and sets `initial` as the context.
    ///
    /// The session is usable at once. A remote session is allocated before
    /// returning; if that fails the session stays local until its next
    /// persisted write.
    #[instrument(skip(self, initial))]
    pub async fn create_session(
        &self,
        initial: Context,
        title: Option<String>,
    ) -> LocalSessionId {
        let title = title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| self.inner.config.default_title.clone());
        let id = self.inner.state.commit(|store| store.create(title)).await;
        self.inner.state.update_context(|b| b.set(initial)).await;
        self.cancel_refresh(None).await;

        match self.inner.dispatcher.allocate_remote_id(&self.inner.state, id).await {
            Some(remote_id) => debug!(session = %id, remote_session = %remote_id, "session created"),
            None => info!(session = %id, "session created locally only"),
        }
        id
    }

    /// Makes a session active and returns its cached messages.
    ///
    /// A background refresh fetches the session's latest remote messages;
    /// it is cancelled if another session is selected first. An unknown id
    /// clears the selection and yields no messages.
    #[instrument(skip(self))]
    pub async fn select_session(&self, id: LocalSessionId) -> Vec<Message> {
        let selected = self
            .inner
            .state
            .commit(|store| store.select(id).map(|s| s.messages().to_vec()))
            .await;
        let messages = match selected {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, "selected session is gone, showing an empty session");
                self.cancel_refresh(None).await;
                return Vec::new();
            }
        };

        if self.inner.config.resume_context_on_select {
            self.inner
                .state
                .update_context(|b| b.resume_from(&messages))
                .await;
        }

        let token = self.inner.shutdown.child_token();
        if let Some((_, previous)) = self
            .inner
            .refresh
            .lock()
            .await
            .replace((id, token.clone()))
        {
            previous.cancel();
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.state.update_status(|s| s.syncing += 1);
            let outcome = inner.engine.refresh_session(&inner.state, id, &token).await;
            inner
                .state
                .update_status(|s| s.syncing = s.syncing.saturating_sub(1));
            debug!(session = %id, ?outcome, "session refresh finished");
        });

        messages
    }

    /// Deletes a session locally, then remotely on a best-effort basis.
    ///
    /// Waits for a send or remote allocation already running on the
    /// session. The session never reappears through reconciliation, even if
    /// the remote delete fails.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::SessionNotFound`] for an unknown id.
    #[instrument(skip(self))]
    pub async fn delete_session(&self, id: LocalSessionId) -> counsel_core::Result<(), ChatError> {
        self.cancel_refresh(Some(id)).await;
        let removed = self
            .inner
            .dispatcher
            .delete(&self.inner.state, id)
            .await
            .ok_or_else(|| Report::from(ChatError::SessionNotFound { id }))?;

        if let Some(remote_id) = removed.remote_id {
            if let Err(e) = self.inner.remote.delete_session(&remote_id).await {
                warn!(remote_session = %remote_id, error = %e, "remote delete failed, local delete stands");
            }
        }
        info!(session = %id, "session deleted");
        Ok(())
    }

    /// Sends a query in the active session under the active context.
    ///
    /// Without an active session one is created first.
    ///
    /// # Errors
    ///
    /// - [`ChatError::Validation`] if the query is blank or too long
    /// - [`ChatError::SendFailure`] if the backend failed; carries the query
    /// - [`ChatError::SessionNotFound`] if the session was deleted mid-send
    #[instrument(skip(self, text))]
    pub async fn send(&self, text: &str) -> counsel_core::Result<SendOutcome, ChatError> {
        let state = &self.inner.state;
        self.inner
            .dispatcher
            .validate(text)
            .map_err(|e| self.record_error(e))?;

        let context = state.context().await;
        let id = match state.read(|store| store.active_id()).await {
            Some(id) => id,
            None => {
                let title = self.inner.config.default_title.clone();
                state.commit(|store| store.create(title)).await
            }
        };

        state.update_status(|s| {
            s.sending = true;
            s.last_error = None;
        });
        let result = self.inner.dispatcher.send(state, id, text, context).await;
        state.update_status(|s| s.sending = false);

        result.map_err(|e| self.record_error(e))
    }

    fn record_error(&self, error: ChatError) -> Report<ChatError> {
        let recorded = error.clone();
        self.inner
            .state
            .update_status(|s| s.last_error = Some(recorded));
        Report::from(error)
    }

    /// Returns the active context.
    pub async fn context(&self) -> Context {
        self.inner.state.context().await
    }

    /// Replaces the active context. Existing messages are unaffected.
    pub async fn set_context(&self, context: Context) {
        self.inner.state.update_context(|b| b.set(context)).await;
    }

    /// Grounds the next messages in a situation analysis.
    pub async fn select_situation(&self, id: AnalysisId, label: Option<String>) {
        self.inner
            .state
            .update_context(|b| b.select_situation(id, label))
            .await;
    }

    /// Grounds the next messages in a contract analysis.
    pub async fn select_contract(&self, id: AnalysisId, label: Option<String>) {
        self.inner
            .state
            .update_context(|b| b.select_contract(id, label))
            .await;
    }

    /// Drops the active context.
    pub async fn clear_context(&self) {
        self.inner.state.update_context(|b| b.clear()).await;
    }

    /// Applies a context carried by an external link, e.g.
    /// `("situation", "sit-1")`.
    pub async fn apply_link(&self, context_type: &str, id: &str, label: Option<String>) {
        self.inner
            .state
            .update_context(|b| b.apply_link(context_type, id, label))
            .await;
    }

    /// Reconciles the session list with the remote store.
    ///
    /// Failures are logged and leave the cache untouched.
    pub async fn reconcile(&self) -> ReconcileOutcome {
        let token = self.inner.shutdown.child_token();
        Self::run_reconcile(&self.inner, &token).await
    }

    /// Reconciles in the background.
    pub fn start_sync(&self) -> JoinHandle<ReconcileOutcome> {
        let inner = Arc::clone(&self.inner);
        let token = inner.shutdown.child_token();
        tokio::spawn(async move { Self::run_reconcile(&inner, &token).await })
    }

    /// Refreshes one session's messages from the remote store and waits.
    pub async fn refresh_session(&self, id: LocalSessionId) -> ReconcileOutcome {
        let token = self.inner.shutdown.child_token();
        self.inner
            .engine
            .refresh_session(&self.inner.state, id, &token)
            .await
    }

    /// Cancels every background reconciliation. In-flight work writes nothing.
    pub fn shutdown(&self) {
        info!("shutting down conversation service");
        self.inner.shutdown.cancel();
    }

    async fn run_reconcile(inner: &Inner, token: &CancellationToken) -> ReconcileOutcome {
        inner.state.update_status(|s| s.syncing += 1);
        let outcome = inner.engine.reconcile_sessions(&inner.state, token).await;
        inner
            .state
            .update_status(|s| s.syncing = s.syncing.saturating_sub(1));
        outcome
    }

    /// Cancels the pending refresh, or only the one for `id` if given.
    async fn cancel_refresh(&self, id: Option<LocalSessionId>) {
        let mut refresh = self.inner.refresh.lock().await;
        let matches = match (refresh.as_ref(), id) {
            (Some((current, _)), Some(id)) => *current == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if matches && let Some((_, token)) = refresh.take() {
            token.cancel();
        }
    }
}
