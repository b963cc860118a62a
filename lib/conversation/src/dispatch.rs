//! Query routing and the send pipeline.
//!
//! A send runs under a per-session queue so the sequence numbers of two
//! quick sends never interleave:
//! 1. Validate the query (no network on failure)
//! 2. Catch up with messages another writer appended remotely
//! 3. Append the user message, stamped with the active context
//! 4. Build the request for the context type and call the chat backend
//! 5. Append the assistant message under the same stamp
//! 6. Persist: allocate the remote session if needed, then flush every
//!    unacknowledged message in sequence order
//!
//! Persistence is best-effort. Messages the remote store has not
//! acknowledged stay `persisted = false` and are flushed on the next send.

use crate::config::ConversationConfig;
use crate::context::Context;
use crate::error::{ChatError, SessionError};
use crate::message::{Message, MessageRole};
use crate::remote::{AnalysisLookup, ChatBackend, ChatRequest, ConversationRemote, RemoteMessage};
use crate::session::ConversationSession;
use crate::state::SharedState;
use counsel_core::{LocalSessionId, RemoteSessionId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// The pair of messages a successful send appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    /// Session the exchange was appended to.
    pub session_id: LocalSessionId,
    /// The user's query.
    pub user: Message,
    /// The backend's answer.
    pub assistant: Message,
}

/// Routes queries to the chat backend and records the exchange.
pub struct ChatDispatcher {
    remote: Arc<dyn ConversationRemote>,
    backend: Arc<dyn ChatBackend>,
    lookup: Arc<dyn AnalysisLookup>,
    user_id: UserId,
    max_query_chars: usize,
    default_title: String,
    queues: Mutex<HashMap<LocalSessionId, Arc<Mutex<()>>>>,
}

impl ChatDispatcher {
    /// Creates a dispatcher for one user.
    #[must_use]
    pub fn new(
        remote: Arc<dyn ConversationRemote>,
        backend: Arc<dyn ChatBackend>,
        lookup: Arc<dyn AnalysisLookup>,
        user_id: UserId,
        config: &ConversationConfig,
    ) -> Self {
        Self {
            remote,
            backend,
            lookup,
            user_id,
            max_query_chars: config.max_query_chars,
            default_title: config.default_title.clone(),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Checks a query and returns it trimmed.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Validation`] for blank or oversized queries.
    pub fn validate<'q>(&self, query: &'q str) -> Result<&'q str, ChatError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ChatError::Validation {
                reason: "query is empty".to_string(),
            });
        }
        let chars = query.chars().count();
        if chars > self.max_query_chars {
            return Err(ChatError::Validation {
                reason: format!(
                    "query is {chars} characters, limit is {}",
                    self.max_query_chars
                ),
            });
        }
        Ok(query)
    }

    /// Builds the backend request for a query under `context`.
    ///
    /// | context   | grounding                                   |
    /// |-----------|---------------------------------------------|
    /// | none      | generic request                             |
    /// | situation | stored findings as `reference_summary`      |
    /// | contract  | contract documents as `reference_ids`       |
    ///
    /// A failed lookup degrades to a request carrying only the context id.
    pub async fn build_request(&self, query: &str, context: &Context) -> ChatRequest {
        match context {
            Context::None => ChatRequest::generic(query),
            Context::Situation { id, .. } => {
                let summary = match self.lookup.situation_summary(id).await {
                    Ok(summary) => Some(summary),
                    Err(e) => {
                        warn!(situation = %id, error = %e, "situation lookup failed, sending without findings");
                        None
                    }
                };
                ChatRequest {
                    query: query.to_string(),
                    context_type: context.context_type(),
                    context_id: Some(id.clone()),
                    reference_summary: summary,
                    reference_ids: Vec::new(),
                }
            }
            Context::Contract { id, .. } => {
                let documents = match self.lookup.contract_documents(id).await {
                    Ok(documents) if !documents.is_empty() => documents,
                    Ok(_) => vec![id.clone()],
                    Err(e) => {
                        warn!(contract = %id, error = %e, "contract lookup failed, referencing the analysis only");
                        vec![id.clone()]
                    }
                };
                ChatRequest {
                    query: query.to_string(),
                    context_type: context.context_type(),
                    context_id: Some(id.clone()),
                    reference_summary: None,
                    reference_ids: documents,
                }
            }
        }
    }

    /// Sends `query` in session `id` under `context`.
    ///
    /// On a backend failure the user message stays in the log and no
    /// assistant message is appended.
    #[instrument(skip(self, state, query, context), fields(context_type = %context.context_type()))]
    pub(crate) async fn send(
        &self,
        state: &SharedState,
        id: LocalSessionId,
        query: &str,
        context: Context,
    ) -> Result<SendOutcome, ChatError> {
        let query = self.validate(query)?;

        let queue = self.queue_for(id).await;
        let _turn = queue.lock().await;

        let remote_id = state
            .read(|store| store.get(id).map(|s| s.remote_id.clone()))
            .await
            .ok_or(ChatError::SessionNotFound { id })?;
        if let Some(remote_id) = remote_id {
            self.catch_up(state, id, &remote_id).await;
        }

        let stamp = context.stamp();
        let (user, retitled) = state
            .commit(|store| {
                let session = store.get_mut(id)?;
                let message = session.append(MessageRole::User, query, stamp.clone());
                let retitled = session.generate_title(&self.default_title);
                Ok::<_, SessionError>((message, retitled))
            })
            .await?;

        let request = self.build_request(query, &context).await;
        let outcome = match self.backend.answer(&request).await {
            Ok(response) => state
                .commit(|store| {
                    store.append_message(id, MessageRole::Assistant, response.answer, stamp)
                })
                .await
                .map(|assistant| SendOutcome {
                    session_id: id,
                    user,
                    assistant,
                })
                .map_err(ChatError::from),
            Err(e) => {
                warn!(session = %id, error = %e, "chat backend failed");
                Err(ChatError::SendFailure {
                    query: query.to_string(),
                    reason: e.to_string(),
                })
            }
        };

        self.persist(state, id, retitled).await;
        outcome
    }

    /// Binds session `id` to a remote session, creating one if needed.
    pub(crate) async fn allocate_remote_id(
        &self,
        state: &SharedState,
        id: LocalSessionId,
    ) -> Option<RemoteSessionId> {
        let queue = self.queue_for(id).await;
        let _turn = queue.lock().await;
        self.ensure_remote_id(state, id).await
    }

    /// Deletes session `id` once its queued work has finished.
    ///
    /// Waiting on the queue means an in-flight allocation has bound its
    /// remote id by the time the session is removed, so the tombstone
    /// covers it.
    pub(crate) async fn delete(
        &self,
        state: &SharedState,
        id: LocalSessionId,
    ) -> Option<ConversationSession> {
        let queue = self.queue_for(id).await;
        let removed = {
            let _turn = queue.lock().await;
            state.commit(|store| store.delete(id)).await
        };
        self.queues.lock().await.remove(&id);
        removed
    }

    async fn queue_for(&self, id: LocalSessionId) -> Arc<Mutex<()>> {
        let mut queues = self.queues.lock().await;
        queues.entry(id).or_default().clone()
    }

    async fn catch_up(&self, state: &SharedState, id: LocalSessionId, remote_id: &RemoteSessionId) {
        let latest = match self.remote.latest_sequence(remote_id).await {
            Ok(latest) => latest,
            Err(e) => {
                debug!(remote_session = %remote_id, error = %e, "could not check remote sequence");
                return;
            }
        };
        let acknowledged = state
            .read(|store| store.get(id).and_then(|s| s.max_persisted_sequence()))
            .await;
        if latest <= acknowledged {
            return;
        }

        let messages = match self.remote.list_messages(remote_id).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(remote_session = %remote_id, error = %e, "could not fetch newer remote messages");
                return;
            }
        };
        let messages: Vec<Message> = messages.into_iter().map(RemoteMessage::into_message).collect();
        state
            .try_commit(|store| {
                let session = store.get_mut(id).ok()?;
                session.merge_remote_messages(messages).then_some(())
            })
            .await;
        debug!(session = %id, ?latest, "caught up with remote writer");
    }

    async fn ensure_remote_id(
        &self,
        state: &SharedState,
        id: LocalSessionId,
    ) -> Option<RemoteSessionId> {
        let (remote_id, title) = state
            .read(|store| store.get(id).map(|s| (s.remote_id.clone(), s.title.clone())))
            .await?;
        if remote_id.is_some() {
            return remote_id;
        }

        let created = match self.remote.create_session(&self.user_id, &title).await {
            Ok(created) => created,
            Err(e) => {
                warn!(session = %id, error = %e, "remote session allocation failed, retrying on next write");
                return None;
            }
        };
        let bound = state
            .commit(|store| {
                let bound = store.bind_remote(id, created.id.clone());
                if matches!(bound, Err(SessionError::NotFound { .. })) {
                    store.discard_remote(created.id.clone());
                }
                bound
            })
            .await;

        match bound {
            Ok(()) => Some(created.id),
            Err(SessionError::NotFound { .. }) => {
                info!(session = %id, remote_session = %created.id, "session deleted while allocating, discarding remote copy");
                if let Err(e) = self.remote.delete_session(&created.id).await {
                    warn!(remote_session = %created.id, error = %e, "failed to delete orphaned remote session");
                }
                None
            }
            Err(e) => {
                warn!(session = %id, error = %e, "session already bound");
                state
                    .read(|store| store.get(id).and_then(|s| s.remote_id.clone()))
                    .await
            }
        }
    }

    async fn persist(&self, state: &SharedState, id: LocalSessionId, retitled: bool) {
        let Some(remote_id) = self.ensure_remote_id(state, id).await else {
            return;
        };

        if retitled {
            let title = state.read(|store| store.get(id).map(|s| s.title.clone())).await;
            if let Some(title) = title {
                if let Err(e) = self.remote.update_title(&remote_id, &title).await {
                    warn!(remote_session = %remote_id, error = %e, "failed to update remote title");
                }
            }
        }

        let pending = state
            .read(|store| store.get(id).map(|s| s.log.unpersisted()).unwrap_or_default())
            .await;
        let mut acknowledged = Vec::with_capacity(pending.len());
        for message in &pending {
            match self
                .remote
                .append_message(&remote_id, &RemoteMessage::from_message(message))
                .await
            {
                Ok(()) => acknowledged.push(message.sequence_number),
                Err(e) => {
                    warn!(
                        remote_session = %remote_id,
                        sequence = message.sequence_number,
                        error = %e,
                        "failed to persist message, will retry"
                    );
                    break;
                }
            }
        }
        if acknowledged.is_empty() {
            return;
        }
        state
            .try_commit(|store| {
                let session = store.get_mut(id).ok()?;
                for sequence in &acknowledged {
                    session.log.mark_persisted(*sequence);
                }
                Some(())
            })
            .await;
    }
}
