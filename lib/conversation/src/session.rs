//! Conversation sessions and the store that owns them.
//!
//! A session is identified locally by a [`LocalSessionId`] allocated at
//! creation. The remote id arrives later (or never) and, once assigned,
//! does not change.

use crate::context::{Context, ContextStamp};
use crate::error::SessionError;
use crate::log::MessageLog;
use crate::message::{Message, MessageRole};
use chrono::{DateTime, Utc};
use counsel_core::{LocalSessionId, RemoteSessionId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Longest generated title, in characters.
const TITLE_MAX_CHARS: usize = 50;

/// A conversation session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSession {
    /// Stable local identity used for selection.
    pub local_id: LocalSessionId,
    /// Identity in the remote store, once allocated.
    pub remote_id: Option<RemoteSessionId>,
    /// Session title.
    pub title: String,
    /// Messages in this session.
    #[serde(rename = "messages")]
    pub log: MessageLog,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the most recent append (or creation).
    pub updated_at: DateTime<Utc>,
}

impl ConversationSession {
    /// Creates an empty session that exists only locally.
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            local_id: LocalSessionId::new(),
            remote_id: None,
            title: title.into(),
            log: MessageLog::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the messages in sequence order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        self.log.messages()
    }

    /// Returns the number of messages.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.log.len()
    }

    /// Binds the session to its remote counterpart.
    ///
    /// Assigning the same id again is accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if a different remote id is already assigned.
    pub fn assign_remote_id(&mut self, remote_id: RemoteSessionId) -> Result<(), SessionError> {
        match &self.remote_id {
            Some(existing) if *existing == remote_id => Ok(()),
            Some(existing) => Err(SessionError::RemoteIdAlreadyAssigned {
                id: self.local_id,
                existing: existing.clone(),
                incoming: remote_id,
            }),
            None => {
                self.remote_id = Some(remote_id);
                Ok(())
            }
        }
    }

    /// Appends a message and moves `updated_at` to its timestamp.
    pub fn append(
        &mut self,
        role: MessageRole,
        content: impl Into<String>,
        context: ContextStamp,
    ) -> Message {
        let message = self.log.append(role, content, context).clone();
        self.updated_at = message.timestamp;
        message
    }

    /// Merges the remote message list into the log.
    ///
    /// See [`MessageLog::merge_remote`]. `updated_at` follows the newest
    /// message. Returns true if the log changed.
    pub fn merge_remote_messages(&mut self, messages: Vec<Message>) -> bool {
        let changed = self.log.merge_remote(messages);
        if let Some(last) = self.log.last() {
            self.updated_at = self.updated_at.max(last.timestamp);
        }
        changed
    }

    /// Returns the highest sequence number the remote store acknowledged.
    #[must_use]
    pub fn max_persisted_sequence(&self) -> Option<u64> {
        self.messages()
            .iter()
            .filter(|m| m.persisted)
            .map(|m| m.sequence_number)
            .max()
    }

    /// Returns the context of the most recent message.
    #[must_use]
    pub fn last_context(&self) -> Context {
        self.log
            .last()
            .map(|m| m.context.to_context())
            .unwrap_or_default()
    }

    /// Titles the session after its first user message.
    ///
    /// Only replaces `placeholder`; returns true if the title changed.
    pub fn generate_title(&mut self, placeholder: &str) -> bool {
        if self.title != placeholder && !self.title.trim().is_empty() {
            return false;
        }

        let Some(first) = self
            .messages()
            .iter()
            .find(|m| m.role == MessageRole::User)
        else {
            return false;
        };

        let content = first.content.trim();
        let title = if content.chars().count() > TITLE_MAX_CHARS {
            let head: String = content.chars().take(TITLE_MAX_CHARS - 3).collect();
            format!("{}...", head.trim_end())
        } else {
            content.to_string()
        };
        if title.is_empty() || title == self.title {
            return false;
        }
        self.title = title;
        true
    }

    /// Returns the list-view projection of this session.
    #[must_use]
    pub fn summary(&self, active: bool) -> SessionSummary {
        SessionSummary {
            local_id: self.local_id,
            remote_id: self.remote_id.clone(),
            title: self.title.clone(),
            message_count: self.message_count(),
            updated_at: self.updated_at,
            active,
        }
    }
}

/// What the session list shows for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    /// Selection key.
    pub local_id: LocalSessionId,
    /// Remote identity, if allocated.
    pub remote_id: Option<RemoteSessionId>,
    /// Session title.
    pub title: String,
    /// Number of messages.
    pub message_count: usize,
    /// Last activity.
    pub updated_at: DateTime<Utc>,
    /// Whether this is the active session.
    pub active: bool,
}

/// Owns every known session, the active selection and deletion tombstones.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    sessions: HashMap<LocalSessionId, ConversationSession>,
    active: Option<LocalSessionId>,
    deleted_remote_ids: BTreeSet<RemoteSessionId>,
}

impl SessionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores a store from cached sessions, tombstones and selection.
    ///
    /// Sessions sharing a local id collapse to the most recently updated.
    /// A selection naming a missing session is dropped.
    #[must_use]
    pub fn restore(
        sessions: Vec<ConversationSession>,
        deleted_remote_ids: impl IntoIterator<Item = RemoteSessionId>,
        active: Option<LocalSessionId>,
    ) -> Self {
        let mut store = Self {
            deleted_remote_ids: deleted_remote_ids.into_iter().collect(),
            active,
            ..Self::default()
        };
        store.replace_all(sessions);
        store
    }

    /// Adds a new local-only session and makes it active.
    pub fn create(&mut self, title: impl Into<String>) -> LocalSessionId {
        let session = ConversationSession::new(title);
        let id = session.local_id;
        self.sessions.insert(id, session);
        self.active = Some(id);
        id
    }

    /// Returns a session by id.
    #[must_use]
    pub fn get(&self, id: LocalSessionId) -> Option<&ConversationSession> {
        self.sessions.get(&id)
    }

    /// Returns a session by id for mutation.
    ///
    /// # Errors
    ///
    /// Returns an error if the session does not exist.
    pub fn get_mut(&mut self, id: LocalSessionId) -> Result<&mut ConversationSession, SessionError> {
        self.sessions
            .get_mut(&id)
            .ok_or(SessionError::NotFound { id })
    }

    /// Finds the local session bound to a remote id.
    #[must_use]
    pub fn find_by_remote(&self, remote_id: &RemoteSessionId) -> Option<LocalSessionId> {
        self.sessions
            .values()
            .find(|s| s.remote_id.as_ref() == Some(remote_id))
            .map(|s| s.local_id)
    }

    /// Marks a session active.
    ///
    /// # Errors
    ///
    /// Returns an error if the session does not exist; the selection is
    /// cleared in that case.
    pub fn select(&mut self, id: LocalSessionId) -> Result<&ConversationSession, SessionError> {
        if !self.sessions.contains_key(&id) {
            self.active = None;
            return Err(SessionError::NotFound { id });
        }
        self.active = Some(id);
        self.sessions.get(&id).ok_or(SessionError::NotFound { id })
    }

    /// Returns the active session id.
    #[must_use]
    pub fn active_id(&self) -> Option<LocalSessionId> {
        self.active
    }

    /// Returns the active session.
    #[must_use]
    pub fn active(&self) -> Option<&ConversationSession> {
        self.active.and_then(|id| self.sessions.get(&id))
    }

    /// Removes a session.
    ///
    /// Its remote id is remembered so reconciliation will not resurrect it.
    pub fn delete(&mut self, id: LocalSessionId) -> Option<ConversationSession> {
        let removed = self.sessions.remove(&id)?;
        if let Some(remote_id) = &removed.remote_id {
            self.deleted_remote_ids.insert(remote_id.clone());
        }
        if self.active == Some(id) {
            self.active = None;
        }
        Some(removed)
    }

    /// Binds session `id` to the remote session just created for it.
    ///
    /// A reconciliation that ran while the create call was in flight may
    /// have imported the new remote session as a separate entry. That copy
    /// is folded into `id`, so the conversation is listed once under its
    /// original local id.
    ///
    /// # Errors
    ///
    /// Returns an error if the session does not exist or is bound to a
    /// different remote id.
    pub fn bind_remote(
        &mut self,
        id: LocalSessionId,
        remote_id: RemoteSessionId,
    ) -> Result<(), SessionError> {
        self.get_mut(id)?.assign_remote_id(remote_id.clone())?;

        let copy_id = self
            .sessions
            .values()
            .find(|s| s.local_id != id && s.remote_id.as_ref() == Some(&remote_id))
            .map(|s| s.local_id);
        let Some(copy) = copy_id.and_then(|copy_id| self.sessions.remove(&copy_id)) else {
            return Ok(());
        };
        if self.active == Some(copy.local_id) {
            self.active = Some(id);
        }

        let session = self.get_mut(id)?;
        let acknowledged: Vec<Message> = copy
            .messages()
            .iter()
            .filter(|m| m.persisted)
            .cloned()
            .collect();
        session.merge_remote_messages(acknowledged);
        session.updated_at = session.updated_at.max(copy.updated_at);
        Ok(())
    }

    /// Tombstones a remote session whose local session no longer exists.
    ///
    /// Any copy a reconciliation imported is removed with it.
    pub fn discard_remote(&mut self, remote_id: RemoteSessionId) -> Option<ConversationSession> {
        let copy = self
            .find_by_remote(&remote_id)
            .and_then(|copy_id| self.delete(copy_id));
        self.deleted_remote_ids.insert(remote_id);
        copy
    }

    /// Returns true if a remote session was deleted locally.
    #[must_use]
    pub fn is_deleted(&self, remote_id: &RemoteSessionId) -> bool {
        self.deleted_remote_ids.contains(remote_id)
    }

    /// Returns the deletion tombstones.
    #[must_use]
    pub fn deleted_remote_ids(&self) -> &BTreeSet<RemoteSessionId> {
        &self.deleted_remote_ids
    }

    /// Appends a message to a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session does not exist.
    pub fn append_message(
        &mut self,
        id: LocalSessionId,
        role: MessageRole,
        content: impl Into<String>,
        context: ContextStamp,
    ) -> Result<Message, SessionError> {
        Ok(self.get_mut(id)?.append(role, content, context))
    }

    /// Returns a session's messages in sequence order.
    ///
    /// # Errors
    ///
    /// Returns an error if the session does not exist.
    pub fn messages(&self, id: LocalSessionId) -> Result<&[Message], SessionError> {
        self.get(id)
            .map(ConversationSession::messages)
            .ok_or(SessionError::NotFound { id })
    }

    /// Returns sessions most recently updated first.
    #[must_use]
    pub fn sessions(&self) -> Vec<&ConversationSession> {
        let mut sessions: Vec<_> = self.sessions.values().collect();
        sessions.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.local_id.cmp(&a.local_id))
        });
        sessions
    }

    /// Returns summaries most recently updated first.
    #[must_use]
    pub fn list(&self) -> Vec<SessionSummary> {
        self.sessions()
            .into_iter()
            .map(|s| s.summary(self.active == Some(s.local_id)))
            .collect()
    }

    /// Replaces every session in one step, keeping a still-present selection.
    pub fn replace_all(&mut self, sessions: Vec<ConversationSession>) {
        let mut replaced: HashMap<LocalSessionId, ConversationSession> =
            HashMap::with_capacity(sessions.len());
        for session in sessions {
            match replaced.get(&session.local_id) {
                Some(existing) if existing.updated_at >= session.updated_at => {}
                _ => {
                    replaced.insert(session.local_id, session);
                }
            }
        }
        self.sessions = replaced;
        if self.active.is_some_and(|id| !self.sessions.contains_key(&id)) {
            self.active = None;
        }
    }

    /// Returns the number of sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if there are no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use counsel_core::AnalysisId;

    #[test]
    fn session_creation() {
        let session = ConversationSession::new("New conversation");
        assert!(session.remote_id.is_none());
        assert!(session.messages().is_empty());
        assert_eq!(session.created_at, session.updated_at);
    }

    #[test]
    fn append_moves_updated_at_to_message_timestamp() {
        let mut session = ConversationSession::new("t");
        let message = session.append(MessageRole::User, "Hello!", ContextStamp::default());
        assert_eq!(session.updated_at, message.timestamp);
        assert_eq!(session.message_count(), 1);
    }

    #[test]
    fn remote_id_is_assigned_once() {
        let mut session = ConversationSession::new("t");
        session
            .assign_remote_id(RemoteSessionId::new("r-1"))
            .expect("first assignment");
        session
            .assign_remote_id(RemoteSessionId::new("r-1"))
            .expect("same id again");

        let err = session
            .assign_remote_id(RemoteSessionId::new("r-2"))
            .unwrap_err();
        assert!(matches!(err, SessionError::RemoteIdAlreadyAssigned { .. }));
        assert_eq!(session.remote_id, Some(RemoteSessionId::new("r-1")));
    }

    #[test]
    fn generate_title_from_first_user_message() {
        let mut session = ConversationSession::new("New conversation");
        session.append(
            MessageRole::User,
            "What is the notice period?",
            ContextStamp::default(),
        );
        session.append(MessageRole::Assistant, "Thirty days.", ContextStamp::default());

        assert!(session.generate_title("New conversation"));
        assert_eq!(session.title, "What is the notice period?");
        assert!(!session.generate_title("New conversation"));
    }

    #[test]
    fn generate_title_truncates_on_char_boundary() {
        let mut session = ConversationSession::new("New conversation");
        let long = "é".repeat(80);
        session.append(MessageRole::User, long, ContextStamp::default());

        assert!(session.generate_title("New conversation"));
        assert!(session.title.ends_with("..."));
        assert_eq!(session.title.chars().count(), 50);
    }

    #[test]
    fn last_context_reflects_latest_message() {
        let mut session = ConversationSession::new("t");
        assert_eq!(session.last_context(), Context::None);
        session.append(
            MessageRole::User,
            "q",
            Context::Contract {
                id: AnalysisId::new("ctr-1"),
                label: None,
            }
            .stamp(),
        );
        assert_eq!(session.last_context().id(), Some(&AnalysisId::new("ctr-1")));
    }

    #[test]
    fn store_create_selects_new_session() {
        let mut store = SessionStore::new();
        let id = store.create("t");
        assert_eq!(store.active_id(), Some(id));
        assert_eq!(store.list().len(), 1);
        assert!(store.list()[0].active);
    }

    #[test]
    fn select_unknown_session_clears_selection() {
        let mut store = SessionStore::new();
        store.create("t");
        let missing = LocalSessionId::new();
        let err = store.select(missing).unwrap_err();
        assert_eq!(err, SessionError::NotFound { id: missing });
        assert!(store.active().is_none());
    }

    #[test]
    fn delete_records_tombstone_and_clears_selection() {
        let mut store = SessionStore::new();
        let id = store.create("t");
        store
            .get_mut(id)
            .expect("session")
            .assign_remote_id(RemoteSessionId::new("r-1"))
            .expect("assign");

        assert!(store.delete(id).is_some());
        assert!(store.get(id).is_none());
        assert!(store.active_id().is_none());
        assert!(store.is_deleted(&RemoteSessionId::new("r-1")));
        assert!(store.delete(id).is_none());
    }

    #[test]
    fn binding_folds_a_reconciled_copy_into_the_original() {
        let mut store = SessionStore::new();
        let mine = store.create("Mine");

        let mut copy = ConversationSession::new("Mine");
        copy.remote_id = Some(RemoteSessionId::new("remote-1"));
        copy.append(MessageRole::User, "from elsewhere", ContextStamp::default());
        copy.log.mark_persisted(0);
        let copy_id = copy.local_id;
        let mut sessions: Vec<_> = store.sessions().into_iter().cloned().collect();
        sessions.push(copy);
        store.replace_all(sessions);
        store.select(copy_id).expect("select copy");

        store
            .bind_remote(mine, RemoteSessionId::new("remote-1"))
            .expect("bind");

        assert_eq!(store.len(), 1);
        assert!(store.get(copy_id).is_none());
        assert_eq!(store.active_id(), Some(mine));
        let session = store.get(mine).expect("original kept");
        assert_eq!(session.remote_id, Some(RemoteSessionId::new("remote-1")));
        assert_eq!(session.messages()[0].content, "from elsewhere");
        assert_eq!(store.find_by_remote(&RemoteSessionId::new("remote-1")), Some(mine));
    }

    #[test]
    fn binding_a_deleted_session_fails() {
        let mut store = SessionStore::new();
        let id = store.create("t");
        store.delete(id);
        assert_eq!(
            store.bind_remote(id, RemoteSessionId::new("remote-1")),
            Err(SessionError::NotFound { id })
        );
    }

    #[test]
    fn discarding_a_remote_id_tombstones_it_and_drops_copies() {
        let mut store = SessionStore::new();
        let copy = store.create("copy");
        store
            .get_mut(copy)
            .expect("session")
            .assign_remote_id(RemoteSessionId::new("remote-1"))
            .expect("assign");

        let removed = store.discard_remote(RemoteSessionId::new("remote-1"));

        assert_eq!(removed.map(|s| s.local_id), Some(copy));
        assert!(store.is_empty());
        assert!(store.is_deleted(&RemoteSessionId::new("remote-1")));

        assert!(store.discard_remote(RemoteSessionId::new("remote-2")).is_none());
        assert!(store.is_deleted(&RemoteSessionId::new("remote-2")));
    }

    #[test]
    fn list_is_sorted_by_updated_at_descending() {
        let mut store = SessionStore::new();
        let older = store.create("older");
        let newer = store.create("newer");
        store.get_mut(newer).expect("session").updated_at -= chrono::Duration::minutes(1);
        store
            .append_message(older, MessageRole::User, "bump", ContextStamp::default())
            .expect("append");

        let order: Vec<_> = store.list().into_iter().map(|s| s.local_id).collect();
        assert_eq!(order, vec![older, newer]);
    }

    #[test]
    fn restore_collapses_duplicate_local_ids() {
        let mut stale = ConversationSession::new("stale");
        let mut fresh = stale.clone();
        fresh.title = "fresh".to_string();
        fresh.append(MessageRole::User, "q", ContextStamp::default());
        stale.title = "stale".to_string();

        let store = SessionStore::restore(
            vec![fresh.clone(), stale],
            Vec::new(),
            Some(LocalSessionId::new()),
        );
        assert_eq!(store.len(), 1);
        assert!(store.active_id().is_none());
        assert_eq!(store.get(fresh.local_id).expect("session").title, "fresh");
    }
}
