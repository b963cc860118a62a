//! Reconciliation of the local cache with the remote store.
//!
//! The cache is published before any network call. A reconciliation then:
//! 1. Fetches the most recent page of remote sessions
//! 2. Fetches their message lists, at most `fetch_concurrency` at a time
//! 3. Races every call against a fixed timeout, keeping the cached value on
//!    expiry or error
//! 4. Merges the result into the current store in a single commit
//!
//! Every step checks a [`CancellationToken`]; a cancelled reconciliation
//! writes nothing.

use crate::config::ConversationConfig;
use crate::error::RemoteError;
use crate::message::Message;
use crate::remote::{ConversationRemote, RemoteMessage, RemoteSession};
use crate::session::ConversationSession;
use crate::state::SharedState;
use counsel_core::{LocalSessionId, RemoteSessionId, UserId};
use futures::future::join_all;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A remote session with its messages, if they could be fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSnapshot {
    /// The remote session description.
    pub session: RemoteSession,
    /// Its messages; `None` when the fetch failed or timed out.
    pub messages: Option<Vec<Message>>,
}

/// How a reconciliation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Remote state was merged; `sessions` is the resulting session count.
    Merged { sessions: usize },
    /// Remote state matched the cache.
    Unchanged,
    /// The reconciliation was cancelled before writing.
    Cancelled,
    /// The remote store could not be reached; the cache stands.
    RemoteUnavailable,
    /// Nothing to reconcile, e.g. a session without a remote id.
    Skipped,
}

/// Merges cached sessions with a remote snapshot.
///
/// Remote sessions come first, matched to cached ones by remote id. A match
/// takes the remote title and message list but keeps its local id. Cached
/// sessions with no remote counterpart follow. Tombstoned remote ids are
/// dropped. The result is sorted most recently updated first.
///
/// Merging the result with the same remote snapshot again yields the same
/// sessions.
#[must_use]
pub fn merge_sessions(
    local: Vec<ConversationSession>,
    remote: Vec<RemoteSnapshot>,
    deleted: &BTreeSet<RemoteSessionId>,
) -> Vec<ConversationSession> {
    let mut by_remote: HashMap<RemoteSessionId, ConversationSession> = HashMap::new();
    let mut unmatched = Vec::new();
    for session in local {
        match session.remote_id.clone() {
            Some(remote_id) => {
                if let Some(duplicate) = by_remote.insert(remote_id, session) {
                    unmatched.push(duplicate);
                }
            }
            None => unmatched.push(session),
        }
    }

    let mut merged = Vec::with_capacity(remote.len() + unmatched.len());
    let mut seen = HashSet::new();
    for snapshot in remote {
        let remote_id = snapshot.session.id.clone();
        if deleted.contains(&remote_id) || !seen.insert(remote_id.clone()) {
            continue;
        }
        let session = match by_remote.remove(&remote_id) {
            Some(mut cached) => {
                apply_remote(&mut cached, snapshot);
                cached
            }
            None => session_from_remote(snapshot),
        };
        merged.push(session);
    }

    merged.extend(by_remote.into_values());
    merged.extend(unmatched);
    merged.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| b.local_id.cmp(&a.local_id))
    });
    merged
}

fn apply_remote(session: &mut ConversationSession, snapshot: RemoteSnapshot) {
    if !snapshot.session.title.trim().is_empty() {
        session.title = snapshot.session.title;
    }
    if let Some(messages) = snapshot.messages {
        session.merge_remote_messages(messages);
    }
    session.updated_at = session.updated_at.max(snapshot.session.updated_at);
}

fn session_from_remote(snapshot: RemoteSnapshot) -> ConversationSession {
    let RemoteSnapshot { session, messages } = snapshot;
    let mut local = ConversationSession::new(session.title);
    local.remote_id = Some(session.id);
    local.created_at = session.created_at;
    local.updated_at = session.updated_at;
    if let Some(messages) = messages {
        local.merge_remote_messages(messages);
    }
    local
}

/// Fetches authoritative state from the remote store without blocking callers.
pub struct ReconciliationEngine {
    remote: Arc<dyn ConversationRemote>,
    user_id: UserId,
    timeout: Duration,
    page_size: usize,
    concurrency: usize,
}

impl ReconciliationEngine {
    /// Creates an engine for one user.
    #[must_use]
    pub fn new(
        remote: Arc<dyn ConversationRemote>,
        user_id: UserId,
        config: &ConversationConfig,
    ) -> Self {
        Self {
            remote,
            user_id,
            timeout: config.reconcile_timeout(),
            page_size: config.session_page_size.max(1),
            concurrency: config.fetch_concurrency.max(1),
        }
    }

    /// Fetches the most recent remote sessions with their messages.
    ///
    /// Sessions in `skip` are left out. A session whose messages could not
    /// be fetched is returned with `messages: None`.
    ///
    /// Returns `Ok(None)` if cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the session list itself could not be fetched.
    pub async fn fetch_sessions(
        &self,
        token: &CancellationToken,
        skip: &BTreeSet<RemoteSessionId>,
    ) -> Result<Option<Vec<RemoteSnapshot>>, RemoteError> {
        let listed = tokio::select! {
            () = token.cancelled() => return Ok(None),
            listed = within(
                self.timeout,
                self.remote.list_sessions(&self.user_id, self.page_size),
            ) => listed?,
        };
        let sessions: Vec<RemoteSession> = listed
            .into_iter()
            .filter(|s| !skip.contains(&s.id))
            .take(self.page_size)
            .collect();
        debug!(count = sessions.len(), "fetched remote session list");

        let mut snapshots = Vec::with_capacity(sessions.len());
        for batch in sessions.chunks(self.concurrency) {
            if token.is_cancelled() {
                return Ok(None);
            }
            let fetched = tokio::select! {
                () = token.cancelled() => return Ok(None),
                fetched = join_all(batch.iter().map(|s| self.fetch_messages(&s.id))) => fetched,
            };
            snapshots.extend(
                batch
                    .iter()
                    .cloned()
                    .zip(fetched)
                    .map(|(session, messages)| RemoteSnapshot { session, messages }),
            );
        }
        Ok(Some(snapshots))
    }

    /// Fetches one session's messages, or `None` on error or timeout.
    pub async fn fetch_messages(&self, id: &RemoteSessionId) -> Option<Vec<Message>> {
        match within(self.timeout, self.remote.list_messages(id)).await {
            Ok(messages) => Some(messages.into_iter().map(RemoteMessage::into_message).collect()),
            Err(e) => {
                warn!(remote_session = %id, error = %e, "keeping cached messages");
                None
            }
        }
    }

    /// Merges the remote session list into the shared store.
    pub(crate) async fn reconcile_sessions(
        &self,
        state: &SharedState,
        token: &CancellationToken,
    ) -> ReconcileOutcome {
        let started = Instant::now();
        let deleted = state.read(|store| store.deleted_remote_ids().clone()).await;

        let snapshots = match self.fetch_sessions(token, &deleted).await {
            Ok(Some(snapshots)) => snapshots,
            Ok(None) => return ReconcileOutcome::Cancelled,
            Err(e) => {
                warn!(error = %e, "session reconciliation failed, keeping cache");
                return ReconcileOutcome::RemoteUnavailable;
            }
        };

        let committed = state
            .try_commit(|store| {
                if token.is_cancelled() {
                    return None;
                }
                let current: Vec<ConversationSession> =
                    store.sessions().into_iter().cloned().collect();
                let merged = merge_sessions(current.clone(), snapshots, store.deleted_remote_ids());
                if merged == current {
                    return None;
                }
                let count = merged.len();
                store.replace_all(merged);
                Some(count)
            })
            .await;

        let outcome = match committed {
            Some(sessions) => ReconcileOutcome::Merged { sessions },
            None if token.is_cancelled() => ReconcileOutcome::Cancelled,
            None => ReconcileOutcome::Unchanged,
        };
        info!(
            ?outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "session reconciliation finished"
        );
        outcome
    }

    /// Refreshes one session's messages from the remote store.
    pub(crate) async fn refresh_session(
        &self,
        state: &SharedState,
        id: LocalSessionId,
        token: &CancellationToken,
    ) -> ReconcileOutcome {
        let Some(remote_id) = state
            .read(|store| store.get(id).and_then(|s| s.remote_id.clone()))
            .await
        else {
            return ReconcileOutcome::Skipped;
        };

        let messages = tokio::select! {
            () = token.cancelled() => return ReconcileOutcome::Cancelled,
            messages = self.fetch_messages(&remote_id) => messages,
        };
        let Some(messages) = messages else {
            return ReconcileOutcome::RemoteUnavailable;
        };

        let committed = state
            .try_commit(|store| {
                if token.is_cancelled() {
                    return None;
                }
                let session = store.get_mut(id).ok()?;
                if session.remote_id.as_ref() != Some(&remote_id) {
                    return None;
                }
                session.merge_remote_messages(messages).then_some(())
            })
            .await;

        match committed {
            Some(()) => {
                debug!(session = %id, "refreshed session messages");
                ReconcileOutcome::Merged { sessions: 1 }
            }
            None if token.is_cancelled() => ReconcileOutcome::Cancelled,
            None => ReconcileOutcome::Unchanged,
        }
    }
}

/// Races a remote call against the reconciliation timeout.
async fn within<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or(Err(RemoteError::Timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::context::ContextStamp;
    use crate::message::MessageRole;
    use crate::testing::FakeRemote;
    use chrono::{Duration as ChronoDuration, Utc};

    fn remote_session(id: &str, minutes_ago: i64) -> RemoteSession {
        let at = Utc::now() - ChronoDuration::minutes(minutes_ago);
        RemoteSession {
            id: RemoteSessionId::new(id),
            title: format!("Remote {id}"),
            created_at: at,
            updated_at: at,
        }
    }

    fn remote_message(role: MessageRole, content: &str, sequence: u64) -> Message {
        RemoteMessage {
            sender_type: role,
            message: content.to_string(),
            sequence_number: sequence,
            context_type: Default::default(),
            context_id: None,
            created_at: None,
        }
        .into_message()
    }

    fn snapshot(session: RemoteSession, messages: Option<Vec<Message>>) -> RemoteSnapshot {
        RemoteSnapshot { session, messages }
    }

    fn comparable(sessions: &[ConversationSession]) -> Vec<(LocalSessionId, String, Vec<(u64, String)>)> {
        let mut out: Vec<_> = sessions
            .iter()
            .map(|s| {
                (
                    s.local_id,
                    s.title.clone(),
                    s.messages()
                        .iter()
                        .map(|m| (m.sequence_number, m.content.clone()))
                        .collect(),
                )
            })
            .collect();
        out.sort_by_key(|(id, _, _)| *id);
        out
    }

    fn engine(remote: Arc<FakeRemote>, config: &ConversationConfig) -> ReconciliationEngine {
        ReconciliationEngine::new(remote, UserId::new("user-1"), config)
    }

    #[test]
    fn local_only_session_survives_unrelated_remote_sessions() {
        let local_a = ConversationSession::new("A");
        let a_id = local_a.local_id;

        let merged = merge_sessions(
            vec![local_a],
            vec![
                snapshot(remote_session("b", 5), Some(Vec::new())),
                snapshot(remote_session("c", 10), Some(Vec::new())),
            ],
            &BTreeSet::new(),
        );

        assert_eq!(merged.len(), 3);
        let a = merged.iter().find(|s| s.local_id == a_id).expect("A kept");
        assert!(a.remote_id.is_none());
        let remote_ids: BTreeSet<_> = merged.iter().filter_map(|s| s.remote_id.clone()).collect();
        assert!(remote_ids.contains(&RemoteSessionId::new("b")));
        assert!(remote_ids.contains(&RemoteSessionId::new("c")));
    }

    #[test]
    fn remote_wins_on_title_and_messages_but_local_id_is_kept() {
        let mut cached = ConversationSession::new("Old title");
        cached.remote_id = Some(RemoteSessionId::new("r-1"));
        cached.append(MessageRole::User, "stale", ContextStamp::default());
        cached.log.mark_persisted(0);
        let local_id = cached.local_id;

        let merged = merge_sessions(
            vec![cached],
            vec![snapshot(
                remote_session("r-1", 0),
                Some(vec![remote_message(MessageRole::User, "fresh", 0)]),
            )],
            &BTreeSet::new(),
        );

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].local_id, local_id);
        assert_eq!(merged[0].title, "Remote r-1");
        assert_eq!(merged[0].messages()[0].content, "fresh");
    }

    #[test]
    fn failed_fetch_keeps_cached_messages() {
        let mut cached = ConversationSession::new("Cached");
        cached.remote_id = Some(RemoteSessionId::new("r-1"));
        cached.append(MessageRole::User, "keep me", ContextStamp::default());

        let merged = merge_sessions(
            vec![cached],
            vec![snapshot(remote_session("r-1", 0), None)],
            &BTreeSet::new(),
        );

        assert_eq!(merged[0].messages().len(), 1);
        assert_eq!(merged[0].messages()[0].content, "keep me");
    }

    #[test]
    fn merge_is_idempotent() {
        let mut cached = ConversationSession::new("A");
        cached.append(MessageRole::User, "local only", ContextStamp::default());
        let remote = vec![
            snapshot(
                remote_session("b", 1),
                Some(vec![
                    remote_message(MessageRole::User, "q", 0),
                    remote_message(MessageRole::Assistant, "a", 1),
                ]),
            ),
            snapshot(remote_session("c", 2), None),
        ];

        let once = merge_sessions(vec![cached], remote.clone(), &BTreeSet::new());
        let twice = merge_sessions(once.clone(), remote, &BTreeSet::new());

        assert_eq!(comparable(&once), comparable(&twice));
    }

    #[test]
    fn tombstoned_sessions_do_not_reappear() {
        let deleted: BTreeSet<_> = [RemoteSessionId::new("gone")].into_iter().collect();
        let merged = merge_sessions(
            Vec::new(),
            vec![
                snapshot(remote_session("gone", 0), Some(Vec::new())),
                snapshot(remote_session("kept", 0), Some(Vec::new())),
            ],
            &deleted,
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].remote_id, Some(RemoteSessionId::new("kept")));
    }

    #[test]
    fn merged_list_is_sorted_newest_first() {
        let merged = merge_sessions(
            Vec::new(),
            vec![
                snapshot(remote_session("old", 30), Some(Vec::new())),
                snapshot(remote_session("new", 1), Some(Vec::new())),
            ],
            &BTreeSet::new(),
        );
        assert_eq!(merged[0].remote_id, Some(RemoteSessionId::new("new")));
        assert_eq!(merged[1].remote_id, Some(RemoteSessionId::new("old")));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_session_times_out_and_keeps_cache() {
        let remote = Arc::new(FakeRemote::new());
        let slow = remote.seed_session("slow", &[(MessageRole::User, "remote copy")]);
        remote.seed_session("fast", &[(MessageRole::User, "hello")]);
        remote.delay_messages(&slow, std::time::Duration::from_secs(60));

        let cache = Arc::new(InMemoryCache::new());
        let state = SharedState::load(cache, "ns");
        let local_id = state
            .commit(|store| {
                let id = store.create("Cached slow");
                let session = store.get_mut(id).expect("session");
                session.assign_remote_id(slow.clone()).expect("assign");
                session.append(MessageRole::User, "cached copy", ContextStamp::default());
                id
            })
            .await;

        let config = ConversationConfig::default();
        let outcome = engine(remote, &config)
            .reconcile_sessions(&state, &CancellationToken::new())
            .await;

        assert!(matches!(outcome, ReconcileOutcome::Merged { sessions: 2 }));
        let messages = state
            .read(|store| store.messages(local_id).map(<[Message]>::to_vec))
            .await
            .expect("session kept");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "cached copy");
    }

    #[tokio::test]
    async fn unreachable_remote_keeps_cache() {
        let remote = Arc::new(FakeRemote::new());
        remote.set_unavailable(true);
        let state = SharedState::load(Arc::new(InMemoryCache::new()), "ns");
        state.commit(|store| store.create("Cached")).await;

        let outcome = engine(remote, &ConversationConfig::default())
            .reconcile_sessions(&state, &CancellationToken::new())
            .await;

        assert_eq!(outcome, ReconcileOutcome::RemoteUnavailable);
        assert_eq!(state.read(|store| store.len()).await, 1);
    }

    #[tokio::test]
    async fn cancelled_reconciliation_writes_nothing() {
        let remote = Arc::new(FakeRemote::new());
        remote.seed_session("r-1", &[(MessageRole::User, "hello")]);
        let cache = Arc::new(InMemoryCache::new());
        let state = SharedState::load(cache.clone(), "ns");

        let token = CancellationToken::new();
        token.cancel();
        let outcome = engine(remote, &ConversationConfig::default())
            .reconcile_sessions(&state, &token)
            .await;

        assert_eq!(outcome, ReconcileOutcome::Cancelled);
        assert!(state.read(|store| store.is_empty()).await);
        assert_eq!(crate::cache::LocalCache::get(cache.as_ref(), "ns").expect("get"), None);
    }

    #[tokio::test]
    async fn message_fetches_are_bounded_by_concurrency() {
        let remote = Arc::new(FakeRemote::new());
        for n in 0..7 {
            remote.seed_session(&format!("r-{n}"), &[(MessageRole::User, "hi")]);
        }
        let config = ConversationConfig {
            fetch_concurrency: 3,
            ..ConversationConfig::default()
        };

        let snapshots = engine(remote.clone(), &config)
            .fetch_sessions(&CancellationToken::new(), &BTreeSet::new())
            .await
            .expect("list")
            .expect("not cancelled");

        assert_eq!(snapshots.len(), 7);
        assert!(snapshots.iter().all(|s| s.messages.is_some()));
        assert!(remote.max_concurrent_message_fetches() <= 3);
    }

    #[tokio::test]
    async fn page_size_bounds_session_list() {
        let remote = Arc::new(FakeRemote::new());
        for n in 0..5 {
            remote.seed_session(&format!("r-{n}"), &[]);
        }
        let config = ConversationConfig {
            session_page_size: 2,
            ..ConversationConfig::default()
        };

        let snapshots = engine(remote, &config)
            .fetch_sessions(&CancellationToken::new(), &BTreeSet::new())
            .await
            .expect("list")
            .expect("not cancelled");

        assert_eq!(snapshots.len(), 2);
    }

    #[tokio::test]
    async fn refresh_merges_remote_messages_into_session() {
        let remote = Arc::new(FakeRemote::new());
        let remote_id = remote.seed_session(
            "r-1",
            &[(MessageRole::User, "q"), (MessageRole::Assistant, "a")],
        );
        let state = SharedState::load(Arc::new(InMemoryCache::new()), "ns");
        let id = state
            .commit(|store| {
                let id = store.create("t");
                store
                    .get_mut(id)
                    .expect("session")
                    .assign_remote_id(remote_id.clone())
                    .expect("assign");
                id
            })
            .await;

        let engine = engine(remote, &ConversationConfig::default());
        let token = CancellationToken::new();
        assert_eq!(
            engine.refresh_session(&state, id, &token).await,
            ReconcileOutcome::Merged { sessions: 1 }
        );
        assert_eq!(
            engine.refresh_session(&state, id, &token).await,
            ReconcileOutcome::Unchanged
        );
        assert_eq!(state.read(|store| store.messages(id).map(<[Message]>::len)).await, Ok(2));
    }

    #[tokio::test]
    async fn refresh_without_remote_id_is_skipped() {
        let state = SharedState::load(Arc::new(InMemoryCache::new()), "ns");
        let id = state.commit(|store| store.create("t")).await;
        let outcome = engine(Arc::new(FakeRemote::new()), &ConversationConfig::default())
            .refresh_session(&state, id, &CancellationToken::new())
            .await;
        assert_eq!(outcome, ReconcileOutcome::Skipped);
    }
}
