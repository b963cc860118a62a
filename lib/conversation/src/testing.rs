//! In-memory collaborators with injectable failures, for unit tests.

use crate::error::RemoteError;
use crate::message::MessageRole;
use crate::remote::{
    AnalysisLookup, ChatBackend, ChatRequest, ChatResponse, ConversationRemote, RemoteMessage,
    RemoteSession,
};
use async_trait::async_trait;
use chrono::Utc;
use counsel_core::{AnalysisId, RemoteSessionId, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

fn unavailable() -> RemoteError {
    RemoteError::Unavailable {
        reason: "connection refused".to_string(),
    }
}

#[derive(Default)]
struct RemoteState {
    sessions: Vec<(RemoteSession, Vec<RemoteMessage>)>,
    next_id: usize,
    deleted: Vec<RemoteSessionId>,
    delays: HashMap<RemoteSessionId, Duration>,
}

impl RemoteState {
    fn find_mut(
        &mut self,
        id: &RemoteSessionId,
    ) -> Result<&mut (RemoteSession, Vec<RemoteMessage>), RemoteError> {
        self.sessions
            .iter_mut()
            .find(|(s, _)| &s.id == id)
            .ok_or_else(|| RemoteError::NotFound {
                resource: id.to_string(),
            })
    }
}

/// Tracks concurrent message fetches; decrements even when dropped mid-flight.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, high_water: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        high_water.fetch_max(now, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Holds a call open until the test releases it.
#[derive(Default)]
pub(crate) struct Gate {
    entered: Notify,
    released: Notify,
}

impl Gate {
    /// Resolves once a call is parked at the gate.
    pub(crate) async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    pub(crate) fn release(&self) {
        self.released.notify_one();
    }

    async fn pass(&self) {
        self.entered.notify_one();
        self.released.notified().await;
    }
}

#[derive(Default)]
pub(crate) struct FakeRemote {
    state: Mutex<RemoteState>,
    create_gate: Mutex<Option<Arc<Gate>>>,
    unavailable: AtomicBool,
    fail_create: AtomicBool,
    fail_append: AtomicBool,
    fail_delete: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    appends: AtomicUsize,
}

impl FakeRemote {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn seed_session(
        &self,
        id: &str,
        messages: &[(MessageRole, &str)],
    ) -> RemoteSessionId {
        let now = Utc::now();
        let id = RemoteSessionId::new(id);
        let messages: Vec<RemoteMessage> = messages
            .iter()
            .enumerate()
            .map(|(seq, (role, content))| RemoteMessage {
                sender_type: *role,
                message: (*content).to_string(),
                sequence_number: seq as u64,
                context_type: Default::default(),
                context_id: None,
                created_at: Some(now),
            })
            .collect();
        let session = RemoteSession {
            id: id.clone(),
            title: format!("Remote {id}"),
            created_at: now,
            updated_at: now,
        };
        self.state.lock().unwrap().sessions.push((session, messages));
        id
    }

    /// Appends a message as another writer would.
    pub(crate) fn push_message(&self, id: &RemoteSessionId, role: MessageRole, content: &str) {
        let mut state = self.state.lock().unwrap();
        let (_, messages) = state.find_mut(id).unwrap();
        let sequence_number = messages.len() as u64;
        messages.push(RemoteMessage {
            sender_type: role,
            message: content.to_string(),
            sequence_number,
            context_type: Default::default(),
            context_id: None,
            created_at: Some(Utc::now()),
        });
    }

    pub(crate) fn messages_of(&self, id: &RemoteSessionId) -> Vec<RemoteMessage> {
        let mut state = self.state.lock().unwrap();
        state.find_mut(id).map(|(_, m)| m.clone()).unwrap_or_default()
    }

    pub(crate) fn session_ids(&self) -> Vec<RemoteSessionId> {
        let state = self.state.lock().unwrap();
        state.sessions.iter().map(|(s, _)| s.id.clone()).collect()
    }

    pub(crate) fn title_of(&self, id: &RemoteSessionId) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        state.find_mut(id).ok().map(|(s, _)| s.title.clone())
    }

    pub(crate) fn was_deleted(&self, id: &RemoteSessionId) -> bool {
        self.state.lock().unwrap().deleted.contains(id)
    }

    pub(crate) fn delay_messages(&self, id: &RemoteSessionId, delay: Duration) {
        self.state.lock().unwrap().delays.insert(id.clone(), delay);
    }

    /// Parks the next `create_session` after the remote row exists.
    pub(crate) fn gate_next_create(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.create_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub(crate) fn set_unavailable(&self, value: bool) {
        self.unavailable.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_create(&self, value: bool) {
        self.fail_create.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_append(&self, value: bool) {
        self.fail_append.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_delete(&self, value: bool) {
        self.fail_delete.store(value, Ordering::SeqCst);
    }

    pub(crate) fn max_concurrent_message_fetches(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn append_calls(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), RemoteError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationRemote for FakeRemote {
    async fn create_session(
        &self,
        _user_id: &UserId,
        title: &str,
    ) -> Result<RemoteSession, RemoteError> {
        self.check_available()?;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        let session = {
            let mut state = self.state.lock().unwrap();
            state.next_id += 1;
            let now = Utc::now();
            let session = RemoteSession {
                id: RemoteSessionId::new(format!("remote-{}", state.next_id)),
                title: title.to_string(),
                created_at: now,
                updated_at: now,
            };
            state.sessions.push((session.clone(), Vec::new()));
            session
        };
        let gate = self.create_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        Ok(session)
    }

    async fn list_sessions(
        &self,
        _user_id: &UserId,
        limit: usize,
    ) -> Result<Vec<RemoteSession>, RemoteError> {
        self.check_available()?;
        let state = self.state.lock().unwrap();
        let mut sessions: Vec<_> = state.sessions.iter().map(|(s, _)| s.clone()).collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions.truncate(limit);
        Ok(sessions)
    }

    async fn get_session(&self, id: &RemoteSessionId) -> Result<RemoteSession, RemoteError> {
        self.check_available()?;
        let mut state = self.state.lock().unwrap();
        state.find_mut(id).map(|(s, _)| s.clone())
    }

    async fn update_title(&self, id: &RemoteSessionId, title: &str) -> Result<(), RemoteError> {
        self.check_available()?;
        let mut state = self.state.lock().unwrap();
        let (session, _) = state.find_mut(id)?;
        session.title = title.to_string();
        Ok(())
    }

    async fn delete_session(&self, id: &RemoteSessionId) -> Result<(), RemoteError> {
        self.check_available()?;
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        let mut state = self.state.lock().unwrap();
        state.sessions.retain(|(s, _)| &s.id != id);
        state.deleted.push(id.clone());
        Ok(())
    }

    async fn append_message(
        &self,
        id: &RemoteSessionId,
        message: &RemoteMessage,
    ) -> Result<(), RemoteError> {
        self.check_available()?;
        self.appends.fetch_add(1, Ordering::SeqCst);
        if self.fail_append.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        let mut state = self.state.lock().unwrap();
        let (session, messages) = state.find_mut(id)?;
        let expected = messages.len() as u64;
        if message.sequence_number < expected {
            let existing = &messages[message.sequence_number as usize];
            if existing.message == message.message && existing.sender_type == message.sender_type {
                return Ok(());
            }
        }
        if message.sequence_number != expected {
            return Err(RemoteError::Rejected {
                status: 409,
                reason: format!("expected sequence {expected}"),
            });
        }
        messages.push(message.clone());
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn list_messages(&self, id: &RemoteSessionId) -> Result<Vec<RemoteMessage>, RemoteError> {
        self.check_available()?;
        let _guard = InFlight::enter(&self.in_flight, &self.max_in_flight);
        let delay = self.state.lock().unwrap().delays.get(id).copied();
        tokio::task::yield_now().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.find_mut(id).map(|(_, m)| m.clone())
    }
}

#[derive(Default)]
pub(crate) struct FakeBackend {
    requests: Mutex<Vec<ChatRequest>>,
    fail: AtomicBool,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_fail(&self, value: bool) {
        self.fail.store(value, Ordering::SeqCst);
    }

    pub(crate) fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn answer(&self, request: &ChatRequest) -> Result<ChatResponse, RemoteError> {
        self.requests.lock().unwrap().push(request.clone());
        tokio::task::yield_now().await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(RemoteError::Rejected {
                status: 503,
                reason: "model overloaded".to_string(),
            });
        }
        Ok(ChatResponse {
            answer: format!("Answer: {}", request.query),
        })
    }
}

#[derive(Default)]
pub(crate) struct FakeLookup {
    fail: AtomicBool,
}

impl FakeLookup {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_fail(&self, value: bool) {
        self.fail.store(value, Ordering::SeqCst);
    }
}

#[async_trait]
impl AnalysisLookup for FakeLookup {
    async fn situation_summary(&self, id: &AnalysisId) -> Result<String, RemoteError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        Ok(format!("Findings for {id}"))
    }

    async fn contract_documents(&self, id: &AnalysisId) -> Result<Vec<AnalysisId>, RemoteError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        Ok(vec![
            AnalysisId::new(format!("{id}-doc-1")),
            AnalysisId::new(format!("{id}-doc-2")),
        ])
    }
}
