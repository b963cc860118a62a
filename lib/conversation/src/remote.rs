//! Collaborators on the far side of the network.
//!
//! These traits abstract the analysis backend so the engine can be tested
//! without it. `counsel-http` provides the production implementation.

use crate::context::{ContextStamp, ContextType};
use crate::error::RemoteError;
use crate::message::{Message, MessageRole};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use counsel_core::{AnalysisId, MessageId, RemoteSessionId, UserId};
use serde::{Deserialize, Serialize};

/// A conversation session as the remote store describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSession {
    /// Remote identity.
    pub id: RemoteSessionId,
    /// Session title.
    #[serde(default)]
    pub title: String,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When the session last changed.
    pub updated_at: DateTime<Utc>,
}

/// A message as stored by the remote message sub-resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMessage {
    /// Who sent the message.
    pub sender_type: MessageRole,
    /// Message text.
    pub message: String,
    /// Position in the session.
    pub sequence_number: u64,
    /// Context type active at send time.
    #[serde(default)]
    pub context_type: ContextType,
    /// Analysis referenced at send time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<AnalysisId>,
    /// When the message was written, if the store reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl RemoteMessage {
    /// Builds the wire form of a local message.
    #[must_use]
    pub fn from_message(message: &Message) -> Self {
        Self {
            sender_type: message.role,
            message: message.content.clone(),
            sequence_number: message.sequence_number,
            context_type: message.context.context_type,
            context_id: message.context.context_id.clone(),
            created_at: Some(message.timestamp),
        }
    }

    /// Converts into a local message acknowledged by the remote store.
    #[must_use]
    pub fn into_message(self) -> Message {
        Message {
            id: MessageId::new(),
            role: self.sender_type,
            content: self.message,
            timestamp: self.created_at.unwrap_or_else(Utc::now),
            sequence_number: self.sequence_number,
            context: ContextStamp {
                context_type: self.context_type,
                context_id: self.context_id,
            },
            persisted: true,
        }
    }
}

/// A query for the chat endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// The user's question.
    pub query: String,
    /// Which grounding strategy the backend applies.
    pub context_type: ContextType,
    /// Situation or contract analysis to ground in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<AnalysisId>,
    /// Findings of the referenced situation analysis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_summary: Option<String>,
    /// Contract documents whose clauses ground the answer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reference_ids: Vec<AnalysisId>,
}

impl ChatRequest {
    /// Creates an ungrounded request.
    #[must_use]
    pub fn generic(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            context_type: ContextType::None,
            context_id: None,
            reference_summary: None,
            reference_ids: Vec::new(),
        }
    }
}

/// Answer from the chat endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// The answer text.
    pub answer: String,
}

/// The remote conversation store.
///
/// Sessions are scoped to a user; messages are a sub-resource of a session.
#[async_trait]
pub trait ConversationRemote: Send + Sync {
    /// Creates a session and returns its remote description.
    async fn create_session(
        &self,
        user_id: &UserId,
        title: &str,
    ) -> Result<RemoteSession, RemoteError>;

    /// Lists the user's most recently updated sessions.
    async fn list_sessions(
        &self,
        user_id: &UserId,
        limit: usize,
    ) -> Result<Vec<RemoteSession>, RemoteError>;

    /// Gets a session by id.
    async fn get_session(&self, id: &RemoteSessionId) -> Result<RemoteSession, RemoteError>;

    /// Renames a session.
    async fn update_title(&self, id: &RemoteSessionId, title: &str) -> Result<(), RemoteError>;

    /// Deletes a session and its messages.
    async fn delete_session(&self, id: &RemoteSessionId) -> Result<(), RemoteError>;

    /// Appends a message at the sequence number it carries.
    async fn append_message(
        &self,
        id: &RemoteSessionId,
        message: &RemoteMessage,
    ) -> Result<(), RemoteError>;

    /// Lists a session's messages.
    async fn list_messages(&self, id: &RemoteSessionId) -> Result<Vec<RemoteMessage>, RemoteError>;

    /// Returns the highest stored sequence number.
    async fn latest_sequence(&self, id: &RemoteSessionId) -> Result<Option<u64>, RemoteError> {
        let messages = self.list_messages(id).await?;
        Ok(messages.iter().map(|m| m.sequence_number).max())
    }
}

/// The question-answering endpoint.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Answers a query.
    async fn answer(&self, request: &ChatRequest) -> Result<ChatResponse, RemoteError>;
}

/// Lookups of previously computed analyses.
#[async_trait]
pub trait AnalysisLookup: Send + Sync {
    /// Returns the stored findings of a situation analysis.
    async fn situation_summary(&self, id: &AnalysisId) -> Result<String, RemoteError>;

    /// Returns the document ids behind a contract analysis.
    async fn contract_documents(&self, id: &AnalysisId) -> Result<Vec<AnalysisId>, RemoteError>;
}
