//! Message types for conversations.

use crate::context::ContextStamp;
use chrono::{DateTime, Utc};
use counsel_core::MessageId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// User/human message.
    User,
    /// Assistant/AI message.
    Assistant,
}

impl MessageRole {
    /// Returns the wire name of this role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message in a conversation.
///
/// Messages are historical facts: once in a log only `persisted` changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Message role.
    pub role: MessageRole,
    /// Message content.
    pub content: String,
    /// When the message was created.
    pub timestamp: DateTime<Utc>,
    /// Position in the session, zero-based and gap-free.
    pub sequence_number: u64,
    /// Context active when the message was sent.
    #[serde(flatten)]
    pub context: ContextStamp,
    /// Whether the remote store has acknowledged this message.
    #[serde(default)]
    pub persisted: bool,
}

impl Message {
    /// Creates a message at the given position, timestamped now.
    #[must_use]
    pub fn new(
        role: MessageRole,
        content: impl Into<String>,
        sequence_number: u64,
        context: ContextStamp,
    ) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            sequence_number,
            context,
            persisted: false,
        }
    }

    /// Returns true if `other` records the same exchange turn.
    ///
    /// Ids are local, so a copy fetched back from the remote store is
    /// recognized by position, role and content instead.
    #[must_use]
    pub fn same_turn(&self, other: &Message) -> bool {
        self.sequence_number == other.sequence_number
            && self.role == other.role
            && self.content == other.content
    }
}
