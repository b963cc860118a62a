//! Per-session message log.
//!
//! The log keeps messages ordered by `sequence_number`, which starts at 0
//! and never skips a value. Display order comes from this ordering alone;
//! timestamps can disagree with it after a merge.

use crate::context::ContextStamp;
use crate::message::{Message, MessageRole};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// An ordered, gap-free list of messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl MessageLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a log from messages in any order.
    ///
    /// Duplicate sequence numbers keep the first occurrence and gaps are
    /// closed.
    #[must_use]
    pub fn from_messages(mut messages: Vec<Message>) -> Self {
        normalize(&mut messages);
        Self { messages }
    }

    /// Returns the messages in sequence order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Returns the number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns true if the log has no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Returns the message with the highest sequence number.
    #[must_use]
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Returns the highest sequence number in the log.
    #[must_use]
    pub fn max_sequence(&self) -> Option<u64> {
        self.last().map(|m| m.sequence_number)
    }

    /// Returns the sequence number the next append will use.
    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.max_sequence().map_or(0, |max| max + 1)
    }

    /// Returns the message at a sequence number.
    #[must_use]
    pub fn get(&self, sequence: u64) -> Option<&Message> {
        self.position(sequence).ok().map(|idx| &self.messages[idx])
    }

    /// Appends a new message at the next sequence number.
    pub fn append(
        &mut self,
        role: MessageRole,
        content: impl Into<String>,
        context: ContextStamp,
    ) -> &Message {
        let message = Message::new(role, content, self.next_sequence(), context);
        self.messages.push(message);
        &self.messages[self.messages.len() - 1]
    }

    /// Flags the message at `sequence` as stored remotely.
    pub fn mark_persisted(&mut self, sequence: u64) -> bool {
        match self.position(sequence) {
            Ok(idx) if !self.messages[idx].persisted => {
                self.messages[idx].persisted = true;
                true
            }
            _ => false,
        }
    }

    /// Returns the messages the remote store has not acknowledged, in order.
    #[must_use]
    pub fn unpersisted(&self) -> Vec<Message> {
        self.messages.iter().filter(|m| !m.persisted).cloned().collect()
    }

    /// Merges the authoritative remote message list into this log.
    ///
    /// The remote list wins wherever it has a message. Local messages the
    /// remote store has not seen yet are kept after the remote tail,
    /// renumbered if another writer took their positions. Local ids are
    /// kept for turns both sides agree on, so merging the same remote list
    /// twice changes nothing.
    ///
    /// Returns true if the log changed.
    pub fn merge_remote(&mut self, mut remote: Vec<Message>) -> bool {
        normalize(&mut remote);
        let Some(remote_max) = remote.last().map(|m| m.sequence_number) else {
            return false;
        };

        let matches_remote = |local: &Message| {
            remote
                .binary_search_by_key(&local.sequence_number, |m| m.sequence_number)
                .is_ok_and(|idx| remote[idx].same_turn(local))
        };

        let mut leftovers: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.sequence_number > remote_max || (!m.persisted && !matches_remote(m)))
            .cloned()
            .collect();

        let mut merged: Vec<Message> = remote
            .iter()
            .map(|r| match self.get(r.sequence_number) {
                Some(local) if local.same_turn(r) => Message {
                    persisted: true,
                    ..local.clone()
                },
                _ => Message {
                    persisted: true,
                    ..r.clone()
                },
            })
            .collect();

        let mut next = remote_max + 1;
        for message in &mut leftovers {
            if message.sequence_number != next {
                message.sequence_number = next;
                message.persisted = false;
            }
            next += 1;
        }
        merged.append(&mut leftovers);

        if merged == self.messages {
            return false;
        }
        self.messages = merged;
        true
    }

    fn position(&self, sequence: u64) -> Result<usize, usize> {
        self.messages
            .binary_search_by_key(&sequence, |m| m.sequence_number)
    }
}

/// Sorts by sequence number, drops duplicates and closes gaps.
fn normalize(messages: &mut Vec<Message>) {
    messages.sort_by_key(|m| m.sequence_number);
    messages.dedup_by_key(|m| m.sequence_number);
    let mut renumbered = 0usize;
    for (expected, message) in (0u64..).zip(messages.iter_mut()) {
        if message.sequence_number != expected {
            message.sequence_number = expected;
            renumbered += 1;
        }
    }
    if renumbered > 0 {
        warn!(
            count = messages.len(),
            renumbered, "closed gaps in message sequence numbers"
        );
    }
}
