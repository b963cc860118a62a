//! Tunables for the conversation engine.

use serde::Deserialize;
use std::time::Duration;

/// Conversation engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationConfig {
    /// Longest query accepted by `send`, in characters.
    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,

    /// Timeout for each background remote call, in milliseconds.
    /// Expired calls fall back to the cached value.
    #[serde(default = "default_reconcile_timeout_ms")]
    pub reconcile_timeout_ms: u64,

    /// How many of the most recent remote sessions a reconciliation fetches.
    #[serde(default = "default_session_page_size")]
    pub session_page_size: usize,

    /// How many message lists are fetched concurrently.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,

    /// Key under which the session list is cached locally.
    #[serde(default = "default_cache_namespace")]
    pub cache_namespace: String,

    /// Title given to sessions before their first message.
    #[serde(default = "default_title")]
    pub default_title: String,

    /// Whether selecting a session restores the context of its last message.
    #[serde(default = "default_resume_context_on_select")]
    pub resume_context_on_select: bool,
}

fn default_max_query_chars() -> usize {
    4000
}

fn default_reconcile_timeout_ms() -> u64 {
    5000
}

fn default_session_page_size() -> usize {
    20
}

fn default_fetch_concurrency() -> usize {
    4
}

fn default_cache_namespace() -> String {
    "counsel.conversations".to_string()
}

fn default_title() -> String {
    "New conversation".to_string()
}

fn default_resume_context_on_select() -> bool {
    true
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_query_chars: default_max_query_chars(),
            reconcile_timeout_ms: default_reconcile_timeout_ms(),
            session_page_size: default_session_page_size(),
            fetch_concurrency: default_fetch_concurrency(),
            cache_namespace: default_cache_namespace(),
            default_title: default_title(),
            resume_context_on_select: default_resume_context_on_select(),
        }
    }
}

impl ConversationConfig {
    /// Returns the background call timeout.
    #[must_use]
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_millis(self.reconcile_timeout_ms)
    }
}
