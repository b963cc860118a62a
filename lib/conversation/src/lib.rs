//! Conversation orchestration for the counsel legal assistant.
//!
//! This crate provides:
//!
//! - **Message Log**: gap-free, sequence-ordered message history per session
//! - **Context Binder**: the analysis artifact new messages are grounded in
//! - **Session Store**: session lifecycle, selection and deletion
//! - **Reconciliation Engine**: local-first cache merged with the remote store
//! - **Chat Dispatcher**: routes queries by context and persists the exchange
//!
//! [`ChatService`] ties these together behind the operations a UI needs.

pub mod cache;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod log;
pub mod message;
pub mod reconcile;
pub mod remote;
pub mod service;
pub mod session;

mod state;
#[cfg(test)]
mod testing;

pub use cache::{CacheSnapshot, FileCache, InMemoryCache, LocalCache};
pub use config::ConversationConfig;
pub use context::{Context, ContextBinder, ContextStamp, ContextType};
pub use dispatch::{ChatDispatcher, SendOutcome};
pub use error::{CacheError, ChatError, RemoteError, SessionError};
pub use log::MessageLog;
pub use message::{Message, MessageRole};
pub use reconcile::{ReconcileOutcome, ReconciliationEngine, RemoteSnapshot, merge_sessions};
pub use remote::{
    AnalysisLookup, ChatBackend, ChatRequest, ChatResponse, ConversationRemote, RemoteMessage,
    RemoteSession,
};
pub use service::{ChatService, ServiceStatus};
pub use session::{ConversationSession, SessionStore, SessionSummary};
