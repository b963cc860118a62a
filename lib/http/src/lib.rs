//! HTTP client for the counsel analysis backend.
//!
//! [`HttpBackend`] implements every remote collaborator the conversation
//! engine needs:
//!
//! - [`ConversationRemote`](counsel_conversation::ConversationRemote):
//!   `/users/{user}/conversations`, `/conversations/{id}` and its
//!   `/messages` sub-resource
//! - [`AnalysisLookup`](counsel_conversation::AnalysisLookup):
//!   `/situation-analyses/{id}` and `/contract-analyses/{id}`
//! - [`ChatBackend`](counsel_conversation::ChatBackend): `/chat`

pub mod client;
pub mod config;
pub mod error;

pub use client::HttpBackend;
pub use config::HttpBackendConfig;
pub use error::HttpError;
