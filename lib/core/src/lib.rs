//! Core domain types and utilities for the counsel conversation engine.
//!
//! This crate provides the identifier types and the error handling
//! foundation shared by the conversation, HTTP and CLI crates.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{AnalysisId, LocalSessionId, MessageId, ParseIdError, RemoteSessionId, UserId};
