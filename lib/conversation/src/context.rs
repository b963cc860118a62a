//! The analysis context a conversation is grounded in.
//!
//! Exactly one [`Context`] is active at a time. Messages record the context
//! that was active when they were sent as a [`ContextStamp`]; changing the
//! active context never touches messages already in a log.

use crate::message::Message;
use counsel_core::AnalysisId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of analysis a context refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextType {
    /// Generic conversation.
    #[default]
    None,
    /// Grounded in a situation analysis.
    Situation,
    /// Grounded in a contract analysis.
    Contract,
}

impl ContextType {
    /// Returns the wire name of this context type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Situation => "situation",
            Self::Contract => "contract",
        }
    }

    /// Parses a context type leniently; unknown names mean no context.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "situation" => Self::Situation,
            "contract" => Self::Contract,
            _ => Self::None,
        }
    }
}

impl fmt::Display for ContextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The active context.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Context {
    /// No analysis referenced.
    #[default]
    None,
    /// A situation analysis.
    Situation {
        id: AnalysisId,
        label: Option<String>,
    },
    /// A contract analysis.
    Contract {
        id: AnalysisId,
        label: Option<String>,
    },
}

impl Context {
    /// Returns the context type.
    #[must_use]
    pub fn context_type(&self) -> ContextType {
        match self {
            Self::None => ContextType::None,
            Self::Situation { .. } => ContextType::Situation,
            Self::Contract { .. } => ContextType::Contract,
        }
    }

    /// Returns the referenced analysis id, if any.
    #[must_use]
    pub fn id(&self) -> Option<&AnalysisId> {
        match self {
            Self::None => None,
            Self::Situation { id, .. } | Self::Contract { id, .. } => Some(id),
        }
    }

    /// Returns the display label, if any.
    #[must_use]
    pub fn label(&self) -> Option<&str> {
        match self {
            Self::None => None,
            Self::Situation { label, .. } | Self::Contract { label, .. } => label.as_deref(),
        }
    }

    /// Returns the stamp recorded on messages sent under this context.
    #[must_use]
    pub fn stamp(&self) -> ContextStamp {
        ContextStamp {
            context_type: self.context_type(),
            context_id: self.id().cloned(),
        }
    }

    /// Builds a context from a type and an optional id.
    ///
    /// A situation or contract type without an id collapses to no context.
    #[must_use]
    pub fn from_parts(
        context_type: ContextType,
        id: Option<AnalysisId>,
        label: Option<String>,
    ) -> Self {
        match (context_type, id) {
            (ContextType::Situation, Some(id)) => Self::Situation { id, label },
            (ContextType::Contract, Some(id)) => Self::Contract { id, label },
            _ => Self::None,
        }
    }
}

/// The context recorded on a message at send time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContextStamp {
    /// Context type active when the message was sent.
    pub context_type: ContextType,
    /// Analysis referenced when the message was sent.
    pub context_id: Option<AnalysisId>,
}

impl ContextStamp {
    /// Returns true if no analysis was referenced.
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.context_type == ContextType::None || self.context_id.is_none()
    }

    /// Rebuilds a context from this stamp. Labels are not stamped.
    #[must_use]
    pub fn to_context(&self) -> Context {
        Context::from_parts(self.context_type, self.context_id.clone(), None)
    }
}

/// Holds the single active context.
///
/// Every transition is total: any state can move to any other.
#[derive(Debug, Clone, Default)]
pub struct ContextBinder {
    current: Context,
}

impl ContextBinder {
    /// Creates a binder with no active context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the active context.
    #[must_use]
    pub fn current(&self) -> &Context {
        &self.current
    }

    /// Returns the stamp for the next message.
    #[must_use]
    pub fn stamp(&self) -> ContextStamp {
        self.current.stamp()
    }

    /// Activates a situation analysis.
    pub fn select_situation(&mut self, id: AnalysisId, label: Option<String>) {
        self.current = Context::Situation { id, label };
    }

    /// Activates a contract analysis.
    pub fn select_contract(&mut self, id: AnalysisId, label: Option<String>) {
        self.current = Context::Contract { id, label };
    }

    /// Drops the active context.
    pub fn clear(&mut self) {
        self.current = Context::None;
    }

    /// Replaces the active context.
    pub fn set(&mut self, context: Context) {
        self.current = context;
    }

    /// Activates the context carried by an external link.
    ///
    /// Unknown types or a blank id clear the context.
    pub fn apply_link(&mut self, context_type: &str, id: &str, label: Option<String>) {
        let id = id.parse::<AnalysisId>().ok();
        self.current = Context::from_parts(ContextType::from_name(context_type), id, label);
    }

    /// Continues in the context of the most recent message, if it had one.
    ///
    /// Returns true if the binder changed.
    pub fn resume_from(&mut self, messages: &[Message]) -> bool {
        let Some(last) = messages.iter().max_by_key(|m| m.sequence_number) else {
            return false;
        };
        if last.context.is_none() {
            return false;
        }
        let resumed = last.context.to_context();
        if resumed.stamp() == self.current.stamp() {
            return false;
        }
        self.current = resumed;
        true
    }
}
