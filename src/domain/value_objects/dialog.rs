//! Dialog turns kept per session for LLM context
//!
//! Each session stores an ordered list of turns. Turn 0 is always the system
//! prompt; trimming never touches it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a dialog turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    System,
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// An action the model asked the client to perform
///
/// Actions are passed through to the caller uninterpreted; executing them is
/// the client's job, and the outcome may come back as a later user turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCall {
    /// Name of the tool the model invoked
    pub name: String,
    /// Arguments as the model produced them
    pub arguments: serde_json::Value,
}

/// A single turn in a session's dialog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogTurn {
    pub role: TurnRole,
    pub content: String,
    /// Actions requested alongside the text (assistant turns only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionCall>,
    /// Timestamp when this turn was recorded
    pub timestamp: DateTime<Utc>,
}

impl DialogTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::System,
            content: content.into(),
            actions: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
            actions: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>, actions: Vec<ActionCall>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
            actions,
            timestamp: Utc::now(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.role == TurnRole::System
    }
}
