//! Inbound chat request and outbound stream frames.

use serde::{Deserialize, Serialize};

/// A single chat turn as received from the edge gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    /// Empty or absent starts a new session.
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: String,
    pub model_name: String,
}

impl ChatRequest {
    pub fn new(
        user_id: impl Into<String>,
        session_id: Option<String>,
        message: impl Into<String>,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            session_id,
            message: message.into(),
            model_name: model_name.into(),
        }
    }

    /// Session id if one was supplied and non-empty.
    pub fn existing_session(&self) -> Option<&str> {
        self.session_id.as_deref().filter(|s| !s.is_empty())
    }
}

/// One frame of the client-facing token stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub session_id: String,
    pub content: String,
    pub is_finished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub generated_tokens: i32,
}

impl ChatEvent {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
