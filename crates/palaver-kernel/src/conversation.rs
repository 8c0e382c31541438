//! Conversation entities
//!
//! A [`Session`] is a conversation thread owned by one user; a [`Message`] is
//! one append-only turn inside it.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Title used when neither an explicit title nor a first message is available.
pub const DEFAULT_SESSION_TITLE: &str = "New Chat";

/// Author of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Timestamps are kept at microsecond precision so every tier (cache score,
/// relational column, JSON payload) round-trips the same value.
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Derive a session title from free text, bounded to `max_chars` characters.
///
/// Whitespace is trimmed first; an empty source yields
/// [`DEFAULT_SESSION_TITLE`].
pub fn derive_title(source: &str, max_chars: usize) -> String {
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return DEFAULT_SESSION_TITLE.to_string();
    }
    trimmed.chars().take(max_chars).collect()
}

/// Ids are UUID v7: they sort by creation, so the cache tier's indices keep
/// insertion order among entries created in the same microsecond.
fn next_id() -> String {
    Uuid::now_v7().to_string()
}

/// A conversation thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Mint a session with a fresh id, titling it from `title_source`.
    pub fn new(user_id: impl Into<String>, title_source: &str, max_title_chars: usize) -> Self {
        Self {
            id: next_id(),
            user_id: user_id.into(),
            title: derive_title(title_source, max_title_chars),
            created_at: now_micros(),
        }
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }
}

/// One turn in a session. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: next_id(),
            session_id: session_id.into(),
            user_id: user_id.into(),
            role,
            content: content.into(),
            created_at: now_micros(),
        }
    }
}

/// Compact role/content pair handed to inference workers as context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextTurn {
    pub role: Role,
    pub content: String,
}

/// Render a newest-first page of messages as an oldest-first JSON array of
/// [`ContextTurn`]s. Returns `None` for an empty page.
pub fn render_context(newest_first: &[Message]) -> Result<Option<String>, serde_json::Error> {
    if newest_first.is_empty() {
        return Ok(None);
    }
    let turns: Vec<ContextTurn> = newest_first
        .iter()
        .rev()
        .map(|m| ContextTurn {
            role: m.role,
            content: m.content.clone(),
        })
        .collect();
    serde_json::to_string(&turns).map(Some)
}
