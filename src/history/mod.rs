//! Per-user conversation history.

pub mod locks;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::RagError;

pub use locks::UserLocks;
pub use memory::MemoryConversationStore;
pub use sqlite::SqliteConversationStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// Reference to a document that informed an assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub id: String,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub user_id: String,
    /// Per-user append sequence, strictly increasing.
    pub seq: i64,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub sources: Vec<SourceRef>,
    /// Partial assistant output kept after a stream error or disconnect.
    #[serde(default)]
    pub incomplete: bool,
}

/// A turn before the store assigns its sequence number and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTurn {
    pub role: Role,
    pub content: String,
    pub sources: Vec<SourceRef>,
    pub incomplete: bool,
}

impl NewTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            sources: Vec::new(),
            incomplete: false,
        }
    }

    pub fn assistant(content: impl Into<String>, sources: Vec<SourceRef>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            sources,
            incomplete: false,
        }
    }

    pub fn incomplete(mut self) -> Self {
        self.incomplete = true;
        self
    }
}

/// Next timestamp for a user: now, or just after the previous one if the
/// clock has not advanced. Microsecond precision, matching what the SQLite
/// store persists.
pub(crate) fn next_timestamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now().trunc_subsecs(6);
    match previous {
        Some(last) if now <= last => last + Duration::microseconds(1),
        _ => now,
    }
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    fn name(&self) -> &str;

    /// Appends `turns` for `user_id` as one unit: no other append for the
    /// same user interleaves with them. The retention cap is enforced
    /// afterwards, evicting oldest turns first.
    async fn append_all(&self, user_id: &str, turns: Vec<NewTurn>) -> Result<Vec<Turn>, RagError>;

    async fn append(&self, user_id: &str, turn: NewTurn) -> Result<Turn, RagError> {
        self.append_all(user_id, vec![turn])
            .await?
            .pop()
            .ok_or_else(|| RagError::history("append stored no turn"))
    }

    /// The `limit` most recent turns, oldest first.
    async fn get_recent(&self, user_id: &str, limit: usize) -> Result<Vec<Turn>, RagError>;

    /// Removes every turn of `user_id`, returning how many were removed.
    async fn clear(&self, user_id: &str) -> Result<usize, RagError>;

    async fn count(&self, user_id: &str) -> Result<usize, RagError>;
}
