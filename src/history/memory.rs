use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use super::{next_timestamp, ConversationStore, NewTurn, Turn};
use crate::core::errors::RagError;

#[derive(Default)]
struct UserLog {
    next_seq: i64,
    turns: VecDeque<Turn>,
    /// Set by `clear` once the log is unlinked from the table.
    retired: bool,
}

/// Process-local store. Each user owns a log behind its own async lock, so
/// the shared table is only touched to look the log up. Clearing a user
/// drops their entry.
pub struct MemoryConversationStore {
    logs: Mutex<HashMap<String, Arc<AsyncMutex<UserLog>>>>,
    retention_cap: usize,
}

impl MemoryConversationStore {
    pub fn new(retention_cap: usize) -> Self {
        Self {
            logs: Mutex::new(HashMap::new()),
            retention_cap: retention_cap.max(1),
        }
    }

    fn log(&self, user_id: &str) -> Arc<AsyncMutex<UserLog>> {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        logs.entry(user_id.to_string()).or_default().clone()
    }

    fn existing(&self, user_id: &str) -> Option<Arc<AsyncMutex<UserLog>>> {
        let logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        logs.get(user_id).cloned()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn append_all(&self, user_id: &str, turns: Vec<NewTurn>) -> Result<Vec<Turn>, RagError> {
        loop {
            let handle = self.log(user_id);
            let mut log = handle.lock().await;
            if log.retired {
                // Cleared while we waited; the table already holds a fresh log.
                continue;
            }

            let mut stored = Vec::with_capacity(turns.len());
            for turn in turns {
                log.next_seq += 1;
                let previous = log.turns.back().map(|t| t.timestamp);
                let entry = Turn {
                    user_id: user_id.to_string(),
                    seq: log.next_seq,
                    role: turn.role,
                    content: turn.content,
                    timestamp: next_timestamp(previous),
                    sources: turn.sources,
                    incomplete: turn.incomplete,
                };
                log.turns.push_back(entry.clone());
                stored.push(entry);
            }

            while log.turns.len() > self.retention_cap {
                log.turns.pop_front();
            }
            return Ok(stored);
        }
    }

    async fn get_recent(&self, user_id: &str, limit: usize) -> Result<Vec<Turn>, RagError> {
        let Some(log) = self.existing(user_id) else {
            return Ok(Vec::new());
        };
        let log = log.lock().await;
        let skip = log.turns.len().saturating_sub(limit);
        Ok(log.turns.iter().skip(skip).cloned().collect())
    }

    async fn clear(&self, user_id: &str) -> Result<usize, RagError> {
        let Some(log) = self.existing(user_id) else {
            return Ok(0);
        };
        let mut guard = log.lock().await;
        let removed = guard.turns.len();
        guard.turns.clear();
        guard.retired = true;

        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        if logs.get(user_id).is_some_and(|current| Arc::ptr_eq(current, &log)) {
            logs.remove(user_id);
        }
        Ok(removed)
    }

    async fn count(&self, user_id: &str) -> Result<usize, RagError> {
        match self.existing(user_id) {
            Some(log) => Ok(log.lock().await.turns.len()),
            None => Ok(0),
        }
    }
}
