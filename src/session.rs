//! Conversation State
//!
//! Per-session turn history plus the most recently generated statement.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Inputs that execute the remembered statement instead of asking the model.
pub const EXECUTE_COMMANDS: &[&str] = &["/execute", "execute last"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "User"),
            Role::Agent => write!(f, "DB Agent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self {
            role: Role::Agent,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    history: Vec<ConversationTurn>,
    pub last_statement: Option<String>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, turn: ConversationTurn) {
        self.history.push(turn);
    }

    /// Drop every recorded turn. The remembered statement is kept.
    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }
}

/// Exact, case-insensitive match on one of the reserved execute commands.
pub fn is_execute_command(input: &str) -> bool {
    let normalized = input.trim().to_lowercase();
    EXECUTE_COMMANDS.iter().any(|cmd| normalized == *cmd)
}

pub type SessionHandle = Arc<Mutex<SessionState>>;

/// Maps session keys to their state. Handing out a per-session mutex
/// serializes concurrent requests for the same session.
pub trait SessionStore: Send + Sync {
    /// Fetch the session, creating it on first use. Marks it as accessed.
    fn session(&self, key: &str) -> SessionHandle;

    /// Forget the session. Returns false when the key was unknown.
    fn remove(&self, key: &str) -> bool;

    /// Drop sessions not accessed within `max_idle`. Returns how many were dropped.
    fn evict_idle(&self, max_idle: Duration) -> usize;
}

struct SessionEntry {
    state: SessionHandle,
    last_access: DateTime<Utc>,
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, SessionEntry>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop every session last accessed at or before `cutoff`.
    pub fn evict_accessed_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        self.sessions.retain(|_, entry| {
            let keep = entry.last_access > cutoff;
            if !keep {
                evicted += 1;
            }
            keep
        });
        evicted
    }
}

impl SessionStore for InMemorySessionStore {
    fn session(&self, key: &str) -> SessionHandle {
        let mut entry = self
            .sessions
            .entry(key.to_string())
            .or_insert_with(|| SessionEntry {
                state: Arc::new(Mutex::new(SessionState::new())),
                last_access: Utc::now(),
            });
        entry.last_access = Utc::now();
        Arc::clone(&entry.state)
    }

    fn remove(&self, key: &str) -> bool {
        self.sessions.remove(key).is_some()
    }

    fn evict_idle(&self, max_idle: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(max_idle)
            .ok()
            .and_then(|idle| Utc::now().checked_sub_signed(idle));
        match cutoff {
            Some(cutoff) => self.evict_accessed_before(cutoff),
            None => 0,
        }
    }
}
