use std::time::{SystemTime, UNIX_EPOCH};

use snafu::ensure;

use crate::error::{ChatResult, SessionNotFoundSnafu};
use crate::message::SessionId;

pub const DEFAULT_SESSION_TITLE: &str = "New Chat";

/// A named, timestamped conversation thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    pub created_at_unix_seconds: u64,
}

impl Session {
    pub fn new(id: SessionId, title: impl Into<String>, created_at_unix_seconds: u64) -> Self {
        Self {
            id,
            title: title.into(),
            created_at_unix_seconds,
        }
    }
}

/// Owns the session set and the active-session pointer.
///
/// The set is never empty: construction seeds one default session, and no
/// operation removes the last one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionManager {
    sessions: Vec<Session>,
    active_id: SessionId,
}

impl SessionManager {
    /// Seeds the manager with one default session and makes it active.
    pub fn bootstrap() -> Self {
        let id = SessionId::generate();
        let session = Session::new(id, DEFAULT_SESSION_TITLE, current_unix_timestamp_seconds());
        Self {
            sessions: vec![session],
            active_id: id,
        }
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn active_id(&self) -> SessionId {
        self.active_id
    }

    pub fn active_session(&self) -> Option<&Session> {
        self.sessions
            .iter()
            .find(|session| session.id == self.active_id)
    }

    pub fn contains(&self, session_id: SessionId) -> bool {
        self.sessions.iter().any(|session| session.id == session_id)
    }

    /// Creates a session at the front of the list and makes it active.
    pub fn create(&mut self, title: impl Into<String>) -> SessionId {
        let mut title = title.into();
        if title.trim().is_empty() {
            title = DEFAULT_SESSION_TITLE.to_string();
        }

        let id = SessionId::generate();
        self.sessions.insert(
            0,
            Session::new(id, title, current_unix_timestamp_seconds()),
        );
        self.active_id = id;
        id
    }

    /// Makes an existing session active; unknown ids change nothing.
    pub fn switch_to(&mut self, session_id: SessionId) -> ChatResult<()> {
        ensure!(
            self.contains(session_id),
            SessionNotFoundSnafu {
                stage: "switch-to",
                session_id,
            }
        );

        self.active_id = session_id;
        Ok(())
    }
}

fn current_unix_timestamp_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
