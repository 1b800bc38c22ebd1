//! Presence registry: the authoritative set of connected sessions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::session::{Role, Session, SessionHandle, SessionId};
use crate::protocol::UserInfo;

/// Maximum display name length in characters.
pub const MAX_NAME_LENGTH: usize = 32;

/// Display name rejections.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    /// Empty after trimming.
    #[error("Username cannot be empty")]
    Empty,
    /// Longer than [`MAX_NAME_LENGTH`].
    #[error("Username must be at most {MAX_NAME_LENGTH} characters")]
    TooLong,
    /// Another live session holds the name.
    #[error("Username is already in use")]
    Taken,
    /// Reserved for the admin.
    #[error("Username is reserved")]
    Reserved,
    /// The session is no longer registered.
    #[error("Session is not connected")]
    NotConnected,
}

/// Trim and check a requested display name.
pub fn validate_name(raw: &str) -> Result<String, NameError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(NameError::TooLong);
    }
    Ok(name.to_string())
}

/// Case-insensitive name comparison.
pub fn names_equal(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

/// Registry of live sessions keyed by session ID.
///
/// Writers take the exclusive lock for the whole check-then-insert, so two
/// admissions with colliding names can never both succeed.
pub struct PresenceRegistry {
    sessions: RwLock<HashMap<SessionId, Session>>,
    reserved_name: String,
}

impl PresenceRegistry {
    /// Create an empty registry. `reserved_name` is the admin display name.
    pub fn new(reserved_name: impl Into<String>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            reserved_name: reserved_name.into(),
        }
    }

    /// Whether `name` is the reserved admin display name.
    pub fn is_reserved(&self, name: &str) -> bool {
        names_equal(name.trim(), &self.reserved_name)
    }

    /// Insert a session if its name is free.
    pub async fn admit(&self, session: Session) -> Result<(), NameError> {
        let mut sessions = self.sessions.write().await;
        if sessions.values().any(|s| names_equal(&s.name, &session.name)) {
            return Err(NameError::Taken);
        }

        info!(session_id = %session.id, user = %session.name, role = %session.role, "Session admitted");
        sessions.insert(session.id, session);
        Ok(())
    }

    /// Remove and return a session. Returns `None` if already gone.
    pub async fn evict(&self, session_id: SessionId) -> Option<Session> {
        let removed = self.sessions.write().await.remove(&session_id);
        if let Some(session) = &removed {
            info!(session_id = %session_id, user = %session.name, "Session evicted");
        }
        removed
    }

    /// Change a session's display name. Returns the previous name.
    pub async fn rename(&self, session_id: SessionId, new_name: &str) -> Result<String, NameError> {
        let new_name = validate_name(new_name)?;

        let mut sessions = self.sessions.write().await;
        let role = sessions
            .get(&session_id)
            .map(|s| s.role)
            .ok_or(NameError::NotConnected)?;

        if role != Role::Admin && self.is_reserved(&new_name) {
            return Err(NameError::Reserved);
        }
        if sessions
            .values()
            .any(|s| s.id != session_id && names_equal(&s.name, &new_name))
        {
            return Err(NameError::Taken);
        }

        let session = sessions
            .get_mut(&session_id)
            .ok_or(NameError::NotConnected)?;
        let old = std::mem::replace(&mut session.name, new_name);
        debug!(session_id = %session_id, from = %old, to = %session.name, "Session renamed");
        Ok(old)
    }

    /// Look up a session by ID.
    pub async fn get(&self, session_id: SessionId) -> Option<Session> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    /// Look up a session by display name, case-insensitively.
    pub async fn find_by_name(&self, name: &str) -> Option<Session> {
        let name = name.trim();
        self.sessions
            .read()
            .await
            .values()
            .find(|s| names_equal(&s.name, name))
            .cloned()
    }

    /// Point-in-time presence list, ordered by name.
    pub async fn snapshot_list(&self) -> Vec<UserInfo> {
        let mut users: Vec<UserInfo> = self
            .sessions
            .read()
            .await
            .values()
            .map(Session::user_info)
            .collect();
        users.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.name.cmp(&b.name))
        });
        users
    }

    /// Handles of every session matching `filter`.
    pub async fn recipients<F>(&self, filter: F) -> Vec<(SessionId, SessionHandle)>
    where
        F: Fn(&Session) -> bool,
    {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| filter(s))
            .map(|s| (s.id, s.handle.clone()))
            .collect()
    }

    /// Set or clear a session's display color.
    pub async fn set_color(&self, session_id: SessionId, color: Option<String>) -> bool {
        match self.sessions.write().await.get_mut(&session_id) {
            Some(session) => {
                session.color = color;
                true
            }
            None => false,
        }
    }

    /// Set or clear a session's mute expiry.
    pub async fn set_muted_until(
        &self,
        session_id: SessionId,
        muted_until: Option<DateTime<Utc>>,
    ) -> bool {
        match self.sessions.write().await.get_mut(&session_id) {
            Some(session) => {
                session.muted_until = muted_until;
                true
            }
            None => false,
        }
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Check if no sessions are live.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
