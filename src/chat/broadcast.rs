//! Fan-out of server events to live sessions.

use std::sync::Arc;

use tracing::trace;

use super::presence::PresenceRegistry;
use super::session::{Role, Session, SessionId};
use crate::protocol::ServerMessage;

/// Delivers events to sessions held by a [`PresenceRegistry`].
///
/// Recipient handles are collected under the read lock and the lock is
/// released before anything is queued. A failed send to one recipient never
/// affects the others; the dead session is cleaned up by its own task.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<PresenceRegistry>,
}

impl Broadcaster {
    /// Create a broadcaster over `registry`.
    pub fn new(registry: Arc<PresenceRegistry>) -> Self {
        Self { registry }
    }

    /// Send to every live session not in `exclude`. Returns the delivered count.
    pub async fn broadcast_all(&self, event: &ServerMessage, exclude: &[SessionId]) -> usize {
        let recipients = self
            .registry
            .recipients(|s| !exclude.contains(&s.id))
            .await;
        deliver(recipients, event)
    }

    /// Send to every live session holding `role`, minus `exclude`.
    pub async fn broadcast_to_role(
        &self,
        event: &ServerMessage,
        role: Role,
        exclude: &[SessionId],
    ) -> usize {
        let recipients = self
            .registry
            .recipients(|s| s.role == role && !exclude.contains(&s.id))
            .await;
        deliver(recipients, event)
    }

    /// Send to the session currently using `name`. Returns false if nobody is.
    pub async fn send_to_name(&self, name: &str, event: ServerMessage) -> bool {
        self.send_to_name_with(name, |_| event).await.is_some()
    }

    /// Like [`send_to_name`](Self::send_to_name), building the event from the
    /// resolved session. Returns the recipient's ID if it was present and the
    /// event was queued.
    pub async fn send_to_name_with<F>(&self, name: &str, build: F) -> Option<SessionId>
    where
        F: FnOnce(&Session) -> ServerMessage,
    {
        let session = self.registry.find_by_name(name).await?;
        if session.handle.send(build(&session)) {
            Some(session.id)
        } else {
            trace!(session_id = %session.id, "Dropped event for closed session");
            None
        }
    }

    /// Send to one session by ID.
    pub async fn send_to_session(&self, session_id: SessionId, event: ServerMessage) -> bool {
        match self.registry.get(session_id).await {
            Some(session) => session.handle.send(event),
            None => false,
        }
    }
}

fn deliver(
    recipients: Vec<(SessionId, super::session::SessionHandle)>,
    event: &ServerMessage,
) -> usize {
    let mut delivered = 0;
    for (id, handle) in recipients {
        if handle.send(event.clone()) {
            delivered += 1;
        } else {
            trace!(session_id = %id, "Dropped event for closed session");
        }
    }
    delivered
}
