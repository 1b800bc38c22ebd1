//! Shared chat state: presence, fan-out, moderation and the clock.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

use super::broadcast::Broadcaster;
use super::presence::PresenceRegistry;
use super::session::{Session, SessionId};
use crate::datetime::{to_iso, Clock};
use crate::moderation::ModerationStore;
use crate::protocol::ServerMessage;

/// The single room every session lives in.
pub struct ChatHub {
    registry: Arc<PresenceRegistry>,
    broadcaster: Broadcaster,
    moderation: Arc<ModerationStore>,
    clock: Arc<dyn Clock>,
    /// Serializes admission and renames with moderation commands.
    gate: Mutex<()>,
}

impl ChatHub {
    /// Create a hub. `admin_name` is reserved for the admin session.
    pub fn new(
        admin_name: impl Into<String>,
        moderation: Arc<ModerationStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(PresenceRegistry::new(admin_name));
        Self {
            broadcaster: Broadcaster::new(Arc::clone(&registry)),
            registry,
            moderation,
            clock,
            gate: Mutex::new(()),
        }
    }

    /// Enter the admission/moderation critical section.
    ///
    /// Hold the guard from a ban or mute lookup through the registry change
    /// that depends on it (`admit`, `rename`), and from a moderation record
    /// change through resolving which live session it applies to. Lock order
    /// is gate first, then the store or the registry.
    pub async fn lock_moderation(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    /// Presence registry.
    pub fn registry(&self) -> &PresenceRegistry {
        &self.registry
    }

    /// Fan-out engine.
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Moderation store.
    pub fn moderation(&self) -> &ModerationStore {
        &self.moderation
    }

    /// Clock shared with the moderation store.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Current time as an outbound timestamp.
    pub fn now_iso(&self) -> String {
        to_iso(&self.clock.now())
    }

    /// Send a system notice to everyone.
    pub async fn announce(&self, text: impl Into<String>) -> usize {
        self.broadcaster
            .broadcast_all(&ServerMessage::system(text), &[])
            .await
    }

    /// Send the current presence list to everyone.
    pub async fn broadcast_users(&self) -> usize {
        let users = self.registry.snapshot_list().await;
        self.broadcaster
            .broadcast_all(&ServerMessage::Users { users }, &[])
            .await
    }

    /// Remove a session and announce its departure.
    ///
    /// The registry entry is gone before anything is broadcast, and only the
    /// caller that actually removed it announces, so kicks racing a natural
    /// disconnect produce one `user_leave`.
    pub async fn evict(&self, session_id: SessionId) -> Option<Session> {
        let session = self.registry.evict(session_id).await?;

        self.broadcaster
            .broadcast_all(
                &ServerMessage::UserLeave {
                    user: session.user_info(),
                },
                &[],
            )
            .await;
        self.announce(format!("{} has left the chat.", session.name))
            .await;

        info!(session_id = %session_id, user = %session.name, "User left");
        Some(session)
    }
}
