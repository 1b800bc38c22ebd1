//! Command dispatch: applies parsed commands to the hub.

use std::sync::Arc;

use tracing::{debug, info};

use super::command::{format_help, parse_command, CommandError, CommandKind, ParsedCommand};
use super::hub::ChatHub;
use super::session::{Session, POLICY_VIOLATION};
use crate::protocol::ServerMessage;

/// Executes slash commands on behalf of a session.
pub struct CommandProcessor {
    hub: Arc<ChatHub>,
    default_mute_minutes: u32,
}

fn with_reason(text: String, reason: Option<&str>) -> String {
    match reason {
        Some(reason) => format!("{text} Reason: {reason}"),
        None => text,
    }
}

fn plural_minutes(minutes: u32) -> String {
    if minutes == 1 {
        "1 minute".to_string()
    } else {
        format!("{minutes} minutes")
    }
}

impl CommandProcessor {
    /// Create a processor. `/mute` without minutes uses `default_mute_minutes`.
    pub fn new(hub: Arc<ChatHub>, default_mute_minutes: u32) -> Self {
        Self {
            hub,
            default_mute_minutes,
        }
    }

    /// Run a command and report any rejection privately to the issuer.
    pub async fn handle(&self, issuer: &Session, raw: &str) -> Option<CommandKind> {
        match self.execute(issuer, raw).await {
            Ok(kind) => Some(kind),
            Err(e) => {
                debug!(user = %issuer.name, command = %raw, error = %e, "Command rejected");
                issuer.handle.send(ServerMessage::system(e.to_string()));
                None
            }
        }
    }

    /// Parse, authorize and run a command.
    ///
    /// Nothing is mutated unless parsing and authorization both succeed.
    pub async fn execute(&self, issuer: &Session, raw: &str) -> Result<CommandKind, CommandError> {
        let command = parse_command(raw)?;
        if command.kind != CommandKind::Help && !issuer.is_admin() {
            return Err(CommandError::PermissionDenied);
        }

        info!(user = %issuer.name, command = %command.kind, targets = ?command.targets, "Running command");

        match command.kind {
            CommandKind::Broadcast => self.broadcast(issuer, &command).await,
            CommandKind::ClearAll => self.clear_all(issuer).await,
            CommandKind::Kick => self.kick(issuer, &command).await,
            CommandKind::Ban => self.ban(issuer, &command).await,
            CommandKind::Unban => self.unban(issuer, &command).await,
            CommandKind::Mute => self.mute(issuer, &command).await,
            CommandKind::Unmute => self.unmute(issuer, &command).await,
            CommandKind::Help => {
                issuer.handle.send(ServerMessage::system(format_help()));
            }
        }

        Ok(command.kind)
    }

    fn notify(&self, issuer: &Session, text: impl Into<String>) {
        issuer.handle.send(ServerMessage::system(text));
    }

    async fn broadcast(&self, issuer: &Session, command: &ParsedCommand) {
        let event = ServerMessage::Broadcast {
            from: issuer.name.clone(),
            text: command.text.clone(),
            ts: self.hub.now_iso(),
        };
        self.hub.broadcaster().broadcast_all(&event, &[]).await;
    }

    async fn clear_all(&self, issuer: &Session) {
        self.hub
            .broadcaster()
            .broadcast_all(&ServerMessage::ClearChat, &[])
            .await;
        self.hub
            .announce(format!("Chat history cleared by {}.", issuer.name))
            .await;
    }

    /// Notify, evict and close a connected session.
    async fn force_disconnect(&self, target: &Session, notice: String, close_reason: &str) {
        self.hub
            .broadcaster()
            .send_to_session(target.id, ServerMessage::system(notice))
            .await;
        self.hub.evict(target.id).await;
        target.handle.close(POLICY_VIOLATION, close_reason);
    }

    async fn kick(&self, issuer: &Session, command: &ParsedCommand) {
        let reason = command.reason.as_deref();
        for name in &command.targets {
            let Some(target) = self.hub.registry().find_by_name(name).await else {
                self.notify(issuer, format!("User '{name}' not found."));
                continue;
            };

            let notice = with_reason(format!("You have been kicked by {}.", issuer.name), reason);
            self.force_disconnect(&target, notice, "Kicked").await;
            self.hub
                .announce(with_reason(
                    format!("{} was kicked by {}.", target.name, issuer.name),
                    reason,
                ))
                .await;
        }
    }

    async fn ban(&self, issuer: &Session, command: &ParsedCommand) {
        let reason = command.reason.as_deref();
        let span = match command.duration_minutes {
            Some(minutes) => format!("for {}", plural_minutes(minutes)),
            None => "permanently".to_string(),
        };

        for name in &command.targets {
            let connected = {
                let _gate = self.hub.lock_moderation().await;
                let connected = self.hub.registry().find_by_name(name).await;
                let display = connected.as_ref().map_or(name.as_str(), |s| s.name.as_str());
                self.hub
                    .moderation()
                    .ban(display, command.duration_minutes)
                    .await;
                connected
            };
            let display = connected.as_ref().map_or(name.as_str(), |s| s.name.as_str());

            if let Some(target) = &connected {
                let notice = with_reason(
                    format!("You have been banned {span} by {}.", issuer.name),
                    reason,
                );
                self.force_disconnect(target, notice, "Banned").await;
            }

            self.hub
                .announce(with_reason(
                    format!("{display} was banned by {} {span}.", issuer.name),
                    reason,
                ))
                .await;
        }
    }

    async fn unban(&self, issuer: &Session, command: &ParsedCommand) {
        for name in &command.targets {
            if self.hub.moderation().unban(name).await {
                self.hub
                    .announce(format!("{name} was unbanned by {}.", issuer.name))
                    .await;
            } else {
                self.notify(issuer, format!("User '{name}' is not banned."));
            }
        }
    }

    async fn mute(&self, issuer: &Session, command: &ParsedCommand) {
        let reason = command.reason.as_deref();
        let minutes = command
            .duration_minutes
            .unwrap_or(self.default_mute_minutes);

        for name in &command.targets {
            let connected = {
                let _gate = self.hub.lock_moderation().await;
                let connected = self.hub.registry().find_by_name(name).await;
                let display = connected.as_ref().map_or(name.as_str(), |s| s.name.as_str());
                let until = self.hub.moderation().mute(display, minutes).await;
                if let Some(target) = &connected {
                    self.hub
                        .registry()
                        .set_muted_until(target.id, Some(until))
                        .await;
                }
                connected
            };
            let display = connected.as_ref().map_or(name.as_str(), |s| s.name.as_str());

            if let Some(target) = &connected {
                let notice = with_reason(
                    format!(
                        "You have been muted for {} by {}.",
                        plural_minutes(minutes),
                        issuer.name
                    ),
                    reason,
                );
                self.hub
                    .broadcaster()
                    .send_to_session(target.id, ServerMessage::system(notice))
                    .await;
            }

            self.hub
                .announce(with_reason(
                    format!(
                        "{display} was muted by {} for {}.",
                        issuer.name,
                        plural_minutes(minutes)
                    ),
                    reason,
                ))
                .await;
        }
    }

    async fn unmute(&self, issuer: &Session, command: &ParsedCommand) {
        for name in &command.targets {
            let (was_muted, connected) = {
                let _gate = self.hub.lock_moderation().await;
                let mut was_muted = self.hub.moderation().unmute(name).await;
                let connected = self.hub.registry().find_by_name(name).await;
                if let Some(target) = &connected {
                    was_muted |= target.muted_until.is_some();
                    self.hub.registry().set_muted_until(target.id, None).await;
                }
                (was_muted, connected)
            };

            if let (true, Some(target)) = (was_muted, &connected) {
                self.hub
                    .broadcaster()
                    .send_to_session(
                        target.id,
                        ServerMessage::system(format!("You have been unmuted by {}.", issuer.name)),
                    )
                    .await;
            }

            if was_muted {
                self.hub
                    .announce(format!("{name} was unmuted by {}.", issuer.name))
                    .await;
            } else {
                self.notify(issuer, format!("User '{name}' is not muted."));
            }
        }
    }
}
