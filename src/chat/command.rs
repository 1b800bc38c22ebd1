//! Slash-command parser.
//!
//! Turns a raw command line such as `/ban @alice 10 spamming` into a
//! [`ParsedCommand`]. Parsing is pure; dispatching lives in the processor.

use thiserror::Error;

/// Supported commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Send a distinguished broadcast event.
    Broadcast,
    /// Tell every client to clear its history.
    ClearAll,
    /// Disconnect users.
    Kick,
    /// Ban users, optionally for a number of minutes.
    Ban,
    /// Lift bans.
    Unban,
    /// Mute users for a number of minutes.
    Mute,
    /// Lift mutes.
    Unmute,
    /// List commands.
    Help,
}

impl CommandKind {
    /// Resolve a command name or alias (without the slash).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "broadcast" | "b" => Some(CommandKind::Broadcast),
            "clearall" => Some(CommandKind::ClearAll),
            "kick" => Some(CommandKind::Kick),
            "ban" => Some(CommandKind::Ban),
            "unban" => Some(CommandKind::Unban),
            "mute" => Some(CommandKind::Mute),
            "unmute" => Some(CommandKind::Unmute),
            "help" | "h" | "?" => Some(CommandKind::Help),
            _ => None,
        }
    }

    /// Get the command name.
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Broadcast => "broadcast",
            CommandKind::ClearAll => "clearall",
            CommandKind::Kick => "kick",
            CommandKind::Ban => "ban",
            CommandKind::Unban => "unban",
            CommandKind::Mute => "mute",
            CommandKind::Unmute => "unmute",
            CommandKind::Help => "help",
        }
    }

    /// Usage line.
    pub fn usage(&self) -> &'static str {
        match self {
            CommandKind::Broadcast => "/broadcast <text>",
            CommandKind::ClearAll => "/clearall",
            CommandKind::Kick => "/kick @user [@user...]",
            CommandKind::Ban => "/ban @user [minutes] [reason]",
            CommandKind::Unban => "/unban @user [@user...]",
            CommandKind::Mute => "/mute @user [minutes] [reason]",
            CommandKind::Unmute => "/unmute @user [@user...]",
            CommandKind::Help => "/help",
        }
    }

    fn needs_targets(&self) -> bool {
        matches!(
            self,
            CommandKind::Kick
                | CommandKind::Ban
                | CommandKind::Unban
                | CommandKind::Mute
                | CommandKind::Unmute
        )
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "/{}", self.name())
    }
}

/// A command that parsed successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    /// Which command.
    pub kind: CommandKind,
    /// Target names, `@` stripped.
    pub targets: Vec<String>,
    /// Leading integer after the targets.
    pub duration_minutes: Option<u32>,
    /// Remaining positional tokens joined by spaces.
    pub reason: Option<String>,
    /// Everything after the command token, trimmed.
    pub text: String,
}

/// Command rejections. `Display` is the notice sent to the issuer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// Not a known command.
    #[error("Unknown command: /{0}. Type /help for a list of commands.")]
    Unknown(String),
    /// A targeted command without `@user`.
    #[error("Usage: {}", .0.usage())]
    MissingTarget(CommandKind),
    /// A text command without text.
    #[error("Usage: {}", .0.usage())]
    MissingText(CommandKind),
    /// Duration that is zero or out of range.
    #[error("Invalid duration '{0}': expected a positive number of minutes.")]
    InvalidDuration(String),
    /// Issuer lacks the admin role.
    #[error("You do not have permission to use this command.")]
    PermissionDenied,
}

/// Parse a raw command line.
///
/// Targets are the run of `@name` tokens right after the command; the first
/// positional token, if it is an integer, is the duration in minutes.
pub fn parse_command(raw: &str) -> Result<ParsedCommand, CommandError> {
    let trimmed = raw.trim();
    let Some(without_slash) = trimmed.strip_prefix('/') else {
        return Err(CommandError::Unknown(trimmed.to_string()));
    };

    let (name, rest) = match without_slash.find(char::is_whitespace) {
        Some(pos) => (&without_slash[..pos], without_slash[pos..].trim()),
        None => (without_slash, ""),
    };
    let kind = CommandKind::from_name(name).ok_or_else(|| CommandError::Unknown(name.to_string()))?;

    let mut tokens = rest.split_whitespace().peekable();
    let mut targets = Vec::new();
    while let Some(token) = tokens.next_if(|t| t.starts_with('@')) {
        let target = token.trim_start_matches('@');
        if !target.is_empty() {
            targets.push(target.to_string());
        }
    }

    let mut duration_minutes = None;
    if let Some(token) = tokens.peek() {
        if let Ok(value) = token.parse::<i64>() {
            let minutes = u32::try_from(value)
                .ok()
                .filter(|m| *m > 0)
                .ok_or_else(|| CommandError::InvalidDuration(token.to_string()))?;
            duration_minutes = Some(minutes);
            tokens.next();
        }
    }

    let reason = tokens.collect::<Vec<_>>().join(" ");
    let reason = (!reason.is_empty()).then_some(reason);

    if kind.needs_targets() && targets.is_empty() {
        return Err(CommandError::MissingTarget(kind));
    }
    if kind == CommandKind::Broadcast && rest.is_empty() {
        return Err(CommandError::MissingText(kind));
    }

    Ok(ParsedCommand {
        kind,
        targets,
        duration_minutes,
        reason,
        text: rest.to_string(),
    })
}

/// Command information for help display.
pub struct CommandInfo {
    /// Command.
    pub kind: CommandKind,
    /// Command aliases.
    pub aliases: &'static [&'static str],
    /// Command description.
    pub description: &'static str,
}

/// Get all available command information.
pub fn get_command_help() -> Vec<CommandInfo> {
    vec![
        CommandInfo {
            kind: CommandKind::Broadcast,
            aliases: &["b"],
            description: "Send an announcement to everyone",
        },
        CommandInfo {
            kind: CommandKind::ClearAll,
            aliases: &[],
            description: "Clear the chat history of every client",
        },
        CommandInfo {
            kind: CommandKind::Kick,
            aliases: &[],
            description: "Disconnect users",
        },
        CommandInfo {
            kind: CommandKind::Ban,
            aliases: &[],
            description: "Ban a user (permanently if no minutes are given)",
        },
        CommandInfo {
            kind: CommandKind::Unban,
            aliases: &[],
            description: "Lift bans",
        },
        CommandInfo {
            kind: CommandKind::Mute,
            aliases: &[],
            description: "Mute a user (5 minutes by default)",
        },
        CommandInfo {
            kind: CommandKind::Unmute,
            aliases: &[],
            description: "Lift mutes",
        },
        CommandInfo {
            kind: CommandKind::Help,
            aliases: &["h", "?"],
            description: "Show this help",
        },
    ]
}

/// Format the help message for display.
pub fn format_help() -> String {
    let mut lines = vec!["=== Commands ===".to_string()];

    for info in get_command_help() {
        lines.push(format!("{}  {}", info.kind.usage(), info.description));
        if !info.aliases.is_empty() {
            lines.push(format!("  aliases: /{}", info.aliases.join(", /")));
        }
    }

    lines.join("\n")
}
