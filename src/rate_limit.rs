//! Per-session rate limiting for message-class events.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::chat::SessionId;

/// Configuration for rate limiting.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Maximum actions allowed in the time window.
    pub max_actions: u32,
    /// Time window for counting actions.
    pub window: Duration,
}

impl RateLimitConfig {
    /// Create a new rate limit configuration.
    pub fn new(max_actions: u32, window_secs: u64) -> Self {
        Self {
            max_actions,
            window: Duration::from_secs(window_secs),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(10, 10)
    }
}

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Action is allowed.
    Allowed,
    /// Action is denied due to rate limit.
    Denied {
        /// Time until the oldest action leaves the window.
        retry_after: Duration,
    },
}

impl RateLimitResult {
    /// Check if the action is allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed)
    }
}

/// Recent action timestamps for one session.
#[derive(Debug, Default)]
struct Window {
    timestamps: Vec<Instant>,
}

impl Window {
    fn prune(&mut self, window: Duration, now: Instant) {
        self.timestamps
            .retain(|&t| now.saturating_duration_since(t) < window);
    }
}

/// Sliding-window limiter keyed by session.
#[derive(Debug)]
pub struct SessionRateLimiter {
    config: RateLimitConfig,
    sessions: RwLock<HashMap<SessionId, Window>>,
}

impl SessionRateLimiter {
    /// Create a new rate limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SessionId, Window>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SessionId, Window>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Check and record in one operation.
    ///
    /// Returns `Allowed` and records the action, or `Denied` without recording.
    pub fn check_and_record(&self, session_id: SessionId) -> RateLimitResult {
        let now = Instant::now();
        let mut sessions = self.write();
        let window = sessions.entry(session_id).or_default();
        window.prune(self.config.window, now);

        if window.timestamps.len() >= self.config.max_actions as usize {
            let oldest = window.timestamps.iter().min().copied().unwrap_or(now);
            let retry_after = self
                .config
                .window
                .saturating_sub(now.saturating_duration_since(oldest));
            return RateLimitResult::Denied { retry_after };
        }

        window.timestamps.push(now);
        RateLimitResult::Allowed
    }

    /// Number of actions still allowed in the current window.
    pub fn remaining(&self, session_id: SessionId) -> u32 {
        let now = Instant::now();
        let used = self
            .read()
            .get(&session_id)
            .map(|w| {
                w.timestamps
                    .iter()
                    .filter(|&&t| now.saturating_duration_since(t) < self.config.window)
                    .count()
            })
            .unwrap_or(0);
        self.config.max_actions.saturating_sub(used as u32)
    }

    /// Forget a session (on disconnect).
    pub fn remove(&self, session_id: SessionId) {
        self.write().remove(&session_id);
    }

    /// Number of sessions currently tracked.
    pub fn tracked(&self) -> usize {
        self.read().len()
    }
}
