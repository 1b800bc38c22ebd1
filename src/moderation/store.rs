//! Ban and mute records with lazy expiry and durable snapshots.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::snapshot::{Snapshot, SnapshotFile};
use crate::datetime::{minutes_remaining, seconds_remaining, Clock};
use crate::Result;

/// Case-insensitive record key for a display name.
pub fn moderation_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// The one expiry rule: a restriction is in force strictly before its expiry.
/// `None` never expires.
pub fn is_active(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match expires_at {
        None => true,
        Some(expiry) => expiry > now,
    }
}

#[derive(Debug, Clone)]
struct BanRecord {
    name: String,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct MuteRecord {
    name: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Records {
    bans: HashMap<String, BanRecord>,
    mutes: HashMap<String, MuteRecord>,
    /// Bumped on every mutation so snapshot writes can be ordered.
    generation: u64,
}

impl Records {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut records = Records::default();
        for (name, expires_at) in snapshot.bans {
            records
                .bans
                .insert(moderation_key(&name), BanRecord { name, expires_at });
        }
        for (name, expires_at) in snapshot.mutes {
            records
                .mutes
                .insert(moderation_key(&name), MuteRecord { name, expires_at });
        }
        records
    }

    fn snapshot(&self) -> (u64, Snapshot) {
        let snapshot = Snapshot {
            bans: self
                .bans
                .values()
                .map(|r| (r.name.clone(), r.expires_at))
                .collect(),
            mutes: self
                .mutes
                .values()
                .map(|r| (r.name.clone(), r.expires_at))
                .collect(),
        };
        (self.generation, snapshot)
    }

    fn touch(&mut self) -> (u64, Snapshot) {
        self.generation += 1;
        self.snapshot()
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> SweepReport {
        let bans_before = self.bans.len();
        let mutes_before = self.mutes.len();
        self.bans.retain(|_, r| is_active(r.expires_at, now));
        self.mutes.retain(|_, r| is_active(Some(r.expires_at), now));
        SweepReport {
            bans: bans_before - self.bans.len(),
            mutes: mutes_before - self.mutes.len(),
        }
    }
}

/// Number of records removed by a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired bans removed.
    pub bans: usize,
    /// Expired mutes removed.
    pub mutes: usize,
}

impl SweepReport {
    /// Total records removed.
    pub fn total(&self) -> usize {
        self.bans + self.mutes
    }
}

/// A ban as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanInfo {
    /// Name as it was banned.
    pub name: String,
    /// Expiry; `None` is permanent.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Durable map of banned and muted names.
///
/// Every record operation goes through one mutex; expiry is decided only by
/// [`is_active`]. Mutations are persisted after the lock is released and a
/// failed write is logged without rolling back the in-memory change.
pub struct ModerationStore {
    records: Mutex<Records>,
    file: Option<SnapshotFile>,
    clock: Arc<dyn Clock>,
}

impl ModerationStore {
    /// Create an empty store that is never written to disk.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(Records::default()),
            file: None,
            clock,
        }
    }

    /// Load the store from its snapshot file and drop anything already expired.
    ///
    /// A missing or corrupt file yields an empty store.
    pub async fn load(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Self {
        let file = SnapshotFile::new(path.as_ref());
        let snapshot = file.load().await;
        let store = Self {
            records: Mutex::new(Records::from_snapshot(snapshot)),
            file: Some(file),
            clock,
        };

        let report = store.sweep_expired().await;
        let (bans, mutes) = store.counts().await;
        info!(
            bans,
            mutes,
            swept = report.total(),
            path = %path.as_ref().display(),
            "Moderation state loaded"
        );
        store
    }

    async fn save(&self, generation: u64, snapshot: Snapshot) {
        let Some(file) = &self.file else {
            return;
        };
        match file.save(generation, &snapshot).await {
            Ok(true) => debug!(generation, "Moderation snapshot written"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Failed to persist moderation state"),
        }
    }

    /// Write the current state to disk.
    pub async fn persist(&self) -> Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let (generation, snapshot) = self.records.lock().await.snapshot();
        file.save(generation, &snapshot).await.map(|_| ())
    }

    /// Reason text if `name` is currently banned.
    ///
    /// An expired ban is removed and the removal persisted.
    pub async fn check_ban(&self, name: &str) -> Option<String> {
        self.active_ban(name).await.map(|ban| match ban.expires_at {
            None => "You are banned from this server.".to_string(),
            Some(expiry) => format!(
                "You are banned for another {} minutes.",
                minutes_remaining(expiry, self.clock.now())
            ),
        })
    }

    /// The active ban for `name`, if any.
    pub async fn active_ban(&self, name: &str) -> Option<BanInfo> {
        let key = moderation_key(name);
        let now = self.clock.now();

        let pending = {
            let mut records = self.records.lock().await;
            let record = records.bans.get(&key)?;
            if is_active(record.expires_at, now) {
                return Some(BanInfo {
                    name: record.name.clone(),
                    expires_at: record.expires_at,
                });
            }
            records.bans.remove(&key);
            records.touch()
        };

        debug!(user = %name, "Expired ban removed");
        self.save(pending.0, pending.1).await;
        None
    }

    /// Reason text if `name` is currently muted.
    ///
    /// An expired mute is removed and the removal persisted.
    pub async fn check_mute(&self, name: &str) -> Option<String> {
        self.mute_expiry(name).await.map(|expiry| {
            format!(
                "You are muted for another {}s.",
                seconds_remaining(expiry, self.clock.now())
            )
        })
    }

    /// Expiry of the active mute for `name`, if any.
    pub async fn mute_expiry(&self, name: &str) -> Option<DateTime<Utc>> {
        let key = moderation_key(name);
        let now = self.clock.now();

        let pending = {
            let mut records = self.records.lock().await;
            let record = records.mutes.get(&key)?;
            if is_active(Some(record.expires_at), now) {
                return Some(record.expires_at);
            }
            records.mutes.remove(&key);
            records.touch()
        };

        debug!(user = %name, "Expired mute removed");
        self.save(pending.0, pending.1).await;
        None
    }

    /// Ban `name`, permanently when `duration_minutes` is `None`.
    ///
    /// Replaces any existing ban and returns the new expiry.
    pub async fn ban(&self, name: &str, duration_minutes: Option<u32>) -> Option<DateTime<Utc>> {
        let expires_at =
            duration_minutes.map(|m| self.clock.now() + Duration::minutes(i64::from(m)));

        let (generation, snapshot) = {
            let mut records = self.records.lock().await;
            records.bans.insert(
                moderation_key(name),
                BanRecord {
                    name: name.to_string(),
                    expires_at,
                },
            );
            records.touch()
        };

        info!(user = %name, ?expires_at, "Ban recorded");
        self.save(generation, snapshot).await;
        expires_at
    }

    /// Remove a ban. Returns whether one existed.
    pub async fn unban(&self, name: &str) -> bool {
        let pending = {
            let mut records = self.records.lock().await;
            match records.bans.remove(&moderation_key(name)) {
                Some(_) => records.touch(),
                None => return false,
            }
        };

        info!(user = %name, "Ban lifted");
        self.save(pending.0, pending.1).await;
        true
    }

    /// Mute `name` for `duration_minutes`, replacing any existing mute.
    pub async fn mute(&self, name: &str, duration_minutes: u32) -> DateTime<Utc> {
        let expires_at = self.clock.now() + Duration::minutes(i64::from(duration_minutes));

        let (generation, snapshot) = {
            let mut records = self.records.lock().await;
            records.mutes.insert(
                moderation_key(name),
                MuteRecord {
                    name: name.to_string(),
                    expires_at,
                },
            );
            records.touch()
        };

        info!(user = %name, %expires_at, "Mute recorded");
        self.save(generation, snapshot).await;
        expires_at
    }

    /// Remove a mute. Returns whether one existed.
    pub async fn unmute(&self, name: &str) -> bool {
        let pending = {
            let mut records = self.records.lock().await;
            match records.mutes.remove(&moderation_key(name)) {
                Some(_) => records.touch(),
                None => return false,
            }
        };

        info!(user = %name, "Mute lifted");
        self.save(pending.0, pending.1).await;
        true
    }

    /// Remove every expired ban and mute.
    pub async fn sweep_expired(&self) -> SweepReport {
        let now = self.clock.now();
        let (report, pending) = {
            let mut records = self.records.lock().await;
            let report = records.sweep(now);
            let pending = (report.total() > 0).then(|| records.touch());
            (report, pending)
        };

        if let Some((generation, snapshot)) = pending {
            debug!(bans = report.bans, mutes = report.mutes, "Expired moderation records swept");
            self.save(generation, snapshot).await;
        }
        report
    }

    /// Number of stored bans and mutes, including not-yet-swept expired ones.
    pub async fn counts(&self) -> (usize, usize) {
        let records = self.records.lock().await;
        (records.bans.len(), records.mutes.len())
    }

    /// Snapshot of the stored records.
    pub async fn snapshot(&self) -> Snapshot {
        self.records.lock().await.snapshot().1
    }
}
