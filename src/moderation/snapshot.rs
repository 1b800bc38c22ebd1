//! Durable ban/mute snapshot file.
//!
//! The file is a JSON object of the form
//! `{"bans": {name: timestamp | null}, "mutes": {name: timestamp}}`.
//! Writes go to a sibling temporary file that is then renamed over the
//! canonical path, so a crash mid-write leaves the previous snapshot intact.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::datetime::to_iso;
use crate::{AkatsukiError, Result};

/// In-memory form of the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Banned names; `None` means permanent.
    pub bans: BTreeMap<String, Option<DateTime<Utc>>>,
    /// Muted names with their expiry.
    pub mutes: BTreeMap<String, DateTime<Utc>>,
}

/// On-disk form of the snapshot.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotDocument {
    #[serde(default)]
    bans: BTreeMap<String, Option<String>>,
    #[serde(default)]
    mutes: BTreeMap<String, String>,
}

/// Parse a stored timestamp, accepting RFC 3339 and offset-less ISO 8601
/// (treated as UTC).
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

impl Snapshot {
    fn from_document(doc: SnapshotDocument) -> Self {
        let mut snapshot = Snapshot::default();

        for (name, expiry) in doc.bans {
            let expiry = match expiry {
                None => None,
                Some(raw) => match parse_timestamp(&raw) {
                    Some(dt) => Some(dt),
                    None => {
                        // An unreadable ban expiry keeps the ban in force.
                        warn!(user = %name, value = %raw, "Unparseable ban expiry, treating as permanent");
                        None
                    }
                },
            };
            snapshot.bans.insert(name, expiry);
        }

        for (name, raw) in doc.mutes {
            match parse_timestamp(&raw) {
                Some(dt) => {
                    snapshot.mutes.insert(name, dt);
                }
                None => {
                    warn!(user = %name, value = %raw, "Unparseable mute expiry, dropping mute");
                }
            }
        }

        snapshot
    }

    fn to_document(&self) -> SnapshotDocument {
        SnapshotDocument {
            bans: self
                .bans
                .iter()
                .map(|(name, expiry)| (name.clone(), expiry.as_ref().map(to_iso)))
                .collect(),
            mutes: self
                .mutes
                .iter()
                .map(|(name, expiry)| (name.clone(), to_iso(expiry)))
                .collect(),
        }
    }

    /// Decode a snapshot from JSON bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let doc: SnapshotDocument = serde_json::from_slice(bytes)?;
        Ok(Self::from_document(doc))
    }

    /// Encode the snapshot as pretty-printed JSON.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(&self.to_document())?)
    }
}

/// Snapshot file with serialized writers.
#[derive(Debug)]
pub struct SnapshotFile {
    path: PathBuf,
    /// Generation of the last state written; also serializes writers.
    written: Mutex<u64>,
}

impl SnapshotFile {
    /// Create a handle for the snapshot at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            written: Mutex::new(0),
        }
    }

    /// Canonical snapshot path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "snapshot".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Read the snapshot, treating a missing or corrupt file as empty.
    pub async fn load(&self) -> Snapshot {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => match Snapshot::decode(&bytes) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Corrupt moderation snapshot, starting empty");
                    Snapshot::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No moderation snapshot, starting empty");
                Snapshot::default()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read moderation snapshot, starting empty");
                Snapshot::default()
            }
        }
    }

    /// Write `snapshot` taken at state `generation`.
    ///
    /// Writes are serialized; a snapshot older than the one already on disk
    /// is skipped so the file never moves backwards. Returns whether the file
    /// was written.
    pub async fn save(&self, generation: u64, snapshot: &Snapshot) -> Result<bool> {
        let mut written = self.written.lock().await;
        if generation < *written {
            debug!(generation, written = *written, "Skipping stale moderation snapshot");
            return Ok(false);
        }

        let bytes = snapshot.encode()?;
        self.write_atomic(&bytes)
            .await
            .map_err(|e| AkatsukiError::Persistence(format!("{}: {e}", self.path.display())))?;

        *written = generation;
        Ok(true)
    }

    async fn write_atomic(&self, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let temp = self.temp_path();
        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp, &self.path).await
    }
}
