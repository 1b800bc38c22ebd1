//! Moderation state: bans and mutes that survive restarts.

mod snapshot;
mod store;

pub use snapshot::{Snapshot, SnapshotFile};
pub use store::{is_active, moderation_key, BanInfo, ModerationStore, SweepReport};
