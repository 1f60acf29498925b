//! Discovery models.
//!
//! Field names are serialized in camelCase to match the persisted JSON files
//! that downstream consumers (media extraction, the browser UI) already read.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Where a document is in the downstream media scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    #[default]
    #[display("pending")]
    Pending,
    #[display("scanned")]
    Scanned,
    #[display("deleted")]
    Deleted,
}

/// Outcome of an incremental merge for one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    #[display("new")]
    New,
    #[display("updated")]
    Updated,
    #[display("unchanged")]
    Unchanged,
    #[display("deleted")]
    Deleted,
}

/// One discovered `.html` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Absolute repository path (`/org/repo/...`), unique within a run.
    pub path: String,
    pub name: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_modified: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub discovered_at: OffsetDateTime,
    #[serde(default)]
    pub scan_status: ScanStatus,
    #[serde(default)]
    pub scan_complete: bool,
    #[serde(default)]
    pub media_count: u32,
    /// Only set by incremental merges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_status: Option<EntryStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}
impl Document {
    pub fn new(path: impl Into<String>, name: impl Into<String>, last_modified: Option<OffsetDateTime>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            last_modified,
            discovered_at: OffsetDateTime::now_utc(),
            scan_status: ScanStatus::Pending,
            scan_complete: false,
            media_count: 0,
            entry_status: None,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.entry_status == Some(EntryStatus::Deleted)
    }

    /// Tombstone this document. An existing tombstone keeps its original
    /// deletion time.
    pub fn tombstone(&mut self, at: OffsetDateTime) {
        if !self.is_deleted() {
            self.deleted_at = Some(at);
        }
        self.entry_status = Some(EntryStatus::Deleted);
        self.scan_status = ScanStatus::Deleted;
    }
}

/// Lifecycle of a discovery run.
///
/// The checkpoint file only ever records `idle`, `running`, `completed` or
/// `error`; `paused` and `stopped` live in the local progress mirror.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryStatus {
    #[default]
    #[display("idle")]
    Idle,
    #[display("running")]
    Running,
    #[display("paused")]
    Paused,
    #[display("completed")]
    Completed,
    #[display("stopped")]
    Stopped,
    #[display("error")]
    Error,
}
impl DiscoveryStatus {
    /// A run in this state was interrupted and can be resumed.
    pub fn is_unfinished(self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::Stopped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryType {
    #[display("full")]
    Full,
    #[display("incremental")]
    Incremental,
}

/// Run-level progress snapshot, persisted as the checkpoint file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub total_folders: u64,
    pub completed_folders: u64,
    pub total_documents: u64,
    pub status: DiscoveryStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub discovery_start_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub discovery_end_time: Option<OffsetDateTime>,
    pub discovery_type: DiscoveryType,
}
impl Checkpoint {
    pub fn started(discovery_type: DiscoveryType, total_folders: u64, at: OffsetDateTime) -> Self {
        Self {
            total_folders,
            completed_folders: 0,
            total_documents: 0,
            status: DiscoveryStatus::Running,
            discovery_start_time: Some(at),
            discovery_end_time: None,
            discovery_type,
        }
    }
}
