//! Progress counters, mirrored into the local SQLite store.
//!
//! The coordinator mutates counters here as folders report back; each
//! mutation is written through to the [`ProgressStore`] before returning, so
//! a restarted process can tell which folders of an interrupted run are
//! already done without asking the repository again.

use crate::context::Namespace;
use crate::error::{ErrorKind, Result};
use crate::models::{DiscoveryStatus, DiscoveryType};
use exn::{OptionExt, ResultExt};
use serde::{Deserialize, Serialize};
use sitescan_cache::ProgressStore;
use std::collections::BTreeSet;
use time::OffsetDateTime;

pub const PROGRESS_SCHEMA_VERSION: u32 = 1;

/// The single progress record kept per repository namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub schema_version: u32,
    pub run_id: String,
    pub mode: DiscoveryType,
    pub status: DiscoveryStatus,
    pub total_folders: u64,
    pub completed_folders: u64,
    pub total_documents: u64,
    pub errors: u64,
    /// Inventory names finished successfully in this run.
    pub completed: BTreeSet<String>,
    /// Inventory names that finished with an error in this run.
    pub failed: BTreeSet<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}
impl ProgressRecord {
    fn new(run_id: String, mode: DiscoveryType, total_folders: u64) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            schema_version: PROGRESS_SCHEMA_VERSION,
            run_id,
            mode,
            status: DiscoveryStatus::Running,
            total_folders,
            completed_folders: 0,
            total_documents: 0,
            errors: 0,
            completed: BTreeSet::new(),
            failed: BTreeSet::new(),
            started_at: now,
            updated_at: now,
        }
    }

    /// Whether `folder` already finished (successfully or not) in this run.
    pub fn is_done(&self, folder: &str) -> bool {
        self.completed.contains(folder) || self.failed.contains(folder)
    }

    pub fn stats(&self) -> DiscoveryStats {
        DiscoveryStats {
            total_folders: self.total_folders,
            completed_folders: self.completed_folders,
            total_documents: self.total_documents,
            errors: self.errors,
        }
    }
}

/// Aggregate counters of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryStats {
    pub total_folders: u64,
    pub completed_folders: u64,
    pub total_documents: u64,
    pub errors: u64,
}

pub struct ProgressTracker {
    store: ProgressStore,
    key: String,
    record: Option<ProgressRecord>,
}
impl ProgressTracker {
    pub fn new(store: ProgressStore, namespace: &Namespace) -> Self {
        Self {
            store,
            key: namespace.progress_key(),
            record: None,
        }
    }

    /// Read the record straight from the durable mirror.
    pub async fn load(&self) -> Result<Option<ProgressRecord>> {
        let stored = self
            .store
            .load::<ProgressRecord>(&self.key, PROGRESS_SCHEMA_VERSION)
            .await
            .or_raise(|| ErrorKind::Progress)?;
        Ok(stored.map(|s| s.record))
    }

    /// Re-hydrate the in-memory record from the durable mirror.
    pub async fn hydrate(&mut self) -> Result<Option<&ProgressRecord>> {
        self.record = self.load().await?;
        Ok(self.record.as_ref())
    }

    pub fn record(&self) -> Option<&ProgressRecord> {
        self.record.as_ref()
    }

    pub fn stats(&self) -> DiscoveryStats {
        self.record.as_ref().map(ProgressRecord::stats).unwrap_or_default()
    }

    /// Current counters, read back from the durable mirror.
    pub async fn persisted_stats(&self) -> Result<DiscoveryStats> {
        Ok(self.load().await?.map(|r| r.stats()).unwrap_or_default())
    }

    /// Drop the mirrored record entirely.
    pub async fn reset(&mut self) -> Result<()> {
        self.store.clear(&self.key).await.or_raise(|| ErrorKind::Progress)?;
        self.record = None;
        Ok(())
    }

    /// Start a fresh record for a new run.
    pub async fn begin(&mut self, run_id: String, mode: DiscoveryType, total_folders: u64) -> Result<()> {
        self.record = Some(ProgressRecord::new(run_id, mode, total_folders));
        self.save().await
    }

    /// Continue the hydrated record, keeping its counters.
    ///
    /// `total_folders` may change if the repository changed in between, but
    /// never drops below what was already completed.
    pub async fn resume(&mut self, total_folders: u64) -> Result<()> {
        let record = self.record.as_mut().ok_or_raise(|| ErrorKind::Progress)?;
        record.total_folders = total_folders.max(record.completed_folders);
        record.status = DiscoveryStatus::Running;
        self.save().await
    }

    pub async fn folder_completed(&mut self, folder: &str, documents: u64) -> Result<()> {
        self.finish_folder(folder, documents, false).await
    }

    /// A folder finished with an isolated error. It still counts as done.
    pub async fn folder_failed(&mut self, folder: &str, documents: u64) -> Result<()> {
        self.finish_folder(folder, documents, true).await
    }

    async fn finish_folder(&mut self, folder: &str, documents: u64, failed: bool) -> Result<()> {
        let record = self.record.as_mut().ok_or_raise(|| ErrorKind::Progress)?;
        if record.is_done(folder) {
            tracing::debug!(%folder, "Folder already recorded");
            return Ok(());
        }
        match failed {
            true => {
                record.failed.insert(folder.to_string());
                record.errors += 1;
            },
            false => {
                record.completed.insert(folder.to_string());
            },
        }
        record.completed_folders = (record.completed_folders + 1).min(record.total_folders);
        record.total_documents += documents;
        self.save().await
    }

    /// Count an error that is not tied to a dispatched folder.
    pub async fn record_error(&mut self) -> Result<()> {
        let record = self.record.as_mut().ok_or_raise(|| ErrorKind::Progress)?;
        record.errors += 1;
        self.save().await
    }

    pub async fn set_status(&mut self, status: DiscoveryStatus) -> Result<()> {
        let record = self.record.as_mut().ok_or_raise(|| ErrorKind::Progress)?;
        record.status = status;
        self.save().await
    }

    async fn save(&mut self) -> Result<()> {
        let Some(record) = self.record.as_mut() else {
            return Ok(());
        };
        record.updated_at = OffsetDateTime::now_utc();
        self.store
            .save(&self.key, PROGRESS_SCHEMA_VERSION, &*record)
            .await
            .or_raise(|| ErrorKind::Progress)
    }
}
