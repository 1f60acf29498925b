//! Folder scanning and incremental merging.
//!
//! One scan owns one top-level folder: it walks the folder depth-first,
//! collects every `.html` document that is not excluded, merges the result
//! against the previously persisted inventory (incremental mode) and writes
//! the new inventory before reporting back.

use crate::context::Context;
use crate::models::{Document, DiscoveryType, EntryStatus, ScanStatus};
use crate::persist::{Persistence, ROOT_INVENTORY};
use crate::pool::UnitContext;
use serde::Serialize;
use sitescan_storage::{BackendHandle, Entry};
use std::collections::HashMap;
use std::ops::AddAssign;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;

const DOCUMENT_EXT: &str = "html";

/// How many documents of each [`EntryStatus`] a merge produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeCounts {
    pub new: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub deleted: u64,
}
impl ChangeCounts {
    pub fn has_changes(&self) -> bool {
        self.new + self.updated + self.deleted > 0
    }
}
impl AddAssign for ChangeCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.new += rhs.new;
        self.updated += rhs.updated;
        self.unchanged += rhs.unchanged;
        self.deleted += rhs.deleted;
    }
}

/// The merged inventory of one folder.
#[derive(Debug, Clone, Default)]
pub struct Merge {
    pub documents: Vec<Document>,
    pub changes: ChangeCounts,
}

fn is_newer(current: Option<OffsetDateTime>, previous: Option<OffsetDateTime>) -> bool {
    match (current, previous) {
        (Some(current), Some(previous)) => current > previous,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Merge the documents found now against those persisted before, by path.
///
/// When `complete` is `false` the walk was cut short, so documents that were
/// not seen again are carried over untouched instead of being tombstoned.
pub fn merge(previous: Vec<Document>, current: Vec<Document>, complete: bool, now: OffsetDateTime) -> Merge {
    let mut previous: HashMap<String, Document> = previous.into_iter().map(|d| (d.path.clone(), d)).collect();
    let mut changes = ChangeCounts::default();
    let mut documents = Vec::with_capacity(current.len() + previous.len());

    for mut document in current {
        let status = match previous.remove(&document.path) {
            Some(prior) if prior.is_deleted() => EntryStatus::New,
            Some(prior) if is_newer(document.last_modified, prior.last_modified) => {
                document.discovered_at = prior.discovered_at;
                document.scan_status = ScanStatus::Pending;
                document.scan_complete = false;
                document.media_count = 0;
                EntryStatus::Updated
            },
            Some(prior) => {
                document.discovered_at = prior.discovered_at;
                document.scan_status = prior.scan_status;
                document.scan_complete = prior.scan_complete;
                document.media_count = prior.media_count;
                EntryStatus::Unchanged
            },
            None => EntryStatus::New,
        };
        match status {
            EntryStatus::New => changes.new += 1,
            EntryStatus::Updated => changes.updated += 1,
            EntryStatus::Unchanged => changes.unchanged += 1,
            EntryStatus::Deleted => changes.deleted += 1,
        }
        document.entry_status = Some(status);
        document.deleted_at = None;
        documents.push(document);
    }

    for (_, mut prior) in previous {
        if complete {
            if !prior.is_deleted() {
                changes.deleted += 1;
            }
            prior.tombstone(now);
        }
        documents.push(prior);
    }
    documents.sort_by(|a, b| a.path.cmp(&b.path));
    Merge { documents, changes }
}

/// Result of scanning one folder, sent back to the coordinator.
#[derive(Debug, Clone, Default)]
pub struct FolderScan {
    /// Inventory name: the top-level folder name, or `root`.
    pub folder: String,
    pub documents: Vec<Document>,
    pub changes: ChangeCounts,
    /// Listing or persistence failure. Partial results are still in `documents`.
    pub error: Option<String>,
    /// A stop request cut the scan short; nothing was persisted.
    pub interrupted: bool,
}
impl FolderScan {
    /// Documents that are not tombstoned.
    pub fn live_documents(&self) -> u64 {
        self.documents.iter().filter(|d| !d.is_deleted()).count() as u64
    }
}

enum Classified {
    Folder(PathBuf),
    Document(Document),
    Skip,
}

struct Walk {
    documents: Vec<Document>,
    error: Option<String>,
    interrupted: bool,
}

#[derive(Clone)]
pub struct FolderScanner {
    backend: BackendHandle,
    persistence: Persistence,
    ctx: Arc<Context>,
}
impl FolderScanner {
    pub fn new(backend: BackendHandle, persistence: Persistence, ctx: Arc<Context>) -> Self {
        Self {
            backend,
            persistence,
            ctx,
        }
    }

    fn classify(&self, entry: &Entry) -> Classified {
        // Dot-prefixed entries (including our own `.media`) are never content.
        if entry.file_name().starts_with('.') {
            return Classified::Skip;
        }
        let absolute = match self.ctx.namespace.absolute(&entry.path) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(path = %entry.path.display(), error = ?e, "Skipping unrepresentable path");
                return Classified::Skip;
            },
        };
        if self.ctx.filter.is_excluded(&self.ctx.namespace, &absolute) {
            tracing::trace!(path = %absolute, "Excluded");
            return Classified::Skip;
        }
        if entry.is_folder() {
            Classified::Folder(entry.path.clone())
        } else if entry.has_ext(DOCUMENT_EXT) {
            Classified::Document(Document::new(absolute, entry.file_name(), entry.last_modified))
        } else {
            Classified::Skip
        }
    }

    /// Documents among loose entries of an already listed folder.
    pub fn documents<'a>(&self, entries: impl IntoIterator<Item = &'a Entry>) -> Vec<Document> {
        entries
            .into_iter()
            .filter(|e| !e.is_folder())
            .filter_map(|e| match self.classify(e) {
                Classified::Document(document) => Some(document),
                _ => None,
            })
            .collect()
    }

    async fn walk(&self, unit: &mut UnitContext, start: &Path) -> Walk {
        let mut documents = Vec::new();
        let mut stack = vec![start.to_path_buf()];
        while let Some(folder) = stack.pop() {
            if unit.checkpoint().await.is_err() {
                return Walk {
                    documents,
                    error: None,
                    interrupted: true,
                };
            }
            let listing = tokio::select! {
                biased;
                () = unit.stopped() => return Walk {
                    documents,
                    error: None,
                    interrupted: true,
                },
                listing = self.backend.list_path(Some(&folder)) => listing,
            };
            let entries = match listing {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(folder = %folder.display(), error = ?e, "Listing failed");
                    return Walk {
                        documents,
                        error: Some(format!("listing {} failed: {}", folder.display(), *e)),
                        interrupted: false,
                    };
                },
            };
            let mut subfolders = Vec::new();
            for entry in &entries {
                match self.classify(entry) {
                    Classified::Folder(path) => subfolders.push(path),
                    Classified::Document(document) => documents.push(document),
                    Classified::Skip => {},
                }
            }
            // Reversed, so the first listed subfolder is walked first.
            stack.extend(subfolders.into_iter().rev());
        }
        Walk {
            documents,
            error: None,
            interrupted: false,
        }
    }

    /// Scan one top-level folder inside a pool unit, then persist its inventory.
    #[tracing::instrument(name = "scanning folder", skip(self, unit), fields(unit = %unit.id()))]
    pub async fn scan_folder(&self, mut unit: UnitContext, folder: String, mode: DiscoveryType) -> FolderScan {
        let previous = match self.previous(&folder, mode).await {
            Ok(previous) => previous,
            Err(error) => return FolderScan { folder, error: Some(error), ..FolderScan::default() },
        };
        let mut walk = self.walk(&mut unit, Path::new(&folder)).await;
        // Last chance to give up. Once the inventory is written the scan must
        // be reported, or a resume would merge against its own output.
        walk.interrupted |= unit.checkpoint().await.is_err();
        if walk.interrupted {
            tracing::debug!(%folder, "Scan interrupted");
            return FolderScan {
                folder,
                documents: walk.documents,
                interrupted: true,
                ..FolderScan::default()
            };
        }
        self.finish(folder, previous, walk.documents, mode, walk.error).await
    }

    /// Re-evaluate loose files at the repository root against the `root` inventory.
    pub async fn scan_root(&self, entries: &[Entry], mode: DiscoveryType) -> FolderScan {
        let folder = ROOT_INVENTORY.to_string();
        let previous = match self.previous(&folder, mode).await {
            Ok(previous) => previous,
            Err(error) => return FolderScan { folder, error: Some(error), ..FolderScan::default() },
        };
        let current = self.documents(entries);
        self.finish(folder, previous, current, mode, None).await
    }

    async fn previous(&self, folder: &str, mode: DiscoveryType) -> Result<Option<Vec<Document>>, String> {
        match mode {
            DiscoveryType::Full => Ok(None),
            DiscoveryType::Incremental => match self.persistence.read_inventory(folder).await {
                Ok(documents) => Ok(Some(documents)),
                Err(e) => {
                    tracing::warn!(%folder, error = ?e, "Previous inventory unreadable");
                    Err(format!("previous inventory unreadable: {}", *e))
                },
            },
        }
    }

    async fn finish(
        &self,
        folder: String,
        previous: Option<Vec<Document>>,
        mut current: Vec<Document>,
        mode: DiscoveryType,
        mut error: Option<String>,
    ) -> FolderScan {
        let (documents, changes) = match (mode, previous) {
            (DiscoveryType::Incremental, Some(previous)) => {
                let merged = merge(previous, current, error.is_none(), OffsetDateTime::now_utc());
                (merged.documents, merged.changes)
            },
            _ => {
                current.sort_by(|a, b| a.path.cmp(&b.path));
                let changes = ChangeCounts {
                    new: current.len() as u64,
                    ..ChangeCounts::default()
                };
                (current, changes)
            },
        };
        if let Err(e) = self.persistence.write_inventory(&folder, &documents).await {
            tracing::warn!(%folder, error = ?e, "Could not persist inventory");
            error.get_or_insert_with(|| format!("persisting inventory failed: {}", *e));
        }
        tracing::debug!(%folder, documents = documents.len(), failed = error.is_some(), "Folder scanned");
        FolderScan {
            folder,
            documents,
            changes,
            error,
            interrupted: false,
        }
    }
}
