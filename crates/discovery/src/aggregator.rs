//! Site structure aggregation.
//!
//! Reads every persisted inventory and folds the live (non-tombstoned)
//! documents into one nested folder tree. The result is derived data: it is
//! rebuilt wholesale on every completed run and whenever validation is
//! requested, never patched in place.

use crate::context::Context;
use crate::models::Document;
use crate::persist::Persistence;
use crate::persist::error::Result;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNode {
    pub name: String,
    pub path: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_modified: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderNode {
    pub path: String,
    pub files: Vec<FileNode>,
    pub subfolders: BTreeMap<String, FolderNode>,
}
impl FolderNode {
    fn new(path: String) -> Self {
        Self { path, ..Self::default() }
    }

    /// Look up a nested folder by its names relative to this one.
    pub fn folder<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Option<&FolderNode> {
        names.into_iter().try_fold(self, |node, name| node.subfolders.get(name))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructureStats {
    pub total_folders: u64,
    pub total_files: u64,
    pub excluded_folders: u64,
    pub deepest_nesting: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteStructure {
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub root: FolderNode,
    pub stats: StructureStats,
}

/// A freshly built structure plus the inventories that could not be read.
#[derive(Debug, Clone)]
pub struct Aggregate {
    pub structure: SiteStructure,
    pub files_with_errors: Vec<String>,
}

/// Result of [`SiteAggregator::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub stats: StructureStats,
    pub files_with_errors: Vec<String>,
}

pub struct SiteAggregator {
    persistence: Persistence,
    ctx: Arc<Context>,
}
impl SiteAggregator {
    pub fn new(persistence: Persistence, ctx: Arc<Context>) -> Self {
        Self { persistence, ctx }
    }

    /// Build the structure from every persisted inventory.
    ///
    /// Inventories that fail to load are recorded in
    /// [`files_with_errors`](Aggregate::files_with_errors) instead of aborting
    /// the aggregation. Only failing to list the inventories at all is an error.
    pub async fn build(&self) -> Result<Aggregate> {
        let names = self.persistence.list_inventories().await?;
        let loaded: Vec<_> = futures::stream::iter(names)
            .map(|name| async move {
                let result = self.persistence.read_inventory(&name).await;
                (name, result)
            })
            .buffered(self.ctx.concurrency)
            .collect()
            .await;

        let namespace = &self.ctx.namespace;
        let mut root = FolderNode::new(namespace.prefix().to_string());
        let mut stats = StructureStats {
            excluded_folders: self.ctx.filter.excluded_folders() as u64,
            ..StructureStats::default()
        };
        let mut files_with_errors = Vec::new();
        for (name, result) in loaded {
            let documents = match result {
                Ok(documents) => documents,
                Err(e) => {
                    tracing::warn!(inventory = %name, error = ?e, "Could not load inventory");
                    files_with_errors.push(Persistence::inventory_path(&name).to_string_lossy().into_owned());
                    continue;
                },
            };
            for document in documents.iter().filter(|d| !d.is_deleted()) {
                insert(&mut root, &mut stats, namespace.strip(&document.path), document);
            }
        }
        let structure = SiteStructure {
            generated_at: OffsetDateTime::now_utc(),
            root,
            stats,
        };
        Ok(Aggregate {
            structure,
            files_with_errors,
        })
    }

    /// Build the structure and persist it.
    #[tracing::instrument(name = "rebuilding site structure", skip(self))]
    pub async fn rebuild(&self) -> Result<Aggregate> {
        let aggregate = self.build().await?;
        self.persistence.write_site_structure(&aggregate.structure).await?;
        tracing::debug!(
            folders = aggregate.structure.stats.total_folders,
            files = aggregate.structure.stats.total_files,
            "Site structure rebuilt"
        );
        Ok(aggregate)
    }

    /// Rebuild the structure and check it is complete: every inventory
    /// loaded and at least one document was found.
    pub async fn validate(&self) -> Result<Validation> {
        let aggregate = self.rebuild().await?;
        let stats = aggregate.structure.stats;
        let reason = if !aggregate.files_with_errors.is_empty() {
            Some(format!("{} inventory file(s) failed to load", aggregate.files_with_errors.len()))
        } else if stats.total_files == 0 {
            Some("no documents discovered".to_string())
        } else {
            None
        };
        Ok(Validation {
            is_valid: reason.is_none(),
            reason,
            stats,
            files_with_errors: aggregate.files_with_errors,
        })
    }
}

fn insert(root: &mut FolderNode, stats: &mut StructureStats, relative: &str, document: &Document) {
    let segments: Vec<&str> = relative.split('/').filter(|s| !s.is_empty()).collect();
    let Some((_file, folders)) = segments.split_last() else {
        return;
    };
    let mut node = root;
    for name in folders {
        let path = format!("{}/{name}", node.path);
        node = node.subfolders.entry((*name).to_string()).or_insert_with(|| {
            stats.total_folders += 1;
            FolderNode::new(path)
        });
    }
    stats.deepest_nesting = stats.deepest_nesting.max(folders.len() as u64);
    stats.total_files += 1;
    node.files.push(FileNode {
        name: document.name.clone(),
        path: document.path.clone(),
        last_modified: document.last_modified,
    });
}
