//! Inventory, checkpoint and site-structure files.
//!
//! Everything is stored next to the content it describes, under `.media/` in
//! the repository itself:
//!
//! ```text
//! .media/
//! ├── .pages/<folder>.json                   one inventory per top-level folder (and `root`)
//! ├── .processing/discovery-checkpoint.json  the run checkpoint
//! └── site-structure.json                    the aggregated site structure
//! ```
//!
//! Every file is a [`Sheet`]: a JSON object `{schemaVersion, total, limit,
//! offset, data}`. A reader sees either the previous or the new content:
//! unless the backend replaces files atomically on its own, writes go to
//! `<file>.tmp` first and are renamed over the target.

pub mod error;

use crate::aggregator::SiteStructure;
use crate::models::{Checkpoint, Document};
use crate::persist::error::{ErrorKind, Result};
use exn::ResultExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sitescan_storage::BackendHandle;
use std::path::{Path, PathBuf};

/// Schema version written into every persisted sheet.
pub const SCHEMA_VERSION: u32 = 1;
/// Inventory name reserved for loose files at the repository root.
pub const ROOT_INVENTORY: &str = "root";

const MEDIA_DIR: &str = ".media";
const PAGES_DIR: &str = ".media/.pages";
const PROCESSING_DIR: &str = ".media/.processing";
const CHECKPOINT_FILE: &str = ".media/.processing/discovery-checkpoint.json";
const SITE_STRUCTURE_FILE: &str = ".media/site-structure.json";
const TMP_SUFFIX: &str = ".tmp";

/// Versioned envelope around every persisted file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sheet<T> {
    pub schema_version: u32,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
    pub data: Vec<T>,
}

// Borrowed form of `Sheet` for writing without cloning the payload.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SheetRef<'a, T> {
    schema_version: u32,
    total: usize,
    limit: usize,
    offset: usize,
    data: &'a [T],
}

// Only the version is looked at before committing to the full payload type.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionHeader {
    schema_version: Option<u32>,
}

/// Durable, idempotent access to the files discovery persists.
#[derive(Clone)]
pub struct Persistence {
    backend: BackendHandle,
}
impl Persistence {
    pub fn new(backend: BackendHandle) -> Self {
        Self { backend }
    }

    /// Create the `.media` scaffolding. Idempotent.
    pub async fn ensure_layout(&self) -> Result<()> {
        for dir in [MEDIA_DIR, PAGES_DIR, PROCESSING_DIR] {
            let dir = Path::new(dir);
            self.backend.ensure_folder(dir).await.or_raise(|| ErrorKind::Storage(dir.to_path_buf()))?;
        }
        Ok(())
    }

    pub fn inventory_path(name: &str) -> PathBuf {
        Path::new(PAGES_DIR).join(format!("{name}.json"))
    }

    /// Documents persisted for one folder. A missing inventory is empty.
    pub async fn read_inventory(&self, name: &str) -> Result<Vec<Document>> {
        let path = Self::inventory_path(name);
        Ok(self.read_sheet(&path).await?.map(|sheet| sheet.data).unwrap_or_default())
    }

    /// Replace the inventory of one folder.
    pub async fn write_inventory(&self, name: &str, documents: &[Document]) -> Result<()> {
        self.write_sheet(&Self::inventory_path(name), documents).await
    }

    /// Remove the inventory of one folder. Removing a missing inventory is not an error.
    pub async fn delete_inventory(&self, name: &str) -> Result<()> {
        let path = Self::inventory_path(name);
        match self.backend.delete(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.raise(ErrorKind::Storage(path))),
        }
    }

    /// Names of every persisted inventory, sorted.
    pub async fn list_inventories(&self) -> Result<Vec<String>> {
        let dir = Path::new(PAGES_DIR);
        let entries = self.backend.list_path(Some(dir)).await.or_raise(|| ErrorKind::Storage(dir.to_path_buf()))?;
        let mut names: Vec<String> = entries
            .into_iter()
            .filter(|e| e.has_ext("json"))
            .filter(|e| !e.name.is_empty())
            .map(|e| e.name)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    pub async fn read_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let sheet: Option<Sheet<Checkpoint>> = self.read_sheet(Path::new(CHECKPOINT_FILE)).await?;
        Ok(sheet.and_then(|s| s.data.into_iter().next()))
    }

    pub async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.write_sheet(Path::new(CHECKPOINT_FILE), std::slice::from_ref(checkpoint)).await
    }

    pub async fn clear_checkpoint(&self) -> Result<()> {
        let path = Path::new(CHECKPOINT_FILE);
        match self.backend.delete(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.raise(ErrorKind::Storage(path.to_path_buf()))),
        }
    }

    pub async fn read_site_structure(&self) -> Result<Option<SiteStructure>> {
        let sheet: Option<Sheet<SiteStructure>> = self.read_sheet(Path::new(SITE_STRUCTURE_FILE)).await?;
        Ok(sheet.and_then(|s| s.data.into_iter().next()))
    }

    pub async fn write_site_structure(&self, structure: &SiteStructure) -> Result<()> {
        self.write_sheet(Path::new(SITE_STRUCTURE_FILE), std::slice::from_ref(structure)).await
    }

    async fn read_sheet<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<Sheet<T>>> {
        let bytes = match self.backend.read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.raise(ErrorKind::Storage(path.to_path_buf()))),
        };
        let header: VersionHeader = serde_json::from_slice(&bytes).or_raise(|| ErrorKind::Corrupt(path.to_path_buf()))?;
        match header.schema_version {
            Some(SCHEMA_VERSION) => {},
            found => exn::bail!(ErrorKind::UnsupportedVersion {
                path: path.to_path_buf(),
                found: found.unwrap_or(0),
            }),
        }
        let sheet = serde_json::from_slice(&bytes).or_raise(|| ErrorKind::Corrupt(path.to_path_buf()))?;
        Ok(Some(sheet))
    }

    async fn write_sheet<T: Serialize>(&self, path: &Path, data: &[T]) -> Result<()> {
        let sheet = SheetRef {
            schema_version: SCHEMA_VERSION,
            total: data.len(),
            limit: data.len(),
            offset: 0,
            data,
        };
        let bytes = serde_json::to_vec_pretty(&sheet).or_raise(|| ErrorKind::Serialize(path.to_path_buf()))?;
        if self.backend.atomic_writes() {
            self.backend.write(path, &bytes).await.or_raise(|| ErrorKind::Storage(path.to_path_buf()))?;
            tracing::trace!(path = %path.display(), items = data.len(), "Persisted sheet");
            return Ok(());
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);
        self.backend.write(&tmp, &bytes).await.or_raise(|| ErrorKind::Storage(tmp.clone()))?;
        if let Err(e) = self.backend.rename(&tmp, path).await {
            // Leave the previous content in place; the stray temporary file is
            // overwritten by the next attempt.
            tracing::warn!(path = %path.display(), "Could not move temporary file into place");
            return Err(e.raise(ErrorKind::Storage(path.to_path_buf())));
        }
        tracing::trace!(path = %path.display(), items = data.len(), "Persisted sheet");
        Ok(())
    }
}
