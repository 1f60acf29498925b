//! Access to the content repository being discovered.
//!
//! Everything the discovery engine needs from the outside world goes through
//! [`RepositoryBackend`]: listing one folder, fetching a document, and
//! reading/writing the JSON files the engine persists next to the content.

pub mod backend;
pub mod error;
mod models;
mod path;

pub use crate::backend::RepositoryBackend;
pub use crate::models::{Entry, EntryKind};
pub use crate::path::{to_slash, validate as validate_path, validate_folder};
use std::sync::Arc;

pub type BackendHandle = Arc<dyn RepositoryBackend + Send + Sync>;
