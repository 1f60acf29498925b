//! SQLite mirror of discovery progress.
//!
//! Progress counters live in memory while a discovery runs, but every change
//! is mirrored here so that an unplanned restart can pick up where the last
//! run stopped without asking the remote repository again. The database is
//! not the source of truth: the inventory files in the repository are. If it
//! is deleted, the next run simply starts from scratch.

mod db;
pub mod error;
mod store;

pub use crate::db::Database;
pub use crate::store::{ProgressStore, Stored};
