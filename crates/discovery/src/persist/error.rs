//! Error types for the [`persist`](super) module.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A persistence error with automatic location tracking via [`exn::Exn`].
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for persistence operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The repository backend failed to read, write, rename or delete.
    #[display("storage operation failed for {}", _0.display())]
    Storage(#[error(not(source))] PathBuf),
    /// A persisted file is not valid JSON of the expected shape.
    #[display("corrupt file {}", _0.display())]
    Corrupt(#[error(not(source))] PathBuf),
    /// A persisted file declares a schema version this build cannot read.
    #[display("unsupported schema version {found} in {}", path.display())]
    UnsupportedVersion { path: PathBuf, found: u32 },
    #[display("could not serialize {}", _0.display())]
    Serialize(#[error(not(source))] PathBuf),
}
