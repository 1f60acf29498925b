//! Discovery Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Persistence has its own error kinds
//! in [`persist::error`](crate::persist::error); they are raised into these
//! once they reach the coordinator.

use derive_more::{Display, Error};

/// A discovery error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for discovery operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Classifies the origin of a discovery failure.
///
/// ### Run-level Errors
/// - [`ErrorKind::AlreadyRunning`]
/// - [`ErrorKind::Listing`] - fatal, the run ends in `error`
///
/// ### Dependency Errors
/// - [`ErrorKind::Persistence`]
/// - [`ErrorKind::Progress`]
/// - [`ErrorKind::Cleanup`]
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Another discovery is already running for this coordinator.
    #[display("a discovery run is already in progress")]
    AlreadyRunning,
    /// The top-level listing of the repository could not be read.
    #[display("could not list the repository root")]
    Listing,
    /// Reading or writing inventories, the checkpoint or the site structure failed.
    #[display("persistence failure")]
    Persistence,
    /// The local progress mirror could not be read or written.
    #[display("progress mirror failure")]
    Progress,
    /// The media cleanup collaborator rejected a deletion sweep.
    #[display("media cleanup failed")]
    Cleanup,
    /// A folder scan was interrupted by a stop request.
    #[display("stopped")]
    Stopped,
}
