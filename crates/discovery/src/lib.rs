//! Discovery and incremental scanning of a content repository.
//!
//! The primary entry point is [`DiscoveryCoordinator::run`], which lists the
//! top of the repository, fans every top-level folder out to a bounded
//! [`WorkerPool`], and persists one inventory per folder (plus `root` for
//! loose files) under `.media/.pages/`. A later run in incremental mode
//! merges what it finds against those inventories, marking each document
//! `new`, `updated`, `unchanged` or `deleted`.
//!
//! Progress is mirrored into a local SQLite store
//! ([`sitescan_cache::ProgressStore`]) so an interrupted run can be resumed
//! without re-listing the folders it already finished.

pub mod aggregator;
mod context;
mod coordinator;
pub mod error;
mod events;
mod filter;
mod models;
pub mod persist;
pub mod pool;
mod scanner;
mod tracker;

pub use crate::aggregator::{SiteAggregator, SiteStructure, Validation};
pub use crate::context::{CHECKPOINT_KEY, Context, Namespace};
pub use crate::coordinator::{
    DiscoveryControl, DiscoveryCoordinator, DiscoveryMode, DiscoveryOutcome, IncrementalDiff, MediaCleanup,
    NoopCleanup, StatusReport,
};
pub use crate::events::{DiscoveryError, DiscoveryEvent, EventBus};
pub use crate::filter::{ExclusionFilter, matches};
pub use crate::models::{Checkpoint, DiscoveryStatus, DiscoveryType, Document, EntryStatus, ScanStatus};
pub use crate::persist::Persistence;
pub use crate::pool::WorkerPool;
pub use crate::scanner::{ChangeCounts, FolderScan, FolderScanner, Merge, merge};
pub use crate::tracker::{DiscoveryStats, ProgressRecord, ProgressTracker};
