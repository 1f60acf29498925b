//! Events pushed to collaborators while discovery runs.
//!
//! Delivery is a `tokio::sync::broadcast` channel: every subscriber sees each
//! event at most once, and a subscriber that falls too far behind is told how
//! many it missed instead of slowing the run down.

use crate::aggregator::SiteStructure;
use crate::models::{DiscoveryType, Document};
use crate::scanner::ChangeCounts;
use crate::tracker::DiscoveryStats;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryError {
    /// Inventory name of the failing folder; `None` for run-level failures.
    pub folder: Option<String>,
    pub message: String,
    /// Fatal errors end the run in `error`.
    pub fatal: bool,
}

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Started {
        mode: DiscoveryType,
        resumed: bool,
        total_folders: u64,
    },
    Progress(DiscoveryStats),
    DocumentsDiscovered {
        folder: String,
        documents: Arc<[Document]>,
    },
    FolderComplete {
        folder: String,
        documents: u64,
        changes: ChangeCounts,
    },
    Paused(DiscoveryStats),
    Resumed(DiscoveryStats),
    Complete {
        stats: DiscoveryStats,
        duration: Duration,
        site_structure: Arc<SiteStructure>,
    },
    Error(DiscoveryError),
    Stopped(DiscoveryStats),
}

/// Sending half of the event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DiscoveryEvent>,
}
impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }
}
impl EventBus {
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: DiscoveryEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("No event subscribers");
        }
    }
}
