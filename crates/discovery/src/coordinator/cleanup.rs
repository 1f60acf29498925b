use crate::error::Result;
use async_trait::async_trait;

/// Downstream collaborator that drops media usage records of documents
/// removed from the repository.
#[async_trait]
pub trait MediaCleanup: Send + Sync {
    /// Called once per removed top-level folder, with the absolute path of
    /// every document that was recorded under it.
    async fn cleanup_media_for_deleted_documents(&self, paths: &[String]) -> Result<()>;
}

/// Cleanup used when nothing downstream needs to know.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCleanup;

#[async_trait]
impl MediaCleanup for NoopCleanup {
    async fn cleanup_media_for_deleted_documents(&self, paths: &[String]) -> Result<()> {
        tracing::debug!(documents = paths.len(), "No media cleanup configured");
        Ok(())
    }
}
