// Delete stage: remove association and result folders

use crate::application::stage::{MessageHandler, ProcessContext};
use crate::domain::{DeleteQueueItem, QueueMessage};
use crate::error::Result;
use crate::port::ArtifactStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub struct DeleteHandler {
    artifacts: Arc<dyn ArtifactStore>,
}

impl DeleteHandler {
    pub fn new(artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { artifacts }
    }
}

#[async_trait]
impl MessageHandler for DeleteHandler {
    async fn handle(&self, message: &QueueMessage, _ctx: &mut ProcessContext<'_>) -> Result<()> {
        let item: DeleteQueueItem = message.decode()?;
        for path in &item.paths {
            self.artifacts.delete(path).await?;
            debug!(
                correlation_id = %message.correlation_id,
                path = %path.display(),
                "Deleted artifact"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::stages::test_support::{context, message, run_expired, run_handle};
    use crate::port::artifact_store::mocks::InMemoryArtifactStore;
    use crate::port::queue_store::mocks::InMemoryQueueStore;
    use std::path::{Path, PathBuf};

    #[tokio::test]
    async fn test_deletes_every_path() {
        let artifacts = Arc::new(InMemoryArtifactStore::new());
        artifacts.add_file("/in/assoc-1/1.dcm", b"dicom");
        artifacts.add_file("/results/corr-1/result.zip", b"segmentation");
        let handler = DeleteHandler::new(artifacts.clone());
        let store = InMemoryQueueStore::new();
        let item = DeleteQueueItem::new([
            PathBuf::from("/in/assoc-1"),
            PathBuf::from("/results/corr-1"),
            PathBuf::from("/already/gone"),
        ]);

        run_handle(&handler, &message(&item), &store, &context(&store))
            .await
            .unwrap();

        assert!(!artifacts.contains(Path::new("/in/assoc-1")));
        assert!(!artifacts.contains(Path::new("/results/corr-1")));
        assert_eq!(artifacts.deleted().len(), 3);
    }

    #[tokio::test]
    async fn test_expiry_has_no_cleanup() {
        let handler = DeleteHandler::new(Arc::new(InMemoryArtifactStore::new()));
        let store = InMemoryQueueStore::new();
        let item = DeleteQueueItem::new([PathBuf::from("/in/assoc-1")]);

        run_expired(&handler, &message(&item), &store).await.unwrap();
        assert_eq!(store.count("delete"), 0);
    }
}
