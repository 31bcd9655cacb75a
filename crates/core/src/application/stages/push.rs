// Push stage: deliver result files to their destination

use super::enqueue_cleanup;
use crate::application::stage::{MessageHandler, ProcessContext};
use crate::domain::{DeleteQueueItem, PushQueueItem, QueueMessage, QueuePath};
use crate::error::Result;
use crate::port::{ArtifactError, ArtifactStore, ResultSender};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct PushHandler {
    artifacts: Arc<dyn ArtifactStore>,
    sender: Arc<dyn ResultSender>,
    delete_queue: QueuePath,
}

impl PushHandler {
    pub fn new(
        artifacts: Arc<dyn ArtifactStore>,
        sender: Arc<dyn ResultSender>,
        delete_queue: QueuePath,
    ) -> Self {
        Self {
            artifacts,
            sender,
            delete_queue,
        }
    }
}

#[async_trait]
impl MessageHandler for PushHandler {
    async fn handle(&self, message: &QueueMessage, ctx: &mut ProcessContext<'_>) -> Result<()> {
        let item: PushQueueItem = message.decode()?;

        let files = self.artifacts.list_files(&item.result_folder).await?;
        if files.is_empty() {
            return Err(ArtifactError::EmptyFolder(item.result_folder.display().to_string()).into());
        }

        ctx.ensure_running()?;
        let shutdown = ctx.shutdown().clone();
        shutdown
            .cancellable(self.sender.send(&item.destination, &files))
            .await??;

        info!(
            correlation_id = %message.correlation_id,
            destination = %item.destination,
            files = files.len(),
            "Result delivered"
        );

        let cleanup = DeleteQueueItem::new([item.association_folder, item.result_folder]);
        ctx.forward(&self.delete_queue, message, &cleanup).await
    }

    async fn on_expired(&self, message: &QueueMessage, ctx: &mut ProcessContext<'_>) -> Result<()> {
        enqueue_cleanup(ctx, &self.delete_queue, message, |item: PushQueueItem| {
            vec![item.association_folder, item.result_folder]
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::stages::test_support::{context, message, run_expired, run_handle};
    use crate::error::AppError;
    use crate::port::artifact_store::mocks::InMemoryArtifactStore;
    use crate::port::queue_store::mocks::InMemoryQueueStore;
    use crate::port::result_sender::mocks::RecordingResultSender;
    use crate::port::SendError;
    use std::path::PathBuf;

    fn item() -> PushQueueItem {
        PushQueueItem {
            association_folder: PathBuf::from("/in/assoc-1"),
            result_folder: PathBuf::from("/results/corr-1"),
            destination: "PACS".to_string(),
        }
    }

    fn setup(sender: RecordingResultSender) -> (PushHandler, Arc<RecordingResultSender>) {
        let artifacts = Arc::new(InMemoryArtifactStore::new());
        artifacts.add_file("/results/corr-1/result.zip", b"segmentation");
        let sender = Arc::new(sender);
        let handler = PushHandler::new(artifacts, sender.clone(), "delete".to_string());
        (handler, sender)
    }

    #[tokio::test]
    async fn test_delivers_and_enqueues_cleanup() {
        let (handler, sender) = setup(RecordingResultSender::new());
        let store = InMemoryQueueStore::new();

        run_handle(&handler, &message(&item()), &store, &context(&store))
            .await
            .unwrap();

        assert_eq!(
            sender.sent(),
            vec![(
                "PACS".to_string(),
                vec![PathBuf::from("/results/corr-1/result.zip")]
            )]
        );
        let delete: DeleteQueueItem = store.snapshot("delete")[0].decode().unwrap();
        assert_eq!(
            delete.paths,
            vec![PathBuf::from("/in/assoc-1"), PathBuf::from("/results/corr-1")]
        );
    }

    #[tokio::test]
    async fn test_unreachable_destination_fails() {
        let (handler, _sender) = setup(RecordingResultSender::failing(1));
        let store = InMemoryQueueStore::new();

        let err = run_handle(&handler, &message(&item()), &store, &context(&store))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Send(SendError::Unreachable(_))));
        assert_eq!(store.count("delete"), 0);
    }

    #[tokio::test]
    async fn test_expiry_deletes_both_folders() {
        let (handler, _sender) = setup(RecordingResultSender::new());
        let store = InMemoryQueueStore::new();

        run_expired(&handler, &message(&item()), &store).await.unwrap();

        let delete: DeleteQueueItem = store.snapshot("delete")[0].decode().unwrap();
        assert_eq!(delete.paths.len(), 2);
    }
}
