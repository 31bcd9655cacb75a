// Upload stage: pack an association and start inference on it

use super::enqueue_cleanup;
use crate::application::stage::{MessageHandler, ProcessContext};
use crate::domain::{DownloadQueueItem, QueueMessage, QueuePath, UploadQueueItem};
use crate::error::Result;
use crate::port::{ArtifactStore, SharedInferenceClient};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct UploadHandler {
    artifacts: Arc<dyn ArtifactStore>,
    inference: SharedInferenceClient,
    download_queue: QueuePath,
    delete_queue: QueuePath,
}

impl UploadHandler {
    pub fn new(
        artifacts: Arc<dyn ArtifactStore>,
        inference: SharedInferenceClient,
        download_queue: QueuePath,
        delete_queue: QueuePath,
    ) -> Self {
        Self {
            artifacts,
            inference,
            download_queue,
            delete_queue,
        }
    }
}

#[async_trait]
impl MessageHandler for UploadHandler {
    async fn handle(&self, message: &QueueMessage, ctx: &mut ProcessContext<'_>) -> Result<()> {
        let item: UploadQueueItem = message.decode()?;
        let archive = self.artifacts.pack_folder(&item.association_folder).await?;

        ctx.ensure_running()?;
        let client = self.inference.get();
        let shutdown = ctx.shutdown().clone();
        let inference_id = shutdown
            .cancellable(client.start_inference(&item.model_id, archive))
            .await??;
        ctx.ensure_running()?;

        info!(
            correlation_id = %message.correlation_id,
            model_id = %item.model_id,
            inference_id = %inference_id,
            "Inference started"
        );

        let download = DownloadQueueItem {
            association_folder: item.association_folder,
            inference_id,
            calling_ae: item.calling_ae,
            called_ae: item.called_ae,
            destination: item.destination,
        };
        ctx.forward(&self.download_queue, message, &download).await
    }

    async fn on_expired(&self, message: &QueueMessage, ctx: &mut ProcessContext<'_>) -> Result<()> {
        enqueue_cleanup(ctx, &self.delete_queue, message, |item: UploadQueueItem| {
            vec![item.association_folder]
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::stages::test_support::{context, message, run_expired, run_handle};
    use crate::domain::DeleteQueueItem;
    use crate::error::AppError;
    use crate::port::artifact_store::mocks::InMemoryArtifactStore;
    use crate::port::inference_client::mocks::{ScriptedInferenceClient, StartBehavior};
    use crate::port::queue_store::mocks::InMemoryQueueStore;
    use crate::port::InferenceError;
    use std::path::PathBuf;
    use std::time::Duration;

    fn item() -> UploadQueueItem {
        UploadQueueItem {
            association_folder: PathBuf::from("/in/assoc-1"),
            calling_ae: "SCANNER".to_string(),
            called_ae: "RTSEG".to_string(),
            model_id: "prostate:1".to_string(),
            destination: "PACS".to_string(),
        }
    }

    fn setup(client: ScriptedInferenceClient) -> (UploadHandler, Arc<ScriptedInferenceClient>) {
        let artifacts = Arc::new(InMemoryArtifactStore::new());
        artifacts.add_file("/in/assoc-1/1.dcm", b"dicom");
        let client = Arc::new(client);
        let handler = UploadHandler::new(
            artifacts,
            SharedInferenceClient::new(client.clone()),
            "download".to_string(),
            "delete".to_string(),
        );
        (handler, client)
    }

    #[tokio::test]
    async fn test_started_inference_enqueues_download() {
        let (handler, client) = setup(ScriptedInferenceClient::new());
        let store = InMemoryQueueStore::new();

        run_handle(&handler, &message(&item()), &store, &context(&store))
            .await
            .unwrap();

        assert_eq!(client.start_calls(), 1);
        let download: DownloadQueueItem = store.snapshot("download")[0].decode().unwrap();
        assert_eq!(download.inference_id, "prostate:1-inference-1");
        assert_eq!(download.destination, "PACS");
    }

    #[tokio::test]
    async fn test_rejected_start_fails_without_enqueue() {
        let (handler, _client) = setup(ScriptedInferenceClient::new().with_start(
            StartBehavior::Fail(InferenceError::Unavailable("503".to_string())),
        ));
        let store = InMemoryQueueStore::new();

        let err = run_handle(&handler, &message(&item()), &store, &context(&store))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Inference(InferenceError::Unavailable(_))));
        assert_eq!(store.count("download"), 0);
    }

    #[tokio::test]
    async fn test_hanging_start_is_cancelled_by_shutdown() {
        let (handler, _client) = setup(ScriptedInferenceClient::new().with_start(StartBehavior::Hang));
        let store = InMemoryQueueStore::new();
        let ctx = context(&store);

        let stopper = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.request_stop();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            run_handle(&handler, &message(&item()), &store, &ctx),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
    }

    #[tokio::test]
    async fn test_expiry_deletes_association() {
        let (handler, _client) = setup(ScriptedInferenceClient::new());
        let store = InMemoryQueueStore::new();

        run_expired(&handler, &message(&item()), &store).await.unwrap();

        let delete: DeleteQueueItem = store.snapshot("delete")[0].decode().unwrap();
        assert_eq!(delete.paths, vec![PathBuf::from("/in/assoc-1")]);
    }
}
