// Receive stage: route a received association to a model

use super::enqueue_cleanup;
use crate::application::stage::{MessageHandler, ProcessContext};
use crate::domain::{
    DeleteQueueItem, QueueMessage, QueuePath, ReceiveConfig, ReceiveQueueItem, UploadQueueItem,
};
use crate::error::Result;
use crate::port::{ArtifactError, ArtifactStore};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ReceiveHandler {
    artifacts: Arc<dyn ArtifactStore>,
    routes: ReceiveConfig,
    upload_queue: QueuePath,
    delete_queue: QueuePath,
}

impl ReceiveHandler {
    pub fn new(
        artifacts: Arc<dyn ArtifactStore>,
        routes: ReceiveConfig,
        upload_queue: QueuePath,
        delete_queue: QueuePath,
    ) -> Self {
        Self {
            artifacts,
            routes,
            upload_queue,
            delete_queue,
        }
    }
}

#[async_trait]
impl MessageHandler for ReceiveHandler {
    async fn handle(&self, message: &QueueMessage, ctx: &mut ProcessContext<'_>) -> Result<()> {
        let item: ReceiveQueueItem = message.decode()?;

        let files = self.artifacts.list_files(&item.association_folder).await?;
        if files.is_empty() {
            return Err(
                ArtifactError::EmptyFolder(item.association_folder.display().to_string()).into(),
            );
        }

        let Some((model_id, destination)) = self.routes.route(&item.called_ae) else {
            warn!(
                correlation_id = %message.correlation_id,
                called_ae = %item.called_ae,
                calling_ae = %item.calling_ae,
                "No model configured for called AE title, discarding association"
            );
            let cleanup = DeleteQueueItem::new([item.association_folder]);
            return ctx.forward(&self.delete_queue, message, &cleanup).await;
        };

        info!(
            correlation_id = %message.correlation_id,
            model_id = %model_id,
            files = files.len(),
            "Association received"
        );

        let upload = UploadQueueItem {
            association_folder: item.association_folder,
            calling_ae: item.calling_ae,
            called_ae: item.called_ae,
            model_id,
            destination,
        };
        ctx.forward(&self.upload_queue, message, &upload).await
    }

    async fn on_expired(&self, message: &QueueMessage, ctx: &mut ProcessContext<'_>) -> Result<()> {
        enqueue_cleanup(ctx, &self.delete_queue, message, |item: ReceiveQueueItem| {
            vec![item.association_folder]
        })
        .await
    }
}
