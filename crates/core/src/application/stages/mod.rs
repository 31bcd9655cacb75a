// Concrete pipeline stages: receive -> upload -> download -> push -> delete

pub mod delete;
pub mod download;
pub mod push;
pub mod receive;
pub mod upload;

pub use delete::DeleteHandler;
pub use download::DownloadHandler;
pub use push::PushHandler;
pub use receive::ReceiveHandler;
pub use upload::UploadHandler;

use crate::application::runtime::ServiceRuntime;
use crate::application::stage::{DequeueStage, ProcessContext};
use crate::domain::{DeleteQueueItem, GatewayConfig, QueueMessage, QueuePath};
use crate::error::Result;
use crate::port::{ArtifactStore, QueueStore, ResultSender, SharedInferenceClient, TimeProvider};
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

pub const RECEIVE_QUEUE: &str = "gateway_receive";
pub const UPLOAD_QUEUE: &str = "gateway_upload";
pub const DOWNLOAD_QUEUE: &str = "gateway_download";
pub const PUSH_QUEUE: &str = "gateway_push";
pub const DELETE_QUEUE: &str = "gateway_delete";

/// Primary queue path of every stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePaths {
    pub receive: QueuePath,
    pub upload: QueuePath,
    pub download: QueuePath,
    pub push: QueuePath,
    pub delete: QueuePath,
}

impl Default for QueuePaths {
    fn default() -> Self {
        Self {
            receive: RECEIVE_QUEUE.to_string(),
            upload: UPLOAD_QUEUE.to_string(),
            download: DOWNLOAD_QUEUE.to_string(),
            push: PUSH_QUEUE.to_string(),
            delete: DELETE_QUEUE.to_string(),
        }
    }
}

/// Collaborators shared by the pipeline stages
#[derive(Clone)]
pub struct PipelineDeps {
    pub queue_store: Arc<dyn QueueStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub inference: SharedInferenceClient,
    pub sender: Arc<dyn ResultSender>,
    pub time_provider: Arc<dyn TimeProvider>,
}

/// Build every stage runtime, in pipeline order
pub fn build_pipeline(
    config: &GatewayConfig,
    paths: &QueuePaths,
    deps: &PipelineDeps,
) -> Vec<Arc<ServiceRuntime>> {
    let receive = ReceiveHandler::new(
        Arc::clone(&deps.artifacts),
        config.receive.clone(),
        paths.upload.clone(),
        paths.delete.clone(),
    );
    let upload = UploadHandler::new(
        Arc::clone(&deps.artifacts),
        deps.inference.clone(),
        paths.download.clone(),
        paths.delete.clone(),
    );
    let download = DownloadHandler::new(
        Arc::clone(&deps.artifacts),
        deps.inference.clone(),
        config.storage.results_root.clone(),
        config.download.clone(),
        paths.push.clone(),
        paths.delete.clone(),
    );
    let push = PushHandler::new(
        Arc::clone(&deps.artifacts),
        Arc::clone(&deps.sender),
        paths.delete.clone(),
    );
    let delete = DeleteHandler::new(Arc::clone(&deps.artifacts));

    let stages = [
        DequeueStage::new(
            "receive",
            paths.receive.clone(),
            config.receive_stage.clone(),
            Arc::new(receive),
            Arc::clone(&deps.time_provider),
        ),
        DequeueStage::new(
            "upload",
            paths.upload.clone(),
            config.upload_stage.clone(),
            Arc::new(upload),
            Arc::clone(&deps.time_provider),
        ),
        DequeueStage::new(
            "download",
            paths.download.clone(),
            config.download_stage.clone(),
            Arc::new(download),
            Arc::clone(&deps.time_provider),
        ),
        DequeueStage::new(
            "push",
            paths.push.clone(),
            config.push_stage.clone(),
            Arc::new(push),
            Arc::clone(&deps.time_provider),
        ),
        DequeueStage::new(
            "delete",
            paths.delete.clone(),
            config.delete_stage.clone(),
            Arc::new(delete),
            Arc::clone(&deps.time_provider),
        ),
    ];

    stages
        .into_iter()
        .map(|stage| Arc::new(stage.into_runtime(Arc::clone(&deps.queue_store))))
        .collect()
}

/// Queue deletion of the artifacts an expired message still owns.
///
/// An undecodable payload owns nothing we can find, so it is only logged.
pub(crate) async fn enqueue_cleanup<T, F>(
    ctx: &mut ProcessContext<'_>,
    delete_queue: &str,
    message: &QueueMessage,
    paths: F,
) -> Result<()>
where
    T: DeserializeOwned + Send,
    F: FnOnce(T) -> Vec<PathBuf> + Send,
{
    let item = match message.decode::<T>() {
        Ok(item) => item,
        Err(e) => {
            warn!(
                correlation_id = %message.correlation_id,
                error = %e,
                "Expired message has an undecodable payload, nothing to clean up"
            );
            return Ok(());
        }
    };
    let cleanup = DeleteQueueItem::new(paths(item));
    ctx.forward(delete_queue, message, &cleanup).await
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::application::runtime::ServiceContext;
    use crate::application::stage::{MessageHandler, ProcessContext};
    use crate::domain::QueueMessage;
    use crate::error::Result;
    use crate::port::queue_store::mocks::InMemoryQueueStore;
    use crate::port::QueueStore;
    use serde::Serialize;
    use std::sync::Arc;

    pub(crate) fn message<T: Serialize>(item: &T) -> QueueMessage {
        QueueMessage::new("corr-1", 0, item).unwrap()
    }

    pub(crate) fn context(store: &InMemoryQueueStore) -> ServiceContext {
        ServiceContext::detached("test", Arc::new(store.clone()))
    }

    /// Run `handle` in a transaction that commits on success and aborts on error
    pub(crate) async fn run_handle(
        handler: &dyn MessageHandler,
        message: &QueueMessage,
        store: &InMemoryQueueStore,
        ctx: &ServiceContext,
    ) -> Result<()> {
        let mut tx = store.begin_transaction().await.unwrap();
        let result = {
            let mut pctx = ProcessContext::new(tx.as_mut(), ctx);
            handler.handle(message, &mut pctx).await
        };
        match result {
            Ok(()) => tx.commit().await.unwrap(),
            Err(_) => tx.abort().await.unwrap(),
        }
        result
    }

    /// Run `on_expired` and commit whatever it enqueued
    pub(crate) async fn run_expired(
        handler: &dyn MessageHandler,
        message: &QueueMessage,
        store: &InMemoryQueueStore,
    ) -> Result<()> {
        let ctx = context(store);
        let mut tx = store.begin_transaction().await.unwrap();
        let result = {
            let mut pctx = ProcessContext::new(tx.as_mut(), &ctx);
            handler.on_expired(message, &mut pctx).await
        };
        tx.commit().await.unwrap();
        result
    }
}
