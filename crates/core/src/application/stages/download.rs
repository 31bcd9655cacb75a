// Download stage: poll a started inference and store its result

use super::enqueue_cleanup;
use crate::application::runtime::ShutdownToken;
use crate::application::stage::{MessageHandler, ProcessContext};
use crate::domain::{DownloadConfig, DownloadQueueItem, PushQueueItem, QueueMessage, QueuePath};
use crate::error::{AppError, Result};
use crate::port::{ArtifactStore, InferenceError, InferenceStatus, SharedInferenceClient};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

/// File name of a downloaded result inside its result folder
pub const RESULT_FILE_NAME: &str = "result.zip";

pub struct DownloadHandler {
    artifacts: Arc<dyn ArtifactStore>,
    inference: SharedInferenceClient,
    results_root: PathBuf,
    config: DownloadConfig,
    push_queue: QueuePath,
    delete_queue: QueuePath,
}

impl DownloadHandler {
    pub fn new(
        artifacts: Arc<dyn ArtifactStore>,
        inference: SharedInferenceClient,
        results_root: PathBuf,
        config: DownloadConfig,
        push_queue: QueuePath,
        delete_queue: QueuePath,
    ) -> Self {
        Self {
            artifacts,
            inference,
            results_root,
            config,
            push_queue,
            delete_queue,
        }
    }

    fn result_folder(results_root: &Path, correlation_id: &str) -> PathBuf {
        results_root.join(correlation_id)
    }

    /// Poll until the inference completes, fails or the download timeout elapses
    async fn wait_for_result(
        &self,
        inference_id: &str,
        shutdown: &ShutdownToken,
    ) -> Result<Vec<u8>> {
        // None when the timeout is too large to represent: poll without a deadline
        let deadline = Instant::now().checked_add(self.config.timeout());
        let client = self.inference.get();

        loop {
            shutdown.ensure_running()?;
            let status = shutdown.cancellable(client.get_result(inference_id)).await??;

            match status {
                InferenceStatus::Completed(bytes) => return Ok(bytes),
                InferenceStatus::Failed(reason) => {
                    return Err(InferenceError::Failed(reason).into());
                }
                InferenceStatus::Running => {
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        return Err(AppError::Timeout(format!(
                            "inference {} still running after {}s",
                            inference_id, self.config.timeout_secs
                        )));
                    }
                    debug!(inference_id = %inference_id, "Inference still running");
                    shutdown.sleep(self.config.poll_interval()).await?;
                }
            }
        }
    }
}

#[async_trait]
impl MessageHandler for DownloadHandler {
    async fn handle(&self, message: &QueueMessage, ctx: &mut ProcessContext<'_>) -> Result<()> {
        let item: DownloadQueueItem = message.decode()?;

        let shutdown = ctx.shutdown().clone();
        let bytes = self.wait_for_result(&item.inference_id, &shutdown).await?;
        ctx.ensure_running()?;

        let result_folder = Self::result_folder(&self.results_root, &message.correlation_id);
        let path = self
            .artifacts
            .write_file(&result_folder, RESULT_FILE_NAME, &bytes)
            .await?;

        info!(
            correlation_id = %message.correlation_id,
            inference_id = %item.inference_id,
            bytes = bytes.len(),
            path = %path.display(),
            "Inference result downloaded"
        );

        let push = PushQueueItem {
            association_folder: item.association_folder,
            result_folder,
            destination: item.destination,
        };
        ctx.forward(&self.push_queue, message, &push).await
    }

    async fn on_expired(&self, message: &QueueMessage, ctx: &mut ProcessContext<'_>) -> Result<()> {
        let result_folder = Self::result_folder(&self.results_root, &message.correlation_id);
        enqueue_cleanup(ctx, &self.delete_queue, message, |item: DownloadQueueItem| {
            vec![item.association_folder, result_folder]
        })
        .await
    }
}
