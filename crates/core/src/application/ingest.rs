// Ingest Use Case - hand a received association to the pipeline

use crate::domain::{DomainError, QueueMessage, QueuePath, ReceiveQueueItem};
use crate::error::Result;
use crate::port::{enqueue_committed, IdProvider, QueueStore, TimeProvider};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Longest AE title accepted on an association
pub const MAX_AE_TITLE_LEN: usize = 16;

/// A completed association reported by the protocol layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub association_folder: PathBuf,
    pub calling_ae: String,
    pub called_ae: String,
}

fn validate_ae_title(field: &str, value: &str) -> std::result::Result<(), DomainError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DomainError::ValidationError(format!("{} is empty", field)));
    }
    if trimmed.len() > MAX_AE_TITLE_LEN {
        return Err(DomainError::ValidationError(format!(
            "{} longer than {} characters",
            field, MAX_AE_TITLE_LEN
        )));
    }
    if trimmed.chars().any(|c| c == '\\' || c.is_control()) {
        return Err(DomainError::ValidationError(format!(
            "{} contains a backslash or control character",
            field
        )));
    }
    Ok(())
}

impl IngestRequest {
    pub fn validate(&self) -> std::result::Result<(), DomainError> {
        if self.association_folder.as_os_str().is_empty() {
            return Err(DomainError::ValidationError(
                "association folder is empty".to_string(),
            ));
        }
        validate_ae_title("calling AE title", &self.calling_ae)?;
        validate_ae_title("called AE title", &self.called_ae)
    }
}

/// Starts a new correlation on the receive queue
pub struct IngestService {
    queue_store: Arc<dyn QueueStore>,
    id_provider: Arc<dyn IdProvider>,
    time_provider: Arc<dyn TimeProvider>,
    receive_queue: QueuePath,
}

impl IngestService {
    pub fn new(
        queue_store: Arc<dyn QueueStore>,
        id_provider: Arc<dyn IdProvider>,
        time_provider: Arc<dyn TimeProvider>,
        receive_queue: impl Into<QueuePath>,
    ) -> Self {
        Self {
            queue_store,
            id_provider,
            time_provider,
            receive_queue: receive_queue.into(),
        }
    }

    /// Validate and commit the association onto the receive queue
    ///
    /// Returns the new correlation id.
    pub async fn submit(&self, req: IngestRequest) -> Result<String> {
        req.validate()?;

        let correlation_id = self.id_provider.generate_id();
        let created_at = self.time_provider.now_millis();
        let item = ReceiveQueueItem {
            association_folder: req.association_folder,
            calling_ae: req.calling_ae.trim().to_string(),
            called_ae: req.called_ae.trim().to_string(),
        };
        let message = QueueMessage::new(correlation_id.clone(), created_at, &item)?;

        enqueue_committed(self.queue_store.as_ref(), &self.receive_queue, &message).await?;

        info!(
            correlation_id = %correlation_id,
            called_ae = %item.called_ae,
            folder = %item.association_folder.display(),
            "Association submitted"
        );
        Ok(correlation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::port::id_provider::mocks::SequentialIdProvider;
    use crate::port::queue_store::mocks::InMemoryQueueStore;
    use crate::port::time_provider::mocks::ManualTimeProvider;

    fn service(store: &InMemoryQueueStore) -> IngestService {
        IngestService::new(
            Arc::new(store.clone()),
            Arc::new(SequentialIdProvider::default()),
            Arc::new(ManualTimeProvider::new(42_000)),
            "receive",
        )
    }

    fn request(called_ae: &str) -> IngestRequest {
        IngestRequest {
            association_folder: PathBuf::from("/in/assoc-1"),
            calling_ae: "SCANNER".to_string(),
            called_ae: called_ae.to_string(),
        }
    }

    #[tokio::test]
    async fn test_submit_commits_receive_item() {
        let store = InMemoryQueueStore::new();
        let service = service(&store);

        let first = service.submit(request(" RTSEG ")).await.unwrap();
        let second = service.submit(request("RTSEG")).await.unwrap();
        assert_eq!(first, "corr-1");
        assert_eq!(second, "corr-2");

        let queued = store.snapshot("receive");
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].created_at, 42_000);
        assert_eq!(queued[0].dequeue_count, 0);
        let item: ReceiveQueueItem = queued[0].decode().unwrap();
        assert_eq!(item.called_ae, "RTSEG");
    }

    #[tokio::test]
    async fn test_invalid_requests_rejected() {
        let store = InMemoryQueueStore::new();
        let service = service(&store);

        for called_ae in ["", "   ", "THIS_TITLE_IS_TOO_LONG", "BAD\\AE"] {
            let err = service.submit(request(called_ae)).await.unwrap_err();
            assert!(matches!(err, AppError::Domain(DomainError::ValidationError(_))));
        }

        let mut no_folder = request("RTSEG");
        no_folder.association_folder = PathBuf::new();
        assert!(service.submit(no_folder).await.is_err());

        assert_eq!(store.count("receive"), 0);
    }

    #[tokio::test]
    async fn test_begin_failure_propagates() {
        let store = InMemoryQueueStore::new();
        store.fail_next_begins(1);

        let err = service(&store).submit(request("RTSEG")).await.unwrap_err();
        assert!(matches!(err, AppError::Queue(_)));
        assert_eq!(store.count("receive"), 0);
    }
}
