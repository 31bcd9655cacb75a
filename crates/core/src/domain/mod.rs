// Domain Layer - Pure data model of the relay

pub mod config;
pub mod error;
pub mod items;
pub mod queue;

// Re-exports
pub use config::{
    DownloadConfig, GatewayConfig, InferenceConfig, ReceiveConfig, ReceiveRoute, StageConfig,
    StorageConfig, SupervisorConfig,
};
pub use error::DomainError;
pub use items::{
    DeleteQueueItem, DownloadQueueItem, InferenceId, ModelId, PushQueueItem, ReceiveQueueItem,
    UploadQueueItem,
};
pub use queue::{dead_letter_path, CorrelationId, QueueMessage, QueuePath, DEAD_LETTER_SUFFIX};
