// Port Layer - Interfaces for external dependencies

pub mod artifact_store;
pub mod config_provider;
pub mod id_provider; // For deterministic testing
pub mod inference_client;
pub mod queue_store;
pub mod result_sender;
pub mod time_provider;

// Re-exports
pub use artifact_store::{ArtifactError, ArtifactStore};
pub use config_provider::ConfigProvider;
pub use id_provider::IdProvider;
pub use inference_client::{
    InferenceClient, InferenceError, InferenceStatus, SharedInferenceClient,
    UnconfiguredInferenceClient,
};
pub use queue_store::{
    enqueue_committed, Dequeued, QueueError, QueueHandle, QueueStore, QueueTransaction,
};
pub use result_sender::{ResultSender, SendError};
pub use time_provider::TimeProvider;
