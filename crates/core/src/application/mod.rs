// Application Layer - Runtime, stage engine and pipeline use cases

pub mod disposition;
pub mod ingest;
pub mod runtime;
pub mod stage;
pub mod stages;
pub mod supervisor;

// Re-exports
pub use disposition::{Disposition, DispositionPolicy};
pub use ingest::{IngestRequest, IngestService};
pub use runtime::{
    Service, ServiceContext, ServiceRuntime, ServiceState, ShutdownToken, StopRequested,
};
pub use stage::{DequeueStage, MessageHandler, ProcessContext};
pub use stages::{build_pipeline, PipelineDeps, QueuePaths};
pub use supervisor::{InferenceClientFactory, PipelineSupervisor};
