// Gateway Infrastructure - System Adapters
// Implements: ArtifactStore (filesystem), ResultSender (directory delivery)

pub mod artifact_store;
pub mod result_sender;

pub use artifact_store::FsArtifactStore;
pub use result_sender::DirectoryResultSender;
