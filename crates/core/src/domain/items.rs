// Stage payloads carried inside QueueMessage envelopes

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Inference job identifier returned by the remote service
pub type InferenceId = String;

/// Model identifier understood by the remote service
pub type ModelId = String;

/// A completed association handed over by the protocol layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveQueueItem {
    pub association_folder: PathBuf,
    pub calling_ae: String,
    pub called_ae: String,
}

/// An association routed to a model and waiting to be sent for inference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadQueueItem {
    pub association_folder: PathBuf,
    pub calling_ae: String,
    pub called_ae: String,
    pub model_id: ModelId,
    pub destination: String,
}

/// An inference started on the remote service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadQueueItem {
    pub association_folder: PathBuf,
    pub inference_id: InferenceId,
    pub calling_ae: String,
    pub called_ae: String,
    pub destination: String,
}

/// A result written locally and waiting to be delivered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushQueueItem {
    pub association_folder: PathBuf,
    pub result_folder: PathBuf,
    pub destination: String,
}

/// Filesystem artifacts to remove
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteQueueItem {
    pub paths: Vec<PathBuf>,
}

impl DeleteQueueItem {
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            paths: paths.into_iter().collect(),
        }
    }
}
