// Inference Client Port
// Abstraction over the remote inference service

use crate::domain::InferenceId;
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Inference service errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InferenceError {
    /// Credentials were refused (fatal for the pipeline)
    #[error("Inference service rejected credentials: {0}")]
    Unauthorized(String),

    /// Service answered 503 after every retry
    #[error("Inference service unavailable: {0}")]
    Unavailable(String),

    #[error("Inference request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The service reports the inference itself failed
    #[error("Inference failed: {0}")]
    Failed(String),

    #[error("Inference transport error: {0}")]
    Transport(String),

    #[error("No inference service configured")]
    NotConfigured,
}

impl InferenceError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, InferenceError::Unauthorized(_))
    }
}

/// State of a started inference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InferenceStatus {
    Running,
    Completed(Vec<u8>),
    Failed(String),
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Liveness and credential check
    async fn ping(&self) -> Result<(), InferenceError>;

    /// Submit a packed association to `model_id`
    async fn start_inference(
        &self,
        model_id: &str,
        archive: Vec<u8>,
    ) -> Result<InferenceId, InferenceError>;

    /// Poll a started inference
    async fn get_result(&self, inference_id: &str) -> Result<InferenceStatus, InferenceError>;
}

/// Client used while no inference service is configured
pub struct UnconfiguredInferenceClient;

#[async_trait]
impl InferenceClient for UnconfiguredInferenceClient {
    async fn ping(&self) -> Result<(), InferenceError> {
        Err(InferenceError::NotConfigured)
    }

    async fn start_inference(
        &self,
        _model_id: &str,
        _archive: Vec<u8>,
    ) -> Result<InferenceId, InferenceError> {
        Err(InferenceError::NotConfigured)
    }

    async fn get_result(&self, _inference_id: &str) -> Result<InferenceStatus, InferenceError> {
        Err(InferenceError::NotConfigured)
    }
}

/// Swappable client shared by the upload and download stages.
///
/// The supervisor replaces the inner client while stages are stopped.
#[derive(Clone)]
pub struct SharedInferenceClient {
    inner: Arc<RwLock<Arc<dyn InferenceClient>>>,
}

impl SharedInferenceClient {
    pub fn new(client: Arc<dyn InferenceClient>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(client)),
        }
    }

    pub fn unconfigured() -> Self {
        Self::new(Arc::new(UnconfiguredInferenceClient))
    }

    /// Current client
    pub fn get(&self) -> Arc<dyn InferenceClient> {
        Arc::clone(&self.inner.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn replace(&self, client: Arc<dyn InferenceClient>) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = client;
    }
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Mock start behaviour
    #[derive(Debug, Clone)]
    pub enum StartBehavior {
        /// Return an inference id derived from the call number
        Succeed,
        /// Fail with the given error
        Fail(InferenceError),
        /// Never return (for shutdown-bound testing)
        Hang,
    }

    /// Scripted inference client
    pub struct ScriptedInferenceClient {
        ping: Mutex<Result<(), InferenceError>>,
        start: Mutex<StartBehavior>,
        results: Mutex<VecDeque<InferenceStatus>>,
        start_calls: AtomicUsize,
        result_calls: AtomicUsize,
        ping_calls: AtomicUsize,
    }

    impl ScriptedInferenceClient {
        pub fn new() -> Self {
            Self {
                ping: Mutex::new(Ok(())),
                start: Mutex::new(StartBehavior::Succeed),
                results: Mutex::new(VecDeque::new()),
                start_calls: AtomicUsize::new(0),
                result_calls: AtomicUsize::new(0),
                ping_calls: AtomicUsize::new(0),
            }
        }

        pub fn with_ping(self, result: Result<(), InferenceError>) -> Self {
            *self.ping.lock().unwrap_or_else(|e| e.into_inner()) = result;
            self
        }

        pub fn with_start(self, behavior: StartBehavior) -> Self {
            *self.start.lock().unwrap_or_else(|e| e.into_inner()) = behavior;
            self
        }

        /// Statuses returned by successive get_result calls; once exhausted,
        /// every call reports Completed(b"result")
        pub fn with_results(self, results: impl IntoIterator<Item = InferenceStatus>) -> Self {
            *self.results.lock().unwrap_or_else(|e| e.into_inner()) =
                results.into_iter().collect();
            self
        }

        pub fn start_calls(&self) -> usize {
            self.start_calls.load(Ordering::SeqCst)
        }

        pub fn result_calls(&self) -> usize {
            self.result_calls.load(Ordering::SeqCst)
        }

        pub fn ping_calls(&self) -> usize {
            self.ping_calls.load(Ordering::SeqCst)
        }
    }

    impl Default for ScriptedInferenceClient {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl InferenceClient for ScriptedInferenceClient {
        async fn ping(&self) -> Result<(), InferenceError> {
            self.ping_calls.fetch_add(1, Ordering::SeqCst);
            self.ping.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }

        async fn start_inference(
            &self,
            model_id: &str,
            _archive: Vec<u8>,
        ) -> Result<InferenceId, InferenceError> {
            let n = self.start_calls.fetch_add(1, Ordering::SeqCst) + 1;
            let behavior = self.start.lock().unwrap_or_else(|e| e.into_inner()).clone();
            match behavior {
                StartBehavior::Succeed => Ok(format!("{}-inference-{}", model_id, n)),
                StartBehavior::Fail(err) => Err(err),
                StartBehavior::Hang => std::future::pending().await,
            }
        }

        async fn get_result(&self, _inference_id: &str) -> Result<InferenceStatus, InferenceError> {
            self.result_calls.fetch_add(1, Ordering::SeqCst);
            let next = self
                .results
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front();
            Ok(next.unwrap_or_else(|| InferenceStatus::Completed(b"result".to_vec())))
        }
    }
}
